#![forbid(unsafe_code)]

//! Device-mapper task transport built on the host `dmsetup` binary.
//!
//! Plugs into [`devmapper_core::DeviceMapper`] as its task factory:
//! - `create`/`reload` receive the table on stdin
//! - `remove` waits for udev unless configured otherwise
//! - `table --showkeys` output is parsed back into rows in zeroizing memory

mod command;
mod system;

pub use system::{DmsetupTask, DmsetupTaskFactory, DEFAULT_DMSETUP_PATHS};
