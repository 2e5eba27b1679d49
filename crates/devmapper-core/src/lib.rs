//! Device-mapper table management.
//!
//! [`DevmapperTable`] models one target row and its kernel wire format,
//! including dm-crypt parameter assembly and key extraction. [`DeviceMapper`]
//! drives create/remove/query/wipe sequences through a pluggable
//! [`DevmapperTaskFactory`], which is the only boundary to the kernel.

pub mod config;
pub mod error;
pub mod logging;
pub mod mapper;
pub mod secure;
pub mod table;
pub mod task;

pub use config::{ConfigFormat, CryptCfg, DevmapperConfig, DmsetupCfg};
pub use error::{CryptKeyError, DevmapperError, DevmapperResult, TableParseError};
pub use mapper::DeviceMapper;
pub use secure::SecureBytes;
pub use table::{CryptSpec, DevmapperTable, DEFAULT_CRYPT_CIPHER, MAX_TARGET_TYPE_LEN, SECTOR_SIZE};
pub use task::{
    DevmapperTask, DevmapperTaskFactory, DmOp, TargetRow, TaskStep, MAX_DEVICE_NAME_LEN,
};
