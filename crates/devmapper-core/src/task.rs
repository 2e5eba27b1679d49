//! Contract for the kernel-facing task layer.
//!
//! A task wraps one device-mapper ioctl (or an equivalent transport such as the
//! `dmsetup` binary). [`DeviceMapper`](crate::DeviceMapper) only ever talks to the
//! kernel through these traits, so tests can substitute a deterministic fake.

use crate::secure::SecureBytes;
use std::error::Error;
use std::fmt;

/// Longest device name the kernel accepts (`DM_NAME_LEN` minus the NUL).
pub const MAX_DEVICE_NAME_LEN: usize = 127;

/// Kind of device-mapper operation a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmOp {
    /// Create a device and load its initial table.
    Create,
    /// Remove a device node.
    Remove,
    /// Query the live table.
    Table,
    /// Load a replacement table.
    Reload,
}

impl fmt::Display for DmOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DmOp::Create => "create",
            DmOp::Remove => "remove",
            DmOp::Table => "table",
            DmOp::Reload => "reload",
        })
    }
}

/// Individual call made against a task, used to report where a sequence failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStep {
    Create,
    SetName,
    AddTarget,
    Run,
    NextTarget,
}

impl fmt::Display for TaskStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskStep::Create => "task creation",
            TaskStep::SetName => "set_name",
            TaskStep::AddTarget => "add_target",
            TaskStep::Run => "run",
            TaskStep::NextTarget => "next_target",
        })
    }
}

/// One target row as reported by a table query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRow {
    pub start: u64,
    pub size: u64,
    pub target_type: String,
    pub parameters: SecureBytes,
}

/// A single device-mapper request.
///
/// Callers name the device, optionally add target rows, run the request and,
/// for table queries, drain the returned rows with [`next_target`].
///
/// [`next_target`]: DevmapperTask::next_target
pub trait DevmapperTask {
    type Error: Error + Send + Sync + 'static;

    /// Select the device this task operates on.
    fn set_name(&mut self, name: &str) -> Result<(), Self::Error>;

    /// Append a target row to the table this task will load.
    fn add_target(
        &mut self,
        start: u64,
        size: u64,
        target_type: &str,
        parameters: &[u8],
    ) -> Result<(), Self::Error>;

    /// Submit the request. With `udev_sync` set, block until udev has finished
    /// creating or removing the `/dev` node.
    fn run(&mut self, udev_sync: bool) -> Result<(), Self::Error>;

    /// Return the next row of a queried table, or `None` once exhausted.
    fn next_target(&mut self) -> Result<Option<TargetRow>, Self::Error>;
}

/// Constructs a fresh task for each operation.
pub trait DevmapperTaskFactory {
    type Task: DevmapperTask;

    fn create_task(&self, op: DmOp) -> Result<Self::Task, <Self::Task as DevmapperTask>::Error>;
}
