//! Device lifecycle built from sequences of device-mapper tasks.
//!
//! `DeviceMapper` keeps no per-device state: every call issues fresh tasks and
//! the kernel table stays the only source of truth. Calls against different
//! device names may run concurrently; callers serialise calls that target the
//! same name.

use crate::error::{DevmapperError, DevmapperResult};
use crate::secure::SecureBytes;
use crate::table::{CryptSpec, DevmapperTable};
use crate::task::{DevmapperTask, DevmapperTaskFactory, DmOp, TaskStep};
use log::{error, info};
use std::error::Error;

const ERROR_TARGET: &str = "error";

/// Drives [`DevmapperTask`]s produced by an injected factory.
#[derive(Debug, Clone)]
pub struct DeviceMapper<F> {
    factory: F,
}

impl<F> DeviceMapper<F>
where
    F: DevmapperTaskFactory,
{
    pub fn new(factory: F) -> Self {
        Self { factory }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Create device `name` with `table` as its only target and wait for udev
    /// to publish the `/dev` node.
    ///
    /// A failure after the create task has run partway may leave kernel state
    /// behind; [`remove`](Self::remove) cleans it up.
    pub fn setup(&self, name: &str, table: &DevmapperTable) -> DevmapperResult<()> {
        let op = DmOp::Create;
        let mut task = self.named_task(op, name)?;
        checked(
            op,
            TaskStep::AddTarget,
            name,
            task.add_target(
                table.start(),
                table.size(),
                table.target_type(),
                table.parameters(),
            ),
        )?;
        checked(op, TaskStep::Run, name, task.run(true))?;
        info!(
            "device-mapper device `{name}` created ({} target, {} sectors)",
            table.target_type(),
            table.size()
        );
        Ok(())
    }

    /// Remove device `name` and wait for udev to drop the `/dev` node.
    pub fn remove(&self, name: &str) -> DevmapperResult<()> {
        let op = DmOp::Remove;
        let mut task = self.named_task(op, name)?;
        checked(op, TaskStep::Run, name, task.run(true))?;
        info!("device-mapper device `{name}` removed");
        Ok(())
    }

    /// Fetch the first target row of `name`'s live table.
    pub fn get_table(&self, name: &str) -> DevmapperResult<DevmapperTable> {
        let op = DmOp::Table;
        let mut task = self.named_task(op, name)?;
        checked(op, TaskStep::Run, name, task.run(false))?;
        match checked(op, TaskStep::NextTarget, name, task.next_target())? {
            Some(row) => Ok(row.into()),
            None => {
                error!("device-mapper table for `{name}` has no targets");
                Err(DevmapperError::MissingTable(name.to_string()))
            }
        }
    }

    /// Replace `name`'s whole table with one `error` target of the same span.
    ///
    /// Afterwards all I/O to the device fails and no parameters of the previous
    /// table (including any dm-crypt key) remain in the live kernel table. The
    /// device node itself is left in place.
    pub fn wipe_table(&self, name: &str) -> DevmapperResult<()> {
        let op = DmOp::Table;
        let mut query = self.named_task(op, name)?;
        checked(op, TaskStep::Run, name, query.run(false))?;

        let mut rows = 0usize;
        let mut total_size = 0u64;
        while let Some(row) = checked(op, TaskStep::NextTarget, name, query.next_target())? {
            rows += 1;
            total_size = total_size.max(row.start.saturating_add(row.size));
        }
        drop(query);

        if rows == 0 {
            error!("device-mapper table for `{name}` has no targets to wipe");
            return Err(DevmapperError::MissingTable(name.to_string()));
        }

        let op = DmOp::Reload;
        let mut reload = self.named_task(op, name)?;
        checked(
            op,
            TaskStep::AddTarget,
            name,
            reload.add_target(0, total_size, ERROR_TARGET, &[]),
        )?;
        checked(op, TaskStep::Run, name, reload.run(false))?;
        info!("device-mapper table for `{name}` wiped ({rows} rows, {total_size} sectors)");
        Ok(())
    }

    /// Map `spec` over `sectors` as a dm-crypt device.
    ///
    /// When discards are requested and the kernel refuses the table, the setup
    /// is retried once without `allow_discards`. Returns whether discards ended
    /// up enabled.
    pub fn setup_crypt(&self, name: &str, sectors: u64, spec: &CryptSpec) -> DevmapperResult<bool> {
        if !spec.allow_discards {
            self.setup(name, &spec.table(sectors, false))?;
            return Ok(false);
        }

        match self.setup(name, &spec.table(sectors, true)) {
            Ok(()) => Ok(true),
            Err(first) => {
                self.setup(name, &spec.table(sectors, false))
                    .inspect_err(|_| error!("dm-crypt setup of `{name}` failed: {first}"))?;
                info!("`{name}`: dm-crypt does not support discard; disabling");
                Ok(false)
            }
        }
    }

    /// Read the raw dm-crypt key currently loaded for `name`.
    pub fn get_crypt_key(&self, name: &str) -> DevmapperResult<SecureBytes> {
        self.get_table(name)?.crypt_key().map_err(|err| {
            error!("unable to read dm-crypt key of `{name}`: {err}");
            DevmapperError::CryptKey(err)
        })
    }

    fn named_task(&self, op: DmOp, name: &str) -> DevmapperResult<F::Task> {
        let mut task = checked(op, TaskStep::Create, name, self.factory.create_task(op))?;
        checked(op, TaskStep::SetName, name, task.set_name(name))?;
        Ok(task)
    }
}

fn checked<T, E>(op: DmOp, step: TaskStep, name: &str, result: Result<T, E>) -> DevmapperResult<T>
where
    E: Error + Send + Sync + 'static,
{
    result.map_err(|source| {
        error!("device-mapper {op} of `{name}` failed at {step}: {source}");
        DevmapperError::Task {
            op,
            step,
            name: name.to_string(),
            source: Box::new(source),
        }
    })
}
