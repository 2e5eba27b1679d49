//! `DevmapperTaskFactory` backed by the host `dmsetup` binary.
//!
//! Each task buffers its name and target rows and issues exactly one `dmsetup`
//! invocation when run. Table queries use `--showkeys` so dm-crypt rows come
//! back with their real key, matching what the kernel ioctl reports.

use crate::command::{classify_failure, DmsetupCommand};
use devmapper_core::config::DMSETUP_PATH_ENV;
use devmapper_core::error::{DevmapperError, DevmapperResult};
use devmapper_core::{
    DevmapperConfig, DevmapperTable, DevmapperTask, DevmapperTaskFactory, DmOp, SecureBytes,
    TargetRow, MAX_DEVICE_NAME_LEN, MAX_TARGET_TYPE_LEN,
};
use log::debug;
use std::collections::VecDeque;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DMSETUP_PATHS: &[&str] = &[
    "/usr/sbin/dmsetup",
    "/sbin/dmsetup",
    "/usr/bin/dmsetup",
    "/bin/dmsetup",
    "/usr/local/sbin/dmsetup",
];

const NO_UDEV_SYNC: &str = "--noudevsync";

/// Hands out [`DmsetupTask`]s sharing one resolved `dmsetup` binary.
#[derive(Debug, Clone)]
pub struct DmsetupTaskFactory {
    command: DmsetupCommand,
    udev_sync: bool,
}

impl DmsetupTaskFactory {
    /// Resolve `dmsetup` from the environment override, the config, well-known
    /// locations and finally `PATH`.
    pub fn from_config(config: &DevmapperConfig) -> DevmapperResult<Self> {
        let binary = resolve_dmsetup_path(config)?;
        debug!("using dmsetup at {}", binary.display());
        Ok(Self {
            command: DmsetupCommand::new(binary, config.dmsetup_timeout()),
            udev_sync: config.dmsetup.udev_sync,
        })
    }

    /// Factory for an explicit binary, waiting for udev when asked to.
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            command: DmsetupCommand::new(binary, timeout),
            udev_sync: true,
        }
    }

    pub fn binary(&self) -> &Path {
        self.command.binary()
    }
}

impl DevmapperTaskFactory for DmsetupTaskFactory {
    type Task = DmsetupTask;

    fn create_task(&self, op: DmOp) -> DevmapperResult<DmsetupTask> {
        Ok(DmsetupTask {
            command: self.command.clone(),
            udev_sync: self.udev_sync,
            op,
            name: None,
            table: SecureBytes::new(),
            rows: VecDeque::new(),
            queried: false,
        })
    }
}

/// One buffered `dmsetup` request.
#[derive(Debug)]
pub struct DmsetupTask {
    command: DmsetupCommand,
    udev_sync: bool,
    op: DmOp,
    name: Option<String>,
    table: SecureBytes,
    rows: VecDeque<TargetRow>,
    queried: bool,
}

impl DmsetupTask {
    pub fn op(&self) -> DmOp {
        self.op
    }

    fn udev_args(&self, udev_sync: bool) -> Vec<&'static str> {
        if udev_sync && self.udev_sync {
            Vec::new()
        } else {
            vec![NO_UDEV_SYNC]
        }
    }
}

impl DevmapperTask for DmsetupTask {
    type Error = DevmapperError;

    fn set_name(&mut self, name: &str) -> DevmapperResult<()> {
        validate_device_name(name)?;
        self.name = Some(name.to_string());
        Ok(())
    }

    fn add_target(
        &mut self,
        start: u64,
        size: u64,
        target_type: &str,
        parameters: &[u8],
    ) -> DevmapperResult<()> {
        if !matches!(self.op, DmOp::Create | DmOp::Reload) {
            return Err(DevmapperError::Command(format!(
                "a {} task does not take target rows",
                self.op
            )));
        }
        validate_target_type(target_type)?;
        if parameters.contains(&b'\n') {
            return Err(DevmapperError::Command(
                "target parameters must fit on one table line".into(),
            ));
        }

        let header = if parameters.is_empty() {
            format!("{start} {size} {target_type}")
        } else {
            format!("{start} {size} {target_type} ")
        };
        self.table.append(header.as_bytes());
        self.table.append(parameters);
        self.table.append(b"\n");
        Ok(())
    }

    fn run(&mut self, udev_sync: bool) -> DevmapperResult<()> {
        let name = self
            .name
            .clone()
            .ok_or_else(|| DevmapperError::Command(format!("{} task has no device name", self.op)))?;

        let mut args: Vec<&str> = Vec::new();
        let input = match self.op {
            DmOp::Create | DmOp::Reload => {
                if self.table.is_empty() {
                    return Err(DevmapperError::Command(format!(
                        "{} task for `{name}` has no target rows",
                        self.op
                    )));
                }
                if self.op == DmOp::Create {
                    args.extend(self.udev_args(udev_sync));
                    args.push("create");
                } else {
                    args.push("reload");
                }
                Some(self.table.as_slice())
            }
            DmOp::Remove => {
                args.extend(self.udev_args(udev_sync));
                args.push("remove");
                None
            }
            DmOp::Table => {
                args.extend(["--showkeys", "table"]);
                None
            }
        };
        args.push(&name);

        debug!("running {} {}", self.command.binary().display(), args.join(" "));
        let out = self.command.run(&args, input)?;
        if out.status != 0 {
            return Err(DevmapperError::Command(classify_failure(
                self.op, &name, &out,
            )));
        }

        if self.op == DmOp::Table {
            self.rows = parse_table_output(&out.stdout)?;
            self.queried = true;
        }
        Ok(())
    }

    fn next_target(&mut self) -> DevmapperResult<Option<TargetRow>> {
        if self.op != DmOp::Table {
            return Err(DevmapperError::Command(format!(
                "a {} task does not report target rows",
                self.op
            )));
        }
        if !self.queried {
            return Err(DevmapperError::Command(
                "table task must run before rows can be read".into(),
            ));
        }
        Ok(self.rows.pop_front())
    }
}

/// Split `dmsetup table` output into rows, skipping blank lines.
fn parse_table_output(stdout: &[u8]) -> DevmapperResult<VecDeque<TargetRow>> {
    stdout
        .split(|byte| *byte == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(|line| DevmapperTable::parse_row(line).map_err(DevmapperError::from))
        .collect()
}

fn validate_device_name(name: &str) -> DevmapperResult<()> {
    let reason = if name.is_empty() {
        Some("name is empty")
    } else if name.len() > MAX_DEVICE_NAME_LEN {
        Some("name is longer than 127 bytes")
    } else if name == "." || name == ".." {
        Some("name is a relative path component")
    } else if name.contains('/') {
        Some("name contains `/`")
    } else if name.chars().any(|ch| ch.is_whitespace() || ch.is_control()) {
        Some("name contains whitespace or control characters")
    } else if name.starts_with('-') {
        Some("name starts with `-`")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(DevmapperError::InvalidConfig(format!(
            "invalid device-mapper name {name:?}: {reason}"
        ))),
        None => Ok(()),
    }
}

fn validate_target_type(target_type: &str) -> DevmapperResult<()> {
    if target_type.is_empty()
        || target_type.len() > MAX_TARGET_TYPE_LEN
        || !target_type.bytes().all(|byte| byte.is_ascii_graphic())
    {
        return Err(DevmapperError::InvalidConfig(format!(
            "invalid target type {target_type:?}"
        )));
    }
    Ok(())
}

fn resolve_dmsetup_path(config: &DevmapperConfig) -> DevmapperResult<PathBuf> {
    let explicit = env::var(DMSETUP_PATH_ENV)
        .ok()
        .or_else(|| config.dmsetup.path.clone());
    if let Some(path) = explicit
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
    {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(DevmapperError::InvalidConfig(format!(
                "dmsetup binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    let search_path = env::var_os("PATH").unwrap_or_default();
    DEFAULT_DMSETUP_PATHS
        .iter()
        .map(PathBuf::from)
        .chain(env::split_paths(&search_path).map(|dir| dir.join("dmsetup")))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            DevmapperError::InvalidConfig(format!(
                "unable to locate dmsetup binary; tried {DEFAULT_DMSETUP_PATHS:?} and PATH"
            ))
        })
}
