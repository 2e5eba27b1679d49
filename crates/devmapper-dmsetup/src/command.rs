//! Execution wrapper for invoking `dmsetup`.
//!
//! Table text (which may hold dm-crypt keys) only ever reaches the child over
//! stdin, and `table --showkeys` output is collected into zeroizing memory.

use devmapper_core::error::{DevmapperError, DevmapperResult};
use devmapper_core::{DmOp, SecureBytes};
use log::debug;
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone)]
pub(crate) struct DmsetupCommand {
    binary: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub(crate) stdout: SecureBytes,
    pub(crate) stderr: String,
    pub(crate) status: i32,
}

impl DmsetupCommand {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    pub(crate) fn binary(&self) -> &Path {
        &self.binary
    }

    pub(crate) fn run(&self, args: &[&str], input: Option<&[u8]>) -> DevmapperResult<Output> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn()?;

        let stdin_handle = spawn_stdin_writer(child.stdin.take(), input);
        let stdout_handle = spawn_secure_reader(child.stdout.take());
        let stderr_handle = spawn_text_reader(child.stderr.take());

        let exit_status = self.wait_with_timeout(&mut child);

        // A killed or early-exiting child closes its stdin, which unblocks the writer.
        let written = join(stdin_handle, "stdin writer")?;
        let status = exit_status?;
        let stdout = join(stdout_handle, "stdout reader")??;
        let stderr = join(stderr_handle, "stderr reader")??;
        match written {
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                debug!("{} closed stdin before reading the table", self.binary.display());
            }
            other => other?,
        }

        Ok(Output {
            stdout,
            stderr,
            status: status.code().unwrap_or(-1),
        })
    }

    fn wait_with_timeout(&self, child: &mut Child) -> DevmapperResult<ExitStatus> {
        let start = Instant::now();
        while start.elapsed() <= self.timeout {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(err.into());
                }
            }
        }

        let _ = child.kill();
        let _ = child.wait();
        Err(DevmapperError::Command(format!(
            "{} timed out after {:?}",
            self.binary.display(),
            self.timeout
        )))
    }
}

/// Turn a failed `dmsetup` invocation into an operator-facing message.
///
/// Only stderr is consulted; stdout may contain table parameters.
pub(crate) fn classify_failure(op: DmOp, name: &str, output: &Output) -> String {
    let trimmed = output.stderr.trim();
    let lower = trimmed.to_ascii_lowercase();
    let diagnostic = if trimmed.is_empty() {
        "no additional output".to_string()
    } else {
        trimmed.to_string()
    };

    let message = if lower.contains("no such device")
        || lower.contains("not found")
        || lower.contains("does not exist")
    {
        format!("device `{name}` does not exist: {diagnostic}")
    } else if lower.contains("already exists") || lower.contains("file exists") {
        format!("device `{name}` already exists: {diagnostic}")
    } else if lower.contains("permission denied") || lower.contains("operation not permitted") {
        format!(
            "dmsetup {op} of `{name}` was refused: {diagnostic}. Device-mapper control requires CAP_SYS_ADMIN"
        )
    } else if lower.contains("device or resource busy") {
        format!("device `{name}` is busy: {diagnostic}")
    } else if lower.contains("invalid argument") {
        format!("kernel rejected the {op} table for `{name}`: {diagnostic}")
    } else {
        format!("dmsetup {op} of `{name}` failed: {diagnostic}")
    };

    format!("{message} (exit code {})", output.status)
}

fn join<T>(handle: thread::JoinHandle<T>, what: &str) -> DevmapperResult<T> {
    handle
        .join()
        .map_err(|_| DevmapperError::Command(format!("{what} thread panicked")))
}

fn spawn_stdin_writer(
    pipe: Option<ChildStdin>,
    input: Option<&[u8]>,
) -> thread::JoinHandle<io::Result<()>> {
    let payload = input.map(|bytes| Zeroizing::new(bytes.to_vec()));
    thread::spawn(move || -> io::Result<()> {
        if let (Some(mut stdin), Some(payload)) = (pipe, payload) {
            stdin.write_all(&payload)?;
            stdin.flush()?;
        }
        Ok(())
    })
}

fn spawn_secure_reader<R>(pipe: Option<R>) -> thread::JoinHandle<DevmapperResult<SecureBytes>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> DevmapperResult<SecureBytes> {
        let mut collected = SecureBytes::new();
        if let Some(mut reader) = pipe {
            let mut chunk = Zeroizing::new([0u8; READ_CHUNK]);
            loop {
                let read = reader.read(&mut chunk[..])?;
                if read == 0 {
                    break;
                }
                collected.append(&chunk[..read]);
            }
        }
        Ok(collected)
    })
}

fn spawn_text_reader<R>(pipe: Option<R>) -> thread::JoinHandle<DevmapperResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> DevmapperResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}
