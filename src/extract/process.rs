// src/extract/process.rs

//! Background archiver processes
//!
//! A [`Job`] runs one external command with stdout and stderr redirected to
//! capture files, so output survives the process being killed.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Interval between liveness checks of a running job
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Output a job wrote before it exited or was killed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStreams {
    pub stdout: String,
    pub stderr: String,
}

/// How a polled job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Finished(ExitStatus),
    /// The abort predicate fired and the process was killed
    Killed,
}

/// A running external command
#[derive(Debug)]
pub struct Job {
    program: String,
    child: Child,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
}

impl Job {
    /// Start `cmd` in the background, capturing its output in `capture_dir`.
    ///
    /// `input` is written to the process's stdin, which is then closed.
    pub fn start(mut cmd: Command, capture_dir: &Path, input: Option<&[u8]>) -> Result<Self> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        let stdout_path = capture_dir.join("job.stdout");
        let stderr_path = capture_dir.join("job.stderr");

        cmd.stdout(Stdio::from(File::create(&stdout_path)?))
            .stderr(Stdio::from(File::create(&stderr_path)?))
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        debug!("Running command: {:?}", cmd);
        let mut child = cmd.spawn().map_err(|source| Error::Command {
            program: program.clone(),
            source,
        })?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            // the process may exit without reading its input
            if let Err(e) = stdin.write_all(input) {
                if e.kind() != io::ErrorKind::BrokenPipe {
                    warn!("Failed to write input to {}: {}", program, e);
                }
            }
        }

        Ok(Self {
            program,
            child,
            stdout_path,
            stderr_path,
        })
    }

    /// `None` while the process is still running
    pub fn poll(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Kill the process immediately and reap it
    pub fn kill(&mut self) -> Result<()> {
        warn!("Killing {}", self.program);
        if let Err(e) = self.child.kill() {
            // already exited
            if e.kind() != io::ErrorKind::InvalidInput {
                return Err(e.into());
            }
        }
        self.child.wait()?;
        Ok(())
    }

    /// Wait for the job, asking `abort` before every liveness check
    pub fn wait_polling(&mut self, abort: &mut dyn FnMut() -> bool) -> Result<JobOutcome> {
        loop {
            if abort() {
                warn!("Restoration aborted!");
                self.kill()?;
                return Ok(JobOutcome::Killed);
            }
            if let Some(status) = self.poll()? {
                debug!("{} finished: {}", self.program, status);
                return Ok(JobOutcome::Finished(status));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Everything the process wrote so far
    pub fn captured(&self) -> Result<CapturedStreams> {
        Ok(CapturedStreams {
            stdout: read_lossy(&self.stdout_path)?,
            stderr: read_lossy(&self.stderr_path)?,
        })
    }
}

fn read_lossy(path: &Path) -> Result<String> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}
