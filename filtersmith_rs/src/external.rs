use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, anyhow};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::JobError;
use crate::transport::{Transport, keys};

/// Runs the whole optimization in an external executable invoked with
/// `<configuration id> <job id>`. The child inherits the environment; its
/// PID is recorded under the job's pid key for the hard-kill path.
#[derive(Debug, Clone)]
pub struct ExternalOptimizer {
    program: PathBuf,
    leading_args: Vec<OsString>,
}

impl ExternalOptimizer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments placed before the configuration and job ids, e.g. a script
    /// path when `program` is an interpreter.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Exit status 0 yields stdout parsed as a JSON array; anything else
    /// surfaces stderr verbatim.
    pub fn run(
        &self,
        configuration_id: u64,
        job_id: &str,
        transport: &dyn Transport,
    ) -> Result<Vec<Value>, JobError> {
        let child = Command::new(&self.program)
            .args(&self.leading_args)
            .arg(configuration_id.to_string())
            .arg(job_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Unable to start {}", self.program.display()))?;

        let pid_key = keys::pid(job_id);
        let pid = child.id();
        if let Err(error) = transport.set(&pid_key, &pid.to_string(), None) {
            let mut child = child;
            let _ = child.kill();
            let _ = child.wait();
            return Err(error.into());
        }
        info!(job_id, pid, program = %self.program.display(), "External optimizer started");

        let output = child
            .wait_with_output()
            .context("Failed to collect external optimizer output");
        if let Err(error) = transport.delete(&pid_key) {
            warn!(job_id, error = %format!("{error:#}"), "Failed to clear optimizer pid");
        }
        let output = output?;

        if !output.status.success() {
            if transport.exists(&keys::stop_flag(job_id))? {
                return Err(JobError::StoppedByUser(job_id.to_string()));
            }
            return Err(JobError::SubprocessFailure {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let results: Vec<Value> = serde_json::from_slice(&output.stdout)
            .context("External optimizer did not print a JSON array")?;
        info!(job_id, results = results.len(), "External optimizer finished");
        Ok(results)
    }
}

/// Send SIGTERM to a recorded optimizer process.
#[cfg(unix)]
pub fn terminate(pid: u32) -> anyhow::Result<()> {
    let pid = libc::pid_t::try_from(pid).map_err(|_| anyhow!("pid {pid} out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).with_context(|| format!("kill({pid}) failed"));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> anyhow::Result<()> {
    Err(anyhow!("hard kill of pid {pid} is not supported on this platform"))
}
