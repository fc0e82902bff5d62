use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, ChildStdout, Command};

use super::{Error, Result};

/// Launch options of the external syscall tracer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracerCommand {
    pub program: PathBuf,
    /// Syscall categories the tracer should report. Empty means all.
    pub syscall_filter: Vec<String>,
    pub include_host: bool,
    pub main_thread_only: bool,
}

impl TracerCommand {
    /// Command line arguments passed to the tracer binary.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(4);
        if !self.syscall_filter.is_empty() {
            args.push("--filter".to_owned());
            args.push(self.syscall_filter.join(","));
        }
        if self.include_host {
            args.push("--include-host".to_owned());
        }
        if self.main_thread_only {
            args.push("--main-thread-only".to_owned());
        }
        args
    }

    /// Spawns the tracer with a piped stdout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if the process cannot be started.
    pub fn spawn(&self) -> Result<RunningTracer> {
        log::debug!(
            "Spawning tracer `{}` with args {:?}",
            self.program.display(),
            self.args()
        );
        let mut child = Command::new(&self.program)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let stdout = child.stdout.take().ok_or(Error::MissingStdout)?;

        Ok(RunningTracer { child, stdout })
    }
}

/// A spawned tracer process.
#[derive(Debug)]
pub struct RunningTracer {
    child: Child,
    stdout: ChildStdout,
}

impl RunningTracer {
    /// Splits the tracer into its output stream and an exit watcher.
    pub fn into_parts(self) -> (ChildStdout, ExitWatcher) {
        (self.stdout, ExitWatcher { child: self.child })
    }
}

/// Resolves once the tracer process terminates.
#[derive(Debug)]
pub struct ExitWatcher {
    child: Child,
}

impl ExitWatcher {
    /// Waits for the tracer to exit. Any exit is reported as an error, as the
    /// tracer is expected to run for the whole lifetime of the monitor.
    pub async fn wait(mut self) -> Error {
        match self.child.wait().await {
            Ok(status) => Error::Exited(describe(status)),
            Err(source) => Error::Wait(source),
        }
    }
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_owned(),
    }
}
