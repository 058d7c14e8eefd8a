//! QEMU process lifecycle.
//!
//! [`ProcessSupervisor`] owns every running VM process, keyed by VM name.
//! At most one handle exists per name:
//!
//! ```text
//! NoHandle ──start──► Running ──kill / exit observed──► NoHandle
//! ```
//!
//! The supervisor is a plain owned value. Callers that move it across threads
//! must put it behind a mutex; the front ends drive it from a single task.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, error, info, warn};

use super::launch::LaunchCommand;
use crate::error::{QmgrError, Result};

/// How long `kill` waits for the process to exit before giving up on it.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Externally observable run state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotRunning,
    Running,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunState::NotRunning => "stopped",
            RunState::Running => "running",
        })
    }
}

/// Result of a kill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// No process was registered under the name.
    NothingToDo,
    /// The process exited within the timeout.
    Terminated,
    /// The process did not confirm exit in time; the handle was dropped anyway.
    TimedOut,
}

/// Details of a live handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub program: String,
}

/// A running VM monitor process.
struct VmProcess {
    child: Child,
    /// Held open so `-monitor stdio` stays attached to a live pipe.
    _monitor: Option<ChildStdin>,
    info: ProcessInfo,
}

impl VmProcess {
    /// `Some(status)` once the process has exited.
    fn exited(&mut self) -> Option<ExitStatus> {
        let polled = self.child.try_wait();
        if let Err(e) = &polled {
            warn!(pid = ?self.info.pid, error = %e, "could not poll VM process, keeping handle");
        }
        exit_status(polled)
    }
}

/// Exit status from a `try_wait` poll. A failed poll counts as still running,
/// so the handle stays registered and `kill` can still reach the process.
fn exit_status(polled: std::io::Result<Option<ExitStatus>>) -> Option<ExitStatus> {
    polled.ok().flatten()
}

/// Outcome of waiting after the kill signal. `None` means the wait timed out.
fn kill_outcome(
    name: &str,
    waited: Option<std::io::Result<ExitStatus>>,
    timeout: Duration,
) -> KillOutcome {
    match waited {
        Some(Ok(status)) => {
            info!(vm = name, exit_status = ?status, "VM process terminated");
            KillOutcome::Terminated
        }
        Some(Err(e)) => {
            // The signal was sent; a failed wait means the child is gone.
            error!(vm = name, error = %e, "error waiting for VM process after kill");
            KillOutcome::Terminated
        }
        None => {
            warn!(
                vm = name,
                timeout_ms = timeout.as_millis() as u64,
                "VM did not exit in time, dropping handle"
            );
            KillOutcome::TimedOut
        }
    }
}

/// Registry of live VM processes.
pub struct ProcessSupervisor {
    processes: HashMap<String, VmProcess>,
    kill_timeout: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_KILL_TIMEOUT)
    }
}

impl ProcessSupervisor {
    pub fn new(kill_timeout: Duration) -> Self {
        Self {
            processes: HashMap::new(),
            kill_timeout,
        }
    }

    /// Drop the handle for `name` if its process has exited.
    fn reap(&mut self, name: &str) {
        let Some(process) = self.processes.get_mut(name) else {
            return;
        };
        if let Some(status) = process.exited() {
            info!(vm = name, pid = ?process.info.pid, exit_status = ?status, "VM process exited");
            self.processes.remove(name);
        }
    }

    /// Spawn `command` and register it under `name`.
    ///
    /// Returns once the OS has created the process; the guest may still be
    /// booting. Nothing is registered if the spawn fails.
    pub fn start(&mut self, name: &str, command: &LaunchCommand) -> Result<Option<u32>> {
        self.reap(name);
        if self.processes.contains_key(name) {
            return Err(QmgrError::Conflict(name.to_string()));
        }

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);

        // QEMU output is forwarded to our terminal; stdin stays a pipe we own.
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let program = command.program.display().to_string();
        let mut child = cmd.spawn().map_err(|source| QmgrError::Spawn {
            program: program.clone(),
            source,
        })?;

        let info = ProcessInfo {
            pid: child.id(),
            started_at: Utc::now(),
            program,
        };
        info!(vm = name, pid = ?info.pid, program = %info.program, "VM spawned");

        let monitor = child.stdin.take();
        self.processes.insert(
            name.to_string(),
            VmProcess {
                child,
                _monitor: monitor,
                info: info.clone(),
            },
        );
        Ok(info.pid)
    }

    /// Current run state of `name`. Observes exit and drops stale handles.
    pub fn status(&mut self, name: &str) -> RunState {
        self.reap(name);
        if self.processes.contains_key(name) {
            RunState::Running
        } else {
            RunState::NotRunning
        }
    }

    /// Pid and start time of a live handle.
    pub fn info(&mut self, name: &str) -> Option<ProcessInfo> {
        self.reap(name);
        self.processes.get(name).map(|p| p.info.clone())
    }

    /// Names with a live process, sorted.
    pub fn running(&mut self) -> Vec<String> {
        let names: Vec<String> = self.processes.keys().cloned().collect();
        for name in &names {
            self.reap(name);
        }
        let mut live: Vec<String> = self.processes.keys().cloned().collect();
        live.sort();
        live
    }

    /// Terminate `name` and wait up to the kill timeout for it to exit.
    ///
    /// The registry entry is removed whether or not exit was confirmed.
    pub async fn kill(&mut self, name: &str) -> Result<KillOutcome> {
        let Some(mut process) = self.processes.remove(name) else {
            debug!(vm = name, "kill requested with no registered process");
            return Ok(KillOutcome::NothingToDo);
        };

        if let Some(status) = process.exited() {
            info!(vm = name, exit_status = ?status, "VM process had already exited");
            return Ok(KillOutcome::Terminated);
        }

        if let Err(e) = process.child.start_kill() {
            warn!(vm = name, error = %e, "failed to signal VM process");
        }

        let waited = tokio::time::timeout(self.kill_timeout, process.child.wait())
            .await
            .ok();
        Ok(kill_outcome(name, waited, self.kill_timeout))
    }

    /// Move the handle for `old` to `new` without touching the process.
    ///
    /// Returns `false` when `old` has no handle.
    pub fn rekey(&mut self, old: &str, new: &str) -> Result<bool> {
        if old == new {
            return Ok(self.processes.contains_key(old));
        }
        self.reap(new);
        if self.processes.contains_key(new) {
            return Err(QmgrError::Conflict(new.to_string()));
        }
        match self.processes.remove(old) {
            Some(process) => {
                debug!(from = old, to = new, pid = ?process.info.pid, "rekeyed VM process");
                self.processes.insert(new.to_string(), process);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Wait for `name` to exit on its own, then drop its handle.
    ///
    /// Returns `None` if nothing is registered under `name`.
    pub async fn wait(&mut self, name: &str) -> Result<Option<ExitStatus>> {
        let Some(process) = self.processes.get_mut(name) else {
            return Ok(None);
        };
        let program = process.info.program.clone();
        let status = process.child.wait().await;
        self.processes.remove(name);
        let status = status.map_err(|e| QmgrError::io(program, e))?;
        info!(vm = name, exit_status = ?status, "VM process exited");
        Ok(Some(status))
    }

    /// Kill every registered process.
    pub async fn shutdown(&mut self) {
        let names: Vec<String> = self.processes.keys().cloned().collect();
        for name in names {
            match self.kill(&name).await {
                Ok(outcome) => debug!(vm = %name, ?outcome, "shutdown kill"),
                Err(e) => warn!(vm = %name, error = %e, "shutdown kill failed"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
