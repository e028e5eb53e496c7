// Remote command execution - turns raw channel outcomes into typed results

use crate::error::{Error, RemoteChannelClosedDetails, RemoteCommandFailedDetails, Result};
use crate::ssh::{ChannelClose, RemoteTarget, Transport};
use crate::utils::shell;

/// Output of a remote command whose exit status was observed.
///
/// Both streams were already forwarded to the local terminal while the
/// command ran; the bytes here are the captured copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Whether a non-zero exit aborts the caller or is logged and tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Fatal,
    BestEffort,
}

/// Runs scripts over a [`Transport`], one at a time, and classifies the result.
pub struct RemoteExecutor<T> {
    transport: T,
}

impl<T: Transport> RemoteExecutor<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run a script and return its exit status, whatever it is.
    ///
    /// Fails only when the channel closed without reporting a status.
    pub fn run(&self, target: &RemoteTarget, script: &str) -> Result<ExecutionResult> {
        let outcome = self.transport.exec(target, script)?;

        match outcome.close {
            ChannelClose::Exited(exit_code) => Ok(ExecutionResult {
                exit_code,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
            }),
            ChannelClose::Dropped { reason } => {
                Err(Error::remote_channel_closed(RemoteChannelClosedDetails {
                    command: script.to_string(),
                    reason,
                    target: target.details(),
                }))
            }
        }
    }

    /// Run a script; any non-zero exit is a `RemoteCommandFailed` error.
    pub fn execute(&self, target: &RemoteTarget, script: &str) -> Result<ExecutionResult> {
        let result = self.run(target, script)?;
        if result.success() {
            return Ok(result);
        }

        Err(Error::remote_command_failed(RemoteCommandFailedDetails {
            command: script.to_string(),
            exit_code: result.exit_code,
            stdout: String::from_utf8_lossy(&result.stdout).to_string(),
            stderr: String::from_utf8_lossy(&result.stderr).to_string(),
            target: target.details(),
        }))
    }

    /// Run a script under an explicit failure policy.
    ///
    /// `BestEffort` tolerates a non-zero exit only; a dropped channel is
    /// always returned as an error.
    pub fn execute_with(
        &self,
        target: &RemoteTarget,
        script: &str,
        policy: FailurePolicy,
    ) -> Result<ExecutionResult> {
        match policy {
            FailurePolicy::Fatal => self.execute(target, script),
            FailurePolicy::BestEffort => {
                let result = self.run(target, script)?;
                if !result.success() {
                    eprintln!(
                        "warning: tolerated failure (exit {}) on {}: {}",
                        result.exit_code,
                        target,
                        shell::summarize(script)
                    );
                }
                Ok(result)
            }
        }
    }

    /// Idempotence guard: true when the probe script exits 0.
    pub fn probe(&self, target: &RemoteTarget, script: &str) -> Result<bool> {
        Ok(self.run(target, script)?.success())
    }
}
