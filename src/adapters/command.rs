//! Process Command Runner
//!
//! Implements the `CommandRunner` port by spawning processes: directly for
//! the local host, through the `ssh` client for remote hosts.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::domain::command::HostCommand;
use crate::domain::model::{RemoteHost, Target};
use crate::domain::ports::{CommandOutput, CommandRunner};
use crate::error::{Error, Result};

/// Default per-command timeout.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Runs host commands as child processes.
#[derive(Debug, Clone)]
pub struct ProcessCommandRunner {
    command_timeout: Duration,
    ssh_program: String,
}

impl Default for ProcessCommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl ProcessCommandRunner {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            command_timeout,
            ssh_program: "ssh".to_string(),
        }
    }

    /// Use a different ssh client binary.
    pub fn with_ssh_program(mut self, program: impl Into<String>) -> Self {
        self.ssh_program = program.into();
        self
    }

    /// Build the process for a target. Remote commands go through ssh with
    /// trust-on-first-use host keys and no interactive prompts.
    fn build(&self, target: &Target, command: &HostCommand) -> Command {
        match target {
            Target::Local => {
                let argv = command.argv();
                let mut process = Command::new(&argv[0]);
                process.args(&argv[1..]);
                process
            }
            Target::Ssh(host) => {
                let mut process = Command::new(&self.ssh_program);
                process.args(ssh_args(host));
                process.arg("--");
                process.arg(command.shell_escaped());
                process
            }
        }
    }
}

/// ssh options for a remote host.
fn ssh_args(host: &RemoteHost) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-p".to_string(),
        host.port.to_string(),
    ];
    if let Some(identity) = &host.identity_file {
        args.push("-i".to_string());
        args.push(identity.display().to_string());
    }
    args.push(format!("{}@{}", host.user, host.address));
    args
}

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    #[instrument(skip(self, command), fields(target = %target, command = %command))]
    async fn execute(&self, target: &Target, command: &HostCommand) -> Result<CommandOutput> {
        let command_error = |stderr: String, exit_status: Option<i32>| Error::Command {
            target: target.to_string(),
            command: command.to_string(),
            stderr,
            exit_status,
        };

        let child = self
            .build(target, command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| command_error(format!("failed to spawn: {}", e), None))?;

        let output = match timeout(self.command_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(command_error(e.to_string(), None)),
            Err(_) => {
                warn!("Command timed out after {:?}", self.command_timeout);
                return Err(command_error(
                    format!("timed out after {:?}", self.command_timeout),
                    None,
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            return Err(command_error(stderr, output.status.code()));
        }

        debug!("Command succeeded ({} bytes of output)", stdout.len());
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_status: output.status.code().unwrap_or(0),
        })
    }
}
