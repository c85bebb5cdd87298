//! Remote harness access over SSH/SCP.
//!
//! Every operation spawns a fresh `ssh`/`scp` process; there is no session
//! to keep alive, so `close` has nothing to do. Failed attempts retry with
//! a linearly increasing back-off; a timeout on the final attempt surfaces
//! as [`SshError::Timeout`], which the worker treats as a possible crash.

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use fuzzer_data::Config;
use log::warn;
use tokio::process::Command;

const FILE_TRANSFER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub enum SshError {
    /// All attempts ran into the per-attempt timeout.
    Timeout { cmd: String, attempts: u32 },
    /// All attempts failed for another reason.
    Transport { cmd: String, attempts: u32 },
}

impl fmt::Display for SshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshError::Timeout { cmd, attempts } => {
                write!(f, "timeout after {attempts} attempts: {cmd}")
            }
            SshError::Transport { cmd, attempts } => {
                write!(f, "transport failure after {attempts} attempts: {cmd}")
            }
        }
    }
}

impl std::error::Error for SshError {}

impl SshError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SshError::Timeout { .. })
    }
}

/// Result of one remote command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_us: u64,
}

/// Guest access for one worker: fixed host/user/identity, per-worker port.
#[derive(Debug, Clone)]
pub struct SshClient {
    host: String,
    port: u16,
    user: String,
    identity: Option<String>,
    retry_max: u32,
    exec_timeout: Duration,
}

impl SshClient {
    pub fn new(config: &Config, port: u16) -> Self {
        SshClient {
            host: config.ssh_params.host.clone(),
            port,
            user: config.ssh_params.user.clone(),
            identity: config.ssh_params.identity.clone(),
            retry_max: config.fuzzing.ssh_retry_max,
            exec_timeout: Duration::from_secs_f64(config.fuzzing.remote_command_exec_timeout),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Runs `cmd` on the guest with the default retry budget and timeout.
    pub async fn exec(&self, cmd: &str) -> Result<ExecResult, SshError> {
        self.exec_with(cmd, self.retry_max, self.exec_timeout).await
    }

    /// Runs `cmd` with a single attempt and the default timeout. Test
    /// invocations use this: a timeout there means a possible crash, not
    /// something to retry.
    pub async fn exec_once(&self, cmd: &str) -> Result<ExecResult, SshError> {
        self.exec_with(cmd, 1, self.exec_timeout).await
    }

    /// Runs `cmd` with a single attempt and an explicit timeout.
    pub async fn exec_once_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<ExecResult, SshError> {
        self.exec_with(cmd, 1, timeout).await
    }

    /// Runs `cmd` with an explicit retry budget and per-attempt timeout.
    /// A non-zero exit status is a result, not an error.
    pub async fn exec_with(
        &self,
        cmd: &str,
        retry_max: u32,
        timeout: Duration,
    ) -> Result<ExecResult, SshError> {
        let args = self.ssh_args(cmd);
        self.run_with_retries("ssh", &args, cmd, retry_max, timeout)
            .await
    }

    /// Copies a local file to the guest.
    pub async fn send_file<P: AsRef<Path>>(
        &self,
        local_path: P,
        remote_path: &str,
    ) -> Result<ExecResult, SshError> {
        let local = local_path.as_ref().display().to_string();
        let args = self.scp_args(false, &local, remote_path);
        self.run_with_retries("scp", &args, &local, self.retry_max, FILE_TRANSFER_TIMEOUT)
            .await
    }

    /// Recursively copies a guest path back to the host.
    pub async fn copy_back<P: AsRef<Path>>(
        &self,
        remote_path: &str,
        local_path: P,
    ) -> Result<ExecResult, SshError> {
        let local = local_path.as_ref().display().to_string();
        let args = self.scp_args(true, remote_path, &local);
        self.run_with_retries("scp", &args, remote_path, self.retry_max, FILE_TRANSFER_TIMEOUT)
            .await
    }

    /// The channel is per-command; nothing to tear down.
    pub fn close(&self) {}

    async fn run_with_retries(
        &self,
        program: &str,
        args: &[String],
        what: &str,
        retry_max: u32,
        timeout: Duration,
    ) -> Result<ExecResult, SshError> {
        let mut timed_out = false;
        for attempt in 0..retry_max {
            let mut command = Command::new(program);
            command.args(args).kill_on_drop(true);

            let start = Instant::now();
            match tokio::time::timeout(timeout, command.output()).await {
                Ok(Ok(output)) => {
                    let elapsed_us = start.elapsed().as_micros() as u64;
                    return Ok(ExecResult {
                        returncode: output.status.code().unwrap_or(-1),
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                        elapsed_us,
                    });
                }
                Ok(Err(e)) => {
                    timed_out = false;
                    warn!(
                        "[{program}] error: {e}. Retry {}/{retry_max}...",
                        attempt + 1
                    );
                }
                Err(_elapsed) => {
                    timed_out = true;
                    warn!(
                        "[{program}] timeout running command. Retry {}/{retry_max}...",
                        attempt + 1
                    );
                }
            }
            tokio::time::sleep(Duration::from_secs((attempt + 1) as u64)).await;
        }

        if timed_out {
            Err(SshError::Timeout {
                cmd: what.to_string(),
                attempts: retry_max,
            })
        } else {
            Err(SshError::Transport {
                cmd: what.to_string(),
                attempts: retry_max,
            })
        }
    }

    fn ssh_args(&self, cmd: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "ConnectTimeout=5".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
        ];
        if let Some(identity) = &self.identity {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        args.push("-p".to_string());
        args.push(self.port.to_string());
        args.push(format!("{}@{}", self.user, self.host));
        args.push(cmd.to_string());
        args
    }

    fn scp_args(&self, from_remote: bool, source: &str, destination: &str) -> Vec<String> {
        let mut args = Vec::new();
        if from_remote {
            args.push("-r".to_string());
        }
        // -O keeps OpenSSH compatibility mode for older guest sshd.
        args.push("-O".to_string());
        args.push("-o".to_string());
        args.push("StrictHostKeyChecking=no".to_string());
        args.push("-o".to_string());
        args.push("UserKnownHostsFile=/dev/null".to_string());
        if let Some(identity) = &self.identity {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        args.push("-P".to_string());
        args.push(self.port.to_string());
        if from_remote {
            args.push(format!("{}@{}:{}", self.user, self.host, source));
            args.push(destination.to_string());
        } else {
            args.push(source.to_string());
            args.push(format!("{}@{}:{}", self.user, self.host, destination));
        }
        args
    }
}
