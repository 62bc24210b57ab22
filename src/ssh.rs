//! Remote command channel.
//!
//! Commands run through the system `ssh` client in batch mode, so host key
//! trust and authentication stay with the operator's ssh configuration.
//! Any output on the remote error stream counts as failure.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::types::MachineAddr;

#[derive(Debug, Clone)]
pub struct SshClient {
    binary: String,
    connect_timeout: Duration,
}

impl SshClient {
    pub fn new(binary: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            connect_timeout,
        }
    }

    /// Run `command` on `addr`, optionally feeding `input` on stdin, and
    /// return its stdout.
    pub async fn exec(
        &self,
        addr: &MachineAddr,
        command: &str,
        input: Option<&[u8]>,
        limit: Duration,
    ) -> Result<Vec<u8>> {
        debug!("[{}] {:?}", addr, command);
        let fail = |reason: String| Error::Remote {
            machine: addr.to_string(),
            reason,
        };

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg(addr.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-o")
            .arg("LogLevel=ERROR")
            .arg(format!("{}@{}", addr.user, addr.host))
            .arg(command)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let run = async {
            let mut child = cmd.spawn()?;
            if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
                let mut fed = stdin.write_all(bytes).await;
                if fed.is_ok() {
                    fed = stdin.shutdown().await;
                }
                // ssh that exits early closes its stdin; its stderr says why
                if let Err(e) = fed {
                    if e.kind() != io::ErrorKind::BrokenPipe {
                        return Err(e);
                    }
                }
            }
            Ok::<_, io::Error>(child.wait_with_output().await?)
        };

        let output = timeout(limit, run)
            .await
            .map_err(|_| fail(format!("timed out after {}s", limit.as_secs())))?
            .map_err(|e| fail(format!("failed to run {}: {}", self.binary, e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            return Err(fail(stderr.trim().to_string()));
        }
        if !output.status.success() {
            return Err(fail(format!("exited with {}", output.status)));
        }
        Ok(output.stdout)
    }
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
