use std::time::Duration;

use async_trait::async_trait;

use super::RemoteStore;
use crate::error::Result;
use crate::ssh::{shell_quote, SshClient};
use crate::types::MachineAddr;

/// Replica kept as a file on each machine, accessed over ssh.
pub struct SshStore {
    client: SshClient,
    path: String,
    timeout: Duration,
}

impl SshStore {
    pub fn new(client: SshClient, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            path: path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl RemoteStore for SshStore {
    async fn read(&self, machine: &MachineAddr) -> Result<Vec<u8>> {
        let command = format!("cat {}", shell_quote(&self.path));
        self.client
            .exec(machine, &command, None, self.timeout)
            .await
    }

    async fn write(&self, machine: &MachineAddr, bytes: &[u8]) -> Result<()> {
        // write beside the target, then rename over it
        let path = shell_quote(&self.path);
        let tmp = shell_quote(&format!("{}.tmp", self.path));
        let command = format!("cat > {tmp} && mv {tmp} {path}");
        self.client
            .exec(machine, &command, Some(bytes), self.timeout)
            .await?;
        Ok(())
    }

    async fn probe(&self, machine: &MachineAddr) -> Result<()> {
        self.client
            .exec(machine, "true", None, self.timeout)
            .await?;
        Ok(())
    }
}
