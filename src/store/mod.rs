//! Remote store access: reading and writing one machine's replica.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::MachineAddr;

pub mod ssh;
pub use ssh::SshStore;

#[cfg(test)]
pub mod memory;

/// Access to the serialized cluster state held on a single machine.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the raw replica bytes from `machine`.
    async fn read(&self, machine: &MachineAddr) -> Result<Vec<u8>>;

    /// Replace the replica on `machine` with `bytes`.
    async fn write(&self, machine: &MachineAddr, bytes: &[u8]) -> Result<()>;

    /// Check that `machine` accepts commands, without touching its replica.
    async fn probe(&self, machine: &MachineAddr) -> Result<()>;
}
