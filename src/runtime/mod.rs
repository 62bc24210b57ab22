use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Container, Machine};

pub mod nspawn;
pub use nspawn::NspawnRuntime;

#[cfg(test)]
pub mod fake;

/// Requested state of a container's supervisor unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    Running,
    Stopped,
    Restarted,
}

/// Provisioning backend that creates and drives containers on a machine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Reject containers this backend cannot create, before any remote call.
    fn supports(&self, _container: &Container) -> Result<()> {
        Ok(())
    }

    /// Create `container` on `machine`, starting it when `start` is set.
    async fn provision(&self, machine: &Machine, container: &Container, start: bool) -> Result<()>;

    /// Stop and delete `container` from `machine`.
    async fn deprovision(&self, machine: &Machine, container: &Container) -> Result<()>;

    /// Drive the supervisor unit of `container` towards `state`.
    async fn set_running(
        &self,
        machine: &Machine,
        container: &Container,
        state: DesiredState,
    ) -> Result<()>;
}
