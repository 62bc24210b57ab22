//! Recording runtime for orchestration tests.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{ContainerRuntime, DesiredState};
use crate::error::{Error, Result};
use crate::types::{Container, Machine};

#[derive(Default)]
pub struct FakeRuntime {
    fail: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runtime whose every action fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, machine: &Machine, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail {
            return Err(Error::ProvisioningFailed {
                machine: machine.host.clone(),
                reason: "pacstrap exited with 1".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn provision(&self, machine: &Machine, container: &Container, start: bool) -> Result<()> {
        self.record(
            machine,
            format!("provision {} on {} start={}", container.name, machine.host, start),
        )
    }

    async fn deprovision(&self, machine: &Machine, container: &Container) -> Result<()> {
        self.record(
            machine,
            format!("deprovision {} on {}", container.name, machine.host),
        )
    }

    async fn set_running(
        &self,
        machine: &Machine,
        container: &Container,
        state: DesiredState,
    ) -> Result<()> {
        self.record(
            machine,
            format!("{:?} {} on {}", state, container.name, machine.host),
        )
    }
}
