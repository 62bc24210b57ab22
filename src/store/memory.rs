//! In-memory replicas for exercising replication without a network.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::RemoteStore;
use crate::error::{Error, Result};
use crate::types::{Document, MachineAddr};

/// Replicas keyed by rendered machine address.
#[derive(Default)]
pub struct MemoryStore {
    replicas: Mutex<BTreeMap<String, Vec<u8>>>,
    unreachable: Mutex<BTreeSet<String>>,
    failing_writes: Mutex<BTreeSet<String>>,
    writes: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the replica on `addr` with `doc`.
    pub fn put(&self, addr: &MachineAddr, doc: &Document) {
        self.put_raw(addr, &doc.to_vec().unwrap());
    }

    pub fn put_raw(&self, addr: &MachineAddr, bytes: &[u8]) {
        self.replicas
            .lock()
            .unwrap()
            .insert(addr.to_string(), bytes.to_vec());
    }

    pub fn get(&self, addr: &MachineAddr) -> Option<Document> {
        self.replicas
            .lock()
            .unwrap()
            .get(&addr.to_string())
            .map(|b| Document::from_slice(b).unwrap())
    }

    /// Make every call against `addr` fail.
    pub fn cut(&self, addr: &MachineAddr) {
        self.unreachable.lock().unwrap().insert(addr.to_string());
    }

    /// Make only writes against `addr` fail.
    pub fn fail_writes(&self, addr: &MachineAddr) {
        self.failing_writes.lock().unwrap().insert(addr.to_string());
    }

    /// Addresses written to, in call order.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    fn check(&self, addr: &MachineAddr) -> Result<()> {
        if self.unreachable.lock().unwrap().contains(&addr.to_string()) {
            return Err(Error::Remote {
                machine: addr.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn read(&self, machine: &MachineAddr) -> Result<Vec<u8>> {
        self.check(machine)?;
        self.replicas
            .lock()
            .unwrap()
            .get(&machine.to_string())
            .cloned()
            .ok_or_else(|| Error::Remote {
                machine: machine.to_string(),
                reason: "cat: nspawn.remote.conf: No such file or directory".into(),
            })
    }

    async fn write(&self, machine: &MachineAddr, bytes: &[u8]) -> Result<()> {
        self.check(machine)?;
        let key = machine.to_string();
        if self.failing_writes.lock().unwrap().contains(&key) {
            return Err(Error::Remote {
                machine: key,
                reason: "No space left on device".into(),
            });
        }
        self.writes.lock().unwrap().push(key.clone());
        self.replicas.lock().unwrap().insert(key, bytes.to_vec());
        Ok(())
    }

    async fn probe(&self, machine: &MachineAddr) -> Result<()> {
        self.check(machine)
    }
}
