//! Pull-merge-push replication of the cluster state document.
//!
//! Every machine holds a full replica. A command pulls the replica from the
//! bootstrap machine, then from every machine that replica lists, merges
//! them, and pushes the result back to every machine. There is no quorum
//! and no versioning: entries from later replicas (in machine id order)
//! overwrite earlier ones, removed entries come back if any replica still
//! has them, and two commands running concurrently can lose each other's
//! writes.

use std::sync::Arc;

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::RemoteStore;
use crate::types::{Document, Machine, MachineAddr};

/// What to do when a machine cannot be read or written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Ask the operator through [`Confirm`].
    #[default]
    Ask,
    /// Leave the machine out and carry on.
    Skip,
    /// Fail the whole command.
    Abort,
}

/// Operator decision hook used by [`FailurePolicy::Ask`].
pub trait Confirm: Send + Sync {
    /// Return `true` to go ahead.
    fn confirm(&self, question: &str) -> bool;
}

/// Outcome of a successful [`Replicator::save`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub written: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct Replicator {
    store: Arc<dyn RemoteStore>,
    policy: FailurePolicy,
    confirm: Arc<dyn Confirm>,
}

impl Replicator {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        policy: FailurePolicy,
        confirm: Arc<dyn Confirm>,
    ) -> Self {
        Self {
            store,
            policy,
            confirm,
        }
    }

    /// Produce the merged view of every reachable replica.
    pub async fn load(&self, bootstrap: &MachineAddr) -> Result<Document> {
        let first = self
            .fetch(bootstrap)
            .await
            .map_err(|e| Error::BootstrapUnavailable {
                uri: bootstrap.to_string(),
                reason: e.to_string(),
            })?;

        let machines: Vec<Machine> = first.machines.values().cloned().collect();
        let fetched = join_all(machines.iter().map(|m| self.fetch_addr(m))).await;

        let mut replicas = vec![first];
        for (machine, result) in machines.iter().zip(fetched) {
            match result {
                Ok(doc) => replicas.push(doc),
                Err(e) => self.tolerate(machine, "load state from", &e)?,
            }
        }

        debug!("merging {} replica(s)", replicas.len());
        let merged = merge(&replicas);
        merged.validate()?;
        Ok(merged)
    }

    /// Push `doc` to every machine it lists.
    ///
    /// Machines are probed first so that an abort leaves every replica
    /// untouched. Writes then go out independently; a failed write does not
    /// undo the others. A save that reaches no machine at all is an error
    /// whatever the policy says.
    pub async fn save(&self, doc: &Document) -> Result<SaveReport> {
        let machines: Vec<&Machine> = doc.machines.values().collect();
        if machines.is_empty() {
            return Err(Error::NoMachinesAvailable);
        }

        let probes = join_all(machines.iter().map(|m| self.probe(m))).await;
        let mut report = SaveReport::default();
        let mut targets = Vec::new();
        for (machine, result) in machines.into_iter().zip(probes) {
            match result {
                Ok(()) => targets.push(machine),
                Err(e) => {
                    self.tolerate(machine, "save state to", &e)?;
                    report.skipped.push(label(machine));
                }
            }
        }
        if targets.is_empty() {
            return Err(Error::PartialReplication {
                failed: report.skipped,
            });
        }

        let bytes = doc.to_vec()?;
        let bytes = bytes.as_slice();
        let writes = join_all(
            targets
                .iter()
                .map(|m| async move { self.store.write(&m.addr(), bytes).await }),
        )
        .await;

        let mut failed = Vec::new();
        for (machine, result) in targets.into_iter().zip(writes) {
            match result {
                Ok(()) => report.written.push(label(machine)),
                Err(e) => failed.push((machine, e)),
            }
        }

        let mut declined = false;
        for (machine, e) in &failed {
            if !declined && self.tolerate(machine, "save state to", e).is_err() {
                declined = true;
            }
            report.skipped.push(label(machine));
        }
        if declined {
            return Err(Error::PartialReplication {
                failed: failed.iter().map(|(m, _)| label(m)).collect(),
            });
        }
        if report.written.is_empty() {
            return Err(Error::PartialReplication {
                failed: report.skipped,
            });
        }

        info!(
            "state saved to {} machine(s), {} skipped",
            report.written.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Whether `addr` already holds a readable replica.
    pub async fn has_replica(&self, addr: &MachineAddr) -> bool {
        self.fetch(addr).await.is_ok()
    }

    async fn fetch(&self, addr: &MachineAddr) -> Result<Document> {
        let bytes = self.store.read(addr).await?;
        Document::from_slice(&bytes)
    }

    async fn fetch_addr(&self, machine: &Machine) -> Result<Document> {
        self.fetch(&machine.addr()).await
    }

    async fn probe(&self, machine: &Machine) -> Result<()> {
        self.store.probe(&machine.addr()).await
    }

    /// Apply the failure policy to one machine. `Ok` means skip it.
    fn tolerate(&self, machine: &Machine, action: &str, err: &Error) -> Result<()> {
        let who = label(machine);
        error!("could not {} {}: {}", action, who, err);

        let skip = match self.policy {
            FailurePolicy::Skip => true,
            FailurePolicy::Abort => false,
            FailurePolicy::Ask => self
                .confirm
                .confirm(&format!("Could not {} {}. Skip?", action, who)),
        };

        if skip {
            warn!("skipping {}", who);
            Ok(())
        } else {
            Err(Error::MachineUnreachable {
                machine: who,
                reason: err.to_string(),
            })
        }
    }
}

fn label(machine: &Machine) -> String {
    format!("{} ({})", machine.id.short(), machine.addr())
}

/// Union of `docs`; for equal keys the entry from the later document wins.
pub fn merge<'a, I>(docs: I) -> Document
where
    I: IntoIterator<Item = &'a Document>,
{
    let mut merged = Document::default();
    for doc in docs {
        merged
            .machines
            .extend(doc.machines.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
            .projects
            .extend(doc.projects.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
            .containers
            .extend(doc.containers.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}
