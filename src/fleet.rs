//! Machine, project and container operations.
//!
//! Each operation is one full cycle: load the merged state, compute, push
//! the result back to every machine. Nothing here locks the cluster state,
//! so two operators working at once can overwrite each other's changes.

use std::sync::Arc;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::id::{resolve_short, Id};
use crate::ports::allocate;
use crate::replicator::Replicator;
use crate::runtime::{ContainerRuntime, DesiredState};
use crate::scheduler::select_machine;
use crate::types::{Container, Document, Machine, MachineAddr, PortRequest, Project};

/// Request for a new container.
#[derive(Debug, Clone)]
pub struct NewContainer {
    pub name: String,
    pub ports: Vec<PortRequest>,
    pub distro: String,
    pub image_id: Option<String>,
    pub image: Option<String>,
    /// Short or full id of the machine to place on.
    pub machine: Option<String>,
    pub start: bool,
}

pub struct Fleet {
    replicator: Replicator,
    runtime: Arc<dyn ContainerRuntime>,
    bootstrap: MachineAddr,
}

impl Fleet {
    pub fn new(
        replicator: Replicator,
        runtime: Arc<dyn ContainerRuntime>,
        bootstrap: MachineAddr,
    ) -> Self {
        Self {
            replicator,
            runtime,
            bootstrap,
        }
    }

    async fn load(&self) -> Result<Document> {
        self.replicator.load(&self.bootstrap).await
    }

    async fn save(&self, doc: &Document) -> Result<()> {
        let report = self.replicator.save(doc).await?;
        if !report.skipped.is_empty() {
            warn!(
                "replicas not updated on: {}",
                report.skipped.join(", ")
            );
        }
        Ok(())
    }

    /// Register the bootstrap machine as the first member of a new cluster.
    pub async fn init(&self) -> Result<Machine> {
        if self.replicator.has_replica(&self.bootstrap).await {
            return Err(Error::DuplicateName {
                kind: "cluster on",
                name: self.bootstrap.to_string(),
            });
        }

        let machine = Machine::new(Id::new(), self.bootstrap.clone());
        let mut doc = Document::default();
        doc.machines.insert(machine.id.clone(), machine.clone());
        self.save(&doc).await?;
        info!("initialised cluster on {}", self.bootstrap);
        Ok(machine)
    }

    /// Machines sorted by host and port.
    pub async fn machines(&self) -> Result<Vec<Machine>> {
        let doc = self.load().await?;
        let mut machines: Vec<Machine> = doc.machines.into_values().collect();
        machines.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        Ok(machines)
    }

    pub async fn add_machine(&self, address: &str) -> Result<Machine> {
        let addr: MachineAddr = address.parse()?;
        let mut doc = self.load().await?;

        if doc.machine_by_host(&addr.host).is_some() {
            return Err(Error::DuplicateName {
                kind: "machine",
                name: addr.host,
            });
        }

        let machine = Machine::new(Id::new(), addr);
        doc.machines.insert(machine.id.clone(), machine.clone());
        self.save(&doc).await?;
        info!("added machine {} ({})", machine.id.short(), machine.addr());
        Ok(machine)
    }

    pub async fn remove_machine(&self, short: &str) -> Result<Machine> {
        let mut doc = self.load().await?;
        let id = resolve(short, doc.machines.keys(), Error::UnknownMachine)?;

        let hosted = doc.containers_on(&id).count();
        if hosted > 0 {
            return Err(Error::MachineInUse {
                machine: id.short().to_string(),
                containers: hosted,
            });
        }

        let machine = doc
            .machines
            .remove(&id)
            .ok_or_else(|| Error::UnknownMachine(short.to_string()))?;
        self.save(&doc).await?;
        info!("removed machine {}", id.short());
        Ok(machine)
    }

    /// Projects sorted by name.
    pub async fn projects(&self) -> Result<Vec<Project>> {
        let doc = self.load().await?;
        let mut projects: Vec<Project> = doc.projects.into_values().collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    /// Create a project. The name is unique only within the state this
    /// command saw.
    pub async fn add_project(&self, name: &str) -> Result<Project> {
        let mut doc = self.load().await?;
        if doc.project_by_name(name).is_some() {
            return Err(Error::DuplicateName {
                kind: "project",
                name: name.to_string(),
            });
        }

        let project = Project {
            id: Id::new(),
            name: name.to_string(),
        };
        doc.projects.insert(project.id.clone(), project.clone());
        self.save(&doc).await?;
        info!("added project {} ({})", project.id.short(), project.name);
        Ok(project)
    }

    pub async fn remove_project(&self, short: &str) -> Result<Project> {
        let mut doc = self.load().await?;
        let id = resolve(short, doc.projects.keys(), Error::UnknownProject)?;

        let owned = doc.containers_in(&id).count();
        if owned > 0 {
            return Err(Error::ProjectInUse {
                project: id.short().to_string(),
                containers: owned,
            });
        }

        let project = doc
            .projects
            .remove(&id)
            .ok_or_else(|| Error::UnknownProject(short.to_string()))?;
        self.save(&doc).await?;
        info!("removed project {}", id.short());
        Ok(project)
    }

    /// Containers of a project sorted by name and host.
    pub async fn containers(&self, project: &str) -> Result<Vec<Container>> {
        let doc = self.load().await?;
        let project_id = resolve(project, doc.projects.keys(), Error::UnknownProject)?;
        let mut containers: Vec<Container> = doc.containers_in(&project_id).cloned().collect();
        containers.sort_by(|a, b| (&a.name, &a.host).cmp(&(&b.name, &b.host)));
        Ok(containers)
    }

    /// Place, provision and record a new container.
    ///
    /// The entry is saved only after provisioning succeeded.
    pub async fn add_container(&self, project: &str, spec: NewContainer) -> Result<Container> {
        let mut doc = self.load().await?;
        let project_id = resolve(project, doc.projects.keys(), Error::UnknownProject)?;
        let hint = spec
            .machine
            .as_deref()
            .map(|m| resolve(m, doc.machines.keys(), Error::UnknownMachine))
            .transpose()?;

        let machine = select_machine(&doc, hint.as_ref())?.clone();
        let ports = allocate(&doc, &machine, &spec.ports)?;

        let container = Container {
            id: Id::new(),
            project_id,
            machine_id: machine.id.clone(),
            host: machine.host.clone(),
            name: spec.name,
            ports,
            distro: spec.distro,
            image_id: spec.image_id,
            image: spec.image,
        };
        self.runtime.supports(&container)?;

        info!(
            "placing {} on {} with ports {:?}",
            container.id.short(),
            machine.host,
            container.ports
        );
        self.runtime
            .provision(&machine, &container, spec.start)
            .await
            .map_err(|e| match e {
                Error::ProvisioningFailed { .. } => e,
                other => Error::ProvisioningFailed {
                    machine: machine.addr().to_string(),
                    reason: other.to_string(),
                },
            })?;

        doc.containers
            .insert(container.id.clone(), container.clone());
        self.save(&doc).await?;
        Ok(container)
    }

    /// Deprovision and forget a container.
    ///
    /// With `force`, deprovisioning is attempted on every machine and
    /// failures are only logged.
    pub async fn remove_container(&self, project: &str, short: &str, force: bool) -> Result<Container> {
        let mut doc = self.load().await?;
        let container = find_container(&doc, project, short)?.clone();

        if force {
            for machine in doc.machines.values() {
                if let Err(e) = self.runtime.deprovision(machine, &container).await {
                    warn!("deprovision on {} failed: {}", machine.host, e);
                }
            }
        } else {
            let machine = owner(&doc, &container)?;
            self.runtime.deprovision(machine, &container).await?;
        }

        doc.containers.remove(&container.id);
        self.save(&doc).await?;
        info!("removed container {}", container.id.short());
        Ok(container)
    }

    /// Start, stop or restart a container on its machine.
    pub async fn set_running(&self, project: &str, short: &str, state: DesiredState) -> Result<Container> {
        let doc = self.load().await?;
        let container = find_container(&doc, project, short)?;
        let machine = owner(&doc, container)?;
        self.runtime.set_running(machine, container, state).await?;
        Ok(container.clone())
    }

    pub async fn migrate(&self, project: &str, short: &str) -> Result<Container> {
        let doc = self.load().await?;
        find_container(&doc, project, short)?;
        Err(Error::NotImplemented("container migration"))
    }
}

/// Resolve `short` among `ids`, reporting a miss through `unknown`.
fn resolve<'a, I>(short: &str, ids: I, unknown: fn(String) -> Error) -> Result<Id>
where
    I: IntoIterator<Item = &'a Id>,
{
    match resolve_short(short, ids) {
        Err(Error::AmbiguousOrNotFound { matches: 0, .. }) => Err(unknown(short.to_string())),
        other => other,
    }
}

fn find_container<'a>(doc: &'a Document, project: &str, short: &str) -> Result<&'a Container> {
    let project_id = resolve(project, doc.projects.keys(), Error::UnknownProject)?;
    let id = resolve(
        short,
        doc.containers_in(&project_id).map(|c| &c.id),
        Error::UnknownContainer,
    )?;
    doc.containers
        .get(&id)
        .ok_or_else(|| Error::UnknownContainer(short.to_string()))
}

fn owner<'a>(doc: &'a Document, container: &Container) -> Result<&'a Machine> {
    doc.machines
        .get(&container.machine_id)
        .ok_or_else(|| Error::UnknownMachine(container.machine_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicator::{Confirm, FailurePolicy};
    use crate::runtime::fake::FakeRuntime;
    use crate::store::memory::MemoryStore;

    struct No;

    impl Confirm for No {
        fn confirm(&self, _question: &str) -> bool {
            false
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        runtime: Arc<FakeRuntime>,
        fleet: Fleet,
    }

    impl Harness {
        /// Operator who declines every question, as on a non-interactive run.
        fn with_policy(runtime: FakeRuntime, policy: FailurePolicy) -> Self {
            let store = Arc::new(MemoryStore::new());
            let runtime = Arc::new(runtime);
            let replicator = Replicator::new(store.clone(), policy, Arc::new(No));
            let fleet = Fleet::new(replicator, runtime.clone(), addr("node1"));
            Self {
                store,
                runtime,
                fleet,
            }
        }

        /// Cluster of node1..node3 with one project.
        async fn cluster(runtime: FakeRuntime) -> (Self, Project) {
            Self::cluster_with_policy(runtime, FailurePolicy::Abort).await
        }

        async fn cluster_with_policy(runtime: FakeRuntime, policy: FailurePolicy) -> (Self, Project) {
            let h = Self::with_policy(runtime, policy);
            h.fleet.init().await.unwrap();
            h.fleet.add_machine("node2").await.unwrap();
            h.fleet.add_machine("node3").await.unwrap();
            let project = h.fleet.add_project("web").await.unwrap();
            (h, project)
        }

        fn replica(&self, host: &str) -> Document {
            self.store.get(&addr(host)).unwrap()
        }
    }

    fn addr(host: &str) -> MachineAddr {
        host.parse().unwrap()
    }

    fn spec(name: &str, ports: Vec<PortRequest>) -> NewContainer {
        NewContainer {
            name: name.into(),
            ports,
            distro: "arch".into(),
            image_id: None,
            image: None,
            machine: None,
            start: false,
        }
    }

    #[tokio::test]
    async fn every_machine_gets_the_same_state() {
        let (h, project) = Harness::cluster(FakeRuntime::new()).await;
        let doc = h.replica("node1");
        assert_eq!(doc.machines.len(), 3);
        assert!(doc.projects.contains_key(&project.id));
        assert_eq!(h.replica("node2"), doc);
        assert_eq!(h.replica("node3"), doc);
    }

    #[tokio::test]
    async fn init_refuses_existing_cluster() {
        let (h, _) = Harness::cluster(FakeRuntime::new()).await;
        assert!(matches!(
            h.fleet.init().await,
            Err(Error::DuplicateName { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_host_and_project_name_are_rejected() {
        let (h, _) = Harness::cluster(FakeRuntime::new()).await;
        let err = h.fleet.add_machine("admin@node2:2222").await.unwrap_err();
        assert!(matches!(err, Error::DuplicateName { kind: "machine", ref name } if name == "node2"));

        let err = h.fleet.add_project("web").await.unwrap_err();
        assert!(matches!(err, Error::DuplicateName { kind: "project", .. }));
    }

    #[tokio::test]
    async fn containers_spread_across_machines() {
        let (h, project) = Harness::cluster(FakeRuntime::new()).await;
        let short = project.id.short();

        let mut hosts = Vec::new();
        for name in ["a", "b", "c"] {
            let c = h
                .fleet
                .add_container(short, spec(name, vec![PortRequest::auto(22)]))
                .await
                .unwrap();
            assert_eq!(c.ports.keys().copied().collect::<Vec<_>>(), vec![10022]);
            hosts.push(c.host);
        }
        hosts.sort();
        hosts.dedup();
        assert_eq!(hosts.len(), 3);

        let listed = h.fleet.containers(short).await.unwrap();
        let names: Vec<_> = listed.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(h.runtime.calls().len(), 3);
    }

    #[tokio::test]
    async fn pinned_machine_probes_past_used_ports() {
        let (h, project) = Harness::cluster(FakeRuntime::new()).await;
        let node2 = h
            .fleet
            .machines()
            .await
            .unwrap()
            .into_iter()
            .find(|m| m.host == "node2")
            .unwrap();

        let mut request = spec("a", vec![PortRequest::auto(22)]);
        request.machine = Some(node2.id.short().to_string());
        let first = h.fleet.add_container(project.id.short(), request.clone()).await.unwrap();
        let second = h.fleet.add_container(project.id.short(), request).await.unwrap();

        assert_eq!(first.machine_id, node2.id);
        assert_eq!(second.machine_id, node2.id);
        assert_eq!(second.ports.keys().copied().collect::<Vec<_>>(), vec![10023]);
    }

    #[tokio::test]
    async fn failed_provisioning_persists_nothing() {
        let (h, project) = Harness::cluster(FakeRuntime::failing()).await;
        let before: Vec<Document> = ["node1", "node2", "node3"]
            .iter()
            .map(|m| h.replica(m))
            .collect();
        let writes = h.store.writes().len();

        let err = h
            .fleet
            .add_container(project.id.short(), spec("a", vec![PortRequest::auto(22)]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProvisioningFailed { .. }));

        assert_eq!(h.store.writes().len(), writes);
        for (host, doc) in ["node1", "node2", "node3"].iter().zip(before) {
            assert_eq!(h.replica(host), doc);
            assert!(h.replica(host).containers.is_empty());
        }
    }

    #[tokio::test]
    async fn unsupported_distro_never_reaches_the_runtime() {
        let (h, project) = Harness::cluster(FakeRuntime::new()).await;
        let mut request = spec("a", vec![PortRequest::auto(22)]);
        request.image = Some("ubuntu".into());
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(crate::runtime::NspawnRuntime::new(
            crate::ssh::SshClient::new("/nonexistent/ssh", std::time::Duration::from_secs(1)),
            crate::config::Config::default().nspawn_settings(),
        ));
        let replicator = Replicator::new(h.store.clone(), FailurePolicy::Abort, Arc::new(No));
        let fleet = Fleet::new(replicator, runtime, addr("node1"));

        let err = fleet
            .add_container(project.id.short(), request)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotImplemented(_)));
        assert!(h.replica("node1").containers.is_empty());
    }

    #[tokio::test]
    async fn removals_guard_dangling_references() {
        let (h, project) = Harness::cluster(FakeRuntime::new()).await;
        let c = h
            .fleet
            .add_container(project.id.short(), spec("a", vec![PortRequest::auto(22)]))
            .await
            .unwrap();

        let err = h.fleet.remove_machine(c.machine_id.short()).await.unwrap_err();
        assert!(matches!(err, Error::MachineInUse { containers: 1, .. }));
        let err = h.fleet.remove_project(project.id.short()).await.unwrap_err();
        assert!(matches!(err, Error::ProjectInUse { containers: 1, .. }));

        h.fleet
            .remove_container(project.id.short(), c.id.short(), false)
            .await
            .unwrap();
        assert!(h.replica("node1").containers.is_empty());
        assert!(h
            .runtime
            .calls()
            .iter()
            .any(|call| call.starts_with("deprovision a")));

        h.fleet.remove_project(project.id.short()).await.unwrap();
        // the first container lands on node1, whose own replica is left stale
        let removed = h.fleet.remove_machine(c.machine_id.short()).await.unwrap();
        assert_eq!(removed.host, "node1");
        assert_eq!(h.replica("node2").machines.len(), 2);
        assert_eq!(h.replica("node1").machines.len(), 3);
    }

    #[tokio::test]
    async fn forced_removal_tries_every_machine() {
        let (h, project) = Harness::cluster(FakeRuntime::new()).await;
        let c = h
            .fleet
            .add_container(project.id.short(), spec("a", vec![]))
            .await
            .unwrap();

        h.fleet
            .remove_container(project.id.short(), c.id.short(), true)
            .await
            .unwrap();
        let deprovisions = h
            .runtime
            .calls()
            .iter()
            .filter(|call| call.starts_with("deprovision"))
            .count();
        assert_eq!(deprovisions, 3);
    }

    #[tokio::test]
    async fn lifecycle_actions_target_the_owner() {
        let (h, project) = Harness::cluster(FakeRuntime::new()).await;
        let c = h
            .fleet
            .add_container(project.id.short(), spec("a", vec![]))
            .await
            .unwrap();

        h.fleet
            .set_running(project.id.short(), c.id.short(), DesiredState::Stopped)
            .await
            .unwrap();
        let last = h.runtime.calls().pop().unwrap();
        assert_eq!(last, format!("Stopped a on {}", c.host));

        assert!(matches!(
            h.fleet.migrate(project.id.short(), c.id.short()).await,
            Err(Error::NotImplemented(_))
        ));
    }

    #[tokio::test]
    async fn unknown_ids_are_named() {
        let (h, project) = Harness::cluster(FakeRuntime::new()).await;
        assert!(matches!(
            h.fleet.containers("ffffffffffff").await,
            Err(Error::UnknownProject(ref p)) if p == "ffffffffffff"
        ));
        assert!(matches!(
            h.fleet
                .remove_container(project.id.short(), "ffffffffffff", false)
                .await,
            Err(Error::UnknownContainer(_))
        ));
        assert!(matches!(
            h.fleet.remove_machine("ffffffffffff").await,
            Err(Error::UnknownMachine(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_member_aborts_without_writing() {
        let (h, project) = Harness::cluster(FakeRuntime::new()).await;
        h.store.cut(&addr("node3"));
        let writes = h.store.writes().len();

        let err = h.fleet.add_project("db").await.unwrap_err();
        assert!(matches!(err, Error::MachineUnreachable { .. }));
        assert_eq!(h.store.writes().len(), writes);
        assert_eq!(h.replica("node1").projects.len(), 1);
        assert!(h.replica("node1").projects.contains_key(&project.id));
    }

    #[tokio::test]
    async fn declined_question_aborts_like_abort() {
        let (h, project) = Harness::cluster_with_policy(FakeRuntime::new(), FailurePolicy::Ask).await;
        h.store.cut(&addr("node2"));
        let writes = h.store.writes().len();

        let err = h.fleet.add_project("db").await.unwrap_err();
        assert!(matches!(err, Error::MachineUnreachable { ref machine, .. } if machine.contains("node2")));
        assert_eq!(h.store.writes().len(), writes);
        assert_eq!(h.replica("node1").projects.len(), 1);
        assert!(h.replica("node3").projects.contains_key(&project.id));
    }

    #[tokio::test]
    async fn init_fails_when_nothing_was_written() {
        let h = Harness::with_policy(FakeRuntime::new(), FailurePolicy::Skip);
        h.store.cut(&addr("node1"));

        let err = h.fleet.init().await.unwrap_err();
        assert!(matches!(err, Error::PartialReplication { ref failed } if failed.len() == 1));
        assert!(h.store.writes().is_empty());
    }
}
