//! Data structures replicated across the fleet.
//!
//! The whole [`Document`] is serialised with [`serde`](https://serde.rs/)
//! and written verbatim to every machine.  Collections are ordered maps so
//! that the serialised form is stable for identical contents.  There is no
//! version or timestamp on the document or its entries; when replicas
//! disagree the merge order decides.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::Id;

/// Default remote login user.
pub const DEFAULT_USER: &str = "root";

/// Default port of the remote command channel.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// A fleet member reachable over the remote command channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: Id,
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl Machine {
    pub fn new(id: Id, addr: MachineAddr) -> Self {
        Self {
            id,
            user: addr.user,
            host: addr.host,
            port: addr.port,
        }
    }

    pub fn addr(&self) -> MachineAddr {
        MachineAddr {
            user: self.user.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// A namespace for containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: Id,
    pub name: String,
}

/// A container placed on one machine.
///
/// `ports` maps host port to container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: Id,
    pub project_id: Id,
    pub machine_id: Id,
    pub host: String,
    pub name: String,
    pub ports: BTreeMap<u16, u16>,
    pub distro: String,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

/// The unit of replication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub machines: BTreeMap<Id, Machine>,
    #[serde(default)]
    pub projects: BTreeMap<Id, Project>,
    #[serde(default)]
    pub containers: BTreeMap<Id, Container>,
}

impl Document {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn machine_by_host(&self, host: &str) -> Option<&Machine> {
        self.machines.values().find(|m| m.host == host)
    }

    pub fn project_by_name(&self, name: &str) -> Option<&Project> {
        self.projects.values().find(|p| p.name == name)
    }

    pub fn containers_on<'a>(&'a self, machine_id: &'a Id) -> impl Iterator<Item = &'a Container> {
        self.containers
            .values()
            .filter(move |c| &c.machine_id == machine_id)
    }

    pub fn containers_in<'a>(&'a self, project_id: &'a Id) -> impl Iterator<Item = &'a Container> {
        self.containers
            .values()
            .filter(move |c| &c.project_id == project_id)
    }

    /// Check that every container references a machine and a project
    /// present in this document.
    pub fn validate(&self) -> Result<()> {
        let mut dangling = Vec::new();
        for c in self.containers.values() {
            if !self.machines.contains_key(&c.machine_id) {
                dangling.push(format!(
                    "container {} references missing machine {}",
                    c.id.short(),
                    c.machine_id.short()
                ));
            }
            if !self.projects.contains_key(&c.project_id) {
                dangling.push(format!(
                    "container {} references missing project {}",
                    c.id.short(),
                    c.project_id.short()
                ));
            }
        }

        if dangling.is_empty() {
            Ok(())
        } else {
            Err(Error::IntegrityViolation(dangling.join("; ")))
        }
    }
}

/// `user@host:port` address of a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineAddr {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl FromStr for MachineAddr {
    type Err = Error;

    /// Parses `[user@]host[:port]`, defaulting to `root` and port 22.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidAddress(s.to_string());
        let s = s.trim();

        let (user, rest) = match s.split_once('@') {
            Some((user, rest)) => (user, rest),
            None => (DEFAULT_USER, s),
        };
        let (host, port) = match rest.split_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (rest, DEFAULT_SSH_PORT),
        };

        if user.is_empty() || host.is_empty() || host.contains('@') {
            return Err(invalid());
        }

        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for MachineAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// One requested port mapping. `host` is `None` when the allocator
/// should pick the host port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRequest {
    pub host: Option<u16>,
    pub container: u16,
}

impl PortRequest {
    pub fn auto(container: u16) -> Self {
        Self {
            host: None,
            container,
        }
    }

    pub fn pinned(host: u16, container: u16) -> Self {
        Self {
            host: Some(host),
            container,
        }
    }
}

/// Parse `HOST:CONTAINER[,CONTAINER,...]` into ordered port requests.
pub fn parse_ports(s: &str) -> Result<Vec<PortRequest>> {
    let invalid = || Error::InvalidPorts(s.to_string());
    let port = |p: &str| p.trim().parse::<u16>().map_err(|_| invalid());

    s.split(',')
        .map(|item| match item.split_once(':') {
            Some((host, container)) => Ok(PortRequest::pinned(port(host)?, port(container)?)),
            None => Ok(PortRequest::auto(port(item)?)),
        })
        .collect()
}
