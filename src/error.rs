//! Error taxonomy shared by the replication core and the command layer.

use thiserror::Error;

/// Errors surfaced by cluster state operations.
///
/// Every variant carries enough context to print a one-line diagnostic
/// naming the offending machine, id or name.
#[derive(Debug, Error)]
pub enum Error {
    /// The bootstrap machine could not be read or its replica did not parse.
    #[error("bootstrap machine {uri} unavailable: {reason}")]
    BootstrapUnavailable { uri: String, reason: String },

    /// A fleet member did not respond and the operator chose to abort.
    #[error("machine {machine} unreachable: {reason}")]
    MachineUnreachable { machine: String, reason: String },

    /// Writes failed on some machines after the reachability pre-flight.
    #[error("state written partially, failed on: {}", .failed.join(", "))]
    PartialReplication { failed: Vec<String> },

    /// Short id matched zero or several candidates.
    #[error("id {short} is ambiguous or unknown ({matches} matches)")]
    AmbiguousOrNotFound { short: String, matches: usize },

    #[error("unknown machine {0}")]
    UnknownMachine(String),

    #[error("unknown project {0}")]
    UnknownProject(String),

    #[error("unknown container {0}")]
    UnknownContainer(String),

    /// A machine address or project name is already registered.
    #[error("{kind} {name} already exists")]
    DuplicateName { kind: &'static str, name: String },

    #[error("no machines available for placement")]
    NoMachinesAvailable,

    /// Host port requested twice within a single allocation.
    #[error("host port {0} requested more than once")]
    PortConflict(u16),

    #[error("no free host port for container port {0}")]
    NoFreePort(u16),

    /// Merged state references machines or projects it does not contain.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("machine {machine} still hosts {containers} container(s)")]
    MachineInUse { machine: String, containers: usize },

    #[error("project {project} still owns {containers} container(s)")]
    ProjectInUse { project: String, containers: usize },

    #[error("invalid machine address {0:?}")]
    InvalidAddress(String),

    #[error("invalid port list {0:?}")]
    InvalidPorts(String),

    #[error("provisioning failed on {machine}: {reason}")]
    ProvisioningFailed { machine: String, reason: String },

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// The remote command channel failed.
    #[error("remote command on {machine} failed: {reason}")]
    Remote { machine: String, reason: String },

    #[error("preferences: {0}")]
    Preferences(String),

    #[error("operation aborted by operator")]
    Aborted,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit status for this error. Every kind maps to its own code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::BootstrapUnavailable { .. } => 10,
            Error::MachineUnreachable { .. } => 11,
            Error::PartialReplication { .. } => 12,
            Error::AmbiguousOrNotFound { .. } => 20,
            Error::UnknownMachine(_) => 21,
            Error::UnknownProject(_) => 22,
            Error::UnknownContainer(_) => 23,
            Error::DuplicateName { .. } => 24,
            Error::NoMachinesAvailable => 30,
            Error::PortConflict(_) => 31,
            Error::NoFreePort(_) => 32,
            Error::IntegrityViolation(_) => 40,
            Error::MachineInUse { .. } => 41,
            Error::ProjectInUse { .. } => 42,
            Error::InvalidAddress(_) => 50,
            Error::InvalidPorts(_) => 51,
            Error::ProvisioningFailed { .. } => 60,
            Error::NotImplemented(_) => 61,
            Error::Remote { .. } => 62,
            Error::Preferences(_) => 70,
            Error::Aborted => 71,
            Error::Serialization(_) => 72,
            Error::Io(_) => 73,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
