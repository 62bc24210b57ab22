//! Host port allocation.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::types::{Document, Machine, PortRequest};

/// Ports below this are shifted up by the same amount before probing.
const EPHEMERAL_BASE: u32 = 10_000;

/// Choose host ports for `requested` on `machine`.
///
/// Requests are handled in order. A pinned host port is used as-is, but
/// pinning a port this call already handed out fails with
/// [`Error::PortConflict`]. Pinned ports are not checked against other
/// containers on the machine. An unpinned request starts at the container
/// port (plus 10000 when below 10000) and probes upward past every port in
/// use on the machine or already allocated by this call.
pub fn allocate(
    doc: &Document,
    machine: &Machine,
    requested: &[PortRequest],
) -> Result<BTreeMap<u16, u16>> {
    let mut used: BTreeSet<u16> = doc
        .containers_on(&machine.id)
        .flat_map(|c| c.ports.keys().copied())
        .collect();
    let mut allocated = BTreeMap::new();

    for request in requested {
        let host_port = match request.host {
            Some(port) => {
                if allocated.contains_key(&port) {
                    return Err(Error::PortConflict(port));
                }
                port
            }
            None => probe(&used, request.container)?,
        };
        used.insert(host_port);
        allocated.insert(host_port, request.container);
    }

    Ok(allocated)
}

fn probe(used: &BTreeSet<u16>, container_port: u16) -> Result<u16> {
    let mut candidate = u32::from(container_port);
    if candidate < EPHEMERAL_BASE {
        candidate += EPHEMERAL_BASE;
    }

    (candidate..=u32::from(u16::MAX))
        .filter_map(|p| u16::try_from(p).ok())
        .find(|p| !used.contains(p))
        .ok_or(Error::NoFreePort(container_port))
}
