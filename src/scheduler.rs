//! Placement of new containers.

use std::collections::BTreeMap;

use log::debug;

use crate::error::{Error, Result};
use crate::id::Id;
use crate::types::{Document, Machine};

/// Pick the machine that should host a new container.
///
/// A hint wins outright. Otherwise the least occupied machine is chosen,
/// where occupancy is one plus the number of containers placed on it; ties
/// go to the smallest machine id. An empty cluster places on the machine
/// with the smallest host name.
pub fn select_machine<'a>(doc: &'a Document, hint: Option<&Id>) -> Result<&'a Machine> {
    if let Some(id) = hint {
        return doc
            .machines
            .get(id)
            .ok_or_else(|| Error::UnknownMachine(id.to_string()));
    }

    if doc.machines.is_empty() {
        return Err(Error::NoMachinesAvailable);
    }

    if doc.containers.is_empty() {
        return doc
            .machines
            .values()
            .min_by(|a, b| a.host.cmp(&b.host).then_with(|| a.id.cmp(&b.id)))
            .ok_or(Error::NoMachinesAvailable);
    }

    let mut occupancy: BTreeMap<&Id, usize> = doc.machines.keys().map(|id| (id, 1)).collect();
    for container in doc.containers.values() {
        *occupancy.entry(&container.machine_id).or_insert(1) += 1;
    }
    debug!("machine occupancy: {:?}", occupancy);

    // min_by_key keeps the first minimum, and the map iterates in id order.
    // Counted ids that are not registered machines cannot host anything.
    occupancy
        .into_iter()
        .filter_map(|(id, count)| doc.machines.get(id).map(|m| (m, count)))
        .min_by_key(|(_, count)| *count)
        .map(|(machine, _)| machine)
        .ok_or(Error::NoMachinesAvailable)
}
