//! Capability negotiation and the message-id layout it implies.

use std::collections::BTreeMap;

use ethspv_protocol::messages::BASE_PROTOCOL_LENGTH;
use ethspv_protocol::Capability;

/// Capabilities both peers can use.
///
/// One entry per name advertised by both sides; the version kept is the
/// highest either side advertises for that name. The result is sorted by
/// name, and swapping the arguments gives the same result.
pub fn shared_capabilities(local: &[Capability], remote: &[Capability]) -> Vec<Capability> {
    let mut staged: BTreeMap<&str, u64> = BTreeMap::new();
    for cap in local {
        if !remote.iter().any(|r| r.name == cap.name) {
            continue;
        }
        let highest = local
            .iter()
            .chain(remote)
            .filter(|c| c.name == cap.name)
            .map(|c| c.version)
            .max()
            .unwrap_or(cap.version);
        staged.insert(&cap.name, highest);
    }
    staged
        .into_iter()
        .map(|(name, version)| Capability::new(name, version))
        .collect()
}

/// Versions the session actually runs.
///
/// For each name in [`shared_capabilities`], the highest version that the
/// local side implements and the remote also advertises. Names with no such
/// version are left out. Message ids are laid out from this list.
pub fn agreed_capabilities(local: &[Capability], remote: &[Capability]) -> Vec<Capability> {
    shared_capabilities(local, remote)
        .into_iter()
        .filter_map(|shared| {
            local
                .iter()
                .filter(|cap| cap.name == shared.name && remote.contains(cap))
                .map(|cap| cap.version)
                .max()
                .map(|version| Capability::new(shared.name, version))
        })
        .collect()
}

/// Where each negotiated capability's messages live in the id space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageIdMap {
    entries: Vec<(Capability, u64)>,
}

impl MessageIdMap {
    /// Lay `shared` out after the base protocol, in the order given.
    pub fn new(shared: &[Capability]) -> Self {
        let mut offset = BASE_PROTOCOL_LENGTH;
        let mut entries = Vec::with_capacity(shared.len());
        for cap in shared {
            entries.push((cap.clone(), offset));
            offset += cap.message_count();
        }
        Self { entries }
    }

    /// First id of the capability with `name`.
    pub fn offset(&self, name: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|(cap, _)| cap.name == name)
            .map(|(_, offset)| *offset)
    }

    /// Capability owning an absolute id, and the id relative to it.
    pub fn resolve(&self, code: u64) -> Option<(&Capability, u64)> {
        self.entries.iter().find_map(|(cap, offset)| {
            let end = offset + cap.message_count();
            (code >= *offset && code < end).then(|| (cap, code - offset))
        })
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &Capability> {
        self.entries.iter().map(|(cap, _)| cap)
    }
}
