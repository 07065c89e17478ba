//! Candidate nodes for outbound connections, scored by past success.
//!
//! Selection picks the eligible node with the lowest score that is not
//! currently in use, oldest first on ties. A failed node stays in the table
//! (so rediscovery doesn't re-add it) but is never selected again.

use std::collections::{HashMap, HashSet};

use ethspv_protocol::discovery::Node;
use ethspv_protocol::NodeId;

#[derive(Debug, Clone)]
struct NodeRecord {
    node: Node,
    score: u32,
    eligible: bool,
    /// Already queried by a discovery lookup.
    discovery_used: bool,
    /// Insertion sequence, for stable ordering.
    seq: u64,
}

#[derive(Debug)]
pub struct NodeTable {
    local_id: NodeId,
    records: HashMap<NodeId, NodeRecord>,
    in_use: HashSet<NodeId>,
    next_seq: u64,
}

impl NodeTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            records: HashMap::new(),
            in_use: HashSet::new(),
            next_seq: 0,
        }
    }

    /// Add nodes, skipping ourselves and ids already known. Returns how many
    /// were new.
    pub fn add(&mut self, nodes: impl IntoIterator<Item = Node>) -> usize {
        let mut added = 0;
        for node in nodes {
            if node.id == self.local_id || self.records.contains_key(&node.id) {
                continue;
            }
            let seq = self.next_seq;
            self.next_seq += 1;
            self.records.insert(
                node.id,
                NodeRecord {
                    node,
                    score: 0,
                    eligible: true,
                    discovery_used: false,
                    seq,
                },
            );
            added += 1;
        }
        if added > 0 {
            tracing::debug!(added, total = self.records.len(), "nodes: added");
        }
        added
    }

    fn least_score(&self) -> Option<&NodeRecord> {
        self.records
            .values()
            .filter(|r| r.eligible && !self.in_use.contains(&r.node.id))
            .min_by_key(|r| (r.score, r.seq))
    }

    /// Eligible, not in use, lowest score. Does not mark it in use.
    pub fn least_score_node(&self) -> Option<&Node> {
        self.least_score().map(|r| &r.node)
    }

    /// Pick the next node to dial and mark it in use until
    /// [`mark_success`](Self::mark_success) or [`mark_failed`](Self::mark_failed).
    pub fn next_for_connection(&mut self) -> Option<Node> {
        let node = self.least_score()?.node;
        self.in_use.insert(node.id);
        Some(node)
    }

    pub fn has_fresh(&self) -> bool {
        self.least_score().is_some()
    }

    pub fn mark_success(&mut self, id: &NodeId) {
        self.in_use.remove(id);
        if let Some(record) = self.records.get_mut(id) {
            record.score = record.score.saturating_add(1);
        }
    }

    pub fn mark_failed(&mut self, id: &NodeId) {
        self.in_use.remove(id);
        if let Some(record) = self.records.get_mut(id) {
            record.eligible = false;
        }
    }

    /// Up to `count` nodes never queried by discovery, oldest first. They
    /// are marked as queried.
    pub fn take_unused_for_discovery(&mut self, count: usize) -> Vec<Node> {
        let mut unused: Vec<&mut NodeRecord> = self
            .records
            .values_mut()
            .filter(|r| !r.discovery_used)
            .collect();
        unused.sort_by_key(|r| r.seq);
        unused
            .into_iter()
            .take(count)
            .map(|r| {
                r.discovery_used = true;
                r.node
            })
            .collect()
    }

    /// Drop a node entirely (e.g. it never answered discovery).
    pub fn remove(&mut self, id: &NodeId) -> bool {
        self.in_use.remove(id);
        self.records.remove(id).is_some()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.records.get(id).map(|r| &r.node)
    }

    /// Up to `count` known nodes, oldest first, for answering FindNode.
    pub fn sample(&self, count: usize) -> Vec<Node> {
        let mut records: Vec<&NodeRecord> = self.records.values().collect();
        records.sort_by_key(|r| r.seq);
        records.into_iter().take(count).map(|r| r.node).collect()
    }

    pub fn score(&self, id: &NodeId) -> Option<u32> {
        self.records.get(id).map(|r| r.score)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
