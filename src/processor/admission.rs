use std::collections::BTreeMap;

use crate::data_model::{NodeConfig, NodeId, QueueMethod};

#[derive(Debug, Clone)]
pub struct NodeCapacity {
    pub in_flight: usize,
    pub max_submit: usize,
    pub queue_method: QueueMethod,
}

impl NodeCapacity {
    pub fn remaining(&self) -> usize {
        self.max_submit.saturating_sub(self.in_flight)
    }
}

/// Per-cycle admission control: one capacity slot per dispatched sequence,
/// bounded by the configured per-node maximum. Rebuilt from the durable
/// remote-queue indexes every cycle, so counts converge with reality even
/// after a crash.
///
/// Node selection is first-fit in registry-file order; no load balancing.
#[derive(Debug, Clone, Default)]
pub struct CapacityTable {
    entries: Vec<(NodeId, NodeCapacity)>,
}

impl CapacityTable {
    /// A node missing from `counts` is treated as idle: full capacity up to
    /// the configured maximum, never unlimited.
    pub fn build(
        registry: &[NodeConfig],
        counts: &BTreeMap<NodeId, usize>,
        max_submit: usize,
    ) -> CapacityTable {
        let entries = registry
            .iter()
            .map(|node| {
                (
                    node.id.clone(),
                    NodeCapacity {
                        in_flight: counts.get(&node.id).copied().unwrap_or(0),
                        max_submit,
                        queue_method: node.queue_method,
                    },
                )
            })
            .collect();
        CapacityTable { entries }
    }

    pub fn has_available_node(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, capacity)| capacity.in_flight < capacity.max_submit)
    }

    pub fn remaining_capacity(&self, node: &NodeId) -> usize {
        self.entries
            .iter()
            .find(|(id, _)| id == node)
            .map(|(_, capacity)| capacity.remaining())
            .unwrap_or(0)
    }

    pub fn in_flight(&self, node: &NodeId) -> usize {
        self.entries
            .iter()
            .find(|(id, _)| id == node)
            .map(|(_, capacity)| capacity.in_flight)
            .unwrap_or(0)
    }

    /// First node with spare capacity, in registry order.
    pub fn first_fit(&self) -> Option<NodeId> {
        self.entries
            .iter()
            .find(|(_, capacity)| capacity.remaining() > 0)
            .map(|(id, _)| id.clone())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Accounts sequences dispatched within the current cycle so the
    /// capacity invariant holds before the durable counts are rebuilt.
    pub fn reserve(&mut self, node: &NodeId, seqs: usize) {
        if let Some((_, capacity)) = self.entries.iter_mut().find(|(id, _)| id == node) {
            capacity.in_flight += seqs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::test_objects::tests::mock_registry;

    #[test]
    fn unknown_counts_default_to_idle_not_unlimited() {
        let registry = mock_registry(&["n1"]);
        let table = CapacityTable::build(&registry, &BTreeMap::new(), 3);
        assert_eq!(table.remaining_capacity(&NodeId::from("n1")), 3);
        // a node absent from the registry has no capacity at all
        assert_eq!(table.remaining_capacity(&NodeId::from("ghost")), 0);
    }

    #[test]
    fn first_fit_follows_registry_order() {
        let registry = mock_registry(&["n2", "n1"]);
        let table = CapacityTable::build(&registry, &BTreeMap::new(), 2);
        assert_eq!(table.first_fit(), Some(NodeId::from("n2")));

        let mut counts = BTreeMap::new();
        counts.insert(NodeId::from("n2"), 2);
        let table = CapacityTable::build(&registry, &counts, 2);
        assert_eq!(table.first_fit(), Some(NodeId::from("n1")));
    }

    #[test]
    fn capacity_never_exceeds_the_maximum() {
        let registry = mock_registry(&["n1"]);
        let mut counts = BTreeMap::new();
        // stale index claiming more than the quota
        counts.insert(NodeId::from("n1"), 9);
        let table = CapacityTable::build(&registry, &counts, 2);
        assert_eq!(table.remaining_capacity(&NodeId::from("n1")), 0);
        assert!(!table.has_available_node());
        assert_eq!(table.first_fit(), None);
    }

    #[test]
    fn reserve_consumes_capacity_within_a_cycle() {
        let registry = mock_registry(&["n1", "n2"]);
        let mut table = CapacityTable::build(&registry, &BTreeMap::new(), 2);
        table.reserve(&NodeId::from("n1"), 2);
        assert_eq!(table.remaining_capacity(&NodeId::from("n1")), 0);
        assert_eq!(table.first_fit(), Some(NodeId::from("n2")));
        assert!(table.has_available_node());
    }
}
