use crate::raft::NodeId;
use std::collections::BTreeMap;

/// Which members replicate which partition.
///
/// Partition ids start at 1. Replicas are assigned round robin over the
/// members sorted by node id, so partition `p` starts at member `p - 1`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    partitions: BTreeMap<u32, Vec<NodeId>>,
}

impl Topology {
    pub fn round_robin(members: &[NodeId], partition_count: u32, replication_factor: usize) -> Self {
        let mut members = members.to_vec();
        members.sort_unstable();
        members.dedup();
        let replication_factor = replication_factor.min(members.len());

        let partitions = (1..=partition_count)
            .map(|partition_id| {
                let start = (partition_id as usize - 1) % members.len().max(1);
                let replicas = (0..replication_factor)
                    .map(|i| members[(start + i) % members.len()])
                    .collect();
                (partition_id, replicas)
            })
            .collect();
        Self { partitions }
    }

    pub fn partition_ids(&self) -> Vec<u32> {
        self.partitions.keys().copied().collect()
    }

    pub fn replicas(&self, partition_id: u32) -> &[NodeId] {
        self.partitions
            .get(&partition_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Partitions with a replica on `node_id`.
    pub fn partitions_of(&self, node_id: NodeId) -> Vec<u32> {
        self.partitions
            .iter()
            .filter(|(_, replicas)| replicas.contains(&node_id))
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_assignment() {
        let topology = Topology::round_robin(&[3, 1, 2], 4, 2);
        assert_eq!(topology.partition_ids(), vec![1, 2, 3, 4]);
        assert_eq!(topology.replicas(1), &[1, 2]);
        assert_eq!(topology.replicas(2), &[2, 3]);
        assert_eq!(topology.replicas(3), &[3, 1]);
        assert_eq!(topology.replicas(4), &[1, 2]);
        assert_eq!(topology.partitions_of(3), vec![2, 3]);
        assert!(topology.replicas(5).is_empty());
    }

    #[test]
    fn test_replication_factor_is_capped_by_members() {
        let topology = Topology::round_robin(&[1], 2, 3);
        assert_eq!(topology.replicas(1), &[1]);
        assert_eq!(topology.replicas(2), &[1]);
    }
}
