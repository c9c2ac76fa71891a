//! Fixed cluster membership and quorum arithmetic.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One cluster member: id, reachable address, and the bit index it occupies
/// in quorum bitmasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub id: i64,
    pub addr: String,

    /// Unique 0..N-1 bit index in quorum bitmasks.
    pub position: u32,
}

/// Immutable-after-startup cluster configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub members: HashMap<i64, ReplicaInfo>,
}

impl ClusterConfig {
    /// Builds a config from an id -> address table; quorum bit positions
    /// are assigned in ascending id order.
    pub fn from_addrs(addrs: HashMap<i64, String>) -> Self {
        let mut ids: Vec<i64> = addrs.keys().copied().collect();
        ids.sort_unstable();

        let members = ids
            .into_iter()
            .enumerate()
            .map(|(position, id)| {
                (
                    id,
                    ReplicaInfo {
                        id,
                        addr: addrs[&id].clone(),
                        position: position as u32,
                    },
                )
            })
            .collect();

        ClusterConfig { members }
    }

    /// Strict-majority test over a position bitmask.
    pub fn is_quorum(&self, mask: u64) -> bool {
        (mask.count_ones() as usize) * 2 > self.members.len()
    }

    /// The bitmask bit of member `id`.
    pub fn position_bit(&self, id: i64) -> u64 {
        1u64 << self.members[&id].position
    }
}

#[cfg(test)]
mod cluster_tests {
    use super::*;

    fn config_of(ids: &[i64]) -> ClusterConfig {
        ClusterConfig::from_addrs(
            ids.iter()
                .map(|&id| (id, format!("127.0.0.1:{}", 31000 + id)))
                .collect(),
        )
    }

    #[test]
    fn positions_by_id_order() {
        let config = config_of(&[3, 1, 2]);
        assert_eq!(config.members[&1].position, 0);
        assert_eq!(config.members[&2].position, 1);
        assert_eq!(config.members[&3].position, 2);
        assert_eq!(config.position_bit(3), 0b100);
    }

    #[test]
    fn quorum_of_three() {
        let config = config_of(&[1, 2, 3]);
        assert!(!config.is_quorum(0b000));
        assert!(!config.is_quorum(0b001));
        assert!(config.is_quorum(0b011));
        assert!(config.is_quorum(0b111));
    }

    #[test]
    fn quorum_of_five() {
        let config = config_of(&[0, 1, 2, 3, 4]);
        assert!(!config.is_quorum(0b00011));
        assert!(config.is_quorum(0b00111));
        assert!(config.is_quorum(0b11011));
    }

    #[test]
    fn quorum_of_one() {
        let config = config_of(&[1]);
        assert!(!config.is_quorum(0));
        assert!(config.is_quorum(1));
    }

    #[test]
    fn clone_is_deep() {
        let config = config_of(&[1, 2, 3]);
        let mut cl = config.clone();
        cl.members.remove(&1);
        assert_eq!(config.members.len(), 3);
    }
}
