//! Entity ownership over the current cluster members.
//!
//! Members are kept sorted and distinct so every node that sees the same
//! member set computes the same owner for an id.

use meridian_core::config::RoutingStrategy;
use meridian_core::types::{EntityId, PeerAddress};

/// An ordered, duplicate-free member list plus the routing rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    members: Vec<PeerAddress>,
    strategy: RoutingStrategy,
}

impl ClusterTopology {
    pub fn new(members: impl IntoIterator<Item = PeerAddress>, strategy: RoutingStrategy) -> Self {
        let mut members: Vec<PeerAddress> = members.into_iter().collect();
        members.sort();
        members.dedup();
        Self { members, strategy }
    }

    pub fn members(&self) -> &[PeerAddress] {
        &self.members
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, peer: &PeerAddress) -> bool {
        self.members.binary_search(peer).is_ok()
    }

    /// The member owning `id`, or `None` for an empty cluster.
    pub fn owner(&self, id: &EntityId) -> Option<&PeerAddress> {
        self.owner_index(id).map(|i| &self.members[i])
    }

    /// Index into [`members`](Self::members) of the owner of `id`.
    pub fn owner_index(&self, id: &EntityId) -> Option<usize> {
        if self.members.is_empty() {
            return None;
        }
        let key = stable_hash(id.as_str().as_bytes());
        match self.strategy {
            RoutingStrategy::Modulo => Some((key % self.members.len() as u64) as usize),
            RoutingStrategy::Rendezvous => self
                .members
                .iter()
                .enumerate()
                .map(|(i, peer)| (rendezvous_score(key, peer), i))
                .max_by_key(|(score, _)| *score)
                .map(|(_, i)| i),
        }
    }
}

/// FNV-1a over raw bytes. Stable across processes and platforms.
pub(crate) fn stable_hash(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x1000_0000_01b3;
    bytes.iter().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

fn rendezvous_score(key: u64, peer: &PeerAddress) -> u64 {
    let mut hash = key ^ 0x9e37_79b9_7f4a_7c15;
    for byte in peer.to_string().as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    }
    fmix64(hash)
}

/// Murmur3 finalizer; spreads peers that differ only in their last bytes.
fn fmix64(mut hash: u64) -> u64 {
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^ (hash >> 33)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn peers(n: u16) -> Vec<PeerAddress> {
        (0..n).map(|i| PeerAddress::new("10.0.0.1", 11800 + i)).collect()
    }

    fn ids(n: usize) -> Vec<EntityId> {
        (0..n).map(|i| EntityId::compose(202405011200, format!("svc-{i}"))).collect()
    }

    #[test]
    fn test_owner_is_deterministic_and_order_free() {
        for strategy in [RoutingStrategy::Rendezvous, RoutingStrategy::Modulo] {
            let forward = ClusterTopology::new(peers(4), strategy);
            let mut reversed = peers(4);
            reversed.reverse();
            reversed.push(PeerAddress::new("10.0.0.1", 11800));
            let backward = ClusterTopology::new(reversed, strategy);
            assert_eq!(backward.len(), 4);

            for id in ids(200) {
                assert_eq!(forward.owner(&id), forward.owner(&id));
                assert_eq!(forward.owner(&id), backward.owner(&id));
            }
        }
    }

    #[test]
    fn test_empty_cluster_has_no_owner() {
        let topology = ClusterTopology::new(Vec::new(), RoutingStrategy::Rendezvous);
        assert!(topology.owner(&EntityId::new("x")).is_none());
    }

    #[test]
    fn test_rendezvous_spreads_load() {
        let topology = ClusterTopology::new(peers(3), RoutingStrategy::Rendezvous);
        let mut counts: HashMap<PeerAddress, usize> = HashMap::new();
        for id in ids(3000) {
            *counts.entry(topology.owner(&id).unwrap().clone()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c > 500), "{counts:?}");
    }

    #[test]
    fn test_rendezvous_moves_only_the_departed_share() {
        let before = ClusterTopology::new(peers(4), RoutingStrategy::Rendezvous);
        let departed = PeerAddress::new("10.0.0.1", 11803);
        let after = ClusterTopology::new(
            peers(4).into_iter().filter(|p| *p != departed),
            RoutingStrategy::Rendezvous,
        );
        for id in ids(1000) {
            let old = before.owner(&id).unwrap();
            if *old != departed {
                assert_eq!(after.owner(&id), Some(old));
            }
        }
    }
}
