//! Shard placement: pure functions from a key's bucket field to the servers
//! that own it.
//!
//! A shard's replicas form a ring segment of length R starting at the shard
//! index; the segment's first server is the primary and clients route to it
//! exclusively. Replica reads are a documented extension, not current
//! behavior.
use crate::MAX_SERVERS;
use color_eyre::eyre::{ensure, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementConfig {
    num_servers: usize,
    num_shards: usize,
    replication_factor: usize,
}

impl PlacementConfig {
    pub fn new(num_servers: usize, num_shards: usize, replication_factor: usize) -> Result<Self> {
        ensure!(
            num_servers >= 1 && num_servers <= MAX_SERVERS,
            "num_servers {} outside [1, {}]",
            num_servers,
            MAX_SERVERS
        );
        ensure!(num_shards >= 1, "num_shards must be at least 1");
        ensure!(
            replication_factor >= 1 && replication_factor <= num_servers,
            "replication_factor {} outside [1, num_servers = {}]",
            replication_factor,
            num_servers
        );
        Ok(PlacementConfig {
            num_servers,
            num_shards,
            replication_factor,
        })
    }

    pub fn num_servers(&self) -> usize {
        self.num_servers
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    #[inline]
    pub fn shard_of(&self, bucket: u32) -> usize {
        bucket as usize % self.num_shards
    }

    #[inline]
    pub fn primary_of(&self, shard: usize) -> usize {
        shard % self.num_servers
    }

    /// The ring segment of length R starting at the shard.
    pub fn replicas_of(&self, shard: usize) -> Vec<usize> {
        (0..self.replication_factor)
            .map(|i| (shard + i) % self.num_servers)
            .collect()
    }

    pub fn owns(&self, server: usize, shard: usize) -> bool {
        (0..self.replication_factor).any(|i| (shard + i) % self.num_servers == server)
    }

    pub fn key_belongs_to(&self, bucket: u32, server: usize) -> bool {
        self.owns(server, self.shard_of(bucket))
    }

    /// The server a client routes requests for `bucket` to.
    #[inline]
    pub fn route_of(&self, bucket: u32) -> usize {
        self.primary_of(self.shard_of(bucket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn rejects_invalid_configurations() {
        assert!(PlacementConfig::new(0, 4, 1).is_err());
        assert!(PlacementConfig::new(MAX_SERVERS + 1, 4, 1).is_err());
        assert!(PlacementConfig::new(4, 0, 1).is_err());
        assert!(PlacementConfig::new(4, 4, 0).is_err());
        assert!(PlacementConfig::new(4, 4, 5).is_err());
    }

    #[test]
    fn primary_is_unique_and_replicas_distinct() {
        // P1 over a sweep of configurations.
        for n in 1..=8usize {
            for h in 1..=16usize {
                for r in 1..=n {
                    let placement = PlacementConfig::new(n, h, r).unwrap();
                    for bucket in 0..1024u32 {
                        let shard = placement.shard_of(bucket);
                        let replicas = placement.replicas_of(shard);
                        assert_eq!(replicas.len(), r);
                        let mut distinct = replicas.clone();
                        distinct.sort_unstable();
                        distinct.dedup();
                        assert_eq!(distinct.len(), r);
                        assert_eq!(placement.primary_of(shard), replicas[0]);
                    }
                }
            }
        }
    }

    #[test]
    fn ownership_matches_ring_containment() {
        // P2: owns(s, sh) iff s is in replicas_of(sh).
        let placement = PlacementConfig::new(5, 13, 3).unwrap();
        for shard in 0..13 {
            let replicas = placement.replicas_of(shard);
            for server in 0..5 {
                assert_eq!(placement.owns(server, shard), replicas.contains(&server));
            }
        }
    }

    #[test]
    fn replication_three_placement_table() {
        let placement = PlacementConfig::new(4, 4, 3).unwrap();
        assert_eq!(placement.replicas_of(0), vec![0, 1, 2]);
        assert_eq!(placement.replicas_of(1), vec![1, 2, 3]);
        assert_eq!(placement.replicas_of(2), vec![2, 3, 0]);
        assert_eq!(placement.replicas_of(3), vec![3, 0, 1]);
    }

    #[test]
    fn full_replication_owns_everything() {
        let placement = PlacementConfig::new(4, 4, 4).unwrap();
        for shard in 0..4 {
            for server in 0..4 {
                assert!(placement.owns(server, shard));
            }
        }
    }

    #[test]
    fn single_shard_routes_to_one_server() {
        let placement = PlacementConfig::new(4, 1, 1).unwrap();
        for bucket in [0u32, 1, 77, u32::MAX] {
            assert_eq!(placement.shard_of(bucket), 0);
            assert_eq!(placement.route_of(bucket), 0);
        }
    }

    #[test]
    fn bucket_zero_routes_to_server_zero() {
        let placement = PlacementConfig::new(4, 8, 2).unwrap();
        assert_eq!(placement.route_of(0), 0);
        assert!(placement.key_belongs_to(0, 0));
        assert!(placement.key_belongs_to(0, 1));
        assert!(!placement.key_belongs_to(0, 2));
    }

    fn routing_fractions(placement: &PlacementConfig, samples: usize) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut counts = vec![0usize; placement.num_servers()];
        for _ in 0..samples {
            counts[placement.route_of(rng.gen::<u32>())] += 1;
        }
        counts
            .into_iter()
            .map(|c| c as f64 / samples as f64)
            .collect()
    }

    #[test]
    fn uniform_keys_spread_evenly_across_four_servers() {
        for h in [4usize, 8] {
            let placement = PlacementConfig::new(4, h, 1).unwrap();
            for frac in routing_fractions(&placement, 200_000) {
                assert!((frac - 0.25).abs() < 0.01, "fraction {} off 25%", frac);
            }
        }
    }

    #[test]
    fn uniform_keys_split_between_two_servers() {
        let placement = PlacementConfig::new(2, 4, 1).unwrap();
        for frac in routing_fractions(&placement, 200_000) {
            assert!((frac - 0.5).abs() < 0.01, "fraction {} off 50%", frac);
        }
    }

    #[test]
    fn replication_does_not_change_primary_routing() {
        let primary_only = PlacementConfig::new(4, 4, 1).unwrap();
        let replicated = PlacementConfig::new(4, 4, 3).unwrap();
        for bucket in 0..4096u32 {
            assert_eq!(primary_only.route_of(bucket), replicated.route_of(bucket));
        }
    }
}
