//! drove-kv: a partitioned, in-memory key-value store served over an
//! RDMA-style fabric.
//!
//! Clients deposit fixed-size request records into per-worker request
//! regions with one-sided writes; workers busy-poll their columns, execute
//! against a single-threaded log-structured engine, and answer over
//! unreliable datagrams. The key space is sharded and each shard is placed
//! on a ring segment of servers; clients route to the primary.
pub mod client;
pub mod engine;
pub mod master;
pub mod placement;
pub mod run_datapath;
pub mod wire;
pub mod worker;

use color_eyre::eyre::{ensure, Result};
use drove_fabric::{region::RegionLayout, PeerId};

/// Maximum number of servers in the cluster.
pub const MAX_SERVERS: usize = 16;
pub const DEFAULT_NUM_SERVERS: usize = 4;
pub const DEFAULT_NUM_SHARDS: usize = 4;
pub const DEFAULT_REPLICATION_FACTOR: usize = 3;

pub const NUM_WORKERS: usize = 12;
pub const NUM_CLIENTS: usize = 70;

/// Outstanding requests kept by each client per (server, worker) pair.
pub const WINDOW_SIZE: usize = 32;

/// One send in every `UNSIG_BATCH` is signalled.
pub const UNSIG_BATCH: usize = 64;

pub const MAX_SERVER_PORTS: usize = 4;

/// SHM key for the first request region created by a master; one per server
/// port, consecutive from here.
pub const MASTER_SHM_KEY: u32 = 24;

/// Size of the preloaded client key array.
pub const NUM_KEYS: usize = 8 * 1024 * 1024;

pub const VALUE_SIZE: usize = 32;

/// Index buckets per worker engine.
pub const NUM_BKTS: usize = 2 * 1024 * 1024;

/// Circular log bytes per worker engine.
pub const LOG_CAP: usize = 1024 * 1024 * 1024;

/// Completed-request interval between statistics reports.
pub const K_512: usize = 524288;

/// Datagram peer ids below this belong to clients (their global ids);
/// worker reply endpoints live above it.
pub const WORKER_PEER_BASE: PeerId = 1 << 16;

const MAX_WORKERS_PER_SERVER: usize = 256;

/// Datagram peer id of worker `wn` on server `server_id`.
pub fn worker_peer_id(server_id: usize, wn: usize) -> PeerId {
    debug_assert!(wn < MAX_WORKERS_PER_SERVER);
    WORKER_PEER_BASE + server_id * MAX_WORKERS_PER_SERVER + wn
}

/// Inverse of [`worker_peer_id`]; `None` for client peers.
pub fn peer_to_worker(peer: PeerId) -> Option<(usize, usize)> {
    if peer < WORKER_PEER_BASE {
        return None;
    }
    let idx = peer - WORKER_PEER_BASE;
    Some((idx / MAX_WORKERS_PER_SERVER, idx % MAX_WORKERS_PER_SERVER))
}

/// Deployment-time sizing for one server's data plane. Tests shrink these;
/// production uses the defaults.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub num_workers: usize,
    pub num_clients: usize,
    pub window_size: usize,
    pub max_value: usize,
    pub num_buckets: usize,
    pub log_capacity: usize,
    pub num_keys: usize,
    pub postlist: usize,
    pub unsig_batch: usize,
    pub base_shm_key: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            num_workers: NUM_WORKERS,
            num_clients: NUM_CLIENTS,
            window_size: WINDOW_SIZE,
            max_value: VALUE_SIZE,
            num_buckets: NUM_BKTS,
            log_capacity: LOG_CAP,
            num_keys: NUM_KEYS,
            postlist: 16,
            unsig_batch: UNSIG_BATCH,
            base_shm_key: MASTER_SHM_KEY,
        }
    }
}

impl StoreConfig {
    pub fn layout(&self) -> Result<RegionLayout> {
        RegionLayout::new(
            self.num_workers,
            self.num_clients,
            self.window_size,
            wire::slot_size(self.max_value),
        )
    }

    /// SHM key of the request region behind `port_index`.
    pub fn shm_key(&self, port_index: usize) -> Result<u32> {
        ensure!(
            port_index < MAX_SERVER_PORTS,
            "Port index {} exceeds the {} supported server ports",
            port_index,
            MAX_SERVER_PORTS
        );
        Ok(self.base_shm_key + port_index as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_peer_ids_round_trip_and_avoid_client_space() {
        let peer = worker_peer_id(3, 7);
        assert!(peer >= WORKER_PEER_BASE);
        assert_eq!(peer_to_worker(peer), Some((3, 7)));
        assert_eq!(peer_to_worker(42), None);
    }

    #[test]
    fn default_config_produces_one_line_slots() {
        let cfg = StoreConfig::default();
        let layout = cfg.layout().unwrap();
        assert_eq!(layout.slot_size, drove_fabric::region::CACHE_LINE_SIZE);
        assert_eq!(cfg.shm_key(2).unwrap(), MASTER_SHM_KEY + 2);
        assert!(cfg.shm_key(MAX_SERVER_PORTS).is_err());
    }
}
