//! Master: one run per server per port.
//!
//! Allocates the request region in shared memory, then creates and publishes
//! one connected endpoint per client under the region. After registration
//! the master has no data-plane role; it only keeps the region handle alive.
use crate::StoreConfig;
use color_eyre::eyre::Result;
use drove_fabric::{endpoint::Fabric, region::RequestRegion};

/// Name the master publishes its per-client endpoint under. Bit-exact;
/// clients must derive the same string.
pub fn master_endpoint_name(server_id: usize, port: usize, client_gid: usize) -> String {
    format!("master-s{}-{}-{}", server_id, port, client_gid)
}

/// Name a client publishes its half of the connection under.
pub fn client_endpoint_name(server_id: usize, client_gid: usize) -> String {
    format!("client-conn-s{}-{}", server_id, client_gid)
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub server_id: usize,
    pub port_index: usize,
}

/// Create the request region and publish the per-client endpoints over it.
/// The region is allocated first so an endpoint-setup failure aborts with no
/// partial state beyond the (reusable) region itself.
pub fn run_master<F>(fabric: &F, store: &StoreConfig, config: &MasterConfig) -> Result<RequestRegion>
where
    F: Fabric,
{
    let layout = store.layout()?;
    let shm_key = store.shm_key(config.port_index)?;
    let region = RequestRegion::create_or_open(shm_key, layout)?;

    for client_gid in 0..store.num_clients {
        let name = master_endpoint_name(config.server_id, config.port_index, client_gid);
        fabric.publish_region_endpoint(&name, shm_key, &layout)?;
    }
    tracing::info!(
        server_id = config.server_id,
        port = config.port_index,
        shm_key,
        clients = store.num_clients,
        "Master registered request region endpoints"
    );
    Ok(region)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drove_fabric::shm::ShmFabric;

    #[test]
    fn endpoint_names_are_bit_exact() {
        assert_eq!(master_endpoint_name(2, 0, 31), "master-s2-0-31");
        assert_eq!(client_endpoint_name(2, 31), "client-conn-s2-31");
    }

    #[test]
    fn master_publishes_connectable_endpoints() {
        let fabric = ShmFabric::new();
        let store = StoreConfig {
            num_workers: 2,
            num_clients: 3,
            window_size: 2,
            base_shm_key: 9601,
            num_buckets: 64,
            log_capacity: 1024,
            ..StoreConfig::default()
        };
        let region = run_master(
            &fabric,
            &store,
            &MasterConfig {
                server_id: 0,
                port_index: 0,
            },
        )
        .unwrap();

        for gid in 0..3 {
            fabric
                .connect(
                    &master_endpoint_name(0, 0, gid),
                    &client_endpoint_name(0, gid),
                )
                .unwrap();
        }
        assert!(fabric
            .connect(&master_endpoint_name(0, 0, 3), "client-conn-s0-3")
            .is_err());
        region.unlink().unwrap();
    }
}
