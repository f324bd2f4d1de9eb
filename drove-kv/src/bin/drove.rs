use color_eyre::eyre::Result;
use drove_fabric::shm::ShmFabric;
use drove_kv::{
    run_datapath::{check_opt, run_client, run_server, DroveOpt},
    StoreConfig, MASTER_SHM_KEY, MAX_SERVER_PORTS,
};
use drove_utils::{global_debug_init, AppMode};
use structopt::StructOpt;

fn main() -> Result<()> {
    let opt = DroveOpt::from_args();
    global_debug_init(opt.trace_level)?;
    check_opt(&opt)?;

    if drove_utils::single_threaded() {
        tracing::info!("Driver-level single-threaded fast paths enabled");
    }
    match drove_utils::registry_ip() {
        Some(ip) => tracing::info!(registry = ip.as_str(), "Using rendezvous directory"),
        None => tracing::info!("No rendezvous directory configured; loopback fabric only"),
    }

    let fabric = ShmFabric::new();
    let store = StoreConfig {
        postlist: opt.postlist,
        ..StoreConfig::default()
    };

    match opt.mode() {
        AppMode::Client if opt.master == 1 => {
            // Single-process smoke cluster: every server's master and
            // workers plus this machine's clients, all over the loopback
            // fabric.
            let mut servers = Vec::with_capacity(opt.num_servers);
            for server_id in 0..opt.num_servers {
                let mut server_opt = opt.clone();
                server_opt.server_id = server_id;
                let server_store = StoreConfig {
                    base_shm_key: MASTER_SHM_KEY + (server_id * MAX_SERVER_PORTS) as u32,
                    ..store.clone()
                };
                servers.push(run_server(fabric.clone(), &server_opt, &server_store)?);
            }
            run_client(fabric, &opt, &store, None)?;
            for server in servers {
                server.stop_and_join()?;
            }
        }
        AppMode::Client => {
            run_client(fabric, &opt, &store, None)?;
        }
        AppMode::Server => {
            let server = run_server(fabric, &opt, &store)?;
            server.join()?;
        }
    }
    Ok(())
}
