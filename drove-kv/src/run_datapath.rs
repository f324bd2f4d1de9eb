//! CLI surface and process wiring: flag parsing and validation, then
//! spawning pinned master/worker threads (server) or client threads.
use crate::{
    client::{ClientConfig, KvClient},
    engine::KvEngine,
    master::{run_master, MasterConfig},
    placement::PlacementConfig,
    worker::{Worker, WorkerConfig},
    worker_peer_id, StoreConfig, MAX_SERVER_PORTS,
};
use color_eyre::eyre::{bail, ensure, Result};
use drove_fabric::{
    endpoint::Fabric,
    region::RequestRegion,
    stats::{dump_thread_stats, ThreadStats},
};
use drove_utils::{AppMode, TraceLevel};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};
use structopt::StructOpt;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "Drove KV store.",
    about = "Partitioned in-memory KV store over an RDMA-style fabric."
)]
pub struct DroveOpt {
    #[structopt(
        long = "debug_level",
        help = "Configure tracing settings.",
        default_value = "warn"
    )]
    pub trace_level: TraceLevel,
    #[structopt(
        long = "master",
        help = "Run the master (request region setup) in this process.",
        default_value = "1"
    )]
    pub master: usize,
    #[structopt(long = "is-client", help = "Run as a client.", default_value = "0")]
    pub is_client: usize,
    #[structopt(long = "base-port-index", default_value = "0")]
    pub base_port_index: usize,
    #[structopt(long = "num-server-ports", default_value = "1")]
    pub num_server_ports: usize,
    #[structopt(long = "num-client-ports", default_value = "1")]
    pub num_client_ports: usize,
    #[structopt(
        long = "postlist",
        help = "Batch size for worker sends.",
        default_value = "16"
    )]
    pub postlist: usize,
    #[structopt(
        long = "update-percentage",
        help = "Share of PUTs in the client workload (0..100).",
        default_value = "5"
    )]
    pub update_percentage: usize,
    #[structopt(long = "machine-id", help = "Client machine id.", default_value = "0")]
    pub machine_id: usize,
    #[structopt(
        long = "num-threads",
        help = "Number of client threads.",
        default_value = "1"
    )]
    pub num_threads: usize,
    #[structopt(long = "num-servers", default_value = "4")]
    pub num_servers: usize,
    #[structopt(long = "num-shards", default_value = "4")]
    pub num_shards: usize,
    #[structopt(long = "replication-factor", default_value = "3")]
    pub replication_factor: usize,
    #[structopt(long = "server-id", default_value = "0")]
    pub server_id: usize,
    #[structopt(long = "threadlog", help = "Logfile for per-thread statistics.")]
    pub thread_log: Option<String>,
}

impl DroveOpt {
    pub fn placement(&self) -> Result<PlacementConfig> {
        PlacementConfig::new(self.num_servers, self.num_shards, self.replication_factor)
    }

    /// Role this process runs in. `--is-client 1` wins; everything else is a
    /// server process (with or without the master step).
    pub fn mode(&self) -> AppMode {
        if self.is_client == 1 {
            AppMode::Client
        } else {
            AppMode::Server
        }
    }
}

/// Startup validation. Every violation here aborts before any endpoint or
/// region exists.
pub fn check_opt(opt: &DroveOpt) -> Result<()> {
    ensure!(opt.master <= 1, "--master takes 0 or 1");
    ensure!(opt.is_client <= 1, "--is-client takes 0 or 1");
    ensure!(
        opt.update_percentage <= 100,
        "--update-percentage {} outside 0..100",
        opt.update_percentage
    );
    ensure!(opt.postlist >= 1, "--postlist must be at least 1");
    ensure!(
        opt.num_server_ports >= 1
            && opt.num_client_ports >= 1
            && opt.base_port_index + opt.num_server_ports <= MAX_SERVER_PORTS,
        "Port configuration outside the {} supported ports",
        MAX_SERVER_PORTS
    );
    ensure!(opt.num_threads >= 1, "--num-threads must be at least 1");
    // Validates num_servers / num_shards / replication_factor bounds.
    let _ = opt.placement()?;
    if opt.mode() == AppMode::Server {
        ensure!(
            opt.server_id < opt.num_servers,
            "--server-id {} must be below --num-servers {}",
            opt.server_id,
            opt.num_servers
        );
    }
    Ok(())
}

fn pin_thread(core: usize) {
    match affinity::set_thread_affinity(&vec![core]) {
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(core, "Could not pin thread: {:?}", e);
        }
    }
}

/// A running server: masters done, workers polling.
pub struct ServerHandles {
    pub shutdown: Arc<AtomicBool>,
    pub regions: Vec<RequestRegion>,
    threads: Vec<JoinHandle<Result<()>>>,
}

impl ServerHandles {
    /// Block until the workers exit (they only do once `shutdown` is set).
    pub fn join(self) -> Result<()> {
        for thread in self.threads {
            match thread.join() {
                Ok(res) => res?,
                Err(_) => bail!("Worker thread panicked"),
            }
        }
        Ok(())
    }

    pub fn stop_and_join(self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        self.join()
    }
}

/// Bring up one server: run the master once per port, then spawn the pinned
/// worker threads. Workers are spread round-robin across the server ports.
pub fn run_server<F>(fabric: F, opt: &DroveOpt, store: &StoreConfig) -> Result<ServerHandles>
where
    F: Fabric + Clone + Send + 'static,
    F::Datagram: 'static,
{
    let mut regions = Vec::new();
    if opt.master == 1 {
        for port_index in opt.base_port_index..opt.base_port_index + opt.num_server_ports {
            regions.push(run_master(
                &fabric,
                store,
                &MasterConfig {
                    server_id: opt.server_id,
                    port_index,
                },
            )?);
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut threads = Vec::with_capacity(store.num_workers);
    for wn in 0..store.num_workers {
        let port_index = opt.base_port_index + (wn % opt.num_server_ports);
        let shm_key = store.shm_key(port_index)?;
        let layout = store.layout()?;
        let engine = KvEngine::new(store.num_buckets, store.log_capacity, store.max_value)?;
        let endpoint = fabric.create_datagram_endpoint(worker_peer_id(opt.server_id, wn))?;
        let region = RequestRegion::open(shm_key, layout)?;
        let config = WorkerConfig {
            wn,
            postlist: opt.postlist,
            unsig_batch: store.unsig_batch,
        };
        let flag = shutdown.clone();
        threads.push(std::thread::spawn(move || {
            pin_thread(wn);
            let mut worker = Worker::new(config, region, engine, endpoint)?;
            worker.run(&flag)
        }));
    }

    tracing::info!(
        server_id = opt.server_id,
        workers = store.num_workers,
        ports = opt.num_server_ports,
        "Server up"
    );
    Ok(ServerHandles {
        shutdown,
        regions,
        threads,
    })
}

/// Spawn the client threads and aggregate their stats. Client gids are
/// derived from the machine id so every machine's threads own distinct
/// request-region columns.
pub fn run_client<F>(
    fabric: F,
    opt: &DroveOpt,
    store: &StoreConfig,
    max_requests: Option<usize>,
) -> Result<()>
where
    F: Fabric + Clone + Send + 'static,
    F::Connected: 'static,
    F::Datagram: 'static,
{
    let placement = opt.placement()?;
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut threads: Vec<JoinHandle<Result<ThreadStats>>> = Vec::with_capacity(opt.num_threads);

    for thread_i in 0..opt.num_threads {
        let clt_gid = opt.machine_id * opt.num_threads + thread_i;
        ensure!(
            clt_gid < store.num_clients,
            "Client gid {} outside the region's {} columns",
            clt_gid,
            store.num_clients
        );
        let config = ClientConfig {
            clt_gid,
            base_port_index: opt.base_port_index,
            num_server_ports: opt.num_server_ports,
            update_percentage: opt.update_percentage,
            num_keys: store.num_keys,
            value_size: store.max_value,
            seed: clt_gid as u64,
        };
        let fabric_clone = fabric.clone();
        let store_clone = store.clone();
        let flag = shutdown.clone();
        threads.push(std::thread::spawn(move || {
            pin_thread(thread_i + 1);
            let mut client = KvClient::new(&fabric_clone, &store_clone, placement, config)?;
            client.run(&flag, max_requests)
        }));
    }

    let mut thread_results = Vec::with_capacity(threads.len());
    for thread in threads {
        let stats = match thread.join() {
            Ok(res) => res?,
            Err(_) => bail!("Client thread panicked"),
        };
        thread_results.push(stats);
    }
    dump_thread_stats(thread_results, opt.thread_log.clone())?;
    Ok(())
}
