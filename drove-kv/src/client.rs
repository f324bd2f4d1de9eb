//! Client: keeps a fixed window of outstanding requests per (server, worker)
//! pair, routes every key to its primary, and collects replies on one
//! datagram endpoint.
use crate::{
    master::{client_endpoint_name, master_endpoint_name},
    peer_to_worker,
    placement::PlacementConfig,
    wire::{Key, Opcode, RequestRecord, Response},
    StoreConfig, K_512,
};
use color_eyre::eyre::{bail, ensure, Result};
use drove_fabric::{
    endpoint::{ConnectedEndpoint, DatagramEndpoint, Fabric, SignalBatch},
    region::RegionLayout,
    stats::ThreadStats,
    timing::RttHistogram,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

/// Preload the client's key array from a seed.
pub fn generate_keys(num_keys: usize, seed: u64) -> Vec<Key> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..num_keys)
        .map(|_| {
            let mut bytes = [0u8; 16];
            rng.fill(&mut bytes[..]);
            Key(bytes)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub clt_gid: usize,
    pub base_port_index: usize,
    /// Workers are spread round-robin over the server ports; the client
    /// writes to the region of the port its target worker polls.
    pub num_server_ports: usize,
    /// Share of PUTs in the workload, 0..=100.
    pub update_percentage: usize,
    pub num_keys: usize,
    /// Bytes written per PUT.
    pub value_size: usize,
    pub seed: u64,
}

pub struct KvClient<F>
where
    F: Fabric,
{
    clt_gid: usize,
    placement: PlacementConfig,
    layout: RegionLayout,
    num_server_ports: usize,
    /// One connection per (server, port), as the master publishes them.
    conns: Vec<Vec<F::Connected>>,
    signals: Vec<Vec<SignalBatch>>,
    dgram: F::Datagram,
    keys: Vec<Key>,
    update_percentage: usize,
    value_size: usize,
    next_worker: usize,
    /// Next window slot per (server, worker), advanced mod the window size.
    ws: Vec<Vec<usize>>,
    /// In-flight (slot, send time) per (server, worker), reply order = post
    /// order per worker.
    inflight: Vec<Vec<VecDeque<(usize, Instant)>>>,
    /// Occupancy per (server, worker, slot); a slot is reissued only after
    /// its previous occupant's reply arrived.
    slot_busy: Vec<Vec<Vec<bool>>>,
    slot_buf: Vec<u8>,
    rng: StdRng,
    rtts: RttHistogram,
    per_server: Vec<usize>,
    sent: usize,
    received: usize,
    next_report: usize,
}

impl<F> KvClient<F>
where
    F: Fabric,
{
    pub fn new(
        fabric: &F,
        store: &StoreConfig,
        placement: PlacementConfig,
        config: ClientConfig,
    ) -> Result<Self> {
        ensure!(
            config.update_percentage <= 100,
            "update percentage {} outside 0..=100",
            config.update_percentage
        );
        ensure!(
            config.clt_gid < store.num_clients,
            "Client gid {} outside the region's {} columns",
            config.clt_gid,
            store.num_clients
        );
        ensure!(
            config.value_size <= store.max_value,
            "Client value size {} above the store maximum {}",
            config.value_size,
            store.max_value
        );
        ensure!(
            config.num_server_ports >= 1,
            "Client needs at least one server port"
        );
        let layout = store.layout()?;
        let num_servers = placement.num_servers();

        // One connected endpoint per (server, port); routing stays
        // primary-only but the full mesh is what replica reads will use.
        let mut conns = Vec::with_capacity(num_servers);
        let mut signals = Vec::with_capacity(num_servers);
        for server_id in 0..num_servers {
            let mut server_conns = Vec::with_capacity(config.num_server_ports);
            let mut server_signals = Vec::with_capacity(config.num_server_ports);
            for port_i in 0..config.num_server_ports {
                let port_index = config.base_port_index + port_i;
                let remote = master_endpoint_name(server_id, port_index, config.clt_gid);
                let local = client_endpoint_name(server_id, config.clt_gid);
                server_conns.push(fabric.connect(&remote, &local)?);
                server_signals.push(SignalBatch::new(store.unsig_batch)?);
            }
            conns.push(server_conns);
            signals.push(server_signals);
        }
        let dgram = fabric.create_datagram_endpoint(config.clt_gid)?;

        let num_workers = layout.num_workers;
        Ok(KvClient {
            clt_gid: config.clt_gid,
            placement,
            layout,
            num_server_ports: config.num_server_ports,
            conns,
            signals,
            dgram,
            keys: generate_keys(config.num_keys, config.seed),
            update_percentage: config.update_percentage,
            value_size: config.value_size,
            next_worker: 0,
            ws: vec![vec![0; num_workers]; num_servers],
            inflight: vec![vec![VecDeque::new(); num_workers]; num_servers],
            slot_busy: vec![vec![vec![false; layout.window_size]; num_workers]; num_servers],
            slot_buf: vec![0u8; layout.slot_size],
            rng: StdRng::seed_from_u64(config.seed ^ 0x1),
            rtts: RttHistogram::new(K_512),
            per_server: vec![0; num_servers],
            sent: 0,
            received: 0,
            next_report: K_512,
        })
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn outstanding(&self) -> usize {
        self.sent - self.received
    }

    pub fn per_server(&self) -> &[usize] {
        &self.per_server
    }

    /// Issue one operation to the key's primary, on the next worker in the
    /// round-robin. Spins on reply collection while the target window slot
    /// is still occupied.
    pub fn issue(&mut self, opcode: Opcode, key: Key, value: Option<&[u8]>) -> Result<Vec<Response>> {
        let wn = self.next_worker;
        self.next_worker = (self.next_worker + 1) % self.layout.num_workers;
        self.issue_on_worker(wn, opcode, key, value)
    }

    /// Issue to the key's primary but a caller-chosen worker. Engines are
    /// per-worker, so a reader that must observe a prior write addresses the
    /// worker that holds it.
    pub fn issue_on_worker(
        &mut self,
        wn: usize,
        opcode: Opcode,
        key: Key,
        value: Option<&[u8]>,
    ) -> Result<Vec<Response>> {
        let server = self.placement.route_of(key.bucket());
        self.issue_to(server, wn, opcode, key, value)
    }

    fn issue_to(
        &mut self,
        server: usize,
        wn: usize,
        opcode: Opcode,
        key: Key,
        value: Option<&[u8]>,
    ) -> Result<Vec<Response>> {
        let slot = self.ws[server][wn];
        let mut drained = Vec::new();
        while self.slot_busy[server][wn][slot] {
            drained.extend(self.drain_replies()?);
        }

        RequestRecord { opcode, key, value }.encode_into(&mut self.slot_buf)?;
        let offset = self.layout.slot_offset(wn, self.clt_gid, slot);
        // Worker wn polls the region behind port (wn mod ports).
        let port_i = wn % self.num_server_ports;
        let sig = self.signals[server][port_i].next();
        if sig.poll_previous {
            self.conns[server][port_i].poll_send_completion()?;
        }
        self.conns[server][port_i].post_write(offset, &self.slot_buf, sig.signalled)?;
        self.dgram.post_recv()?;

        self.slot_busy[server][wn][slot] = true;
        self.inflight[server][wn].push_back((slot, Instant::now()));
        self.ws[server][wn] = (slot + 1) % self.layout.window_size;
        self.sent += 1;
        self.per_server[server] += 1;
        Ok(drained)
    }

    /// Collect any arrived replies, retiring their window slots. Returns
    /// the decoded responses in arrival order.
    pub fn drain_replies(&mut self) -> Result<Vec<Response>> {
        let datagrams = self.dgram.poll_recv()?;
        let mut responses = Vec::with_capacity(datagrams.len());
        for datagram in datagrams {
            let (server, wn) = match peer_to_worker(datagram.src) {
                Some(pair) => pair,
                None => bail!("Reply from non-worker peer {}", datagram.src),
            };
            // Replies from one worker arrive in its post order, so the
            // oldest in-flight slot is the one being answered.
            let (slot, sent_at) = match self.inflight[server][wn].pop_front() {
                Some(entry) => entry,
                None => bail!(
                    "Reply from worker {} of server {} with no request in flight",
                    wn,
                    server
                ),
            };
            self.slot_busy[server][wn][slot] = false;
            self.rtts.record(sent_at.elapsed().as_nanos() as u64);
            responses.push(Response::decode(datagram.payload.as_ref())?);
            self.received += 1;
            if self.received >= self.next_report {
                tracing::info!(
                    client = self.clt_gid,
                    sent = self.sent,
                    received = self.received,
                    per_server = ?self.per_server,
                    "Client progress"
                );
                self.next_report += K_512;
            }
        }
        Ok(responses)
    }

    fn draw(&mut self) -> (Opcode, Key) {
        let key = self.keys[self.rng.gen_range(0..self.keys.len())];
        let opcode = if self.rng.gen_range(0..100) < self.update_percentage {
            Opcode::Put
        } else {
            Opcode::Get
        };
        (opcode, key)
    }

    /// Closed workload loop: draw keys, issue, collect, until `shutdown` or
    /// `max_requests`. Outstanding replies are awaited before returning.
    pub fn run(
        &mut self,
        shutdown: &AtomicBool,
        max_requests: Option<usize>,
    ) -> Result<ThreadStats> {
        let start = Instant::now();
        let mut value_buf = [0u8; 64];
        while !shutdown.load(Ordering::Relaxed) {
            if let Some(max) = max_requests {
                if self.sent >= max {
                    break;
                }
            }
            let (opcode, key) = self.draw();
            match opcode {
                Opcode::Put => {
                    let len = self.value_size;
                    self.rng.fill(&mut value_buf[..len]);
                    self.issue(opcode, key, Some(&value_buf[..len]))?;
                }
                Opcode::Get => {
                    self.issue(opcode, key, None)?;
                }
            }
            self.drain_replies()?;
        }
        while self.outstanding() > 0 && !shutdown.load(Ordering::Relaxed) {
            self.drain_replies()?;
        }
        let runtime_nanos = start.elapsed().as_nanos() as f64;
        tracing::info!(
            client = self.clt_gid,
            sent = self.sent,
            received = self.received,
            "Client finished"
        );
        ThreadStats::new(
            self.clt_gid,
            self.sent,
            self.received,
            runtime_nanos,
            self.per_server.clone(),
            &mut self.rtts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_deterministic_per_seed() {
        let a = generate_keys(16, 7);
        let b = generate_keys(16, 7);
        let c = generate_keys(16, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
