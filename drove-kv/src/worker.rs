//! Worker dispatch loop.
//!
//! Each worker owns one column of the request region, one datagram endpoint
//! for replies, and one engine instance. It busy-polls its column in
//! round-robin (client, slot) order, batches decoded operations up to the
//! postlist size, executes them, and posts the responses as one chained
//! send. All polling is busy-wait; the loop never blocks.
use crate::{
    engine::KvEngine,
    wire::{DecodedRequest, Response, SlotState},
    K_512,
};
use color_eyre::eyre::{ensure, Result};
use drove_fabric::{
    endpoint::{DatagramEndpoint, SendDesc, SignalBatch},
    region::RequestRegion,
    PeerId,
};
use std::sync::atomic::{AtomicBool, Ordering};

/// Payloads at or below this are sent inline in the descriptor.
pub const MAX_INLINE_SIZE: usize = 60;

/// Idle probes tolerated before a partial batch is flushed.
const MAX_EMPTY_PROBES: usize = 128;

struct PendingOp {
    request: DecodedRequest,
    client: PeerId,
    clt_i: usize,
    slot_i: usize,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub wn: usize,
    pub postlist: usize,
    pub unsig_batch: usize,
}

pub struct Worker<D>
where
    D: DatagramEndpoint,
{
    wn: usize,
    region: RequestRegion,
    engine: KvEngine,
    endpoint: D,
    signal: SignalBatch,
    postlist: usize,
    clt_i: usize,
    slot_i: usize,
    payload_buf: Vec<u8>,
    resp_bufs: Vec<Vec<u8>>,
    completed: u64,
    dropped: u64,
    next_report: u64,
}

impl<D> Worker<D>
where
    D: DatagramEndpoint,
{
    pub fn new(
        config: WorkerConfig,
        region: RequestRegion,
        engine: KvEngine,
        endpoint: D,
    ) -> Result<Self> {
        ensure!(config.postlist >= 1, "postlist must be at least 1");
        ensure!(
            config.wn < region.layout().num_workers,
            "Worker index {} outside region's {} columns",
            config.wn,
            region.layout().num_workers
        );
        // A batch larger than the column could revisit a still-pending slot
        // before it is drained; cap it.
        let postlist = config.postlist.min(region.layout().column_slots());
        let slot_size = region.layout().slot_size;
        let resp_len = Response::max_encoded_len(crate::wire::slot_value_capacity(slot_size));
        Ok(Worker {
            wn: config.wn,
            engine,
            endpoint,
            signal: SignalBatch::new(config.unsig_batch)?,
            postlist,
            clt_i: 0,
            slot_i: 0,
            payload_buf: vec![0u8; slot_size - 1],
            resp_bufs: vec![vec![0u8; resp_len]; postlist],
            completed: 0,
            dropped: 0,
            next_report: K_512 as u64,
            region,
        })
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn engine(&self) -> &KvEngine {
        &self.engine
    }

    /// Poll until `shutdown` is raised, flushing any partial batch on exit.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let mut pending: Vec<PendingOp> = Vec::with_capacity(self.postlist);
        let mut empty_probes = 0;
        tracing::info!(worker = self.wn, postlist = self.postlist, "Worker polling");
        while !shutdown.load(Ordering::Relaxed) {
            if self.probe_one(&mut pending)? {
                empty_probes = 0;
            } else {
                empty_probes += 1;
            }
            if pending.len() >= self.postlist
                || (!pending.is_empty() && empty_probes >= MAX_EMPTY_PROBES)
            {
                self.flush(&mut pending)?;
                empty_probes = 0;
            }
        }
        if !pending.is_empty() {
            self.flush(&mut pending)?;
        }
        tracing::info!(
            worker = self.wn,
            completed = self.completed,
            dropped = self.dropped,
            "Worker exiting"
        );
        Ok(())
    }

    /// One full pass over the column followed by a flush; returns the number
    /// of operations completed by the pass.
    pub fn poll_pass(&mut self) -> Result<usize> {
        let before = self.completed;
        let mut pending: Vec<PendingOp> = Vec::with_capacity(self.postlist);
        for _ in 0..self.region.layout().column_slots() {
            self.probe_one(&mut pending)?;
            if pending.len() >= self.postlist {
                self.flush(&mut pending)?;
            }
        }
        if !pending.is_empty() {
            self.flush(&mut pending)?;
        }
        Ok((self.completed - before) as usize)
    }

    /// Inspect the slot under the cursor and advance. Returns whether an
    /// operation was appended to the batch.
    fn probe_one(&mut self, pending: &mut Vec<PendingOp>) -> Result<bool> {
        let clt_i = self.clt_i;
        let slot_i = self.slot_i;
        let slot = self.region.slot(self.wn, clt_i, slot_i);
        self.advance_cursor();

        let opcode_byte = slot.opcode();
        let state = match SlotState::from_wire(opcode_byte) {
            Ok(state) => state,
            Err(_) => {
                // Malformed opcode: drop silently, no reply.
                slot.clear_opcode();
                self.dropped += 1;
                return Ok(false);
            }
        };
        let opcode = match state {
            SlotState::Idle => return Ok(false),
            SlotState::Pending(op) => op,
        };

        slot.copy_payload_into(&mut self.payload_buf);
        match DecodedRequest::parse(opcode, &self.payload_buf) {
            Ok(request) => {
                // The column index of the slot is the writer's client gid.
                pending.push(PendingOp {
                    request,
                    client: clt_i as PeerId,
                    clt_i,
                    slot_i,
                });
                Ok(true)
            }
            Err(_) => {
                slot.clear_opcode();
                self.dropped += 1;
                Ok(false)
            }
        }
    }

    #[inline]
    fn advance_cursor(&mut self) {
        self.slot_i += 1;
        if self.slot_i == self.region.layout().window_size {
            self.slot_i = 0;
            self.clt_i = (self.clt_i + 1) % self.region.layout().num_clients;
        }
    }

    fn flush(&mut self, pending: &mut Vec<PendingOp>) -> Result<()> {
        let requests: Vec<DecodedRequest> =
            pending.iter().map(|p| p.request.clone()).collect();
        let responses = self.engine.execute_batch(&requests);

        let mut resp_lens = Vec::with_capacity(responses.len());
        for (i, response) in responses.iter().enumerate() {
            resp_lens.push(response.encode_into(&mut self.resp_bufs[i])?);
        }

        // Reset drained slots before posting; the reply datagram must not
        // race the slot becoming reusable on the client side, and O3 orders
        // replies behind the post below.
        for op in pending.iter() {
            self.region.slot(self.wn, op.clt_i, op.slot_i).clear_opcode();
        }

        let mut sends = Vec::with_capacity(pending.len());
        for (i, op) in pending.iter().enumerate() {
            let sig = self.signal.next();
            if sig.poll_previous {
                self.endpoint.poll_send_completion()?;
            }
            sends.push(SendDesc {
                dst: op.client,
                payload: &self.resp_bufs[i][..resp_lens[i]],
                signalled: sig.signalled,
                inline: resp_lens[i] <= MAX_INLINE_SIZE,
            });
        }
        self.endpoint.post_send_batch(&sends)?;

        self.completed += pending.len() as u64;
        if self.completed >= self.next_report {
            let stats = self.engine.stats();
            tracing::info!(
                worker = self.wn,
                completed = self.completed,
                gets = stats.gets,
                puts = stats.puts,
                dropped = self.dropped,
                "Worker progress"
            );
            self.next_report += K_512 as u64;
        }
        pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{slot_size, Key, Opcode, RequestRecord};
    use byteorder::{ByteOrder, LittleEndian};
    use drove_fabric::{
        endpoint::Fabric,
        region::{RegionLayout, RequestRegion},
        shm::ShmFabric,
    };

    fn key(bucket: u32, tag: u64) -> Key {
        let mut bytes = [0u8; 16];
        LittleEndian::write_u32(&mut bytes[0..4], bucket);
        LittleEndian::write_u64(&mut bytes[8..16], tag);
        Key(bytes)
    }

    fn write_request(region: &mut RequestRegion, clt: usize, ws: usize, record: RequestRecord) {
        let mut buf = vec![0u8; region.layout().slot_size];
        record.encode_into(&mut buf).unwrap();
        region.slot(0, clt, ws).publish_bytes(&buf);
    }

    struct Harness {
        region: RequestRegion,
        worker: Worker<<ShmFabric as Fabric>::Datagram>,
        clients: Vec<<ShmFabric as Fabric>::Datagram>,
    }

    fn harness(shm_key: u32, postlist: usize, num_clients: usize) -> Harness {
        let layout = RegionLayout::new(1, num_clients, 4, slot_size(32)).unwrap();
        let region = RequestRegion::create_or_open(shm_key, layout).unwrap();
        let fabric = ShmFabric::new();
        let clients = (0..num_clients)
            .map(|gid| fabric.create_datagram_endpoint(gid).unwrap())
            .collect();
        let endpoint = fabric
            .create_datagram_endpoint(crate::worker_peer_id(0, 0))
            .unwrap();
        let engine = KvEngine::new(64, 1024, 32).unwrap();
        let worker = Worker::new(
            WorkerConfig {
                wn: 0,
                postlist,
                unsig_batch: 4,
            },
            RequestRegion::open(shm_key, layout).unwrap(),
            engine,
            endpoint,
        )
        .unwrap();
        Harness {
            region,
            worker,
            clients,
        }
    }

    #[test]
    fn dispatches_put_then_get_in_order() {
        let mut h = harness(9501, 16, 2);
        let k = key(4, 44);
        write_request(
            &mut h.region,
            1,
            0,
            RequestRecord {
                opcode: Opcode::Put,
                key: k,
                value: Some(b"payload"),
            },
        );
        write_request(
            &mut h.region,
            1,
            1,
            RequestRecord {
                opcode: Opcode::Get,
                key: k,
                value: None,
            },
        );

        let completed = h.worker.poll_pass().unwrap();
        assert_eq!(completed, 2);

        // Both slots reset to idle.
        assert_eq!(h.region.slot(0, 1, 0).opcode(), 0);
        assert_eq!(h.region.slot(0, 1, 1).opcode(), 0);

        // Replies arrive at client 1 in post order: PUT ack, then the value.
        let replies = h.clients[1].poll_recv().unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(
            Response::decode(replies[0].payload.as_ref()).unwrap(),
            Response::Empty
        );
        assert_eq!(
            Response::decode(replies[1].payload.as_ref()).unwrap(),
            Response::Value(b"payload".to_vec())
        );
        assert!(h.clients[0].poll_recv().unwrap().is_empty());
        h.region.unlink().unwrap();
    }

    #[test]
    fn single_pass_visits_each_slot_once() {
        // Every pending slot is dispatched exactly once per pass, even with
        // postlist 1 forcing a flush per operation.
        let mut h = harness(9502, 1, 2);
        let k = key(1, 11);
        for clt in 0..2 {
            for ws in 0..4 {
                write_request(
                    &mut h.region,
                    clt,
                    ws,
                    RequestRecord {
                        opcode: Opcode::Put,
                        key: k,
                        value: Some(&[ws as u8]),
                    },
                );
            }
        }
        let completed = h.worker.poll_pass().unwrap();
        assert_eq!(completed, 8);
        for clt in 0..2 {
            let replies = h.clients[clt].poll_recv().unwrap();
            assert_eq!(replies.len(), 4);
        }
        // Nothing left pending.
        assert_eq!(h.worker.poll_pass().unwrap(), 0);
        h.region.unlink().unwrap();
    }

    #[test]
    fn malformed_opcode_dropped_without_reply() {
        let mut h = harness(9503, 16, 1);
        let layout = *h.region.layout();
        let mut buf = vec![0u8; layout.slot_size];
        buf[layout.slot_size - 1] = 0x7F; // outside every opcode range
        h.region.slot(0, 0, 2).publish_bytes(&buf);

        assert_eq!(h.worker.poll_pass().unwrap(), 0);
        assert_eq!(h.region.slot(0, 0, 2).opcode(), 0);
        assert!(h.clients[0].poll_recv().unwrap().is_empty());
        h.region.unlink().unwrap();
    }

    #[test]
    fn oversize_put_answers_rejection_sentinel() {
        let mut h = harness(9504, 16, 1);
        // 40 bytes encodes into the slot but exceeds the engine's 32-byte cap.
        let big = vec![9u8; 40];
        write_request(
            &mut h.region,
            0,
            0,
            RequestRecord {
                opcode: Opcode::Put,
                key: key(2, 22),
                value: Some(&big),
            },
        );
        assert_eq!(h.worker.poll_pass().unwrap(), 1);
        let replies = h.clients[0].poll_recv().unwrap();
        assert_eq!(
            Response::decode(replies[0].payload.as_ref()).unwrap(),
            Response::Rejected
        );
        h.region.unlink().unwrap();
    }
}
