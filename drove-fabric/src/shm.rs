//! Process-local loopback fabric.
//!
//! Implements the endpoint traits in software for tests and single-machine
//! runs: one-sided writes copy into the target request region through a
//! private mapping, datagrams move through per-peer queues, and the
//! rendezvous directory is an in-process name table. Delivery is lossless;
//! posted receive counts are tracked for accounting only.
use crate::{
    endpoint::{ConnectedEndpoint, Datagram, DatagramEndpoint, Fabric, SendDesc},
    region::{RegionLayout, RequestRegion},
    PeerId,
};
use bytes::Bytes;
use color_eyre::eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

#[derive(Debug, Clone, Copy)]
struct RegionTarget {
    shm_key: u32,
    layout: RegionLayout,
}

struct Inbox {
    queue: Mutex<VecDeque<Datagram>>,
    posted_recvs: AtomicUsize,
}

impl Inbox {
    fn new() -> Self {
        Inbox {
            queue: Mutex::new(VecDeque::new()),
            posted_recvs: AtomicUsize::new(0),
        }
    }
}

struct FabricInner {
    published: Mutex<HashMap<String, RegionTarget>>,
    inboxes: Mutex<HashMap<PeerId, Arc<Inbox>>>,
}

/// Handle to the loopback fabric. Clones share the same name table and
/// datagram queues.
#[derive(Clone)]
pub struct ShmFabric {
    inner: Arc<FabricInner>,
}

impl ShmFabric {
    pub fn new() -> Self {
        ShmFabric {
            inner: Arc::new(FabricInner {
                published: Mutex::new(HashMap::new()),
                inboxes: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl Fabric for ShmFabric {
    type Connected = ShmConnectedEndpoint;
    type Datagram = ShmDatagramEndpoint;

    fn publish_region_endpoint(
        &self,
        name: &str,
        shm_key: u32,
        layout: &RegionLayout,
    ) -> Result<()> {
        let mut published = self.inner.published.lock().unwrap();
        ensure!(
            !published.contains_key(name),
            "Endpoint name {} already published",
            name
        );
        published.insert(
            name.to_string(),
            RegionTarget {
                shm_key,
                layout: *layout,
            },
        );
        tracing::debug!(name, shm_key, "Published region endpoint");
        Ok(())
    }

    fn connect(&self, remote_name: &str, local_name: &str) -> Result<ShmConnectedEndpoint> {
        let target = {
            let published = self.inner.published.lock().unwrap();
            match published.get(remote_name) {
                Some(t) => *t,
                None => bail!("No endpoint published under {}", remote_name),
            }
        };
        let region = RequestRegion::open(target.shm_key, target.layout)?;
        // Record our half so the remote side can resolve the pairing.
        let mut published = self.inner.published.lock().unwrap();
        published.insert(local_name.to_string(), target);
        tracing::debug!(remote_name, local_name, "Connected endpoints");
        Ok(ShmConnectedEndpoint {
            region,
            outstanding_signalled: 0,
        })
    }

    fn create_datagram_endpoint(&self, peer: PeerId) -> Result<ShmDatagramEndpoint> {
        let inbox = Arc::new(Inbox::new());
        let mut inboxes = self.inner.inboxes.lock().unwrap();
        ensure!(
            !inboxes.contains_key(&peer),
            "Datagram peer id {} already in use",
            peer
        );
        inboxes.insert(peer, inbox.clone());
        Ok(ShmDatagramEndpoint {
            peer,
            inbox,
            fabric: self.inner.clone(),
            outstanding_signalled: 0,
        })
    }
}

/// Loopback connected endpoint: writes copy straight into the target region
/// with the opcode byte published last, in issue order.
pub struct ShmConnectedEndpoint {
    region: RequestRegion,
    outstanding_signalled: usize,
}

impl ConnectedEndpoint for ShmConnectedEndpoint {
    fn post_write(&mut self, offset: usize, bytes: &[u8], signalled: bool) -> Result<()> {
        ensure!(
            bytes.len() == self.region.layout().slot_size,
            "Slot write must cover the whole slot ({} bytes, got {})",
            self.region.layout().slot_size,
            bytes.len()
        );
        let slot = self.region.slot_at_offset(offset)?;
        slot.publish_bytes(bytes);
        if signalled {
            self.outstanding_signalled += 1;
        }
        Ok(())
    }

    fn poll_send_completion(&mut self) -> Result<()> {
        // Loopback writes complete at post time.
        self.outstanding_signalled = self.outstanding_signalled.saturating_sub(1);
        Ok(())
    }
}

/// Loopback datagram endpoint backed by a per-peer queue.
pub struct ShmDatagramEndpoint {
    peer: PeerId,
    inbox: Arc<Inbox>,
    fabric: Arc<FabricInner>,
    outstanding_signalled: usize,
}

impl DatagramEndpoint for ShmDatagramEndpoint {
    fn post_recv(&mut self) -> Result<()> {
        self.inbox.posted_recvs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn poll_recv(&mut self) -> Result<Vec<Datagram>> {
        let mut queue = self.inbox.queue.lock().unwrap();
        let drained: Vec<Datagram> = queue.drain(..).collect();
        drop(queue);
        if !drained.is_empty() {
            let mut posted = self.inbox.posted_recvs.load(Ordering::Relaxed);
            posted = posted.saturating_sub(drained.len());
            self.inbox.posted_recvs.store(posted, Ordering::Relaxed);
        }
        Ok(drained)
    }

    fn post_send_batch(&mut self, sends: &[SendDesc]) -> Result<()> {
        let inboxes = self.fabric.inboxes.lock().unwrap();
        for desc in sends.iter() {
            let inbox = match inboxes.get(&desc.dst) {
                Some(i) => i,
                None => bail!("Datagram peer {} has no endpoint", desc.dst),
            };
            inbox.queue.lock().unwrap().push_back(Datagram {
                src: self.peer,
                payload: Bytes::copy_from_slice(desc.payload),
            });
            if desc.signalled {
                self.outstanding_signalled += 1;
            }
        }
        Ok(())
    }

    fn poll_send_completion(&mut self) -> Result<()> {
        self.outstanding_signalled = self.outstanding_signalled.saturating_sub(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::CACHE_LINE_SIZE;

    fn layout() -> RegionLayout {
        RegionLayout::new(1, 2, 2, CACHE_LINE_SIZE).unwrap()
    }

    #[test]
    fn connect_requires_published_name() {
        let fabric = ShmFabric::new();
        assert!(fabric.connect("master-s0-0-0", "client-conn-s0-0").is_err());
    }

    #[test]
    fn one_sided_write_lands_in_region() {
        let fabric = ShmFabric::new();
        let layout = layout();
        let mut region = RequestRegion::create_or_open(9401, layout).unwrap();
        fabric
            .publish_region_endpoint("master-s0-0-1", 9401, &layout)
            .unwrap();
        let mut conn = fabric.connect("master-s0-0-1", "client-conn-s0-1").unwrap();

        let mut slot_bytes = vec![0u8; CACHE_LINE_SIZE];
        slot_bytes[0] = 7;
        slot_bytes[CACHE_LINE_SIZE - 1] = 11;
        let offset = layout.slot_offset(0, 1, 1);
        conn.post_write(offset, &slot_bytes, true).unwrap();
        conn.poll_send_completion().unwrap();

        let slot = region.slot(0, 1, 1);
        assert_eq!(slot.opcode(), 11);
        let mut payload = vec![0u8; CACHE_LINE_SIZE - 1];
        slot.copy_payload_into(&mut payload);
        assert_eq!(payload[0], 7);
        region.unlink().unwrap();
    }

    #[test]
    fn short_or_misaligned_writes_rejected() {
        let fabric = ShmFabric::new();
        let layout = layout();
        let region = RequestRegion::create_or_open(9402, layout).unwrap();
        fabric
            .publish_region_endpoint("master-s0-0-2", 9402, &layout)
            .unwrap();
        let mut conn = fabric.connect("master-s0-0-2", "client-conn-s0-2").unwrap();
        assert!(conn.post_write(0, &[0u8; 17], false).is_err());
        assert!(conn
            .post_write(1, &vec![0u8; CACHE_LINE_SIZE], false)
            .is_err());
        region.unlink().unwrap();
    }

    #[test]
    fn datagrams_round_trip_between_peers() {
        let fabric = ShmFabric::new();
        let mut a = fabric.create_datagram_endpoint(1).unwrap();
        let mut b = fabric.create_datagram_endpoint(2).unwrap();

        b.post_recv().unwrap();
        a.post_send_batch(&[SendDesc {
            dst: 2,
            payload: b"hello",
            signalled: true,
            inline: true,
        }])
        .unwrap();
        a.poll_send_completion().unwrap();

        let got = b.poll_recv().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].src, 1);
        assert_eq!(got[0].payload.as_ref(), b"hello");
        assert!(b.poll_recv().unwrap().is_empty());
    }

    #[test]
    fn duplicate_peer_ids_rejected() {
        let fabric = ShmFabric::new();
        let _a = fabric.create_datagram_endpoint(5).unwrap();
        assert!(fabric.create_datagram_endpoint(5).is_err());
    }
}
