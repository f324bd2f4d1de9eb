//! Seams between the core and the fabric driver.
//!
//! Queue-pair creation, memory registration and the rendezvous directory are
//! driver concerns; the core only consumes the operations below. The loopback
//! implementation lives in [`crate::shm`]; a hardware driver implements the
//! same traits over its verbs library.
use crate::{region::RegionLayout, PeerId};
use bytes::Bytes;
use color_eyre::eyre::{ensure, Result};

/// A datagram handed up by `poll_recv`.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub src: PeerId,
    pub payload: Bytes,
}

/// One send descriptor within a post-list.
pub struct SendDesc<'a> {
    pub dst: PeerId,
    pub payload: &'a [u8],
    pub signalled: bool,
    /// Ask the driver to inline the payload in the descriptor when it fits.
    pub inline: bool,
}

/// A connected endpoint whose remote side is a request region. Writes land
/// in issue order and the receiver observes bytes in ascending address
/// order, so the slot's trailing opcode byte becomes visible last.
pub trait ConnectedEndpoint {
    /// One-sided write of a full slot at the given byte offset.
    fn post_write(&mut self, offset: usize, bytes: &[u8], signalled: bool) -> Result<()>;

    /// Reap the completion of the previous signalled write. An error from
    /// the completion queue is fatal to the caller's loop.
    fn poll_send_completion(&mut self) -> Result<()>;
}

/// An unreliable datagram endpoint used for responses.
pub trait DatagramEndpoint {
    /// Post one receive descriptor.
    fn post_recv(&mut self) -> Result<()>;

    /// Drain arrived datagrams. Never blocks.
    fn poll_recv(&mut self) -> Result<Vec<Datagram>>;

    /// Post a batch of sends in one driver call (the post-list primitive).
    /// Sends to the same peer arrive in post order.
    fn post_send_batch(&mut self, sends: &[SendDesc]) -> Result<()>;

    /// Reap the completion of the previous signalled send.
    fn poll_send_completion(&mut self) -> Result<()>;
}

/// The out-of-band rendezvous directory plus endpoint construction.
pub trait Fabric {
    type Connected: ConnectedEndpoint + Send;
    type Datagram: DatagramEndpoint + Send;

    /// Master side: create an endpoint registered over the request region
    /// identified by `shm_key` and publish it under `name`.
    fn publish_region_endpoint(&self, name: &str, shm_key: u32, layout: &RegionLayout)
        -> Result<()>;

    /// Client side: look up `remote_name`, publish our half under
    /// `local_name`, and connect the two.
    fn connect(&self, remote_name: &str, local_name: &str) -> Result<Self::Connected>;

    /// Create a datagram endpoint addressable as `peer`.
    fn create_datagram_endpoint(&self, peer: PeerId) -> Result<Self::Datagram>;
}

/// Decision for one send: whether it is signalled and whether the previous
/// signalled completion must be reaped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub signalled: bool,
    pub poll_previous: bool,
}

/// Selective signalling state for one send queue.
///
/// Every `unsig_batch`-th post is signalled; before posting a signalled
/// send the caller reaps the previous signalled completion, which bounds
/// outstanding sends per endpoint at `unsig_batch`.
#[derive(Debug)]
pub struct SignalBatch {
    mask: u64,
    posted: u64,
}

impl SignalBatch {
    pub fn new(unsig_batch: usize) -> Result<Self> {
        ensure!(
            unsig_batch >= 1 && unsig_batch.is_power_of_two(),
            "unsig batch {} must be a power of two",
            unsig_batch
        );
        Ok(SignalBatch {
            mask: unsig_batch as u64 - 1,
            posted: 0,
        })
    }

    /// Account for the next post and return its signalling decision.
    pub fn next(&mut self) -> Signal {
        let signalled = self.posted & self.mask == 0;
        let poll_previous = signalled && self.posted > 0;
        self.posted += 1;
        Signal {
            signalled,
            poll_previous,
        }
    }

    pub fn posted(&self) -> u64 {
        self.posted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two() {
        assert!(SignalBatch::new(0).is_err());
        assert!(SignalBatch::new(3).is_err());
        assert!(SignalBatch::new(4).is_ok());
    }

    #[test]
    fn every_nth_send_is_signalled() {
        let mut sig = SignalBatch::new(4).unwrap();
        let decisions: Vec<Signal> = (0..9).map(|_| sig.next()).collect();
        let signalled: Vec<bool> = decisions.iter().map(|s| s.signalled).collect();
        assert_eq!(
            signalled,
            vec![true, false, false, false, true, false, false, false, true]
        );
        // The first signalled send has no predecessor to reap.
        assert!(!decisions[0].poll_previous);
        assert!(decisions[4].poll_previous);
        assert!(decisions[8].poll_previous);
    }

    #[test]
    fn unsig_batch_of_one_signals_everything() {
        let mut sig = SignalBatch::new(1).unwrap();
        assert_eq!(
            sig.next(),
            Signal {
                signalled: true,
                poll_previous: false
            }
        );
        assert_eq!(
            sig.next(),
            Signal {
                signalled: true,
                poll_previous: true
            }
        );
    }
}
