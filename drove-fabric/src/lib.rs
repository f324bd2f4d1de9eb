//! Transport layer for drove.
//!
//! This crate owns everything between the application and the fabric driver:
//!  1. The request region: a contiguous shared-memory segment that remote
//!     peers mutate with one-sided writes and a local worker busy-polls.
//!  2. Traits the fabric driver implements: connected (one-sided write)
//!     endpoints, unreliable datagram endpoints, and the rendezvous registry
//!     used to exchange endpoint names out of band.
//!  3. A process-local loopback fabric implementing those traits in software,
//!     used for tests and single-machine runs.
pub mod endpoint;
pub mod mem;
pub mod region;
pub mod shm;
pub mod stats;
pub mod timing;

/// Identifies a datagram peer (a client gid or a worker's reply endpoint).
pub type PeerId = usize;
