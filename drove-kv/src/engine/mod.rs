//! The per-worker key-value engine: a bucket index over a circular value
//! log. Strictly single-threaded; one instance per worker, no locks.
pub mod index;
pub mod log;

use crate::wire::{DecodedRequest, Key, Opcode, Response};
use color_eyre::eyre::Result;
use index::BucketIndex;
use log::CircularLog;

#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub gets: u64,
    pub get_misses: u64,
    pub puts: u64,
    pub rejected_puts: u64,
}

pub struct KvEngine {
    index: BucketIndex,
    log: CircularLog,
    max_value: usize,
    stats: EngineStats,
}

impl KvEngine {
    pub fn new(num_buckets: usize, log_capacity: usize, max_value: usize) -> Result<Self> {
        Ok(KvEngine {
            index: BucketIndex::new(num_buckets)?,
            log: CircularLog::new(log_capacity)?,
            max_value,
            stats: EngineStats::default(),
        })
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// A miss, whether the key was never inserted or its record has been
    /// lapped by the log head, is a successful empty response.
    pub fn get(&mut self, key: &Key) -> Response {
        self.stats.gets += 1;
        let bucket = key.bucket();
        let tag = key.tag();
        match self.index.lookup(bucket, tag) {
            Some(offset) => match self.log.read(offset) {
                Some(value) => Response::Value(value.to_vec()),
                None => {
                    // Lapped entry: clear it so the way can be reused.
                    self.index.invalidate(bucket, tag);
                    self.stats.get_misses += 1;
                    Response::Empty
                }
            },
            None => {
                self.stats.get_misses += 1;
                Response::Empty
            }
        }
    }

    /// Zero-length values are legal. Values above the configured maximum
    /// leave the store untouched and answer with the rejection sentinel.
    pub fn put(&mut self, key: &Key, value: &[u8]) -> Response {
        if value.len() > self.max_value {
            self.stats.rejected_puts += 1;
            return Response::Rejected;
        }
        self.stats.puts += 1;
        let offset = self.log.append(value);
        self.index.insert(key.bucket(), key.tag(), offset);
        Response::Empty
    }

    /// Execute a batch in order. Batching amortizes the worker's completion
    /// bookkeeping only; there is no cross-op atomicity.
    pub fn execute_batch(&mut self, requests: &[DecodedRequest]) -> Vec<Response> {
        requests
            .iter()
            .map(|req| match req.opcode {
                Opcode::Get => self.get(&req.key),
                Opcode::Put => self.put(&req.key, &req.value),
            })
            .collect()
    }
}
