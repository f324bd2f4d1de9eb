use crate::timing::RttHistogram;
use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::to_writer;
use std::fs::File;

const NANOS_IN_SEC: f64 = 1000000000.0;

fn rolling_avg(avg: f64, val: f64, idx: usize) -> f64 {
    avg + (val - avg) / idx as f64
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Copy)]
pub struct ThreadLatencies {
    pub num_threads: usize,
    pub avg: f64,
    pub p5: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for ThreadLatencies {
    fn default() -> Self {
        ThreadLatencies {
            min: f64::MAX,
            num_threads: 0,
            avg: 0.0,
            p5: 0.0,
            p25: 0.0,
            p50: 0.0,
            p75: 0.0,
            p95: 0.0,
            p99: 0.0,
            p999: 0.0,
            max: 0.0,
        }
    }
}

impl ThreadLatencies {
    fn dump(&self, thread_id: usize) {
        tracing::info!(
            p5_ns =? self.p5,
            p50_ns =? self.p50,
            p95_ns =? self.p95,
            p99_ns =? self.p99,
            p999_ns =? self.p999,
            avg_ns = ?self.avg,
            max_ns = ?self.max,
            min_ns = ?self.min,
            "thread {} latencies.",
            thread_id
        );
    }
}

impl std::ops::Add for ThreadLatencies {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        let idx = self.num_threads + 1;
        assert!(other.num_threads == 1); // can only add a single thread in
        Self {
            num_threads: idx,
            avg: rolling_avg(self.avg, other.avg, idx),
            p5: rolling_avg(self.p5, other.p5, idx),
            p25: rolling_avg(self.p25, other.p25, idx),
            p50: rolling_avg(self.p50, other.p50, idx),
            p75: rolling_avg(self.p75, other.p75, idx),
            p95: rolling_avg(self.p95, other.p95, idx),
            p99: rolling_avg(self.p99, other.p99, idx),
            p999: rolling_avg(self.p999, other.p999, idx),
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// End-of-run summary for one client thread: aggregate throughput plus the
/// per-server request split the placement routing produced.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ThreadStats {
    pub thread_id: usize,
    pub num_sent: usize,
    pub num_received: usize,
    pub runtime: f64,
    pub achieved_load_pps: f64,
    pub per_server: Vec<usize>,
    pub latencies: ThreadLatencies,
}

impl ThreadStats {
    pub fn new(
        id: usize,
        sent: usize,
        recved: usize,
        runtime_nanos: f64,
        per_server: Vec<usize>,
        hist: &mut RttHistogram,
    ) -> Result<Self> {
        let achieved_load_pps = recved as f64 / (runtime_nanos / NANOS_IN_SEC);
        let latencies = if hist.is_empty() {
            ThreadLatencies::default()
        } else {
            hist.summary()?
        };
        Ok(ThreadStats {
            thread_id: id,
            num_sent: sent,
            num_received: recved,
            runtime: runtime_nanos / NANOS_IN_SEC,
            achieved_load_pps,
            per_server,
            latencies,
        })
    }

    pub fn dump(&self) {
        tracing::info!(
            thread = self.thread_id,
            num_sent = self.num_sent,
            num_received = self.num_received,
            achieved_pps = ?self.achieved_load_pps,
            per_server = ?self.per_server,
            "thread {} summary stats",
            self.thread_id
        );
        self.latencies.dump(self.thread_id);
    }
}

pub fn dump_thread_stats(info: Vec<ThreadStats>, thread_info_path: Option<String>) -> Result<()> {
    match thread_info_path {
        Some(p) => {
            to_writer(&File::create(&p)?, &info)?;
        }
        None => {}
    }

    let mut total_sent = 0;
    let mut total_received = 0;
    let mut total_pps = 0.0;
    let mut latencies = ThreadLatencies::default();
    for stats in info.iter() {
        stats.dump();
        total_sent += stats.num_sent;
        total_received += stats.num_received;
        total_pps += stats.achieved_load_pps;
        latencies = latencies + stats.latencies;
    }

    tracing::info!(
        num_threads = info.len(),
        total_sent,
        total_received,
        total_pps = ?total_pps,
        "Aggregate client stats"
    );
    latencies.dump(info.len());
    Ok(())
}
