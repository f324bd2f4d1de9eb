use crate::stats::ThreadLatencies;
use color_eyre::eyre::{ensure, Result};

/// Round-trip latency recorder for one client thread.
///
/// Recording is a single vector push so it stays off the busy-poll path;
/// sorting is deferred until the run ends and the samples are folded into
/// the thread's latency report.
pub struct RttHistogram {
    samples: Vec<u64>,
    sorted: bool,
}

impl RttHistogram {
    pub fn new(expected_samples: usize) -> Self {
        RttHistogram {
            samples: Vec::with_capacity(expected_samples),
            sorted: true,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn record(&mut self, nanos: u64) {
        self.samples.push(nanos);
        self.sorted = false;
    }

    fn quantile(&self, q: f64) -> f64 {
        let index = ((self.samples.len() as f64 * q) as usize).min(self.samples.len() - 1);
        self.samples[index] as f64
    }

    /// Sort the recorded RTTs and report them as one thread's latencies.
    pub fn summary(&mut self) -> Result<ThreadLatencies> {
        ensure!(!self.samples.is_empty(), "No RTT samples recorded");
        if !self.sorted {
            self.samples.sort_unstable();
            self.sorted = true;
        }
        let sum: u64 = self.samples.iter().sum();
        Ok(ThreadLatencies {
            num_threads: 1,
            avg: sum as f64 / self.samples.len() as f64,
            p5: self.quantile(0.05),
            p25: self.quantile(0.25),
            p50: self.quantile(0.50),
            p75: self.quantile(0.75),
            p95: self.quantile(0.95),
            p99: self.quantile(0.99),
            p999: self.quantile(0.999),
            min: self.samples[0] as f64,
            max: self.samples[self.samples.len() - 1] as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reports_sorted_quantiles() {
        let mut hist = RttHistogram::new(8);
        for v in [40u64, 10, 30, 20] {
            hist.record(v);
        }
        let summary = hist.summary().unwrap();
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.p50, 30.0);
        assert_eq!(summary.max, 40.0);
        assert_eq!(summary.avg, 25.0);
        assert_eq!(summary.num_threads, 1);
    }

    #[test]
    fn empty_summary_is_an_error() {
        let mut hist = RttHistogram::new(4);
        assert!(hist.summary().is_err());
    }

    #[test]
    fn recording_after_a_summary_resorts() {
        let mut hist = RttHistogram::new(2);
        hist.record(100);
        assert_eq!(hist.summary().unwrap().min, 100.0);
        hist.record(5);
        assert_eq!(hist.len(), 2);
        assert_eq!(hist.summary().unwrap().min, 5.0);
    }

    #[test]
    fn grows_past_the_expected_sample_count() {
        let mut hist = RttHistogram::new(1);
        hist.record(5);
        hist.record(6);
        assert_eq!(hist.len(), 2);
        assert_eq!(hist.summary().unwrap().max, 6.0);
    }
}
