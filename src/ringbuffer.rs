//! Fixed-capacity ring buffer over latency samples with O(1) push and O(k)
//! percentile computation over the window. No allocations on the hot path.
//!
//! C1 of the routing core: used per-credential for adaptive timeouts and
//! health scoring, and aggregated into the pool-wide histogram with
//! exponentially spaced buckets over {5m, 15m, 1h, all}.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A fixed-size circular array of `(Instant, u64)` latency samples in
/// milliseconds. Pushing past capacity silently overwrites the oldest entry;
/// the buffer never reallocates.
#[derive(Debug)]
pub struct LatencyRing {
	data: Mutex<Box<[Option<Sample>]>>,
	write_idx: AtomicUsize,
	len: AtomicUsize,
	capacity: usize,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
	at: Instant,
	millis: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct Stats {
	pub count: usize,
	pub min: u64,
	pub max: u64,
	pub avg: f64,
	pub p50: u64,
	pub p95: u64,
	pub p99: u64,
}

impl Default for Stats {
	fn default() -> Self {
		Stats {
			count: 0,
			min: 0,
			max: 0,
			avg: 0.0,
			p50: 0,
			p95: 0,
			p99: 0,
		}
	}
}

impl LatencyRing {
	pub fn new(capacity: usize) -> Self {
		assert!(capacity > 0, "ring buffer capacity must be non-zero");
		LatencyRing {
			data: Mutex::new(vec![None; capacity].into_boxed_slice()),
			write_idx: AtomicUsize::new(0),
			len: AtomicUsize::new(0),
			capacity,
		}
	}

	pub fn push(&self, millis: u64) {
		let idx = self.write_idx.fetch_add(1, Ordering::Relaxed) % self.capacity;
		let mut data = self.data.lock();
		data[idx] = Some(Sample {
			at: Instant::now(),
			millis,
		});
		drop(data);
		let cur = self.len.load(Ordering::Relaxed);
		if cur < self.capacity {
			self.len.fetch_add(1, Ordering::Relaxed);
		}
	}

	pub fn len(&self) -> usize {
		self.len.load(Ordering::Relaxed)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Percentile/min/max/avg over samples newer than `within`, or the whole
	/// window when `within` is `None`.
	pub fn stats(&self, within: Option<Duration>) -> Stats {
		let data = self.data.lock();
		let now = Instant::now();
		let mut samples: Vec<u64> = data
			.iter()
			.flatten()
			.filter(|s| within.is_none_or(|w| now.duration_since(s.at) <= w))
			.map(|s| s.millis)
			.collect();
		drop(data);
		if samples.is_empty() {
			return Stats::default();
		}
		samples.sort_unstable();
		let count = samples.len();
		let sum: u64 = samples.iter().sum();
		Stats {
			count,
			min: samples[0],
			max: samples[count - 1],
			avg: sum as f64 / count as f64,
			p50: percentile(&samples, 0.50),
			p95: percentile(&samples, 0.95),
			p99: percentile(&samples, 0.99),
		}
	}
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
	if sorted.is_empty() {
		return 0;
	}
	let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
	sorted[idx.min(sorted.len() - 1)]
}

/// Time ranges the aggregated histogram reports over, per §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeRange {
	FiveMinutes,
	FifteenMinutes,
	OneHour,
	All,
}

impl TimeRange {
	pub fn as_duration(self) -> Option<Duration> {
		match self {
			TimeRange::FiveMinutes => Some(Duration::from_secs(5 * 60)),
			TimeRange::FifteenMinutes => Some(Duration::from_secs(15 * 60)),
			TimeRange::OneHour => Some(Duration::from_secs(60 * 60)),
			TimeRange::All => None,
		}
	}

	pub const ALL: [TimeRange; 4] = [
		TimeRange::FiveMinutes,
		TimeRange::FifteenMinutes,
		TimeRange::OneHour,
		TimeRange::All,
	];
}

/// Exponentially spaced bucket boundaries (in ms) used by the global
/// histogram, e.g. for `/metrics` export. Counts, not raw samples, are kept
/// per bucket so the aggregate never grows with request volume.
#[derive(Debug)]
pub struct ExpHistogram {
	bounds: Box<[u64]>,
	counts: Box<[AtomicU64]>,
}

impl ExpHistogram {
	/// `base` is the first bucket's upper bound; each subsequent bucket
	/// doubles it, for `buckets` buckets plus a final +Inf bucket.
	pub fn new(base_ms: u64, buckets: usize) -> Self {
		let mut bounds = Vec::with_capacity(buckets);
		let mut b = base_ms.max(1);
		for _ in 0..buckets {
			bounds.push(b);
			b = b.saturating_mul(2);
		}
		let counts = (0..=buckets).map(|_| AtomicU64::new(0)).collect();
		ExpHistogram {
			bounds: bounds.into_boxed_slice(),
			counts,
		}
	}

	pub fn observe(&self, millis: u64) {
		let idx = self
			.bounds
			.iter()
			.position(|b| millis <= *b)
			.unwrap_or(self.bounds.len());
		self.counts[idx].fetch_add(1, Ordering::Relaxed);
	}

	pub fn snapshot(&self) -> Vec<(u64, u64)> {
		self
			.bounds
			.iter()
			.copied()
			.chain(std::iter::once(u64::MAX))
			.zip(self.counts.iter())
			.map(|(bound, c)| (bound, c.load(Ordering::Relaxed)))
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn percentiles_over_fixed_window() {
		let ring = LatencyRing::new(8);
		for v in [10, 20, 30, 40, 50, 60, 70, 80] {
			ring.push(v);
		}
		let stats = ring.stats(None);
		assert_eq!(stats.count, 8);
		assert_eq!(stats.min, 10);
		assert_eq!(stats.max, 80);
		assert_eq!(stats.p50, 50);
	}

	#[test]
	fn overwrites_oldest_past_capacity() {
		let ring = LatencyRing::new(4);
		for v in 0..10u64 {
			ring.push(v);
		}
		// capacity is 4, so only 4 samples are retained
		assert_eq!(ring.len(), 4);
		let stats = ring.stats(None);
		assert_eq!(stats.count, 4);
		assert_eq!(stats.max, 9);
	}

	#[test]
	fn exp_histogram_buckets() {
		let h = ExpHistogram::new(10, 4); // 10, 20, 40, 80, +Inf
		h.observe(5);
		h.observe(15);
		h.observe(1000);
		let snap = h.snapshot();
		assert_eq!(snap[0], (10, 1));
		assert_eq!(snap[1], (20, 1));
		assert_eq!(snap.last().unwrap(), &(u64::MAX, 1));
	}
}
