//! History & stats aggregators. C13 of the routing core — tiered
//! time-series and counters, treated as interface only per §4/§55's
//! allocation table. Grounded on [`crate::ringbuffer`]'s fixed-capacity
//! circular array discipline: three ring buffers of decreasing resolution
//! and increasing span (`fine`, `medium`, `coarse`), matching the
//! `schemaVersion:2` tiered history file described in §6 "Persisted
//! artifacts".

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

pub const SCHEMA_VERSION: u32 = 2;

/// A single point in the tiered history: a request count and success count
/// accumulated over one bucket's span.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatPoint {
	pub requests: u64,
	pub successes: u64,
	pub total_latency_ms: u64,
}

impl StatPoint {
	fn merge(&mut self, other: &StatPoint) {
		self.requests += other.requests;
		self.successes += other.successes;
		self.total_latency_ms += other.total_latency_ms;
	}
}

/// Fixed-capacity ring of `StatPoint`, each covering `bucket_span`. Writes
/// land in the current time bucket (advancing the ring and zeroing stale
/// buckets as time moves forward) rather than reallocating, per §9 "Ring
/// buffer and tiered history".
struct Tier {
	buckets: Vec<StatPoint>,
	bucket_span: Duration,
	epoch: Instant,
	current_index: usize,
}

impl Tier {
	fn new(capacity: usize, bucket_span: Duration) -> Self {
		Tier {
			buckets: vec![StatPoint::default(); capacity],
			bucket_span,
			epoch: Instant::now(),
			current_index: 0,
		}
	}

	fn bucket_for_now(&mut self) -> &mut StatPoint {
		let elapsed = self.epoch.elapsed();
		let target_index = (elapsed.as_nanos() / self.bucket_span.as_nanos().max(1)) as usize % self.buckets.len();
		if target_index != self.current_index {
			// advancing into new buckets clears anything stale left over
			// from a prior lap around the ring
			let mut idx = self.current_index;
			while idx != target_index {
				idx = (idx + 1) % self.buckets.len();
				self.buckets[idx] = StatPoint::default();
			}
			self.current_index = target_index;
		}
		&mut self.buckets[self.current_index]
	}

	fn record(&mut self, success: bool, latency_ms: u64) {
		let bucket = self.bucket_for_now();
		bucket.requests += 1;
		if success {
			bucket.successes += 1;
		}
		bucket.total_latency_ms += latency_ms;
	}

	fn aggregate(&self) -> StatPoint {
		let mut total = StatPoint::default();
		for b in &self.buckets {
			total.merge(b);
		}
		total
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatedStatSummary {
	pub schema_version: u32,
	pub fine: StatPoint,
	pub medium: StatPoint,
	pub coarse: StatPoint,
}

/// Tiered history and request counters. `fine` covers minutes at
/// second-level resolution, `medium` covers hours at minute-level
/// resolution, `coarse` covers weeks at hour-level resolution — the same
/// fine/medium/coarse split the persisted history file uses.
pub struct StatsStore {
	fine: Mutex<Tier>,
	medium: Mutex<Tier>,
	coarse: Mutex<Tier>,
}

impl Default for StatsStore {
	fn default() -> Self {
		StatsStore {
			fine: Mutex::new(Tier::new(300, Duration::from_secs(1))),
			medium: Mutex::new(Tier::new(180, Duration::from_secs(60))),
			coarse: Mutex::new(Tier::new(168, Duration::from_secs(60 * 60))),
		}
	}
}

impl StatsStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record_request(&self, success: bool, latency_ms: u64) {
		self.fine.lock().record(success, latency_ms);
		self.medium.lock().record(success, latency_ms);
		self.coarse.lock().record(success, latency_ms);
	}

	pub fn summary(&self) -> AggregatedStatSummary {
		AggregatedStatSummary {
			schema_version: SCHEMA_VERSION,
			fine: self.fine.lock().aggregate(),
			medium: self.medium.lock().aggregate(),
			coarse: self.coarse.lock().aggregate(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn records_accumulate_across_tiers() {
		let store = StatsStore::new();
		store.record_request(true, 100);
		store.record_request(false, 200);
		let summary = store.summary();
		assert_eq!(summary.schema_version, 2);
		assert_eq!(summary.fine.requests, 2);
		assert_eq!(summary.fine.successes, 1);
		assert_eq!(summary.fine.total_latency_ms, 300);
		assert_eq!(summary.medium.requests, 2);
		assert_eq!(summary.coarse.requests, 2);
	}
}
