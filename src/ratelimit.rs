//! Per-credential token bucket rate limiter. C3 of the routing core.
//!
//! Lock-free token bucket forked in spirit from the teacher's
//! `http::localratelimit::ratelimit` module: atomics only, refill computed
//! lazily on access rather than via a background timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
	/// Sustained rate. Zero means permissive (no limiting), per §4.3.
	pub requests_per_minute: u64,
	pub burst: u64,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		RateLimitConfig {
			requests_per_minute: 0,
			burst: 1,
		}
	}
}

#[derive(Debug)]
pub struct TokenBucket {
	available: AtomicU64,
	capacity: u64,
	refill_amount: u64,
	refill_interval: Duration,
	refill_at_nanos: AtomicU64,
	epoch: Instant,
	permissive: bool,
}

pub struct LimitResult {
	pub allowed: bool,
	/// Hint of how long until the next token would be available.
	pub wait_time: Duration,
}

impl TokenBucket {
	pub fn new(cfg: &RateLimitConfig) -> Self {
		if cfg.requests_per_minute == 0 {
			return TokenBucket {
				available: AtomicU64::new(0),
				capacity: 0,
				refill_amount: 0,
				refill_interval: Duration::from_secs(1),
				refill_at_nanos: AtomicU64::new(0),
				epoch: Instant::now(),
				permissive: true,
			};
		}
		let capacity = cfg.burst.max(1);
		let refill_interval = Duration::from_secs(60);
		TokenBucket {
			available: AtomicU64::new(capacity),
			capacity,
			refill_amount: cfg.requests_per_minute,
			refill_interval,
			refill_at_nanos: AtomicU64::new(refill_interval.as_nanos() as u64),
			epoch: Instant::now(),
			permissive: false,
		}
	}

	fn now_nanos(&self) -> u64 {
		self.epoch.elapsed().as_nanos() as u64
	}

	fn refill(&self) {
		let now = self.now_nanos();
		loop {
			let refill_at = self.refill_at_nanos.load(Ordering::Acquire);
			if now < refill_at {
				return;
			}
			let interval_nanos = self.refill_interval.as_nanos() as u64;
			let elapsed = now - refill_at;
			let intervals = elapsed / interval_nanos + 1;
			let next_refill = refill_at + intervals * interval_nanos;
			if self
				.refill_at_nanos
				.compare_exchange(refill_at, next_refill, Ordering::AcqRel, Ordering::Acquire)
				.is_err()
			{
				continue;
			}
			let amount = intervals * self.refill_amount;
			let _ = self
				.available
				.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
					Some((v + amount).min(self.capacity))
				});
			return;
		}
	}

	/// Read-only check: would a token be available right now. Never mutates.
	pub fn peek(&self) -> bool {
		if self.permissive {
			return true;
		}
		self.refill();
		self.available.load(Ordering::Acquire) > 0
	}

	/// Attempt to consume a single token.
	pub fn check(&self) -> LimitResult {
		if self.permissive {
			return LimitResult {
				allowed: true,
				wait_time: Duration::ZERO,
			};
		}
		self.refill();
		loop {
			let avail = self.available.load(Ordering::Acquire);
			if avail == 0 {
				let refill_at = self.refill_at_nanos.load(Ordering::Acquire);
				let now = self.now_nanos();
				let wait = Duration::from_nanos(refill_at.saturating_sub(now));
				return LimitResult {
					allowed: false,
					wait_time: wait,
				};
			}
			if self
				.available
				.compare_exchange(avail, avail - 1, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				return LimitResult {
					allowed: true,
					wait_time: Duration::ZERO,
				};
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn permissive_when_rpm_zero() {
		let bucket = TokenBucket::new(&RateLimitConfig {
			requests_per_minute: 0,
			burst: 1,
		});
		for _ in 0..1000 {
			assert!(bucket.check().allowed);
		}
	}

	#[test]
	fn burst_then_denied() {
		let bucket = TokenBucket::new(&RateLimitConfig {
			requests_per_minute: 60,
			burst: 3,
		});
		assert!(bucket.check().allowed);
		assert!(bucket.check().allowed);
		assert!(bucket.check().allowed);
		let r = bucket.check();
		assert!(!r.allowed);
		assert!(r.wait_time > Duration::ZERO);
	}

	#[test]
	fn peek_does_not_mutate() {
		let bucket = TokenBucket::new(&RateLimitConfig {
			requests_per_minute: 60,
			burst: 1,
		});
		assert!(bucket.peek());
		assert!(bucket.peek());
		assert!(bucket.check().allowed);
		assert!(!bucket.check().allowed);
	}
}
