//! Credential record: identity plus live state (§3 "Credential record").

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::ratelimit::{RateLimitConfig, TokenBucket};
use crate::ringbuffer::LatencyRing;

const LATENCY_RING_CAPACITY: usize = 256;

pub struct Credential {
	pub index: usize,
	pub key_id: String,
	secret: SecretString,
	pub provider: Option<String>,

	pub(super) in_flight: AtomicU32,
	pub(super) total_requests: AtomicU64,
	pub(super) success_count: AtomicU64,

	pub(super) rate_limited_at: Mutex<Option<Instant>>,
	pub(super) rate_limit_cooldown_ms: AtomicU64,
	pub(super) rate_limited_count: AtomicU64,

	pub(super) last_success: Mutex<Option<Instant>>,
	pub(super) is_slow: AtomicBool,
	pub(super) is_quarantined: AtomicBool,
	pub(super) health_score: AtomicU32,

	pub(super) latency: LatencyRing,
	pub breaker: Arc<CircuitBreaker>,
	pub(super) limiter: TokenBucket,
}

impl Credential {
	pub fn new(
		index: usize,
		secret: SecretString,
		provider: Option<String>,
		breaker_cfg: BreakerConfig,
		rate_limit_cfg: RateLimitConfig,
		base_cooldown_ms: u64,
	) -> Self {
		Credential {
			index,
			key_id: key_id_for(secret.expose_secret()),
			secret,
			provider,
			in_flight: AtomicU32::new(0),
			total_requests: AtomicU64::new(0),
			success_count: AtomicU64::new(0),
			rate_limited_at: Mutex::new(None),
			rate_limit_cooldown_ms: AtomicU64::new(base_cooldown_ms),
			rate_limited_count: AtomicU64::new(0),
			last_success: Mutex::new(None),
			is_slow: AtomicBool::new(false),
			is_quarantined: AtomicBool::new(false),
			health_score: AtomicU32::new(100),
			latency: LatencyRing::new(LATENCY_RING_CAPACITY),
			breaker: Arc::new(CircuitBreaker::new(breaker_cfg)),
			limiter: TokenBucket::new(&rate_limit_cfg),
		}
	}

	pub fn secret(&self) -> &SecretString {
		&self.secret
	}

	pub fn in_flight(&self) -> u32 {
		self.in_flight.load(Ordering::Relaxed)
	}

	pub fn total_requests(&self) -> u64 {
		self.total_requests.load(Ordering::Relaxed)
	}

	pub fn success_count(&self) -> u64 {
		self.success_count.load(Ordering::Relaxed)
	}

	pub fn is_slow(&self) -> bool {
		self.is_slow.load(Ordering::Relaxed)
	}

	pub fn is_quarantined(&self) -> bool {
		self.is_quarantined.load(Ordering::Relaxed)
	}

	pub fn health_score(&self) -> u32 {
		self.health_score.load(Ordering::Relaxed)
	}

	pub fn rate_limit_cooldown_remaining(&self) -> Duration {
		let at = *self.rate_limited_at.lock();
		let Some(at) = at else {
			return Duration::ZERO;
		};
		let cooldown = Duration::from_millis(self.rate_limit_cooldown_ms.load(Ordering::Relaxed));
		let elapsed = at.elapsed();
		cooldown.saturating_sub(elapsed)
	}

	pub fn is_rate_limit_cooldown_active(&self) -> bool {
		self.rate_limit_cooldown_remaining() > Duration::ZERO
	}

	/// Decay a stale cooldown back to nothing if it's older than `decay_ms`.
	pub(super) fn decay_rate_limit_if_stale(&self, decay: Duration, base_cooldown_ms: u64) {
		let mut at = self.rate_limited_at.lock();
		if let Some(ts) = *at
			&& ts.elapsed() >= decay
		{
			*at = None;
			self.rate_limit_cooldown_ms
				.store(base_cooldown_ms, Ordering::Relaxed);
		}
	}

	pub fn latency_stats(&self, within: Option<Duration>) -> crate::ringbuffer::Stats {
		self.latency.stats(within)
	}
}

/// A stable, non-secret identity derived from the key: first 8 chars plus
/// length, so two keys sharing a short prefix don't collide and the secret
/// itself is never retained outside `Credential::secret`.
pub(super) fn key_id_for(secret: &str) -> String {
	let prefix: String = secret.chars().take(8).collect();
	format!("{prefix}…({})", secret.len())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn key_id_never_contains_full_secret() {
		let id = key_id_for("sk-ant-REDACTED");
		assert!(!id.contains("very-secret-value"));
		assert!(id.starts_with("sk-ant-v"));
	}
}
