//! Per-model pool state and account-level rate-limit detection. Part of C5.
//!
//! Two distinct concepts live here: a per-model concurrency gate plus
//! pool-wide rate-limit cooldown (`ModelState`), and detection of an
//! account-level rate limit from a burst of per-key rate limits hitting
//! together in a short window (`AccountRateLimitState`), per §4.5.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const MAX_POOL_COOLDOWN: Duration = Duration::from_secs(10);
const POOL_COOLDOWN_BASE: Duration = Duration::from_millis(250);

pub struct ModelState {
	pub name: String,
	rate_limited_until: Mutex<Option<Instant>>,
	escalation: AtomicU32,
	last_hit_at: Mutex<Option<Instant>>,
	in_flight: AtomicU32,
	/// Configured concurrency ceiling; 0 means unlimited. Restored by
	/// `restore_static_limit` after a router-driven override expires.
	static_limit: AtomicU32,
	effective_limit: AtomicU32,
}

impl ModelState {
	pub fn new(name: String, static_limit: u32) -> Self {
		ModelState {
			name,
			rate_limited_until: Mutex::new(None),
			escalation: AtomicU32::new(0),
			last_hit_at: Mutex::new(None),
			in_flight: AtomicU32::new(0),
			static_limit: AtomicU32::new(static_limit),
			effective_limit: AtomicU32::new(static_limit),
		}
	}

	pub fn in_flight(&self) -> u32 {
		self.in_flight.load(Ordering::Relaxed)
	}

	pub fn effective_limit(&self) -> u32 {
		self.effective_limit.load(Ordering::Relaxed)
	}

	/// Attempts to reserve a concurrency slot for this model. `0` means
	/// unlimited.
	pub fn try_acquire_slot(&self) -> bool {
		let limit = self.effective_limit.load(Ordering::Relaxed);
		if limit == 0 {
			self.in_flight.fetch_add(1, Ordering::Relaxed);
			return true;
		}
		loop {
			let cur = self.in_flight.load(Ordering::Acquire);
			if cur >= limit {
				return false;
			}
			if self
				.in_flight
				.compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				return true;
			}
		}
	}

	pub fn release_slot(&self) {
		let _ = self
			.in_flight
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)));
	}

	pub fn set_effective_limit(&self, limit: u32) {
		self.effective_limit.store(limit, Ordering::Relaxed);
	}

	pub fn restore_static_limit(&self) {
		let s = self.static_limit.load(Ordering::Relaxed);
		self.effective_limit.store(s, Ordering::Relaxed);
	}

	pub fn cooldown_remaining(&self) -> Duration {
		let until = *self.rate_limited_until.lock();
		match until {
			Some(t) => t.saturating_duration_since(Instant::now()),
			None => Duration::ZERO,
		}
	}

	pub fn is_cooling_down(&self) -> bool {
		self.cooldown_remaining() > Duration::ZERO
	}

	/// Records a pool-wide rate-limit hit: escalates the cooldown
	/// exponentially (capped at `MAX_POOL_COOLDOWN`, jittered), or resets the
	/// escalation counter first if the previous hit is old enough that this
	/// one looks unrelated, per §4.5 "Pool-level rate limit".
	pub fn record_rate_limit_hit(&self, decay_after: Duration) {
		let now = Instant::now();
		{
			let mut last = self.last_hit_at.lock();
			if let Some(prev) = *last
				&& now.duration_since(prev) >= decay_after
			{
				self.escalation.store(0, Ordering::Relaxed);
			}
			*last = Some(now);
		}
		let level = self.escalation.fetch_add(1, Ordering::AcqRel);
		let shift = level.min(8);
		let backoff = POOL_COOLDOWN_BASE
			.saturating_mul(1u32 << shift)
			.min(MAX_POOL_COOLDOWN);
		let jittered = crate::backoff::jitter(backoff);
		*self.rate_limited_until.lock() = Some(now + jittered);
	}

	/// Extends (never shortens) the cooldown to honor a provider-supplied
	/// pacing header, per §4.5 "Rate-limit headers".
	pub fn extend_cooldown_until(&self, until: Instant) {
		let mut cur = self.rate_limited_until.lock();
		if cur.is_none_or(|existing| until > existing) {
			*cur = Some(until);
		}
	}
}

/// Sliding window of recent per-key rate-limit hits, keyed by credential
/// index, used to detect an account-level (not per-key) rate limit: many
/// distinct keys rate-limited together in a short window implies the
/// upstream account itself, not any one key, is throttled.
pub struct AccountRateLimitState {
	hits: Mutex<VecDeque<(usize, Instant)>>,
	cooldown_until: Mutex<Option<Instant>>,
}

impl Default for AccountRateLimitState {
	fn default() -> Self {
		AccountRateLimitState {
			hits: Mutex::new(VecDeque::new()),
			cooldown_until: Mutex::new(None),
		}
	}
}

impl AccountRateLimitState {
	/// Records a hit and returns `true` if the unique-key count within
	/// `window` reaches `unique_key_threshold`, triggering account-level
	/// cooldown for `cooldown`.
	pub fn record_hit(
		&self,
		key_index: usize,
		window: Duration,
		unique_key_threshold: usize,
		cooldown: Duration,
	) -> bool {
		let now = Instant::now();
		let mut hits = self.hits.lock();
		hits.push_back((key_index, now));
		while let Some(&(_, ts)) = hits.front() {
			if now.duration_since(ts) > window {
				hits.pop_front();
			} else {
				break;
			}
		}
		let unique: std::collections::HashSet<usize> = hits.iter().map(|(k, _)| *k).collect();
		if unique.len() >= unique_key_threshold {
			*self.cooldown_until.lock() = Some(now + cooldown);
			hits.clear();
			true
		} else {
			false
		}
	}

	pub fn cooldown_remaining(&self) -> Duration {
		let until = *self.cooldown_until.lock();
		match until {
			Some(t) => t.saturating_duration_since(Instant::now()),
			None => Duration::ZERO,
		}
	}

	pub fn is_cooling_down(&self) -> bool {
		self.cooldown_remaining() > Duration::ZERO
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn slot_gate_respects_limit() {
		let m = ModelState::new("gpt".to_string(), 2);
		assert!(m.try_acquire_slot());
		assert!(m.try_acquire_slot());
		assert!(!m.try_acquire_slot());
		m.release_slot();
		assert!(m.try_acquire_slot());
	}

	#[test]
	fn zero_limit_is_unlimited() {
		let m = ModelState::new("gpt".to_string(), 0);
		for _ in 0..100 {
			assert!(m.try_acquire_slot());
		}
	}

	#[test]
	fn rate_limit_hit_escalates() {
		let m = ModelState::new("gpt".to_string(), 0);
		m.record_rate_limit_hit(Duration::from_secs(60));
		let first = m.cooldown_remaining();
		assert!(first > Duration::ZERO);
		m.record_rate_limit_hit(Duration::from_secs(60));
		let second = m.cooldown_remaining();
		// Escalated cooldown should generally be >= the first (allow for jitter
		// by comparing against the unjittered floor of level 0).
		assert!(second > Duration::from_millis(100));
		let _ = first;
	}

	#[test]
	fn restore_static_limit_resets_override() {
		let m = ModelState::new("gpt".to_string(), 5);
		m.set_effective_limit(1);
		assert_eq!(m.effective_limit(), 1);
		m.restore_static_limit();
		assert_eq!(m.effective_limit(), 5);
	}

	#[test]
	fn account_level_trigger_on_unique_key_threshold() {
		let s = AccountRateLimitState::default();
		assert!(!s.record_hit(0, Duration::from_secs(10), 3, Duration::from_secs(5)));
		assert!(!s.record_hit(1, Duration::from_secs(10), 3, Duration::from_secs(5)));
		assert!(s.record_hit(2, Duration::from_secs(10), 3, Duration::from_secs(5)));
		assert!(s.is_cooling_down());
	}

	#[test]
	fn account_level_ignores_repeated_same_key() {
		let s = AccountRateLimitState::default();
		for _ in 0..10 {
			assert!(!s.record_hit(0, Duration::from_secs(10), 3, Duration::from_secs(5)));
		}
		assert!(!s.is_cooling_down());
	}
}
