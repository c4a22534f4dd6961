//! Per-credential circuit breaker state machine. C2 of the routing core.
//!
//! State transitions are reconciled lazily on every public call (so a
//! breaker nobody is polling still reports the correct state once someone
//! asks), and eagerly by an owned background task per §9 "Timers" — each
//! breaker's `spawn_background` task calls the same reconciliation and is
//! cancelled on `Drop`, matching the teacher's "owned task with explicit
//! cancellation" guidance rather than a detached `setInterval`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
	Closed,
	Open,
	HalfOpen,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerConfig {
	pub failure_threshold: u32,
	#[serde(with = "crate::serdes::serde_millis")]
	pub failure_window: Duration,
	#[serde(with = "crate::serdes::serde_millis")]
	pub cooldown_period: Duration,
	#[serde(with = "crate::serdes::serde_millis")]
	pub half_open_timeout: Duration,
}

impl Default for BreakerConfig {
	fn default() -> Self {
		BreakerConfig {
			failure_threshold: 5,
			failure_window: Duration::from_secs(30),
			cooldown_period: Duration::from_secs(30),
			half_open_timeout: Duration::from_secs(10),
		}
	}
}

#[derive(Debug)]
struct Inner {
	state: CircuitState,
	failures: VecDeque<Instant>,
	opened_at: Option<Instant>,
	half_open_started_at: Option<Instant>,
	half_open_request_in_flight: bool,
	/// Reason the last forced/auto transition to Open happened, for observability.
	last_open_reason: &'static str,
}

pub struct CircuitBreaker {
	cfg: BreakerConfig,
	inner: Mutex<Inner>,
	background: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerStats {
	pub state: CircuitState,
	pub recent_failures: usize,
	pub opened_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub enum PredictionLevel {
	Low,
	Elevated,
	High,
	Critical,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PredictionData {
	pub score: u32,
	pub level: PredictionLevel,
}

impl CircuitBreaker {
	pub fn new(cfg: BreakerConfig) -> Self {
		CircuitBreaker {
			cfg,
			inner: Mutex::new(Inner {
				state: CircuitState::Closed,
				failures: VecDeque::new(),
				opened_at: None,
				half_open_started_at: None,
				half_open_request_in_flight: false,
				last_open_reason: "",
			}),
			background: Mutex::new(None),
		}
	}

	/// Spawns an owned reconciliation task, stopped when the returned
	/// `CircuitBreaker` (held behind the same `Arc`) is dropped.
	pub fn spawn_background(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		let period = (self.cfg.cooldown_period.min(self.cfg.half_open_timeout) / 4).max(Duration::from_millis(10));
		let handle = tokio::spawn(async move {
			let mut interval = tokio::time::interval(period);
			loop {
				interval.tick().await;
				let Some(strong) = weak.upgrade() else {
					return;
				};
				strong.reconcile();
			}
		});
		*self.background.lock() = Some(handle);
	}

	/// Re-checks timer-driven transitions (Open -> HalfOpen on cooldown
	/// elapsed, HalfOpen -> Open on half-open timeout) even if nobody is
	/// actively polling this breaker. Safe to call redundantly.
	pub fn reconcile(&self) {
		let mut inner = self.inner.lock();
		self.reconcile_locked(&mut inner);
	}

	fn reconcile_locked(&self, inner: &mut Inner) {
		let now = Instant::now();
		match inner.state {
			CircuitState::Open => {
				if let Some(opened_at) = inner.opened_at
					&& now.duration_since(opened_at) >= self.cfg.cooldown_period
				{
					inner.state = CircuitState::HalfOpen;
					inner.half_open_started_at = Some(now);
					inner.half_open_request_in_flight = false;
				}
			},
			CircuitState::HalfOpen => {
				if let Some(started) = inner.half_open_started_at
					&& now.duration_since(started) >= self.cfg.half_open_timeout
				{
					inner.state = CircuitState::Open;
					inner.opened_at = Some(now);
					inner.half_open_started_at = None;
					inner.half_open_request_in_flight = false;
					inner.last_open_reason = "half_open_timeout";
				}
			},
			CircuitState::Closed => {},
		}
	}

	pub fn is_available(&self) -> bool {
		let mut inner = self.inner.lock();
		self.reconcile_locked(&mut inner);
		!matches!(inner.state, CircuitState::Open)
	}

	pub fn state(&self) -> CircuitState {
		let mut inner = self.inner.lock();
		self.reconcile_locked(&mut inner);
		inner.state
	}

	/// HalfOpen admits at most one outstanding probe (§3, §8 property 3).
	pub fn try_acquire_test_request(&self) -> bool {
		let mut inner = self.inner.lock();
		self.reconcile_locked(&mut inner);
		match inner.state {
			CircuitState::HalfOpen => {
				if inner.half_open_request_in_flight {
					false
				} else {
					inner.half_open_request_in_flight = true;
					true
				}
			},
			CircuitState::Closed => true,
			CircuitState::Open => false,
		}
	}

	pub fn record_success(&self) {
		let mut inner = self.inner.lock();
		self.reconcile_locked(&mut inner);
		match inner.state {
			CircuitState::HalfOpen => {
				inner.state = CircuitState::Closed;
				inner.failures.clear();
				inner.opened_at = None;
				inner.half_open_started_at = None;
				inner.half_open_request_in_flight = false;
			},
			CircuitState::Closed => {
				// A success doesn't need to clear failures outright, but stale
				// ones are trimmed the same way record_failure trims them.
				self.trim_failures(&mut inner.failures);
			},
			CircuitState::Open => {},
		}
	}

	pub fn record_failure(&self) {
		let mut inner = self.inner.lock();
		self.reconcile_locked(&mut inner);
		match inner.state {
			CircuitState::HalfOpen => {
				inner.state = CircuitState::Open;
				inner.opened_at = Some(Instant::now());
				inner.half_open_started_at = None;
				inner.half_open_request_in_flight = false;
				inner.last_open_reason = "half_open_probe_failed";
			},
			CircuitState::Closed => {
				inner.failures.push_back(Instant::now());
				self.trim_failures(&mut inner.failures);
				if inner.failures.len() as u32 >= self.cfg.failure_threshold {
					inner.state = CircuitState::Open;
					inner.opened_at = Some(Instant::now());
					inner.last_open_reason = "failure_threshold";
				}
			},
			CircuitState::Open => {},
		}
	}

	fn trim_failures(&self, failures: &mut VecDeque<Instant>) {
		let cutoff = Instant::now()
			.checked_sub(self.cfg.failure_window)
			.unwrap_or_else(Instant::now);
		while let Some(front) = failures.front() {
			if *front < cutoff {
				failures.pop_front();
			} else {
				break;
			}
		}
	}

	pub fn force_state(&self, state: CircuitState) {
		let mut inner = self.inner.lock();
		inner.state = state;
		inner.half_open_request_in_flight = false;
		inner.half_open_started_at = None;
		match state {
			CircuitState::Open => inner.opened_at = Some(Instant::now()),
			CircuitState::HalfOpen => inner.half_open_started_at = Some(Instant::now()),
			CircuitState::Closed => {
				inner.opened_at = None;
				inner.failures.clear();
			},
		}
	}

	pub fn get_stats(&self) -> BreakerStats {
		let mut inner = self.inner.lock();
		self.reconcile_locked(&mut inner);
		BreakerStats {
			state: inner.state,
			recent_failures: inner.failures.len(),
			opened_at: inner.opened_at,
		}
	}

	/// Deterministic composite prediction score (0-100), observability only
	/// per §4.2 — never consulted for admission.
	pub fn get_prediction_data(&self) -> PredictionData {
		let mut inner = self.inner.lock();
		self.reconcile_locked(&mut inner);
		if matches!(inner.state, CircuitState::Open) {
			return PredictionData {
				score: 100,
				level: PredictionLevel::Critical,
			};
		}
		let threshold = self.cfg.failure_threshold.max(1) as f64;
		let ratio = (inner.failures.len() as f64 / threshold).min(1.0);

		let accel = acceleration(&inner.failures, self.cfg.failure_window);

		let recency = match inner.failures.back() {
			None => 0.0,
			Some(last) => {
				let age = Instant::now().duration_since(*last).as_secs_f64();
				let window = self.cfg.failure_window.as_secs_f64().max(1.0);
				(1.0 - (age / window)).clamp(0.0, 1.0)
			},
		};

		let score = (ratio * 50.0 + accel * 30.0 + recency * 20.0).round() as u32;
		let score = score.min(99); // 100 is reserved for Open
		let level = match score {
			0..=24 => PredictionLevel::Low,
			25..=49 => PredictionLevel::Elevated,
			50..=74 => PredictionLevel::High,
			_ => PredictionLevel::Critical,
		};
		PredictionData { score, level }
	}
}

/// Ratio of failures landing in the newer half of the window vs. the older
/// half; 1.0 means all recent failures are accelerating toward now, 0.0
/// means they are evenly or backward distributed.
fn acceleration(failures: &VecDeque<Instant>, window: Duration) -> f64 {
	if failures.len() < 2 {
		return 0.0;
	}
	let now = Instant::now();
	let midpoint = window.as_secs_f64() / 2.0;
	let (older, newer): (Vec<_>, Vec<_>) = failures
		.iter()
		.partition(|f| now.duration_since(**f).as_secs_f64() > midpoint);
	if failures.is_empty() {
		return 0.0;
	}
	(newer.len() as f64 - older.len() as f64).max(0.0) / failures.len() as f64
}

impl Drop for CircuitBreaker {
	fn drop(&mut self) {
		if let Some(handle) = self.background.lock().take() {
			handle.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cfg() -> BreakerConfig {
		BreakerConfig {
			failure_threshold: 3,
			failure_window: Duration::from_secs(10),
			cooldown_period: Duration::from_millis(50),
			half_open_timeout: Duration::from_millis(50),
		}
	}

	#[test]
	fn opens_after_threshold_failures() {
		let b = CircuitBreaker::new(cfg());
		assert!(b.is_available());
		b.record_failure();
		b.record_failure();
		assert!(b.is_available());
		b.record_failure();
		assert!(!b.is_available());
		assert_eq!(b.state(), CircuitState::Open);
	}

	#[tokio::test(start_paused = true)]
	async fn transitions_to_half_open_after_cooldown() {
		let b = CircuitBreaker::new(cfg());
		b.force_state(CircuitState::Open);
		assert!(!b.is_available());
		tokio::time::advance(Duration::from_millis(60)).await;
		assert!(b.is_available());
		assert_eq!(b.state(), CircuitState::HalfOpen);
	}

	#[tokio::test(start_paused = true)]
	async fn half_open_admits_single_probe() {
		let b = CircuitBreaker::new(cfg());
		b.force_state(CircuitState::HalfOpen);
		assert!(b.try_acquire_test_request());
		assert!(!b.try_acquire_test_request());
	}

	#[tokio::test(start_paused = true)]
	async fn half_open_reverts_to_open_on_timeout() {
		let b = CircuitBreaker::new(cfg());
		b.force_state(CircuitState::HalfOpen);
		tokio::time::advance(Duration::from_millis(60)).await;
		assert_eq!(b.state(), CircuitState::Open);
	}

	#[test]
	fn success_in_half_open_closes() {
		let b = CircuitBreaker::new(cfg());
		b.force_state(CircuitState::HalfOpen);
		b.record_success();
		assert_eq!(b.state(), CircuitState::Closed);
	}

	#[test]
	fn failure_in_half_open_reopens() {
		let b = CircuitBreaker::new(cfg());
		b.force_state(CircuitState::HalfOpen);
		b.record_failure();
		assert_eq!(b.state(), CircuitState::Open);
	}

	#[test]
	fn prediction_is_100_when_open() {
		let b = CircuitBreaker::new(cfg());
		b.force_state(CircuitState::Open);
		let pred = b.get_prediction_data();
		assert_eq!(pred.score, 100);
	}
}
