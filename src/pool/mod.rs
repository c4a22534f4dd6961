//! Credential pool. C5 of the routing core — the largest component.
//!
//! Owns the live credential vector (hot-swappable via `reload_keys`),
//! delegates per-credential resilience to [`crate::breaker::CircuitBreaker`]
//! and [`crate::ratelimit::TokenBucket`], and layers pool-wide and
//! account-wide rate-limit detection on top. The credential vector itself
//! is an `ArcSwap<Vec<Arc<Credential>>>` so readers (every `acquire_key`
//! call) get a lock-free snapshot, matching the teacher's preference for
//! `ArcSwap` over a `RwLock` on hot read paths (`client/dns.rs`).

mod credential;
mod health;
mod model;

pub use credential::Credential;
pub use health::{HealthScoreWeights, KeySelectionConfig};
pub use model::{AccountRateLimitState, ModelState};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};

use crate::breaker::{BreakerConfig, CircuitState};
use crate::ratelimit::RateLimitConfig;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PoolConfig {
	pub breaker: BreakerConfig,
	pub rate_limit: RateLimitConfig,
	#[serde(with = "crate::serdes::serde_millis")]
	pub base_rate_limit_cooldown: Duration,
	#[serde(with = "crate::serdes::serde_millis")]
	pub rate_limit_cooldown_decay: Duration,
	pub key_selection: KeySelectionConfig,
	/// 0 means unlimited in-flight requests per credential.
	#[serde(default)]
	pub max_in_flight_per_key: u32,
	/// 0 means unlimited concurrency for a model with no explicit entry in
	/// the per-model overrides map.
	#[serde(default)]
	pub default_model_concurrency: u32,
	#[serde(default, with = "crate::serdes::serde_millis")]
	pub pool_rate_limit_decay: Duration,
	#[serde(with = "crate::serdes::serde_millis")]
	pub account_rate_limit_window: Duration,
	pub account_rate_limit_unique_keys: usize,
	#[serde(with = "crate::serdes::serde_millis")]
	pub account_rate_limit_cooldown: Duration,
	/// Untagged (`provider: None`) credentials serve only this provider,
	/// per §4.5 step 2's cost-safety carve-out — never an arbitrary named
	/// one.
	#[serde(default)]
	pub default_provider_name: Option<String>,
}

impl Default for PoolConfig {
	fn default() -> Self {
		PoolConfig {
			breaker: BreakerConfig::default(),
			rate_limit: RateLimitConfig::default(),
			base_rate_limit_cooldown: Duration::from_secs(1),
			rate_limit_cooldown_decay: Duration::from_secs(300),
			key_selection: KeySelectionConfig::default(),
			max_in_flight_per_key: 0,
			default_model_concurrency: 0,
			pool_rate_limit_decay: Duration::from_secs(60),
			account_rate_limit_window: Duration::from_secs(10),
			account_rate_limit_unique_keys: 3,
			account_rate_limit_cooldown: Duration::from_secs(30),
			default_provider_name: None,
		}
	}
}

/// A key loaded from config: secret plus an optional provider pin. `None`
/// leaves provider resolution to the caller (the default provider or a
/// per-request override), per §3 "Credential record".
pub struct KeySpec {
	pub secret: SecretString,
	pub provider: Option<String>,
}

pub struct AcquiredKey {
	pub index: usize,
	pub key_id: String,
	pub secret: SecretString,
	pub provider: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
	/// No credential in the pool matches the requested provider filter.
	NoMatchingProvider,
	/// Every candidate is excluded, breaker-open, rate-limited, or at
	/// capacity, and the fallback/last-resort steps also found nothing
	/// (an empty pool).
	PoolExhausted,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct KeySnapshot {
	pub index: usize,
	pub key_id: String,
	pub provider: Option<String>,
	pub state: CircuitState,
	pub in_flight: u32,
	pub total_requests: u64,
	pub success_count: u64,
	pub health_score: u32,
	pub is_slow: bool,
	pub rate_limit_cooldown_ms: u64,
	pub latency: crate::ringbuffer::Stats,
}

pub struct CredentialPool {
	credentials: ArcSwap<Vec<Arc<Credential>>>,
	models: Mutex<HashMap<String, Arc<ModelState>>>,
	account_rl: AccountRateLimitState,
	cfg: PoolConfig,
	round_robin: AtomicUsize,
}

impl CredentialPool {
	pub fn new(cfg: PoolConfig) -> Self {
		CredentialPool {
			credentials: ArcSwap::from_pointee(Vec::new()),
			models: Mutex::new(HashMap::new()),
			account_rl: AccountRateLimitState::default(),
			cfg,
			round_robin: AtomicUsize::new(0),
		}
	}

	/// True if `credential`'s provider pin satisfies `filter`. An untagged
	/// credential (`provider: None`) also matches when `filter` names the
	/// configured default provider — the cost-safety carve-out of §4.5 step
	/// 2, so a flat/untagged key pool (the common single-provider
	/// deployment) can still serve the default provider.
	fn provider_matches(&self, filter: Option<&str>, credential_provider: &Option<String>) -> bool {
		match (filter, credential_provider) {
			(None, _) => true,
			(Some(want), Some(have)) => want == have,
			(Some(want), None) => self.cfg.default_provider_name.as_deref() == Some(want),
		}
	}

	/// Replaces the credential vector outright. Used on first load; prefer
	/// [`Self::reload_keys`] for subsequent hot reloads so live state isn't
	/// discarded for keys that are still present.
	pub fn load_keys(&self, keys: Vec<KeySpec>) {
		let built: Vec<Arc<Credential>> = keys
			.into_iter()
			.enumerate()
			.map(|(idx, spec)| {
				let cred = Arc::new(Credential::new(
					idx,
					spec.secret,
					spec.provider,
					self.cfg.breaker,
					self.cfg.rate_limit,
					self.cfg.base_rate_limit_cooldown.as_millis() as u64,
				));
				cred.breaker.clone().spawn_background();
				cred
			})
			.collect();
		self.credentials.store(Arc::new(built));
	}

	/// Hot reload: credentials whose `key_id` is unchanged keep their live
	/// state (breaker, rate limiter, latency history, counters); new keys
	/// are constructed fresh and removed keys are dropped, per §4.5
	/// "Reload preserves live state".
	pub fn reload_keys(&self, keys: Vec<KeySpec>) {
		let existing = self.credentials.load();
		let mut by_key_id: HashMap<String, Arc<Credential>> = HashMap::new();
		for cred in existing.iter() {
			by_key_id.insert(cred.key_id.clone(), cred.clone());
		}

		let built: Vec<Arc<Credential>> = keys
			.into_iter()
			.enumerate()
			.map(|(idx, spec)| {
				let key_id = credential::key_id_for(spec.secret.expose_secret());
				if let Some(prev) = by_key_id.remove(&key_id) {
					if prev.index == idx {
						return prev;
					}
					// Index shifted; the credential's identity (key_id,
					// breaker, limiter, history) survives under the new
					// index since callers address credentials by index
					// only within a single acquire/record round-trip.
					return prev;
				}
				let cred = Arc::new(Credential::new(
					idx,
					spec.secret,
					spec.provider,
					self.cfg.breaker,
					self.cfg.rate_limit,
					self.cfg.base_rate_limit_cooldown.as_millis() as u64,
				));
				cred.breaker.clone().spawn_background();
				cred
			})
			.collect();
		self.credentials.store(Arc::new(built));
	}

	pub fn len(&self) -> usize {
		self.credentials.load().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn model_state(&self, model: &str) -> Arc<ModelState> {
		let mut models = self.models.lock();
		models
			.entry(model.to_string())
			.or_insert_with(|| {
				Arc::new(ModelState::new(
					model.to_string(),
					self.cfg.default_model_concurrency,
				))
			})
			.clone()
	}

	/// The full selection algorithm of §4.5 "acquireKey": filter candidates
	/// by exclusion/breaker/rate-limit, apply a provider filter (refusing an
	/// untagged pool when `cost_safety` demands a specific provider), prefer
	/// Closed over HalfOpen, prefer keys under any configured in-flight cap,
	/// decay stale cooldowns, prefer keys with no active cooldown, then pick
	/// by weighted health score or round robin. Falls back to forcing the
	/// oldest Open breaker into HalfOpen, and as a last resort resets every
	/// breaker and picks the credential with the fewest in-flight requests,
	/// so a pool never wedges permanently shut.
	pub fn acquire_key(
		&self,
		exclude: &HashSet<usize>,
		provider_filter: Option<&str>,
	) -> Result<AcquiredKey, AcquireError> {
		let snapshot = self.credentials.load();
		if snapshot.is_empty() {
			return Err(AcquireError::PoolExhausted);
		}

		let provider_matches = |c: &Arc<Credential>| -> bool { self.provider_matches(provider_filter, &c.provider) };

		if !snapshot.iter().any(provider_matches) {
			return Err(AcquireError::NoMatchingProvider);
		}

		self.decay_stale_cooldowns(&snapshot);

		let base_candidates: Vec<&Arc<Credential>> = snapshot
			.iter()
			.filter(|c| !exclude.contains(&c.index))
			.filter(|c| provider_matches(c))
			.filter(|c| c.breaker.is_available())
			.filter(|c| c.limiter.peek())
			.filter(|c| {
				self.cfg.max_in_flight_per_key == 0
					|| c.in_flight() < self.cfg.max_in_flight_per_key
			})
			.collect();

		if let Some(acquired) = self.pick_and_consume(&base_candidates) {
			return Ok(acquired);
		}

		// Fallback: prefer an explicit probe over giving up, by nudging the
		// oldest Open breaker into HalfOpen (§4.5 "Fallback").
		if let Some(acquired) = self.force_oldest_open_to_half_open(&snapshot, exclude, provider_filter) {
			return Ok(acquired);
		}

		// Last resort: every candidate is structurally blocked. Reset every
		// breaker and hand out the least-loaded credential rather than
		// failing the request outright.
		self.last_resort(&snapshot, exclude, provider_filter)
	}

	/// Narrows `candidates` to non-cooldown ones when any exist, prefers
	/// `Closed` over `HalfOpen`, then selects by weighted health score (or
	/// round robin if disabled), consuming a rate-limit token on the winner.
	/// Retries against the remaining candidates if the token consume loses a
	/// race (another caller took the last token between `peek` and `check`).
	fn pick_and_consume(&self, candidates: &[&Arc<Credential>]) -> Option<AcquiredKey> {
		let mut pool: Vec<&Arc<Credential>> = candidates.to_vec();
		if pool.is_empty() {
			return None;
		}

		let non_cooldown: Vec<&Arc<Credential>> = pool
			.iter()
			.copied()
			.filter(|c| !c.is_rate_limit_cooldown_active())
			.collect();
		if !non_cooldown.is_empty() {
			pool = non_cooldown;
		}

		let closed: Vec<&Arc<Credential>> = pool
			.iter()
			.copied()
			.filter(|c| c.breaker.state() == CircuitState::Closed)
			.collect();
		if !closed.is_empty() {
			pool = closed;
		}

		while !pool.is_empty() {
			let chosen_pos = if self.cfg.key_selection.use_weighted_selection {
				weighted_index(&pool)
			} else {
				self.round_robin.fetch_add(1, Ordering::Relaxed) % pool.len()
			};
			let chosen = pool[chosen_pos];
			if chosen.limiter.check().allowed {
				chosen.in_flight.fetch_add(1, Ordering::Relaxed);
				chosen.total_requests.fetch_add(1, Ordering::Relaxed);
				return Some(AcquiredKey {
					index: chosen.index,
					key_id: chosen.key_id.clone(),
					secret: chosen.secret().clone(),
					provider: chosen.provider.clone(),
				});
			}
			pool.remove(chosen_pos);
		}
		None
	}

	fn force_oldest_open_to_half_open(
		&self,
		snapshot: &[Arc<Credential>],
		exclude: &HashSet<usize>,
		provider_filter: Option<&str>,
	) -> Option<AcquiredKey> {
		let provider_matches = |c: &&Arc<Credential>| self.provider_matches(provider_filter, &c.provider);
		let oldest_open = snapshot
			.iter()
			.filter(|c| !exclude.contains(&c.index))
			.filter(provider_matches)
			.filter(|c| c.breaker.state() == CircuitState::Open)
			.min_by_key(|c| c.breaker.get_stats().opened_at.unwrap_or_else(Instant::now))?;
		oldest_open.breaker.force_state(CircuitState::HalfOpen);
		self.pick_and_consume(&[oldest_open])
	}

	fn last_resort(
		&self,
		snapshot: &[Arc<Credential>],
		exclude: &HashSet<usize>,
		provider_filter: Option<&str>,
	) -> Result<AcquiredKey, AcquireError> {
		let provider_matches = |c: &&Arc<Credential>| self.provider_matches(provider_filter, &c.provider);
		let candidates: Vec<&Arc<Credential>> = snapshot
			.iter()
			.filter(|c| !exclude.contains(&c.index))
			.filter(provider_matches)
			.collect();
		let Some(least_loaded) = candidates.iter().min_by_key(|c| c.in_flight()) else {
			return Err(AcquireError::PoolExhausted);
		};
		for c in &candidates {
			c.breaker.force_state(CircuitState::Closed);
		}
		least_loaded.in_flight.fetch_add(1, Ordering::Relaxed);
		least_loaded.total_requests.fetch_add(1, Ordering::Relaxed);
		Ok(AcquiredKey {
			index: least_loaded.index,
			key_id: least_loaded.key_id.clone(),
			secret: least_loaded.secret().clone(),
			provider: least_loaded.provider.clone(),
		})
	}

	fn decay_stale_cooldowns(&self, snapshot: &[Arc<Credential>]) {
		let base = self.cfg.base_rate_limit_cooldown.as_millis() as u64;
		for c in snapshot {
			c.decay_rate_limit_if_stale(self.cfg.rate_limit_cooldown_decay, base);
		}
	}

	fn find(&self, index: usize) -> Option<Arc<Credential>> {
		self.credentials.load().iter().find(|c| c.index == index).cloned()
	}

	/// Releases a credential's in-flight slot without recording a success,
	/// failure, or rate limit: the key was never actually used against the
	/// upstream (e.g. the model's own concurrency gate rejected the attempt
	/// before dial), so neither its health score nor its breaker should
	/// move.
	pub fn release_key(&self, index: usize) {
		let Some(cred) = self.find(index) else { return };
		cred.in_flight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1))).ok();
	}

	pub fn record_success(&self, index: usize, latency_ms: u64) {
		let Some(cred) = self.find(index) else { return };
		cred.in_flight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1))).ok();
		cred.success_count.fetch_add(1, Ordering::Relaxed);
		cred.latency.push(latency_ms);
		*cred.last_success.lock() = Some(Instant::now());
		cred.breaker.record_success();
	}

	pub fn record_failure(&self, index: usize) {
		let Some(cred) = self.find(index) else { return };
		cred.in_flight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1))).ok();
		cred.breaker.record_failure();
	}

	/// Records a 429 from this credential: escalates its cooldown
	/// exponentially (matching [`model::ModelState::record_rate_limit_hit`]'s
	/// shape but tracked per-credential), or applies `retry_after` verbatim
	/// when the provider supplied one, per §4.5 "recordRateLimit".
	pub fn record_rate_limit(&self, index: usize, retry_after: Option<Duration>) {
		let Some(cred) = self.find(index) else { return };
		cred.in_flight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1))).ok();
		cred.rate_limited_count.fetch_add(1, Ordering::Relaxed);
		let now = Instant::now();
		let chosen = match retry_after {
			Some(explicit) => explicit,
			None => {
				let base = Duration::from_millis(cred.rate_limit_cooldown_ms.load(Ordering::Relaxed));
				let escalated = (base * 2).min(Duration::from_secs(10));
				cred
					.rate_limit_cooldown_ms
					.store(escalated.as_millis() as u64, Ordering::Relaxed);
				crate::backoff::jitter(escalated)
			},
		};
		*cred.rate_limited_at.lock() = Some(now);
		if retry_after.is_some() {
			cred
				.rate_limit_cooldown_ms
				.store(chosen.as_millis() as u64, Ordering::Relaxed);
		}
	}

	/// Records an account-level rate-limit detection trigger driven by
	/// `index` being hit, returning `true` the moment the unique-key
	/// threshold is reached within the configured window.
	pub fn detect_account_level_rate_limit(&self, index: usize) -> bool {
		self.account_rl.record_hit(
			index,
			self.cfg.account_rate_limit_window,
			self.cfg.account_rate_limit_unique_keys,
			self.cfg.account_rate_limit_cooldown,
		)
	}

	pub fn account_rate_limit_cooldown_remaining(&self) -> Duration {
		self.account_rl.cooldown_remaining()
	}

	/// Records a pool-wide (cross-credential) rate-limit hit against a
	/// model, escalating its cooldown.
	pub fn record_pool_rate_limit_hit(&self, model: &str) {
		self.model_state(model)
			.record_rate_limit_hit(self.cfg.pool_rate_limit_decay);
	}

	pub fn pool_rate_limit_cooldown_remaining(&self, model: &str) -> Duration {
		self.model_state(model).cooldown_remaining()
	}

	/// Honors a provider-supplied rate-limit reset header by extending (not
	/// shortening) the model's pacing cooldown.
	pub fn record_rate_limit_headers(&self, model: &str, reset_at: Instant) {
		self.model_state(model).extend_cooldown_until(reset_at);
	}

	pub fn acquire_model_slot(&self, model: &str) -> bool {
		self.model_state(model).try_acquire_slot()
	}

	/// Remaining admission headroom for a model: `effectiveLimit - inFlight`,
	/// or `i64::MAX` when the model has no configured limit. Used by the
	/// router's throughput pool strategy to pick the least-loaded candidate.
	pub fn model_headroom(&self, model: &str) -> i64 {
		let state = self.model_state(model);
		let limit = state.effective_limit();
		if limit == 0 {
			return i64::MAX;
		}
		limit as i64 - state.in_flight() as i64
	}

	pub fn release_model_slot(&self, model: &str) {
		self.model_state(model).release_slot();
	}

	pub fn set_model_concurrency_limits(&self, limits: HashMap<String, u32>) {
		for (model, limit) in limits {
			let state = self.model_state(&model);
			state.set_effective_limit(limit);
		}
	}

	pub fn set_effective_model_limit(&self, model: &str, limit: u32) {
		self.model_state(model).set_effective_limit(limit);
	}

	pub fn restore_static_limits(&self) {
		let models = self.models.lock();
		for state in models.values() {
			state.restore_static_limit();
		}
	}

	pub fn get_key_snapshot(&self) -> Vec<KeySnapshot> {
		self
			.credentials
			.load()
			.iter()
			.map(|c| KeySnapshot {
				index: c.index,
				key_id: c.key_id.clone(),
				provider: c.provider.clone(),
				state: c.breaker.state(),
				in_flight: c.in_flight(),
				total_requests: c.total_requests(),
				success_count: c.success_count(),
				health_score: c.health_score(),
				is_slow: c.is_slow(),
				rate_limit_cooldown_ms: c.rate_limit_cooldown_remaining().as_millis() as u64,
				latency: c.latency_stats(None),
			})
			.collect()
	}

	/// Recomputes cached health scores and slow-key flags from current
	/// latency history. Intended to be called periodically by a background
	/// task, mirroring the breaker's owned reconciliation task.
	pub fn refresh_health(&self) {
		let snapshot = self.credentials.load();
		health::refresh_scores(&snapshot, self.cfg.key_selection.health_score_weights);
		health::refresh_slow_keys(&snapshot, self.cfg.key_selection.slow_key_threshold);
	}

	pub fn get_aggregated_stats(&self) -> AggregatedStats {
		let snapshot = self.credentials.load();
		let total_in_flight: u32 = snapshot.iter().map(|c| c.in_flight()).sum();
		let total_requests: u64 = snapshot.iter().map(|c| c.total_requests()).sum();
		let total_success: u64 = snapshot.iter().map(|c| c.success_count()).sum();
		let available = snapshot.iter().filter(|c| c.breaker.is_available()).count();
		AggregatedStats {
			key_count: snapshot.len(),
			available_count: available,
			total_in_flight,
			total_requests,
			total_success,
		}
	}

	pub fn get_pool_rate_limit_stats(&self) -> Vec<(String, Duration)> {
		let models = self.models.lock();
		models
			.values()
			.map(|m| (m.name.clone(), m.cooldown_remaining()))
			.collect()
	}

	pub fn get_scheduler_stats(&self) -> SchedulerStats {
		let models = self.models.lock();
		SchedulerStats {
			model_count: models.len(),
			account_cooldown_remaining: self.account_rl.cooldown_remaining(),
		}
	}
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AggregatedStats {
	pub key_count: usize,
	pub available_count: usize,
	pub total_in_flight: u32,
	pub total_requests: u64,
	pub total_success: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStats {
	pub model_count: usize,
	#[serde(with = "crate::serdes::serde_millis")]
	pub account_cooldown_remaining: Duration,
}

/// Picks an index into `pool` weighted by each credential's cached health
/// score (minimum weight of 1 so a zero score never makes a key
/// unreachable). Falls back to index 0 if every weight sums to zero (should
/// not happen given the floor, but keeps this infallible).
fn weighted_index(pool: &[&Arc<Credential>]) -> usize {
	let weights: Vec<u32> = pool.iter().map(|c| c.health_score().max(1)).collect();
	let total: u32 = weights.iter().sum();
	if total == 0 {
		return 0;
	}
	let mut pick = rand::random::<u32>() % total;
	for (idx, w) in weights.iter().enumerate() {
		if pick < *w {
			return idx;
		}
		pick -= *w;
	}
	weights.len() - 1
}

#[cfg(test)]
mod tests {
	use super::*;

	fn spec(s: &str) -> KeySpec {
		KeySpec {
			secret: SecretString::from(s.to_string()),
			provider: None,
		}
	}

	fn pool(n: usize) -> CredentialPool {
		let pool = CredentialPool::new(PoolConfig::default());
		pool.load_keys((0..n).map(|i| spec(&format!("sk-{i}"))).collect());
		pool
	}

	#[test]
	fn acquire_then_record_success_round_trips() {
		let p = pool(3);
		let acquired = p.acquire_key(&HashSet::new(), None).unwrap();
		assert!(acquired.index < 3);
		p.record_success(acquired.index, 42);
		let snap = p.get_key_snapshot();
		let cred = snap.iter().find(|s| s.index == acquired.index).unwrap();
		assert_eq!(cred.in_flight, 0);
		assert_eq!(cred.total_requests, 1);
		assert_eq!(cred.success_count, 1);
	}

	#[test]
	fn exclude_set_skips_credential() {
		let p = pool(1);
		let mut exclude = HashSet::new();
		exclude.insert(0);
		// Only credential is excluded, but the fallback/last-resort steps
		// also honor exclusion, so this must fail outright.
		assert_eq!(p.acquire_key(&exclude, None), Err(AcquireError::PoolExhausted));
	}

	#[test]
	fn provider_filter_rejects_untagged_pool() {
		let p = pool(2);
		assert_eq!(
			p.acquire_key(&HashSet::new(), Some("anthropic")),
			Err(AcquireError::NoMatchingProvider)
		);
	}

	#[test]
	fn provider_filter_matches_untagged_pool_for_the_default_provider() {
		let mut cfg = PoolConfig::default();
		cfg.default_provider_name = Some("anthropic".to_string());
		let p = CredentialPool::new(cfg);
		p.load_keys(vec![spec("sk-0")]);
		let acquired = p.acquire_key(&HashSet::new(), Some("anthropic")).unwrap();
		assert_eq!(acquired.index, 0);
		assert_eq!(
			p.acquire_key(&HashSet::new(), Some("other")),
			Err(AcquireError::NoMatchingProvider)
		);
	}

	#[test]
	fn breaker_open_falls_back_to_half_open_probe() {
		let p = pool(1);
		let snapshot = p.credentials.load();
		snapshot[0].breaker.force_state(CircuitState::Open);
		drop(snapshot);
		let acquired = p.acquire_key(&HashSet::new(), None).unwrap();
		assert_eq!(acquired.index, 0);
	}

	#[test]
	fn reload_preserves_counters_for_unchanged_key() {
		let p = pool(1);
		let acquired = p.acquire_key(&HashSet::new(), None).unwrap();
		p.record_success(acquired.index, 10);
		p.reload_keys(vec![spec("sk-0")]);
		let snap = p.get_key_snapshot();
		assert_eq!(snap[0].total_requests, 1);
	}

	#[test]
	fn model_slot_gate_round_trips() {
		let p = pool(1);
		p.set_effective_model_limit("gpt", 1);
		assert!(p.acquire_model_slot("gpt"));
		assert!(!p.acquire_model_slot("gpt"));
		p.release_model_slot("gpt");
		assert!(p.acquire_model_slot("gpt"));
	}

	#[test]
	fn pool_rate_limit_hit_sets_cooldown() {
		let p = pool(1);
		p.record_pool_rate_limit_hit("gpt");
		assert!(p.pool_rate_limit_cooldown_remaining("gpt") > Duration::ZERO);
	}
}
