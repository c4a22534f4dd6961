//! Health score composite and slow-key detection, per §4.5 "Health score".

use std::time::Duration;

use super::credential::Credential;

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthScoreWeights {
	pub latency: f64,
	pub success_rate: f64,
	pub recency: f64,
}

impl Default for HealthScoreWeights {
	fn default() -> Self {
		HealthScoreWeights {
			latency: 0.4,
			success_rate: 0.4,
			recency: 0.2,
		}
	}
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySelectionConfig {
	pub use_weighted_selection: bool,
	pub health_score_weights: HealthScoreWeights,
	/// A credential is "slow" when its p50 exceeds `slow_key_threshold * pool_avg`.
	pub slow_key_threshold: f64,
	#[serde(with = "crate::serdes::serde_millis")]
	pub slow_key_check_interval: Duration,
	#[serde(with = "crate::serdes::serde_millis")]
	pub slow_key_cooldown: Duration,
}

impl Default for KeySelectionConfig {
	fn default() -> Self {
		KeySelectionConfig {
			use_weighted_selection: true,
			health_score_weights: HealthScoreWeights::default(),
			slow_key_threshold: 2.0,
			slow_key_check_interval: Duration::from_secs(30),
			slow_key_cooldown: Duration::from_secs(60),
		}
	}
}

const MIN_SAMPLES_FOR_SLOW_DETECTION: usize = 10;

/// Recomputes and caches each credential's 0-100 health score from latency
/// relative to the pool average, recent success rate, and recency of last
/// error (proxied here by the circuit breaker's prediction score).
pub fn refresh_scores(credentials: &[std::sync::Arc<Credential>], weights: HealthScoreWeights) {
	let pool_avg = pool_average_p50(credentials);
	for cred in credentials {
		let stats = cred.latency_stats(None);
		let latency_score = if stats.count == 0 || pool_avg <= 0.0 {
			100.0
		} else {
			// Faster than pool average scores higher; capped so an
			// extremely fast key can't exceed 100.
			(pool_avg / stats.p50.max(1) as f64 * 50.0).min(100.0)
		};

		let total = cred.total_requests();
		let success_rate_score = if total == 0 {
			100.0
		} else {
			(cred.success_count() as f64 / total as f64) * 100.0
		};

		let prediction = cred.breaker.get_prediction_data();
		let recency_score = 100.0 - prediction.score as f64;

		let composite = latency_score * weights.latency
			+ success_rate_score * weights.success_rate
			+ recency_score * weights.recency;
		let clamped = composite.clamp(0.0, 100.0).round() as u32;
		cred
			.health_score
			.store(clamped, std::sync::atomic::Ordering::Relaxed);
	}
}

fn pool_average_p50(credentials: &[std::sync::Arc<Credential>]) -> f64 {
	let samples: Vec<f64> = credentials
		.iter()
		.filter_map(|c| {
			let s = c.latency_stats(None);
			(s.count > 0).then_some(s.p50 as f64)
		})
		.collect();
	if samples.is_empty() {
		return 0.0;
	}
	samples.iter().sum::<f64>() / samples.len() as f64
}

/// Marks credentials slow/recovered based on p50 vs. pool average, per
/// §4.5. Requires at least `MIN_SAMPLES_FOR_SLOW_DETECTION` samples before a
/// key can be flagged, and recovers at 80% of the threshold (hysteresis so
/// a key doesn't flap at the boundary).
pub fn refresh_slow_keys(credentials: &[std::sync::Arc<Credential>], threshold: f64) {
	let pool_avg = pool_average_p50(credentials);
	if pool_avg <= 0.0 {
		return;
	}
	for cred in credentials {
		let stats = cred.latency_stats(None);
		if stats.count < MIN_SAMPLES_FOR_SLOW_DETECTION {
			continue;
		}
		let ratio = stats.p50 as f64 / pool_avg;
		if ratio > threshold {
			cred.is_slow.store(true, std::sync::atomic::Ordering::Relaxed);
		} else if ratio < threshold * 0.8 {
			cred.is_slow.store(false, std::sync::atomic::Ordering::Relaxed);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use secrecy::SecretString;

	use super::*;
	use crate::breaker::BreakerConfig;
	use crate::ratelimit::RateLimitConfig;

	fn cred(idx: usize) -> Arc<Credential> {
		Arc::new(Credential::new(
			idx,
			SecretString::from(format!("sk-{idx}")),
			None,
			BreakerConfig::default(),
			RateLimitConfig::default(),
			1000,
		))
	}

	#[test]
	fn slow_key_needs_minimum_samples() {
		let fast = cred(0);
		let slow = cred(1);
		for _ in 0..20 {
			fast.latency.push(10);
		}
		for _ in 0..5 {
			slow.latency.push(1000);
		}
		let creds = vec![fast.clone(), slow.clone()];
		refresh_slow_keys(&creds, 2.0);
		// `slow` has fewer than MIN_SAMPLES_FOR_SLOW_DETECTION samples
		assert!(!slow.is_slow());
	}

	#[test]
	fn slow_key_detected_and_recovers() {
		let fast = cred(0);
		let slow = cred(1);
		for _ in 0..20 {
			fast.latency.push(10);
		}
		for _ in 0..20 {
			slow.latency.push(1000);
		}
		let creds = vec![fast.clone(), slow.clone()];
		refresh_slow_keys(&creds, 2.0);
		assert!(slow.is_slow());

		// Now it speeds back up below 80% of the threshold relative to pool avg.
		for _ in 0..20 {
			slow.latency.push(5);
		}
		refresh_slow_keys(&creds, 2.0);
		assert!(!slow.is_slow());
	}
}
