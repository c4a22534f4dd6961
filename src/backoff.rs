//! Bounded exponential backoff with jitter. C4 of the routing core.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
	#[serde(with = "crate::serdes::serde_millis")]
	pub base: Duration,
	#[serde(with = "crate::serdes::serde_millis")]
	pub cap: Duration,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		BackoffConfig {
			base: Duration::from_millis(200),
			cap: Duration::from_secs(10),
		}
	}
}

/// `min(cap, base * 2^attempt)`, per §4.4. `attempt` is zero-based (the
/// first retry uses `attempt=0`).
pub fn exponential_backoff(cfg: &BackoffConfig, attempt: u32) -> Duration {
	let shift = attempt.min(62); // avoid overflow on the shift
	let scaled = cfg.base.as_millis().saturating_mul(1u128 << shift);
	let capped = scaled.min(cfg.cap.as_millis());
	Duration::from_millis(capped as u64)
}

/// Applies +/-15% jitter, per §4.4, never returning a negative duration.
pub fn jitter(d: Duration) -> Duration {
	jitter_with_ratio(d, 0.15)
}

pub fn jitter_with_ratio(d: Duration, ratio: f64) -> Duration {
	if d.is_zero() {
		return d;
	}
	let millis = d.as_millis() as f64;
	let delta = millis * ratio;
	let offset = rand::rng().random_range(-delta..=delta);
	let jittered = (millis + offset).max(0.0);
	Duration::from_millis(jittered.round() as u64)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn doubles_until_cap() {
		let cfg = BackoffConfig {
			base: Duration::from_millis(100),
			cap: Duration::from_secs(2),
		};
		assert_eq!(exponential_backoff(&cfg, 0), Duration::from_millis(100));
		assert_eq!(exponential_backoff(&cfg, 1), Duration::from_millis(200));
		assert_eq!(exponential_backoff(&cfg, 2), Duration::from_millis(400));
		assert_eq!(exponential_backoff(&cfg, 10), Duration::from_secs(2));
	}

	#[test]
	fn jitter_stays_within_bounds() {
		let base = Duration::from_millis(1000);
		for _ in 0..200 {
			let j = jitter(base);
			assert!(j.as_millis() >= 849 && j.as_millis() <= 1151, "{j:?}");
		}
	}

	#[test]
	fn jitter_of_zero_is_zero() {
		assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
	}
}
