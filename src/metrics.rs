//! Prometheus metrics. Grounded on the teacher's `telemetry/metrics.rs`:
//! a `Metrics` struct of label-keyed `Family`s registered into a
//! `prometheus_client::registry::Registry` at construction, rather than
//! global statics.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
	pub provider: String,
	pub model: String,
	pub status: u16,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RetryLabels {
	pub error_kind: String,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct BreakerLabels {
	pub key_id: String,
	pub state: String,
}

pub struct Metrics {
	pub requests_total: Family<RequestLabels, Counter>,
	pub retries_total: Family<RetryLabels, Counter>,
	pub breaker_transitions_total: Family<BreakerLabels, Counter>,
	pub request_latency_seconds: Histogram,
	pub pool_exhausted_total: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let requests_total = Family::default();
		registry.register("llm_relay_requests", "Total upstream requests by outcome", requests_total.clone());

		let retries_total = Family::default();
		registry.register("llm_relay_retries", "Total retry attempts by error kind", retries_total.clone());

		let breaker_transitions_total = Family::default();
		registry.register(
			"llm_relay_breaker_transitions",
			"Circuit breaker state transitions",
			breaker_transitions_total.clone(),
		);

		let request_latency_seconds = Histogram::new(
			[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0].into_iter(),
		);
		registry.register(
			"llm_relay_request_duration_seconds",
			"End-to-end request latency",
			request_latency_seconds.clone(),
		);

		let pool_exhausted_total = Counter::default();
		registry.register(
			"llm_relay_pool_exhausted",
			"Times acquireKey found no usable credential",
			pool_exhausted_total.clone(),
		);

		Metrics {
			requests_total,
			retries_total,
			breaker_transitions_total,
			request_latency_seconds,
			pool_exhausted_total,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registers_without_panicking() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(&mut registry);
		metrics
			.requests_total
			.get_or_create(&RequestLabels {
				provider: "anthropic".to_string(),
				model: "claude".to_string(),
				status: 200,
			})
			.inc();
		metrics.request_latency_seconds.observe(0.2);
		metrics.pool_exhausted_total.inc();
	}
}
