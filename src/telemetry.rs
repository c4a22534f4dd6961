//! Logging setup. A deliberate simplification of the teacher's
//! `core/telemetry.rs` (a ~700-line hand-rolled non-blocking async writer
//! with custom JSON field visitors): this core uses stock
//! `tracing-subscriber` with an `EnvFilter` and a `fmt` layer, toggling
//! JSON output via `LLM_RELAY_LOG_JSON`. The ambient concern (structured,
//! leveled logging via the `tracing` ecosystem) is carried; only the
//! custom high-throughput writer is traded for the off-the-shelf one, see
//! DESIGN.md.

use std::env;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Installs the global tracing subscriber. Returns nothing to keep alive
/// (unlike the teacher's `WorkerGuard`) since `tracing-subscriber`'s `fmt`
/// layer writes synchronously to stdout/stderr.
pub fn setup_logging() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let json = env::var("LLM_RELAY_LOG_JSON").as_deref() == Ok("1");

	let registry = tracing_subscriber::registry().with(filter);
	if json {
		registry.with(tracing_subscriber::fmt::layer().json().with_current_span(false)).init();
	} else {
		registry.with(tracing_subscriber::fmt::layer()).init();
	}
}

#[cfg(test)]
mod tests {
	#[test]
	fn json_env_var_is_off_by_default() {
		assert_ne!(std::env::var("LLM_RELAY_LOG_JSON").as_deref(), Ok("1"));
	}
}
