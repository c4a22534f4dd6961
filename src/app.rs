//! HTTP surface. Wires the client-facing `axum::Router` to the
//! transform → route → retry → dispatch pipeline and owns the long-lived
//! process-scoped background tasks (health refresh, failed-request
//! cleanup), mirroring the shape of the teacher's `app::run` entry point
//! (readiness/admin servers spun up alongside the data-plane listener)
//! without its XDS control-plane machinery, which this proxy has no use
//! for.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use tracing::{info, warn};

use crate::client::UpstreamClient;
use crate::config::{Config, RuntimeConfig};
use crate::dispatch::AdaptiveTimeout;
use crate::failed_store::FailedRequestStore;
use crate::keywatch;
use crate::metrics::Metrics;
use crate::pool::CredentialPool;
use crate::retry::{self, FinalOutcome, RetryContext};
use crate::shutdown::Shutdown;
use crate::stats::StatsStore;
use crate::trace::{Trace, TraceStore};
use crate::transform::OverrideAuthorization;

pub struct GatewayState {
	pub pool: Arc<CredentialPool>,
	pub runtime: RuntimeConfig,
	pub client: UpstreamClient,
	pub timeout: AdaptiveTimeout,
	pub traces: TraceStore,
	pub failed: FailedRequestStore,
	pub stats: StatsStore,
	pub metrics: Metrics,
	pub admin_token: Option<String>,
}

/// The paths this proxy accepts LLM traffic on, per §6 "Client-facing
/// HTTP".
const LLM_PATHS: &[&str] = &["/v1/messages", "/v1/complete", "/v1/chat/completions"];

fn new_id() -> String {
	format!("{:032x}", rand::random::<u128>())
}

pub fn build_router(state: Arc<GatewayState>) -> Router {
	let mut router = Router::new().route("/healthz", get(healthz));
	for path in LLM_PATHS {
		router = router.route(path, post(handle_llm_request));
	}
	router
		.route("/admin/keys", get(admin_key_snapshot))
		.route("/admin/stats", get(admin_stats))
		.with_state(state)
}

async fn healthz(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
	let stats = state.pool.get_aggregated_stats();
	axum::Json(json!({
		"status": "ok",
		"keyCount": stats.key_count,
		"availableCount": stats.available_count,
	}))
}

async fn admin_key_snapshot(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
	if !is_admin_authorized(&state, &headers) {
		return StatusCode::UNAUTHORIZED.into_response();
	}
	axum::Json(state.pool.get_key_snapshot()).into_response()
}

async fn admin_stats(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
	if !is_admin_authorized(&state, &headers) {
		return StatusCode::UNAUTHORIZED.into_response();
	}
	axum::Json(state.stats.summary()).into_response()
}

fn is_admin_authorized(state: &GatewayState, headers: &HeaderMap) -> bool {
	match &state.admin_token {
		None => true,
		Some(expected) => headers
			.get("x-admin-token")
			.and_then(|v| v.to_str().ok())
			.is_some_and(|got| got == expected),
	}
}

async fn handle_llm_request(
	State(state): State<Arc<GatewayState>>,
	method: Method,
	headers: HeaderMap,
	body: axum::body::Bytes,
) -> Response {
	let request_id = headers
		.get("x-request-id")
		.and_then(|v| v.to_str().ok())
		.map(str::to_string)
		.unwrap_or_else(new_id);
	let trace = Trace::new(new_id(), request_id, method.to_string(), "/v1/messages".to_string());

	let override_auth = OverrideAuthorization {
		admin_auth_configured: state.admin_token.is_some(),
		admin_auth_passed: is_admin_authorized(&state, &headers),
	};
	let override_header = headers.get("x-model-override").and_then(|v| v.to_str().ok());
	let provider_filter = headers.get("x-provider").and_then(|v| v.to_str().ok());

	let ctx = RetryContext {
		pool: &state.pool,
		providers: &state.runtime.providers,
		router: state.runtime.router.as_ref(),
		client: &state.client,
		timeout: &state.timeout,
		cfg: state.runtime.retry_config,
	};

	let (trace, outcome) = retry::run(
		&ctx,
		trace,
		provider_filter,
		&body,
		&state.runtime.model_mapping,
		headers.clone(),
		method,
		"/v1/messages".to_string(),
		override_header,
		override_auth,
	)
	.await;

	state.stats.record_request(trace.success, trace.total_duration_ms.unwrap_or(0));
	let request_id = trace.request_id.clone();
	state.traces.store(trace);

	match outcome {
		FinalOutcome::Success { response } => {
			let (parts, body) = response.into_parts();
			let mut resp = Response::from_parts(parts, Body::new(body));
			resp.headers_mut().insert("x-request-id", request_id.parse().unwrap());
			resp
		},
		FinalOutcome::PoolCooldown { retry_after, scope } => {
			let mut resp = (
				StatusCode::TOO_MANY_REQUESTS,
				axum::Json(json!({"error": "pool cooldown active", "requestId": request_id})),
			)
				.into_response();
			resp.headers_mut().insert("retry-after", retry_after.as_secs().max(1).to_string().parse().unwrap());
			resp.headers_mut().insert("x-rate-limit-scope", scope.parse().unwrap());
			resp
		},
		FinalOutcome::NoCredentials { reason } => {
			warn!(reason, "no credential available for request");
			(
				StatusCode::SERVICE_UNAVAILABLE,
				axum::Json(json!({"error": reason, "requestId": request_id})),
			)
				.into_response()
		},
		FinalOutcome::ContextOverflow => (
			StatusCode::BAD_REQUEST,
			axum::Json(json!({
				"type": "error",
				"error": {
					"type": "invalid_request_error",
					"message": "prompt exceeds the target model's context window",
				},
			})),
		)
			.into_response(),
		FinalOutcome::Exhausted { attempts_tried } => (
			StatusCode::BAD_GATEWAY,
			axum::Json(json!({
				"errorType": "upstream_exhausted",
				"requestId": request_id,
				"attemptsTried": attempts_tried,
			})),
		)
			.into_response(),
	}
}

/// A bound, running instance of the proxy. Dropping this does nothing;
/// call [`Bound::wait_termination`] to block until shutdown completes.
pub struct Bound {
	local_addr: SocketAddr,
	shutdown: Shutdown,
	server: tokio::task::JoinHandle<std::io::Result<()>>,
	// Held only to keep the watch alive; dropping it stops the watcher.
	_key_watcher: Option<notify_debouncer_full::Debouncer<notify::RecommendedWatcher, notify_debouncer_full::RecommendedCache>>,
}

impl Bound {
	pub fn address(&self) -> SocketAddr {
		self.local_addr
	}

	pub async fn wait_termination(self) -> anyhow::Result<()> {
		self.shutdown.wait().await;
		self.server.await??;
		Ok(())
	}
}

/// Builds the gateway state, binds the listener, and spawns the
/// background health-refresh and failed-request-cleanup loops, per §5
/// "no per-request background task outlives the request except the
/// credential pool's score-refresh loop... all of which are process-scoped
/// and stop on shutdown."
pub async fn run(cfg: Arc<Config>) -> anyhow::Result<Bound> {
	let runtime = RuntimeConfig::build(&cfg)?;

	let pool = Arc::new(CredentialPool::new(runtime.pool_config.clone()));
	if let Some(path) = &cfg.key_file {
		let keys = load_key_file(path)?;
		pool.load_keys(keys);
	}

	let mut registry = prometheus_client::registry::Registry::default();
	let metrics = Metrics::new(&mut registry);

	let state = Arc::new(GatewayState {
		pool: pool.clone(),
		runtime,
		client: UpstreamClient::new(Duration::from_secs(10)),
		timeout: AdaptiveTimeout::new(cfg.adaptive_timeout),
		traces: TraceStore::new(cfg.trace_capacity.max(1)),
		failed: FailedRequestStore::new(cfg.failed_request_body_limit, cfg.failed_request_ttl),
		stats: StatsStore::new(),
		metrics,
		admin_token: cfg.admin_token.clone(),
	});

	let key_watcher = match &cfg.key_file {
		Some(path) => match keywatch::watch(path, pool.clone(), load_key_file) {
			Ok(w) => Some(w),
			Err(err) => {
				warn!(%err, path = %path.display(), "failed to start key file watcher, hot reload disabled");
				None
			},
		},
		None => None,
	};

	let shutdown = Shutdown::new();
	let health_state = state.clone();
	let health_task = tokio::spawn(async move {
		let mut interval = tokio::time::interval(Duration::from_secs(15));
		loop {
			interval.tick().await;
			health_state.pool.refresh_health();
		}
	});
	let cleanup_state = state.clone();
	let cleanup_task = tokio::spawn(async move {
		let mut interval = tokio::time::interval(Duration::from_secs(3600));
		loop {
			interval.tick().await;
			let removed = cleanup_state.failed.cleanup();
			if removed > 0 {
				info!(removed, "cleaned up expired failed-request records");
			}
		}
	});

	let router = build_router(state);
	let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
	let local_addr = listener.local_addr()?;
	info!(%local_addr, "listening");

	let trigger = shutdown.trigger();
	let server = tokio::spawn(async move {
		let result = axum::serve(listener, router).await;
		health_task.abort();
		cleanup_task.abort();
		trigger.shutdown_now().await;
		result
	});

	Ok(Bound {
		local_addr,
		shutdown,
		server,
		_key_watcher: key_watcher,
	})
}

fn load_key_file(path: &std::path::Path) -> anyhow::Result<Vec<crate::pool::KeySpec>> {
	use secrecy::SecretString;
	let contents = std::fs::read_to_string(path)?;
	let raw: Vec<RawKeyEntry> = serde_json::from_str(&contents)?;
	Ok(raw
		.into_iter()
		.map(|entry| crate::pool::KeySpec {
			secret: SecretString::from(entry.key),
			provider: entry.provider,
		})
		.collect())
}

#[derive(serde::Deserialize)]
struct RawKeyEntry {
	key: String,
	#[serde(default)]
	provider: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn llm_paths_cover_the_documented_surface() {
		assert!(LLM_PATHS.contains(&"/v1/messages"));
		assert!(LLM_PATHS.contains(&"/v1/chat/completions"));
	}
}
