//! Retry loop. C10 of the routing core — orchestrates transform → acquire
//! credential → dispatch → classify → backoff across a bounded attempt
//! budget, per §4.10.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use http::{HeaderMap, Method, Response};

use crate::backoff::{self, BackoffConfig};
use crate::client::UpstreamClient;
use crate::dispatch::{self, AdaptiveTimeout, DispatchRequest, ErrorKind, UsageScanningBody};
use crate::pool::{AcquireError, CredentialPool};
use crate::provider::{ModelMapping, ProviderRegistry};
use crate::router::ModelRouter;
use crate::trace::{Attempt, Span, SpanKind, Trace};
use crate::transform::{self, OverrideAuthorization};

/// Per-error-class backoff shape: short for transient network hiccups,
/// longer for server-side trouble, none for decisions the loop never
/// retries, per §4.10 step 7.
fn backoff_config_for(kind: ErrorKind) -> BackoffConfig {
	match kind {
		ErrorKind::Timeout | ErrorKind::SocketHangup | ErrorKind::BrokenPipe | ErrorKind::ConnectionAborted | ErrorKind::StreamPrematureClose => {
			BackoffConfig {
				base: Duration::from_millis(100),
				cap: Duration::from_secs(2),
			}
		},
		ErrorKind::ConnectionRefused | ErrorKind::DnsError | ErrorKind::HttpParseError => BackoffConfig {
			base: Duration::from_millis(250),
			cap: Duration::from_secs(5),
		},
		ErrorKind::ServerError | ErrorKind::AuthError => BackoffConfig {
			base: Duration::from_millis(500),
			cap: Duration::from_secs(15),
		},
		ErrorKind::ModelAtCapacity | ErrorKind::RateLimited => BackoffConfig {
			base: Duration::from_millis(200),
			cap: Duration::from_secs(5),
		},
		ErrorKind::TlsError | ErrorKind::ContextOverflow | ErrorKind::Aborted => BackoffConfig {
			base: Duration::ZERO,
			cap: Duration::ZERO,
		},
	}
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
	pub max_retries: u32,
	/// Local 429 is returned instead of sleeping inline when a pool or
	/// account cooldown's remaining time exceeds this, per §4.10 step 2.
	#[serde(with = "crate::serdes::serde_millis")]
	pub sleep_threshold: Duration,
}

impl Default for RetryConfig {
	fn default() -> Self {
		RetryConfig {
			max_retries: 3,
			sleep_threshold: Duration::from_secs(2),
		}
	}
}

/// The terminal, client-visible result of a full retry loop run, per §6
/// "Client-facing HTTP" and §4.10 step 8.
pub enum FinalOutcome {
	Success {
		response: Response<UsageScanningBody<hyper::body::Incoming>>,
	},
	/// Local 429: a pool or account cooldown exceeded the sleep threshold.
	PoolCooldown { retry_after: Duration, scope: &'static str },
	/// 503: no live credentials for the requested provider, or every
	/// circuit is open.
	NoCredentials { reason: String },
	/// 400: context window exceeded, Anthropic-style error body.
	ContextOverflow,
	/// 502: the request body could not be parsed, or the retry budget was
	/// exhausted.
	Exhausted { attempts_tried: u32 },
}

pub struct RetryContext<'a> {
	pub pool: &'a CredentialPool,
	pub providers: &'a ProviderRegistry,
	pub router: Option<&'a ModelRouter>,
	pub client: &'a UpstreamClient,
	pub timeout: &'a AdaptiveTimeout,
	pub cfg: RetryConfig,
}

/// Releases a committed routing slot, if any was taken. Safe to call with
/// `None`. The model concurrency gate is owned by the pool regardless of
/// whether a router classified the request (§4.9 step 2 applies even to
/// the no-router passthrough decision), so this releases directly against
/// the pool rather than through `ctx.router`.
fn release_committed(ctx: &RetryContext<'_>, committed_model: &mut Option<String>) {
	if let Some(model) = committed_model.take() {
		ctx.pool.release_model_slot(&model);
	}
}

/// Runs the full retry loop for one client request, per §4.10. Returns the
/// completed trace alongside the terminal outcome; the caller pushes the
/// trace to the [`crate::trace::TraceStore`] and translates `FinalOutcome`
/// into an HTTP response.
#[allow(clippy::too_many_arguments)]
pub async fn run(
	ctx: &RetryContext<'_>,
	mut trace: Trace,
	provider_filter: Option<&str>,
	body: &[u8],
	model_mapping: &HashMap<String, ModelMapping>,
	client_headers: HeaderMap,
	method: Method,
	path_and_query: String,
	override_header: Option<&str>,
	override_auth: OverrideAuthorization,
) -> (Trace, FinalOutcome) {
	if let Some(provider) = provider_filter
		&& !ctx.providers.contains(provider)
	{
		trace.finish(false, Some(503));
		return (
			trace,
			FinalOutcome::NoCredentials {
				reason: format!("provider {provider} is not configured"),
			},
		);
	}

	let mut exclude: HashSet<usize> = HashSet::new();
	let mut attempted_models: Vec<String> = Vec::new();
	let mut attempt_number: u32 = 0;

	loop {
		if attempt_number > ctx.cfg.max_retries {
			trace.finish(false, Some(502));
			return (trace, FinalOutcome::Exhausted { attempts_tried: attempt_number });
		}

		// Each iteration's routing decision owns at most one committed
		// concurrency slot; it is released exactly once before this
		// iteration ends, whichever way it ends.
		let mut committed_model: Option<String> = None;

		let transformed = match transform::transform_request(
			body,
			ctx.providers,
			model_mapping,
			ctx.router,
			ctx.pool,
			&attempted_models,
			override_header,
			override_auth,
		) {
			Ok(t) => t,
			Err(_) => {
				trace.finish(false, Some(502));
				return (trace, FinalOutcome::Exhausted { attempts_tried: attempt_number });
			},
		};

		if let Some(decision) = &transformed.routing_decision {
			if decision.context_overflow {
				trace.finish(false, Some(400));
				return (trace, FinalOutcome::ContextOverflow);
			}
			if decision.committed {
				committed_model = Some(decision.model.clone());
			}
		}

		let Some(provider_name) = transformed.provider.clone() else {
			trace.finish(false, Some(503));
			return (
				trace,
				FinalOutcome::NoCredentials {
					reason: "resolved provider is not configured".to_string(),
				},
			);
		};

		if attempt_number == 0 {
			let model_cooldown = transformed
				.mapped_model
				.as_deref()
				.map(|m| ctx.pool.pool_rate_limit_cooldown_remaining(m))
				.unwrap_or(Duration::ZERO);
			let account_cooldown = ctx.pool.account_rate_limit_cooldown_remaining();
			let worst = model_cooldown.max(account_cooldown);
			if worst > ctx.cfg.sleep_threshold {
				trace.finish(false, Some(429));
				release_committed(ctx, &mut committed_model);
				let scope = if model_cooldown >= account_cooldown { "pool" } else { "account" };
				return (trace, FinalOutcome::PoolCooldown { retry_after: worst, scope });
			}
			if worst > Duration::ZERO {
				tokio::time::sleep(backoff::jitter(worst)).await;
			}
		}

		let Some(provider) = ctx.providers.get(&provider_name).cloned() else {
			trace.finish(false, Some(503));
			release_committed(ctx, &mut committed_model);
			return (
				trace,
				FinalOutcome::NoCredentials {
					reason: format!("provider {provider_name} vanished mid-request"),
				},
			);
		};

		let acquired = match ctx.pool.acquire_key(&exclude, Some(&provider_name)) {
			Ok(a) => a,
			Err(AcquireError::NoMatchingProvider) | Err(AcquireError::PoolExhausted) => {
				trace.finish(false, Some(503));
				release_committed(ctx, &mut committed_model);
				return (
					trace,
					FinalOutcome::NoCredentials {
						reason: "no available credential for this provider".to_string(),
					},
				);
			},
		};

		// §4.9 step 2: pre-flight the target model's concurrency gate
		// before ever dialing upstream. `context_overflow` is checked above
		// and always short-circuits first, so a decision never carries both
		// flags in practice; this still only fires on the narrower one.
		if transformed.routing_decision.as_ref().is_some_and(|d| d.model_at_capacity) {
			ctx.pool.release_key(acquired.index);
			let attempt_record = Attempt {
				attempt: attempt_number,
				key_index: acquired.index,
				key_id: acquired.key_id.clone(),
				selection_reason: transformed
					.routing_decision
					.as_ref()
					.map(|d| d.reason.clone())
					.unwrap_or_else(|| "pool selection".to_string()),
				spans: Vec::new(),
				end_time: chrono::Utc::now(),
				success: false,
				status: None,
				retry_reason: Some("ModelAtCapacity".to_string()),
			};
			trace.attempts.push(attempt_record);
			exclude.insert(acquired.index);
			if let Some(m) = transformed.mapped_model.as_ref() {
				attempted_models.push(m.clone());
			}
			let base_backoff = backoff_config_for(ErrorKind::ModelAtCapacity);
			let sleep_for = backoff::jitter(backoff::exponential_backoff(&base_backoff, attempt_number));
			if sleep_for > Duration::ZERO {
				tokio::time::sleep(sleep_for).await;
			}
			attempt_number += 1;
			continue;
		}

		let mapped_model = transformed.mapped_model.clone().unwrap_or_default();
		let dispatch_req = DispatchRequest {
			credential_index: acquired.index,
			secret: acquired.secret.clone(),
			provider,
			request_id: trace.request_id.clone(),
			method: method.clone(),
			path_and_query: path_and_query.clone(),
			client_headers: client_headers.clone(),
			body: transformed.body.clone(),
			mapped_model: mapped_model.clone(),
			routing_committed: transformed.routing_decision.as_ref().is_some_and(|d| d.committed),
		};

		let outcome = dispatch::dispatch_once(ctx.client, ctx.timeout, dispatch_req).await;

		let attempt_record = Attempt {
			attempt: attempt_number,
			key_index: acquired.index,
			key_id: acquired.key_id.clone(),
			selection_reason: transformed
				.routing_decision
				.as_ref()
				.map(|d| d.reason.clone())
				.unwrap_or_else(|| "pool selection".to_string()),
			spans: outcome.spans.clone(),
			end_time: chrono::Utc::now(),
			success: outcome.success,
			status: outcome.status.map(|s| s.as_u16()),
			retry_reason: outcome.error_kind.map(|k| format!("{k:?}")),
		};

		if outcome.success {
			let latency_ms = outcome.latency.map(|d| d.as_millis() as u64).unwrap_or(0);
			ctx.pool.record_success(acquired.index, latency_ms);
			release_committed(ctx, &mut committed_model);
			let mut record = attempt_record;
			record.spans.push(Span::now(SpanKind::Complete, acquired.index).finish());
			trace.attempts.push(record);
			trace.model = Some(mapped_model.clone());
			trace.mapped_model = Some(mapped_model);
			trace.provider = Some(provider_name.clone());
			trace.mapped_provider = Some(provider_name);
			trace.finish(true, outcome.status.map(|s| s.as_u16()));
			let response = outcome.response.expect("success outcome always carries a response");
			return (trace, FinalOutcome::Success { response });
		}

		let kind = outcome.error_kind.unwrap_or(ErrorKind::ServerError);
		trace.attempts.push(attempt_record);

		if kind.is_rate_limit() {
			ctx.pool.record_rate_limit(acquired.index, outcome.retry_after);
			if let Some(model) = transformed.mapped_model.as_deref() {
				ctx.pool.record_pool_rate_limit_hit(model);
			}
			ctx.pool.detect_account_level_rate_limit(acquired.index);
		} else {
			// record_failure decrements inFlight unconditionally and only
			// trips the breaker internally when the outcome warrants it;
			// classification of trips_breaker already informed retryability.
			ctx.pool.record_failure(acquired.index);
		}

		exclude.insert(acquired.index);
		if let Some(m) = transformed.mapped_model.as_ref() {
			attempted_models.push(m.clone());
		}

		if kind.short_circuits() {
			release_committed(ctx, &mut committed_model);
			if kind == ErrorKind::ContextOverflow {
				trace.finish(false, Some(400));
				return (trace, FinalOutcome::ContextOverflow);
			}
			trace.finish(false, outcome.status.map(|s| s.as_u16()).or(Some(502)));
			return (trace, FinalOutcome::Exhausted { attempts_tried: attempt_number + 1 });
		}

		release_committed(ctx, &mut committed_model);

		let base_backoff = backoff_config_for(kind);
		let computed = backoff::exponential_backoff(&base_backoff, attempt_number);
		let pool_cooldown = transformed
			.mapped_model
			.as_deref()
			.map(|m| ctx.pool.pool_rate_limit_cooldown_remaining(m))
			.unwrap_or(Duration::ZERO);
		let sleep_for = backoff::jitter(computed.max(pool_cooldown));
		if sleep_for > Duration::ZERO {
			tokio::time::sleep(sleep_for).await;
		}

		attempt_number += 1;
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;
	use std::convert::Infallible;
	use std::net::SocketAddr;
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use bytes::Bytes;
	use http::Request;
	use http_body_util::Full;
	use hyper::service::service_fn;
	use hyper_util::rt::TokioIo;

	use super::*;
	use crate::dispatch::AdaptiveTimeoutConfig;
	use crate::pool::PoolConfig;
	use crate::provider::{AuthScheme, CostTier, ProviderConfig};

	/// An in-process mock upstream, per this crate's own `UsageScanningBody`
	/// test helpers: a loopback `hyper` server returning one status per
	/// connection from `statuses`, cycling to the last entry once exhausted.
	/// Used instead of a network dependency for dispatcher/retry integration
	/// tests.
	async fn spawn_status_server(statuses: Vec<u16>) -> SocketAddr {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let counter = Arc::new(AtomicUsize::new(0));
		tokio::spawn(async move {
			loop {
				let Ok((stream, _)) = listener.accept().await else { break };
				let io = TokioIo::new(stream);
				let counter = counter.clone();
				let statuses = statuses.clone();
				tokio::spawn(async move {
					let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
						let counter = counter.clone();
						let statuses = statuses.clone();
						async move {
							let i = counter.fetch_add(1, Ordering::SeqCst).min(statuses.len() - 1);
							Ok::<_, Infallible>(
								Response::builder()
									.status(statuses[i])
									.body(Full::new(Bytes::from_static(b"{}")))
									.unwrap(),
							)
						}
					});
					let _ = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await;
				});
			}
		});
		addr
	}

	fn providers_at(addr: SocketAddr) -> ProviderRegistry {
		let mut configs = HashMap::new();
		configs.insert(
			"testprov".to_string(),
			ProviderConfig {
				target_host: addr.to_string(),
				target_base_path: String::new(),
				target_protocol: "http:".to_string(),
				auth_scheme: AuthScheme::XApiKey,
				cost_tier: CostTier::Free,
				extra_headers: HashMap::new(),
			},
		);
		ProviderRegistry::new(configs, Some("testprov".to_string())).unwrap()
	}

	fn model_mapping() -> HashMap<String, ModelMapping> {
		let mut m = HashMap::new();
		m.insert(
			"claude-3".to_string(),
			ModelMapping {
				target: "claude-3-target".to_string(),
				provider: Some("testprov".to_string()),
			},
		);
		m
	}

	fn pool_with_one_key(cfg: PoolConfig) -> CredentialPool {
		let pool = CredentialPool::new(cfg);
		pool.load_keys(vec![crate::pool::KeySpec {
			secret: secrecy::SecretString::from("sk-test".to_string()),
			provider: Some("testprov".to_string()),
		}]);
		pool
	}

	fn timeout() -> AdaptiveTimeout {
		AdaptiveTimeout::new(AdaptiveTimeoutConfig {
			min: Duration::from_millis(50),
			max: Duration::from_secs(5),
			initial: Duration::from_millis(500),
		})
	}

	#[tokio::test]
	async fn model_at_capacity_short_circuits_before_dialing_upstream() {
		let providers = providers_at("127.0.0.1:1".parse().unwrap());
		let pool = pool_with_one_key(PoolConfig {
			default_model_concurrency: 1,
			..PoolConfig::default()
		});
		pool.acquire_model_slot("claude-3-target");

		let client = UpstreamClient::new(Duration::from_millis(200));
		let t = timeout();
		let ctx = RetryContext {
			pool: &pool,
			providers: &providers,
			router: None,
			client: &client,
			timeout: &t,
			cfg: RetryConfig {
				max_retries: 0,
				sleep_threshold: Duration::from_secs(60),
			},
		};
		let trace = Trace::new("t1".to_string(), "r1".to_string(), "POST".to_string(), "/v1/messages".to_string());
		let body = br#"{"model":"claude-3"}"#;
		let (trace, outcome) = run(
			&ctx,
			trace,
			None,
			body,
			&model_mapping(),
			HeaderMap::new(),
			Method::POST,
			"/v1/messages".to_string(),
			None,
			crate::transform::OverrideAuthorization {
				admin_auth_configured: false,
				admin_auth_passed: false,
			},
		)
		.await;

		assert!(matches!(outcome, FinalOutcome::Exhausted { attempts_tried: 1 }));
		assert_eq!(trace.attempts.len(), 1);
		assert_eq!(trace.attempts[0].retry_reason.as_deref(), Some("ModelAtCapacity"));
		// The credential's in-flight slot was released, not burned as a
		// failure: a fresh acquire immediately succeeds.
		assert!(pool.acquire_key(&HashSet::new(), Some("testprov")).is_ok());
	}

	#[tokio::test]
	async fn account_cooldown_larger_than_pool_cooldown_wins_the_scope() {
		let providers = providers_at("127.0.0.1:1".parse().unwrap());
		let pool = pool_with_one_key(PoolConfig {
			account_rate_limit_unique_keys: 1,
			account_rate_limit_cooldown: Duration::from_secs(5),
			..PoolConfig::default()
		});
		pool.record_pool_rate_limit_hit("claude-3-target");
		pool.detect_account_level_rate_limit(0);

		let client = UpstreamClient::new(Duration::from_millis(200));
		let t = timeout();
		let ctx = RetryContext {
			pool: &pool,
			providers: &providers,
			router: None,
			client: &client,
			timeout: &t,
			cfg: RetryConfig {
				max_retries: 3,
				sleep_threshold: Duration::ZERO,
			},
		};
		let trace = Trace::new("t2".to_string(), "r2".to_string(), "POST".to_string(), "/v1/messages".to_string());
		let body = br#"{"model":"claude-3"}"#;
		let (_, outcome) = run(
			&ctx,
			trace,
			None,
			body,
			&model_mapping(),
			HeaderMap::new(),
			Method::POST,
			"/v1/messages".to_string(),
			None,
			crate::transform::OverrideAuthorization {
				admin_auth_configured: false,
				admin_auth_passed: false,
			},
		)
		.await;

		match outcome {
			FinalOutcome::PoolCooldown { scope, .. } => assert_eq!(scope, "account"),
			_ => panic!("expected a pool cooldown outcome"),
		}
	}

	#[tokio::test]
	async fn attempted_models_accumulate_and_exhaustion_reports_every_attempt() {
		let addr = spawn_status_server(vec![500, 500]).await;
		let providers = providers_at(addr);
		// Two credentials: attempt 0's failure excludes credential 0, so
		// attempt 1 still has somewhere to go rather than bailing out with
		// `NoCredentials` before the retry budget is actually exhausted.
		let pool = CredentialPool::new(PoolConfig::default());
		pool.load_keys(vec![
			crate::pool::KeySpec {
				secret: secrecy::SecretString::from("sk-a".to_string()),
				provider: Some("testprov".to_string()),
			},
			crate::pool::KeySpec {
				secret: secrecy::SecretString::from("sk-b".to_string()),
				provider: Some("testprov".to_string()),
			},
		]);

		let client = UpstreamClient::new(Duration::from_secs(2));
		let t = timeout();
		let ctx = RetryContext {
			pool: &pool,
			providers: &providers,
			router: None,
			client: &client,
			timeout: &t,
			cfg: RetryConfig {
				max_retries: 1,
				sleep_threshold: Duration::from_secs(60),
			},
		};
		let trace = Trace::new("t3".to_string(), "r3".to_string(), "POST".to_string(), "/v1/messages".to_string());
		let body = br#"{"model":"claude-3"}"#;
		let (trace, outcome) = run(
			&ctx,
			trace,
			None,
			body,
			&model_mapping(),
			HeaderMap::new(),
			Method::POST,
			"/v1/messages".to_string(),
			None,
			crate::transform::OverrideAuthorization {
				admin_auth_configured: false,
				admin_auth_passed: false,
			},
		)
		.await;

		assert!(matches!(outcome, FinalOutcome::Exhausted { attempts_tried: 2 }));
		assert_eq!(trace.attempts.len(), 2);
		assert!(trace.attempts.iter().all(|a| a.status == Some(500)));
	}
}
