//! Request dispatcher. C9 of the routing core — a single outbound attempt:
//! header sanitization, pre-flight concurrency gates, upstream dial,
//! streaming passthrough with SSE usage capture, and outcome
//! classification (§4.9, §7). Grounded in the teacher's SSE usage-parsing
//! pattern in `llm/mod.rs`, adapted from a buffering tokenizer pass into a
//! streaming tee so the proxy never holds a full response in memory.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body::{Body, Frame};
use http_body_util::Full;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use crate::client::{self, ClientError, UpstreamClient};
use crate::pool::CredentialPool;
use crate::provider::Provider;
use crate::trace::{Span, SpanKind};

/// Closed set of error kinds and their retry/breaker/rate-limit policy,
/// per §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	Timeout,
	SocketHangup,
	ConnectionRefused,
	BrokenPipe,
	ConnectionAborted,
	StreamPrematureClose,
	HttpParseError,
	DnsError,
	TlsError,
	RateLimited,
	AuthError,
	ServerError,
	ModelAtCapacity,
	ContextOverflow,
	Aborted,
}

impl ErrorKind {
	pub fn is_retryable(self) -> bool {
		!matches!(self, ErrorKind::TlsError | ErrorKind::ContextOverflow | ErrorKind::Aborted)
	}

	/// Whether this outcome should trip the credential's circuit breaker,
	/// per the §7 table.
	pub fn trips_breaker(self) -> bool {
		matches!(
			self,
			ErrorKind::ConnectionRefused
				| ErrorKind::HttpParseError
				| ErrorKind::DnsError
				| ErrorKind::TlsError
				| ErrorKind::AuthError
				| ErrorKind::ServerError
		)
	}

	pub fn is_rate_limit(self) -> bool {
		matches!(self, ErrorKind::RateLimited)
	}

	/// `tls_error`, `context_overflow`, and `aborted` short-circuit the
	/// retry loop outright (§7 "Propagation policy").
	pub fn short_circuits(self) -> bool {
		matches!(self, ErrorKind::TlsError | ErrorKind::ContextOverflow | ErrorKind::Aborted)
	}
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveTimeoutConfig {
	#[serde(with = "crate::serdes::serde_millis")]
	pub min: Duration,
	#[serde(with = "crate::serdes::serde_millis")]
	pub max: Duration,
	#[serde(with = "crate::serdes::serde_millis")]
	pub initial: Duration,
}

impl Default for AdaptiveTimeoutConfig {
	fn default() -> Self {
		AdaptiveTimeoutConfig {
			min: Duration::from_secs(5),
			max: Duration::from_secs(120),
			initial: Duration::from_secs(30),
		}
	}
}

/// Socket timeout that widens on a timeout outcome and narrows back toward
/// recently observed latency on success, bounded by `[min, max]`.
pub struct AdaptiveTimeout {
	min_nanos: u64,
	max_nanos: u64,
	current_nanos: AtomicU64,
}

impl AdaptiveTimeout {
	pub fn new(cfg: AdaptiveTimeoutConfig) -> Self {
		AdaptiveTimeout {
			min_nanos: cfg.min.as_nanos() as u64,
			max_nanos: cfg.max.as_nanos() as u64,
			current_nanos: AtomicU64::new(cfg.initial.as_nanos() as u64),
		}
	}

	pub fn current(&self) -> Duration {
		Duration::from_nanos(self.current_nanos.load(Ordering::Relaxed))
	}

	pub fn on_success(&self, latency: Duration) {
		let observed = (latency.as_nanos() as u64).saturating_mul(3).max(self.min_nanos);
		let _ = self
			.current_nanos
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
				let blended = (cur * 3 + observed) / 4;
				Some(blended.clamp(self.min_nanos, self.max_nanos))
			});
	}

	pub fn on_timeout(&self) {
		let _ = self
			.current_nanos
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
				Some((cur.saturating_mul(2)).clamp(self.min_nanos, self.max_nanos))
			});
	}
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct Usage {
	pub input_tokens: u64,
	pub output_tokens: u64,
}

pub struct DispatchRequest {
	pub credential_index: usize,
	pub secret: SecretString,
	pub provider: Provider,
	pub request_id: String,
	pub method: http::Method,
	pub path_and_query: String,
	pub client_headers: HeaderMap,
	pub body: Bytes,
	pub mapped_model: String,
	/// Whether the routing decision that picked `mapped_model` already
	/// committed a concurrency slot (needed to decide whether a slot must
	/// be released alongside the key on early-exit paths).
	pub routing_committed: bool,
}

pub struct DispatchOutcome {
	pub success: bool,
	pub error_kind: Option<ErrorKind>,
	pub should_retry: bool,
	pub status: Option<StatusCode>,
	pub retry_after: Option<Duration>,
	pub mapped_model: String,
	pub spans: Vec<Span>,
	pub latency: Option<Duration>,
	pub response: Option<Response<UsageScanningBody<hyper::body::Incoming>>>,
}

#[derive(Debug, Error)]
pub enum DispatchBuildError {
	#[error(transparent)]
	Client(#[from] ClientError),
	#[error("invalid header value")]
	InvalidHeader,
}

/// Performs the wire half of a §4.9 attempt: dial, classify. The
/// `context_overflow` and `model_at_capacity` pre-flight gates run in the
/// retry loop (`retry::run`) before this function is ever called, since
/// they only need the routing decision and the pool, not a live
/// connection; this function handles everything from the dial onward,
/// consistent with "dispatcher never writes to the client response before
/// classifying" except for the streamed body itself.
pub async fn dispatch_once(
	client: &UpstreamClient,
	timeout: &AdaptiveTimeout,
	req: DispatchRequest,
) -> DispatchOutcome {
	let mut spans = Vec::new();
	let attempt_start = Instant::now();
	spans.push(Span::now(SpanKind::UpstreamStart, req.credential_index));

	let auth_header_name = match &req.provider.auth_scheme {
		crate::provider::AuthScheme::XApiKey => "x-api-key".to_string(),
		crate::provider::AuthScheme::Bearer => "authorization".to_string(),
		crate::provider::AuthScheme::Custom { header } => header.clone(),
	};
	let auth_header_value = match &req.provider.auth_scheme {
		crate::provider::AuthScheme::Bearer => format!("Bearer {}", req.secret.expose_secret()),
		_ => req.secret.expose_secret().to_string(),
	};

	let target_uri = match client::build_target_uri(&req.provider, &req.path_and_query) {
		Ok(u) => u,
		Err(e) => {
			return classify_build_error(req.mapped_model, spans, e);
		},
	};

	let upstream_headers = crate::headers::build_upstream_headers(
		&req.client_headers,
		target_uri.host().unwrap_or(&req.provider.target_host),
		&req.request_id,
		req.body.len(),
		&auth_header_name,
		&auth_header_value,
		&req.provider.extra_headers,
	);

	let mut builder = Request::builder().method(req.method).uri(target_uri);
	if let Some(headers) = builder.headers_mut() {
		*headers = upstream_headers;
	}
	let built = builder.body(Full::new(req.body));
	let Ok(upstream_req) = built else {
		return DispatchOutcome {
			success: false,
			error_kind: Some(ErrorKind::HttpParseError),
			should_retry: true,
			status: None,
			retry_after: None,
			mapped_model: req.mapped_model,
			spans,
			latency: None,
			response: None,
		};
	};

	match client.send(upstream_req).await {
		Ok(resp) => {
			let latency = attempt_start.elapsed();
			spans.push(Span::now(SpanKind::FirstByte, req.credential_index));
			timeout.on_success(latency);
			classify_response(resp, req.mapped_model, spans, latency)
		},
		Err(ClientError::ConnectTimeout) => {
			timeout.on_timeout();
			spans.push(Span::error(SpanKind::Timeout, req.credential_index, "connect timed out"));
			DispatchOutcome {
				success: false,
				error_kind: Some(ErrorKind::Timeout),
				should_retry: true,
				status: None,
				retry_after: None,
				mapped_model: req.mapped_model,
				spans,
				latency: None,
				response: None,
			}
		},
		Err(e) => classify_transport_error(e, req.mapped_model, spans),
	}
}

fn classify_build_error(mapped_model: String, mut spans: Vec<Span>, e: ClientError) -> DispatchOutcome {
	spans.push(Span::error(SpanKind::Error, 0, &e.to_string()));
	DispatchOutcome {
		success: false,
		error_kind: Some(ErrorKind::HttpParseError),
		should_retry: true,
		status: None,
		retry_after: None,
		mapped_model,
		spans,
		latency: None,
		response: None,
	}
}

fn classify_transport_error(e: ClientError, mapped_model: String, mut spans: Vec<Span>) -> DispatchOutcome {
	let message = e.to_string();
	let lower = message.to_ascii_lowercase();
	let kind = if lower.contains("refused") || lower.contains("unreachable") {
		ErrorKind::ConnectionRefused
	} else if lower.contains("reset") || lower.contains("hang up") {
		ErrorKind::SocketHangup
	} else if lower.contains("broken pipe") {
		ErrorKind::BrokenPipe
	} else if lower.contains("aborted") {
		ErrorKind::ConnectionAborted
	} else if lower.contains("dns") || lower.contains("resolve") || lower.contains("lookup") {
		ErrorKind::DnsError
	} else if lower.contains("tls") || lower.contains("certificate") {
		ErrorKind::TlsError
	} else if lower.contains("closed") || lower.contains("eof") {
		ErrorKind::StreamPrematureClose
	} else {
		ErrorKind::HttpParseError
	};
	spans.push(Span::error(SpanKind::Error, 0, &message));
	DispatchOutcome {
		success: false,
		error_kind: Some(kind),
		should_retry: kind.is_retryable(),
		status: None,
		retry_after: None,
		mapped_model,
		spans,
		latency: None,
		response: None,
	}
}

fn classify_response(
	resp: Response<hyper::body::Incoming>,
	mapped_model: String,
	mut spans: Vec<Span>,
	latency: Duration,
) -> DispatchOutcome {
	let status = resp.status();
	let retry_after = resp
		.headers()
		.get(http::header::RETRY_AFTER)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse::<u64>().ok())
		.map(Duration::from_secs);

	if status.is_success() {
		spans.push(Span::now(SpanKind::Streaming, 0));
		let usage = Arc::new(Mutex::new(None));
		let (parts, body) = resp.into_parts();
		let wrapped = UsageScanningBody::new(body, usage);
		return DispatchOutcome {
			success: true,
			error_kind: None,
			should_retry: false,
			status: Some(status),
			retry_after: None,
			mapped_model,
			spans,
			latency: Some(latency),
			response: Some(Response::from_parts(parts, wrapped)),
		};
	}

	let (kind, should_retry) = match status {
		StatusCode::TOO_MANY_REQUESTS => (ErrorKind::RateLimited, true),
		StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => (ErrorKind::AuthError, true),
		s if s.as_u16() == 529 => (ErrorKind::ModelAtCapacity, true),
		s if s.is_server_error() => (ErrorKind::ServerError, true),
		StatusCode::BAD_REQUEST => (ErrorKind::ContextOverflow, false),
		_ => (ErrorKind::ServerError, true),
	};
	spans.push(Span::error(SpanKind::Error, 0, &format!("status {status}")));
	DispatchOutcome {
		success: false,
		error_kind: Some(kind),
		should_retry,
		status: Some(status),
		retry_after,
		mapped_model,
		spans,
		latency: Some(latency),
		response: None,
	}
}

/// Wraps the upstream body, forwarding every frame unchanged while scanning
/// a bounded trailing window of decoded text for an Anthropic-shaped
/// `"usage":{"input_tokens":N,"output_tokens":M}` fragment (supporting both
/// the nested `anthropic.usage` envelope and a bare `usage` object), per
/// §9 "SSE usage accounting". The scan never blocks or buffers the whole
/// body: only the last `SCAN_WINDOW` bytes are retained.
pub struct UsageScanningBody<B> {
	inner: B,
	tail: Vec<u8>,
	usage: Arc<Mutex<Option<Usage>>>,
}

const SCAN_WINDOW: usize = 8 * 1024;

impl<B> UsageScanningBody<B> {
	pub fn new(inner: B, usage: Arc<Mutex<Option<Usage>>>) -> Self {
		UsageScanningBody {
			inner,
			tail: Vec::new(),
			usage,
		}
	}

	pub fn usage_handle(&self) -> Arc<Mutex<Option<Usage>>> {
		self.usage.clone()
	}

	fn scan(&mut self, chunk: &[u8]) {
		self.tail.extend_from_slice(chunk);
		if self.tail.len() > SCAN_WINDOW {
			let excess = self.tail.len() - SCAN_WINDOW;
			self.tail.drain(0..excess);
		}
		if let Ok(text) = std::str::from_utf8(&self.tail)
			&& let Some(usage) = parse_trailing_usage(text)
		{
			*self.usage.lock() = Some(usage);
		}
	}
}

fn parse_trailing_usage(text: &str) -> Option<Usage> {
	let needle = "\"usage\"";
	let idx = text.rfind(needle)?;
	let after_colon = text[idx + needle.len()..].trim_start();
	let after_colon = after_colon.strip_prefix(':')?;
	let end = find_matching_brace(after_colon)?;
	let object_text = &after_colon[..=end];
	let value: serde_json::Value = serde_json::from_str(object_text.trim()).ok()?;
	let obj = value.get("usage").unwrap_or(&value);
	let input_tokens = obj.get("input_tokens").and_then(serde_json::Value::as_u64).unwrap_or(0);
	let output_tokens = obj.get("output_tokens").and_then(serde_json::Value::as_u64).unwrap_or(0);
	Some(Usage { input_tokens, output_tokens })
}

fn find_matching_brace(text: &str) -> Option<usize> {
	let trimmed = text.trim_start();
	let offset = text.len() - trimmed.len();
	let mut depth = 0i32;
	for (i, ch) in trimmed.char_indices() {
		match ch {
			'{' => depth += 1,
			'}' => {
				depth -= 1;
				if depth == 0 {
					return Some(offset + i);
				}
			},
			_ => {},
		}
	}
	None
}

impl<B> Body for UsageScanningBody<B>
where
	B: Body<Data = Bytes> + Unpin,
{
	type Data = Bytes;
	type Error = B::Error;

	fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
		let this = self.get_mut();
		match Pin::new(&mut this.inner).poll_frame(cx) {
			Poll::Ready(Some(Ok(frame))) => {
				if let Some(data) = frame.data_ref() {
					this.scan(data);
				}
				Poll::Ready(Some(Ok(frame)))
			},
			other => other,
		}
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_trailing_usage_object() {
		let text = r#"data: {"type":"message_delta","usage":{"input_tokens":12,"output_tokens":34}}"#;
		let usage = parse_trailing_usage(text).unwrap();
		assert_eq!(usage.input_tokens, 12);
		assert_eq!(usage.output_tokens, 34);
	}

	#[test]
	fn parses_nested_anthropic_envelope() {
		let text = r#"{"usage":{"input_tokens":1,"output_tokens":2}}"#;
		let usage = parse_trailing_usage(text).unwrap();
		assert_eq!(usage.input_tokens, 1);
		assert_eq!(usage.output_tokens, 2);
	}

	#[test]
	fn returns_none_without_usage_field() {
		assert!(parse_trailing_usage(r#"{"type":"ping"}"#).is_none());
	}

	#[test]
	fn error_kind_policy_matches_table() {
		assert!(!ErrorKind::TlsError.is_retryable());
		assert!(!ErrorKind::ContextOverflow.is_retryable());
		assert!(!ErrorKind::Aborted.is_retryable());
		assert!(ErrorKind::Timeout.is_retryable());
		assert!(!ErrorKind::Timeout.trips_breaker());
		assert!(ErrorKind::ServerError.trips_breaker());
		assert!(ErrorKind::RateLimited.is_rate_limit());
	}

	#[tokio::test]
	async fn adaptive_timeout_widens_on_timeout_and_narrows_on_success() {
		let t = AdaptiveTimeout::new(AdaptiveTimeoutConfig {
			min: Duration::from_millis(100),
			max: Duration::from_secs(10),
			initial: Duration::from_secs(1),
		});
		let before = t.current();
		t.on_timeout();
		assert!(t.current() > before);
		t.on_success(Duration::from_millis(50));
		assert!(t.current() >= Duration::from_millis(100));
	}
}
