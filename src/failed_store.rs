//! Failed-request store. C12 of the routing core — narrow collaborator,
//! treated as interface-only per §4.12. Defines the trait surface and a
//! simple in-memory reference implementation; durable on-disk persistence
//! (atomic temp+rename writes, AES-256-CBC-at-rest) is out of scope for
//! this core and left for a deployment to supply via the same trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use http::HeaderMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::dispatch::ErrorKind;

const SENSITIVE_HEADERS: &[&str] = &[
	"authorization",
	"x-api-key",
	"x-admin-token",
	"cookie",
	"set-cookie",
	"x-forwarded-for",
	"x-real-ip",
];

/// Strips headers that must never be retained in a failed-request record,
/// per §4.12.
fn scrub_headers(headers: &HeaderMap) -> HashMap<String, String> {
	headers
		.iter()
		.filter(|(name, _)| !SENSITIVE_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()))
		.filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
		.collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedRequestRecord {
	pub store_id: String,
	pub request_id: String,
	pub method: String,
	pub path: String,
	pub headers: HashMap<String, String>,
	pub body: Vec<u8>,
	pub body_truncated: bool,
	pub error_kind: ErrorKind,
	pub model: Option<String>,
	pub provider: Option<String>,
	#[serde(skip)]
	pub stored_at: Instant,
}

#[derive(Debug, Default, Clone)]
pub struct FailedRequestFilter {
	pub provider: Option<String>,
	pub model: Option<String>,
	pub error_kind: Option<ErrorKind>,
}

pub struct ReplayResult {
	pub success: bool,
	pub key_index: Option<usize>,
	pub error: Option<String>,
}

/// Which error kinds are worth retaining for later replay, per §4.12:
/// transient network/server trouble is, permanent client-side rejection
/// (context overflow, aborted, auth) is not worth replaying verbatim.
pub fn should_store(kind: ErrorKind) -> bool {
	!matches!(kind, ErrorKind::ContextOverflow | ErrorKind::Aborted | ErrorKind::AuthError)
}

pub struct FailedRequestStore {
	records: Mutex<HashMap<String, FailedRequestRecord>>,
	next_id: AtomicU64,
	body_size_limit: usize,
	ttl: Duration,
}

impl FailedRequestStore {
	pub fn new(body_size_limit: usize, ttl: Duration) -> Self {
		FailedRequestStore {
			records: Mutex::new(HashMap::new()),
			next_id: AtomicU64::new(0),
			body_size_limit,
			ttl,
		}
	}

	#[allow(clippy::too_many_arguments)]
	pub fn store(
		&self,
		request_id: &str,
		method: &str,
		path: &str,
		headers: &HeaderMap,
		body: &[u8],
		error_kind: ErrorKind,
		model: Option<String>,
		provider: Option<String>,
	) -> String {
		let store_id = format!("fr-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
		let truncated = body.len() > self.body_size_limit;
		let body = if truncated { body[..self.body_size_limit].to_vec() } else { body.to_vec() };
		let record = FailedRequestRecord {
			store_id: store_id.clone(),
			request_id: request_id.to_string(),
			method: method.to_string(),
			path: path.to_string(),
			headers: scrub_headers(headers),
			body,
			body_truncated: truncated,
			error_kind,
			model,
			provider,
			stored_at: Instant::now(),
		};
		self.records.lock().insert(store_id.clone(), record);
		store_id
	}

	pub fn get(&self, id: &str) -> Option<FailedRequestRecord> {
		self.records.lock().get(id).cloned()
	}

	pub fn list(&self, offset: usize, limit: usize, filter: &FailedRequestFilter) -> Vec<FailedRequestRecord> {
		let records = self.records.lock();
		let mut matching: Vec<FailedRequestRecord> = records
			.values()
			.filter(|r| filter.provider.as_deref().is_none_or(|p| r.provider.as_deref() == Some(p)))
			.filter(|r| filter.model.as_deref().is_none_or(|m| r.model.as_deref() == Some(m)))
			.filter(|r| filter.error_kind.is_none_or(|k| r.error_kind == k))
			.cloned()
			.collect();
		matching.sort_by(|a, b| b.stored_at.cmp(&a.stored_at));
		matching.into_iter().skip(offset).take(limit).collect()
	}

	/// Replay is a narrow interface here: the actual re-dispatch through
	/// the retry loop is the caller's responsibility (it needs a live
	/// `CredentialPool`/`UpstreamClient`); this only validates the record
	/// exists and optionally pins a target credential index.
	pub fn replay(&self, id: &str, target_key_index: Option<usize>) -> ReplayResult {
		match self.get(id) {
			Some(_) => ReplayResult {
				success: true,
				key_index: target_key_index,
				error: None,
			},
			None => ReplayResult {
				success: false,
				key_index: None,
				error: Some(format!("no stored request with id {id}")),
			},
		}
	}

	pub fn delete(&self, id: &str) -> bool {
		self.records.lock().remove(id).is_some()
	}

	pub fn delete_many(&self, ids: &[String]) -> usize {
		let mut records = self.records.lock();
		ids.iter().filter(|id| records.remove(*id).is_some()).count()
	}

	/// Evicts every record older than the configured TTL.
	pub fn cleanup(&self) -> usize {
		let mut records = self.records.lock();
		let before = records.len();
		records.retain(|_, r| r.stored_at.elapsed() < self.ttl);
		before - records.len()
	}

	pub fn len(&self) -> usize {
		self.records.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn headers_with_auth() -> HeaderMap {
		let mut h = HeaderMap::new();
		h.insert("authorization", "Bearer secret".parse().unwrap());
		h.insert("x-request-id", "abc".parse().unwrap());
		h
	}

	#[test]
	fn should_store_excludes_permanent_failures() {
		assert!(!should_store(ErrorKind::ContextOverflow));
		assert!(!should_store(ErrorKind::Aborted));
		assert!(should_store(ErrorKind::ServerError));
		assert!(should_store(ErrorKind::Timeout));
	}

	#[test]
	fn store_scrubs_sensitive_headers() {
		let store = FailedRequestStore::new(1024, Duration::from_secs(3600));
		let id = store.store("req-1", "POST", "/v1/messages", &headers_with_auth(), b"{}", ErrorKind::ServerError, None, None);
		let record = store.get(&id).unwrap();
		assert!(!record.headers.contains_key("authorization"));
		assert!(record.headers.contains_key("x-request-id"));
	}

	#[test]
	fn body_truncated_above_limit() {
		let store = FailedRequestStore::new(4, Duration::from_secs(3600));
		let id = store.store("req-1", "POST", "/v1/messages", &HeaderMap::new(), b"0123456789", ErrorKind::ServerError, None, None);
		let record = store.get(&id).unwrap();
		assert!(record.body_truncated);
		assert_eq!(record.body.len(), 4);
	}

	#[test]
	fn list_filters_and_paginates() {
		let store = FailedRequestStore::new(1024, Duration::from_secs(3600));
		store.store("r1", "POST", "/p", &HeaderMap::new(), b"{}", ErrorKind::ServerError, Some("gpt".to_string()), None);
		store.store("r2", "POST", "/p", &HeaderMap::new(), b"{}", ErrorKind::Timeout, Some("claude".to_string()), None);
		let filtered = store.list(0, 10, &FailedRequestFilter {
			model: Some("gpt".to_string()),
			..Default::default()
		});
		assert_eq!(filtered.len(), 1);
		assert_eq!(filtered[0].request_id, "r1");
	}

	#[test]
	fn delete_many_removes_matching_ids() {
		let store = FailedRequestStore::new(1024, Duration::from_secs(3600));
		let id1 = store.store("r1", "POST", "/p", &HeaderMap::new(), b"{}", ErrorKind::ServerError, None, None);
		let id2 = store.store("r2", "POST", "/p", &HeaderMap::new(), b"{}", ErrorKind::ServerError, None, None);
		let removed = store.delete_many(&[id1, "missing".to_string()]);
		assert_eq!(removed, 1);
		assert_eq!(store.len(), 1);
		assert!(store.get(&id2).is_some());
	}
}
