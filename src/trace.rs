//! Request trace store. C11 of the routing core.
//!
//! A fixed-capacity ring buffer of per-request traces with a secondary
//! `requestId` index, mirroring the locking discipline of §5 "Trace store:
//! a single critical section protects the ring buffer and secondary
//! index; eviction removes from both."

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
	Queued,
	KeyAcquired,
	UpstreamStart,
	FirstByte,
	Streaming,
	Complete,
	Error,
	Retry,
	Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct Span {
	pub kind: SpanKind,
	pub key_index: usize,
	#[serde(skip)]
	pub start: Instant,
	pub duration_ms: Option<u64>,
	pub error: Option<String>,
	pub status: Option<u16>,
}

impl Span {
	pub fn now(kind: SpanKind, key_index: usize) -> Self {
		Span {
			kind,
			key_index,
			start: Instant::now(),
			duration_ms: None,
			error: None,
			status: None,
		}
	}

	pub fn error(kind: SpanKind, key_index: usize, message: &str) -> Self {
		Span {
			kind,
			key_index,
			start: Instant::now(),
			duration_ms: None,
			error: Some(message.to_string()),
			status: None,
		}
	}

	pub fn finish(mut self) -> Self {
		self.duration_ms = Some(self.start.elapsed().as_millis() as u64);
		self
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
	pub attempt: u32,
	pub key_index: usize,
	pub key_id: String,
	pub selection_reason: String,
	pub spans: Vec<Span>,
	pub end_time: DateTime<Utc>,
	pub success: bool,
	pub status: Option<u16>,
	pub retry_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Trace {
	pub trace_id: String,
	pub request_id: String,
	pub method: String,
	pub path: String,
	pub model: Option<String>,
	pub mapped_model: Option<String>,
	pub provider: Option<String>,
	pub mapped_provider: Option<String>,
	pub estimated_cost_usd: Option<f64>,
	pub queued_at: DateTime<Utc>,
	pub dequeued_at: Option<DateTime<Utc>>,
	pub queue_duration_ms: Option<u64>,
	pub attempts: Vec<Attempt>,
	pub end_time: Option<DateTime<Utc>>,
	pub total_duration_ms: Option<u64>,
	pub success: bool,
	pub final_status: Option<u16>,
}

impl Trace {
	pub fn new(trace_id: String, request_id: String, method: String, path: String) -> Self {
		Trace {
			trace_id,
			request_id,
			method,
			path,
			model: None,
			mapped_model: None,
			provider: None,
			mapped_provider: None,
			estimated_cost_usd: None,
			queued_at: Utc::now(),
			dequeued_at: None,
			queue_duration_ms: None,
			attempts: Vec::new(),
			end_time: None,
			total_duration_ms: None,
			success: false,
			final_status: None,
		}
	}

	pub fn finish(&mut self, success: bool, final_status: Option<u16>) {
		let now = Utc::now();
		self.end_time = Some(now);
		self.total_duration_ms = Some((now - self.queued_at).num_milliseconds().max(0) as u64);
		self.success = success;
		self.final_status = final_status;
	}
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TraceStats {
	pub count: usize,
	pub success_count: usize,
	pub capacity: usize,
}

/// Query filter for [`TraceStore::query`]: every `Some` field must match.
#[derive(Debug, Default, Clone)]
pub struct TraceQuery {
	pub model: Option<String>,
	pub provider: Option<String>,
	pub success: Option<bool>,
}

struct Inner {
	ring: VecDeque<Trace>,
	by_request_id: HashMap<String, usize>,
	capacity: usize,
	/// Monotonically increasing sequence so `by_request_id` entries can be
	/// invalidated cheaply instead of rewriting every index on eviction.
	base_seq: u64,
}

pub struct TraceStore {
	inner: Mutex<Inner>,
}

impl TraceStore {
	pub fn new(capacity: usize) -> Self {
		assert!(capacity > 0, "trace store capacity must be non-zero");
		TraceStore {
			inner: Mutex::new(Inner {
				ring: VecDeque::with_capacity(capacity),
				by_request_id: HashMap::new(),
				capacity,
				base_seq: 0,
			}),
		}
	}

	pub fn store(&self, trace: Trace) {
		let mut inner = self.inner.lock();
		if inner.ring.len() == inner.capacity
			&& let Some(evicted) = inner.ring.pop_front()
		{
			inner.by_request_id.remove(&evicted.request_id);
			inner.base_seq += 1;
		}
		let request_id = trace.request_id.clone();
		inner.ring.push_back(trace);
		let seq = inner.base_seq + inner.ring.len() as u64 - 1;
		inner.by_request_id.insert(request_id, seq as usize);
	}

	pub fn get_by_request_id(&self, request_id: &str) -> Option<Trace> {
		let inner = self.inner.lock();
		let seq = *inner.by_request_id.get(request_id)?;
		let idx = seq.checked_sub(inner.base_seq as usize)?;
		inner.ring.get(idx).cloned()
	}

	pub fn get_recent(&self, limit: usize) -> Vec<Trace> {
		let inner = self.inner.lock();
		inner.ring.iter().rev().take(limit).cloned().collect()
	}

	pub fn query(&self, filter: &TraceQuery) -> Vec<Trace> {
		let inner = self.inner.lock();
		inner
			.ring
			.iter()
			.filter(|t| filter.model.as_deref().is_none_or(|m| t.mapped_model.as_deref() == Some(m)))
			.filter(|t| filter.provider.as_deref().is_none_or(|p| t.provider.as_deref() == Some(p)))
			.filter(|t| filter.success.is_none_or(|s| t.success == s))
			.cloned()
			.collect()
	}

	pub fn get_stats(&self) -> TraceStats {
		let inner = self.inner.lock();
		TraceStats {
			count: inner.ring.len(),
			success_count: inner.ring.iter().filter(|t| t.success).count(),
			capacity: inner.capacity,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn trace(id: &str) -> Trace {
		Trace::new(format!("trace-{id}"), id.to_string(), "POST".to_string(), "/v1/messages".to_string())
	}

	#[test]
	fn store_and_lookup_by_request_id() {
		let store = TraceStore::new(4);
		store.store(trace("r1"));
		let found = store.get_by_request_id("r1").unwrap();
		assert_eq!(found.request_id, "r1");
	}

	#[test]
	fn oldest_evicted_when_full() {
		let store = TraceStore::new(2);
		store.store(trace("r1"));
		store.store(trace("r2"));
		store.store(trace("r3"));
		assert!(store.get_by_request_id("r1").is_none());
		assert!(store.get_by_request_id("r2").is_some());
		assert!(store.get_by_request_id("r3").is_some());
		assert_eq!(store.get_stats().count, 2);
	}

	#[test]
	fn query_filters_by_success() {
		let store = TraceStore::new(4);
		let mut t1 = trace("r1");
		t1.finish(true, Some(200));
		let mut t2 = trace("r2");
		t2.finish(false, Some(502));
		store.store(t1);
		store.store(t2);
		let failures = store.query(&TraceQuery {
			success: Some(false),
			..Default::default()
		});
		assert_eq!(failures.len(), 1);
		assert_eq!(failures[0].request_id, "r2");
	}
}
