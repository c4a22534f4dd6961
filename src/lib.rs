//! Routing and reliability core for a multi-provider LLM reverse proxy.
//!
//! A fleet of credentials fronts one or more upstream providers. Clients send
//! normal chat/completion requests; this crate selects a credential,
//! transforms the request (model mapping, tier routing), dispatches it
//! upstream, streams the response back, retries on transient failure, and
//! maintains per-credential health and per-model concurrency.

pub use bytes::Bytes;

pub mod app;
pub mod backoff;
pub mod breaker;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod failed_store;
pub mod headers;
pub mod keywatch;
pub mod metrics;
pub mod pool;
pub mod provider;
pub mod ratelimit;
pub mod retry;
pub mod ringbuffer;
pub mod router;
pub mod serdes;
pub mod shutdown;
pub mod stats;
pub mod telemetry;
pub mod trace;
pub mod transform;

pub use config::Config;
