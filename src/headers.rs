//! Header hygiene shared by the dispatcher. The stripped sets are fixed by
//! §4.9 and §9 "Header hygiene": hop-by-hop, sensitive, and proxy-internal
//! headers never reach the upstream provider, and a provider's own
//! `extraHeaders` are layered on top of the provider auth header.

use http::{HeaderMap, HeaderName, HeaderValue};

const HOP_BY_HOP: &[&str] = &[
	"transfer-encoding",
	"connection",
	"keep-alive",
	"upgrade",
	"te",
	"trailer",
	"proxy-authenticate",
	"proxy-authorization",
];

const SENSITIVE: &[&str] = &["authorization", "x-api-key", "x-admin-token", "cookie"];

fn is_proxy_prefixed(name: &str) -> bool {
	name.starts_with("proxy-") || name.starts_with("x-proxy-")
}

/// Headers named by the client's `Connection` header are hop-by-hop for
/// that request only, per RFC 7230 §6.1.
fn connection_named_headers(headers: &HeaderMap) -> Vec<String> {
	headers
		.get_all(http::header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.map(|s| s.trim().to_ascii_lowercase())
		.filter(|s| !s.is_empty())
		.collect()
}

/// Builds the header set to forward upstream: a copy of the client's
/// headers minus hop-by-hop, sensitive, and proxy-internal headers, plus
/// `host`, `x-request-id`, `content-length`, the provider's auth header,
/// and any provider `extraHeaders`.
pub fn build_upstream_headers(
	client_headers: &HeaderMap,
	target_host: &str,
	request_id: &str,
	content_length: usize,
	auth_header_name: &str,
	auth_header_value: &str,
	extra_headers: &std::collections::HashMap<String, String>,
) -> HeaderMap {
	let connection_named = connection_named_headers(client_headers);
	let mut out = HeaderMap::new();

	for (name, value) in client_headers.iter() {
		let lower = name.as_str().to_ascii_lowercase();
		if HOP_BY_HOP.contains(&lower.as_str())
			|| SENSITIVE.contains(&lower.as_str())
			|| is_proxy_prefixed(&lower)
			|| connection_named.iter().any(|h| h == &lower)
		{
			continue;
		}
		out.append(name.clone(), value.clone());
	}

	if let Ok(host_value) = HeaderValue::from_str(target_host) {
		out.insert(http::header::HOST, host_value);
	}
	if let Ok(req_id_header) = HeaderName::from_bytes(b"x-request-id")
		&& let Ok(req_id_value) = HeaderValue::from_str(request_id)
	{
		out.insert(req_id_header, req_id_value);
	}
	out.insert(http::header::CONTENT_LENGTH, HeaderValue::from(content_length));

	if let Ok(auth_name) = HeaderName::from_bytes(auth_header_name.as_bytes())
		&& let Ok(auth_value) = HeaderValue::from_str(auth_header_value)
	{
		out.insert(auth_name, auth_value);
	}

	for (name, value) in extra_headers {
		if let Ok(n) = HeaderName::from_bytes(name.as_bytes())
			&& let Ok(v) = HeaderValue::from_str(value)
		{
			out.insert(n, v);
		}
	}

	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_hop_by_hop_and_sensitive() {
		let mut client = HeaderMap::new();
		client.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer leaked"));
		client.insert(http::header::CONNECTION, HeaderValue::from_static("keep-alive, x-custom"));
		client.insert(HeaderName::from_static("x-custom"), HeaderValue::from_static("drop-me"));
		client.insert(HeaderName::from_static("x-proxy-internal"), HeaderValue::from_static("drop-me-too"));
		client.insert(http::header::USER_AGENT, HeaderValue::from_static("test-client"));

		let extra = std::collections::HashMap::new();
		let out = build_upstream_headers(&client, "api.example.com", "req-1", 10, "x-api-key", "secret", &extra);

		assert!(!out.contains_key(http::header::AUTHORIZATION));
		assert!(!out.contains_key("x-custom"));
		assert!(!out.contains_key("x-proxy-internal"));
		assert!(!out.contains_key(http::header::CONNECTION));
		assert!(out.contains_key(http::header::USER_AGENT));
		assert_eq!(out.get("x-api-key").unwrap(), "secret");
		assert_eq!(out.get(http::header::HOST).unwrap(), "api.example.com");
	}

	#[test]
	fn injects_extra_headers() {
		let client = HeaderMap::new();
		let mut extra = std::collections::HashMap::new();
		extra.insert("anthropic-version".to_string(), "2023-06-01".to_string());
		let out = build_upstream_headers(&client, "api.anthropic.com", "req-2", 0, "authorization", "Bearer sk", &extra);
		assert_eq!(out.get("anthropic-version").unwrap(), "2023-06-01");
	}
}
