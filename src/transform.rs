//! Request transformer. C8 of the routing core.
//!
//! Parses the client body, resolves the declared model through the
//! provider/model-mapping table (§4.6), and — when a model router is
//! configured — lets it reclassify the request into a tier and possibly
//! pick a different target, per §4.8. Resolution order (an explicit design
//! decision recorded in DESIGN.md): model-mapping decides *provider*,
//! the router decides *which model on that provider* when routing is
//! enabled.

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::pool::CredentialPool;
use crate::provider::{ModelMapping, ProviderRegistry};
use crate::router::{ModelRouter, RequestFeatures, RoutingDecision};

#[derive(Debug, Clone)]
pub struct TransformedRequest {
	pub body: Bytes,
	pub original_model: Option<String>,
	pub mapped_model: Option<String>,
	pub routing_decision: Option<RoutingDecision>,
	/// `None` means the resolved provider is not configured; the retry loop
	/// must fail fast (§4.8).
	pub provider: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransformError {
	#[error("request body is not valid JSON")]
	InvalidJson(#[source] serde_json::Error),
}

/// Whether the caller is allowed to supply a per-request model override via
/// header, per §4.8: "honored only if admin authentication passes, or if
/// admin auth is not configured".
#[derive(Debug, Clone, Copy)]
pub struct OverrideAuthorization {
	pub admin_auth_configured: bool,
	pub admin_auth_passed: bool,
}

impl OverrideAuthorization {
	pub fn permits_override(&self) -> bool {
		!self.admin_auth_configured || self.admin_auth_passed
	}
}

/// Resolves a transformed request. `attempted` lists models already tried
/// on prior attempts of the same client request (for router fallback
/// exclusion). `override_header` is the raw `x-model-override` value, if
/// any.
pub fn transform_request(
	body: &[u8],
	providers: &ProviderRegistry,
	model_mapping: &HashMap<String, ModelMapping>,
	router: Option<&ModelRouter>,
	pool: &CredentialPool,
	attempted: &[String],
	override_header: Option<&str>,
	override_auth: OverrideAuthorization,
) -> Result<TransformedRequest, TransformError> {
	let mut value: Value = serde_json::from_slice(body).map_err(TransformError::InvalidJson)?;

	let Some(original_model) = value.get("model").and_then(Value::as_str).map(str::to_string) else {
		return Ok(TransformedRequest {
			body: Bytes::copy_from_slice(body),
			original_model: None,
			mapped_model: None,
			routing_decision: None,
			provider: Some(providers.default_provider_name().to_string()),
		});
	};

	let mapping = model_mapping.get(&original_model);
	let resolved = providers.resolve_provider_for_model(mapping);

	let Some((provider_name, mapped_target)) = resolved else {
		return Ok(TransformedRequest {
			body: Bytes::copy_from_slice(body),
			original_model: Some(original_model),
			mapped_model: None,
			routing_decision: None,
			provider: None,
		});
	};

	let override_model = override_header.filter(|_| override_auth.permits_override());

	let (final_model, routing_decision) = match router {
		Some(r) if r.is_enabled() || override_model.is_some() => {
			let features = extract_features(&value, &mapped_target);
			let decision = r.select_model(&features, attempted, override_model, pool);
			(decision.model.clone(), Some(decision))
		},
		_ => {
			// No router classified this request, but §4.9 step 2's
			// concurrency gate still applies to whatever model was resolved.
			let committed = pool.acquire_model_slot(&mapped_target);
			let reason = if committed {
				"model routing disabled"
			} else {
				"model routing disabled (model at capacity)"
			};
			let decision = RoutingDecision::direct(mapped_target.clone(), committed, reason);
			(mapped_target, Some(decision))
		},
	};

	if let Some(obj) = value.as_object_mut() {
		obj.insert("model".to_string(), Value::String(final_model.clone()));
	}
	let rewritten = serde_json::to_vec(&value).map_err(TransformError::InvalidJson)?;

	Ok(TransformedRequest {
		body: Bytes::from(rewritten),
		original_model: Some(original_model),
		mapped_model: Some(final_model),
		routing_decision,
		provider: Some(provider_name),
	})
}

fn extract_features(value: &Value, declared_model: &str) -> RequestFeatures {
	let max_tokens = value.get("max_tokens").and_then(Value::as_u64).map(|v| v as u32);
	let messages = value.get("messages").and_then(Value::as_array);
	let message_count = messages.map_or(0, Vec::len);
	let system_prompt_len = match value.get("system") {
		Some(Value::String(s)) => s.len(),
		Some(Value::Array(parts)) => parts
			.iter()
			.filter_map(|p| p.get("text").and_then(Value::as_str))
			.map(str::len)
			.sum(),
		_ => 0,
	};
	let has_tools = value
		.get("tools")
		.and_then(Value::as_array)
		.is_some_and(|t| !t.is_empty());
	let has_vision = messages.is_some_and(|msgs| {
		msgs.iter().any(|m| {
			m.get("content")
				.and_then(Value::as_array)
				.is_some_and(|parts| parts.iter().any(|p| p.get("type").and_then(Value::as_str) == Some("image")))
		})
	});
	// Rough token estimate (chars/4), adequate for context-window gating
	// without pulling in a full tokenizer for this core.
	let body_chars: usize = messages.map_or(0, |msgs| {
		msgs.iter()
			.filter_map(|m| m.get("content").and_then(Value::as_str))
			.map(str::len)
			.sum()
	}) + system_prompt_len;
	let estimated_prompt_tokens = (body_chars / 4) as u32;

	RequestFeatures {
		model: declared_model.to_string(),
		max_tokens,
		message_count,
		system_prompt_len,
		has_tools,
		has_vision,
		estimated_prompt_tokens,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pool::PoolConfig;
	use crate::provider::{AuthScheme, CostTier, ProviderConfig};

	fn providers() -> ProviderRegistry {
		let mut configs = HashMap::new();
		configs.insert(
			"anthropic".to_string(),
			ProviderConfig {
				target_host: "api.anthropic.com".to_string(),
				target_base_path: String::new(),
				target_protocol: "https:".to_string(),
				auth_scheme: AuthScheme::Bearer,
				cost_tier: CostTier::Premium,
				extra_headers: HashMap::new(),
			},
		);
		ProviderRegistry::new(configs, Some("anthropic".to_string())).unwrap()
	}

	fn auth_not_required() -> OverrideAuthorization {
		OverrideAuthorization {
			admin_auth_configured: false,
			admin_auth_passed: false,
		}
	}

	#[test]
	fn passthrough_when_no_model_field() {
		let providers = providers();
		let pool = CredentialPool::new(PoolConfig::default());
		let body = br#"{"foo":"bar"}"#;
		let result = transform_request(body, &providers, &HashMap::new(), None, &pool, &[], None, auth_not_required()).unwrap();
		assert!(result.original_model.is_none());
		assert_eq!(result.provider.as_deref(), Some("anthropic"));
	}

	#[test]
	fn unconfigured_provider_yields_none() {
		let providers = providers();
		let pool = CredentialPool::new(PoolConfig::default());
		let mut mapping = HashMap::new();
		mapping.insert(
			"claude-opus-4".to_string(),
			ModelMapping {
				target: "claude-opus-4-latest".to_string(),
				provider: Some("openai".to_string()),
			},
		);
		let body = br#"{"model":"claude-opus-4"}"#;
		let result = transform_request(body, &providers, &mapping, None, &pool, &[], None, auth_not_required()).unwrap();
		assert!(result.provider.is_none());
	}

	#[test]
	fn rewrites_model_field_without_router() {
		let providers = providers();
		let pool = CredentialPool::new(PoolConfig::default());
		let mut mapping = HashMap::new();
		mapping.insert(
			"claude-opus-4".to_string(),
			ModelMapping {
				target: "claude-opus-4-20250101".to_string(),
				provider: Some("anthropic".to_string()),
			},
		);
		let body = br#"{"model":"claude-opus-4","messages":[]}"#;
		let result = transform_request(body, &providers, &mapping, None, &pool, &[], None, auth_not_required()).unwrap();
		assert_eq!(result.mapped_model.as_deref(), Some("claude-opus-4-20250101"));
		let parsed: Value = serde_json::from_slice(&result.body).unwrap();
		assert_eq!(parsed["model"], "claude-opus-4-20250101");
	}

	#[test]
	fn override_ignored_without_admin_authorization() {
		let auth = OverrideAuthorization {
			admin_auth_configured: true,
			admin_auth_passed: false,
		};
		assert!(!auth.permits_override());
	}
}
