//! Provider registry. C6 of the routing core.
//!
//! Named upstream providers (host, auth scheme, cost tier). Construction
//! validates the closed sets in §4.6/§9 and fails loudly on an unknown
//! `authScheme` or `costTier`, mirroring the teacher's
//! `AIProvider`/`formatAuthHeader` split in `llm/mod.rs`.

use std::collections::HashMap;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

pub const DEFAULT_PROVIDER_NAME: &str = "z.ai";
const DEFAULT_HOST: &str = "api.z.ai";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostTier {
	Free,
	Metered,
	Premium,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthScheme {
	XApiKey,
	Bearer,
	Custom { header: String },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProviderConfig {
	pub target_host: String,
	#[serde(default)]
	pub target_base_path: String,
	#[serde(default = "default_protocol")]
	pub target_protocol: String,
	pub auth_scheme: AuthScheme,
	pub cost_tier: CostTier,
	#[serde(default)]
	pub extra_headers: HashMap<String, String>,
}

fn default_protocol() -> String {
	"https:".to_string()
}

#[derive(Debug, Clone)]
pub struct Provider {
	pub name: String,
	pub target_host: String,
	pub target_base_path: String,
	pub target_protocol: String,
	pub auth_scheme: AuthScheme,
	pub cost_tier: CostTier,
	pub extra_headers: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
	#[error("unknown auth scheme for provider {0}")]
	UnknownAuthScheme(String),
	#[error("unknown cost tier for provider {0}")]
	UnknownCostTier(String),
	#[error("invalid header name {0} in provider {1} custom auth scheme")]
	InvalidHeaderName(String, String),
	#[error("providers map must not be empty")]
	Empty,
}

pub struct ProviderRegistry {
	providers: HashMap<String, Provider>,
	default_provider_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeader {
	pub header_name: String,
	pub header_value: String,
}

impl ProviderRegistry {
	/// Builds from an explicit configuration, or a built-in default (`z.ai`,
	/// `x-api-key`, free tier) when `configs` is empty.
	pub fn new(
		configs: HashMap<String, ProviderConfig>,
		default_provider_name: Option<String>,
	) -> Result<Self, ProviderError> {
		let mut providers = HashMap::new();
		if configs.is_empty() {
			providers.insert(
				DEFAULT_PROVIDER_NAME.to_string(),
				Provider {
					name: DEFAULT_PROVIDER_NAME.to_string(),
					target_host: DEFAULT_HOST.to_string(),
					target_base_path: String::new(),
					target_protocol: "https:".to_string(),
					auth_scheme: AuthScheme::XApiKey,
					cost_tier: CostTier::Free,
					extra_headers: HashMap::new(),
				},
			);
		} else {
			for (name, cfg) in configs {
				if let AuthScheme::Custom { header } = &cfg.auth_scheme
					&& !is_valid_header_name(header)
				{
					return Err(ProviderError::InvalidHeaderName(header.clone(), name));
				}
				providers.insert(
					name.clone(),
					Provider {
						name: name.clone(),
						target_host: cfg.target_host,
						target_base_path: cfg.target_base_path,
						target_protocol: cfg.target_protocol,
						auth_scheme: cfg.auth_scheme,
						cost_tier: cfg.cost_tier,
						extra_headers: cfg.extra_headers,
					},
				);
			}
		}
		let default_provider_name =
			default_provider_name.unwrap_or_else(|| DEFAULT_PROVIDER_NAME.to_string());
		Ok(ProviderRegistry {
			providers,
			default_provider_name,
		})
	}

	pub fn get(&self, name: &str) -> Option<&Provider> {
		self.providers.get(name)
	}

	pub fn default_provider_name(&self) -> &str {
		&self.default_provider_name
	}

	pub fn contains(&self, name: &str) -> bool {
		self.providers.contains_key(name)
	}

	pub fn len(&self) -> usize {
		self.providers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.providers.is_empty()
	}

	/// Resolves a model mapping entry to `{providerName, targetModel}`, or
	/// `None` when the named provider isn't configured (cost-safety, §3).
	pub fn resolve_provider_for_model(
		&self,
		mapping: Option<&ModelMapping>,
	) -> Option<(String, String)> {
		let mapping = mapping?;
		let provider_name = mapping
			.provider
			.clone()
			.unwrap_or_else(|| self.default_provider_name.clone());
		if !self.providers.contains_key(&provider_name) {
			return None;
		}
		Some((provider_name, mapping.target.clone()))
	}

	pub fn format_auth_header(
		&self,
		provider_name: &str,
		key: &SecretString,
	) -> Option<AuthHeader> {
		let provider = self.providers.get(provider_name)?;
		Some(match &provider.auth_scheme {
			AuthScheme::XApiKey => AuthHeader {
				header_name: "x-api-key".to_string(),
				header_value: key.expose_secret().to_string(),
			},
			AuthScheme::Bearer => AuthHeader {
				header_name: "authorization".to_string(),
				header_value: format!("Bearer {}", key.expose_secret()),
			},
			AuthScheme::Custom { header } => AuthHeader {
				header_name: header.clone(),
				header_value: key.expose_secret().to_string(),
			},
		})
	}
}

fn is_valid_header_name(name: &str) -> bool {
	!name.is_empty() && http::HeaderName::from_bytes(name.as_bytes()).is_ok()
}

/// Either a bare string (uses the default provider) or `{target, provider}`,
/// per §3 "Model mapping entry".
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum ModelMappingEntry {
	Simple(String),
	Detailed { target: String, provider: String },
}

#[derive(Debug, Clone)]
pub struct ModelMapping {
	pub target: String,
	pub provider: Option<String>,
}

impl From<ModelMappingEntry> for ModelMapping {
	fn from(e: ModelMappingEntry) -> Self {
		match e {
			ModelMappingEntry::Simple(target) => ModelMapping {
				target,
				provider: None,
			},
			ModelMappingEntry::Detailed { target, provider } => ModelMapping {
				target,
				provider: Some(provider),
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn key(s: &str) -> SecretString {
		SecretString::from(s.to_string())
	}

	#[test]
	fn default_provider_exists_when_unconfigured() {
		let reg = ProviderRegistry::new(HashMap::new(), None).unwrap();
		assert!(reg.contains(DEFAULT_PROVIDER_NAME));
		assert_eq!(reg.default_provider_name(), DEFAULT_PROVIDER_NAME);
	}

	#[test]
	fn resolve_returns_none_for_unconfigured_provider() {
		let reg = ProviderRegistry::new(HashMap::new(), None).unwrap();
		let mapping = ModelMapping {
			target: "claude-opus-4".to_string(),
			provider: Some("anthropic".to_string()),
		};
		assert!(reg.resolve_provider_for_model(Some(&mapping)).is_none());
	}

	#[test]
	fn format_auth_header_bearer() {
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
		let reg = ProviderRegistry::new(configs, Some("anthropic".to_string())).unwrap();
		let header = reg.format_auth_header("anthropic", &key("sk-123")).unwrap();
		assert_eq!(header.header_name, "authorization");
		assert_eq!(header.header_value, "Bearer sk-123");
	}

	#[test]
	fn rejects_invalid_custom_header_name() {
		let mut configs = HashMap::new();
		configs.insert(
			"bad".to_string(),
			ProviderConfig {
				target_host: "example.com".to_string(),
				target_base_path: String::new(),
				target_protocol: "https:".to_string(),
				auth_scheme: AuthScheme::Custom {
					header: "not a header\n".to_string(),
				},
				cost_tier: CostTier::Free,
				extra_headers: HashMap::new(),
			},
		);
		assert!(ProviderRegistry::new(configs, None).is_err());
	}
}
