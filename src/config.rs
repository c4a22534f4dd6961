//! Top-level configuration. Enumerated config surface per §6, loaded via
//! [`crate::serdes::format::from_str`] so both YAML and JSON files are
//! accepted, mirroring the teacher's `config::parse_config` entry point.
//! Construction of the derived runtime objects (provider registry, model
//! router) happens in [`RuntimeConfig::build`] so invalid config (unknown
//! provider, bad auth scheme, bad glob pattern) fails loudly before the
//! proxy starts serving traffic.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::dispatch::AdaptiveTimeoutConfig;
use crate::pool::{KeySelectionConfig, PoolConfig};
use crate::provider::{ModelMapping, ModelMappingEntry, ProviderConfig, ProviderError, ProviderRegistry};
use crate::ratelimit::RateLimitConfig;
use crate::retry::RetryConfig;
use crate::router::{ModelRouter, RouterConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRateLimitCooldownConfig {
	#[serde(with = "crate::serdes::serde_millis")]
	pub base_cooldown: Duration,
	#[serde(with = "crate::serdes::serde_millis")]
	pub cooldown_decay: Duration,
}

impl Default for KeyRateLimitCooldownConfig {
	fn default() -> Self {
		KeyRateLimitCooldownConfig {
			base_cooldown: Duration::from_secs(1),
			cooldown_decay: Duration::from_secs(300),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountLevelDetectionConfig {
	pub enabled: bool,
	pub key_threshold: usize,
	#[serde(with = "crate::serdes::serde_millis")]
	pub window: Duration,
	#[serde(with = "crate::serdes::serde_millis")]
	pub cooldown: Duration,
}

impl Default for AccountLevelDetectionConfig {
	fn default() -> Self {
		AccountLevelDetectionConfig {
			enabled: true,
			key_threshold: 3,
			window: Duration::from_secs(10),
			cooldown: Duration::from_secs(30),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCooldownConfig {
	#[serde(with = "crate::serdes::serde_millis")]
	pub base: Duration,
	#[serde(with = "crate::serdes::serde_millis")]
	pub cap: Duration,
	#[serde(with = "crate::serdes::serde_millis")]
	pub decay: Duration,
	#[serde(with = "crate::serdes::serde_millis")]
	pub sleep_threshold: Duration,
}

impl Default for PoolCooldownConfig {
	fn default() -> Self {
		PoolCooldownConfig {
			base: Duration::from_millis(250),
			cap: Duration::from_secs(10),
			decay: Duration::from_secs(60),
			sleep_threshold: Duration::from_secs(2),
		}
	}
}

/// The full enumerated config surface of §6. `deny_unknown_fields` is
/// deliberately omitted at this top level (unlike the nested structs) so
/// an older deployment config with extra top-level keys (e.g. a UI-only
/// field) doesn't hard-fail; every nested section still rejects unknown
/// fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
	pub max_concurrency_per_key: u32,
	pub circuit_breaker: BreakerConfig,
	pub rate_limit: RateLimitConfig,
	pub key_selection: KeySelectionConfig,
	pub pool_cooldown: PoolCooldownConfig,
	pub key_rate_limit_cooldown: KeyRateLimitCooldownConfig,
	pub account_level_detection: AccountLevelDetectionConfig,
	pub providers: HashMap<String, ProviderConfig>,
	pub default_provider_name: Option<String>,
	pub model_mapping: HashMap<String, ModelMappingEntry>,
	pub model_routing: RouterConfig,
	pub adaptive_timeout: AdaptiveTimeoutConfig,
	pub max_retries: u32,
	/// Path to the credential key file (JSON array of secrets, or a
	/// provider-tagged map), watched for hot reload when set.
	pub key_file: Option<PathBuf>,
	pub listen_addr: String,
	pub trace_capacity: usize,
	pub failed_request_body_limit: usize,
	#[serde(with = "crate::serdes::serde_millis")]
	pub failed_request_ttl: Duration,
	pub admin_token: Option<String>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			max_concurrency_per_key: 0,
			circuit_breaker: BreakerConfig::default(),
			rate_limit: RateLimitConfig::default(),
			key_selection: KeySelectionConfig::default(),
			pool_cooldown: PoolCooldownConfig::default(),
			key_rate_limit_cooldown: KeyRateLimitCooldownConfig::default(),
			account_level_detection: AccountLevelDetectionConfig::default(),
			providers: HashMap::new(),
			default_provider_name: None,
			model_mapping: HashMap::new(),
			model_routing: RouterConfig::default(),
			adaptive_timeout: AdaptiveTimeoutConfig::default(),
			max_retries: 3,
			key_file: None,
			listen_addr: "0.0.0.0:8787".to_string(),
			trace_capacity: 1000,
			failed_request_body_limit: 64 * 1024,
			failed_request_ttl: Duration::from_secs(7 * 24 * 3600),
			admin_token: None,
		}
	}
}

/// Parses config text (YAML or JSON, auto-detected) into a [`Config`].
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
	crate::serdes::format::from_str(contents)
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
	let contents = std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
	parse_config(&contents)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigBuildError {
	#[error(transparent)]
	Provider(#[from] ProviderError),
	#[error("invalid model routing glob pattern: {0}")]
	Router(#[from] globset::Error),
}

/// Derived runtime objects built from a validated [`Config`]: the pieces
/// that require fallible construction rather than a plain field copy.
pub struct RuntimeConfig {
	pub providers: ProviderRegistry,
	pub router: Option<ModelRouter>,
	pub model_mapping: HashMap<String, ModelMapping>,
	pub pool_config: PoolConfig,
	pub retry_config: RetryConfig,
}

impl RuntimeConfig {
	pub fn build(cfg: &Config) -> Result<Self, ConfigBuildError> {
		let providers = ProviderRegistry::new(cfg.providers.clone(), cfg.default_provider_name.clone())?;
		let router = if cfg.model_routing.enabled {
			Some(ModelRouter::new(cfg.model_routing.clone())?)
		} else {
			None
		};
		let model_mapping = cfg
			.model_mapping
			.iter()
			.map(|(k, v)| (k.clone(), ModelMapping::from(v.clone())))
			.collect();
		let pool_config = PoolConfig {
			breaker: cfg.circuit_breaker,
			rate_limit: cfg.rate_limit,
			base_rate_limit_cooldown: cfg.key_rate_limit_cooldown.base_cooldown,
			rate_limit_cooldown_decay: cfg.key_rate_limit_cooldown.cooldown_decay,
			key_selection: cfg.key_selection,
			max_in_flight_per_key: cfg.max_concurrency_per_key,
			default_model_concurrency: 0,
			pool_rate_limit_decay: cfg.pool_cooldown.decay,
			account_rate_limit_window: cfg.account_level_detection.window,
			account_rate_limit_unique_keys: cfg.account_level_detection.key_threshold,
			account_rate_limit_cooldown: cfg.account_level_detection.cooldown,
			default_provider_name: Some(providers.default_provider_name().to_string()),
		};
		let retry_config = RetryConfig {
			max_retries: cfg.max_retries,
			sleep_threshold: cfg.pool_cooldown.sleep_threshold,
		};
		Ok(RuntimeConfig {
			providers,
			router,
			model_mapping,
			pool_config,
			retry_config,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_minimal_yaml() {
		let yaml = "listenAddr: \"127.0.0.1:9000\"\nmaxRetries: 5\n";
		let cfg = parse_config(yaml).unwrap();
		assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
		assert_eq!(cfg.max_retries, 5);
	}

	#[test]
	fn parses_minimal_json() {
		let json = r#"{"listenAddr": "127.0.0.1:9001"}"#;
		let cfg = parse_config(json).unwrap();
		assert_eq!(cfg.listen_addr, "127.0.0.1:9001");
	}

	#[test]
	fn build_fails_on_bad_custom_header() {
		let mut cfg = Config::default();
		cfg.providers.insert(
			"bad".to_string(),
			ProviderConfig {
				target_host: "example.com".to_string(),
				target_base_path: String::new(),
				target_protocol: "https:".to_string(),
				auth_scheme: crate::provider::AuthScheme::Custom {
					header: "not a header\n".to_string(),
				},
				cost_tier: crate::provider::CostTier::Free,
				extra_headers: HashMap::new(),
			},
		);
		assert!(RuntimeConfig::build(&cfg).is_err());
	}

	#[test]
	fn build_succeeds_on_default_config() {
		let cfg = Config::default();
		let runtime = RuntimeConfig::build(&cfg).unwrap();
		assert!(runtime.router.is_none());
	}
}
