//! Model router. C7 of the routing core.
//!
//! Classifies an inbound request into a complexity tier, applies the
//! configured per-tier pool strategy and fallback chain, and — on a
//! committed decision — atomically reserves a per-model concurrency slot
//! from the [`crate::pool::CredentialPool`] so the caller owns exactly one
//! release.

use std::collections::HashMap;

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};

use crate::pool::CredentialPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
	Light,
	Medium,
	Heavy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStrategy {
	/// Always route to the first (best) model configured for the tier.
	Quality,
	/// Round robin across the tier's configured models.
	Balanced,
	/// Route to whichever tier model currently has the most free
	/// concurrency headroom.
	Throughput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
	Pool,
	Failover,
	Complexity,
	Direct,
	Override,
	Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
	pub model: String,
	pub source: DecisionSource,
	pub tier: Tier,
	pub reason: String,
	pub committed: bool,
	pub context_overflow: bool,
	/// The model's concurrency gate rejected this attempt, per §4.9 step 2.
	/// Mutually exclusive with `context_overflow` in practice (overflow is
	/// checked first and short-circuits before a slot is ever attempted),
	/// but kept as its own field rather than folded into `context_overflow`
	/// since the two carry different retryability.
	pub model_at_capacity: bool,
}

impl RoutingDecision {
	fn uncommitted(model: String, source: DecisionSource, tier: Tier, reason: impl Into<String>) -> Self {
		RoutingDecision {
			model,
			source,
			tier,
			reason: reason.into(),
			committed: false,
			context_overflow: false,
			model_at_capacity: false,
		}
	}

	fn at_capacity(model: String, source: DecisionSource, tier: Tier, reason: impl Into<String>) -> Self {
		RoutingDecision {
			model,
			source,
			tier,
			reason: reason.into(),
			committed: false,
			context_overflow: false,
			model_at_capacity: true,
		}
	}

	fn overflow(model: String, tier: Tier) -> Self {
		RoutingDecision {
			model,
			source: DecisionSource::Complexity,
			tier,
			reason: "estimated prompt exceeds target model's context window".to_string(),
			committed: false,
			context_overflow: true,
			model_at_capacity: false,
		}
	}

	/// The no-router passthrough decision: model mapping resolved a target
	/// but no router classified it, so there is no tier/fallback reasoning,
	/// only the model's own concurrency gate (§4.9 step 2 applies
	/// regardless of whether routing is configured).
	pub fn direct(model: String, committed: bool, reason: impl Into<String>) -> Self {
		RoutingDecision {
			model,
			source: DecisionSource::Direct,
			tier: Tier::Light,
			reason: reason.into(),
			committed,
			context_overflow: false,
			model_at_capacity: !committed,
		}
	}
}

/// Request-shape signals used for tier classification, per §4.7.
#[derive(Debug, Clone, Default)]
pub struct RequestFeatures {
	pub model: String,
	pub max_tokens: Option<u32>,
	pub message_count: usize,
	pub system_prompt_len: usize,
	pub has_tools: bool,
	pub has_vision: bool,
	pub estimated_prompt_tokens: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RoutingRule {
	/// Glob matched against the request's declared (pre-routing) model name.
	pub pattern: String,
	#[serde(default)]
	pub min_max_tokens: Option<u32>,
	#[serde(default)]
	pub min_message_count: Option<usize>,
	#[serde(default)]
	pub min_system_prompt_len: Option<usize>,
	#[serde(default)]
	pub requires_tools: Option<bool>,
	#[serde(default)]
	pub requires_vision: Option<bool>,
	pub tier: Tier,
}

impl RoutingRule {
	fn matches(&self, matcher: &GlobMatcher, features: &RequestFeatures) -> bool {
		if !matcher.is_match(&features.model) {
			return false;
		}
		if let Some(min) = self.min_max_tokens
			&& features.max_tokens.unwrap_or(0) < min
		{
			return false;
		}
		if let Some(min) = self.min_message_count
			&& features.message_count < min
		{
			return false;
		}
		if let Some(min) = self.min_system_prompt_len
			&& features.system_prompt_len < min
		{
			return false;
		}
		if let Some(want) = self.requires_tools
			&& features.has_tools != want
		{
			return false;
		}
		if let Some(want) = self.requires_vision
			&& features.has_vision != want
		{
			return false;
		}
		true
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierStrategyEntry {
	pub strategy: PoolStrategy,
	/// Candidate models for this tier, in priority order. The `Quality`
	/// strategy always picks index 0; `Throughput` picks by concurrency
	/// headroom; `Balanced` round-robins.
	pub models: Vec<String>,
	/// Context window in tokens, model-for-model aligned with `models`;
	/// missing entries are treated as unbounded.
	#[serde(default)]
	pub context_windows: HashMap<String, u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RouterConfig {
	pub enabled: bool,
	pub rules: Vec<RoutingRule>,
	pub tier_strategies: HashMap<Tier, TierStrategyEntry>,
	/// Ordered fallback model chain tried (each uncommitted, attempted
	/// models excluded) when the chosen tier's primary candidates are all
	/// exhausted or at capacity.
	#[serde(default)]
	pub fallback_chains: HashMap<Tier, Vec<String>>,
	#[serde(default = "default_tier")]
	pub default_tier: Tier,
}

fn default_tier() -> Tier {
	Tier::Medium
}

impl Default for RouterConfig {
	fn default() -> Self {
		RouterConfig {
			enabled: false,
			rules: Vec::new(),
			tier_strategies: HashMap::new(),
			fallback_chains: HashMap::new(),
			default_tier: Tier::Medium,
		}
	}
}

pub struct ModelRouter {
	cfg: RouterConfig,
	compiled_rules: Vec<(GlobMatcher, RoutingRule)>,
	round_robin: std::sync::atomic::AtomicUsize,
}

impl ModelRouter {
	pub fn new(cfg: RouterConfig) -> Result<Self, globset::Error> {
		let mut compiled_rules = Vec::with_capacity(cfg.rules.len());
		for rule in &cfg.rules {
			let matcher = Glob::new(&rule.pattern)?.compile_matcher();
			compiled_rules.push((matcher, rule.clone()));
		}
		Ok(ModelRouter {
			cfg,
			compiled_rules,
			round_robin: std::sync::atomic::AtomicUsize::new(0),
		})
	}

	pub fn is_enabled(&self) -> bool {
		self.cfg.enabled
	}

	fn classify(&self, features: &RequestFeatures) -> Tier {
		for (matcher, rule) in &self.compiled_rules {
			if rule.matches(matcher, features) {
				return rule.tier;
			}
		}
		self.cfg.default_tier
	}

	/// Selects a target within a tier's candidate list per its configured
	/// strategy, skipping any model already present in `attempted`.
	fn select_within_tier(&self, tier: Tier, pool: &CredentialPool, attempted: &[String]) -> Option<String> {
		let entry = self.cfg.tier_strategies.get(&tier)?;
		let candidates: Vec<&String> = entry
			.models
			.iter()
			.filter(|m| !attempted.iter().any(|a| a == *m))
			.collect();
		if candidates.is_empty() {
			return None;
		}
		match entry.strategy {
			PoolStrategy::Quality => Some(candidates[0].clone()),
			PoolStrategy::Balanced => {
				let idx = self.round_robin.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % candidates.len();
				Some(candidates[idx].clone())
			},
			PoolStrategy::Throughput => candidates
				.into_iter()
				.max_by_key(|m| pool.model_headroom(m))
				.cloned(),
		}
	}

	/// Full routing decision per §4.7. `attempted` lists models already
	/// tried on prior attempts of this request (for fallback exclusion).
	/// `override_model`, when present and the caller is authorized to
	/// supply one, short-circuits classification entirely.
	pub fn select_model(
		&self,
		features: &RequestFeatures,
		attempted: &[String],
		override_model: Option<&str>,
		pool: &CredentialPool,
	) -> RoutingDecision {
		if let Some(model) = override_model {
			let tier = self.classify(features);
			return self.commit_or_overflow(model.to_string(), DecisionSource::Override, tier, "explicit override", pool, features, tier);
		}

		if !self.cfg.enabled {
			return self.commit_or_overflow(
				features.model.clone(),
				DecisionSource::Direct,
				self.cfg.default_tier,
				"model routing disabled",
				pool,
				features,
				self.cfg.default_tier,
			);
		}

		let tier = self.classify(features);

		if let Some(model) = self.select_within_tier(tier, pool, attempted) {
			return self.commit_or_overflow(model, DecisionSource::Pool, tier, "tier pool selection", pool, features, tier);
		}

		if let Some(chain) = self.cfg.fallback_chains.get(&tier) {
			for candidate in chain {
				if attempted.iter().any(|a| a == candidate) {
					continue;
				}
				return self.commit_or_overflow(
					candidate.clone(),
					DecisionSource::Fallback,
					tier,
					"fallback chain",
					pool,
					features,
					tier,
				);
			}
		}

		// Every configured candidate for this tier has been attempted;
		// fail over to the request's originally declared model uncommitted,
		// letting the retry loop decide whether to keep going.
		RoutingDecision::uncommitted(
			features.model.clone(),
			DecisionSource::Failover,
			tier,
			"tier and fallback candidates exhausted",
		)
	}

	fn commit_or_overflow(
		&self,
		model: String,
		source: DecisionSource,
		tier: Tier,
		reason: &str,
		pool: &CredentialPool,
		features: &RequestFeatures,
		context_tier: Tier,
	) -> RoutingDecision {
		if let Some(entry) = self.cfg.tier_strategies.get(&context_tier)
			&& let Some(&window) = entry.context_windows.get(&model)
			&& features.estimated_prompt_tokens > window
		{
			return RoutingDecision::overflow(model, tier);
		}
		if !pool.acquire_model_slot(&model) {
			return RoutingDecision::at_capacity(model, source, tier, format!("{reason} (model at capacity)"));
		}
		RoutingDecision {
			model,
			source,
			tier,
			reason: reason.to_string(),
			committed: true,
			context_overflow: false,
			model_at_capacity: false,
		}
	}

	/// Releases the concurrency slot acquired by a `committed=true`
	/// decision. Must be called exactly once per commit.
	pub fn release_model(&self, pool: &CredentialPool, model: &str) {
		pool.release_model_slot(model);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pool::PoolConfig;

	fn features(model: &str) -> RequestFeatures {
		RequestFeatures {
			model: model.to_string(),
			..Default::default()
		}
	}

	fn tier_cfg() -> RouterConfig {
		let mut tier_strategies = HashMap::new();
		tier_strategies.insert(
			Tier::Light,
			TierStrategyEntry {
				strategy: PoolStrategy::Quality,
				models: vec!["small-model".to_string()],
				context_windows: HashMap::new(),
			},
		);
		RouterConfig {
			enabled: true,
			rules: vec![RoutingRule {
				pattern: "*haiku*".to_string(),
				min_max_tokens: None,
				min_message_count: None,
				min_system_prompt_len: None,
				requires_tools: None,
				requires_vision: None,
				tier: Tier::Light,
			}],
			tier_strategies,
			fallback_chains: HashMap::new(),
			default_tier: Tier::Medium,
		}
	}

	#[test]
	fn classifies_by_pattern_and_commits_slot() {
		let router = ModelRouter::new(tier_cfg()).unwrap();
		let pool = CredentialPool::new(PoolConfig::default());
		let decision = router.select_model(&features("claude-haiku"), &[], None, &pool);
		assert_eq!(decision.model, "small-model");
		assert_eq!(decision.tier, Tier::Light);
		assert!(decision.committed);
		assert_eq!(decision.source, DecisionSource::Pool);
	}

	#[test]
	fn release_restores_slot() {
		let mut cfg = tier_cfg();
		cfg.tier_strategies.get_mut(&Tier::Light).unwrap().models = vec!["only-model".to_string()];
		let router = ModelRouter::new(cfg).unwrap();
		let pool = CredentialPool::new(PoolConfig::default());
		pool.set_effective_model_limit("only-model", 1);
		let first = router.select_model(&features("claude-haiku"), &[], None, &pool);
		assert!(first.committed);
		let second = router.select_model(&features("claude-haiku"), &[], None, &pool);
		// At capacity: uncommitted.
		assert!(!second.committed);
		router.release_model(&pool, &first.model);
		let third = router.select_model(&features("claude-haiku"), &[], None, &pool);
		assert!(third.committed);
	}

	#[test]
	fn override_short_circuits_classification() {
		let router = ModelRouter::new(tier_cfg()).unwrap();
		let pool = CredentialPool::new(PoolConfig::default());
		let decision = router.select_model(&features("claude-haiku"), &[], Some("pinned-model"), &pool);
		assert_eq!(decision.model, "pinned-model");
		assert_eq!(decision.source, DecisionSource::Override);
	}

	#[test]
	fn context_overflow_reports_uncommitted() {
		let mut cfg = tier_cfg();
		cfg
			.tier_strategies
			.get_mut(&Tier::Light)
			.unwrap()
			.context_windows
			.insert("small-model".to_string(), 100);
		let router = ModelRouter::new(cfg).unwrap();
		let pool = CredentialPool::new(PoolConfig::default());
		let mut f = features("claude-haiku");
		f.estimated_prompt_tokens = 500;
		let decision = router.select_model(&f, &[], None, &pool);
		assert!(decision.context_overflow);
		assert!(!decision.committed);
	}

	#[test]
	fn disabled_router_passes_through_direct() {
		let mut cfg = tier_cfg();
		cfg.enabled = false;
		let router = ModelRouter::new(cfg).unwrap();
		let pool = CredentialPool::new(PoolConfig::default());
		let decision = router.select_model(&features("gpt-4"), &[], None, &pool);
		assert_eq!(decision.model, "gpt-4");
		assert_eq!(decision.source, DecisionSource::Direct);
		assert!(decision.committed);
	}
}
