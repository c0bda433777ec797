//! Model tier router
//!
//! Maps a requested Claude model name to a `(provider, concrete model)` pair
//! through a three-tier table. Each tier holds a runtime "current selection"
//! of the form `ProviderName:concreteModel`, or a bare concrete model in
//! which case the first provider advertising it wins.
//!
//! Selections are read under a shared lock and swapped atomically by the
//! config API; readers snapshot, so an in-flight request never observes a
//! torn update.

use crate::config::{Config, ProviderConfig, Tier};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Routing failure kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// A selection references a provider or model the catalog doesn't list
    UnknownModel(String),
    /// No provider advertises any model for the tier
    NoProviders(Tier),
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::UnknownModel(sel) => write!(f, "unknown provider/model: {sel}"),
            RouterError::NoProviders(tier) => {
                write!(f, "no provider advertises a {} model", tier.as_str())
            }
        }
    }
}

impl std::error::Error for RouterError {}

/// A resolved routing decision
#[derive(Debug, Clone)]
pub struct Resolved {
    pub tier: Tier,
    pub provider: ProviderConfig,
    pub concrete_model: String,
}

/// Pick the tier for a requested Claude model name
///
/// Substring match, checked in this order; anything unrecognized lands on
/// the big tier.
pub fn tier_of(model: &str) -> Tier {
    let lower = model.to_lowercase();
    if lower.contains("haiku") {
        Tier::Small
    } else if lower.contains("sonnet") {
        Tier::Middle
    } else {
        // "opus" and everything else
        Tier::Big
    }
}

/// Tier router with runtime-mutable current selections
pub struct ModelRouter {
    config: Arc<Config>,
    selections: RwLock<HashMap<Tier, String>>,
}

impl ModelRouter {
    /// Build from config defaults plus any persisted selections
    /// (persisted values override the file defaults)
    pub fn new(config: Arc<Config>, persisted: HashMap<Tier, String>) -> Self {
        let mut selections = HashMap::new();
        for tier in [Tier::Big, Tier::Middle, Tier::Small] {
            if let Some(sel) = persisted
                .get(&tier)
                .cloned()
                .or_else(|| config.tier_default(tier).map(String::from))
            {
                selections.insert(tier, sel);
            }
        }
        Self {
            config,
            selections: RwLock::new(selections),
        }
    }

    /// Resolve a requested model name to a provider and concrete model
    pub fn resolve(&self, requested: &str) -> Result<Resolved, RouterError> {
        let tier = tier_of(requested);

        let selection = {
            let selections = self.selections.read().unwrap_or_else(|e| e.into_inner());
            selections.get(&tier).cloned()
        };

        match selection {
            Some(sel) => {
                let (provider, concrete_model) = self.validate_selection(tier, &sel)?;
                Ok(Resolved {
                    tier,
                    provider,
                    concrete_model,
                })
            }
            // No selection configured: first provider advertising the tier wins
            None => self.first_for_tier(tier),
        }
    }

    /// Validate and atomically swap a tier's current selection.
    /// Returns the canonical `Provider:model` form actually stored.
    pub fn update(&self, tier: Tier, selection: &str) -> Result<String, RouterError> {
        let (provider, concrete_model) = self.validate_selection(tier, selection)?;
        let canonical = format!("{}:{}", provider.name, concrete_model);

        let mut selections = self.selections.write().unwrap_or_else(|e| e.into_inner());
        selections.insert(tier, canonical.clone());
        Ok(canonical)
    }

    /// Snapshot of the current selections keyed by tier config key
    pub fn snapshot(&self) -> HashMap<&'static str, Option<String>> {
        let selections = self.selections.read().unwrap_or_else(|e| e.into_inner());
        [Tier::Big, Tier::Middle, Tier::Small]
            .into_iter()
            .map(|t| (t.config_key(), selections.get(&t).cloned()))
            .collect()
    }

    /// Parse a selection string against the catalog.
    ///
    /// `Provider:model` requires the named provider to advertise the model
    /// under the tier. A bare model resolves to the first provider listing
    /// it. Model names may themselves contain colons (e.g. registry paths),
    /// so the prefix is only treated as a provider name when it matches one.
    fn validate_selection(
        &self,
        tier: Tier,
        selection: &str,
    ) -> Result<(ProviderConfig, String), RouterError> {
        if let Some((prefix, model)) = selection.split_once(':') {
            if let Some(provider) = self.config.provider(prefix) {
                if provider.advertises(tier, model) {
                    return Ok((provider.clone(), model.to_string()));
                }
                return Err(RouterError::UnknownModel(selection.to_string()));
            }
        }

        // Bare model: first provider listing it under this tier wins
        self.config
            .providers
            .iter()
            .find(|p| p.advertises(tier, selection))
            .map(|p| (p.clone(), selection.to_string()))
            .ok_or_else(|| RouterError::UnknownModel(selection.to_string()))
    }

    fn first_for_tier(&self, tier: Tier) -> Result<Resolved, RouterError> {
        self.config
            .providers
            .iter()
            .find_map(|p| {
                p.models_for(tier).first().map(|m| Resolved {
                    tier,
                    provider: p.clone(),
                    concrete_model: m.clone(),
                })
            })
            .ok_or(RouterError::NoProviders(tier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderType;

    fn test_config() -> Arc<Config> {
        let mut config = Config::default();
        config.providers = vec![
            ProviderConfig {
                name: "OpenAI".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: None,
                env_key: None,
                provider_type: ProviderType::Openai,
                big_models: vec!["gpt-4o".to_string()],
                middle_models: vec!["gpt-4o".to_string()],
                small_models: vec!["gpt-4o-mini".to_string()],
            },
            ProviderConfig {
                name: "DeepSeek".to_string(),
                base_url: "https://api.deepseek.com/v1".to_string(),
                api_key: None,
                env_key: None,
                provider_type: ProviderType::Openai,
                big_models: vec!["deepseek-chat".to_string()],
                middle_models: vec!["deepseek-chat".to_string()],
                small_models: vec![],
            },
        ];
        config.small_model = Some("OpenAI:gpt-4o-mini".to_string());
        config.middle_model = Some("gpt-4o".to_string());
        Arc::new(config)
    }

    #[test]
    fn test_tier_of_substring_match() {
        assert_eq!(tier_of("claude-3-5-haiku-20241022"), Tier::Small);
        assert_eq!(tier_of("claude-sonnet-4-20250514"), Tier::Middle);
        assert_eq!(tier_of("claude-opus-4-20250514"), Tier::Big);
        assert_eq!(tier_of("totally-unknown-model"), Tier::Big);
    }

    #[test]
    fn test_resolve_qualified_selection() {
        let router = ModelRouter::new(test_config(), HashMap::new());
        let resolved = router.resolve("claude-3-5-haiku-20241022").unwrap();
        assert_eq!(resolved.provider.name, "OpenAI");
        assert_eq!(resolved.concrete_model, "gpt-4o-mini");
        assert_eq!(resolved.tier, Tier::Small);
    }

    #[test]
    fn test_resolve_bare_model_first_provider_wins() {
        let router = ModelRouter::new(test_config(), HashMap::new());
        let resolved = router.resolve("claude-sonnet-4-20250514").unwrap();
        assert_eq!(resolved.provider.name, "OpenAI");
        assert_eq!(resolved.concrete_model, "gpt-4o");
    }

    #[test]
    fn test_resolve_unconfigured_tier_falls_back() {
        // big tier has no configured selection; first provider with a big
        // model wins
        let router = ModelRouter::new(test_config(), HashMap::new());
        let resolved = router.resolve("claude-opus-4-20250514").unwrap();
        assert_eq!(resolved.provider.name, "OpenAI");
        assert_eq!(resolved.concrete_model, "gpt-4o");
    }

    #[test]
    fn test_update_validates_against_catalog() {
        let router = ModelRouter::new(test_config(), HashMap::new());

        let err = router.update(Tier::Big, "OpenAI:no-such-model").unwrap_err();
        assert!(matches!(err, RouterError::UnknownModel(_)));

        let canonical = router.update(Tier::Big, "deepseek-chat").unwrap();
        assert_eq!(canonical, "DeepSeek:deepseek-chat");

        let resolved = router.resolve("claude-opus-4-20250514").unwrap();
        assert_eq!(resolved.provider.name, "DeepSeek");
    }

    #[test]
    fn test_update_is_idempotent() {
        let router = ModelRouter::new(test_config(), HashMap::new());
        let before = router.resolve("claude-3-5-haiku-20241022").unwrap();

        router.update(Tier::Small, "OpenAI:gpt-4o-mini").unwrap();
        let after = router.resolve("claude-3-5-haiku-20241022").unwrap();

        assert_eq!(before.provider.name, after.provider.name);
        assert_eq!(before.concrete_model, after.concrete_model);
    }

    #[test]
    fn test_no_providers_error() {
        let config = Arc::new(Config::default());
        let router = ModelRouter::new(config, HashMap::new());
        let err = router.resolve("claude-opus-4-20250514").unwrap_err();
        assert_eq!(err, RouterError::NoProviders(Tier::Big));
    }

    #[test]
    fn test_persisted_selection_overrides_default() {
        let mut persisted = HashMap::new();
        persisted.insert(Tier::Middle, "DeepSeek:deepseek-chat".to_string());
        let router = ModelRouter::new(test_config(), persisted);

        let resolved = router.resolve("claude-sonnet-4-20250514").unwrap();
        assert_eq!(resolved.provider.name, "DeepSeek");
        assert_eq!(resolved.concrete_model, "deepseek-chat");
    }
}
