//! Provider catalog configuration
//!
//! Each `[[provider]]` table names an upstream backend, its wire protocol,
//! its credentials, and the concrete models it advertises per tier.

use serde::Deserialize;

/// Model tier selected by the requested Claude model name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Big,
    Middle,
    Small,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Big => "big",
            Tier::Middle => "middle",
            Tier::Small => "small",
        }
    }

    /// Config-table key under which the tier's current selection persists
    pub fn config_key(&self) -> &'static str {
        match self {
            Tier::Big => "BIG_MODEL",
            Tier::Middle => "MIDDLE_MODEL",
            Tier::Small => "SMALL_MODEL",
        }
    }
}

/// Wire protocol a provider speaks
///
/// `anthropic` providers receive the original Claude body untranslated;
/// `openai` providers get the Chat Completions conversion.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    #[default]
    Openai,
    Anthropic,
}

/// One upstream backend
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Catalog name, referenced by tier selections as `Name:model`
    pub name: String,
    /// API root, e.g. "https://api.deepseek.com/v1"
    pub base_url: String,

    /// Direct key value (less secure - prefer env_key)
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable to read the key from; wins over api_key
    #[serde(default)]
    pub env_key: Option<String>,

    #[serde(default)]
    pub provider_type: ProviderType,

    #[serde(default)]
    pub big_models: Vec<String>,
    #[serde(default)]
    pub middle_models: Vec<String>,
    #[serde(default)]
    pub small_models: Vec<String>,
}

impl ProviderConfig {
    /// Resolve the API key: env_key takes priority when both are set
    pub fn resolve_key(&self) -> Option<String> {
        if let Some(env_name) = &self.env_key {
            if let Ok(value) = std::env::var(env_name) {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
        self.api_key.clone()
    }

    /// Models this provider advertises for a tier
    pub fn models_for(&self, tier: Tier) -> &[String] {
        match tier {
            Tier::Big => &self.big_models,
            Tier::Middle => &self.middle_models,
            Tier::Small => &self.small_models,
        }
    }

    /// Whether the provider lists `model` under the given tier
    pub fn advertises(&self, tier: Tier, model: &str) -> bool {
        self.models_for(tier).iter().any(|m| m == model)
    }

    pub fn is_native_anthropic(&self) -> bool {
        self.provider_type == ProviderType::Anthropic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(api_key: Option<&str>, env_key: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            name: "OpenAI".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: api_key.map(String::from),
            env_key: env_key.map(String::from),
            provider_type: ProviderType::Openai,
            big_models: vec!["gpt-4o".to_string()],
            middle_models: vec!["gpt-4o".to_string()],
            small_models: vec!["gpt-4o-mini".to_string()],
        }
    }

    #[test]
    fn test_env_key_wins_over_direct() {
        std::env::set_var("CCPROXY_TEST_PROVIDER_KEY", "from-env");
        let p = provider(Some("direct"), Some("CCPROXY_TEST_PROVIDER_KEY"));
        assert_eq!(p.resolve_key().as_deref(), Some("from-env"));
        std::env::remove_var("CCPROXY_TEST_PROVIDER_KEY");
    }

    #[test]
    fn test_missing_env_falls_back_to_direct() {
        let p = provider(Some("direct"), Some("CCPROXY_TEST_UNSET_KEY"));
        assert_eq!(p.resolve_key().as_deref(), Some("direct"));
    }

    #[test]
    fn test_tier_model_lists() {
        let p = provider(None, None);
        assert!(p.advertises(Tier::Small, "gpt-4o-mini"));
        assert!(!p.advertises(Tier::Big, "gpt-4o-mini"));
        assert_eq!(p.models_for(Tier::Middle), &["gpt-4o".to_string()]);
    }

    #[test]
    fn test_provider_type_default_is_openai() {
        let p: ProviderConfig = toml::from_str(
            r#"
            name = "Local"
            base_url = "http://localhost:11434/v1"
            "#,
        )
        .unwrap();
        assert_eq!(p.provider_type, ProviderType::Openai);
        assert!(!p.is_native_anthropic());
    }
}
