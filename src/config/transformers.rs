//! Transformer configuration
//!
//! Each `[transformers.<name>]` table enables one pipeline transformer and
//! scopes it to providers/models via glob predicates. Table order in the
//! file is execution order.

use serde::Deserialize;

/// One configured transformer
#[derive(Debug, Clone)]
pub struct TransformerConfig {
    /// Registry name, e.g. "deepseek"
    pub name: String,
    pub enabled: bool,
    /// Provider-name predicates: case-insensitive exact match or glob
    pub providers: Vec<String>,
    /// Concrete-model predicates: glob, "*" matches all
    pub models: Vec<String>,
    /// Transformer-specific options (max_output, cache_control, reminder, ...)
    pub options: serde_json::Value,
}

/// Known keys of a `[transformers.<name>]` table; everything else lands in
/// the free-form options bag.
#[derive(Debug, Deserialize, Default)]
struct FileTransformer {
    enabled: Option<bool>,
    providers: Option<Vec<String>>,
    models: Option<Vec<String>>,
}

impl TransformerConfig {
    /// Build the ordered transformer list from the raw `[transformers]`
    /// table. Iteration order is file order (toml preserve_order).
    pub fn from_table(table: Option<toml::Table>) -> anyhow::Result<Vec<Self>> {
        let Some(table) = table else {
            return Ok(Vec::new());
        };

        let mut configs = Vec::with_capacity(table.len());
        for (name, value) in table {
            let toml::Value::Table(mut entry) = value else {
                anyhow::bail!("[transformers.{name}] must be a table");
            };

            let known = FileTransformer {
                enabled: take_as(&mut entry, "enabled")?,
                providers: take_as(&mut entry, "providers")?,
                models: take_as(&mut entry, "models")?,
            };

            // Remaining keys are transformer-specific options
            let options = serde_json::to_value(&entry)?;

            configs.push(TransformerConfig {
                name,
                enabled: known.enabled.unwrap_or(true),
                providers: known.providers.unwrap_or_else(|| vec!["*".to_string()]),
                models: known.models.unwrap_or_else(|| vec!["*".to_string()]),
                options,
            });
        }
        Ok(configs)
    }

    /// Read a typed option from the free-form bag
    #[allow(dead_code)] // Transformers read ctx.options directly; kept for config tooling
    pub fn option<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.options
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

fn take_as<T: serde::de::DeserializeOwned>(
    table: &mut toml::Table,
    key: &str,
) -> anyhow::Result<Option<T>> {
    match table.remove(key) {
        Some(value) => Ok(Some(value.try_into()?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Vec<TransformerConfig> {
        #[derive(Deserialize)]
        struct Wrapper {
            transformers: Option<toml::Table>,
        }
        let wrapper: Wrapper = toml::from_str(src).unwrap();
        TransformerConfig::from_table(wrapper.transformers).unwrap()
    }

    #[test]
    fn test_missing_section_is_empty() {
        assert!(parse("").is_empty());
    }

    #[test]
    fn test_order_and_options() {
        let configs = parse(
            r#"
            [transformers.deepseek]
            enabled = true
            providers = ["deepseek*"]
            models = ["*"]
            max_output = 4096

            [transformers.openrouter]
            providers = ["openrouter"]
            cache_control = { ttl = 3600, refresh = "force" }
            "#,
        );

        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].name, "deepseek");
        assert_eq!(configs[1].name, "openrouter");

        assert_eq!(configs[0].option::<u32>("max_output"), Some(4096));
        let cc: serde_json::Value = configs[1].option("cache_control").unwrap();
        assert_eq!(cc["ttl"], 3600);

        // enabled defaults to true, models defaults to ["*"]
        assert!(configs[1].enabled);
        assert_eq!(configs[1].models, vec!["*".to_string()]);
    }
}
