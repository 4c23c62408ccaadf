pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::engine::types::DetectedFeature;
use crate::providers::PageSnapshot;

/// Trait that every UI validation plugin implements.
pub trait ValidationPlugin: Send + Sync {
    /// Feature type identifier (e.g., "form", "table").
    fn feature_type(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON schema for the config of test cases targeting this feature.
    fn schema(&self) -> serde_json::Value;

    /// Find instances of this feature on a page.
    fn detect(&self, page: &PageSnapshot) -> Vec<DetectedFeature>;
}

/// Registry of validation plugins, populated explicitly at start-up.
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn ValidationPlugin>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Create a registry with all built-in plugins registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn ValidationPlugin>) {
        self.plugins.insert(plugin.feature_type().to_string(), plugin);
    }

    pub fn get(&self, feature_type: &str) -> Option<Arc<dyn ValidationPlugin>> {
        self.plugins.get(feature_type).cloned()
    }

    /// List all registered feature types with descriptions.
    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .plugins
            .values()
            .map(|p| (p.feature_type(), p.description()))
            .collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }

    /// Run every plugin's detector over a page, in feature-type order.
    pub fn detect_all(&self, page: &PageSnapshot) -> Vec<DetectedFeature> {
        let mut names: Vec<&String> = self.plugins.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|name| self.plugins[name].detect(page))
            .collect()
    }

    /// Check a test-case config against the plugin's schema.
    pub fn validate_config(&self, feature_type: &str, config: &serde_json::Value) -> Result<()> {
        let plugin = self
            .get(feature_type)
            .ok_or_else(|| anyhow::anyhow!("Unknown feature type: {}", feature_type))?;

        let schema = plugin.schema();
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| anyhow::anyhow!("Invalid schema for '{}': {}", feature_type, e))?;

        let errors: Vec<String> = validator
            .iter_errors(config)
            .map(|e| format!("{} at {}", e, e.instance_path()))
            .collect();

        if !errors.is_empty() {
            anyhow::bail!(
                "Config for '{}' failed validation: {}",
                feature_type,
                errors.join("; ")
            );
        }
        Ok(())
    }
}
