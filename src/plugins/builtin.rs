use std::sync::Arc;

use serde_json::json;

use super::{PluginRegistry, ValidationPlugin};
use crate::engine::types::DetectedFeature;
use crate::providers::{ElementInfo, PageSnapshot};

/// Register all built-in plugins into the registry.
pub fn register_all(registry: &mut PluginRegistry) {
    registry.register(Arc::new(PageLoadPlugin));
    registry.register(Arc::new(FormPlugin));
    registry.register(Arc::new(TablePlugin));
    registry.register(Arc::new(SearchPlugin));
    registry.register(Arc::new(NavigationPlugin));
}

fn label_of(el: &ElementInfo, fallback: &str) -> String {
    el.label
        .clone()
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn has_role(el: &ElementInfo, role: &str) -> bool {
    el.role.as_deref().is_some_and(|r| r.eq_ignore_ascii_case(role))
}

/// Page-level check; never detected, only planned.
pub struct PageLoadPlugin;

impl ValidationPlugin for PageLoadPlugin {
    fn feature_type(&self) -> &str {
        "page_load"
    }

    fn description(&self) -> &str {
        "Page loads without an error status"
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "timeout_ms": { "type": "integer", "minimum": 1 }
            }
        })
    }

    fn detect(&self, _page: &PageSnapshot) -> Vec<DetectedFeature> {
        Vec::new()
    }
}

pub struct FormPlugin;

impl ValidationPlugin for FormPlugin {
    fn feature_type(&self) -> &str {
        "form"
    }

    fn description(&self) -> &str {
        "Forms with submit controls"
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "selector": { "type": ["string", "null"] },
                "fields": { "type": "integer", "minimum": 0 },
                "submit": { "type": "boolean" }
            }
        })
    }

    fn detect(&self, page: &PageSnapshot) -> Vec<DetectedFeature> {
        let fields = page
            .elements
            .iter()
            .filter(|e| matches!(e.tag.as_str(), "input" | "select" | "textarea"))
            .filter(|e| e.input_type.as_deref() != Some("search") && !has_role(e, "searchbox"))
            .count();
        page.elements
            .iter()
            .filter(|e| e.tag == "form")
            .map(|e| DetectedFeature {
                feature_type: "form".to_string(),
                label: label_of(e, "form"),
                selector: e.selector.clone(),
                config: json!({ "selector": e.selector, "fields": fields, "submit": false }),
            })
            .collect()
    }
}

pub struct TablePlugin;

impl ValidationPlugin for TablePlugin {
    fn feature_type(&self) -> &str {
        "table"
    }

    fn description(&self) -> &str {
        "Data tables and grids"
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "selector": { "type": ["string", "null"] },
                "min_rows": { "type": "integer", "minimum": 0 }
            }
        })
    }

    fn detect(&self, page: &PageSnapshot) -> Vec<DetectedFeature> {
        page.elements
            .iter()
            .filter(|e| e.tag == "table" || has_role(e, "grid"))
            .map(|e| DetectedFeature {
                feature_type: "table".to_string(),
                label: label_of(e, "table"),
                selector: e.selector.clone(),
                config: json!({ "selector": e.selector, "min_rows": 0 }),
            })
            .collect()
    }
}

pub struct SearchPlugin;

impl ValidationPlugin for SearchPlugin {
    fn feature_type(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search boxes"
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "selector": { "type": ["string", "null"] },
                "query": { "type": "string" }
            }
        })
    }

    fn detect(&self, page: &PageSnapshot) -> Vec<DetectedFeature> {
        page.elements
            .iter()
            .filter(|e| e.input_type.as_deref() == Some("search") || has_role(e, "searchbox"))
            .map(|e| DetectedFeature {
                feature_type: "search".to_string(),
                label: label_of(e, "search"),
                selector: e.selector.clone(),
                config: json!({ "selector": e.selector, "query": "test" }),
            })
            .collect()
    }
}

pub struct NavigationPlugin;

impl ValidationPlugin for NavigationPlugin {
    fn feature_type(&self) -> &str {
        "navigation"
    }

    fn description(&self) -> &str {
        "Navigation menus"
    }

    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "selector": { "type": ["string", "null"] }
            }
        })
    }

    fn detect(&self, page: &PageSnapshot) -> Vec<DetectedFeature> {
        page.elements
            .iter()
            .filter(|e| e.tag == "nav" || has_role(e, "navigation"))
            .map(|e| DetectedFeature {
                feature_type: "navigation".to_string(),
                label: label_of(e, "navigation"),
                selector: e.selector.clone(),
                config: json!({ "selector": e.selector }),
            })
            .collect()
    }
}
