//! Configuration as seen by the engine.

use serde::Deserialize;

/// Source of per-module configuration sections.
pub trait ConfigProvider: Send + Sync {
    /// Raw config section of a module, keyed by module name.
    fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value>;
}

/// Engine-level settings read from a module's config section.
///
/// ```yaml
/// modules:
///   dashboard:
///     disabled: false
///     disable_on_exception: true
///     order: 2000
///     options:
///       title: "Ops"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModuleSettings {
    pub disabled: bool,
    pub disable_on_exception: Option<bool>,
    pub order: Option<i32>,
    /// Bound onto the module's options when it registered with `bind_config`.
    pub options: Option<serde_json::Value>,
}

impl ModuleSettings {
    pub fn from_value(value: &serde_json::Value) -> anyhow::Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(Self::deserialize(value)?)
    }
}
