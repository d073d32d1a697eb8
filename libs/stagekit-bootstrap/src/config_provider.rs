use crate::config::AppConfig;
use stagekit::ConfigProvider;
use std::sync::Arc;

/// Serves module sections of an [`AppConfig`] to the registry.
#[derive(Debug, Clone)]
pub struct AppConfigProvider(Arc<AppConfig>);

impl AppConfigProvider {
    pub fn new(config: AppConfig) -> Self {
        Self(Arc::new(config))
    }

    pub fn from_arc(config: Arc<AppConfig>) -> Self {
        Self(config)
    }

    pub fn inner(&self) -> &AppConfig {
        &self.0
    }

    /// A top-level section as JSON ("host", "logging").
    pub fn config_raw(&self, key: &str) -> Option<serde_json::Value> {
        match key {
            "host" => serde_json::to_value(&self.0.host).ok(),
            "logging" => self
                .0
                .logging
                .as_ref()
                .and_then(|v| serde_json::to_value(v).ok()),
            _ => None,
        }
    }
}

impl ConfigProvider for AppConfigProvider {
    fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value> {
        self.0.modules.get(module_name)
    }
}
