pub mod config;
pub mod config_provider;
pub mod logging;

pub use config::*;
pub use config_provider::*;
pub use logging::*;
pub use stagekit::ConfigProvider;
