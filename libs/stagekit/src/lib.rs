//! # StageKit - Staged Module Configuration
//!
//! Modules own an options type, declare which other modules they depend on,
//! and are driven through a fixed sequence of lifecycle phases in dependency
//! order.
//!
//! ## Features
//!
//! - **Ordered configuration**: any caller can queue actions against a module's
//!   options; actions apply by `(order, origin, insertion)` and are
//!   de-duplicated by key
//! - **Dependency graph**: cycle detection, topological scheduling, transitive
//!   queries for diagnostics
//! - **Phase lifecycle**: ConfigureBuilder → ConfigureServices →
//!   PostConfigureServices → ConfigureApplicationBuilder → ConfigureEndpoints
//! - **Failure containment**: errors are collected per module and raised once;
//!   modules flagged "disable on exception" are switched off together with
//!   their dependents instead
//! - **Auto-discovery**: modules are collected via inventory
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stagekit::{order, Module, ModuleId, ModuleRegistration, PhaseContext, Registry};
//!
//! const CORE: ModuleId = ModuleId::new("core");
//! const AUTH: ModuleId = ModuleId::new("auth");
//!
//! #[derive(Default)]
//! struct CoreOptions { conn: String }
//!
//! struct Core(Arc<CoreOptions>);
//! impl Module for Core {
//!     fn configure_services(&self, ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
//!         ctx.resource::<Vec<String>>()?.push(format!("db:{}", self.0.conn));
//!         Ok(())
//!     }
//!     fn as_any(&self) -> &dyn std::any::Any { self }
//! }
//!
//! let mut registry = Registry::new();
//! registry.register(
//!     ModuleRegistration::new(CORE, |o: Arc<CoreOptions>| Ok(Core(o))).require_keys(["ConnString"]),
//! )?;
//! registry.configure_option(CORE, order::NORMAL, "ConnString", |o: &mut CoreOptions| {
//!     o.conn = "postgres://localhost/app".into();
//! })?;
//! let report = registry.build(&mut stagekit::PhaseResources::new())?;
//! ```

pub use anyhow::Result;

// Re-export inventory for user convenience
pub use inventory;

pub mod context;
pub mod contracts;
pub mod descriptor;
pub mod graph;
pub mod guide;
pub mod ledger;
pub mod options;
pub mod phase;
pub mod profiler;
pub mod queue;
pub mod registry;
pub mod status;

pub use context::{ConfigProvider, ModuleSettings};
pub use contracts::{Module, ModuleId};
pub use descriptor::{DisableReason, ModuleDescriptor, ModuleRegistration, DEFAULT_MODULE_ORDER};
pub use graph::{DependencyGraph, DependencyInfo};
pub use guide::{DependencyClaims, ModuleGuide};
pub use ledger::{AggregateError, ErrorKind, ErrorLedger, ErrorRecord};
pub use options::{OptionSet, OptionType};
pub use phase::{ModuleState, Phase, PhaseContext, PhaseHost, PhaseResources};
pub use profiler::{BuildProfile, ModuleTiming};
pub use queue::{order, ActionOrigin, OrderedQueue, Priority};
pub use registry::{BuildReport, Registrator, Registry, RegistryError, CONFIG_OPTIONS_KEY};
pub use status::ModuleStatus;
