//! Lifecycle phases and the context handed to module callbacks.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::contracts::ModuleId;
use crate::options::OptionSet;

/// Build stages a module goes through.
///
/// `ClaimDependencies` runs strictly before every lifecycle phase and is not a
/// state other modules can observe; it only appears here so failures can be
/// tagged with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Phase {
    ClaimDependencies,
    ConfigureBuilder,
    ConfigureServices,
    PostConfigureServices,
    ConfigureApplicationBuilder,
    ConfigureEndpoints,
}

impl Phase {
    /// The five lifecycle phases, in execution order.
    pub const LIFECYCLE: [Phase; 5] = [
        Phase::ConfigureBuilder,
        Phase::ConfigureServices,
        Phase::PostConfigureServices,
        Phase::ConfigureApplicationBuilder,
        Phase::ConfigureEndpoints,
    ];

    pub fn is_lifecycle(self) -> bool {
        self != Phase::ClaimDependencies
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::ClaimDependencies => "ClaimDependencies",
            Phase::ConfigureBuilder => "ConfigureBuilder",
            Phase::ConfigureServices => "ConfigureServices",
            Phase::PostConfigureServices => "PostConfigureServices",
            Phase::ConfigureApplicationBuilder => "ConfigureApplicationBuilder",
            Phase::ConfigureEndpoints => "ConfigureEndpoints",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a module currently is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ModuleState {
    /// Known to the registry; no phase has run yet.
    Declared,
    /// Entered this phase (and possibly failed in it).
    Running(Phase),
    /// All phases completed.
    Built,
}

/// Supplies the per-phase resources (builder, container, pipeline, ...).
///
/// The engine never looks inside these objects; it only guarantees when each
/// module receives them.
pub trait PhaseHost {
    fn resource(&mut self, phase: Phase) -> Option<&mut dyn Any>;
}

/// A host with no resources at all.
impl PhaseHost for () {
    fn resource(&mut self, _phase: Phase) -> Option<&mut dyn Any> {
        None
    }
}

/// Simple `PhaseHost` keeping one resource object per phase.
#[derive(Default)]
pub struct PhaseResources {
    by_phase: HashMap<Phase, Box<dyn Any>>,
}

impl PhaseResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any>(mut self, phase: Phase, resource: T) -> Self {
        self.insert(phase, resource);
        self
    }

    pub fn insert<T: Any>(&mut self, phase: Phase, resource: T) {
        self.by_phase.insert(phase, Box::new(resource));
    }

    pub fn get<T: Any>(&self, phase: Phase) -> Option<&T> {
        self.by_phase.get(&phase)?.downcast_ref::<T>()
    }

    /// Remove a resource, e.g. to hand the finished pipeline to the server.
    pub fn take<T: Any>(&mut self, phase: Phase) -> Option<T> {
        let boxed = self.by_phase.remove(&phase)?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.by_phase.insert(phase, other);
                None
            }
        }
    }
}

impl PhaseHost for PhaseResources {
    fn resource(&mut self, phase: Phase) -> Option<&mut dyn Any> {
        self.by_phase.get_mut(&phase).map(|r| r.as_mut())
    }
}

impl fmt::Debug for PhaseResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseResources")
            .field("phases", &self.by_phase.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Context passed to a module callback (and to phase requests) for one phase.
pub struct PhaseContext<'a> {
    module: ModuleId,
    phase: Phase,
    host: &'a mut dyn PhaseHost,
    options: &'a OptionSet,
}

impl<'a> PhaseContext<'a> {
    pub(crate) fn new(
        module: ModuleId,
        phase: Phase,
        host: &'a mut dyn PhaseHost,
        options: &'a OptionSet,
    ) -> Self {
        Self {
            module,
            phase,
            host,
            options,
        }
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The host resource for the current phase, downcast to `T`.
    pub fn resource<T: Any>(&mut self) -> anyhow::Result<&mut T> {
        let phase = self.phase;
        self.host
            .resource(phase)
            .and_then(|r| r.downcast_mut::<T>())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "phase {phase} provides no resource of type `{}`",
                    type_name::<T>()
                )
            })
    }

    /// Frozen options of type `T` materialized for this module.
    pub fn options<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.options.get::<T>()
    }
}
