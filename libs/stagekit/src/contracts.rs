use std::any::Any;
use std::fmt;

use serde::{Serialize, Serializer};

use crate::phase::{Phase, PhaseContext};

/// Stable identifier of a module for the lifetime of the process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(&'static str);

impl ModuleId {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Debug for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleId({})", self.0)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl Serialize for ModuleId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0)
    }
}

/// A constructed module: one callback per lifecycle phase.
///
/// Every callback defaults to a no-op so modules only implement the phases
/// they care about. Callbacks run synchronously on the bootstrap thread in
/// dependency order; returning an error abandons the module's remaining
/// phases without stopping unrelated modules.
pub trait Module: Send + Sync + 'static {
    fn configure_builder(&self, _ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn configure_services(&self, _ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_configure_services(&self, _ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn configure_application_builder(&self, _ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn configure_endpoints(&self, _ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Route a lifecycle phase to the matching module callback.
pub(crate) fn dispatch_phase(
    module: &dyn Module,
    phase: Phase,
    ctx: &mut PhaseContext<'_>,
) -> anyhow::Result<()> {
    match phase {
        Phase::ConfigureBuilder => module.configure_builder(ctx),
        Phase::ConfigureServices => module.configure_services(ctx),
        Phase::PostConfigureServices => module.post_configure_services(ctx),
        Phase::ConfigureApplicationBuilder => module.configure_application_builder(ctx),
        Phase::ConfigureEndpoints => module.configure_endpoints(ctx),
        Phase::ClaimDependencies => {
            anyhow::bail!("claim dependencies is not a lifecycle callback")
        }
    }
}
