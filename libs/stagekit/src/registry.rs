use std::any::Any;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::context::{ConfigProvider, ModuleSettings};
use crate::contracts::{dispatch_phase, Module, ModuleId};
use crate::descriptor::{DisableReason, ModuleDescriptor, ModuleRegistration, ModuleTable};
use crate::graph::{join, DependencyGraph, DependencyInfo};
use crate::guide::{DependencyClaims, ModuleGuide};
use crate::ledger::{AggregateError, ErrorLedger, ErrorRecord};
use crate::phase::{ModuleState, Phase, PhaseContext, PhaseHost};
use crate::profiler::{fmt_duration, BuildProfile, Profiler};
use crate::queue::{order, ActionOrigin, Priority};
use crate::status::ModuleStatus;

/// Dedupe key of the action binding a module's config section onto its options.
pub const CONFIG_OPTIONS_KEY: &str = "config.options";

/// Submitted via `inventory::submit!` by crates that contribute modules.
pub struct Registrator(pub fn(&mut Registry) -> Result<(), RegistryError>);

inventory::collect!(Registrator);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry is frozen; modules cannot be registered or configured after build")]
    Frozen,
    #[error("module '{0}' is already registered")]
    DuplicateModule(ModuleId),
    #[error("registry was already built")]
    AlreadyBuilt,
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// Outcome of a build that did not end in an aggregate failure.
#[derive(Debug, Clone)]
pub struct BuildReport {
    /// Modules that completed every phase, in build order.
    pub built: Vec<ModuleId>,
    pub disabled: Vec<(ModuleId, DisableReason)>,
    /// Errors absorbed by disabling their module.
    pub mitigated: Vec<ErrorRecord>,
    pub profile: BuildProfile,
}

/// Owns every module descriptor and drives the build.
///
/// Lifecycle: register modules and configuration, call [`build`](Self::build)
/// once, then query. After `build` the registry is frozen; the runtime view
/// is available through [`status`](Self::status).
#[derive(Default)]
pub struct Registry {
    table: ModuleTable,
    graph: DependencyGraph,
    ledger: ErrorLedger,
    status: ModuleStatus,
    config: Option<Arc<dyn ConfigProvider>>,
    pending_disable: Vec<ModuleId>,
    schedule: Vec<ModuleId>,
    built: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// New registry filled by every inventory-submitted [`Registrator`].
    pub fn discover() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for r in ::inventory::iter::<Registrator> {
            r.0(&mut registry)?;
        }
        Ok(registry)
    }

    pub fn with_config(mut self, config: Arc<dyn ConfigProvider>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn set_config(&mut self, config: Arc<dyn ConfigProvider>) {
        self.config = Some(config);
    }

    pub fn register(&mut self, registration: ModuleRegistration) -> Result<(), RegistryError> {
        if self.built {
            return Err(RegistryError::Frozen);
        }
        let id = registration.id();
        if !self.table.register(registration) {
            return Err(RegistryError::DuplicateModule(id));
        }
        tracing::debug!(module = %id, "Module registered");
        Ok(())
    }

    /// Guide for host-supplied configuration of `target`.
    ///
    /// Host actions win ties against actions cascaded from other modules.
    pub fn guide(&mut self, target: ModuleId) -> Result<ModuleGuide<'_>, RegistryError> {
        if self.built {
            return Err(RegistryError::Frozen);
        }
        Ok(ModuleGuide::new(
            &mut self.table,
            target,
            ActionOrigin::User,
            None,
        ))
    }

    pub fn configure_option<O, F>(
        &mut self,
        target: ModuleId,
        order: i32,
        key: impl Into<String>,
        action: F,
    ) -> Result<(), RegistryError>
    where
        O: Default + Send + Sync + 'static,
        F: FnOnce(&mut O) + Send + 'static,
    {
        self.guide(target)?.configure_option(order, key, action);
        Ok(())
    }

    /// Take `id` (and, once the graph is known, everything depending on it)
    /// out of the build.
    pub fn disable(&mut self, id: ModuleId) -> Result<(), RegistryError> {
        if self.built {
            return Err(RegistryError::Frozen);
        }
        if !self.pending_disable.contains(&id) {
            self.pending_disable.push(id);
        }
        Ok(())
    }

    /// Claim dependencies, resolve the order and run all five phases.
    ///
    /// Failures do not stop the walk. At the end every error of a module that
    /// is still enabled is returned in one [`RegistryError::Aggregate`]; the
    /// registry stays queryable either way.
    pub fn build(&mut self, host: &mut dyn PhaseHost) -> Result<BuildReport, RegistryError> {
        if self.built {
            return Err(RegistryError::AlreadyBuilt);
        }
        self.built = true;

        let mut profiler = Profiler::start();
        tracing::info!(modules = self.table.registered_count(), "Building modules");

        self.apply_settings();
        self.claim_dependencies();
        self.check_unregistered();
        self.status.publish_graph(self.graph.clone());

        for id in std::mem::take(&mut self.pending_disable) {
            if self.table.is_registered(id) {
                self.disable_with_cascade(id, DisableReason::Configuration);
            } else {
                tracing::warn!(module = %id, "Cannot disable unknown module");
            }
        }

        let cyclic = self.check_cycles();
        let table = &self.table;
        self.schedule = self.graph.schedule_by(&cyclic, |id| {
            let desc = table.get(id);
            (
                desc.map_or(0, ModuleDescriptor::order),
                desc.and_then(ModuleDescriptor::registration_index)
                    .unwrap_or(usize::MAX),
            )
        });
        tracing::debug!(order = %join(&self.schedule, ", "), "Build order resolved");

        for phase in Phase::LIFECYCLE {
            profiler.begin_phase(phase);
            tracing::info!(phase = %phase, "Entering phase");
            for id in self.schedule.clone() {
                self.run_phase(id, phase, &mut *host, &mut profiler);
            }
        }

        let mut built = Vec::new();
        for &id in &self.schedule {
            if let Some(desc) = self.table.get_mut(id) {
                if !desc.is_disabled() && !desc.is_failed() {
                    desc.set_state(ModuleState::Built);
                    built.push(id);
                }
            }
        }

        let profile = profiler.finish();
        self.status.set_profile(profile.clone());

        let status = self.status.clone();
        let mitigated = match self.ledger.finalize(|id| status.is_disabled(id)) {
            Ok(mitigated) => mitigated,
            Err(err) => {
                tracing::error!(
                    errors = err.records().len(),
                    modules = err.modules().len(),
                    "Module build failed"
                );
                return Err(err.into());
            }
        };

        let disabled: Vec<(ModuleId, DisableReason)> = status
            .disabled_modules()
            .into_iter()
            .filter_map(|id| status.disable_reason(id).map(|r| (id, r)))
            .collect();

        tracing::info!(
            built = built.len(),
            disabled = disabled.len(),
            elapsed_ms = profile.total.as_millis() as u64,
            "Module build finished"
        );

        Ok(BuildReport {
            built,
            disabled,
            mitigated,
            profile,
        })
    }

    fn apply_settings(&mut self) {
        let Some(config) = self.config.clone() else {
            return;
        };

        for id in self.table.registered_ids() {
            let Some(section) = config.get_module_config(id.name()) else {
                continue;
            };
            let settings = match ModuleSettings::from_value(section) {
                Ok(settings) => settings,
                Err(e) => {
                    self.record_failure(ErrorRecord::configuration(
                        id,
                        None,
                        format!("Invalid module settings: {e:#}"),
                    ));
                    continue;
                }
            };

            let desc = self.table.entry(id);
            if let Some(module_order) = settings.order {
                desc.set_order(module_order);
            }
            if let Some(flag) = settings.disable_on_exception {
                desc.set_disable_on_exception(flag);
            }
            let binder = desc.binder();

            if settings.disabled && !self.pending_disable.contains(&id) {
                self.pending_disable.push(id);
            }

            if let Some(value) = settings.options {
                match binder {
                    Some(binder) => {
                        let option_type = (binder.register)(self.table.factories_mut());
                        self.table.entry(id).enqueue_action(
                            option_type,
                            Priority::user(order::PRE_CONFIG),
                            CONFIG_OPTIONS_KEY.to_owned(),
                            None,
                            (binder.action)(value),
                        );
                    }
                    None => tracing::warn!(
                        module = %id,
                        "Config section has options but the module does not bind them"
                    ),
                }
            }
        }
    }

    fn claim_dependencies(&mut self) {
        let ids = self.table.registered_ids();
        for &id in &ids {
            self.graph.add_node(id);
        }

        for id in ids {
            let Some(hook) = self
                .table
                .get_mut(id)
                .and_then(ModuleDescriptor::take_claim_hook)
            else {
                continue;
            };

            let mut claims = DependencyClaims::new(id, &mut self.table);
            let result = guarded(|| hook(&mut claims));
            let claimed = claims.into_claimed();

            for dep in &claimed {
                if self.table.is_registered(*dep) {
                    self.graph.add_edge(id, *dep);
                } else {
                    tracing::error!(module = %id, dependency = %dep, "Unknown dependency");
                    self.record_failure(ErrorRecord::unknown_dependency(id, *dep));
                }
            }

            match result {
                Ok(()) => tracing::debug!(
                    module = %id,
                    dependencies = %join(&claimed, ", "),
                    "Dependencies claimed"
                ),
                Err(err) => {
                    tracing::error!(module = %id, error = %err, "Claiming dependencies failed");
                    self.record_failure(ErrorRecord::phase_exception(
                        id,
                        Phase::ClaimDependencies,
                        &err,
                    ));
                }
            }
        }
    }

    /// Guides may name modules that never register; report each once.
    fn check_unregistered(&mut self) {
        let orphans: Vec<(ModuleId, Option<ModuleId>)> = self
            .table
            .iter()
            .filter(|d| !d.is_registered())
            .map(|d| (d.id(), d.first_source()))
            .collect();

        for (id, source) in orphans {
            tracing::error!(module = %id, "Configuration targets a module that was never registered");
            self.ledger.record(ErrorRecord::configuration(
                id,
                source,
                "Module received configuration but was never registered",
            ));
        }
    }

    fn check_cycles(&mut self) -> HashSet<ModuleId> {
        for cycle in self.graph.cycles() {
            tracing::error!(path = %join(&cycle, " -> "), "Circular dependency detected");
        }

        let cyclic = self.graph.cyclic_nodes();
        for id in self.table.registered_ids() {
            if cyclic.contains(&id) {
                let path = self.graph.find_cycle_through(id).unwrap_or_default();
                self.record_failure(ErrorRecord::circular(id, path));
            }
        }
        cyclic
    }

    fn run_phase(
        &mut self,
        id: ModuleId,
        phase: Phase,
        host: &mut dyn PhaseHost,
        profiler: &mut Profiler,
    ) {
        let Some(desc) = self.table.get(id) else {
            return;
        };
        if desc.is_disabled() || desc.is_failed() {
            tracing::trace!(module = %id, phase = %phase, "Skipping module");
            return;
        }

        let started = Instant::now();
        if phase == Phase::ConfigureBuilder {
            if let Err(record) = self.prepare(id) {
                profiler.record(id, phase, started.elapsed());
                self.fail_module(record);
                return;
            }
        }

        let Some(desc) = self.table.get_mut(id) else {
            return;
        };
        desc.set_state(ModuleState::Running(phase));
        let requests = desc.take_phase_requests(phase);
        let desc = &*desc;

        let mut failed_request: Option<Option<ModuleId>> = None;
        let result = guarded(|| {
            let instance = desc
                .instance()
                .ok_or_else(|| anyhow::anyhow!("module '{id}' was not constructed"))?;
            let mut ctx = PhaseContext::new(id, phase, host, desc.options());
            dispatch_phase(instance, phase, &mut ctx)?;

            for entry in requests {
                let key = entry.key;
                failed_request = Some(entry.from);
                (entry.payload)(&mut ctx)
                    .map_err(|e| e.context(format!("phase request '{key}' failed")))?;
                failed_request = None;
            }
            Ok(())
        });
        profiler.record(id, phase, started.elapsed());

        match result {
            Ok(()) => tracing::debug!(module = %id, phase = %phase, "Phase completed"),
            Err(err) => {
                let source = failed_request.flatten();
                self.fail_module(ErrorRecord::phase_exception(id, phase, &err).with_source(source));
            }
        }
    }

    /// Materialize options, check required keys and construct the module.
    fn prepare(&mut self, id: ModuleId) -> Result<(), ErrorRecord> {
        let Some((desc, factories)) = self.table.descriptor_and_factories(id) else {
            return Ok(());
        };

        match catch_panic(|| desc.materialize(factories)) {
            Ok(Ok(())) => {}
            Ok(Err(failure)) => {
                return Err(ErrorRecord::configuration(
                    id,
                    failure.from,
                    format!(
                        "Configuration action '{}' on {} failed: {:#}",
                        failure.key, failure.option_type, failure.error
                    ),
                ));
            }
            Err(panic) => {
                return Err(ErrorRecord::configuration(
                    id,
                    None,
                    format!("Configuration action {panic}"),
                ));
            }
        }

        let missing = desc.missing_required_keys();
        if !missing.is_empty() {
            return Err(ErrorRecord::missing_config(id, missing));
        }

        guarded(|| desc.construct()).map_err(|e| ErrorRecord::construction(id, &e))?;
        tracing::debug!(module = %id, options = desc.options().len(), "Module constructed");
        Ok(())
    }

    fn record_failure(&mut self, record: ErrorRecord) {
        if let Some(desc) = self.table.get_mut(record.module) {
            desc.mark_failed();
        }
        self.ledger.record(record);
    }

    /// Record a failure; absorb it by disabling the module if it asked for that.
    fn fail_module(&mut self, record: ErrorRecord) {
        let module = record.module;
        let phase = record.phase;
        let mitigate = record.is_mitigable()
            && self
                .table
                .get(module)
                .is_some_and(ModuleDescriptor::disables_on_exception);

        if mitigate {
            tracing::warn!(module = %module, kind = %record.kind, message = %record.message, "Module failed");
        } else {
            tracing::error!(module = %module, kind = %record.kind, message = %record.message, "Module failed");
        }
        self.record_failure(record);

        if mitigate {
            self.disable_with_cascade(module, DisableReason::Exception { phase });
        }
    }

    /// Disable `root` and every module that transitively depends on it.
    ///
    /// Dependents are collateral: whatever they recorded so far is dropped.
    fn disable_with_cascade(&mut self, root: ModuleId, reason: DisableReason) {
        let Some(desc) = self.table.get_mut(root) else {
            return;
        };
        if !desc.mark_disabled(reason) {
            return;
        }
        self.status.mark_disabled(root, reason);
        tracing::warn!(module = %root, reason = %reason, "Module disabled");

        let cascade = DisableReason::Cascade { cause: root };
        for dependent in self.graph.transitive_dependents(root) {
            let Some(desc) = self.table.get_mut(dependent) else {
                continue;
            };
            if !desc.mark_disabled(cascade) {
                continue;
            }
            self.status.mark_disabled(dependent, cascade);
            let discarded = self.ledger.discard_module(dependent);
            tracing::warn!(
                module = %dependent,
                cause = %root,
                discarded_errors = discarded,
                "Module disabled because a dependency was disabled"
            );
        }
    }

    /// Runtime view; safe to clone into request handlers.
    pub fn status(&self) -> ModuleStatus {
        self.status.clone()
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn is_disabled(&self, id: ModuleId) -> bool {
        self.status.is_disabled(id)
    }

    pub fn disabled_modules(&self) -> Vec<ModuleId> {
        self.status.disabled_modules()
    }

    pub fn dependency_info(&self, id: ModuleId) -> DependencyInfo {
        self.graph.dependency_info(id)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn descriptor(&self, id: ModuleId) -> Option<&ModuleDescriptor> {
        self.table.get(id)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.table.iter()
    }

    /// Resolved order of the last build; empty before `build`.
    pub fn build_order(&self) -> &[ModuleId] {
        &self.schedule
    }

    /// Every error recorded so far, mitigated ones included.
    pub fn errors(&self) -> &[ErrorRecord] {
        self.ledger.records()
    }

    /// The constructed instance of `id`, if it is an `M`.
    pub fn module<M: Module>(&self, id: ModuleId) -> Option<&M> {
        self.table.get(id)?.instance()?.as_any().downcast_ref::<M>()
    }

    /// Human-readable report of the last build.
    pub fn summary(&self) -> String {
        let profile = self.status.profile();
        let enabled: Vec<&ModuleDescriptor> = self
            .schedule
            .iter()
            .filter_map(|&id| self.table.get(id))
            .filter(|d| !d.is_disabled())
            .collect();
        let disabled = self.status.disabled_modules();

        let mut s = String::new();
        let _ = writeln!(s, "Module registration summary:");
        let _ = writeln!(s, "Enabled modules ({}):", enabled.len());
        for desc in &enabled {
            let id = desc.id();
            let state = match desc.state() {
                ModuleState::Built => "built".to_owned(),
                ModuleState::Running(phase) => format!("failed in {phase}"),
                ModuleState::Declared if desc.is_failed() => "failed before start".to_owned(),
                ModuleState::Declared => "not started".to_owned(),
            };
            let deps = self.graph.dependencies_of(id);
            let deps = if deps.is_empty() {
                "-".to_owned()
            } else {
                join(deps, ", ")
            };
            let _ = writeln!(
                s,
                "  - {id} [order {}] {state}; depends on: {deps} ({})",
                desc.order(),
                fmt_duration(profile.module_time(id))
            );
        }

        if !disabled.is_empty() {
            let _ = writeln!(s, "Disabled modules ({}):", disabled.len());
            for id in &disabled {
                if let Some(reason) = self.status.disable_reason(*id) {
                    let _ = writeln!(s, "  - {id}: {reason}");
                }
            }
        }

        let failed = self
            .table
            .iter()
            .filter(|d| d.is_failed() && !d.is_disabled())
            .count();
        let _ = writeln!(
            s,
            "Statistics: registered={}, enabled={}, disabled={}, failed={}, errors={}, total time {}",
            self.table.registered_count(),
            enabled.len(),
            disabled.len(),
            failed,
            self.ledger.len(),
            fmt_duration(profile.total)
        );
        s
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("modules", &self.table.registered_ids())
            .field("built", &self.built)
            .field("build_order", &self.schedule)
            .field("errors", &self.ledger.len())
            .finish()
    }
}

/// Run `f`, turning a panic into an error.
fn catch_panic<T>(f: impl FnOnce() -> T) -> anyhow::Result<T> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| anyhow::anyhow!("panicked: {}", panic_message(&*payload)))
}

fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    catch_panic(f).and_then(|result| result)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Empty;

    struct Noop;

    impl Module for Noop {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn noop(id: ModuleId) -> ModuleRegistration {
        ModuleRegistration::new(id, |_: Arc<Empty>| Ok(Noop))
    }

    const A: ModuleId = ModuleId::new("a");

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = Registry::new();
        registry.register(noop(A)).unwrap();
        match registry.register(noop(A)) {
            Err(RegistryError::DuplicateModule(id)) => assert_eq!(id, A),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn registry_freezes_after_build() {
        let mut registry = Registry::new();
        registry.register(noop(A)).unwrap();
        let report = registry.build(&mut ()).unwrap();
        assert_eq!(report.built, vec![A]);
        assert_eq!(registry.descriptor(A).unwrap().state(), ModuleState::Built);

        assert!(matches!(registry.register(noop(ModuleId::new("b"))), Err(RegistryError::Frozen)));
        assert!(matches!(registry.disable(A), Err(RegistryError::Frozen)));
        assert!(matches!(registry.guide(A), Err(RegistryError::Frozen)));
        assert!(matches!(registry.build(&mut ()), Err(RegistryError::AlreadyBuilt)));
    }

    #[test]
    fn panic_payloads_become_messages() {
        let err = guarded::<()>(|| panic!("kaboom {}", 7)).unwrap_err();
        assert_eq!(err.to_string(), "panicked: kaboom 7");
        let err = guarded::<()>(|| std::panic::panic_any(3_u8)).unwrap_err();
        assert!(err.to_string().contains("unknown panic payload"));
    }
}
