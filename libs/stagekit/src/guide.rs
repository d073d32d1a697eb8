//! Guides: the handles through which configuration reaches a module.

use crate::contracts::ModuleId;
use crate::descriptor::ModuleTable;
use crate::options::typed_action;
use crate::phase::{Phase, PhaseContext};
use crate::queue::{ActionOrigin, Enqueued, Priority};

/// Enqueues configuration for one target module.
///
/// Obtained from [`Registry::guide`](crate::Registry::guide) by host code, or
/// from [`DependencyClaims::depends_on`] by a module configuring one of its
/// dependencies. The target does not have to be registered yet.
pub struct ModuleGuide<'r> {
    table: &'r mut ModuleTable,
    target: ModuleId,
    origin: ActionOrigin,
    from: Option<ModuleId>,
}

impl<'r> ModuleGuide<'r> {
    pub(crate) fn new(
        table: &'r mut ModuleTable,
        target: ModuleId,
        origin: ActionOrigin,
        from: Option<ModuleId>,
    ) -> Self {
        Self {
            table,
            target,
            origin,
            from,
        }
    }

    pub fn target(&self) -> ModuleId {
        self.target
    }

    pub fn origin(&self) -> ActionOrigin {
        self.origin
    }

    fn priority(&self, order: i32) -> Priority {
        Priority {
            order,
            origin: self.origin,
        }
    }

    /// Mutate the target's `O` options. Re-using `key` replaces the earlier
    /// action but keeps its position.
    pub fn configure_option<O, F>(&mut self, order: i32, key: impl Into<String>, action: F) -> &mut Self
    where
        O: Default + Send + Sync + 'static,
        F: FnOnce(&mut O) + Send + 'static,
    {
        self.try_configure_option(order, key, move |options: &mut O| {
            action(options);
            Ok(())
        })
    }

    /// Like [`configure_option`](Self::configure_option) for actions that can fail.
    pub fn try_configure_option<O, F>(&mut self, order: i32, key: impl Into<String>, action: F) -> &mut Self
    where
        O: Default + Send + Sync + 'static,
        F: FnOnce(&mut O) -> anyhow::Result<()> + Send + 'static,
    {
        let key = key.into();
        let priority = self.priority(order);
        let option_type = self.table.factories_mut().register::<O>();
        let outcome = self.table.entry(self.target).enqueue_action(
            option_type,
            priority,
            key.clone(),
            self.from,
            typed_action(action),
        );
        trace_enqueue(self.target, self.from, &key, outcome);
        self
    }

    /// Run `callback` in `phase`, right after the target's own callback.
    ///
    /// Requests are ordered and de-duplicated like option actions. Requests
    /// for [`Phase::ClaimDependencies`] are ignored.
    pub fn configure_phase<F>(&mut self, phase: Phase, order: i32, key: impl Into<String>, callback: F) -> &mut Self
    where
        F: FnOnce(&mut PhaseContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        let key = key.into();
        if !phase.is_lifecycle() {
            tracing::warn!(module = %self.target, key = %key, "Ignoring phase request for {phase}");
            return self;
        }
        let priority = self.priority(order);
        let outcome = self.table.entry(self.target).enqueue_phase_request(
            phase,
            priority,
            key.clone(),
            self.from,
            Box::new(callback),
        );
        trace_enqueue(self.target, self.from, &key, outcome);
        self
    }
}

fn trace_enqueue(target: ModuleId, from: Option<ModuleId>, key: &str, outcome: Enqueued) {
    let from = from.map_or("host", |m| m.name());
    match outcome {
        Enqueued::Inserted => tracing::debug!(module = %target, from, key, "Configuration queued"),
        Enqueued::Replaced => {
            tracing::debug!(module = %target, from, key, "Configuration replaced an earlier entry with the same key")
        }
    }
}

/// Passed to a module's claim hook; collects its dependencies.
pub struct DependencyClaims<'r> {
    module: ModuleId,
    table: &'r mut ModuleTable,
    claimed: Vec<ModuleId>,
}

impl<'r> DependencyClaims<'r> {
    pub(crate) fn new(module: ModuleId, table: &'r mut ModuleTable) -> Self {
        Self {
            module,
            table,
            claimed: Vec::new(),
        }
    }

    /// The module whose claims are being collected.
    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// Declare a dependency on `dependency` and get a guide to configure it.
    ///
    /// Actions enqueued through the returned guide are tagged as cascaded, so
    /// host configuration of the same target wins ties.
    pub fn depends_on(&mut self, dependency: ModuleId) -> ModuleGuide<'_> {
        if !self.claimed.contains(&dependency) {
            self.claimed.push(dependency);
        }
        ModuleGuide::new(
            self.table,
            dependency,
            ActionOrigin::Cascade,
            Some(self.module),
        )
    }

    pub fn claimed(&self) -> &[ModuleId] {
        &self.claimed
    }

    pub(crate) fn into_claimed(self) -> Vec<ModuleId> {
        self.claimed
    }
}
