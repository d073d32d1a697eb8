//! Read-only runtime view of a built registry.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::contracts::ModuleId;
use crate::descriptor::DisableReason;
use crate::graph::{DependencyGraph, DependencyInfo};
use crate::profiler::BuildProfile;

struct StatusInner {
    disabled: DashMap<ModuleId, DisableReason>,
    graph: ArcSwap<DependencyGraph>,
    profile: RwLock<BuildProfile>,
}

/// Cheap, cloneable handle answering "is module X disabled" and dependency
/// questions from any thread.
///
/// Only the registry writes through it, and only while building.
#[derive(Clone)]
pub struct ModuleStatus {
    inner: Arc<StatusInner>,
}

impl Default for ModuleStatus {
    fn default() -> Self {
        Self {
            inner: Arc::new(StatusInner {
                disabled: DashMap::new(),
                graph: ArcSwap::from_pointee(DependencyGraph::default()),
                profile: RwLock::new(BuildProfile::default()),
            }),
        }
    }
}

impl ModuleStatus {
    pub fn is_disabled(&self, id: ModuleId) -> bool {
        self.inner.disabled.contains_key(&id)
    }

    pub fn disable_reason(&self, id: ModuleId) -> Option<DisableReason> {
        self.inner.disabled.get(&id).map(|r| *r.value())
    }

    /// Disabled modules, sorted by id.
    pub fn disabled_modules(&self) -> Vec<ModuleId> {
        let mut ids: Vec<ModuleId> = self.inner.disabled.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// The dependency graph as frozen after the claim step.
    pub fn graph(&self) -> Arc<DependencyGraph> {
        self.inner.graph.load_full()
    }

    pub fn dependency_info(&self, id: ModuleId) -> DependencyInfo {
        self.inner.graph.load().dependency_info(id)
    }

    pub fn profile(&self) -> BuildProfile {
        self.inner.profile.read().clone()
    }

    pub(crate) fn mark_disabled(&self, id: ModuleId, reason: DisableReason) {
        self.inner.disabled.entry(id).or_insert(reason);
    }

    pub(crate) fn publish_graph(&self, graph: DependencyGraph) {
        self.inner.graph.store(Arc::new(graph));
    }

    pub(crate) fn set_profile(&self, profile: BuildProfile) {
        *self.inner.profile.write() = profile;
    }
}

impl std::fmt::Debug for ModuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleStatus")
            .field("disabled", &self.disabled_modules())
            .field("modules", &self.inner.graph.load().nodes().len())
            .finish()
    }
}
