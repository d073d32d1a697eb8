//! Build timing.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::contracts::ModuleId;
use crate::phase::Phase;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleTiming {
    pub module: ModuleId,
    pub total: Duration,
    pub phases: Vec<(Phase, Duration)>,
}

/// Wall-clock durations of one build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildProfile {
    pub total: Duration,
    /// Phase durations in execution order.
    pub phases: Vec<(Phase, Duration)>,
    /// Modules in the order they first ran.
    pub modules: Vec<ModuleTiming>,
}

impl BuildProfile {
    pub fn module(&self, id: ModuleId) -> Option<&ModuleTiming> {
        self.modules.iter().find(|m| m.module == id)
    }

    pub fn module_time(&self, id: ModuleId) -> Duration {
        self.module(id).map(|m| m.total).unwrap_or_default()
    }

    /// Up to `n` modules, slowest first.
    pub fn slowest(&self, n: usize) -> Vec<&ModuleTiming> {
        let mut by_time: Vec<&ModuleTiming> = self.modules.iter().collect();
        by_time.sort_by(|a, b| b.total.cmp(&a.total));
        by_time.truncate(n);
        by_time
    }

    pub fn summary(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "Module build performance (total {}):", fmt_duration(self.total));
        for (phase, elapsed) in &self.phases {
            let _ = writeln!(s, "  {phase}: {}", fmt_duration(*elapsed));
        }
        let slowest = self.slowest(5);
        if !slowest.is_empty() {
            let _ = writeln!(s, "Slowest modules:");
            for m in slowest {
                let _ = writeln!(s, "  {}: {}", m.module, fmt_duration(m.total));
            }
        }
        s
    }
}

pub(crate) fn fmt_duration(d: Duration) -> String {
    format!("{:.2}ms", d.as_secs_f64() * 1000.0)
}

pub(crate) struct Profiler {
    started: Instant,
    phase: Option<(Phase, Instant)>,
    index: HashMap<ModuleId, usize>,
    profile: BuildProfile,
}

impl Profiler {
    pub(crate) fn start() -> Self {
        Self {
            started: Instant::now(),
            phase: None,
            index: HashMap::new(),
            profile: BuildProfile::default(),
        }
    }

    pub(crate) fn begin_phase(&mut self, phase: Phase) {
        self.end_phase();
        self.phase = Some((phase, Instant::now()));
    }

    pub(crate) fn end_phase(&mut self) {
        if let Some((phase, started)) = self.phase.take() {
            let elapsed = started.elapsed();
            tracing::debug!(phase = %phase, elapsed_ms = elapsed.as_millis() as u64, "Phase finished");
            self.profile.phases.push((phase, elapsed));
        }
    }

    pub(crate) fn record(&mut self, module: ModuleId, phase: Phase, elapsed: Duration) {
        let modules = &mut self.profile.modules;
        let idx = *self.index.entry(module).or_insert_with(|| {
            modules.push(ModuleTiming {
                module,
                total: Duration::ZERO,
                phases: Vec::new(),
            });
            modules.len() - 1
        });
        let timing = &mut modules[idx];
        timing.total += elapsed;
        timing.phases.push((phase, elapsed));
    }

    pub(crate) fn finish(mut self) -> BuildProfile {
        self.end_phase();
        self.profile.total = self.started.elapsed();
        self.profile
    }
}
