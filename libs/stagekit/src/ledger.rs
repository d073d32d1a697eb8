//! Error accumulation during a build.
//!
//! Failures are never raised where they happen. They are recorded here and
//! rendered once, after the whole walk, as a single [`AggregateError`]
//! grouped by module.

use std::fmt;
use std::fmt::Write as _;

use serde::Serialize;

use crate::contracts::ModuleId;
use crate::graph::join;
use crate::phase::Phase;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    MissingRequiredConfig,
    CircularDependency,
    /// A module callback failed; `ErrorRecord::phase` says which one.
    PhaseException,
    /// A guide-supplied option action failed, or config could not be applied.
    ConfigurationError,
    /// The module constructor rejected its options.
    ConstructionFailed,
    /// A module declared a dependency on a module that was never registered.
    UnknownDependency,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::MissingRequiredConfig => "MissingRequiredConfig",
            ErrorKind::CircularDependency => "CircularDependency",
            ErrorKind::PhaseException => "PhaseException",
            ErrorKind::ConfigurationError => "ConfigurationError",
            ErrorKind::ConstructionFailed => "ConstructionFailed",
            ErrorKind::UnknownDependency => "UnknownDependency",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub module: ModuleId,
    pub kind: ErrorKind,
    pub message: String,
    pub phase: Option<Phase>,
    /// Module whose guide contributed the failing action.
    pub source: Option<ModuleId>,
    pub missing_keys: Vec<String>,
    pub cycle_path: Vec<ModuleId>,
}

impl ErrorRecord {
    fn new(module: ModuleId, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            module,
            kind,
            message: message.into(),
            phase: None,
            source: None,
            missing_keys: Vec::new(),
            cycle_path: Vec::new(),
        }
    }

    pub fn missing_config(module: ModuleId, missing_keys: Vec<String>) -> Self {
        Self {
            missing_keys,
            ..Self::new(
                module,
                ErrorKind::MissingRequiredConfig,
                "Missing required configuration",
            )
        }
    }

    pub fn circular(module: ModuleId, cycle_path: Vec<ModuleId>) -> Self {
        Self {
            cycle_path,
            ..Self::new(
                module,
                ErrorKind::CircularDependency,
                "Module is part of a circular dependency",
            )
        }
    }

    pub fn phase_exception(module: ModuleId, phase: Phase, err: &anyhow::Error) -> Self {
        Self {
            phase: Some(phase),
            ..Self::new(module, ErrorKind::PhaseException, format!("{err:#}"))
        }
    }

    pub fn configuration(module: ModuleId, source: Option<ModuleId>, message: impl Into<String>) -> Self {
        Self {
            source,
            ..Self::new(module, ErrorKind::ConfigurationError, message)
        }
    }

    pub fn construction(module: ModuleId, err: &anyhow::Error) -> Self {
        Self::new(
            module,
            ErrorKind::ConstructionFailed,
            format!("Module instance could not be created: {err:#}"),
        )
    }

    pub fn unknown_dependency(module: ModuleId, dependency: ModuleId) -> Self {
        Self::new(
            module,
            ErrorKind::UnknownDependency,
            format!("Depends on module '{dependency}' which was never registered"),
        )
    }

    pub fn with_source(mut self, source: Option<ModuleId>) -> Self {
        self.source = source;
        self
    }

    /// Whether "disable on exception" may absorb this failure.
    ///
    /// Only failures raised after every module finished claiming its
    /// dependencies qualify; rule violations never do.
    pub fn is_mitigable(&self) -> bool {
        match self.kind {
            ErrorKind::PhaseException => self.phase.is_some_and(Phase::is_lifecycle),
            ErrorKind::ConfigurationError | ErrorKind::ConstructionFailed => true,
            ErrorKind::MissingRequiredConfig
            | ErrorKind::CircularDependency
            | ErrorKind::UnknownDependency => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ErrorLedger {
    records: Vec<ErrorRecord>,
}

impl ErrorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, record: ErrorRecord) {
        tracing::debug!(
            module = %record.module,
            kind = %record.kind,
            message = %record.message,
            "Module error recorded"
        );
        self.records.push(record);
    }

    /// Drop every record of `module`; returns how many were removed.
    pub fn discard_module(&mut self, module: ModuleId) -> usize {
        let before = self.records.len();
        self.records.retain(|r| r.module != module);
        before - self.records.len()
    }

    pub fn records(&self) -> &[ErrorRecord] {
        &self.records
    }

    pub fn for_module(&self, module: ModuleId) -> impl Iterator<Item = &ErrorRecord> {
        self.records.iter().filter(move |r| r.module == module)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Split records into mitigated ones (module disabled) and the rest.
    ///
    /// Mitigated records are logged as warnings and returned; if anything
    /// else is left it is returned as one aggregate failure.
    pub fn finalize<F>(&self, is_disabled: F) -> Result<Vec<ErrorRecord>, AggregateError>
    where
        F: Fn(ModuleId) -> bool,
    {
        let (mitigated, active): (Vec<ErrorRecord>, Vec<ErrorRecord>) =
            self.records.iter().cloned().partition(|r| is_disabled(r.module));

        for r in &mitigated {
            tracing::warn!(
                module = %r.module,
                kind = %r.kind,
                message = %r.message,
                "Module error mitigated: module was disabled"
            );
        }

        if active.is_empty() {
            Ok(mitigated)
        } else {
            Err(AggregateError { records: active })
        }
    }
}

/// The single failure raised at the end of a build.
#[derive(Debug, Clone)]
pub struct AggregateError {
    records: Vec<ErrorRecord>,
}

impl AggregateError {
    pub fn records(&self) -> &[ErrorRecord] {
        &self.records
    }

    pub fn for_module(&self, module: ModuleId) -> impl Iterator<Item = &ErrorRecord> {
        self.records.iter().filter(move |r| r.module == module)
    }

    /// Failing modules, in order of their first record.
    pub fn modules(&self) -> Vec<ModuleId> {
        let mut out: Vec<ModuleId> = Vec::new();
        for r in &self.records {
            if !out.contains(&r.module) {
                out.push(r.module);
            }
        }
        out
    }

    fn render(&self) -> String {
        let modules = self.modules();
        let mut s = String::new();
        let _ = writeln!(
            s,
            "Module registration failed with {} error(s) in {} module(s):",
            self.records.len(),
            modules.len()
        );

        for module in modules {
            let _ = writeln!(s, "Module {module}:");
            for r in self.for_module(module) {
                let _ = writeln!(s, "  - Error [{}]: {}", r.kind, r.message);
                if let Some(phase) = r.phase {
                    let _ = writeln!(s, "  - Phase: {phase}");
                }
                if let Some(source) = r.source {
                    let _ = writeln!(s, "  - Source: {source}");
                }
                if !r.missing_keys.is_empty() {
                    let _ = writeln!(s, "  - Missing configuration methods:");
                    for key in &r.missing_keys {
                        let _ = writeln!(s, "    * {key}");
                    }
                }
                if !r.cycle_path.is_empty() {
                    let _ = writeln!(s, "  - Dependency path: {}", join(&r.cycle_path, " -> "));
                }
            }
        }
        s
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.render().trim_end())
    }
}

impl std::error::Error for AggregateError {}
