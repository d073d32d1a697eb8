//! End-to-end builds: ordering, de-duplication, cycles, failures and cascades.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use stagekit::{
    order, AggregateError, ConfigProvider, DisableReason, ErrorKind, Module, ModuleId,
    ModuleRegistration, ModuleState, Phase, PhaseContext, PhaseHost, Registry, RegistryError,
};

const CORE: ModuleId = ModuleId::new("core");
const AUTH: ModuleId = ModuleId::new("auth");
const REPO: ModuleId = ModuleId::new("repo");
const A: ModuleId = ModuleId::new("a");
const B: ModuleId = ModuleId::new("b");
const C: ModuleId = ModuleId::new("c");
const D: ModuleId = ModuleId::new("d");
const E: ModuleId = ModuleId::new("e");

/// Host handing the same event log to every phase.
#[derive(Default)]
struct Trace {
    events: Vec<String>,
}

impl Trace {
    fn has(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }

    fn position(&self, event: &str) -> usize {
        self.events
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("missing event {event}: {:?}", self.events))
    }
}

impl PhaseHost for Trace {
    fn resource(&mut self, _phase: Phase) -> Option<&mut dyn Any> {
        Some(&mut self.events)
    }
}

#[derive(Default, Debug)]
struct ProbeOptions {
    applied: Vec<String>,
}

struct Probe {
    id: ModuleId,
    options: Arc<ProbeOptions>,
    fail_in: Option<Phase>,
    panic_in: Option<Phase>,
}

impl Probe {
    fn step(&self, ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        let phase = ctx.phase();
        if self.panic_in == Some(phase) {
            panic!("{} blew up", self.id);
        }
        if self.fail_in == Some(phase) {
            anyhow::bail!("{} refused {phase}", self.id);
        }
        ctx.resource::<Vec<String>>()?
            .push(format!("{}:{phase}", self.id));
        Ok(())
    }
}

impl Module for Probe {
    fn configure_builder(&self, ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        self.step(ctx)
    }
    fn configure_services(&self, ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        self.step(ctx)
    }
    fn post_configure_services(&self, ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        self.step(ctx)
    }
    fn configure_application_builder(&self, ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        self.step(ctx)
    }
    fn configure_endpoints(&self, ctx: &mut PhaseContext<'_>) -> anyhow::Result<()> {
        self.step(ctx)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn probe_with(id: ModuleId, fail_in: Option<Phase>, panic_in: Option<Phase>) -> ModuleRegistration {
    ModuleRegistration::new(id, move |options: Arc<ProbeOptions>| {
        Ok(Probe {
            id,
            options,
            fail_in,
            panic_in,
        })
    })
}

fn probe(id: ModuleId) -> ModuleRegistration {
    probe_with(id, None, None)
}

fn depends_on(reg: ModuleRegistration, deps: &'static [ModuleId]) -> ModuleRegistration {
    reg.claim_dependencies(move |claims| {
        for &dep in deps {
            claims.depends_on(dep);
        }
        Ok(())
    })
}

fn push(value: &'static str) -> impl FnOnce(&mut ProbeOptions) + Send + 'static {
    move |o: &mut ProbeOptions| o.applied.push(value.to_owned())
}

fn applied(registry: &Registry, id: ModuleId) -> Vec<String> {
    registry
        .module::<Probe>(id)
        .unwrap_or_else(|| panic!("module {id} was not constructed"))
        .options
        .applied
        .clone()
}

fn expect_aggregate(result: Result<stagekit::BuildReport, RegistryError>) -> AggregateError {
    match result {
        Err(RegistryError::Aggregate(err)) => err,
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn duplicate_key_keeps_last_registration() {
    let mut registry = Registry::new();
    registry.register(probe(A)).unwrap();
    registry.configure_option(A, order::NORMAL, "Conn", push("first")).unwrap();
    registry.configure_option(A, order::NORMAL, "Other", push("other")).unwrap();
    registry.configure_option(A, order::POST_CONFIG, "Conn", push("second")).unwrap();

    registry.build(&mut Trace::default()).unwrap();
    assert_eq!(applied(&registry, A), vec!["second", "other"]);
}

#[test]
fn actions_apply_by_priority_then_enqueue_order() {
    let mut registry = Registry::new();
    registry.register(probe(A)).unwrap();
    registry.configure_option(A, 10, "k10", push("10")).unwrap();
    registry.configure_option(A, -5, "k-5", push("-5")).unwrap();
    registry.configure_option(A, 3, "k3a", push("3a")).unwrap();
    registry.configure_option(A, 3, "k3b", push("3b")).unwrap();
    registry.configure_option(A, order::PRE_CONFIG, "pre", push("pre")).unwrap();

    registry.build(&mut Trace::default()).unwrap();
    assert_eq!(applied(&registry, A), vec!["pre", "-5", "3a", "3b", "10"]);
}

#[test]
fn host_configuration_wins_ties_against_cascade() {
    let mut registry = Registry::new();
    // host configures `a` before anything declares it
    registry.configure_option(A, order::NORMAL, "Host", push("host")).unwrap();
    registry.register(probe(A)).unwrap();
    registry
        .register(probe(B).claim_dependencies(|claims| {
            claims
                .depends_on(A)
                .configure_option(order::NORMAL, "FromB", push("cascade"));
            Ok(())
        }))
        .unwrap();

    registry.build(&mut Trace::default()).unwrap();
    assert_eq!(applied(&registry, A), vec!["cascade", "host"]);
}

#[test]
fn modules_run_after_dependencies_and_by_order_otherwise() {
    let mut registry = Registry::new();
    registry.register(probe(A).order(10)).unwrap();
    registry.register(probe(B).order(5)).unwrap();
    registry.register(depends_on(probe(C).order(0), &[A])).unwrap();

    let mut trace = Trace::default();
    let report = registry.build(&mut trace).unwrap();
    assert_eq!(registry.build_order(), &[B, A, C]);
    assert_eq!(report.built, vec![B, A, C]);

    // phases are the outer loop
    assert!(trace.position("c:ConfigureBuilder") < trace.position("b:ConfigureServices"));
    for phase in Phase::LIFECYCLE {
        assert!(trace.position(&format!("a:{phase}")) < trace.position(&format!("c:{phase}")));
    }
    assert_eq!(trace.events.len(), 15);
}

#[test]
fn every_cycle_member_is_reported() {
    let mut registry = Registry::new();
    registry.register(depends_on(probe(A), &[B])).unwrap();
    registry.register(depends_on(probe(B), &[C])).unwrap();
    registry.register(depends_on(probe(C), &[A])).unwrap();
    registry.register(depends_on(probe(D), &[A])).unwrap();

    let mut trace = Trace::default();
    let err = expect_aggregate(registry.build(&mut trace));

    let expected: HashSet<(ModuleId, ModuleId)> = [(A, B), (B, C), (C, A)].into_iter().collect();
    for id in [A, B, C] {
        let records: Vec<_> = err.for_module(id).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ErrorKind::CircularDependency);

        let path = &records[0].cycle_path;
        assert_eq!(path.first(), Some(&id));
        assert_eq!(path.last(), Some(&id));
        let edges: HashSet<(ModuleId, ModuleId)> = path.windows(2).map(|w| (w[0], w[1])).collect();
        assert_eq!(edges, expected);

        let info = registry.dependency_info(id);
        assert!(info.is_part_of_cycle);
        assert_eq!(&info.cycle_path, path);
    }

    assert!(!registry.dependency_info(D).is_part_of_cycle);
    assert_eq!(err.for_module(D).count(), 0);
    assert!(!trace.has("a:ConfigureBuilder"));
    assert!(trace.has("d:ConfigureEndpoints"));
    assert!(err.to_string().contains("Dependency path: a -> b -> c -> a"));
}

#[test]
fn disabled_failure_cascades_to_all_dependents() {
    let mut registry = Registry::new();
    registry
        .register(probe_with(D, Some(Phase::ConfigureServices), None).disable_on_exception(true))
        .unwrap();
    // b fails on its own first; the cascade later drops that record
    registry
        .register(depends_on(probe_with(B, Some(Phase::ConfigureBuilder), None), &[D]))
        .unwrap();
    registry.register(depends_on(probe(A), &[B])).unwrap();
    registry.register(probe(E)).unwrap();

    let mut trace = Trace::default();
    let report = registry.build(&mut trace).unwrap();

    assert_eq!(registry.disabled_modules(), vec![A, B, D]);
    assert_eq!(report.built, vec![E]);
    assert_eq!(
        registry.status().disable_reason(D),
        Some(DisableReason::Exception {
            phase: Some(Phase::ConfigureServices)
        })
    );
    assert_eq!(
        registry.status().disable_reason(A),
        Some(DisableReason::Cascade { cause: D })
    );

    assert_eq!(report.mitigated.len(), 1);
    assert_eq!(report.mitigated[0].module, D);
    assert!(registry.errors().iter().all(|r| r.module == D));

    assert!(trace.has("a:ConfigureBuilder"));
    assert!(!trace.has("a:ConfigureServices"));
    assert!(trace.has("e:ConfigureEndpoints"));
}

#[test]
fn failure_without_flag_is_raised_and_dependents_continue() {
    let mut registry = Registry::new();
    registry
        .register(probe_with(D, Some(Phase::ConfigureApplicationBuilder), None))
        .unwrap();
    registry.register(depends_on(probe(A), &[D])).unwrap();

    let mut trace = Trace::default();
    let err = expect_aggregate(registry.build(&mut trace));

    assert_eq!(err.modules(), vec![D]);
    let record = &err.records()[0];
    assert_eq!(record.kind, ErrorKind::PhaseException);
    assert_eq!(record.phase, Some(Phase::ConfigureApplicationBuilder));
    assert!(record.message.contains("d refused ConfigureApplicationBuilder"));

    assert!(!trace.has("d:ConfigureEndpoints"));
    assert!(trace.has("a:ConfigureEndpoints"));
    assert_eq!(
        registry.descriptor(D).unwrap().state(),
        ModuleState::Running(Phase::ConfigureApplicationBuilder)
    );
    assert!(registry.disabled_modules().is_empty());
}

#[test]
fn missing_required_key_fails_only_that_module() {
    let mut registry = Registry::new();
    registry.register(probe(CORE).require_keys(["ConnString"])).unwrap();
    registry.register(depends_on(probe(AUTH), &[CORE])).unwrap();
    registry.register(depends_on(probe(REPO), &[CORE])).unwrap();

    let mut trace = Trace::default();
    let err = expect_aggregate(registry.build(&mut trace));

    assert_eq!(err.records().len(), 1);
    let record = &err.records()[0];
    assert_eq!(record.module, CORE);
    assert_eq!(record.kind, ErrorKind::MissingRequiredConfig);
    assert_eq!(record.missing_keys, vec!["ConnString".to_string()]);
    assert!(err.to_string().contains("    * ConnString"));

    for id in [AUTH, REPO] {
        assert_eq!(registry.descriptor(id).unwrap().state(), ModuleState::Built);
    }
    assert!(!trace.has("core:ConfigureBuilder"));
}

#[test]
fn required_key_is_satisfied_by_a_noop_action() {
    let mut registry = Registry::new();
    registry.register(probe(CORE).require_keys(["ConnString"])).unwrap();
    registry
        .register(probe(AUTH).claim_dependencies(|claims| {
            claims
                .depends_on(CORE)
                .configure_option(order::NORMAL, "ConnString", |_: &mut ProbeOptions| {});
            Ok(())
        }))
        .unwrap();

    let report = registry.build(&mut Trace::default()).unwrap();
    assert_eq!(report.built, vec![CORE, AUTH]);
    assert!(registry.errors().is_empty());
}

#[test]
fn phase_requests_follow_the_module_callback() {
    let mut registry = Registry::new();
    registry.register(probe(A)).unwrap();
    registry
        .register(probe(B).claim_dependencies(|claims| {
            claims.depends_on(A).configure_phase(
                Phase::ConfigureServices,
                order::NORMAL,
                "Cache",
                |ctx| {
                    let module = ctx.module();
                    ctx.resource::<Vec<String>>()?.push(format!("cache-for:{module}"));
                    Ok(())
                },
            );
            Ok(())
        }))
        .unwrap();

    let mut trace = Trace::default();
    registry.build(&mut trace).unwrap();

    let own = trace.position("a:ConfigureServices");
    let request = trace.position("cache-for:a");
    assert_eq!(request, own + 1);
    assert!(request < trace.position("b:ConfigureServices"));
}

#[test]
fn failing_phase_request_names_its_source() {
    let mut registry = Registry::new();
    registry.register(probe(A)).unwrap();
    registry
        .register(probe(B).claim_dependencies(|claims| {
            claims.depends_on(A).configure_phase(
                Phase::ConfigureEndpoints,
                order::NORMAL,
                "Routes",
                |_| anyhow::bail!("route conflict"),
            );
            Ok(())
        }))
        .unwrap();

    let err = expect_aggregate(registry.build(&mut Trace::default()));
    let record = &err.records()[0];
    assert_eq!(record.module, A);
    assert_eq!(record.source, Some(B));
    assert!(record.message.contains("phase request 'Routes' failed"));
    assert!(record.message.contains("route conflict"));
}

#[test]
fn panics_become_phase_exceptions() {
    let mut registry = Registry::new();
    registry
        .register(probe_with(A, None, Some(Phase::PostConfigureServices)))
        .unwrap();
    registry.register(probe(B)).unwrap();

    let mut trace = Trace::default();
    let err = expect_aggregate(registry.build(&mut trace));

    let record = &err.records()[0];
    assert_eq!(record.module, A);
    assert_eq!(record.phase, Some(Phase::PostConfigureServices));
    assert!(record.message.contains("panicked: a blew up"));
    assert!(trace.has("b:ConfigureEndpoints"));
}

#[test]
fn construction_failure_is_mitigable() {
    let mut registry = Registry::new();
    registry
        .register(
            ModuleRegistration::new(D, |_: Arc<ProbeOptions>| -> anyhow::Result<Probe> {
                anyhow::bail!("no connection")
            })
            .disable_on_exception(true),
        )
        .unwrap();
    registry.register(depends_on(probe(A), &[D])).unwrap();

    let report = registry.build(&mut Trace::default()).unwrap();
    assert_eq!(report.disabled.len(), 2);
    assert_eq!(report.mitigated[0].kind, ErrorKind::ConstructionFailed);
    assert!(registry.module::<Probe>(D).is_none());
}

#[test]
fn failing_action_is_a_configuration_error_with_source() {
    let mut registry = Registry::new();
    registry.register(probe(A)).unwrap();
    registry
        .register(probe(B).claim_dependencies(|claims| {
            claims.depends_on(A).try_configure_option(
                order::NORMAL,
                "Tables",
                |_: &mut ProbeOptions| anyhow::bail!("table name is empty"),
            );
            Ok(())
        }))
        .unwrap();

    let err = expect_aggregate(registry.build(&mut Trace::default()));
    let record = &err.records()[0];
    assert_eq!(record.kind, ErrorKind::ConfigurationError);
    assert_eq!(record.source, Some(B));
    assert!(record.message.contains("'Tables'"));
}

#[test]
fn claim_failures_are_never_mitigated() {
    let mut registry = Registry::new();
    registry
        .register(
            probe(A)
                .disable_on_exception(true)
                .claim_dependencies(|_| anyhow::bail!("cannot resolve")),
        )
        .unwrap();

    let err = expect_aggregate(registry.build(&mut Trace::default()));
    assert_eq!(err.records()[0].phase, Some(Phase::ClaimDependencies));
    assert!(!registry.is_disabled(A));
}

#[test]
fn unknown_references_are_reported() {
    const GHOST: ModuleId = ModuleId::new("ghost");

    let mut registry = Registry::new();
    registry
        .register(probe(A).claim_dependencies(|claims| {
            claims
                .depends_on(GHOST)
                .configure_option(order::NORMAL, "Boo", |_: &mut ProbeOptions| {});
            Ok(())
        }))
        .unwrap();
    registry.register(probe(B)).unwrap();

    let err = expect_aggregate(registry.build(&mut Trace::default()));
    assert_eq!(err.modules(), vec![A, GHOST]);
    assert_eq!(err.for_module(A).next().unwrap().kind, ErrorKind::UnknownDependency);
    let ghost = err.for_module(GHOST).next().unwrap();
    assert_eq!(ghost.kind, ErrorKind::ConfigurationError);
    assert_eq!(ghost.source, Some(A));
    assert_eq!(registry.descriptor(B).unwrap().state(), ModuleState::Built);
}

#[test]
fn host_disable_cascades_without_errors() {
    let mut registry = Registry::new();
    registry.register(probe(B)).unwrap();
    registry.register(depends_on(probe(A), &[B])).unwrap();
    registry.register(probe(C)).unwrap();
    registry.disable(B).unwrap();

    let mut trace = Trace::default();
    let report = registry.build(&mut trace).unwrap();
    assert_eq!(report.built, vec![C]);
    assert_eq!(
        report.disabled,
        vec![
            (A, DisableReason::Cascade { cause: B }),
            (B, DisableReason::Configuration)
        ]
    );
    assert!(report.mitigated.is_empty());
    assert!(trace.events.iter().all(|e| e.starts_with("c:")));
}

struct MapConfig(HashMap<String, serde_json::Value>);

impl ConfigProvider for MapConfig {
    fn get_module_config(&self, module_name: &str) -> Option<&serde_json::Value> {
        self.0.get(module_name)
    }
}

#[derive(Default, Debug, Deserialize)]
struct TitleOptions {
    title: String,
    #[serde(default)]
    tags: Vec<String>,
}

struct Titled(Arc<TitleOptions>);

impl Module for Titled {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn config_sections_bind_options_and_settings() {
    let config = MapConfig(HashMap::from([
        (
            "a".to_string(),
            serde_json::json!({ "order": 7, "options": { "title": "Ops", "tags": ["cfg"] } }),
        ),
        ("b".to_string(), serde_json::json!({ "disabled": true })),
    ]));

    let mut registry = Registry::new().with_config(Arc::new(config));
    registry
        .register(ModuleRegistration::new(A, |o: Arc<TitleOptions>| Ok(Titled(o))).bind_config::<TitleOptions>())
        .unwrap();
    registry.register(probe(B)).unwrap();
    registry
        .configure_option(A, order::NORMAL, "Tag", |o: &mut TitleOptions| {
            o.tags.push("code".into());
        })
        .unwrap();

    registry.build(&mut Trace::default()).unwrap();

    let titled = registry.module::<Titled>(A).unwrap();
    assert_eq!(titled.0.title, "Ops");
    assert_eq!(titled.0.tags, vec!["cfg", "code"]);
    assert_eq!(registry.descriptor(A).unwrap().order(), 7);
    assert_eq!(registry.disabled_modules(), vec![B]);
}

#[test]
fn bad_config_options_are_configuration_errors() {
    let config = MapConfig(HashMap::from([(
        "a".to_string(),
        serde_json::json!({ "options": { "title": 42 } }),
    )]));

    let mut registry = Registry::new().with_config(Arc::new(config));
    registry
        .register(ModuleRegistration::new(A, |o: Arc<TitleOptions>| Ok(Titled(o))).bind_config::<TitleOptions>())
        .unwrap();

    let err = expect_aggregate(registry.build(&mut Trace::default()));
    let record = &err.records()[0];
    assert_eq!(record.kind, ErrorKind::ConfigurationError);
    assert!(record.message.contains(stagekit::CONFIG_OPTIONS_KEY));
}

#[test]
fn status_and_summary_after_build() {
    let mut registry = Registry::new();
    registry
        .register(probe_with(D, Some(Phase::ConfigureEndpoints), None).disable_on_exception(true))
        .unwrap();
    registry.register(depends_on(probe(A), &[D])).unwrap();
    registry.register(probe(E)).unwrap();
    registry.build(&mut Trace::default()).unwrap();

    let status = registry.status();
    let seen = std::thread::spawn(move || (status.is_disabled(A), status.disabled_modules()))
        .join()
        .unwrap();
    assert_eq!(seen, (true, vec![A, D]));

    let info = registry.dependency_info(A).to_string();
    assert!(info.contains("Direct dependencies: d"));

    let summary = registry.summary();
    assert!(summary.contains("Enabled modules (1):"));
    assert!(summary.contains("  - e [order 1000] built"));
    assert!(summary.contains("  - d: disabled after failure in ConfigureEndpoints"));
    assert!(summary.contains("  - a: dependency 'd' was disabled"));

    let profile = registry.status().profile();
    assert_eq!(profile.phases.len(), Phase::LIFECYCLE.len());
    assert!(profile.module(E).is_some());
}
