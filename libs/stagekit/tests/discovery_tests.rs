//! Modules contributed through `inventory` are picked up by `Registry::discover`.

use std::any::Any;
use std::sync::Arc;

use stagekit::{order, Module, ModuleId, ModuleRegistration, Registrator, Registry, RegistryError};

const GREETER: ModuleId = ModuleId::new("greeter");
const AUDIT: ModuleId = ModuleId::new("audit");

#[derive(Default)]
struct GreeterOptions {
    greeting: String,
}

struct Greeter(Arc<GreeterOptions>);

impl Module for Greeter {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Audit;

impl Module for Audit {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn register_greeter(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register(
        ModuleRegistration::new(GREETER, |o: Arc<GreeterOptions>| Ok(Greeter(o)))
            .require_keys(["Greeting"]),
    )
}

fn register_audit(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register(
        ModuleRegistration::new(AUDIT, |_: Arc<()>| Ok(Audit)).claim_dependencies(|claims| {
            claims
                .depends_on(GREETER)
                .configure_option(order::NORMAL, "Greeting", |o: &mut GreeterOptions| {
                    o.greeting = "hello".into();
                });
            Ok(())
        }),
    )
}

inventory::submit! { Registrator(register_greeter) }
inventory::submit! { Registrator(register_audit) }

#[test]
fn discovered_modules_build_together() {
    let mut registry = Registry::discover().unwrap();
    let report = registry.build(&mut ()).unwrap();

    assert_eq!(report.built.len(), 2);
    assert_eq!(registry.build_order().last(), Some(&AUDIT));
    assert_eq!(registry.module::<Greeter>(GREETER).unwrap().0.greeting, "hello");
    assert!(registry.module::<Audit>(AUDIT).is_some());
}
