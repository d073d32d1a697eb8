//! Per-module records and the table that owns them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::contracts::{Module, ModuleId};
use crate::guide::DependencyClaims;
use crate::options::{typed_action, OptionAction, OptionFactories, OptionSet, OptionType};
use crate::phase::{ModuleState, Phase, PhaseContext};
use crate::queue::{Enqueued, OrderedQueue, Priority, QueuedEntry};

/// Order given to modules that do not ask for one.
pub const DEFAULT_MODULE_ORDER: i32 = 1000;

pub(crate) type Constructor = Box<dyn FnOnce(&OptionSet) -> anyhow::Result<Box<dyn Module>> + Send>;
pub(crate) type ClaimHook = Box<dyn FnOnce(&mut DependencyClaims<'_>) -> anyhow::Result<()> + Send>;
pub(crate) type PhaseCallback = Box<dyn FnOnce(&mut PhaseContext<'_>) -> anyhow::Result<()> + Send>;

/// Why a module left the active pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DisableReason {
    /// Turned off by host code or by its config section.
    Configuration,
    /// Failed while flagged "disable on exception".
    Exception { phase: Option<Phase> },
    /// A module it depends on (transitively) was disabled.
    Cascade { cause: ModuleId },
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisableReason::Configuration => f.write_str("disabled by configuration"),
            DisableReason::Exception { phase: Some(phase) } => {
                write!(f, "disabled after failure in {phase}")
            }
            DisableReason::Exception { phase: None } => f.write_str("disabled after failure"),
            DisableReason::Cascade { cause } => write!(f, "dependency '{cause}' was disabled"),
        }
    }
}

/// Binds a module's config section `options` onto an option type.
#[derive(Clone, Copy)]
pub(crate) struct ConfigBinder {
    pub(crate) register: fn(&mut OptionFactories) -> OptionType,
    pub(crate) action: fn(serde_json::Value) -> OptionAction,
}

fn bind_action<T>(value: serde_json::Value) -> OptionAction
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    typed_action(move |options: &mut T| {
        *options = serde_json::from_value(value)?;
        Ok(())
    })
}

/// Everything needed to declare a module to a [`Registry`](crate::Registry).
///
/// ```ignore
/// registry.register(
///     ModuleRegistration::new(AUTH, |opts: Arc<AuthOptions>| Ok(AuthModule::new(opts)))
///         .claim_dependencies(|claims| {
///             claims.depends_on(CORE).configure_option(order::NORMAL, "AuthTables", |o: &mut CoreOptions| {
///                 o.tables.push("users".into());
///             });
///             Ok(())
///         })
///         .require_keys(["Issuer"])
///         .disable_on_exception(true),
/// )?;
/// ```
pub struct ModuleRegistration {
    pub(crate) id: ModuleId,
    pub(crate) register_options: fn(&mut OptionFactories) -> OptionType,
    pub(crate) constructor: Constructor,
    pub(crate) claim: Option<ClaimHook>,
    pub(crate) required_keys: Vec<String>,
    pub(crate) order: i32,
    pub(crate) disable_on_exception: bool,
    pub(crate) binder: Option<ConfigBinder>,
}

impl ModuleRegistration {
    /// `ctor` receives the frozen options of type `O` once they are
    /// materialized, right before the module's first phase.
    pub fn new<O, M, F>(id: ModuleId, ctor: F) -> Self
    where
        O: Default + Send + Sync + 'static,
        M: Module,
        F: FnOnce(Arc<O>) -> anyhow::Result<M> + Send + 'static,
    {
        let constructor: Constructor = Box::new(move |set: &OptionSet| {
            let options = set.get::<O>().ok_or_else(|| {
                anyhow::anyhow!("options `{}` were not materialized", OptionType::of::<O>())
            })?;
            let module = ctor(options)?;
            Ok(Box::new(module) as Box<dyn Module>)
        });

        Self {
            id,
            register_options: OptionFactories::register::<O>,
            constructor,
            claim: None,
            required_keys: Vec::new(),
            order: DEFAULT_MODULE_ORDER,
            disable_on_exception: false,
            binder: None,
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn claim_dependencies<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&mut DependencyClaims<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.claim = Some(Box::new(hook));
        self
    }

    /// Keys some guide must configure before the module may run.
    pub fn require_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for key in keys {
            let key = key.into();
            if !self.required_keys.contains(&key) {
                self.required_keys.push(key);
            }
        }
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn disable_on_exception(mut self, enabled: bool) -> Self {
        self.disable_on_exception = enabled;
        self
    }

    /// Deserialize `options` from the module's config section into `T`
    /// before any code-supplied action runs.
    pub fn bind_config<T>(mut self) -> Self
    where
        T: DeserializeOwned + Default + Send + Sync + 'static,
    {
        self.binder = Some(ConfigBinder {
            register: OptionFactories::register::<T>,
            action: bind_action::<T>,
        });
        self
    }
}

impl fmt::Debug for ModuleRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistration")
            .field("id", &self.id)
            .field("required_keys", &self.required_keys)
            .field("order", &self.order)
            .field("disable_on_exception", &self.disable_on_exception)
            .field("has_claims", &self.claim.is_some())
            .finish()
    }
}

/// A configuration action that failed during materialization.
#[derive(Debug)]
pub(crate) struct ActionFailure {
    pub(crate) option_type: OptionType,
    pub(crate) key: String,
    pub(crate) from: Option<ModuleId>,
    pub(crate) error: anyhow::Error,
}

/// Registry-side record of one module.
///
/// A descriptor exists from the first time anything mentions the module: a
/// guide may configure a module before it registers, in which case the
/// descriptor starts as a placeholder and is filled in by registration.
pub struct ModuleDescriptor {
    id: ModuleId,
    registration: Option<usize>,
    option_type: Option<OptionType>,
    constructor: Option<Constructor>,
    claim: Option<ClaimHook>,
    binder: Option<ConfigBinder>,
    queues: HashMap<OptionType, OrderedQueue<OptionAction>>,
    queue_order: Vec<OptionType>,
    phase_requests: HashMap<Phase, OrderedQueue<PhaseCallback>>,
    required_keys: Vec<String>,
    invoked_keys: HashSet<String>,
    order: i32,
    state: ModuleState,
    disabled: Option<DisableReason>,
    disable_on_exception: bool,
    failed: bool,
    materialized: bool,
    options: OptionSet,
    instance: Option<Box<dyn Module>>,
}

impl ModuleDescriptor {
    fn placeholder(id: ModuleId) -> Self {
        Self {
            id,
            registration: None,
            option_type: None,
            constructor: None,
            claim: None,
            binder: None,
            queues: HashMap::new(),
            queue_order: Vec::new(),
            phase_requests: HashMap::new(),
            required_keys: Vec::new(),
            invoked_keys: HashSet::new(),
            order: DEFAULT_MODULE_ORDER,
            state: ModuleState::Declared,
            disabled: None,
            disable_on_exception: false,
            failed: false,
            materialized: false,
            options: OptionSet::default(),
            instance: None,
        }
    }

    fn attach(&mut self, reg: ModuleRegistration, option_type: OptionType, index: usize) {
        self.registration = Some(index);
        self.option_type = Some(option_type);
        self.constructor = Some(reg.constructor);
        self.claim = reg.claim;
        self.binder = reg.binder;
        self.required_keys = reg.required_keys;
        self.order = reg.order;
        self.disable_on_exception = reg.disable_on_exception;
        if !self.queue_order.contains(&option_type) {
            self.queue_order.insert(0, option_type);
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// Position in registration order; `None` for placeholders.
    pub fn registration_index(&self) -> Option<usize> {
        self.registration
    }

    pub fn option_type(&self) -> Option<OptionType> {
        self.option_type
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.is_some()
    }

    pub fn disable_reason(&self) -> Option<DisableReason> {
        self.disabled
    }

    pub fn disables_on_exception(&self) -> bool {
        self.disable_on_exception
    }

    /// Whether the module recorded an error and stopped running phases.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn required_keys(&self) -> &[String] {
        &self.required_keys
    }

    pub fn invoked_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.invoked_keys.iter().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Required keys nobody configured, in declaration order.
    pub fn missing_required_keys(&self) -> Vec<String> {
        self.required_keys
            .iter()
            .filter(|k| !self.invoked_keys.contains(k.as_str()))
            .cloned()
            .collect()
    }

    /// Option types with pending or frozen values, primary type first.
    pub fn option_types(&self) -> &[OptionType] {
        &self.queue_order
    }

    pub fn pending_actions(&self) -> usize {
        self.queues.values().map(OrderedQueue::len).sum()
    }

    pub fn options(&self) -> &OptionSet {
        &self.options
    }

    pub fn instance(&self) -> Option<&dyn Module> {
        self.instance.as_deref()
    }

    pub(crate) fn set_order(&mut self, order: i32) {
        self.order = order;
    }

    pub(crate) fn set_disable_on_exception(&mut self, enabled: bool) {
        self.disable_on_exception = enabled;
    }

    pub(crate) fn set_state(&mut self, state: ModuleState) {
        self.state = state;
    }

    pub(crate) fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub(crate) fn mark_disabled(&mut self, reason: DisableReason) -> bool {
        if self.disabled.is_some() {
            return false;
        }
        self.disabled = Some(reason);
        true
    }

    pub(crate) fn take_claim_hook(&mut self) -> Option<ClaimHook> {
        self.claim.take()
    }

    pub(crate) fn binder(&self) -> Option<ConfigBinder> {
        self.binder
    }

    pub(crate) fn first_source(&self) -> Option<ModuleId> {
        self.queue_order
            .iter()
            .filter_map(|ty| self.queues.get(ty))
            .flat_map(|q| q.sources())
            .chain(self.phase_requests.values().flat_map(|q| q.sources()))
            .next()
    }

    pub(crate) fn enqueue_action(
        &mut self,
        option_type: OptionType,
        priority: Priority,
        key: String,
        from: Option<ModuleId>,
        action: OptionAction,
    ) -> Enqueued {
        if !self.queue_order.contains(&option_type) {
            self.queue_order.push(option_type);
        }
        self.invoked_keys.insert(key.clone());
        self.queues
            .entry(option_type)
            .or_default()
            .enqueue(priority, key, from, action)
    }

    pub(crate) fn enqueue_phase_request(
        &mut self,
        phase: Phase,
        priority: Priority,
        key: String,
        from: Option<ModuleId>,
        callback: PhaseCallback,
    ) -> Enqueued {
        self.invoked_keys.insert(key.clone());
        self.phase_requests
            .entry(phase)
            .or_default()
            .enqueue(priority, key, from, callback)
    }

    pub(crate) fn take_phase_requests(&mut self, phase: Phase) -> Vec<QueuedEntry<PhaseCallback>> {
        self.phase_requests
            .get_mut(&phase)
            .map(OrderedQueue::drain_ordered)
            .unwrap_or_default()
    }

    /// Build and freeze every option type of this module.
    ///
    /// Each type starts from its default value and receives its queued
    /// actions in `(order, origin, insertion)` order. Runs once; the frozen
    /// set never changes afterwards.
    pub(crate) fn materialize(&mut self, factories: &OptionFactories) -> Result<(), ActionFailure> {
        if self.materialized {
            return Ok(());
        }
        self.materialized = true;

        for ty in self.queue_order.clone() {
            let mut value = factories.create(ty).ok_or_else(|| ActionFailure {
                option_type: ty,
                key: String::new(),
                from: None,
                error: anyhow::anyhow!("no factory registered for options `{ty}`"),
            })?;

            let entries = self
                .queues
                .get_mut(&ty)
                .map(OrderedQueue::drain_ordered)
                .unwrap_or_default();
            for entry in entries {
                tracing::trace!(module = %self.id, options = %ty, key = %entry.key, "Applying option action");
                (entry.payload)(&mut *value).map_err(|error| ActionFailure {
                    option_type: ty,
                    key: entry.key,
                    from: entry.from,
                    error,
                })?;
            }

            self.options.freeze(ty, value);
        }
        Ok(())
    }

    /// Create the module instance from the frozen options.
    pub(crate) fn construct(&mut self) -> anyhow::Result<()> {
        let ctor = self
            .constructor
            .take()
            .ok_or_else(|| anyhow::anyhow!("module '{}' has no constructor", self.id))?;
        self.instance = Some(ctor(&self.options)?);
        Ok(())
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("id", &self.id)
            .field("registered", &self.is_registered())
            .field("option_type", &self.option_type)
            .field("order", &self.order)
            .field("state", &self.state)
            .field("disabled", &self.disabled)
            .field("failed", &self.failed)
            .field("required_keys", &self.required_keys)
            .field("pending_actions", &self.pending_actions())
            .finish()
    }
}

/// All descriptors known to a registry, in first-mention order.
#[derive(Default)]
pub(crate) struct ModuleTable {
    descriptors: Vec<ModuleDescriptor>,
    index: HashMap<ModuleId, usize>,
    factories: OptionFactories,
    registered: usize,
}

impl ModuleTable {
    /// Descriptor for `id`, created as a placeholder if nothing mentioned it yet.
    pub(crate) fn entry(&mut self, id: ModuleId) -> &mut ModuleDescriptor {
        let idx = match self.index.get(&id) {
            Some(&idx) => idx,
            None => {
                let idx = self.descriptors.len();
                self.descriptors.push(ModuleDescriptor::placeholder(id));
                self.index.insert(id, idx);
                idx
            }
        };
        &mut self.descriptors[idx]
    }

    /// Returns `false` if a module with the same id is already registered.
    pub(crate) fn register(&mut self, reg: ModuleRegistration) -> bool {
        if self.get(reg.id).is_some_and(ModuleDescriptor::is_registered) {
            return false;
        }
        let option_type = (reg.register_options)(&mut self.factories);
        if let Some(binder) = reg.binder {
            (binder.register)(&mut self.factories);
        }
        let index = self.registered;
        self.registered += 1;
        self.entry(reg.id).attach(reg, option_type, index);
        true
    }

    pub(crate) fn get(&self, id: ModuleId) -> Option<&ModuleDescriptor> {
        self.index.get(&id).map(|&idx| &self.descriptors[idx])
    }

    pub(crate) fn get_mut(&mut self, id: ModuleId) -> Option<&mut ModuleDescriptor> {
        let idx = *self.index.get(&id)?;
        Some(&mut self.descriptors[idx])
    }

    pub(crate) fn is_registered(&self, id: ModuleId) -> bool {
        self.get(id).is_some_and(ModuleDescriptor::is_registered)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.descriptors.iter()
    }

    /// Registered modules in registration order.
    pub(crate) fn registered_ids(&self) -> Vec<ModuleId> {
        let mut regs: Vec<(usize, ModuleId)> = self
            .descriptors
            .iter()
            .filter_map(|d| d.registration.map(|i| (i, d.id)))
            .collect();
        regs.sort_unstable();
        regs.into_iter().map(|(_, id)| id).collect()
    }

    pub(crate) fn registered_count(&self) -> usize {
        self.registered
    }

    pub(crate) fn factories_mut(&mut self) -> &mut OptionFactories {
        &mut self.factories
    }

    /// Split borrow used while materializing a module.
    pub(crate) fn descriptor_and_factories(
        &mut self,
        id: ModuleId,
    ) -> Option<(&mut ModuleDescriptor, &OptionFactories)> {
        let idx = *self.index.get(&id)?;
        Some((&mut self.descriptors[idx], &self.factories))
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use super::*;
    use crate::queue::order;

    #[derive(Default, Debug)]
    struct CoreOptions {
        conn: String,
        tables: Vec<String>,
    }

    struct Core {
        options: Arc<CoreOptions>,
    }

    impl Module for Core {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    const CORE: ModuleId = ModuleId::new("core");
    const AUTH: ModuleId = ModuleId::new("auth");

    fn core_registration() -> ModuleRegistration {
        ModuleRegistration::new(CORE, |options: Arc<CoreOptions>| Ok(Core { options }))
            .require_keys(["ConnString", "ConnString"])
    }

    fn push_table(name: &'static str) -> OptionAction {
        typed_action(move |o: &mut CoreOptions| {
            o.tables.push(name.into());
            Ok(())
        })
    }

    #[test]
    fn placeholder_is_filled_by_registration() {
        let mut table = ModuleTable::default();
        let ty = table.factories_mut().register::<CoreOptions>();
        table.entry(CORE).enqueue_action(
            ty,
            Priority::cascade(order::NORMAL),
            "AuthTables".into(),
            Some(AUTH),
            push_table("users"),
        );
        assert!(!table.is_registered(CORE));

        assert!(table.register(core_registration()));
        assert!(!table.register(core_registration()));

        let desc = table.get(CORE).unwrap();
        assert_eq!(desc.registration_index(), Some(0));
        assert_eq!(desc.required_keys(), ["ConnString".to_string()]);
        assert_eq!(desc.missing_required_keys(), vec!["ConnString".to_string()]);
        assert_eq!(desc.pending_actions(), 1);
        assert_eq!(desc.first_source(), Some(AUTH));
    }

    #[test]
    fn materialize_applies_in_order_and_freezes_once() {
        let mut table = ModuleTable::default();
        table.register(core_registration());
        let ty = OptionType::of::<CoreOptions>();

        let desc = table.entry(CORE);
        desc.enqueue_action(ty, Priority::user(10), "late".into(), None, push_table("late"));
        desc.enqueue_action(ty, Priority::user(0), "ConnString".into(), None, typed_action(|o: &mut CoreOptions| {
            o.conn = "sqlite::memory:".into();
            Ok(())
        }));
        desc.enqueue_action(ty, Priority::user(0), "early".into(), None, push_table("early"));

        let (desc, factories) = table.descriptor_and_factories(CORE).unwrap();
        desc.materialize(factories).unwrap();
        assert!(desc.missing_required_keys().is_empty());
        desc.construct().unwrap();

        let core = desc.instance().unwrap().as_any().downcast_ref::<Core>().unwrap();
        assert_eq!(core.options.conn, "sqlite::memory:");
        assert_eq!(core.options.tables, vec!["early", "late"]);

        // a second materialization is a no-op
        desc.materialize(factories).unwrap();
        assert_eq!(desc.options().len(), 1);
    }

    #[test]
    fn failing_action_reports_key_and_source() {
        let mut table = ModuleTable::default();
        table.register(core_registration());
        let ty = OptionType::of::<CoreOptions>();
        table.entry(CORE).enqueue_action(
            ty,
            Priority::cascade(order::NORMAL),
            "Broken".into(),
            Some(AUTH),
            typed_action(|_: &mut CoreOptions| anyhow::bail!("bad table")),
        );

        let (desc, factories) = table.descriptor_and_factories(CORE).unwrap();
        let failure = desc.materialize(factories).unwrap_err();
        assert_eq!(failure.key, "Broken");
        assert_eq!(failure.from, Some(AUTH));
        assert_eq!(failure.option_type, ty);
        assert!(desc.options().is_empty());
    }

    #[test]
    fn disable_reason_is_sticky() {
        let mut table = ModuleTable::default();
        table.register(core_registration());
        let desc = table.get_mut(CORE).unwrap();
        assert!(desc.mark_disabled(DisableReason::Exception {
            phase: Some(Phase::ConfigureServices)
        }));
        assert!(!desc.mark_disabled(DisableReason::Configuration));
        assert_eq!(
            desc.disable_reason().unwrap().to_string(),
            "disabled after failure in ConfigureServices"
        );
    }
}
