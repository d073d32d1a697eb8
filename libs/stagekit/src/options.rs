//! Type-erased option values and the factory map that creates them.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A freshly created, still mutable options object.
pub type OptionsValue = Box<dyn Any + Send + Sync>;

/// A materialized options object; never mutated again.
pub type FrozenOptions = Arc<dyn Any + Send + Sync>;

/// Type-erased configuration action applied during materialization.
pub type OptionAction = Box<dyn FnOnce(&mut dyn Any) -> anyhow::Result<()> + Send>;

/// Creates the default value of an option type.
pub type OptionFactory = fn() -> OptionsValue;

/// Identifies an option type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OptionType {
    id: TypeId,
    name: &'static str,
}

impl OptionType {
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without the module path.
    pub fn short_name(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }
}

impl fmt::Debug for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OptionType({})", self.name)
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

fn default_factory<T: Default + Send + Sync + 'static>() -> OptionsValue {
    Box::new(T::default())
}

/// `OptionType -> constructor` map filled at registration time.
#[derive(Default)]
pub struct OptionFactories {
    factories: HashMap<OptionType, OptionFactory>,
}

impl OptionFactories {
    pub fn register<T: Default + Send + Sync + 'static>(&mut self) -> OptionType {
        let ty = OptionType::of::<T>();
        self.factories.entry(ty).or_insert(default_factory::<T>);
        ty
    }

    pub fn contains(&self, ty: OptionType) -> bool {
        self.factories.contains_key(&ty)
    }

    pub fn create(&self, ty: OptionType) -> Option<OptionsValue> {
        self.factories.get(&ty).map(|f| f())
    }
}

/// Wrap a typed mutation into an [`OptionAction`].
pub(crate) fn typed_action<T, F>(action: F) -> OptionAction
where
    T: Any,
    F: FnOnce(&mut T) -> anyhow::Result<()> + Send + 'static,
{
    Box::new(move |value: &mut dyn Any| {
        let typed = value.downcast_mut::<T>().ok_or_else(|| {
            anyhow::anyhow!("option value is not of type `{}`", type_name::<T>())
        })?;
        action(typed)
    })
}

/// Frozen options of one module, keyed by option type.
#[derive(Clone, Default)]
pub struct OptionSet {
    frozen: HashMap<OptionType, FrozenOptions>,
}

impl OptionSet {
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let value = self.frozen.get(&OptionType::of::<T>())?.clone();
        value.downcast::<T>().ok()
    }

    pub fn contains(&self, ty: OptionType) -> bool {
        self.frozen.contains_key(&ty)
    }

    pub fn len(&self) -> usize {
        self.frozen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frozen.is_empty()
    }

    /// Freeze a value. A type is frozen at most once; later calls are ignored
    /// and return `false`.
    pub(crate) fn freeze(&mut self, ty: OptionType, value: OptionsValue) -> bool {
        if self.frozen.contains_key(&ty) {
            return false;
        }
        self.frozen.insert(ty, Arc::from(value));
        true
    }
}

impl fmt::Debug for OptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.frozen.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Debug, PartialEq)]
    struct DbOptions {
        url: String,
    }

    #[test]
    fn factory_creates_default_and_action_mutates_it() {
        let mut factories = OptionFactories::default();
        let ty = factories.register::<DbOptions>();
        assert_eq!(ty.short_name(), "DbOptions");

        let mut value = factories.create(ty).unwrap();
        let action = typed_action(|o: &mut DbOptions| {
            o.url = "sqlite::memory:".into();
            Ok(())
        });
        action(&mut *value).unwrap();

        let mut set = OptionSet::default();
        assert!(set.freeze(ty, value));
        assert!(!set.freeze(ty, Box::new(DbOptions::default())));
        assert_eq!(set.get::<DbOptions>().unwrap().url, "sqlite::memory:");
    }

    #[test]
    fn action_on_wrong_type_fails() {
        let mut value: OptionsValue = Box::new(7_u32);
        let action = typed_action(|_: &mut DbOptions| Ok(()));
        let err = action(&mut *value).unwrap_err();
        assert!(err.to_string().contains("DbOptions"));
    }
}
