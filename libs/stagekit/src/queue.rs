//! Priority queue of configuration entries with "same key, configure once"
//! semantics.
//!
//! Entries are sorted by `(order, origin)` and ties keep insertion order, so
//! the queue behaves like a stable sort rather than a total order by key.
//! Enqueuing a key that is already present replaces the payload in place: the
//! entry keeps the slot (priority and position) of the first registration.

use std::collections::HashMap;

use serde::Serialize;

use crate::contracts::ModuleId;

/// Well-known `order` values for configuration entries.
pub mod order {
    /// Runs before regular configuration (e.g. values bound from config files).
    pub const PRE_CONFIG: i32 = -100;
    pub const NORMAL: i32 = 0;
    /// Runs after regular configuration.
    pub const POST_CONFIG: i32 = 100;
}

/// Who contributed an entry.
///
/// `Cascade` sorts before `User`, so on equal `order` a user entry is applied
/// later and its effect wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ActionOrigin {
    /// Contributed by another module while declaring its dependencies.
    Cascade,
    /// Contributed directly by host code.
    User,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Priority {
    pub order: i32,
    pub origin: ActionOrigin,
}

impl Priority {
    pub fn user(order: i32) -> Self {
        Self {
            order,
            origin: ActionOrigin::User,
        }
    }

    pub fn cascade(order: i32) -> Self {
        Self {
            order,
            origin: ActionOrigin::Cascade,
        }
    }
}

pub struct QueuedEntry<T> {
    pub priority: Priority,
    pub seq: u64,
    pub key: String,
    /// Module whose guide enqueued the entry, if any.
    pub from: Option<ModuleId>,
    pub payload: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Inserted,
    Replaced,
}

pub struct OrderedQueue<T> {
    entries: Vec<QueuedEntry<T>>,
    by_key: HashMap<String, usize>,
    next_seq: u64,
}

impl<T> Default for OrderedQueue<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            by_key: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> OrderedQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(
        &mut self,
        priority: Priority,
        key: impl Into<String>,
        from: Option<ModuleId>,
        payload: T,
    ) -> Enqueued {
        let key = key.into();
        if let Some(&idx) = self.by_key.get(&key) {
            let entry = &mut self.entries[idx];
            entry.payload = payload;
            entry.from = from;
            return Enqueued::Replaced;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_key.insert(key.clone(), self.entries.len());
        self.entries.push(QueuedEntry {
            priority,
            seq,
            key,
            from,
            payload,
        });
        Enqueued::Inserted
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    /// Modules that contributed entries, in insertion order.
    pub fn sources(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.entries.iter().filter_map(|e| e.from)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every entry out, in application order.
    pub fn drain_ordered(&mut self) -> Vec<QueuedEntry<T>> {
        self.by_key.clear();
        let mut entries = std::mem::take(&mut self.entries);
        entries.sort_by_key(|e| (e.priority, e.seq));
        entries
    }
}
