// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-command entity cache with dirty checking.

use std::collections::BTreeMap;

use crate::persistence::{
    Change, ChangeSet, Entity, EventSubscription, Execution, Job, VariableInstance,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    New,
    Persistent,
    Deleted,
}

#[derive(Debug)]
struct CacheEntry<T> {
    current: T,
    /// Snapshot as loaded, `None` for entities created in this unit of work.
    original: Option<T>,
    state: EntryState,
    force_update: bool,
}

/// Cached entities of one type, keyed and iterated by id.
#[derive(Debug)]
pub struct EntityMap<T: Entity> {
    entries: BTreeMap<String, CacheEntry<T>>,
}

impl<T: Entity> Default for EntityMap<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: Entity> EntityMap<T> {
    /// Register an entity read from storage. An entry that is already cached
    /// (loaded, created or deleted) wins over the fresh read.
    pub fn put_loaded(&mut self, entity: T) {
        self.entries
            .entry(entity.id().to_string())
            .or_insert_with(|| CacheEntry {
                original: Some(entity.clone()),
                current: entity,
                state: EntryState::Persistent,
                force_update: false,
            });
    }

    /// Register an entity created in this unit of work.
    pub fn insert(&mut self, entity: T) {
        self.entries.insert(
            entity.id().to_string(),
            CacheEntry {
                current: entity,
                original: None,
                state: EntryState::New,
                force_update: false,
            },
        );
    }

    /// True if `id` has an entry, deleted ones included.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Live entity by id.
    pub fn get(&self, id: &str) -> Option<&T> {
        self.entries
            .get(id)
            .filter(|e| e.state != EntryState::Deleted)
            .map(|e| &e.current)
    }

    /// Live entity by id, for modification.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.entries
            .get_mut(id)
            .filter(|e| e.state != EntryState::Deleted)
            .map(|e| &mut e.current)
    }

    /// Remove an entity. Entities created in this unit of work vanish without a trace.
    pub fn delete(&mut self, id: &str) -> Option<T> {
        let state = self.entries.get(id)?.state;
        match state {
            EntryState::Deleted => None,
            EntryState::New => self.entries.remove(id).map(|e| e.current),
            EntryState::Persistent => self.entries.get_mut(id).map(|e| {
                e.state = EntryState::Deleted;
                e.current.clone()
            }),
        }
    }

    /// Write a persistent entity even if none of its fields changed, bumping
    /// its revision so concurrent writers of the same row conflict.
    pub fn force_update(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id)
            && entry.state == EntryState::Persistent
        {
            entry.force_update = true;
        }
    }

    /// Live entities in id order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries
            .values()
            .filter(|e| e.state != EntryState::Deleted)
            .map(|e| &e.current)
    }

    /// Pending writes in id order.
    pub fn changes(&self) -> Vec<Change<T>> {
        self.entries
            .values()
            .filter_map(|entry| match (entry.state, &entry.original) {
                (EntryState::New, _) => Some(Change::Insert(entry.current.clone())),
                (EntryState::Deleted, Some(original)) => Some(Change::Delete {
                    id: original.id().to_string(),
                    revision: original.revision(),
                }),
                (EntryState::Persistent, Some(original))
                    if entry.force_update || &entry.current != original =>
                {
                    Some(Change::Update(entry.current.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

/// All entities touched by one unit of work.
#[derive(Debug, Default)]
pub struct EntityCache {
    /// Executions.
    pub executions: EntityMap<Execution>,
    /// Persistent variables.
    pub variables: EntityMap<VariableInstance>,
    /// Jobs.
    pub jobs: EntityMap<Job>,
    /// Event subscriptions.
    pub event_subscriptions: EntityMap<EventSubscription>,
}

impl EntityCache {
    /// Writes needed to make storage match the cache.
    pub fn change_set(&self) -> ChangeSet {
        ChangeSet {
            executions: self.executions.changes(),
            variables: self.variables.changes(),
            jobs: self.jobs.changes(),
            event_subscriptions: self.event_subscriptions.changes(),
        }
    }
}
