//! Per-connection object cache.

use crate::persistent::{ObjectState, PRef};
use crate::types::Oid;
use std::collections::HashMap;
use std::sync::Arc;

/// Operations a connection needs from its object cache.
pub trait ObjectCache: Send {
    /// Looks up an object and marks it as recently used.
    fn get(&mut self, oid: Oid) -> Option<PRef>;

    /// Adds or replaces an object.
    fn set(&mut self, oid: Oid, object: PRef);

    /// Removes an object whose creation was rolled back.
    fn remove(&mut self, oid: Oid) -> Option<PRef>;

    /// Turns the given objects into ghosts.
    fn invalidate(&mut self, oids: &mut dyn Iterator<Item = Oid>);

    /// Ghosts every object and empties the cache.
    fn clear(&mut self);

    /// Ghosts saved objects not used within the last `max_age` accesses
    /// and drops ghosts nobody else holds.
    fn full_sweep(&mut self, max_age: u64);

    /// Ghosts every saved object and drops ghosts nobody else holds.
    fn minimize(&mut self);

    /// Ghosts least recently used saved objects until the target size is
    /// met.
    fn incremental_gc(&mut self);

    /// Number of cached objects, ghosts included.
    fn len(&self) -> usize;

    /// Number of cached objects with loaded state.
    fn non_ghost_count(&self) -> usize;

    /// True if nothing is cached.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry {
    object: PRef,
    last_access: u64,
}

/// LRU object cache with a target number of non-ghost objects.
pub struct PickleCache {
    entries: HashMap<Oid, Entry>,
    target: usize,
    clock: u64,
}

impl PickleCache {
    /// Creates a cache aiming at `target` loaded objects.
    #[must_use]
    pub fn new(target: usize) -> Self {
        Self {
            entries: HashMap::new(),
            target,
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn drop_unreferenced_ghosts(&mut self) {
        self.entries
            .retain(|_, e| !(e.object.is_ghost() && Arc::strong_count(&e.object) == 1));
    }
}

impl ObjectCache for PickleCache {
    fn get(&mut self, oid: Oid) -> Option<PRef> {
        let now = self.tick();
        let entry = self.entries.get_mut(&oid)?;
        entry.last_access = now;
        Some(Arc::clone(&entry.object))
    }

    fn set(&mut self, oid: Oid, object: PRef) {
        let last_access = self.tick();
        self.entries.insert(oid, Entry { object, last_access });
    }

    fn remove(&mut self, oid: Oid) -> Option<PRef> {
        self.entries.remove(&oid).map(|e| e.object)
    }

    fn invalidate(&mut self, oids: &mut dyn Iterator<Item = Oid>) {
        for oid in oids {
            if let Some(entry) = self.entries.get(&oid) {
                entry.object.ghostify();
            }
        }
    }

    fn clear(&mut self) {
        for entry in self.entries.values() {
            entry.object.ghostify();
        }
        self.entries.clear();
    }

    fn full_sweep(&mut self, max_age: u64) {
        let horizon = self.clock.saturating_sub(max_age);
        for entry in self.entries.values() {
            if entry.last_access <= horizon && entry.object.state() == ObjectState::Saved {
                entry.object.ghostify();
            }
        }
        self.drop_unreferenced_ghosts();
    }

    fn minimize(&mut self) {
        for entry in self.entries.values() {
            if entry.object.state() == ObjectState::Saved {
                entry.object.ghostify();
            }
        }
        self.drop_unreferenced_ghosts();
    }

    fn incremental_gc(&mut self) {
        let loaded = self.non_ghost_count();
        if loaded > self.target {
            let mut candidates: Vec<(u64, &PRef)> = self
                .entries
                .values()
                .filter(|e| e.object.state() == ObjectState::Saved)
                .map(|e| (e.last_access, &e.object))
                .collect();
            candidates.sort_unstable_by_key(|(access, _)| *access);
            for (_, object) in candidates.into_iter().take(loaded - self.target) {
                object.ghostify();
            }
        }
        self.drop_unreferenced_ghosts();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn non_ghost_count(&self) -> usize {
        self.entries.values().filter(|e| !e.object.is_ghost()).count()
    }
}

impl std::fmt::Debug for PickleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PickleCache")
            .field("len", &self.entries.len())
            .field("target", &self.target)
            .finish()
    }
}
