//! Numeric source ids used on the OSC wire
//!
//! OSC peers address sources by a 32-bit number. Ordinals start at 1, only
//! ever grow and are retired with their source, so a stale number held by a
//! peer can never reach a newer source. 0 is reserved for "all sources".

use soundscape_core::domain::SourceId;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct OrdinalTable {
    next: u32,
    by_id: HashMap<SourceId, u32>,
    by_ordinal: HashMap<u32, SourceId>,
    retired: HashSet<u32>,
    pending: Option<u32>,
}

impl OrdinalTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordinal of `id`, assigning one if it has none yet
    ///
    /// A pending ordinal announced with `expect` is used first.
    pub fn assign(&mut self, id: &SourceId) -> u32 {
        if let Some(ordinal) = self.by_id.get(id) {
            return *ordinal;
        }
        let ordinal = match self.pending.take() {
            Some(ordinal) if self.is_free(ordinal) => ordinal,
            _ => self.next + 1,
        };
        self.insert(id.clone(), ordinal);
        ordinal
    }

    /// Bind the next assigned id to `ordinal`, e.g. the number a server used
    pub fn expect(&mut self, ordinal: u32) {
        if self.is_free(ordinal) {
            self.pending = Some(ordinal);
        } else {
            warn!(ordinal, "OSC ordinal already used, a new one will be assigned");
        }
    }

    /// Forget a pending ordinal that was not consumed
    pub fn clear_expected(&mut self) {
        self.pending = None;
    }

    pub fn ordinal(&self, id: &SourceId) -> Option<u32> {
        self.by_id.get(id).copied()
    }

    pub fn id(&self, ordinal: u32) -> Option<SourceId> {
        self.by_ordinal.get(&ordinal).cloned()
    }

    /// Retire the ordinal of a deleted source
    pub fn retire(&mut self, id: &SourceId) -> Option<u32> {
        let ordinal = self.by_id.remove(id)?;
        self.by_ordinal.remove(&ordinal);
        self.retired.insert(ordinal);
        debug!(%id, ordinal, "OSC ordinal retired");
        Some(ordinal)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn is_free(&self, ordinal: u32) -> bool {
        ordinal != 0 && !self.by_ordinal.contains_key(&ordinal) && !self.retired.contains(&ordinal)
    }

    fn insert(&mut self, id: SourceId, ordinal: u32) {
        self.next = self.next.max(ordinal);
        self.by_ordinal.insert(ordinal, id.clone());
        self.by_id.insert(id, ordinal);
    }
}
