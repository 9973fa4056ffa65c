// Registration Store - append-only persistence contract
//
// Reads are split from writes so that only the timeline can append.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::attributes::{EntityId, EntityKind};
use crate::error::{RegistryError, Result};
use crate::interval::{Bound, Instant};
use crate::timeline::Registration;

/// Read half of the store
pub trait RegistrationReader: Send + Sync {
    /// The registration whose transaction interval contains
    /// `registration_time`, or the live one when `None`
    fn registration_at(
        &self,
        id: EntityId,
        registration_time: Option<Instant>,
    ) -> Result<Option<Registration>>;

    /// Every registration of `id`, ordered by `tx_start`
    fn history(&self, id: EntityId) -> Result<Vec<Registration>>;

    /// Entities with at least one registration, sorted by id
    fn entity_ids(&self, kind: Option<EntityKind>) -> Result<Vec<EntityId>>;
}

/// Write half. Only [`crate::timeline::RegistrationTimeline`] holds one.
pub trait RegistrationStore: RegistrationReader {
    /// Close the live registration of the entity at `next.tx_start` and open
    /// `next` in one atomic step. Readers see either both or neither.
    ///
    /// `expected_live` is the tx_start of the live registration `next` was
    /// derived from (`None` for a first registration). If another writer got
    /// there first the append fails with `ConcurrentMutation`.
    fn append(&self, expected_live: Option<Instant>, next: Registration) -> Result<()>;

    /// Drop every registration of `id`. Returns how many were removed.
    fn remove(&self, id: EntityId) -> Result<usize>;
}

/// Error for an append whose base registration is no longer live
pub(crate) fn stale_base(next: &Registration) -> RegistryError {
    RegistryError::ConcurrentMutation {
        entity_id: next.entity_id,
        actor: Some(next.actor.clone()),
    }
}

/// Select from an ordered history
pub(crate) fn select(history: &[Registration], registration_time: Option<Instant>) -> Option<&Registration> {
    match registration_time {
        None => history.iter().rev().find(|r| r.is_live()),
        Some(t) => history.iter().find(|r| r.tx_validity.contains(t)),
    }
}

// ============================================================================
// MEMORY STORE
// ============================================================================

/// In-process store: each entity's history is an immutable `Arc<Vec<_>>`
/// swapped whole on every commit.
#[derive(Default)]
pub struct MemoryStore {
    entities: RwLock<HashMap<EntityId, Arc<Vec<Registration>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self, id: EntityId) -> Option<Arc<Vec<Registration>>> {
        let entities = self.entities.read().unwrap_or_else(PoisonError::into_inner);
        entities.get(&id).cloned()
    }
}

impl RegistrationReader for MemoryStore {
    fn registration_at(
        &self,
        id: EntityId,
        registration_time: Option<Instant>,
    ) -> Result<Option<Registration>> {
        Ok(self
            .snapshot(id)
            .and_then(|history| select(&history, registration_time).cloned()))
    }

    fn history(&self, id: EntityId) -> Result<Vec<Registration>> {
        Ok(self
            .snapshot(id)
            .map(|history| history.as_ref().clone())
            .unwrap_or_default())
    }

    fn entity_ids(&self, kind: Option<EntityKind>) -> Result<Vec<EntityId>> {
        let entities = self.entities.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<EntityId> = entities
            .iter()
            .filter(|(_, history)| {
                kind.map_or(true, |k| history.first().is_some_and(|r| r.kind == k))
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

impl RegistrationStore for MemoryStore {
    fn append(&self, expected_live: Option<Instant>, next: Registration) -> Result<()> {
        let next_start = next.tx_start()?;
        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);

        let mut history = entities
            .get(&next.entity_id)
            .map(|h| h.as_ref().clone())
            .unwrap_or_default();

        let live_start = history
            .iter()
            .find(|r| r.is_live())
            .map(Registration::tx_start)
            .transpose()?;
        if live_start != expected_live {
            return Err(stale_base(&next));
        }

        if let Some(live) = history.iter_mut().find(|r| r.is_live()) {
            if Bound::At(next_start) <= live.tx_validity.from() {
                return Err(RegistryError::InvalidInterval {
                    from: live.tx_validity.from(),
                    to: Bound::At(next_start),
                    entity_id: Some(next.entity_id),
                });
            }
            live.tx_validity = live
                .tx_validity
                .closed_at(next_start)
                .map_err(|e| e.for_entity(next.entity_id))?;
        }

        let id = next.entity_id;
        history.push(next);
        entities.insert(id, Arc::new(history));
        Ok(())
    }

    fn remove(&self, id: EntityId) -> Result<usize> {
        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        Ok(entities.remove(&id).map_or(0, |history| history.len()))
    }
}
