// Registration Timeline - transaction-time versioning of entities
//
// Every mutation closes the live registration at `now` and opens a new one
// starting at `now`. Old registrations are never edited; they become the
// audit trail. Mutations of one entity are serialized by a per-entity guard.

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::algebra::{
    consolidate, inactivate_shrunk_span, merge, span, trim_to_bounds, uncovered, EffectRow,
};
use crate::attributes::{ActiveState, Actor, AttributeSnapshot, AttributeTrack, EntityId, EntityKind};
use crate::config::EngineConfig;
use crate::error::{RegistryError, Result};
use crate::interval::{Bound, Instant, Interval, TransactionInterval};
use crate::store::{RegistrationReader, RegistrationStore};

// ============================================================================
// REGISTRATION
// ============================================================================

/// Why a registration was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Created,
    Corrected,
    Terminated,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Created => "created",
            Lifecycle::Corrected => "corrected",
            Lifecycle::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Lifecycle::Created),
            "corrected" => Ok(Lifecycle::Corrected),
            "terminated" => Ok(Lifecycle::Terminated),
            other => Err(RegistryError::Storage(format!("unknown lifecycle '{other}'"))),
        }
    }
}

pub type TrackRows = Vec<EffectRow<AttributeSnapshot>>;

/// One transaction-time version of an entity's full state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    pub tx_validity: TransactionInterval,
    pub actor: Actor,
    pub lifecycle: Lifecycle,
    pub note: Option<String>,
    pub effects: BTreeMap<AttributeTrack, TrackRows>,
    pub active_flag_rows: Vec<EffectRow<ActiveState>>,
}

impl Registration {
    /// `tx_end = infinity`
    pub fn is_live(&self) -> bool {
        self.tx_validity.is_open_ended()
    }

    /// Registrations are always opened at a finite instant; anything else
    /// is a corrupt row
    pub fn tx_start(&self) -> Result<Instant> {
        self.tx_validity.from().instant().ok_or_else(|| {
            RegistryError::Storage(format!(
                "registration of {} opens at {}",
                self.entity_id,
                self.tx_validity.from()
            ))
        })
    }

    pub fn track(&self, track: AttributeTrack) -> &[EffectRow<AttributeSnapshot>] {
        self.effects.get(&track).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Span where the entity is marked active, if any
    pub fn active_span(&self) -> Option<Interval> {
        let active: Vec<_> = self
            .active_flag_rows
            .iter()
            .filter(|r| r.value.is_active())
            .cloned()
            .collect();
        span(&active)
    }

    pub fn summary(&self) -> RegistrationSummary {
        RegistrationSummary {
            actor: self.actor.clone(),
            tx_validity: self.tx_validity,
            lifecycle: self.lifecycle,
            note: self.note.clone(),
        }
    }
}

/// Audit-trail entry: who registered, and when it was the live version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationSummary {
    pub actor: Actor,
    pub tx_validity: TransactionInterval,
    pub lifecycle: Lifecycle,
    pub note: Option<String>,
}

/// Attribute write requested by a caller
#[derive(Debug, Clone)]
pub struct Change {
    pub attrs: Vec<AttributeSnapshot>,
    pub validity: Interval,
    pub actor: Actor,
    pub note: Option<String>,
}

impl Change {
    pub fn new(attrs: Vec<AttributeSnapshot>, validity: Interval, actor: Actor) -> Self {
        Change {
            attrs,
            validity,
            actor,
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

// ============================================================================
// PER-ENTITY LOCKS
// ============================================================================

/// Set of entities currently being mutated. No global lock is held while
/// a mutation runs; the set is only touched on acquire and release.
#[derive(Default)]
pub(crate) struct EntityLocks {
    held: Mutex<HashSet<EntityId>>,
}

impl EntityLocks {
    pub(crate) fn acquire(&self, id: EntityId, actor: Option<&Actor>) -> Result<MutationGuard<'_>> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(id) {
            warn!(entity_id = %id, "mutation rejected: entity is locked");
            return Err(RegistryError::ConcurrentMutation {
                entity_id: id,
                actor: actor.cloned(),
            });
        }
        debug!(entity_id = %id, "entity lock acquired");
        Ok(MutationGuard { locks: self, id })
    }
}

/// Held for the duration of one mutation; released on drop, on every path
pub(crate) struct MutationGuard<'a> {
    locks: &'a EntityLocks,
    id: EntityId,
}

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.id);
        debug!(entity_id = %self.id, "entity lock released");
    }
}

// ============================================================================
// TIMELINE
// ============================================================================

/// Sole writer of registrations
pub struct RegistrationTimeline<S> {
    store: S,
    locks: EntityLocks,
    business_zone: Tz,
}

impl<S: RegistrationStore> RegistrationTimeline<S> {
    pub fn new(store: S) -> Result<Self> {
        Self::with_config(store, &EngineConfig::default())
    }

    pub fn with_config(store: S, config: &EngineConfig) -> Result<Self> {
        Ok(RegistrationTimeline {
            store,
            locks: EntityLocks::default(),
            business_zone: config.business_zone()?,
        })
    }

    /// Read-only view for resolvers
    pub fn reader(&self) -> &dyn RegistrationReader {
        &self.store
    }

    /// First registration of a new entity
    pub fn create(
        &self,
        id: EntityId,
        kind: EntityKind,
        change: Change,
        now: Instant,
    ) -> Result<Registration> {
        check_schema(id, kind, &change.attrs)?;
        let _guard = self.locks.acquire(id, Some(&change.actor))?;

        if self.store.registration_at(id, None)?.is_some() {
            warn!(entity_id = %id, actor = %change.actor, "create rejected: entity exists");
            return Err(RegistryError::AlreadyExists {
                entity_id: id,
                actor: change.actor,
            });
        }

        let mut effects: BTreeMap<AttributeTrack, TrackRows> = BTreeMap::new();
        for attr in change.attrs {
            effects.insert(attr.track(), vec![EffectRow::new(attr, change.validity)]);
        }

        let registration = Registration {
            entity_id: id,
            kind,
            tx_validity: Interval::starting_at(now),
            actor: change.actor,
            lifecycle: Lifecycle::Created,
            note: change.note,
            effects,
            active_flag_rows: vec![EffectRow::new(ActiveState::Active, change.validity)],
        };

        self.commit(None, registration)
    }

    /// Merge `change` into the live registration and register the result
    pub fn update(&self, id: EntityId, change: Change, now: Instant) -> Result<Registration> {
        let _guard = self.locks.acquire(id, Some(&change.actor))?;
        let live = self.live(id)?;
        check_schema(id, live.kind, &change.attrs)?;
        ensure_after(&live, now)?;

        let mut effects = live.effects.clone();
        for attr in change.attrs {
            let rows = effects.entry(attr.track()).or_default();
            *rows = consolidate(merge(rows.as_slice(), EffectRow::new(attr, change.validity)));
        }

        // widen the entity where the change reaches past its known bounds
        let mut active = live.active_flag_rows.clone();
        for gap in uncovered(&active, change.validity) {
            active = merge(&active, EffectRow::new(ActiveState::Active, gap));
        }

        let registration = Registration {
            entity_id: id,
            kind: live.kind,
            tx_validity: Interval::starting_at(now),
            actor: change.actor,
            lifecycle: Lifecycle::Corrected,
            note: change.note,
            effects,
            active_flag_rows: consolidate(active),
        };

        self.commit(Some(live.tx_start()?), registration)
    }

    /// End the entity at `effective_to`: inactive from there to infinity.
    /// Attribute tracks are carried forward untouched.
    pub fn terminate(
        &self,
        id: EntityId,
        effective_to: Instant,
        actor: Actor,
        now: Instant,
    ) -> Result<Registration> {
        if !self.is_midnight(effective_to) {
            warn!(entity_id = %id, %effective_to, "terminate rejected: not at midnight");
            return Err(RegistryError::InvalidTerminationTime {
                entity_id: id,
                effective_to,
                actor,
            });
        }

        let _guard = self.locks.acquire(id, Some(&actor))?;
        let live = self.live(id)?;
        ensure_after(&live, now)?;

        let cut = Bound::At(effective_to);
        let delta = match live.active_span() {
            Some(active) if active.from() < cut => {
                inactivate_shrunk_span(active.from(), Bound::PosInfinity, active.from(), cut)
                    .map_err(|e| e.for_entity(id))?
            }
            _ => vec![EffectRow::new(ActiveState::Inactive, Interval::starting_at(effective_to))],
        };

        let active = delta
            .into_iter()
            .fold(live.active_flag_rows.clone(), |rows, row| merge(&rows, row));

        let registration = Registration {
            entity_id: id,
            kind: live.kind,
            tx_validity: Interval::starting_at(now),
            actor,
            lifecycle: Lifecycle::Terminated,
            note: None,
            effects: live.effects.clone(),
            active_flag_rows: consolidate(active),
        };

        self.commit(Some(live.tx_start()?), registration)
    }

    /// Move the entity's overall bounds to `bounds`. Attribute rows are
    /// trimmed to them; spans given up turn `Inactive`, spans gained turn
    /// `Active`.
    pub fn set_bounds(
        &self,
        id: EntityId,
        bounds: Interval,
        actor: Actor,
        now: Instant,
    ) -> Result<Registration> {
        let _guard = self.locks.acquire(id, Some(&actor))?;
        let live = self.live(id)?;
        ensure_after(&live, now)?;

        let mut effects: BTreeMap<AttributeTrack, TrackRows> = BTreeMap::new();
        for (track, rows) in &live.effects {
            let trimmed = trim_to_bounds(rows, bounds.from(), bounds.to()).map_err(|e| e.for_entity(id))?;
            if !trimmed.is_empty() {
                effects.insert(*track, trimmed);
            }
        }

        let (given_up, gained) = match live.active_span() {
            Some(old) => (
                inactivate_shrunk_span(old.from(), old.to(), bounds.from(), bounds.to())
                    .map_err(|e| e.for_entity(id))?,
                bounds.difference(&old),
            ),
            None => (Vec::new(), vec![bounds]),
        };
        debug!(entity_id = %id, given_up = given_up.len(), gained = gained.len(), "bounds changed");

        let active = given_up
            .into_iter()
            .chain(gained.into_iter().map(|gap| EffectRow::new(ActiveState::Active, gap)))
            .fold(live.active_flag_rows.clone(), |rows, row| merge(&rows, row));

        let registration = Registration {
            entity_id: id,
            kind: live.kind,
            tx_validity: Interval::starting_at(now),
            actor,
            lifecycle: Lifecycle::Corrected,
            note: None,
            effects,
            active_flag_rows: consolidate(active),
        };

        self.commit(Some(live.tx_start()?), registration)
    }

    /// Remove every registration of the entity. Administrative correction
    /// only; this cannot be undone.
    pub fn delete(&self, id: EntityId) -> Result<()> {
        let _guard = self.locks.acquire(id, None)?;
        let removed = self.store.remove(id)?;
        if removed == 0 {
            return Err(RegistryError::NotFound {
                entity_id: id,
                registration_time: None,
            });
        }
        info!(entity_id = %id, removed, "entity deleted");
        Ok(())
    }

    fn live(&self, id: EntityId) -> Result<Registration> {
        self.store
            .registration_at(id, None)?
            .ok_or(RegistryError::NotFound {
                entity_id: id,
                registration_time: None,
            })
    }

    /// `expected_live` is the tx_start of the registration the new one was
    /// derived from
    fn commit(&self, expected_live: Option<Instant>, registration: Registration) -> Result<Registration> {
        self.store.append(expected_live, registration.clone())?;
        info!(
            entity_id = %registration.entity_id,
            actor = %registration.actor,
            lifecycle = registration.lifecycle.as_str(),
            tx_start = %registration.tx_validity.from(),
            "registration committed"
        );
        Ok(registration)
    }

    fn is_midnight(&self, t: Instant) -> bool {
        t.with_timezone(&self.business_zone).time() == NaiveTime::MIN
    }
}

/// Every payload must belong to `kind`, with at most one payload per track
fn check_schema(id: EntityId, kind: EntityKind, attrs: &[AttributeSnapshot]) -> Result<()> {
    let mismatch = |detail: String| RegistryError::SchemaMismatch {
        entity_id: id,
        kind,
        detail,
    };

    if attrs.is_empty() {
        return Err(mismatch("no attributes supplied".to_string()));
    }

    let mut seen = HashSet::new();
    for attr in attrs {
        if !attr.applies_to(kind) {
            return Err(mismatch(format!("{:?} does not apply", attr.track())));
        }
        if !seen.insert(attr.track()) {
            return Err(mismatch(format!("track {} given twice", attr.track().as_str())));
        }
    }
    Ok(())
}

/// Transaction time only moves forward
fn ensure_after(live: &Registration, now: Instant) -> Result<()> {
    if Bound::At(now) <= live.tx_validity.from() {
        return Err(RegistryError::InvalidInterval {
            from: live.tx_validity.from(),
            to: Bound::At(now),
            entity_id: Some(live.entity_id),
        });
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
