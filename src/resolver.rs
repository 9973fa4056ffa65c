// Validity Resolver - business time x registration time lookups
//
// Step 1 always picks one registration (by registration time, default the
// live one). Step 2 looks inside that registration by business time.
// The registration filter is pushed down to the store; business-time
// filtering runs on the single registration it returns.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::algebra::{clip, row_at, EffectRow};
use crate::attributes::{ActiveState, AttributeSnapshot, AttributeTrack, EntityId, EntityKind};
use crate::error::Result;
use crate::interval::{Instant, Interval, TransactionInterval};
use crate::store::RegistrationReader;
use crate::timeline::{Registration, RegistrationSummary};

/// Every track of one entity at one business instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityView {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    pub tx_validity: TransactionInterval,
    pub active: bool,
    pub attributes: Vec<AttributeSnapshot>,
}

pub struct ValidityResolver<'a> {
    reader: &'a dyn RegistrationReader,
}

impl<'a> ValidityResolver<'a> {
    pub fn new(reader: &'a dyn RegistrationReader) -> Self {
        ValidityResolver { reader }
    }

    fn registration(
        &self,
        id: EntityId,
        registration_time: Option<Instant>,
    ) -> Result<Option<Registration>> {
        let found = self.reader.registration_at(id, registration_time)?;
        debug!(
            entity_id = %id,
            registration_time = ?registration_time,
            found = found.is_some(),
            "registration selected"
        );
        Ok(found)
    }

    /// Value of `track` in force at business time `at`, as registered at
    /// `registration_time`
    pub fn current(
        &self,
        id: EntityId,
        track: AttributeTrack,
        at: Instant,
        registration_time: Option<Instant>,
    ) -> Result<Option<EffectRow<AttributeSnapshot>>> {
        Ok(self
            .registration(id, registration_time)?
            .and_then(|reg| row_at(reg.track(track), at).cloned()))
    }

    /// History view: every row of `track` intersecting `range`, clipped to it
    pub fn validities(
        &self,
        id: EntityId,
        track: AttributeTrack,
        range: Interval,
        registration_time: Option<Instant>,
    ) -> Result<Vec<EffectRow<AttributeSnapshot>>> {
        Ok(self
            .registration(id, registration_time)?
            .map(|reg| clip(reg.track(track), &range))
            .unwrap_or_default())
    }

    pub fn active_state(
        &self,
        id: EntityId,
        at: Instant,
        registration_time: Option<Instant>,
    ) -> Result<Option<EffectRow<ActiveState>>> {
        Ok(self
            .registration(id, registration_time)?
            .and_then(|reg| row_at(&reg.active_flag_rows, at).cloned()))
    }

    pub fn active_validities(
        &self,
        id: EntityId,
        range: Interval,
        registration_time: Option<Instant>,
    ) -> Result<Vec<EffectRow<ActiveState>>> {
        Ok(self
            .registration(id, registration_time)?
            .map(|reg| clip(&reg.active_flag_rows, &range))
            .unwrap_or_default())
    }

    /// All tracks at once; `None` if the entity was not registered yet
    pub fn snapshot(
        &self,
        id: EntityId,
        at: Instant,
        registration_time: Option<Instant>,
    ) -> Result<Option<EntityView>> {
        Ok(self.registration(id, registration_time)?.map(|reg| {
            let active = row_at(&reg.active_flag_rows, at).is_some_and(|r| r.value.is_active());
            let attributes = reg
                .effects
                .values()
                .filter_map(|rows| row_at(rows, at).map(|r| r.value.clone()))
                .collect();
            EntityView {
                entity_id: reg.entity_id,
                kind: reg.kind,
                tx_validity: reg.tx_validity,
                active,
                attributes,
            }
        }))
    }

    /// The transaction-time axis itself: every registration, oldest first
    pub fn registrations(&self, id: EntityId) -> Result<Vec<RegistrationSummary>> {
        Ok(self
            .reader
            .history(id)?
            .iter()
            .map(Registration::summary)
            .collect())
    }

    /// Parent chain of an org unit, nearest first. Read-only hook for the
    /// authorization layer.
    pub fn ancestors(
        &self,
        id: EntityId,
        at: Instant,
        registration_time: Option<Instant>,
    ) -> Result<Vec<EntityId>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut cursor = id;

        while let Some(row) = self.current(cursor, AttributeTrack::Parent, at, registration_time)? {
            let Some(parent) = row.value.parent() else {
                break;
            };
            if !seen.insert(parent) {
                warn!(entity_id = %id, %parent, "parent cycle detected; stopping traversal");
                break;
            }
            chain.push(parent);
            cursor = parent;
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::Actor;
    use crate::interval::Bound;
    use crate::store::MemoryStore;
    use crate::timeline::{Change, RegistrationTimeline};
    use chrono::{Duration, TimeZone, Utc};

    fn date(y: i32, m: u32, d: u32) -> Instant {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn unit(
        tl: &RegistrationTimeline<MemoryStore>,
        name: &str,
        parent: Option<EntityId>,
        now: Instant,
    ) -> EntityId {
        let id = EntityId::new();
        let change = Change::new(
            vec![
                AttributeSnapshot::org_unit(name.to_lowercase(), name),
                AttributeSnapshot::Parent { parent },
            ],
            Interval::starting_at(date(2000, 1, 1)),
            Actor::new("setup"),
        );
        tl.create(id, EntityKind::OrganisationUnit, change, now)
            .unwrap();
        id
    }

    #[test]
    fn test_current_and_history_views() {
        let tl = RegistrationTimeline::new(MemoryStore::new()).unwrap();
        let id = EntityId::new();
        let t0 = date(2024, 1, 1);
        tl.create(
            id,
            EntityKind::Address,
            Change::new(
                vec![AttributeSnapshot::address("postal", "Home")],
                Interval::starting_at(date(2010, 1, 1)),
                Actor::new("alice"),
            ),
            t0,
        )
        .unwrap();
        tl.update(
            id,
            Change::new(
                vec![AttributeSnapshot::address("postal", "Cabin")],
                Interval::starting_at(date(2020, 1, 1)),
                Actor::new("alice"),
            ),
            t0 + Duration::days(1),
        )
        .unwrap();

        let resolver = ValidityResolver::new(tl.reader());

        let now = resolver
            .current(id, AttributeTrack::Properties, date(2024, 1, 1), None)
            .unwrap()
            .unwrap();
        assert_eq!(now.value, AttributeSnapshot::address("postal", "Cabin"));

        let before_any_value = resolver
            .current(id, AttributeTrack::Properties, date(2005, 1, 1), None)
            .unwrap();
        assert!(before_any_value.is_none());

        let history = resolver
            .validities(
                id,
                AttributeTrack::Properties,
                Interval::new(date(2015, 1, 1), date(2025, 1, 1)).unwrap(),
                None,
            )
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].validity.from(), Bound::At(date(2015, 1, 1)));
        assert_eq!(history[1].validity.to(), Bound::At(date(2025, 1, 1)));

        let as_first_registered = resolver
            .validities(id, AttributeTrack::Properties, Interval::unbounded(), Some(t0))
            .unwrap();
        assert_eq!(as_first_registered.len(), 1);
    }

    #[test]
    fn test_unknown_entity_is_empty_not_error() {
        let tl = RegistrationTimeline::new(MemoryStore::new()).unwrap();
        let resolver = ValidityResolver::new(tl.reader());
        let id = EntityId::new();

        assert!(resolver
            .current(id, AttributeTrack::Properties, date(2024, 1, 1), None)
            .unwrap()
            .is_none());
        assert!(resolver.registrations(id).unwrap().is_empty());
        assert!(resolver.snapshot(id, date(2024, 1, 1), None).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_reflects_termination() {
        let tl = RegistrationTimeline::new(MemoryStore::new()).unwrap();
        let root = unit(&tl, "Root", None, date(2024, 1, 1));
        let cut = date(2024, 1, 1) - Duration::hours(1);
        tl.terminate(root, cut, Actor::new("alice"), date(2024, 2, 1))
            .unwrap();

        let resolver = ValidityResolver::new(tl.reader());
        let before = resolver.snapshot(root, date(2023, 6, 1), None).unwrap().unwrap();
        let after = resolver.snapshot(root, date(2024, 6, 1), None).unwrap().unwrap();

        assert!(before.active);
        assert!(!after.active);
        assert_eq!(after.attributes.len(), 2);
        assert_eq!(
            resolver
                .active_state(root, date(2024, 6, 1), None)
                .unwrap()
                .map(|r| r.value),
            Some(ActiveState::Inactive)
        );

        // as registered before the termination it was still active
        let earlier = resolver
            .active_state(root, date(2024, 6, 1), Some(date(2024, 1, 15)))
            .unwrap();
        assert_eq!(earlier.map(|r| r.value), Some(ActiveState::Active));
    }

    #[test]
    fn test_ancestors_walks_parent_chain() {
        let tl = RegistrationTimeline::new(MemoryStore::new()).unwrap();
        let now = date(2024, 1, 1);
        let root = unit(&tl, "Root", None, now);
        let division = unit(&tl, "Division", Some(root), now);
        let team = unit(&tl, "Team", Some(division), now);

        let resolver = ValidityResolver::new(tl.reader());
        assert_eq!(resolver.ancestors(team, now, None).unwrap(), vec![division, root]);
        assert!(resolver.ancestors(root, now, None).unwrap().is_empty());

        // parent history is business-time aware
        assert!(resolver.ancestors(team, date(1999, 1, 1), None).unwrap().is_empty());
    }

    #[test]
    fn test_ancestors_stops_on_cycle() {
        let tl = RegistrationTimeline::new(MemoryStore::new()).unwrap();
        let now = date(2024, 1, 1);
        let a = unit(&tl, "A", None, now);
        let b = unit(&tl, "B", Some(a), now);
        tl.update(
            a,
            Change::new(
                vec![AttributeSnapshot::Parent { parent: Some(b) }],
                Interval::starting_at(date(2000, 1, 1)),
                Actor::new("oops"),
            ),
            now + Duration::seconds(1),
        )
        .unwrap();

        let resolver = ValidityResolver::new(tl.reader());
        assert_eq!(resolver.ancestors(b, now, None).unwrap(), vec![a]);
    }
}
