// Attribute Schema - closed, per-entity-type attribute payloads
//
// Attribute values are a tagged variant rather than an open map, so the
// interval algebra stays generic over the track and never inspects payloads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::RegistryError;

// ============================================================================
// IDENTITY
// ============================================================================

/// Stable entity identity - never changes across registrations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        EntityId(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(EntityId)
    }
}

/// Opaque identity of whoever issued a registration.
/// Authenticated and authorized upstream; the engine only records it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(pub String);

impl Actor {
    pub fn new(token: impl Into<String>) -> Self {
        Actor(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// ENTITY KIND / ATTRIBUTE TRACK
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    OrganisationUnit,
    Person,
    Engagement,
    Address,
    Class,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::OrganisationUnit => "organisation_unit",
            EntityKind::Person => "person",
            EntityKind::Engagement => "engagement",
            EntityKind::Address => "address",
            EntityKind::Class => "class",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "organisation_unit" => Ok(EntityKind::OrganisationUnit),
            "person" => Ok(EntityKind::Person),
            "engagement" => Ok(EntityKind::Engagement),
            "address" => Ok(EntityKind::Address),
            "class" => Ok(EntityKind::Class),
            other => Err(RegistryError::Storage(format!("unknown entity kind '{other}'"))),
        }
    }
}

/// Independent business-time track inside a registration.
/// Each track is its own gap-free partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AttributeTrack {
    Properties,
    Parent,
    Relations,
}

impl AttributeTrack {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeTrack::Properties => "properties",
            AttributeTrack::Parent => "parent",
            AttributeTrack::Relations => "relations",
        }
    }
}

impl FromStr for AttributeTrack {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "properties" => Ok(AttributeTrack::Properties),
            "parent" => Ok(AttributeTrack::Parent),
            "relations" => Ok(AttributeTrack::Relations),
            other => Err(RegistryError::Storage(format!("unknown attribute track '{other}'"))),
        }
    }
}

// ============================================================================
// ATTRIBUTE PAYLOADS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganisationUnitProperties {
    pub user_key: String,
    pub name: String,
    pub unit_type: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonProperties {
    pub given_name: String,
    pub surname: String,
    /// Masked national identifier, never the full number
    pub cpr_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementProperties {
    pub person: EntityId,
    pub org_unit: EntityId,
    pub job_function: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressProperties {
    pub address_type: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassProperties {
    pub user_key: String,
    pub title: String,
    pub facet: String,
}

/// One attribute state of one entity, as written by a registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttributeSnapshot {
    OrganisationUnit(OrganisationUnitProperties),
    Person(PersonProperties),
    Engagement(EngagementProperties),
    Address(AddressProperties),
    Class(ClassProperties),
    /// Parent org-unit relation; `None` marks a root
    Parent { parent: Option<EntityId> },
    Relation { role: String, target: EntityId },
}

impl AttributeSnapshot {
    pub fn track(&self) -> AttributeTrack {
        match self {
            AttributeSnapshot::Parent { .. } => AttributeTrack::Parent,
            AttributeSnapshot::Relation { .. } => AttributeTrack::Relations,
            _ => AttributeTrack::Properties,
        }
    }

    /// Whether this payload belongs to the schema of `kind`
    pub fn applies_to(&self, kind: EntityKind) -> bool {
        match self {
            AttributeSnapshot::OrganisationUnit(_) => kind == EntityKind::OrganisationUnit,
            AttributeSnapshot::Person(_) => kind == EntityKind::Person,
            AttributeSnapshot::Engagement(_) => kind == EntityKind::Engagement,
            AttributeSnapshot::Address(_) => kind == EntityKind::Address,
            AttributeSnapshot::Class(_) => kind == EntityKind::Class,
            AttributeSnapshot::Parent { .. } => kind == EntityKind::OrganisationUnit,
            AttributeSnapshot::Relation { .. } => true,
        }
    }

    /// Parent id if this is a parent-relation snapshot
    pub fn parent(&self) -> Option<EntityId> {
        match self {
            AttributeSnapshot::Parent { parent } => *parent,
            _ => None,
        }
    }

    pub fn address(address_type: impl Into<String>, value: impl Into<String>) -> Self {
        AttributeSnapshot::Address(AddressProperties {
            address_type: address_type.into(),
            value: value.into(),
        })
    }

    pub fn org_unit(user_key: impl Into<String>, name: impl Into<String>) -> Self {
        AttributeSnapshot::OrganisationUnit(OrganisationUnitProperties {
            user_key: user_key.into(),
            name: name.into(),
            unit_type: None,
        })
    }
}

// ============================================================================
// ACTIVE STATE
// ============================================================================

/// Dedicated track: is the entity in force over a business-time span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActiveState {
    Active,
    Inactive,
}

impl ActiveState {
    pub fn is_active(&self) -> bool {
        matches!(self, ActiveState::Active)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracks() {
        assert_eq!(
            AttributeSnapshot::address("postal", "Home").track(),
            AttributeTrack::Properties
        );
        assert_eq!(
            AttributeSnapshot::Parent { parent: None }.track(),
            AttributeTrack::Parent
        );
        assert_eq!(
            AttributeSnapshot::Relation {
                role: "manager".to_string(),
                target: EntityId::new(),
            }
            .track(),
            AttributeTrack::Relations
        );
    }

    #[test]
    fn test_schema_applies_to_kind() {
        let unit = AttributeSnapshot::org_unit("hr", "Human Resources");
        assert!(unit.applies_to(EntityKind::OrganisationUnit));
        assert!(!unit.applies_to(EntityKind::Person));

        let parent = AttributeSnapshot::Parent { parent: None };
        assert!(parent.applies_to(EntityKind::OrganisationUnit));
        assert!(!parent.applies_to(EntityKind::Address));
    }

    #[test]
    fn test_kind_and_track_names_round_trip() {
        for kind in [
            EntityKind::OrganisationUnit,
            EntityKind::Person,
            EntityKind::Engagement,
            EntityKind::Address,
            EntityKind::Class,
        ] {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        for track in [
            AttributeTrack::Properties,
            AttributeTrack::Parent,
            AttributeTrack::Relations,
        ] {
            assert_eq!(track.as_str().parse::<AttributeTrack>().unwrap(), track);
        }
        assert!("department".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_snapshot_json_is_tagged() {
        let json = serde_json::to_value(AttributeSnapshot::address("postal", "Home")).unwrap();
        assert_eq!(json["type"], "address");
        assert_eq!(json["value"], "Home");
    }
}
