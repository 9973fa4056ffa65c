// Error taxonomy for the registration engine
//
// Every variant carries enough context (entity, interval, actor) for the
// transport layer to render it without re-deriving anything.

use crate::attributes::{Actor, EntityId, EntityKind};
use crate::interval::{Bound, Instant};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Malformed bounds: `from >= to`
    #[error("invalid interval [{from}, {to})")]
    InvalidInterval {
        from: Bound,
        to: Bound,
        entity_id: Option<EntityId>,
    },

    #[error("entity {entity_id} already has a live registration")]
    AlreadyExists { entity_id: EntityId, actor: Actor },

    #[error("entity {entity_id} has no matching registration")]
    NotFound {
        entity_id: EntityId,
        registration_time: Option<Instant>,
    },

    /// Termination must land on midnight in the configured business time zone
    #[error("termination time {effective_to} for entity {entity_id} is not at midnight")]
    InvalidTerminationTime {
        entity_id: EntityId,
        effective_to: Instant,
        actor: Actor,
    },

    #[error("cannot change registration time during pagination (cursor pinned at {pinned}, got {requested})")]
    RegistrationTimeChanged { pinned: Instant, requested: Instant },

    /// Another writer holds the entity. Transient, caller may retry.
    #[error("entity {entity_id} is being mutated by another writer")]
    ConcurrentMutation {
        entity_id: EntityId,
        actor: Option<Actor>,
    },

    #[error("attribute schema mismatch for {kind} {entity_id}: {detail}")]
    SchemaMismatch {
        entity_id: EntityId,
        kind: EntityKind,
        detail: String,
    },

    #[error("page size {requested} outside 1..={max}")]
    InvalidPageSize { requested: usize, max: usize },

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(e: rusqlite::Error) -> Self {
        RegistryError::Storage(e.to_string())
    }
}

impl RegistryError {
    /// Stable kind name for rendering by the transport layer
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::InvalidInterval { .. } => "InvalidInterval",
            RegistryError::AlreadyExists { .. } => "AlreadyExists",
            RegistryError::NotFound { .. } => "NotFound",
            RegistryError::InvalidTerminationTime { .. } => "InvalidTerminationTime",
            RegistryError::RegistrationTimeChanged { .. } => "RegistrationTimeChanged",
            RegistryError::ConcurrentMutation { .. } => "ConcurrentMutation",
            RegistryError::SchemaMismatch { .. } => "SchemaMismatch",
            RegistryError::InvalidPageSize { .. } => "InvalidPageSize",
            RegistryError::InvalidCursor(_) => "InvalidCursor",
            RegistryError::Storage(_) => "Storage",
            RegistryError::Serialization(_) => "Serialization",
            RegistryError::Config(_) => "Config",
        }
    }

    /// Only lock contention is worth retrying; everything else is a caller
    /// error or a hard failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::ConcurrentMutation { .. })
    }

    /// Attach the entity to an interval error raised before the entity was known
    pub fn for_entity(self, id: EntityId) -> Self {
        match self {
            RegistryError::InvalidInterval {
                from,
                to,
                entity_id: None,
            } => RegistryError::InvalidInterval {
                from,
                to,
                entity_id: Some(id),
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_concurrent_mutation_is_retryable() {
        let id = EntityId::new();
        let busy = RegistryError::ConcurrentMutation {
            entity_id: id,
            actor: None,
        };
        let missing = RegistryError::NotFound {
            entity_id: id,
            registration_time: None,
        };

        assert!(busy.is_retryable());
        assert!(!missing.is_retryable());
        assert_eq!(busy.kind(), "ConcurrentMutation");
        assert_eq!(missing.kind(), "NotFound");
    }

    #[test]
    fn test_for_entity_fills_missing_context() {
        let id = EntityId::new();
        let err = RegistryError::InvalidInterval {
            from: Bound::PosInfinity,
            to: Bound::PosInfinity,
            entity_id: None,
        }
        .for_entity(id);

        match err {
            RegistryError::InvalidInterval { entity_id, .. } => assert_eq!(entity_id, Some(id)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_display_mentions_interval() {
        let err = RegistryError::InvalidInterval {
            from: Bound::PosInfinity,
            to: Bound::NegInfinity,
            entity_id: None,
        };
        assert_eq!(err.to_string(), "invalid interval [infinity, -infinity)");
    }
}
