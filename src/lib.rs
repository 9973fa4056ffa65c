// Bitemporal Registry - Core Library
// Business-time validity crossed with append-only registrations

pub mod algebra;
pub mod attributes;
pub mod config;
pub mod db;
pub mod error;
pub mod interval;
pub mod pagination;
pub mod resolver;
pub mod store;
pub mod timeline;

// Re-export commonly used types
pub use algebra::{
    clip, consolidate, inactivate_shrunk_span, merge, trim_to_bounds, EffectRow,
};
pub use attributes::{
    ActiveState, Actor, AttributeSnapshot, AttributeTrack, EntityId, EntityKind,
};
pub use config::EngineConfig;
pub use db::{setup_database, SqliteStore};
pub use error::{RegistryError, Result};
pub use interval::{Bound, Instant, Interval, TransactionInterval, ValidityInterval};
pub use pagination::{Cursor, PageFilter, PageItem, Paginator, SortKey};
pub use resolver::{EntityView, ValidityResolver};
pub use store::{MemoryStore, RegistrationReader, RegistrationStore};
pub use timeline::{Change, Lifecycle, Registration, RegistrationSummary, RegistrationTimeline};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
