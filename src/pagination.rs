// Pagination Cursor - keyset paging pinned to one registration time
//
// A result set is only a stable partition for one fixed registration time.
// The cursor carries that time, and resuming with a different one is an
// error: entities registered between page fetches would otherwise appear
// or vanish across pages.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::algebra::EffectRow;
use crate::attributes::{AttributeSnapshot, AttributeTrack, EntityId, EntityKind};
use crate::config::EngineConfig;
use crate::error::{RegistryError, Result};
use crate::interval::{Bound, Instant, Interval};
use crate::resolver::ValidityResolver;
use crate::store::RegistrationReader;

// ============================================================================
// FILTER / ITEMS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct PageFilter {
    pub kind: Option<EntityKind>,
    pub track: AttributeTrack,
    /// Business-time window; rows are clipped to it
    pub range: Interval,
    pub registration_time: Option<Instant>,
}

impl PageFilter {
    pub fn new(track: AttributeTrack) -> Self {
        PageFilter {
            kind: None,
            track,
            range: Interval::unbounded(),
            registration_time: None,
        }
    }

    pub fn with_kind(mut self, kind: EntityKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_range(mut self, range: Interval) -> Self {
        self.range = range;
        self
    }

    pub fn at_registration_time(mut self, registration_time: Instant) -> Self {
        self.registration_time = Some(registration_time);
        self
    }
}

/// Stable ordering key: entity, then start of validity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SortKey {
    pub entity_id: EntityId,
    pub from: Bound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageItem {
    pub entity_id: EntityId,
    pub row: EffectRow<AttributeSnapshot>,
}

impl PageItem {
    pub fn sort_key(&self) -> SortKey {
        SortKey {
            entity_id: self.entity_id,
            from: self.row.validity.from(),
        }
    }
}

// ============================================================================
// CURSOR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    after: Option<SortKey>,
    registration_time: Instant,
    exhausted: bool,
}

impl Cursor {
    pub fn registration_time(&self) -> Instant {
        self.registration_time
    }

    /// Opaque, URL-safe token for the transport layer
    pub fn encode(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    pub fn decode(token: &str) -> Result<Cursor> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| RegistryError::InvalidCursor(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| RegistryError::InvalidCursor(e.to_string()))
    }
}

// ============================================================================
// PAGINATOR
// ============================================================================

pub struct Paginator<'a> {
    reader: &'a dyn RegistrationReader,
    resolver: ValidityResolver<'a>,
    max_page_size: usize,
}

impl<'a> Paginator<'a> {
    pub fn new(reader: &'a dyn RegistrationReader, config: &EngineConfig) -> Self {
        Paginator {
            reader,
            resolver: ValidityResolver::new(reader),
            max_page_size: config.max_page_size,
        }
    }

    /// First page. Without a registration time in the filter the iteration
    /// is pinned to `now`.
    pub fn open(
        &self,
        filter: &PageFilter,
        page_size: usize,
        now: Instant,
    ) -> Result<(Vec<PageItem>, Cursor)> {
        self.check_page_size(page_size)?;
        let pinned = filter.registration_time.unwrap_or(now);

        let (items, has_more) = self.fetch(filter, pinned, None, page_size)?;
        let cursor = Cursor {
            after: items.last().map(PageItem::sort_key),
            registration_time: pinned,
            exhausted: !has_more,
        };
        Ok((items, cursor))
    }

    /// Following page; `None` cursor once the result set is exhausted.
    /// A filter without registration time resumes on the cursor's pin.
    pub fn next(
        &self,
        cursor: &Cursor,
        filter: &PageFilter,
        page_size: usize,
    ) -> Result<(Vec<PageItem>, Option<Cursor>)> {
        if let Some(requested) = filter.registration_time {
            if requested != cursor.registration_time {
                return Err(RegistryError::RegistrationTimeChanged {
                    pinned: cursor.registration_time,
                    requested,
                });
            }
        }
        self.check_page_size(page_size)?;

        if cursor.exhausted {
            return Ok((Vec::new(), None));
        }

        let (items, has_more) =
            self.fetch(filter, cursor.registration_time, cursor.after, page_size)?;
        let next = has_more.then(|| Cursor {
            after: items.last().map(PageItem::sort_key),
            registration_time: cursor.registration_time,
            exhausted: false,
        });
        Ok((items, next))
    }

    fn check_page_size(&self, page_size: usize) -> Result<()> {
        if page_size == 0 || page_size > self.max_page_size {
            return Err(RegistryError::InvalidPageSize {
                requested: page_size,
                max: self.max_page_size,
            });
        }
        Ok(())
    }

    /// Up to `page_size` items strictly after `after`, plus whether any more
    /// exist
    fn fetch(
        &self,
        filter: &PageFilter,
        pinned: Instant,
        after: Option<SortKey>,
        page_size: usize,
    ) -> Result<(Vec<PageItem>, bool)> {
        let mut items = Vec::with_capacity(page_size);

        for id in self.reader.entity_ids(filter.kind)? {
            if after.is_some_and(|key| id < key.entity_id) {
                continue;
            }

            let rows = self
                .resolver
                .validities(id, filter.track, filter.range, Some(pinned))?;
            for row in rows {
                let item = PageItem { entity_id: id, row };
                if after.is_some_and(|key| item.sort_key() <= key) {
                    continue;
                }
                if items.len() == page_size {
                    debug!(returned = items.len(), "page filled");
                    return Ok((items, true));
                }
                items.push(item);
            }
        }

        debug!(returned = items.len(), "result set exhausted");
        Ok((items, false))
    }
}
