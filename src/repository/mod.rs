//! Repository layer for the relational store
//!
//! Strongly typed access with bound parameters only. Two concurrency
//! patterns, both surfacing zero-rows-affected as a typed conflict:
//!
//! - optimistic locking on `inventory.version` for full-row updates;
//! - conditional UPDATEs with inline guards (`WHERE stock >= $n`) for
//!   counter arithmetic, so no application-level lock is ever taken.

pub mod cached;
pub mod events;
pub mod inventory;
pub mod orders;
pub mod products;

pub use self::cached::CachedInventoryRepository;
pub use events::{EventSort, SortOrder, SpikeEventRepository};
pub use inventory::InventoryRepository;
pub use orders::{NewSpikeOrder, OrderStats, SpikeOrderRepository};
pub use products::ProductRepository;

use thiserror::Error;

/// Repository errors. `Conflict` and `Duplicate` are not failures for
/// most callers: consumers treat them as "already done".
#[derive(Error, Debug, Clone)]
pub enum RepoError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic version mismatch or a guarded UPDATE touching zero
    /// rows.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unique constraint rejected the write.
    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            // 23505 = unique_violation
            if db.code().as_deref() == Some("23505") {
                return RepoError::Duplicate(db.message().to_string());
            }
        }
        RepoError::Database(e.to_string())
    }
}

/// 1-based pagination with a hard page-size cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Page {
    pub const MAX_PAGE_SIZE: u32 = 100;

    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    pub fn limit(&self) -> i64 {
        self.page_size as i64
    }

    pub fn offset(&self) -> i64 {
        ((self.page - 1) as i64) * self.page_size as i64
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_clamps() {
        let page = Page::new(0, 1000);
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, Page::MAX_PAGE_SIZE);
        assert_eq!(page.offset(), 0);

        let page = Page::new(3, 25);
        assert_eq!(page.limit(), 25);
        assert_eq!(page.offset(), 50);
    }
}
