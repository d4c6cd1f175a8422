//! Spike event repository

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};

use super::{Page, RepoError};
use crate::core_types::EventId;
use crate::models::{SpikeEvent, SpikeEventStatus};

/// Sort column for event listings. A closed enum so user input can
/// never reach the SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventSort {
    #[default]
    StartAt,
    CreatedAt,
    SpikePrice,
}

impl EventSort {
    fn column(&self) -> &'static str {
        match self {
            EventSort::StartAt => "start_at",
            EventSort::CreatedAt => "created_at",
            EventSort::SpikePrice => "spike_price",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start_at" => Some(EventSort::StartAt),
            "created_at" => Some(EventSort::CreatedAt),
            "spike_price" => Some(EventSort::SpikePrice),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    fn keyword(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "asc" => Some(SortOrder::Asc),
            "desc" => Some(SortOrder::Desc),
            _ => None,
        }
    }
}

const EVENT_COLUMNS: &str = "id, product_id, spike_price, original_price, spike_stock, \
     sold_count, start_at, end_at, status, created_at, updated_at";

/// Spike event persistence.
pub struct SpikeEventRepository;

impl SpikeEventRepository {
    pub async fn get(pool: &PgPool, id: EventId) -> Result<Option<SpikeEvent>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM spike_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;

        row.map(|r| row_to_event(&r)).transpose()
    }

    /// Row-locked read for use inside a reconciliation transaction.
    pub async fn get_for_update(
        conn: &mut PgConnection,
        id: EventId,
    ) -> Result<Option<SpikeEvent>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM spike_events WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(conn)
        .await?;

        row.map(|r| row_to_event(&r)).transpose()
    }

    /// Active events, paged. The live remaining count comes from the
    /// fast store, not from here.
    pub async fn list_active(
        pool: &PgPool,
        page: Page,
        sort: EventSort,
        order: SortOrder,
    ) -> Result<Vec<SpikeEvent>, RepoError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM spike_events \
             WHERE status = $1 AND end_at > NOW() \
             ORDER BY {} {} LIMIT $2 OFFSET $3",
            sort.column(),
            order.keyword()
        );
        let rows = sqlx::query(&sql)
            .bind(SpikeEventStatus::Active.id())
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(pool)
            .await?;

        rows.iter().map(row_to_event).collect()
    }

    pub async fn count_active(pool: &PgPool) -> Result<i64, RepoError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM spike_events WHERE status = $1 AND end_at > NOW()",
        )
        .bind(SpikeEventStatus::Active.id())
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    /// Guarded sold-count increment. The guard is the authoritative
    /// oversell barrier: zero rows affected means admitting `n` more
    /// would exceed `spike_stock`.
    pub async fn increment_sold_count(
        conn: &mut PgConnection,
        id: EventId,
        n: i64,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE spike_events \
             SET sold_count = sold_count + $1, updated_at = NOW() \
             WHERE id = $2 AND sold_count + $1 <= spike_stock",
        )
        .bind(n)
        .bind(id)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::Conflict(format!(
                "sold_count increment by {} would oversell event {}",
                n, id
            )));
        }
        Ok(())
    }

    /// Guarded sold-count decrement for compensation. Returns false
    /// when the count was already below `n` (prior restore won).
    pub async fn decrement_sold_count(
        conn: &mut PgConnection,
        id: EventId,
        n: i64,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE spike_events \
             SET sold_count = sold_count - $1, updated_at = NOW() \
             WHERE id = $2 AND sold_count >= $1",
        )
        .bind(n)
        .bind(id)
        .execute(conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_status(
        pool: &PgPool,
        id: EventId,
        status: SpikeEventStatus,
    ) -> Result<(), RepoError> {
        let result =
            sqlx::query("UPDATE spike_events SET status = $1, updated_at = NOW() WHERE id = $2")
                .bind(status.id())
                .bind(id)
                .execute(pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(format!("spike event {}", id)));
        }
        Ok(())
    }
}

fn row_to_event(row: &PgRow) -> Result<SpikeEvent, RepoError> {
    let status_id: i16 = row.get("status");
    let status = SpikeEventStatus::from_id(status_id)
        .ok_or_else(|| RepoError::Database(format!("unknown spike event status {}", status_id)))?;

    Ok(SpikeEvent {
        id: row.get("id"),
        product_id: row.get("product_id"),
        spike_price: row.get("spike_price"),
        original_price: row.get("original_price"),
        spike_stock: row.get("spike_stock"),
        sold_count: row.get("sold_count"),
        start_at: row.get::<DateTime<Utc>, _>("start_at"),
        end_at: row.get::<DateTime<Utc>, _>("end_at"),
        status,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_parse() {
        assert_eq!(EventSort::parse("start_at"), Some(EventSort::StartAt));
        assert_eq!(EventSort::parse("spike_price"), Some(EventSort::SpikePrice));
        assert_eq!(EventSort::parse("id; DROP TABLE"), None);

        assert_eq!(SortOrder::parse("desc"), Some(SortOrder::Desc));
        assert_eq!(SortOrder::parse("DESC"), None);
    }

    #[test]
    fn test_sort_columns_are_whitelisted() {
        assert_eq!(EventSort::StartAt.column(), "start_at");
        assert_eq!(EventSort::CreatedAt.column(), "created_at");
        assert_eq!(EventSort::SpikePrice.column(), "spike_price");
        assert_eq!(SortOrder::Asc.keyword(), "ASC");
    }
}
