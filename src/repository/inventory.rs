//! Inventory repository
//!
//! Two locking disciplines on the same row, chosen per operation:
//! full-row updates ride the optimistic `version` column; counter
//! arithmetic uses conditional UPDATEs whose WHERE clause carries the
//! business guard. Both report zero rows affected as `Conflict`.

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};

use super::RepoError;
use crate::core_types::{InventoryId, ProductId};
use crate::models::Inventory;

const INVENTORY_COLUMNS: &str =
    "id, product_id, stock, reserved_stock, sold_stock, reorder_point, max_stock, version";

pub struct InventoryRepository;

impl InventoryRepository {
    pub async fn get_by_id(pool: &PgPool, id: InventoryId) -> Result<Option<Inventory>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventory WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;

        row.map(|r| row_to_inventory(&r)).transpose()
    }

    pub async fn get_by_product(
        pool: &PgPool,
        product_id: ProductId,
    ) -> Result<Option<Inventory>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT {INVENTORY_COLUMNS} FROM inventory WHERE product_id = $1"
        ))
        .bind(product_id)
        .fetch_optional(pool)
        .await?;

        row.map(|r| row_to_inventory(&r)).transpose()
    }

    /// Optimistic full-row update: succeeds only when the caller still
    /// holds the current version, and bumps it.
    pub async fn update_with_version(
        conn: &mut PgConnection,
        inventory: &Inventory,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE inventory \
             SET stock = $1, reserved_stock = $2, sold_stock = $3, \
                 reorder_point = $4, max_stock = $5, version = version + 1 \
             WHERE id = $6 AND version = $7",
        )
        .bind(inventory.stock)
        .bind(inventory.reserved_stock)
        .bind(inventory.sold_stock)
        .bind(inventory.reorder_point)
        .bind(inventory.max_stock)
        .bind(inventory.id)
        .bind(inventory.version)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::Conflict(format!(
                "inventory {} version {} is stale",
                inventory.id, inventory.version
            )));
        }
        Ok(())
    }

    /// Move `n` units from stock to sold. The WHERE guard makes the
    /// deduction and the availability check one atomic statement.
    pub async fn consume_stock(
        conn: &mut PgConnection,
        product_id: ProductId,
        n: i64,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE inventory \
             SET stock = stock - $1, sold_stock = sold_stock + $1, version = version + 1 \
             WHERE product_id = $2 AND stock >= $1",
        )
        .bind(n)
        .bind(product_id)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::Conflict(format!(
                "insufficient stock to consume {} of product {}",
                n, product_id
            )));
        }
        Ok(())
    }

    /// Single signed adjustment entry point. Positive delta restores,
    /// negative deducts; the guard keeps stock non-negative either way.
    pub async fn adjust_stock(
        conn: &mut PgConnection,
        product_id: ProductId,
        delta: i64,
        reason: &str,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE inventory \
             SET stock = stock + $1, \
                 sold_stock = GREATEST(sold_stock - $1, 0), \
                 version = version + 1 \
             WHERE product_id = $2 AND stock + $1 >= 0",
        )
        .bind(delta)
        .bind(product_id)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::Conflict(format!(
                "adjust of {} on product {} rejected ({})",
                delta, product_id, reason
            )));
        }

        tracing::debug!(product_id, delta, reason, "inventory adjusted");
        Ok(())
    }

    /// Reserve `n` units: only succeeds while unreserved stock covers
    /// the request.
    pub async fn reserve(
        conn: &mut PgConnection,
        product_id: ProductId,
        n: i64,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE inventory \
             SET reserved_stock = reserved_stock + $1, version = version + 1 \
             WHERE product_id = $2 AND stock - reserved_stock >= $1",
        )
        .bind(n)
        .bind(product_id)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::Conflict(format!(
                "cannot reserve {} of product {}",
                n, product_id
            )));
        }
        Ok(())
    }

    /// Release a reservation made by `reserve`.
    pub async fn release(
        conn: &mut PgConnection,
        product_id: ProductId,
        n: i64,
    ) -> Result<(), RepoError> {
        let result = sqlx::query(
            "UPDATE inventory \
             SET reserved_stock = reserved_stock - $1, version = version + 1 \
             WHERE product_id = $2 AND reserved_stock >= $1",
        )
        .bind(n)
        .bind(product_id)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::Conflict(format!(
                "cannot release {} of product {}",
                n, product_id
            )));
        }
        Ok(())
    }

    /// Adjust several products inside one transaction; all-or-nothing.
    pub async fn adjust_stock_batch(
        pool: &PgPool,
        adjustments: &[(ProductId, i64)],
        reason: &str,
    ) -> Result<(), RepoError> {
        let mut tx = pool.begin().await.map_err(RepoError::from)?;
        for &(product_id, delta) in adjustments {
            Self::adjust_stock(&mut *tx, product_id, delta, reason).await?;
        }
        tx.commit().await.map_err(RepoError::from)?;
        Ok(())
    }
}

fn row_to_inventory(row: &PgRow) -> Result<Inventory, RepoError> {
    Ok(Inventory {
        id: row.get("id"),
        product_id: row.get("product_id"),
        stock: row.get("stock"),
        reserved_stock: row.get("reserved_stock"),
        sold_stock: row.get("sold_stock"),
        reorder_point: row.get("reorder_point"),
        max_stock: row.get("max_stock"),
        version: row.get("version"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::Database;

    // These tests require a running PostgreSQL instance with the
    // inventory table present.

    async fn pool() -> PgPool {
        Database::connect(&DatabaseConfig::default())
            .await
            .expect("postgres must be running")
            .pool()
            .clone()
    }

    async fn seed(pool: &PgPool, stock: i64) -> i64 {
        let product_id: i64 = sqlx::query_scalar(
            "INSERT INTO products (name, sku, price) VALUES ('t', $1, 10) RETURNING id",
        )
        .bind(format!("SKU-{}", uuid::Uuid::new_v4()))
        .fetch_one(pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO inventory (product_id, stock, max_stock) VALUES ($1, $2, $2)")
            .bind(product_id)
            .bind(stock)
            .execute(pool)
            .await
            .unwrap();
        product_id
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_consume_stock_guard() {
        let pool = pool().await;
        let product_id = seed(&pool, 3).await;
        let mut conn = pool.acquire().await.unwrap();

        InventoryRepository::consume_stock(&mut *conn, product_id, 2)
            .await
            .unwrap();

        // Only one unit left; consuming two must surface a conflict.
        let over = InventoryRepository::consume_stock(&mut *conn, product_id, 2).await;
        assert!(matches!(over, Err(RepoError::Conflict(_))));

        let row = InventoryRepository::get_by_product(&pool, product_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.stock, 1);
        assert_eq!(row.sold_stock, 2);
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_optimistic_version_conflict() {
        let pool = pool().await;
        let product_id = seed(&pool, 5).await;
        let mut conn = pool.acquire().await.unwrap();

        let mut first = InventoryRepository::get_by_product(&pool, product_id)
            .await
            .unwrap()
            .unwrap();
        let second = first.clone();

        first.reorder_point = 2;
        InventoryRepository::update_with_version(&mut *conn, &first)
            .await
            .unwrap();

        // `second` still holds the old version: its write must lose.
        let stale = InventoryRepository::update_with_version(&mut *conn, &second).await;
        assert!(matches!(stale, Err(RepoError::Conflict(_))));
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_adjust_stock_signed_guard() {
        let pool = pool().await;
        let product_id = seed(&pool, 4).await;
        let mut conn = pool.acquire().await.unwrap();

        InventoryRepository::adjust_stock(&mut *conn, product_id, -3, "shrinkage")
            .await
            .unwrap();
        let below_zero =
            InventoryRepository::adjust_stock(&mut *conn, product_id, -2, "shrinkage").await;
        assert!(matches!(below_zero, Err(RepoError::Conflict(_))));

        InventoryRepository::adjust_stock(&mut *conn, product_id, 3, "restock")
            .await
            .unwrap();
        let row = InventoryRepository::get_by_product(&pool, product_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.stock, 4);
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_reserve_release_cycle() {
        let pool = pool().await;
        let product_id = seed(&pool, 2).await;
        let mut conn = pool.acquire().await.unwrap();

        InventoryRepository::reserve(&mut *conn, product_id, 2)
            .await
            .unwrap();
        let over = InventoryRepository::reserve(&mut *conn, product_id, 1).await;
        assert!(matches!(over, Err(RepoError::Conflict(_))));

        InventoryRepository::release(&mut *conn, product_id, 2)
            .await
            .unwrap();
        let row = InventoryRepository::get_by_product(&pool, product_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.reserved_stock, 0);
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_batch_adjust_is_atomic() {
        let pool = pool().await;
        let a = seed(&pool, 5).await;
        let b = seed(&pool, 1).await;

        // Second adjustment violates its guard; the first must roll back.
        let result =
            InventoryRepository::adjust_stock_batch(&pool, &[(a, -2), (b, -3)], "batch out").await;
        assert!(matches!(result, Err(RepoError::Conflict(_))));

        let row = InventoryRepository::get_by_product(&pool, a)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.stock, 5, "batch must be all-or-nothing");
    }
}
