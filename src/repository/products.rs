//! Product repository (read-only)
//!
//! Product CRUD belongs to an external collaborator; the spike core
//! only reads rows for event detail responses and message payloads.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::RepoError;
use crate::core_types::ProductId;
use crate::models::Product;

const PRODUCT_COLUMNS: &str = "id, name, sku, price, status";

pub struct ProductRepository;

impl ProductRepository {
    pub async fn get(pool: &PgPool, id: ProductId) -> Result<Option<Product>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(|r| row_to_product(&r)))
    }

    pub async fn get_by_sku(pool: &PgPool, sku: &str) -> Result<Option<Product>, RepoError> {
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE sku = $1"
        ))
        .bind(sku)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(|r| row_to_product(&r)))
    }
}

fn row_to_product(row: &PgRow) -> Product {
    Product {
        id: row.get("id"),
        name: row.get("name"),
        sku: row.get("sku"),
        price: row.get("price"),
        status: row.get("status"),
    }
}
