//! Redis read-through cache over the inventory and product repos
//!
//! Reads try the cache first and fall through to Postgres; writes only
//! invalidate. The cache is deliberately never populated on write:
//! under concurrent mutation a write-populate can pin a stale row for
//! a full TTL, whereas invalidate-then-read-through cannot.

use std::time::Duration;

use sqlx::PgPool;

use super::{InventoryRepository, ProductRepository, RepoError};
use crate::core_types::{InventoryId, ProductId};
use crate::kv::Kv;
use crate::models::{Inventory, Product};

pub fn inventory_id_key(id: InventoryId) -> String {
    format!("inventory:id:{}", id)
}

pub fn inventory_product_key(product_id: ProductId) -> String {
    format!("inventory:product:{}", product_id)
}

pub fn product_id_key(id: ProductId) -> String {
    format!("product:id:{}", id)
}

pub fn product_sku_key(sku: &str) -> String {
    format!("product:sku:{}", sku)
}

/// Inventory/product reads with a Redis cache in front.
#[derive(Clone)]
pub struct CachedInventoryRepository {
    kv: Kv,
    ttl: Duration,
}

impl CachedInventoryRepository {
    pub fn new(kv: Kv, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    async fn cache_get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.kv.get_string(key).await {
            Ok(Some(json)) => serde_json::from_str(&json).ok(),
            Ok(None) => None,
            Err(e) => {
                // A broken cache degrades to the database, nothing more.
                tracing::warn!(key, error = %e, "cache read failed");
                None
            }
        }
    }

    async fn cache_put<T: serde::Serialize>(&self, key: &str, value: &T) {
        if let Ok(json) = serde_json::to_string(value) {
            if let Err(e) = self.kv.set_ex(key, &json, self.ttl).await {
                tracing::warn!(key, error = %e, "cache write failed");
            }
        }
    }

    pub async fn get_inventory_by_id(
        &self,
        pool: &PgPool,
        id: InventoryId,
    ) -> Result<Option<Inventory>, RepoError> {
        let key = inventory_id_key(id);
        if let Some(hit) = self.cache_get::<Inventory>(&key).await {
            return Ok(Some(hit));
        }

        let row = InventoryRepository::get_by_id(pool, id).await?;
        if let Some(ref inventory) = row {
            self.cache_put(&key, inventory).await;
        }
        Ok(row)
    }

    pub async fn get_inventory_by_product(
        &self,
        pool: &PgPool,
        product_id: ProductId,
    ) -> Result<Option<Inventory>, RepoError> {
        let key = inventory_product_key(product_id);
        if let Some(hit) = self.cache_get::<Inventory>(&key).await {
            return Ok(Some(hit));
        }

        let row = InventoryRepository::get_by_product(pool, product_id).await?;
        if let Some(ref inventory) = row {
            self.cache_put(&key, inventory).await;
        }
        Ok(row)
    }

    pub async fn get_product(
        &self,
        pool: &PgPool,
        id: ProductId,
    ) -> Result<Option<Product>, RepoError> {
        let key = product_id_key(id);
        if let Some(hit) = self.cache_get::<Product>(&key).await {
            return Ok(Some(hit));
        }

        let row = ProductRepository::get(pool, id).await?;
        if let Some(ref product) = row {
            self.cache_put(&key, product).await;
        }
        Ok(row)
    }

    pub async fn get_product_by_sku(
        &self,
        pool: &PgPool,
        sku: &str,
    ) -> Result<Option<Product>, RepoError> {
        let key = product_sku_key(sku);
        if let Some(hit) = self.cache_get::<Product>(&key).await {
            return Ok(Some(hit));
        }

        let row = ProductRepository::get_by_sku(pool, sku).await?;
        if let Some(ref product) = row {
            self.cache_put(&key, product).await;
        }
        Ok(row)
    }

    /// Drop the cache entries for one inventory row. Call after any
    /// write that touched it; the next read repopulates from Postgres.
    pub async fn invalidate_inventory(&self, id: InventoryId, product_id: ProductId) {
        let keys = [inventory_id_key(id), inventory_product_key(product_id)];
        if let Err(e) = self.kv.del(&keys).await {
            tracing::warn!(error = %e, "inventory cache invalidation failed");
        }
    }

    /// Variant for writers that only know the product id (conditional
    /// UPDATEs); the id-keyed entry ages out by TTL.
    pub async fn invalidate_inventory_by_product(&self, product_id: ProductId) {
        let keys = [inventory_product_key(product_id)];
        if let Err(e) = self.kv.del(&keys).await {
            tracing::warn!(error = %e, "inventory cache invalidation failed");
        }
    }

    pub async fn invalidate_product(&self, id: ProductId, sku: &str) {
        let keys = [product_id_key(id), product_sku_key(sku)];
        if let Err(e) = self.kv.del(&keys).await {
            tracing::warn!(error = %e, "product cache invalidation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_layout() {
        assert_eq!(inventory_id_key(3), "inventory:id:3");
        assert_eq!(inventory_product_key(9), "inventory:product:9");
        assert_eq!(product_id_key(5), "product:id:5");
        assert_eq!(product_sku_key("SKU-1"), "product:sku:SKU-1");
    }
}
