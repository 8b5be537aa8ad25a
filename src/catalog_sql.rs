//! Catalog source backed by the `products` table.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use index_release_core::catalog::CatalogSource;
use index_release_core::models::CatalogRecord;

use crate::db::from_ts;

/// Reads active products in id order.
pub struct SqlCatalogSource {
    pool: SqlitePool,
}

impl SqlCatalogSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn split_keywords(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl CatalogSource for SqlCatalogSource {
    async fn total(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products WHERE active = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn fetch(&self, offset: u64, limit: usize) -> Result<Vec<CatalogRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, brand, category, description, price, keywords, updated_at
            FROM products
            WHERE active = 1
            ORDER BY id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let keywords: String = row.get("keywords");
                let updated_at: Option<i64> = row.get("updated_at");
                CatalogRecord {
                    id: row.get("id"),
                    name: row.get("name"),
                    brand: row.get("brand"),
                    category: row.get("category"),
                    description: row.get("description"),
                    price: row.get("price"),
                    keywords: split_keywords(&keywords),
                    updated_at: updated_at.map(from_ts),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use sqlx::sqlite::SqlitePoolOptions;

    #[test]
    fn keywords_are_trimmed_and_split() {
        assert_eq!(
            split_keywords(" lamp, desk ,, light"),
            vec!["lamp".to_string(), "desk".to_string(), "light".to_string()]
        );
        assert!(split_keywords("").is_empty());
    }

    #[tokio::test]
    async fn pages_active_products_in_id_order() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        for (id, active) in [("c", 1), ("a", 1), ("b", 0), ("d", 1)] {
            sqlx::query("INSERT INTO products (id, name, active, keywords) VALUES (?, ?, ?, 'x,y')")
                .bind(id)
                .bind(format!("Product {}", id))
                .bind(active)
                .execute(&pool)
                .await
                .unwrap();
        }

        let source = SqlCatalogSource::new(pool);
        assert_eq!(source.total().await.unwrap(), 3);
        let first = source.fetch(0, 2).await.unwrap();
        assert_eq!(
            first.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
        assert_eq!(first[0].keywords, vec!["x".to_string(), "y".to_string()]);
        let rest = source.fetch(2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "d");
    }
}
