//! Source catalog abstraction.
//!
//! The indexing pipeline reads products page by page through
//! [`CatalogSource`]. The relational implementation lives in the app crate;
//! [`InMemoryCatalog`] serves tests and fixtures.

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::CatalogRecord;

/// Paginated read access to the product catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Total number of records a full build will read.
    async fn total(&self) -> Result<u64>;

    /// Read up to `limit` records starting at `offset`, in a stable order.
    async fn fetch(&self, offset: u64, limit: usize) -> Result<Vec<CatalogRecord>>;
}

/// Fixed, in-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    records: Vec<CatalogRecord>,
    fail_from_offset: Option<u64>,
}

impl InMemoryCatalog {
    pub fn new(records: Vec<CatalogRecord>) -> Self {
        Self {
            records,
            fail_from_offset: None,
        }
    }

    /// `count` records named `Product {n}` with ids `p{n}`.
    pub fn generated(count: usize) -> Self {
        Self::new(
            (0..count)
                .map(|n| CatalogRecord::named(format!("p{}", n), format!("Product {}", n)))
                .collect(),
        )
    }

    /// Make every fetch at or beyond `offset` fail.
    pub fn failing_from(mut self, offset: u64) -> Self {
        self.fail_from_offset = Some(offset);
        self
    }
}

#[async_trait]
impl CatalogSource for InMemoryCatalog {
    async fn total(&self) -> Result<u64> {
        Ok(self.records.len() as u64)
    }

    async fn fetch(&self, offset: u64, limit: usize) -> Result<Vec<CatalogRecord>> {
        if let Some(fail) = self.fail_from_offset {
            if offset >= fail {
                bail!("catalog read failed at offset {}", offset);
            }
        }
        Ok(self
            .records
            .iter()
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .collect())
    }
}
