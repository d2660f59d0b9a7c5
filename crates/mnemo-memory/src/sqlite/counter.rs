//! Identifier allocator: a single counter row next to the records it numbers.

use super::SqliteCatalogue;
use crate::error::MemoryError;
use crate::types::NumericId;

pub const NUMERIC_ID_COUNTER: &str = "numeric_id";

impl SqliteCatalogue {
    /// Consume and return the next numeric id.
    ///
    /// The increment is one statement, so concurrent callers never observe the
    /// same value and the new counter value is durable once this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails or the counter row is missing.
    pub async fn next_numeric_id(&self) -> Result<NumericId, MemoryError> {
        let row: (i64,) = sqlx::query_as(
            "UPDATE counters SET value = value + 1 WHERE name = ? RETURNING value - 1",
        )
        .bind(NUMERIC_ID_COUNTER)
        .fetch_one(&self.pool)
        .await?;
        Ok(NumericId(row.0))
    }

    /// Return the id the next call to [`Self::next_numeric_id`] would hand out.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn peek_numeric_id(&self) -> Result<NumericId, MemoryError> {
        let row: (i64,) = sqlx::query_as("SELECT value FROM counters WHERE name = ?")
            .bind(NUMERIC_ID_COUNTER)
            .fetch_one(&self.pool)
            .await?;
        Ok(NumericId(row.0))
    }

    /// Raise the counter so it is strictly above `floor` and every stored id.
    ///
    /// Never lowers the counter. Used at startup so ids referenced only by the
    /// similarity index are not handed out again.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn ensure_counter_above(&self, floor: Option<NumericId>) -> Result<(), MemoryError> {
        let floor = floor.map_or(0, |id| id.0);
        sqlx::query(
            "UPDATE counters SET value = MAX(value, ? + 1, \
                 (SELECT COALESCE(MAX(numeric_id), 0) + 1 FROM records)) \
             WHERE name = ?",
        )
        .bind(floor)
        .bind(NUMERIC_ID_COUNTER)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    async fn catalogue() -> SqliteCatalogue {
        SqliteCatalogue::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn counter_starts_at_one() {
        let c = catalogue().await;
        assert_eq!(c.peek_numeric_id().await.unwrap(), NumericId(1));
        assert_eq!(c.next_numeric_id().await.unwrap(), NumericId(1));
        assert_eq!(c.next_numeric_id().await.unwrap(), NumericId(2));
        assert_eq!(c.peek_numeric_id().await.unwrap(), NumericId(3));
    }

    #[tokio::test]
    async fn concurrent_allocations_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.db");
        let c = SqliteCatalogue::open(path.to_str().unwrap()).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let c = c.clone();
            handles.push(tokio::spawn(async move { c.next_numeric_id().await.unwrap() }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            assert!(seen.insert(h.await.unwrap()));
        }
        assert_eq!(seen.len(), 16);
        assert_eq!(c.peek_numeric_id().await.unwrap(), NumericId(17));
    }

    #[tokio::test]
    async fn ensure_counter_above_raises_only() {
        let c = catalogue().await;
        c.ensure_counter_above(Some(NumericId(10))).await.unwrap();
        assert_eq!(c.peek_numeric_id().await.unwrap(), NumericId(11));
        c.ensure_counter_above(Some(NumericId(3))).await.unwrap();
        assert_eq!(c.peek_numeric_id().await.unwrap(), NumericId(11));
        c.ensure_counter_above(None).await.unwrap();
        assert_eq!(c.peek_numeric_id().await.unwrap(), NumericId(11));
    }

    #[tokio::test]
    async fn counter_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.db");
        let path = path.to_str().unwrap();
        {
            let c = SqliteCatalogue::open(path).await.unwrap();
            c.next_numeric_id().await.unwrap();
            c.next_numeric_id().await.unwrap();
            c.close().await;
        }
        let c = SqliteCatalogue::open(path).await.unwrap();
        assert_eq!(c.next_numeric_id().await.unwrap(), NumericId(3));
    }
}
