use std::collections::{BTreeSet, HashMap};

use sqlx::{Sqlite, Transaction};

use super::SqliteCatalogue;
use crate::error::MemoryError;
use crate::types::{NumericId, StoredRecord};

/// SQLite caps bound parameters per statement; stay well below it.
const MAX_BINDS: usize = 500;

const RECORD_COLUMNS: &str = "numeric_id, stable_id, conversation_id, role, content, timestamp";

type RecordRow = (i64, String, String, String, String, String);

/// Serialize a vector as little-endian `f32` bytes.
#[must_use]
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Inverse of [`encode_embedding`]. Returns `None` if the blob length is not a
/// multiple of four.
#[must_use]
pub fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn into_record(row: RecordRow, tags: BTreeSet<String>) -> StoredRecord {
    let (numeric_id, stable_id, conversation_id, role, content, timestamp) = row;
    StoredRecord {
        stable_id,
        numeric_id: NumericId(numeric_id),
        conversation_id,
        role,
        content,
        timestamp,
        tags,
    }
}

fn decode_row(numeric_id: i64, blob: &[u8]) -> Result<(NumericId, Vec<f32>), MemoryError> {
    decode_embedding(blob)
        .map(|v| (NumericId(numeric_id), v))
        .ok_or(MemoryError::CorruptEmbedding {
            numeric_id: NumericId(numeric_id),
        })
}

async fn insert_tags(
    tx: &mut Transaction<'_, Sqlite>,
    numeric_id: NumericId,
    tags: &BTreeSet<String>,
) -> Result<(), MemoryError> {
    for tag in tags {
        sqlx::query("INSERT OR IGNORE INTO record_tags (numeric_id, tag) VALUES (?, ?)")
            .bind(numeric_id)
            .bind(tag)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

impl SqliteCatalogue {
    /// Fetch a record by its stable id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get(&self, stable_id: &str) -> Result<Option<StoredRecord>, MemoryError> {
        let row: Option<RecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE stable_id = ?"
        ))
        .bind(stable_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut tags = self.tags_for(&[row.0]).await?;
        let record_tags = tags.remove(&row.0).unwrap_or_default();
        Ok(Some(into_record(row, record_tags)))
    }

    /// Fetch a record by its numeric id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_by_numeric_id(
        &self,
        numeric_id: NumericId,
    ) -> Result<Option<StoredRecord>, MemoryError> {
        let mut map = self.batch_get(&[numeric_id]).await?;
        Ok(map.remove(&numeric_id))
    }

    /// Fetch every record whose numeric id is in `ids`. Unknown ids are absent
    /// from the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn batch_get(
        &self,
        ids: &[NumericId],
    ) -> Result<HashMap<NumericId, StoredRecord>, MemoryError> {
        let mut rows: Vec<RecordRow> = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_BINDS) {
            let query = format!(
                "SELECT {RECORD_COLUMNS} FROM records WHERE numeric_id IN ({})",
                placeholders(chunk.len())
            );
            let mut q = sqlx::query_as::<_, RecordRow>(&query);
            for id in chunk {
                q = q.bind(id.0);
            }
            rows.extend(q.fetch_all(&self.pool).await?);
        }
        self.attach_tags(rows)
            .await
            .map(|records| records.into_iter().map(|r| (r.numeric_id, r)).collect())
    }

    /// Insert a new record with its tags and normalized embedding in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the stable id or numeric id already exists, or the
    /// write fails. Nothing is written in that case.
    pub async fn insert(
        &self,
        record: &StoredRecord,
        embedding: &[f32],
        embedding_model: &str,
    ) -> Result<(), MemoryError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO records \
             (numeric_id, stable_id, conversation_id, role, content, timestamp, embedding, embedding_model) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.numeric_id)
        .bind(&record.stable_id)
        .bind(&record.conversation_id)
        .bind(&record.role)
        .bind(&record.content)
        .bind(&record.timestamp)
        .bind(encode_embedding(embedding))
        .bind(embedding_model)
        .execute(&mut *tx)
        .await?;
        insert_tags(&mut tx, record.numeric_id, &record.tags).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Overwrite the row and tag set of an existing record, keeping its ids.
    ///
    /// # Errors
    ///
    /// Returns an error if no row matches both ids or the write fails.
    pub async fn overwrite(
        &self,
        record: &StoredRecord,
        embedding: &[f32],
        embedding_model: &str,
    ) -> Result<(), MemoryError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE records SET conversation_id = ?, role = ?, content = ?, timestamp = ?, \
             embedding = ?, embedding_model = ?, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
             WHERE numeric_id = ? AND stable_id = ?",
        )
        .bind(&record.conversation_id)
        .bind(&record.role)
        .bind(&record.content)
        .bind(&record.timestamp)
        .bind(encode_embedding(embedding))
        .bind(embedding_model)
        .bind(record.numeric_id)
        .bind(&record.stable_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() != 1 {
            return Err(MemoryError::Other(format!(
                "no catalogue row for {} / {}",
                record.stable_id, record.numeric_id
            )));
        }
        sqlx::query("DELETE FROM record_tags WHERE numeric_id = ?")
            .bind(record.numeric_id)
            .execute(&mut *tx)
            .await?;
        insert_tags(&mut tx, record.numeric_id, &record.tags).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Records carrying exactly `tag`, most recently added first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_by_tag(
        &self,
        tag: &str,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, MemoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<RecordRow> = sqlx::query_as(
            "SELECT r.numeric_id, r.stable_id, r.conversation_id, r.role, r.content, r.timestamp \
             FROM records r \
             JOIN record_tags t ON t.numeric_id = r.numeric_id \
             WHERE t.tag = ? \
             ORDER BY r.numeric_id DESC \
             LIMIT ?",
        )
        .bind(tag)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        self.attach_tags(rows).await
    }

    /// The `limit` most recent records of a conversation, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_by_conversation(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, MemoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM (\
                SELECT {RECORD_COLUMNS} FROM records \
                WHERE conversation_id = ? \
                ORDER BY numeric_id DESC \
                LIMIT ?\
             ) ORDER BY numeric_id ASC"
        ))
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        self.attach_tags(rows).await
    }

    /// Delete every record of a conversation. Returns the numeric ids removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<NumericId>, MemoryError> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("DELETE FROM records WHERE conversation_id = ? RETURNING numeric_id")
                .bind(conversation_id)
                .fetch_all(&self.pool)
                .await?;
        let mut ids: Vec<NumericId> = rows.into_iter().map(|r| NumericId(r.0)).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Delete a record and its tags. Returns the numeric id it held.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete(&self, stable_id: &str) -> Result<Option<NumericId>, MemoryError> {
        let row: Option<(i64,)> =
            sqlx::query_as("DELETE FROM records WHERE stable_id = ? RETURNING numeric_id")
                .bind(stable_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| NumericId(r.0)))
    }

    /// Delete every record and tag. The numeric id counter is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn clear(&self) -> Result<u64, MemoryError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM record_tags")
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM records")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed)
    }

    /// Number of live records.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count(&self) -> Result<usize, MemoryError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(row.0)?)
    }

    /// Numeric ids of all live records, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn numeric_ids(&self) -> Result<Vec<NumericId>, MemoryError> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT numeric_id FROM records ORDER BY numeric_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| NumericId(r.0)).collect())
    }

    /// Stored embeddings with numeric id greater than `after`, ascending, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored blob is malformed.
    pub async fn embeddings_page(
        &self,
        after: Option<NumericId>,
        limit: usize,
    ) -> Result<Vec<(NumericId, Vec<f32>)>, MemoryError> {
        let after = after.map_or(i64::MIN, |id| id.0);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(i64, Vec<u8>)> = sqlx::query_as(
            "SELECT numeric_id, embedding FROM records \
             WHERE numeric_id > ? ORDER BY numeric_id LIMIT ?",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|(id, blob)| decode_row(*id, blob)).collect()
    }

    /// Stored embeddings for the given ids. Unknown ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored blob is malformed.
    pub async fn embeddings_for(
        &self,
        ids: &[NumericId],
    ) -> Result<Vec<(NumericId, Vec<f32>)>, MemoryError> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_BINDS) {
            let query = format!(
                "SELECT numeric_id, embedding FROM records WHERE numeric_id IN ({}) \
                 ORDER BY numeric_id",
                placeholders(chunk.len())
            );
            let mut q = sqlx::query_as::<_, (i64, Vec<u8>)>(&query);
            for id in chunk {
                q = q.bind(id.0);
            }
            for (id, blob) in q.fetch_all(&self.pool).await? {
                out.push(decode_row(id, &blob)?);
            }
        }
        Ok(out)
    }

    async fn tags_for(&self, ids: &[i64]) -> Result<HashMap<i64, BTreeSet<String>>, MemoryError> {
        let mut tags: HashMap<i64, BTreeSet<String>> = HashMap::new();
        for chunk in ids.chunks(MAX_BINDS) {
            let query = format!(
                "SELECT numeric_id, tag FROM record_tags WHERE numeric_id IN ({})",
                placeholders(chunk.len())
            );
            let mut q = sqlx::query_as::<_, (i64, String)>(&query);
            for id in chunk {
                q = q.bind(*id);
            }
            for (id, tag) in q.fetch_all(&self.pool).await? {
                tags.entry(id).or_default().insert(tag);
            }
        }
        Ok(tags)
    }

    async fn attach_tags(&self, rows: Vec<RecordRow>) -> Result<Vec<StoredRecord>, MemoryError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = rows.iter().map(|r| r.0).collect();
        let mut tags = self.tags_for(&ids).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let record_tags = tags.remove(&row.0).unwrap_or_default();
                into_record(row, record_tags)
            })
            .collect())
    }
}
