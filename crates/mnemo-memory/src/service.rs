//! Memory service: keeps the similarity index and the catalogue consistent.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{MutexGuard, PoisonError};

use mnemo_llm::{EmbeddingProvider, LlmError};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::error::MemoryError;
use crate::index::{FlatIndex, IndexError, LoadOutcome, SimilarityIndex, normalize};
use crate::sqlite::SqliteCatalogue;
use crate::types::{
    AddOutcome, AddStatus, MemoryHit, NewRecord, NumericId, StoredRecord, normalize_tags,
    now_timestamp,
};

const REBUILD_PAGE: usize = 1000;
const PERSIST_ATTEMPTS: u32 = 2;

/// Where a [`MemoryService`] keeps its files.
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    pub data_dir: PathBuf,
    pub index_file: String,
    pub catalogue_file: String,
}

impl MemoryOptions {
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            index_file: "index.mnix".into(),
            catalogue_file: "catalogue.db".into(),
        }
    }

    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.index_file)
    }

    #[must_use]
    pub fn catalogue_path(&self) -> PathBuf {
        self.data_dir.join(&self.catalogue_file)
    }
}

/// How the similarity index came up at [`MemoryService::open`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum IndexStatus {
    /// No persisted index existed.
    Fresh,
    Loaded { entries: usize },
    /// The persisted index could not be read; the service started empty.
    /// [`MemoryService::rebuild`] restores it from the catalogue.
    Recovered { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub index_entries: usize,
    pub catalogue_rows: usize,
    pub next_numeric_id: NumericId,
    pub dimension: Option<usize>,
    pub index_dirty: bool,
    pub pending_repairs: Vec<NumericId>,
    pub index_status: IndexStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub orphans_removed: usize,
    pub missing_restored: usize,
    pub rebuilt: bool,
}

pub struct MemoryService<P: EmbeddingProvider> {
    index: Box<dyn SimilarityIndex>,
    catalogue: SqliteCatalogue,
    provider: P,
    index_path: PathBuf,
    status: IndexStatus,
    writer: Mutex<()>,
    gate: RwLock<()>,
    dirty: AtomicBool,
    pending_repairs: std::sync::Mutex<BTreeSet<NumericId>>,
}

impl<P: EmbeddingProvider> std::fmt::Debug for MemoryService<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryService")
            .field("provider", &self.provider.name())
            .field("index_path", &self.index_path)
            .field("index_entries", &self.index.len())
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl<P: EmbeddingProvider> MemoryService<P> {
    /// Open the store under `options.data_dir` with the exact [`FlatIndex`] backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory or catalogue cannot be opened.
    /// An unreadable index file is not an error; see [`IndexStatus::Recovered`].
    pub async fn open(options: MemoryOptions, provider: P) -> Result<Self, MemoryError> {
        Self::with_index(options, provider, Box::new(FlatIndex::new())).await
    }

    /// Open the store with a caller-supplied index backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory or catalogue cannot be opened.
    pub async fn with_index(
        options: MemoryOptions,
        provider: P,
        index: Box<dyn SimilarityIndex>,
    ) -> Result<Self, MemoryError> {
        tokio::fs::create_dir_all(&options.data_dir).await?;

        let catalogue_path = options.catalogue_path();
        let catalogue_path = catalogue_path.to_str().ok_or_else(|| {
            MemoryError::Other(format!(
                "catalogue path is not valid UTF-8: {}",
                catalogue_path.display()
            ))
        })?;
        let catalogue = SqliteCatalogue::open(catalogue_path).await?;

        let index_path = options.index_path();
        let status = match index.load(&index_path).await {
            Ok(LoadOutcome::Missing) => IndexStatus::Fresh,
            Ok(LoadOutcome::Loaded { entries }) => IndexStatus::Loaded { entries },
            Err(e) => {
                tracing::warn!(
                    path = %index_path.display(),
                    "similarity index unreadable, starting empty: {e}"
                );
                index.clear();
                IndexStatus::Recovered {
                    reason: e.to_string(),
                }
            }
        };

        catalogue
            .ensure_counter_above(index.ids().into_iter().max())
            .await?;

        let rows = catalogue.count().await?;
        if rows != index.len() {
            tracing::warn!(
                index_entries = index.len(),
                catalogue_rows = rows,
                "similarity index and catalogue disagree; run reconcile or rebuild"
            );
        }
        tracing::info!(
            data_dir = %options.data_dir.display(),
            provider = provider.name(),
            records = rows,
            "memory store opened"
        );

        Ok(Self {
            index,
            catalogue,
            provider,
            index_path,
            status,
            writer: Mutex::new(()),
            gate: RwLock::new(()),
            dirty: AtomicBool::new(false),
            pending_repairs: std::sync::Mutex::new(BTreeSet::new()),
        })
    }

    #[must_use]
    pub fn catalogue(&self) -> &SqliteCatalogue {
        &self.catalogue
    }

    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    #[must_use]
    pub fn index_status(&self) -> &IndexStatus {
        &self.status
    }

    #[must_use]
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Add a record, or replace an existing one when `replace` is set.
    ///
    /// An existing stable id without `replace` is not an error: the call
    /// returns [`AddStatus::Exists`] and mutates nothing.
    ///
    /// # Errors
    ///
    /// - [`MemoryError::EmptyContent`] for blank content.
    /// - [`MemoryError::Embedding`] if the provider fails; nothing is mutated.
    /// - Catalogue errors after the index was updated are surfaced once the
    ///   index mutation has been undone, or as [`MemoryError::Inconsistent`]
    ///   if undoing it failed.
    pub async fn add(&self, record: NewRecord, replace: bool) -> Result<AddOutcome, MemoryError> {
        if record.content.trim().is_empty() {
            return Err(MemoryError::EmptyContent);
        }

        let _writer = self.writer.lock().await;

        let stable_id = record
            .stable_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let existing = self.catalogue.get(&stable_id).await?;
        if let Some(existing) = &existing
            && !replace
        {
            tracing::debug!(
                %stable_id,
                numeric_id = existing.numeric_id.0,
                "record exists, not replacing"
            );
            return Ok(AddOutcome {
                status: AddStatus::Exists,
                numeric_id: existing.numeric_id,
            });
        }

        let vector = self.embed(&record.content).await?;
        if let Some(expected) = self.index.dimension()
            && expected != vector.len()
        {
            return Err(IndexError::DimensionMismatch {
                expected,
                actual: vector.len(),
            }
            .into());
        }

        let tags = normalize_tags(&record.tags);
        let timestamp = record
            .timestamp
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(now_timestamp);
        let model = self.provider.model();

        let _gate = self.gate.write().await;

        let outcome = match existing {
            None => {
                let numeric_id = self.catalogue.next_numeric_id().await?;
                let row = StoredRecord {
                    stable_id,
                    numeric_id,
                    conversation_id: record.conversation_id,
                    role: record.role,
                    content: record.content,
                    timestamp,
                    tags,
                };
                self.index.add(numeric_id, vector.clone())?;
                if let Err(e) = self.catalogue.insert(&row, &vector, model).await {
                    tracing::error!(
                        numeric_id = numeric_id.0,
                        "catalogue insert failed, removing vector: {e}"
                    );
                    self.compensate(numeric_id, None).await?;
                    return Err(e);
                }
                tracing::debug!(
                    stable_id = %row.stable_id,
                    numeric_id = numeric_id.0,
                    "record added"
                );
                AddOutcome {
                    status: AddStatus::Added,
                    numeric_id,
                }
            }
            Some(old) => {
                let numeric_id = old.numeric_id;
                let previous = self.index.vector(numeric_id);
                let row = StoredRecord {
                    stable_id: old.stable_id,
                    numeric_id,
                    conversation_id: record.conversation_id,
                    role: record.role,
                    content: record.content,
                    timestamp,
                    tags,
                };
                self.index.add(numeric_id, vector.clone())?;
                if let Err(e) = self.catalogue.overwrite(&row, &vector, model).await {
                    tracing::error!(
                        numeric_id = numeric_id.0,
                        "catalogue overwrite failed, restoring previous vector: {e}"
                    );
                    self.compensate(numeric_id, previous).await?;
                    return Err(e);
                }
                tracing::debug!(
                    stable_id = %row.stable_id,
                    numeric_id = numeric_id.0,
                    "record replaced"
                );
                AddOutcome {
                    status: AddStatus::Replaced,
                    numeric_id,
                }
            }
        };

        self.persist_index().await;
        Ok(outcome)
    }

    /// The `k` records most similar to `query`, best first, with raw scores.
    ///
    /// Index entries without a catalogue row are skipped and logged, and the
    /// index is searched deeper to fill their place. Fewer than `k` results
    /// means the store holds fewer than `k` live records.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding the query, the index search or the
    /// catalogue lookup fails.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<MemoryHit>, MemoryError> {
        if k == 0 || self.index.is_empty() {
            return Ok(Vec::new());
        }
        let vector = self.embed(query).await?;

        let _gate = self.gate.read().await;
        let indexed = self.index.len();
        let mut depth = k.min(indexed);
        loop {
            let ranked = self.index.search(&vector, depth)?;
            let exhausted = ranked.len() < depth || depth >= indexed;

            let ids: Vec<NumericId> = ranked.iter().map(|(id, _)| *id).collect();
            let rows = self.catalogue.batch_get(&ids).await?;

            let mut seen = HashSet::new();
            let mut orphans = Vec::new();
            let mut hits = Vec::with_capacity(k);
            for (numeric_id, score) in ranked {
                let Some(row) = rows.get(&numeric_id) else {
                    orphans.push(numeric_id);
                    continue;
                };
                if hits.len() < k && seen.insert(row.stable_id.as_str()) {
                    hits.push(MemoryHit::from_record(row, Some(score)));
                }
            }

            if hits.len() >= k || exhausted || orphans.is_empty() {
                for numeric_id in &orphans {
                    tracing::warn!(
                        numeric_id = numeric_id.0,
                        "index entry has no catalogue row, skipping"
                    );
                }
                return Ok(hits);
            }
            depth = depth.saturating_add(orphans.len()).min(indexed);
        }
    }

    /// The `limit` most recent records of a conversation, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalogue query fails.
    pub async fn conversation_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>, MemoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let _gate = self.gate.read().await;
        let rows = self
            .catalogue
            .find_by_conversation(conversation_id, limit)
            .await?;
        Ok(rows
            .iter()
            .map(|row| MemoryHit::from_record(row, None))
            .collect())
    }

    /// Up to `limit` records tagged exactly `tag`, most recently added first.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalogue query fails.
    pub async fn search_by_tag(
        &self,
        tag: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>, MemoryError> {
        let tag = tag.trim();
        if tag.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let _gate = self.gate.read().await;
        let rows = self.catalogue.find_by_tag(tag, limit).await?;
        Ok(rows
            .iter()
            .map(|row| MemoryHit::from_record(row, None))
            .collect())
    }

    /// # Errors
    ///
    /// Returns an error if the catalogue query fails.
    pub async fn get(&self, stable_id: &str) -> Result<Option<StoredRecord>, MemoryError> {
        let _gate = self.gate.read().await;
        self.catalogue.get(stable_id).await
    }

    /// Delete a record's vector and catalogue row. Returns `false` if the
    /// stable id is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if either store fails. A catalogue failure restores
    /// the removed vector before it is surfaced.
    pub async fn remove(&self, stable_id: &str) -> Result<bool, MemoryError> {
        let _writer = self.writer.lock().await;
        let Some(existing) = self.catalogue.get(stable_id).await? else {
            return Ok(false);
        };
        let numeric_id = existing.numeric_id;

        let _gate = self.gate.write().await;
        let previous = self.index.vector(numeric_id);
        match self.index.remove(numeric_id) {
            Ok(_) => {
                if let Err(e) = self.catalogue.delete(stable_id).await {
                    tracing::error!(
                        numeric_id = numeric_id.0,
                        "catalogue delete failed, restoring vector: {e}"
                    );
                    self.compensate(numeric_id, previous).await?;
                    return Err(e);
                }
            }
            Err(IndexError::RemoveUnsupported) => {
                self.catalogue.delete(stable_id).await?;
                tracing::debug!(
                    numeric_id = numeric_id.0,
                    "index cannot remove entries, rebuilding from catalogue"
                );
                if let Err(e) = self.rebuild_locked().await {
                    tracing::error!(numeric_id = numeric_id.0, "rebuild after delete failed: {e}");
                    self.flag_for_repair(numeric_id);
                    return Err(MemoryError::Inconsistent { numeric_id });
                }
            }
            Err(e) => return Err(e.into()),
        }

        self.persist_index().await;
        tracing::debug!(%stable_id, numeric_id = numeric_id.0, "record removed");
        Ok(true)
    }

    /// Delete every record of a conversation from the index and the
    /// catalogue. Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns an error if either store fails. A catalogue failure restores
    /// the removed vectors before it is surfaced.
    pub async fn remove_conversation(&self, conversation_id: &str) -> Result<usize, MemoryError> {
        let _writer = self.writer.lock().await;
        let ids: Vec<NumericId> = self
            .catalogue
            .find_by_conversation(conversation_id, usize::MAX)
            .await?
            .iter()
            .map(|row| row.numeric_id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let _gate = self.gate.write().await;
        let mut removed = Vec::with_capacity(ids.len());
        let mut needs_rebuild = false;
        for &numeric_id in &ids {
            let previous = self.index.vector(numeric_id);
            match self.index.remove(numeric_id) {
                Ok(_) => removed.push((numeric_id, previous)),
                Err(IndexError::RemoveUnsupported) => {
                    needs_rebuild = true;
                    break;
                }
                Err(e) => {
                    self.restore(removed).await?;
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = self.catalogue.delete_conversation(conversation_id).await {
            tracing::error!(%conversation_id, "catalogue delete failed, restoring vectors: {e}");
            self.restore(removed).await?;
            return Err(e);
        }
        if needs_rebuild {
            tracing::debug!(
                %conversation_id,
                "index cannot remove entries, rebuilding from catalogue"
            );
            if let Err(e) = self.rebuild_locked().await {
                tracing::error!(%conversation_id, "rebuild after delete failed: {e}");
                for &numeric_id in &ids {
                    self.flag_for_repair(numeric_id);
                }
                return Err(MemoryError::Inconsistent { numeric_id: ids[0] });
            }
        }

        self.persist_index().await;
        tracing::info!(%conversation_id, removed = ids.len(), "conversation removed");
        Ok(ids.len())
    }

    /// Remove every record from the index and the catalogue.
    ///
    /// The numeric id counter is not rewound.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalogue cannot be cleared or the empty index
    /// cannot be persisted.
    pub async fn reset(&self) -> Result<(), MemoryError> {
        let _writer = self.writer.lock().await;
        let _gate = self.gate.write().await;
        let removed = self.catalogue.clear().await?;
        self.index.clear();
        self.pending().clear();
        self.persist_strict().await?;
        tracing::info!(removed, "memory store reset");
        Ok(())
    }

    /// Rebuild the index from the vectors stored in the catalogue.
    ///
    /// Makes no embedding calls. Returns the number of indexed records.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalogue cannot be read or the index cannot
    /// be persisted.
    pub async fn rebuild(&self) -> Result<usize, MemoryError> {
        let _writer = self.writer.lock().await;
        let _gate = self.gate.write().await;
        let count = self.rebuild_locked().await?;
        self.persist_strict().await?;
        tracing::info!(entries = count, "rebuilt similarity index from catalogue");
        Ok(count)
    }

    /// Drop index entries without a catalogue row and index catalogue rows
    /// the index is missing. Ids flagged by a failed compensation are
    /// re-indexed from their catalogue row.
    ///
    /// # Errors
    ///
    /// Returns an error if either store fails.
    pub async fn reconcile(&self) -> Result<ReconcileReport, MemoryError> {
        let _writer = self.writer.lock().await;
        let _gate = self.gate.write().await;

        let catalogue_ids: HashSet<NumericId> =
            self.catalogue.numeric_ids().await?.into_iter().collect();
        let indexed: HashSet<NumericId> = self.index.ids().into_iter().collect();
        let pending: Vec<NumericId> = self.pending().iter().copied().collect();

        let orphans: Vec<NumericId> = indexed
            .iter()
            .filter(|id| !catalogue_ids.contains(id))
            .copied()
            .collect();
        let mut missing: Vec<NumericId> = catalogue_ids
            .iter()
            .filter(|id| !indexed.contains(id) || pending.contains(id))
            .copied()
            .collect();
        missing.sort_unstable();

        let mut report = ReconcileReport::default();
        for id in &orphans {
            match self.index.remove(*id) {
                Ok(_) => report.orphans_removed += 1,
                Err(IndexError::RemoveUnsupported) => {
                    report.rebuilt = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if report.rebuilt {
            self.rebuild_locked().await?;
            report.orphans_removed = orphans.len();
            report.missing_restored = missing.len();
        } else {
            for (id, vector) in self.catalogue.embeddings_for(&missing).await? {
                self.index.add(id, vector)?;
                report.missing_restored += 1;
            }
            self.pending().clear();
        }

        self.persist_strict().await?;
        tracing::info!(
            orphans_removed = report.orphans_removed,
            missing_restored = report.missing_restored,
            rebuilt = report.rebuilt,
            "reconciled similarity index with catalogue"
        );
        Ok(report)
    }

    /// # Errors
    ///
    /// Returns an error if the catalogue cannot be queried.
    pub async fn stats(&self) -> Result<MemoryStats, MemoryError> {
        let _gate = self.gate.read().await;
        Ok(MemoryStats {
            index_entries: self.index.len(),
            catalogue_rows: self.catalogue.count().await?,
            next_numeric_id: self.catalogue.peek_numeric_id().await?,
            dimension: self.index.dimension(),
            index_dirty: self.dirty.load(Ordering::SeqCst),
            pending_repairs: self.pending().iter().copied().collect(),
            index_status: self.status.clone(),
        })
    }

    /// Persist the index if an earlier write of it failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the index still cannot be written.
    pub async fn flush(&self) -> Result<(), MemoryError> {
        let _writer = self.writer.lock().await;
        if self.dirty.load(Ordering::SeqCst) {
            let _gate = self.gate.read().await;
            self.persist_strict().await?;
        }
        Ok(())
    }

    /// Flush pending index writes and close the catalogue.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be written.
    pub async fn close(self) -> Result<(), MemoryError> {
        let flushed = self.flush().await;
        self.catalogue.close().await;
        tracing::debug!("memory store closed");
        flushed
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let mut vector = self.provider.embed(text).await.inspect_err(|e| {
            tracing::warn!(provider = self.provider.name(), "embedding failed: {e}");
        })?;
        normalize(&mut vector).map_err(|e| LlmError::Malformed {
            provider: self.provider.name().to_owned(),
            reason: e.to_string(),
        })?;
        Ok(vector)
    }

    /// Undo an index mutation: restore `previous` or drop the entry.
    async fn compensate(
        &self,
        numeric_id: NumericId,
        previous: Option<Vec<f32>>,
    ) -> Result<(), MemoryError> {
        let restored = match previous {
            Some(vector) => self.index.add(numeric_id, vector).map_err(MemoryError::from),
            None => match self.index.remove(numeric_id) {
                Ok(_) => Ok(()),
                Err(IndexError::RemoveUnsupported) => self.rebuild_locked().await.map(|_| ()),
                Err(e) => Err(e.into()),
            },
        };
        restored.map_err(|e| {
            tracing::error!(
                numeric_id = numeric_id.0,
                "compensation failed, flagging for rebuild: {e}"
            );
            self.flag_for_repair(numeric_id);
            MemoryError::Inconsistent { numeric_id }
        })
    }

    /// Put back vectors taken out of the index. Every entry is attempted;
    /// the first failure is returned.
    async fn restore(
        &self,
        removed: Vec<(NumericId, Option<Vec<f32>>)>,
    ) -> Result<(), MemoryError> {
        let mut first_err = None;
        for (numeric_id, previous) in removed {
            if previous.is_none() {
                continue;
            }
            if let Err(e) = self.compensate(numeric_id, previous).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Caller must hold the writer lock and the exclusive gate.
    async fn rebuild_locked(&self) -> Result<usize, MemoryError> {
        let mut entries = Vec::new();
        let mut after = None;
        loop {
            let page = self.catalogue.embeddings_page(after, REBUILD_PAGE).await?;
            let Some((last, _)) = page.last() else {
                break;
            };
            after = Some(*last);
            let done = page.len() < REBUILD_PAGE;
            entries.extend(page);
            if done {
                break;
            }
        }
        let count = entries.len();
        self.index.replace_all(entries)?;
        self.pending().clear();
        Ok(count)
    }

    async fn persist_index(&self) {
        for attempt in 1..=PERSIST_ATTEMPTS {
            match self.index.persist(&self.index_path).await {
                Ok(()) => {
                    self.dirty.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => tracing::warn!(
                    attempt,
                    path = %self.index_path.display(),
                    "failed to persist similarity index: {e}"
                ),
            }
        }
        self.dirty.store(true, Ordering::SeqCst);
        tracing::warn!("similarity index marked dirty; next mutation, flush or close retries");
    }

    async fn persist_strict(&self) -> Result<(), MemoryError> {
        match self.index.persist(&self.index_path).await {
            Ok(()) => {
                self.dirty.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    fn flag_for_repair(&self, numeric_id: NumericId) {
        self.pending().insert(numeric_id);
    }

    fn pending(&self) -> MutexGuard<'_, BTreeSet<NumericId>> {
        self.pending_repairs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
