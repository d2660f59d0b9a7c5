use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::io::AsyncWriteExt;

use super::codec;
use super::{BoxFuture, IndexError, LoadOutcome, SimilarityIndex, dot};
use crate::types::NumericId;

#[derive(Default)]
struct FlatInner {
    dimension: Option<usize>,
    vectors: BTreeMap<NumericId, Vec<f32>>,
}

impl FlatInner {
    fn check_dimension(&self, actual: usize) -> Result<(), IndexError> {
        match self.dimension {
            Some(expected) if expected != actual => {
                Err(IndexError::DimensionMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }
}

/// Exact brute-force index: every search scores every stored vector.
pub struct FlatIndex {
    inner: RwLock<FlatInner>,
}

impl FlatIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(FlatInner::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, FlatInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FlatInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FlatIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FlatIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("FlatIndex")
            .field("dimension", &inner.dimension)
            .field("len", &inner.vectors.len())
            .finish()
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Flush the directory entry of `path` so a completed rename survives a crash.
#[cfg(unix)]
async fn sync_dir(path: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(parent_dir(path)).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

impl SimilarityIndex for FlatIndex {
    fn dimension(&self) -> Option<usize> {
        self.read().dimension
    }

    fn len(&self) -> usize {
        self.read().vectors.len()
    }

    fn contains(&self, id: NumericId) -> bool {
        self.read().vectors.contains_key(&id)
    }

    fn ids(&self) -> Vec<NumericId> {
        self.read().vectors.keys().copied().collect()
    }

    fn vector(&self, id: NumericId) -> Option<Vec<f32>> {
        self.read().vectors.get(&id).cloned()
    }

    fn add(&self, id: NumericId, vector: Vec<f32>) -> Result<(), IndexError> {
        let mut inner = self.write();
        inner.check_dimension(vector.len())?;
        if vector.is_empty() {
            return Err(IndexError::ZeroVector);
        }
        inner.dimension = Some(vector.len());
        inner.vectors.insert(id, vector);
        Ok(())
    }

    fn remove(&self, id: NumericId) -> Result<bool, IndexError> {
        Ok(self.write().vectors.remove(&id).is_some())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(NumericId, f32)>, IndexError> {
        let inner = self.read();
        if inner.vectors.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        inner.check_dimension(query.len())?;

        let mut scored: Vec<(NumericId, f32)> = inner
            .vectors
            .iter()
            .map(|(id, v)| (*id, dot(query, v)))
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    fn clear(&self) {
        let mut inner = self.write();
        inner.vectors.clear();
        inner.dimension = None;
    }

    fn replace_all(&self, entries: Vec<(NumericId, Vec<f32>)>) -> Result<(), IndexError> {
        let mut dimension = None;
        let mut vectors = BTreeMap::new();
        for (id, vector) in entries {
            match dimension {
                None => dimension = Some(vector.len()),
                Some(expected) if expected != vector.len() => {
                    return Err(IndexError::DimensionMismatch {
                        expected,
                        actual: vector.len(),
                    });
                }
                Some(_) => {}
            }
            vectors.insert(id, vector);
        }
        *self.write() = FlatInner { dimension, vectors };
        Ok(())
    }

    fn persist<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<(), IndexError>> {
        Box::pin(async move {
            let bytes = {
                let inner = self.read();
                codec::encode(inner.dimension, &inner.vectors)?
            };
            let tmp = tmp_path(path);
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, path).await?;
            sync_dir(path).await?;
            tracing::debug!(path = %path.display(), bytes = bytes.len(), "persisted index");
            Ok(())
        })
    }

    fn load<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<LoadOutcome, IndexError>> {
        Box::pin(async move {
            let bytes = match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(LoadOutcome::Missing);
                }
                Err(e) => return Err(e.into()),
            };
            let decoded = codec::decode(&bytes)?;
            let entries = decoded.entries.len();
            *self.write() = FlatInner {
                dimension: decoded.dimension,
                vectors: decoded.entries,
            };
            Ok(LoadOutcome::Loaded { entries })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::normalize;

    fn unit(v: &[f32]) -> Vec<f32> {
        let mut v = v.to_vec();
        normalize(&mut v).unwrap();
        v
    }

    fn sample_index() -> FlatIndex {
        let index = FlatIndex::new();
        index.add(NumericId(1), unit(&[1.0, 0.0, 0.0])).unwrap();
        index.add(NumericId(2), unit(&[0.9, 0.1, 0.0])).unwrap();
        index.add(NumericId(3), unit(&[0.0, 1.0, 0.0])).unwrap();
        index
    }

    #[test]
    fn search_ranks_by_score() {
        let index = sample_index();
        let results = index.search(&unit(&[1.0, 0.0, 0.0]), 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, NumericId(1));
        assert!((results[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(results[1].0, NumericId(2));
    }

    #[test]
    fn search_k_larger_than_len_returns_all() {
        let index = sample_index();
        let results = index.search(&unit(&[0.0, 1.0, 0.0]), 50).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, NumericId(3));
    }

    #[test]
    fn search_empty_index_is_empty() {
        let index = FlatIndex::new();
        assert!(index.search(&[1.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn ties_break_by_ascending_id() {
        let index = FlatIndex::new();
        index.add(NumericId(9), unit(&[1.0, 0.0])).unwrap();
        index.add(NumericId(4), unit(&[1.0, 0.0])).unwrap();
        let results = index.search(&unit(&[1.0, 0.0]), 2).unwrap();
        assert_eq!(results[0].0, NumericId(4));
        assert_eq!(results[1].0, NumericId(9));
    }

    #[test]
    fn add_replaces_existing_vector() {
        let index = sample_index();
        index.add(NumericId(1), unit(&[0.0, 0.0, 1.0])).unwrap();
        assert_eq!(index.len(), 3);
        let results = index.search(&unit(&[0.0, 0.0, 1.0]), 1).unwrap();
        assert_eq!(results[0].0, NumericId(1));
    }

    #[test]
    fn add_rejects_dimension_mismatch() {
        let index = sample_index();
        let err = index.add(NumericId(4), vec![1.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn search_rejects_dimension_mismatch() {
        let index = sample_index();
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn remove_missing_is_noop() {
        let index = sample_index();
        assert!(!index.remove(NumericId(42)).unwrap());
        assert!(index.remove(NumericId(2)).unwrap());
        assert!(!index.contains(NumericId(2)));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn clear_resets_dimension() {
        let index = sample_index();
        index.clear();
        assert!(index.is_empty());
        assert_eq!(index.dimension(), None);
        index.add(NumericId(5), vec![1.0, 0.0]).unwrap();
        assert_eq!(index.dimension(), Some(2));
    }

    #[test]
    fn replace_all_swaps_content() {
        let index = sample_index();
        index
            .replace_all(vec![(NumericId(10), unit(&[1.0, 1.0]))])
            .unwrap();
        assert_eq!(index.ids(), vec![NumericId(10)]);
        assert_eq!(index.dimension(), Some(2));
    }

    #[test]
    fn replace_all_rejects_mixed_dimensions() {
        let index = sample_index();
        let err = index
            .replace_all(vec![
                (NumericId(1), vec![1.0]),
                (NumericId(2), vec![1.0, 0.0]),
            ])
            .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));
        assert_eq!(index.len(), 3);
    }

    #[tokio::test]
    async fn persist_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.mnix");
        let index = sample_index();
        let query = unit(&[0.7, 0.3, 0.1]);
        let before = index.search(&query, 3).unwrap();
        index.persist(&path).await.unwrap();
        assert!(!tmp_path(&path).exists());

        let reloaded = FlatIndex::new();
        let outcome = reloaded.load(&path).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded { entries: 3 });
        assert_eq!(reloaded.search(&query, 3).unwrap(), before);
    }

    #[tokio::test]
    async fn load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let index = FlatIndex::new();
        let outcome = index.load(&dir.path().join("absent.mnix")).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Missing);
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn load_corrupt_file_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.mnix");
        tokio::fs::write(&path, b"garbage").await.unwrap();
        let index = sample_index();
        assert!(matches!(
            index.load(&path).await,
            Err(IndexError::Corrupt(_))
        ));
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn tmp_path_appends_suffix() {
        let p = tmp_path(Path::new("/data/index.mnix"));
        assert_eq!(p, Path::new("/data/index.mnix.tmp"));
    }

    #[test]
    fn parent_dir_of_bare_file_name_is_cwd() {
        assert_eq!(parent_dir(Path::new("index.mnix")), Path::new("."));
        assert_eq!(parent_dir(Path::new("/data/index.mnix")), Path::new("/data"));
    }

    #[tokio::test]
    async fn sync_dir_flushes_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        sync_dir(&dir.path().join("index.mnix")).await.unwrap();
    }

    #[test]
    fn debug_format() {
        let dbg = format!("{:?}", sample_index());
        assert!(dbg.contains("FlatIndex"));
        assert!(dbg.contains("len: 3"));
    }
}
