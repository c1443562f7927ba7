//! Checkpoint types, keying, and the store abstraction for stage outputs.
//!
//! This module is always compiled (no feature gate). Only the SQLite backend
//! (`storage.rs`) requires the `checkpoint` feature with rusqlite.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{DedupError, Result};

/// Stage boundaries at which pipeline state is checkpointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Exact,
    Signatures,
    Clusters,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Signatures => "signatures",
            Self::Clusters => "clusters",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(Self::Exact),
            "signatures" => Some(Self::Signatures),
            "clusters" => Some(Self::Clusters),
            _ => None,
        }
    }

    pub fn all() -> [Stage; 3] {
        [Self::Exact, Self::Signatures, Self::Clusters]
    }
}

/// Metadata stored alongside a checkpoint payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Fingerprint of the input source (detects data changes).
    pub source_fingerprint: u64,
    /// Number of documents the stage covered.
    pub doc_count: usize,
    /// SipHash of the serialized configuration (detects config changes).
    pub config_hash: u64,
    /// Crate version when the checkpoint was written (detects upgrades).
    pub version: String,
    /// Unix timestamp when the checkpoint was written.
    pub created_at: u64,
}

impl CheckpointMeta {
    pub fn new(source_fingerprint: u64, doc_count: usize, config_hash: u64) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            source_fingerprint,
            doc_count,
            config_hash,
            version: env!("CARGO_PKG_VERSION").to_string(),
            created_at,
        }
    }
}

/// Listing entry for `checkpoint info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub stage: String,
    pub source_fingerprint: u64,
    pub config_hash: u64,
    pub doc_count: usize,
    pub version: String,
    pub created_at: u64,
    pub payload_bytes: usize,
}

/// Hash any serializable configuration for checkpoint keying.
pub fn config_hash(args: &impl Serialize) -> u64 {
    let json = serde_json::to_string(args).unwrap_or_default();
    let mut hasher = SipHasher13::new();
    hasher.write(json.as_bytes());
    hasher.finish()
}

/// A checkpoint is valid only if source, config, and crate version match.
pub fn is_valid(meta: &CheckpointMeta, source_fingerprint: u64, config_hash: u64) -> bool {
    meta.source_fingerprint == source_fingerprint
        && meta.config_hash == config_hash
        && meta.version == env!("CARGO_PKG_VERSION")
}

/// Durable storage for stage outputs.
///
/// `put` must be atomic per entry: a failed write leaves the previous
/// checkpoint for that key intact.
pub trait CheckpointStore: Send + Sync {
    fn get(
        &self,
        stage: Stage,
        source_fingerprint: u64,
        config_hash: u64,
    ) -> Result<Option<(CheckpointMeta, Vec<u8>)>>;

    fn put(&self, stage: Stage, meta: &CheckpointMeta, payload: &[u8]) -> Result<()>;

    /// Drop checkpoints for one stage, or all when `stage` is `None`.
    fn invalidate(&self, stage: Option<Stage>) -> Result<usize>;

    fn info(&self) -> Result<Vec<CheckpointInfo>>;
}

/// Load and decode a checkpoint if a valid one exists.
pub fn load<T: DeserializeOwned>(
    store: &dyn CheckpointStore,
    stage: Stage,
    source_fingerprint: u64,
    config_hash: u64,
) -> Result<Option<T>> {
    match store.get(stage, source_fingerprint, config_hash)? {
        Some((meta, payload)) if is_valid(&meta, source_fingerprint, config_hash) => {
            let value = serde_json::from_slice(&payload).map_err(|e| {
                DedupError::Checkpoint(format!("corrupt {} checkpoint: {e}", stage.as_str()))
            })?;
            Ok(Some(value))
        }
        _ => Ok(None),
    }
}

/// Encode and store a checkpoint.
pub fn save<T: Serialize>(
    store: &dyn CheckpointStore,
    stage: Stage,
    meta: &CheckpointMeta,
    value: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    store.put(stage, meta, &payload)
}

type Key = (Stage, u64, u64);

/// Process-local store, for tests and single-run resumption.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<Key, (CheckpointMeta, Vec<u8>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Key, (CheckpointMeta, Vec<u8>)>>> {
        self.entries
            .lock()
            .map_err(|_| DedupError::Storage("checkpoint store lock poisoned".into()))
    }
}

impl CheckpointStore for MemoryStore {
    fn get(
        &self,
        stage: Stage,
        source_fingerprint: u64,
        config_hash: u64,
    ) -> Result<Option<(CheckpointMeta, Vec<u8>)>> {
        Ok(self
            .lock()?
            .get(&(stage, source_fingerprint, config_hash))
            .cloned())
    }

    fn put(&self, stage: Stage, meta: &CheckpointMeta, payload: &[u8]) -> Result<()> {
        self.lock()?.insert(
            (stage, meta.source_fingerprint, meta.config_hash),
            (meta.clone(), payload.to_vec()),
        );
        Ok(())
    }

    fn invalidate(&self, stage: Option<Stage>) -> Result<usize> {
        let mut entries = self.lock()?;
        let before = entries.len();
        match stage {
            Some(s) => entries.retain(|k, _| k.0 != s),
            None => entries.clear(),
        }
        Ok(before - entries.len())
    }

    fn info(&self) -> Result<Vec<CheckpointInfo>> {
        let mut out: Vec<CheckpointInfo> = self
            .lock()?
            .iter()
            .map(|((stage, _, _), (meta, payload))| CheckpointInfo {
                stage: stage.as_str().into(),
                source_fingerprint: meta.source_fingerprint,
                config_hash: meta.config_hash,
                doc_count: meta.doc_count,
                version: meta.version.clone(),
                created_at: meta.created_at,
                payload_bytes: payload.len(),
            })
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.stage.cmp(&b.stage)));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_roundtrip() {
        for stage in Stage::all() {
            assert_eq!(Stage::from_str(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::from_str("unknown"), None);
    }

    #[test]
    fn config_hash_changes_with_params() {
        #[derive(Serialize)]
        struct Args {
            bands: usize,
        }
        assert_eq!(config_hash(&Args { bands: 16 }), config_hash(&Args { bands: 16 }));
        assert_ne!(config_hash(&Args { bands: 16 }), config_hash(&Args { bands: 20 }));
    }

    #[test]
    fn meta_has_current_version() {
        let meta = CheckpointMeta::new(42, 100, 99);
        assert_eq!(meta.version, env!("CARGO_PKG_VERSION"));
        assert!(meta.created_at > 0);
        assert!(is_valid(&meta, 42, 99));
        assert!(!is_valid(&meta, 43, 99));
        assert!(!is_valid(&meta, 42, 98));
    }

    #[test]
    fn stale_version_is_invalid() {
        let mut meta = CheckpointMeta::new(42, 100, 99);
        meta.version = "0.0.0".into();
        assert!(!is_valid(&meta, 42, 99));
    }

    #[test]
    fn memory_store_save_load() {
        let store = MemoryStore::new();
        let meta = CheckpointMeta::new(1, 3, 2);
        save(&store, Stage::Signatures, &meta, &vec![vec![1u64, 2], vec![3, 4]]).unwrap();

        let got: Option<Vec<Vec<u64>>> = load(&store, Stage::Signatures, 1, 2).unwrap();
        assert_eq!(got, Some(vec![vec![1, 2], vec![3, 4]]));
        let miss: Option<Vec<Vec<u64>>> = load(&store, Stage::Signatures, 1, 3).unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn memory_store_invalidate_by_stage() {
        let store = MemoryStore::new();
        let meta = CheckpointMeta::new(1, 3, 2);
        store.put(Stage::Exact, &meta, b"a").unwrap();
        store.put(Stage::Clusters, &meta, b"b").unwrap();
        assert_eq!(store.invalidate(Some(Stage::Exact)).unwrap(), 1);
        assert!(store.get(Stage::Exact, 1, 2).unwrap().is_none());
        assert!(store.get(Stage::Clusters, 1, 2).unwrap().is_some());
        assert_eq!(store.invalidate(None).unwrap(), 1);
        assert!(store.info().unwrap().is_empty());
    }

    #[test]
    fn corrupt_payload_is_checkpoint_error() {
        let store = MemoryStore::new();
        let meta = CheckpointMeta::new(1, 0, 2);
        store.put(Stage::Clusters, &meta, b"not json").unwrap();
        let err = load::<Vec<u32>>(&store, Stage::Clusters, 1, 2).unwrap_err();
        assert!(matches!(err, DedupError::Checkpoint(_)));
    }
}
