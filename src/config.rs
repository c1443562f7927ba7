//! Run configuration.
//!
//! Every field has a default, so a config file only needs the options it
//! changes. `num_bands` / `rows_per_band` set to 0 are picked from
//! `similarity_threshold` and `num_hash_functions`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::algo::lsh;
use crate::algo::normalize::NormalizePolicy;
use crate::algo::select::RepresentativePolicy;
use crate::error::{DedupError, Result};

/// How candidate pairs are checked before they are unioned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    /// Accept every LSH candidate.
    #[default]
    None,
    /// Accept when the signature-estimated Jaccard reaches the threshold.
    Signature,
    /// Accept when exact shingle-set Jaccard reaches the threshold.
    Shingles,
}

impl VerifyMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Some(Self::None),
            "signature" | "estimated" => Some(Self::Signature),
            "shingles" | "exact" | "strict" => Some(Self::Shingles),
            _ => None,
        }
    }
}

/// Single-worker or partitioned execution. Both produce identical results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    InMemory,
    Sharded { shards: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Tokens per shingle (w).
    pub shingle_width: usize,
    /// MinHash signature length (k).
    pub num_hash_functions: usize,
    /// LSH bands (b). 0 = choose from the threshold.
    pub num_bands: usize,
    /// Rows per band (r), `b * r = k`. 0 = choose from the threshold.
    pub rows_per_band: usize,
    /// Target Jaccard similarity for near-duplicates.
    pub similarity_threshold: f64,
    /// Buckets larger than this are truncated.
    pub max_bucket_size: usize,
    pub representative_policy: RepresentativePolicy,
    /// Seed of the shingle, MinHash and band hash families.
    pub random_seed: u64,
    pub normalize: NormalizePolicy,
    /// Exact-duplicate digest width: 64 or 128.
    pub digest_bits: u32,
    pub verify: VerifyMode,
    pub execution: ExecutionMode,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            shingle_width: 5,
            num_hash_functions: 128,
            num_bands: 16,
            rows_per_band: 8,
            similarity_threshold: 0.8,
            max_bucket_size: 1000,
            representative_policy: RepresentativePolicy::FirstSeen,
            random_seed: 42,
            normalize: NormalizePolicy::default(),
            digest_bits: 128,
            verify: VerifyMode::None,
            execution: ExecutionMode::InMemory,
        }
    }
}

impl DedupConfig {
    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DedupError::InvalidConfig(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            DedupError::InvalidConfig(format!("Invalid config '{}': {e}", path.display()))
        })
    }

    /// Fill in automatic `(b, r)` and check every constraint.
    pub fn resolved(mut self) -> Result<Self> {
        if self.num_hash_functions == 0 {
            return Err(DedupError::InvalidConfig("num_hash_functions must be > 0".into()));
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(DedupError::InvalidConfig(format!(
                "similarity_threshold must be in (0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if self.num_bands == 0 || self.rows_per_band == 0 {
            let (b, r) = lsh::optimal_bands(self.num_hash_functions, self.similarity_threshold);
            self.num_bands = b;
            self.rows_per_band = r;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shingle_width == 0 {
            return Err(DedupError::InvalidConfig("shingle_width must be > 0".into()));
        }
        if self.num_bands * self.rows_per_band != self.num_hash_functions {
            return Err(DedupError::InvalidConfig(format!(
                "num_bands ({}) * rows_per_band ({}) must equal num_hash_functions ({})",
                self.num_bands, self.rows_per_band, self.num_hash_functions
            )));
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(DedupError::InvalidConfig(format!(
                "similarity_threshold must be in (0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if self.max_bucket_size < 2 {
            return Err(DedupError::InvalidConfig("max_bucket_size must be >= 2".into()));
        }
        if self.digest_bits != 64 && self.digest_bits != 128 {
            return Err(DedupError::InvalidConfig(format!(
                "digest_bits must be 64 or 128, got {}",
                self.digest_bits
            )));
        }
        if let ExecutionMode::Sharded { shards: 0 } = self.execution {
            return Err(DedupError::InvalidConfig("shards must be > 0".into()));
        }

        let midpoint = lsh::scurve_threshold(self.num_bands, self.rows_per_band);
        if (midpoint - self.similarity_threshold).abs() > 0.15 {
            warn!(
                bands = self.num_bands,
                rows = self.rows_per_band,
                midpoint,
                threshold = self.similarity_threshold,
                "S-curve midpoint is far from similarity_threshold"
            );
        }
        Ok(())
    }

    pub fn shards(&self) -> usize {
        match self.execution {
            ExecutionMode::InMemory => 1,
            ExecutionMode::Sharded { shards } => shards,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let cfg = DedupConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.num_bands * cfg.rows_per_band, cfg.num_hash_functions);
    }

    #[test]
    fn rejects_band_mismatch() {
        let cfg = DedupConfig {
            num_bands: 10,
            rows_per_band: 10,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(DedupError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_bad_threshold_and_width() {
        let zero_w = DedupConfig {
            shingle_width: 0,
            ..Default::default()
        };
        assert!(zero_w.validate().is_err());
        let bad_t = DedupConfig {
            similarity_threshold: 1.5,
            ..Default::default()
        };
        assert!(bad_t.resolved().is_err());
    }

    #[test]
    fn rejects_digest_width_and_shards() {
        let bits = DedupConfig {
            digest_bits: 32,
            ..Default::default()
        };
        assert!(bits.validate().is_err());
        let shards = DedupConfig {
            execution: ExecutionMode::Sharded { shards: 0 },
            ..Default::default()
        };
        assert!(shards.validate().is_err());
    }

    #[test]
    fn auto_bands_fill_in() {
        let cfg = DedupConfig {
            num_bands: 0,
            rows_per_band: 0,
            num_hash_functions: 120,
            similarity_threshold: 0.7,
            ..Default::default()
        }
        .resolved()
        .unwrap();
        assert_eq!(cfg.num_bands * cfg.rows_per_band, 120);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: DedupConfig = serde_json::from_str(
            r#"{"shingle_width": 3, "representative_policy": "longest",
                "execution": {"sharded": {"shards": 4}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.shingle_width, 3);
        assert_eq!(cfg.representative_policy, RepresentativePolicy::Longest);
        assert_eq!(cfg.shards(), 4);
        assert_eq!(cfg.num_hash_functions, 128);
        assert!(cfg.normalize.lowercase);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.json");
        std::fs::write(&path, r#"{"verify": "shingles", "random_seed": 7}"#).unwrap();
        let cfg = DedupConfig::load(&path).unwrap();
        assert_eq!(cfg.verify, VerifyMode::Shingles);
        assert_eq!(cfg.random_seed, 7);
        assert!(DedupConfig::load(dir.path().join("missing.json")).is_err());
    }
}
