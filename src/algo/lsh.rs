use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;
use std::hash::Hasher;
use tracing::{debug, warn};

use super::minhash::Signature;
use super::union_find;
use crate::error::Result;

/// Candidate pair of dense document indices, `.0 < .1`.
pub type CandidatePair = (u32, u32);

/// Banded LSH over MinHash signatures.
///
/// Splits signatures into `bands` bands of `rows` rows each. Documents
/// sharing a bucket in any band become candidate pairs. Two documents with
/// Jaccard similarity `s` collide in at least one band with probability
/// `1 - (1 - s^rows)^bands`.
#[derive(Debug, Clone)]
pub struct LshBucketer {
    bands: usize,
    rows: usize,
    max_bucket_size: usize,
    seed: u64,
}

/// Outcome of one bucketing pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketReport {
    /// Deduplicated, sorted candidate pairs.
    pub pairs: Vec<CandidatePair>,
    /// Buckets holding two or more documents.
    pub shared_buckets: usize,
    /// Buckets truncated to `max_bucket_size`.
    pub oversized_buckets: usize,
    /// Pairs not emitted because of truncation.
    pub pairs_skipped: u64,
}

struct BandOutcome {
    pairs: Vec<CandidatePair>,
    shared_buckets: usize,
    oversized_buckets: usize,
    pairs_skipped: u64,
}

impl LshBucketer {
    pub fn new(bands: usize, rows: usize, max_bucket_size: usize, seed: u64) -> Self {
        Self {
            bands,
            rows,
            max_bucket_size: max_bucket_size.max(2),
            seed,
        }
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// One bucket key per band.
    pub fn band_keys(&self, signature: &[u64]) -> Vec<u64> {
        (0..self.bands)
            .map(|band_idx| self.band_key(band_idx, signature))
            .collect()
    }

    fn band_key(&self, band_idx: usize, signature: &[u64]) -> u64 {
        let start = band_idx * self.rows;
        let mut hasher = SipHasher13::new_with_keys(band_idx as u64, self.seed);
        for &v in &signature[start..start + self.rows] {
            hasher.write(&v.to_le_bytes());
        }
        hasher.finish()
    }

    /// Group all signatures by `(band, bucket_key)` and emit candidate pairs.
    ///
    /// Bands are processed in parallel; within a band, entries are sorted by
    /// key so buckets are contiguous runs. Fails when there are more
    /// signatures than `u32` indices.
    pub fn candidate_pairs(&self, signatures: &[Signature]) -> Result<BucketReport> {
        union_find::index_space(signatures.len())?;
        let outcomes: Vec<BandOutcome> = (0..self.bands)
            .into_par_iter()
            .map(|band_idx| self.band_pairs(band_idx, signatures))
            .collect();

        let mut report = BucketReport::default();
        for o in outcomes {
            report.pairs.extend(o.pairs);
            report.shared_buckets += o.shared_buckets;
            report.oversized_buckets += o.oversized_buckets;
            report.pairs_skipped += o.pairs_skipped;
        }
        report.pairs.par_sort_unstable();
        report.pairs.dedup();

        if report.oversized_buckets > 0 {
            warn!(
                oversized = report.oversized_buckets,
                skipped = report.pairs_skipped,
                cap = self.max_bucket_size,
                "truncated oversized LSH buckets"
            );
        }
        debug!(
            pairs = report.pairs.len(),
            shared_buckets = report.shared_buckets,
            "LSH bucketing done"
        );
        Ok(report)
    }

    fn band_pairs(&self, band_idx: usize, signatures: &[Signature]) -> BandOutcome {
        let mut entries: Vec<(u64, u32)> = signatures
            .iter()
            .enumerate()
            .map(|(i, sig)| (self.band_key(band_idx, sig), i as u32))
            .collect();
        entries.sort_unstable();

        let mut out = BandOutcome {
            pairs: Vec::new(),
            shared_buckets: 0,
            oversized_buckets: 0,
            pairs_skipped: 0,
        };
        for run in entries.chunk_by(|a, b| a.0 == b.0) {
            let n = run.len();
            if n < 2 {
                continue;
            }
            out.shared_buckets += 1;
            let kept = n.min(self.max_bucket_size);
            if kept < n {
                out.oversized_buckets += 1;
                out.pairs_skipped += pair_count(n) - pair_count(kept);
            }
            let members = &run[..kept];
            for i in 0..kept {
                for j in (i + 1)..kept {
                    out.pairs.push((members[i].1, members[j].1));
                }
            }
        }
        out
    }
}

fn pair_count(n: usize) -> u64 {
    let n = n as u64;
    n * n.saturating_sub(1) / 2
}

// ── S-curve ──────────────────────────────────────────────────────────────────

/// Probability that two documents of similarity `s` share at least one band.
pub fn collision_probability(s: f64, bands: usize, rows: usize) -> f64 {
    1.0 - (1.0 - s.powi(rows as i32)).powi(bands as i32)
}

/// Similarity at the steepest part of the S-curve, ≈ (1/b)^(1/r).
pub fn scurve_threshold(bands: usize, rows: usize) -> f64 {
    (1.0 / bands as f64).powf(1.0 / rows as f64)
}

/// `(similarity, collision probability)` samples across `[0, 1]`.
pub fn scurve_table(bands: usize, rows: usize, steps: usize) -> Vec<(f64, f64)> {
    let steps = steps.max(1);
    (0..=steps)
        .map(|i| {
            let s = i as f64 / steps as f64;
            (s, collision_probability(s, bands, rows))
        })
        .collect()
}

/// Pick `(bands, rows)` with `bands * rows == num_perm` minimizing the
/// integrated false-positive area below `threshold` plus false-negative area
/// above it.
pub fn optimal_bands(num_perm: usize, threshold: f64) -> (usize, usize) {
    let mut best = (num_perm.max(1), 1);
    let mut best_err = f64::INFINITY;
    for bands in 1..=num_perm {
        if num_perm % bands != 0 {
            continue;
        }
        let rows = num_perm / bands;
        let fp = integrate(|s| collision_probability(s, bands, rows), 0.0, threshold);
        let fn_ = integrate(|s| 1.0 - collision_probability(s, bands, rows), threshold, 1.0);
        let err = fp + fn_;
        if err < best_err {
            best_err = err;
            best = (bands, rows);
        }
    }
    best
}

fn integrate(f: impl Fn(f64) -> f64, lo: f64, hi: f64) -> f64 {
    const STEPS: usize = 200;
    if hi <= lo {
        return 0.0;
    }
    let h = (hi - lo) / STEPS as f64;
    let mut area = 0.5 * (f(lo) + f(hi));
    for i in 1..STEPS {
        area += f(lo + i as f64 * h);
    }
    area * h
}
