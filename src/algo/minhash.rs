use serde::{Deserialize, Serialize};

use crate::error::{DedupError, Result};

const DEFAULT_NUM_PERM: usize = 128;

/// Mersenne prime 2^61 - 1, modulus of the permutation family.
pub const MERSENNE_61: u64 = (1 << 61) - 1;

/// MinHash signature: one minimum per permutation.
///
/// Two signatures can be compared with Jaccard estimation:
/// J(A,B) ≈ (number of matching positions) / num_perm
pub type Signature = Vec<u64>;

/// Seeded family of `h(x) = (a*x + b) mod p` permutations over shingle hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinHasher {
    num_perm: usize,
    /// `(a, b)` per permutation, `a` in `[1, p)`, `b` in `[0, p)`.
    perms: Vec<(u64, u64)>,
}

impl MinHasher {
    pub fn new(num_perm: usize, seed: u64) -> Self {
        let mut rng = SplitMix64::new(seed);
        let perms = (0..num_perm)
            .map(|_| {
                let a = 1 + rng.next() % (MERSENNE_61 - 1);
                let b = rng.next() % MERSENNE_61;
                (a, b)
            })
            .collect();
        Self { num_perm, perms }
    }

    pub fn with_default_perm(seed: u64) -> Self {
        Self::new(DEFAULT_NUM_PERM, seed)
    }

    /// Compute the signature of a set of shingle hashes.
    pub fn signature<'a>(&self, shingles: impl IntoIterator<Item = &'a u64>) -> Signature {
        let mut sig = vec![u64::MAX; self.num_perm];
        for &x in shingles {
            for (slot, &(a, b)) in sig.iter_mut().zip(&self.perms) {
                let h = permute(x, a, b);
                if h < *slot {
                    *slot = h;
                }
            }
        }
        sig
    }

    pub fn num_perm(&self) -> usize {
        self.num_perm
    }
}

#[inline]
fn permute(x: u64, a: u64, b: u64) -> u64 {
    ((a as u128 * x as u128 + b as u128) % MERSENNE_61 as u128) as u64
}

/// Estimate Jaccard similarity between two signatures.
pub fn jaccard(sig_a: &[u64], sig_b: &[u64]) -> Result<f64> {
    if sig_a.len() != sig_b.len() {
        return Err(DedupError::SignatureMismatch {
            expected: sig_a.len(),
            got: sig_b.len(),
        });
    }
    if sig_a.is_empty() {
        return Ok(0.0);
    }
    let matches = sig_a
        .iter()
        .zip(sig_b.iter())
        .filter(|(a, b)| a == b)
        .count();
    Ok(matches as f64 / sig_a.len() as f64)
}

/// SplitMix64: portable, seedable stream for deriving hash-family parameters.
pub(crate) struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    pub(crate) fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub(crate) fn next(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn set(range: std::ops::Range<u64>, salt: u64) -> HashSet<u64> {
        let mut rng = SplitMix64::new(salt);
        range.map(|i| i ^ rng.next()).collect()
    }

    #[test]
    fn identical_sets_jaccard_one() {
        let mh = MinHasher::new(128, 7);
        let s: HashSet<u64> = [1, 2, 3].into_iter().collect();
        let sig = mh.signature(&s);
        assert!((jaccard(&sig, &sig).unwrap() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn values_below_modulus() {
        let mh = MinHasher::new(64, 1);
        let s: HashSet<u64> = [u64::MAX, 0, 12345].into_iter().collect();
        assert!(mh.signature(&s).iter().all(|&v| v < MERSENNE_61));
    }

    #[test]
    fn deterministic_for_seed() {
        let s: HashSet<u64> = [10, 20, 30].into_iter().collect();
        assert_eq!(MinHasher::new(64, 9).signature(&s), MinHasher::new(64, 9).signature(&s));
        assert_ne!(MinHasher::new(64, 9).signature(&s), MinHasher::new(64, 10).signature(&s));
    }

    #[test]
    fn empty_input_all_max() {
        let mh = MinHasher::new(16, 0);
        let sig = mh.signature(&HashSet::new());
        assert_eq!(sig.len(), 16);
        assert!(sig.iter().all(|&v| v == u64::MAX));
    }

    #[test]
    fn length_mismatch_is_error() {
        let err = jaccard(&[1, 2, 3], &[1, 2]).unwrap_err();
        assert!(matches!(err, DedupError::SignatureMismatch { expected: 3, got: 2 }));
    }

    #[test]
    fn disjoint_sets_low_jaccard() {
        let mh = MinHasher::new(128, 3);
        let a = set(0..200, 1);
        let b = set(0..200, 2);
        let j = jaccard(&mh.signature(&a), &mh.signature(&b)).unwrap();
        assert!(j < 0.05, "Expected near-zero Jaccard, got {j}");
    }

    #[test]
    fn estimator_converges_to_true_jaccard() {
        // 500 shared + 250 unique on each side: J = 500 / 1000 = 0.5
        let shared = set(0..500, 11);
        let mut a = shared.clone();
        let mut b = shared;
        a.extend(set(0..250, 12));
        b.extend(set(0..250, 13));
        let truth = super::super::shingle::jaccard(&a, &b);

        let trials = 20;
        let mean: f64 = (0..trials)
            .map(|seed| {
                let mh = MinHasher::new(256, seed);
                jaccard(&mh.signature(&a), &mh.signature(&b)).unwrap()
            })
            .sum::<f64>()
            / trials as f64;
        assert!((mean - truth).abs() < 0.03, "mean {mean} vs truth {truth}");
    }

    #[test]
    fn error_shrinks_with_more_permutations() {
        let shared = set(0..300, 21);
        let mut a = shared.clone();
        let mut b = shared;
        a.extend(set(0..100, 22));
        b.extend(set(0..100, 23));
        let truth = super::super::shingle::jaccard(&a, &b);

        let mean_abs_err = |k: usize| -> f64 {
            (0..30u64)
                .map(|seed| {
                    let mh = MinHasher::new(k, seed);
                    (jaccard(&mh.signature(&a), &mh.signature(&b)).unwrap() - truth).abs()
                })
                .sum::<f64>()
                / 30.0
        };
        assert!(mean_abs_err(512) < mean_abs_err(16));
    }
}
