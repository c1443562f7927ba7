//! Exact-duplicate filtering by digest of normalized text.
//!
//! The first document carrying a given digest is admitted; every later one
//! is dropped and counted. Digests are SipHash-1-3 (128-bit, or its low 64
//! bits). A digest collision drops a distinct document; with `n` documents
//! the chance of any collision is about `n^2 / 2^(bits + 1)`.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use siphasher::sip128::{Hasher128, SipHasher13};
use std::collections::HashSet;
use std::hash::Hasher;

use super::normalize::{self, NormalizePolicy};
use crate::record::{Document, Positioned};

pub type Digest = u128;

const DIGEST_KEYS: (u64, u64) = (0x5eed_d16e_57c0_ffee, 0x0dd5_ba11_ab1e_cafe);

/// Digest of already-normalized text.
pub fn digest(normalized: &str, bits: u32) -> Digest {
    let mut hasher = SipHasher13::new_with_keys(DIGEST_KEYS.0, DIGEST_KEYS.1);
    hasher.write(normalized.as_bytes());
    let h = hasher.finish128();
    let full = ((h.h1 as u128) << 64) | h.h2 as u128;
    if bits >= 128 {
        full
    } else {
        full & u64::MAX as u128
    }
}

/// Set of digests already admitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DigestSet {
    seen: HashSet<Digest>,
}

impl DigestSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `d`. Returns `true` the first time a digest is seen.
    pub fn admit(&mut self, d: Digest) -> bool {
        self.seen.insert(d)
    }

    pub fn contains(&self, d: Digest) -> bool {
        self.seen.contains(&d)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Digest set split into partitions by `digest % n`.
///
/// Each partition sees its own sub-stream in input order, so first-seen
/// semantics match a single shared set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionedDigestSet {
    partitions: Vec<DigestSet>,
}

impl PartitionedDigestSet {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| DigestSet::new()).collect(),
        }
    }

    pub fn partition_of(&self, d: Digest) -> usize {
        (d % self.partitions.len() as u128) as usize
    }

    /// Admit a batch of digests in input order. `result[i]` is `true` when
    /// `digests[i]` is the first occurrence across everything admitted so far.
    pub fn admit_batch(&mut self, digests: &[Digest]) -> Vec<bool> {
        let mut routed: Vec<Vec<usize>> = vec![Vec::new(); self.partitions.len()];
        for (i, &d) in digests.iter().enumerate() {
            routed[self.partition_of(d)].push(i);
        }

        let decided: Vec<Vec<(usize, bool)>> = self
            .partitions
            .par_iter_mut()
            .zip(routed.par_iter())
            .map(|(set, indices)| {
                indices
                    .iter()
                    .map(|&i| (i, set.admit(digests[i])))
                    .collect()
            })
            .collect();

        let mut admitted = vec![false; digests.len()];
        for (i, ok) in decided.into_iter().flatten() {
            admitted[i] = ok;
        }
        admitted
    }

    pub fn len(&self) -> usize {
        self.partitions.iter().map(DigestSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Anything carrying document text that can be exact-deduplicated.
pub trait Digestible {
    fn text(&self) -> &str;
}

impl Digestible for Document {
    fn text(&self) -> &str {
        &self.text
    }
}

impl Digestible for Positioned {
    fn text(&self) -> &str {
        &self.doc.text
    }
}

/// Exact-duplicate filter state: normalization, digest width, seen set, and
/// the running duplicate count.
#[derive(Debug, Clone)]
pub struct ExactFilter {
    policy: NormalizePolicy,
    bits: u32,
    seen: DigestSet,
    duplicates: usize,
}

impl ExactFilter {
    pub fn new(policy: NormalizePolicy, bits: u32) -> Self {
        Self {
            policy,
            bits,
            seen: DigestSet::new(),
            duplicates: 0,
        }
    }

    pub fn digest_text(&self, text: &str) -> Digest {
        digest(&normalize::normalize(text, &self.policy), self.bits)
    }

    /// Returns `true` if the text passes (first occurrence).
    pub fn admit(&mut self, text: &str) -> bool {
        let d = self.digest_text(text);
        if self.seen.admit(d) {
            true
        } else {
            self.duplicates += 1;
            false
        }
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    pub fn distinct(&self) -> usize {
        self.seen.len()
    }

    /// Wrap a document stream so that exact duplicates are dropped lazily.
    pub fn filter<I, T>(self, inner: I) -> ExactDedup<I>
    where
        I: Iterator<Item = T>,
        T: Digestible,
    {
        ExactDedup {
            inner,
            filter: self,
        }
    }
}

/// Iterator adapter yielding only first occurrences.
pub struct ExactDedup<I> {
    inner: I,
    filter: ExactFilter,
}

impl<I> ExactDedup<I> {
    pub fn duplicates(&self) -> usize {
        self.filter.duplicates()
    }

    pub fn into_filter(self) -> ExactFilter {
        self.filter
    }
}

impl<I, T> Iterator for ExactDedup<I>
where
    I: Iterator<Item = T>,
    T: Digestible,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        for item in self.inner.by_ref() {
            if self.filter.admit(item.text()) {
                return Some(item);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, text: &str) -> Document {
        Document::new(id, text)
    }

    #[test]
    fn first_seen_survives() {
        let docs = vec![
            doc("1", "the cat sat on the mat"),
            doc("2", "The  cat sat on the MAT"),
            doc("3", "a dog ran in the park"),
        ];
        let mut it = ExactFilter::new(NormalizePolicy::default(), 128).filter(docs.into_iter());
        let kept: Vec<String> = it.by_ref().map(|d| d.id).collect();
        assert_eq!(kept, vec!["1", "3"]);
        assert_eq!(it.duplicates(), 1);
    }

    #[test]
    fn empty_documents_are_their_own_class() {
        let mut f = ExactFilter::new(NormalizePolicy::default(), 128);
        assert!(f.admit(""));
        assert!(!f.admit("   "));
        assert!(f.admit("x"));
        assert_eq!(f.duplicates(), 1);
        assert_eq!(f.distinct(), 2);
    }

    #[test]
    fn digest_width_64_fits_in_u64() {
        let d = digest("hello world", 64);
        assert!(d <= u64::MAX as u128);
        let full = digest("hello world", 128);
        assert_eq!(full & u64::MAX as u128, d);
    }

    #[test]
    fn digest_deterministic() {
        assert_eq!(digest("abc", 128), digest("abc", 128));
        assert_ne!(digest("abc", 128), digest("abd", 128));
    }

    #[test]
    fn partitioned_matches_single_set() {
        let texts = ["a", "b", "a", "c", "b", "d", "a", "e"];
        let digests: Vec<Digest> = texts.iter().map(|t| digest(t, 128)).collect();

        let mut single = DigestSet::new();
        let expected: Vec<bool> = digests.iter().map(|&d| single.admit(d)).collect();

        let mut parts = PartitionedDigestSet::new(3);
        let first = parts.admit_batch(&digests[..4]);
        let second = parts.admit_batch(&digests[4..]);
        let got: Vec<bool> = first.into_iter().chain(second).collect();

        assert_eq!(got, expected);
        assert_eq!(parts.len(), 5);
    }
}
