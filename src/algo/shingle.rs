use siphasher::sip::SipHasher13;
use std::collections::HashSet;
use std::hash::Hasher;

use super::normalize::{self, NormalizePolicy};

/// Hashes overlapping windows of `width` normalized tokens.
#[derive(Debug, Clone)]
pub struct Shingler {
    width: usize,
    policy: NormalizePolicy,
    keys: (u64, u64),
}

impl Shingler {
    pub fn new(width: usize, policy: NormalizePolicy, seed: u64) -> Self {
        Self {
            width: width.max(1),
            policy,
            keys: (seed ^ 0x73_6869_6e67_6c65, seed.rotate_left(32) ^ 0x9e37_79b9_7f4a_7c15),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Shingle hashes for raw text. Never empty: a document with fewer than
    /// `width` tokens yields one shingle over all of its tokens.
    pub fn shingles(&self, text: &str) -> HashSet<u64> {
        let toks = normalize::tokens(text, &self.policy);
        if toks.len() < self.width {
            return HashSet::from([self.hash_window(&toks)]);
        }
        toks.windows(self.width).map(|w| self.hash_window(w)).collect()
    }

    fn hash_window(&self, window: &[String]) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(self.keys.0, self.keys.1);
        for (i, tok) in window.iter().enumerate() {
            if i > 0 {
                hasher.write_u8(b' ');
            }
            hasher.write(tok.as_bytes());
        }
        hasher.finish()
    }
}

/// Exact Jaccard similarity of two shingle sets.
pub fn jaccard(a: &HashSet<u64>, b: &HashSet<u64>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let inter = a.intersection(b).count();
    let union = a.len() + b.len() - inter;
    inter as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shingler(w: usize) -> Shingler {
        Shingler::new(w, NormalizePolicy::default(), 42)
    }

    #[test]
    fn window_count() {
        let s = shingler(3).shingles("the cat sat on the mat");
        // 6 tokens, 4 windows, all distinct
        assert_eq!(s.len(), 4);
    }

    #[test]
    fn short_document_single_shingle() {
        let s = shingler(5).shingles("only three words");
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn empty_document_not_empty_set() {
        let s = shingler(5).shingles("");
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn normalization_applies() {
        let sh = shingler(2);
        assert_eq!(sh.shingles("The CAT  sat"), sh.shingles("the cat sat"));
    }

    #[test]
    fn deterministic_across_instances() {
        let a = shingler(3).shingles("one two three four five");
        let b = shingler(3).shingles("one two three four five");
        assert_eq!(a, b);
    }

    #[test]
    fn seed_changes_hashes() {
        let a = Shingler::new(2, NormalizePolicy::default(), 1).shingles("a b c");
        let b = Shingler::new(2, NormalizePolicy::default(), 2).shingles("a b c");
        assert_ne!(a, b);
    }

    #[test]
    fn token_boundaries_matter() {
        let sh = shingler(2);
        assert_ne!(sh.shingles("ab c"), sh.shingles("a bc"));
    }

    #[test]
    fn jaccard_of_sets() {
        let a: HashSet<u64> = [1, 2, 3, 4].into_iter().collect();
        let b: HashSet<u64> = [3, 4, 5, 6].into_iter().collect();
        assert!((jaccard(&a, &b) - 2.0 / 6.0).abs() < 1e-12);
        assert!((jaccard(&a, &a) - 1.0).abs() < 1e-12);
    }
}
