use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{DedupError, Result};

/// Most documents a run can index; indices are `u32`.
pub const MAX_DOCS: usize = u32::MAX as usize;

/// Check that `n` documents fit the `u32` index space.
pub fn index_space(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| DedupError::TooManyDocuments {
        count: n,
        max: MAX_DOCS,
    })
}

/// Disjoint-set forest over dense document indices.
///
/// Flat `parent` / `rank` arrays, union by rank, path halving on `find`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnionFind {
    parent: Vec<u32>,
    rank: Vec<u8>,
}

/// A connected component of the forest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub root: u32,
    /// Member indices, ascending.
    pub members: Vec<u32>,
}

impl UnionFind {
    pub fn new(n: usize) -> Result<Self> {
        let end = index_space(n)?;
        Ok(Self {
            parent: (0..end).collect(),
            rank: vec![0; n],
        })
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            let grand = self.parent[self.parent[x as usize] as usize];
            self.parent[x as usize] = grand;
            x = grand;
        }
        x
    }

    /// Merge the sets of `a` and `b`. Returns `true` if they were disjoint.
    pub fn union(&mut self, a: u32, b: u32) -> bool {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return false;
        }
        let (hi, lo) = match self.rank[ra as usize].cmp(&self.rank[rb as usize]) {
            std::cmp::Ordering::Less => (rb, ra),
            std::cmp::Ordering::Greater => (ra, rb),
            std::cmp::Ordering::Equal => {
                self.rank[ra as usize] += 1;
                (ra, rb)
            }
        };
        self.parent[lo as usize] = hi;
        true
    }

    pub fn connected(&mut self, a: u32, b: u32) -> bool {
        self.find(a) == self.find(b)
    }

    /// Fold another forest over the same index space into this one.
    ///
    /// Every non-root node of `other` is unioned with its root, which makes
    /// this forest at least as connected as `other`.
    pub fn merge(&mut self, other: &UnionFind) {
        assert_eq!(self.len(), other.len(), "forests cover different index spaces");
        let mut other = other.clone();
        for x in 0..other.len() as u32 {
            let root = other.find(x);
            if root != x {
                self.union(x, root);
            }
        }
    }

    /// Root of every index.
    pub fn roots(&mut self) -> Vec<u32> {
        (0..self.len() as u32).map(|x| self.find(x)).collect()
    }

    /// Enumerate all components, ordered by smallest member.
    pub fn clusters(&mut self) -> Vec<Cluster> {
        let mut by_root: HashMap<u32, Vec<u32>> = HashMap::new();
        for x in 0..self.len() as u32 {
            let root = self.find(x);
            by_root.entry(root).or_default().push(x);
        }
        let mut clusters: Vec<Cluster> = by_root
            .into_iter()
            .map(|(root, members)| Cluster { root, members })
            .collect();
        clusters.sort_unstable_by_key(|c| c.members[0]);
        clusters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_space_rejects_overflow() {
        assert_eq!(index_space(MAX_DOCS).unwrap(), u32::MAX);
        assert!(matches!(
            index_space(MAX_DOCS + 1),
            Err(DedupError::TooManyDocuments { count, .. }) if count == MAX_DOCS + 1
        ));
    }

    #[test]
    fn singletons_initially() {
        let mut uf = UnionFind::new(3).unwrap();
        assert_eq!(uf.clusters().len(), 3);
        assert!(!uf.connected(0, 1));
    }

    #[test]
    fn transitive_regardless_of_order() {
        let orders: [[(u32, u32); 2]; 2] = [[(0, 1), (1, 2)], [(1, 2), (0, 1)]];
        for pairs in orders {
            let mut uf = UnionFind::new(4).unwrap();
            for (a, b) in pairs {
                uf.union(a, b);
            }
            assert!(uf.connected(0, 2));
            assert!(!uf.connected(0, 3));
            let clusters = uf.clusters();
            assert_eq!(clusters.len(), 2);
            assert_eq!(clusters[0].members, vec![0, 1, 2]);
            assert_eq!(clusters[1].members, vec![3]);
        }
    }

    #[test]
    fn union_reports_new_merges() {
        let mut uf = UnionFind::new(2).unwrap();
        assert!(uf.union(0, 1));
        assert!(!uf.union(1, 0));
    }

    #[test]
    fn merge_combines_shard_forests() {
        let mut a = UnionFind::new(6).unwrap();
        a.union(0, 1);
        a.union(2, 3);
        let mut b = UnionFind::new(6).unwrap();
        b.union(1, 2);
        b.union(4, 5);

        a.merge(&b);
        let clusters = a.clusters();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].members, vec![0, 1, 2, 3]);
        assert_eq!(clusters[1].members, vec![4, 5]);
    }

    #[test]
    fn serde_roundtrip_preserves_components() {
        let mut uf = UnionFind::new(5).unwrap();
        uf.union(0, 4);
        uf.union(1, 3);
        let json = serde_json::to_string(&uf).unwrap();
        let mut back: UnionFind = serde_json::from_str(&json).unwrap();
        assert_eq!(back.clusters(), uf.clusters());
    }

    #[test]
    fn long_chain_is_flattened() {
        let n = 10_000;
        let mut uf = UnionFind::new(n).unwrap();
        for i in 1..n as u32 {
            uf.union(i - 1, i);
        }
        let roots = uf.roots();
        assert!(roots.iter().all(|&r| r == roots[0]));
    }
}
