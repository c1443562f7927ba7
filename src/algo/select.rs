use serde::{Deserialize, Serialize};

use super::union_find::Cluster;

/// Rule for picking the one document that survives from a cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepresentativePolicy {
    /// Earliest document in input order.
    #[default]
    FirstSeen,
    /// Longest text in characters; ties go to the earliest.
    Longest,
}

impl RepresentativePolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "first_seen" | "first" => Some(Self::FirstSeen),
            "longest" => Some(Self::Longest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstSeen => "first_seen",
            Self::Longest => "longest",
        }
    }
}

/// What the selector needs to know about each surviving document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocMeta {
    /// Position of the record in the source stream.
    pub seq: u64,
    pub id: String,
    /// Text length in characters.
    pub chars: usize,
}

/// Pick the representative index of a cluster.
pub fn representative(cluster: &Cluster, meta: &[DocMeta], policy: RepresentativePolicy) -> u32 {
    let key = |&i: &u32| {
        let m = &meta[i as usize];
        match policy {
            RepresentativePolicy::FirstSeen => (0, m.seq),
            RepresentativePolicy::Longest => (usize::MAX - m.chars, m.seq),
        }
    };
    cluster
        .members
        .iter()
        .copied()
        .min_by_key(|i| key(i))
        .unwrap_or(cluster.root)
}

/// Keep-flags over dense indices: `true` for singletons and representatives.
pub fn keep_flags(clusters: &[Cluster], meta: &[DocMeta], policy: RepresentativePolicy) -> Vec<bool> {
    let mut keep = vec![false; meta.len()];
    for c in clusters {
        keep[representative(c, meta, policy) as usize] = true;
    }
    keep
}
