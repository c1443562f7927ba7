//! Corpus-wide line-level exact deduplication.
//!
//! Pass one counts every non-blank (trimmed) line across all documents.
//! Pass two rewrites each document, keeping only lines that occur exactly
//! once in the whole corpus. Blank lines are always kept.

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;
use std::collections::HashMap;
use std::hash::Hasher;

/// Line occurrence counts keyed by line hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineCounter {
    counts: HashMap<u64, u32>,
    lines_seen: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineStats {
    pub lines_in: usize,
    pub lines_removed: usize,
}

fn line_hash(line: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0x6c69_6e65, 0x6465_6475_70);
    hasher.write(line.as_bytes());
    hasher.finish()
}

impl LineCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count the lines of one document.
    pub fn observe(&mut self, text: &str) {
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            self.lines_seen += 1;
            *self.counts.entry(line_hash(trimmed)).or_insert(0) += 1;
        }
    }

    pub fn occurrences(&self, line: &str) -> u32 {
        self.counts
            .get(&line_hash(line.trim()))
            .copied()
            .unwrap_or(0)
    }

    /// Rewrite one document, dropping repeated lines. Returns the new text
    /// and the number of lines removed.
    pub fn rewrite(&self, text: &str) -> (String, usize) {
        let mut out = String::with_capacity(text.len());
        let mut removed = 0;
        for line in text.split_inclusive('\n') {
            let trimmed = line.trim();
            if trimmed.is_empty() || self.occurrences(trimmed) == 1 {
                out.push_str(line);
            } else {
                removed += 1;
            }
        }
        if !text.ends_with('\n') && out.ends_with('\n') {
            out.pop();
            if out.ends_with('\r') {
                out.pop();
            }
        }
        (out, removed)
    }

    pub fn lines_seen(&self) -> usize {
        self.lines_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(docs: &[&str]) -> LineCounter {
        let mut c = LineCounter::new();
        for d in docs {
            c.observe(d);
        }
        c
    }

    #[test]
    fn removes_lines_repeated_across_documents() {
        let docs = ["header\nunique one\nfooter\n", "header\nunique two\nfooter\n"];
        let c = counter(&docs);
        assert_eq!(c.rewrite(docs[0]), ("unique one\n".to_string(), 2));
        assert_eq!(c.rewrite(docs[1]), ("unique two\n".to_string(), 2));
    }

    #[test]
    fn repeated_within_one_document_also_removed() {
        let doc = "same\nsame\nother";
        let c = counter(&[doc]);
        assert_eq!(c.rewrite(doc), ("other".to_string(), 2));
    }

    #[test]
    fn blank_lines_kept() {
        let docs = ["a\n\nb\n", "c\n\nd\n"];
        let c = counter(&docs);
        assert_eq!(c.rewrite(docs[0]).0, "a\n\nb\n");
    }

    #[test]
    fn no_trailing_newline_added() {
        let docs = ["keep\nshared", "shared\nalso"];
        let c = counter(&docs);
        assert_eq!(c.rewrite(docs[0]).0, "keep");
        assert_eq!(c.rewrite(docs[1]).0, "also");
    }

    #[test]
    fn whitespace_insensitive_match() {
        let docs = ["  shared  \nx\n", "shared\ny\n"];
        let c = counter(&docs);
        assert_eq!(c.occurrences("shared"), 2);
        assert_eq!(c.rewrite(docs[0]).0, "x\n");
    }
}
