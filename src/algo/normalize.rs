use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

/// How raw document text is canonicalized before digesting and shingling.
///
/// Whitespace is always collapsed to single spaces and trimmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizePolicy {
    /// Lowercase the text before comparison.
    pub lowercase: bool,
    /// Drop punctuation and symbols, keeping only Unicode word segments.
    pub strip_punctuation: bool,
}

impl Default for NormalizePolicy {
    fn default() -> Self {
        Self {
            lowercase: true,
            strip_punctuation: false,
        }
    }
}

/// Normalize text into its canonical comparison form.
pub fn normalize(text: &str, policy: &NormalizePolicy) -> String {
    tokens(text, policy).join(" ")
}

/// Split text into normalized tokens.
pub fn tokens(text: &str, policy: &NormalizePolicy) -> Vec<String> {
    let case = |w: &str| {
        if policy.lowercase {
            w.to_lowercase()
        } else {
            w.to_string()
        }
    };
    if policy.strip_punctuation {
        text.unicode_words().map(case).collect()
    } else {
        text.split_whitespace().map(case).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace_and_lowercases() {
        let p = NormalizePolicy::default();
        assert_eq!(normalize("  The  Cat\n\tSat ", &p), "the cat sat");
    }

    #[test]
    fn keeps_case_when_disabled() {
        let p = NormalizePolicy {
            lowercase: false,
            strip_punctuation: false,
        };
        assert_eq!(normalize("The Cat", &p), "The Cat");
    }

    #[test]
    fn strips_punctuation() {
        let p = NormalizePolicy {
            lowercase: true,
            strip_punctuation: true,
        };
        assert_eq!(tokens("Hello, World! It's here.", &p), vec!["hello", "world", "it's", "here"]);
    }

    #[test]
    fn punctuation_kept_by_default() {
        let p = NormalizePolicy::default();
        assert_eq!(tokens("Hello, world!", &p), vec!["hello,", "world!"]);
    }

    #[test]
    fn empty_text_has_no_tokens() {
        let p = NormalizePolicy::default();
        assert!(tokens("   \n ", &p).is_empty());
        assert_eq!(normalize("", &p), "");
    }
}
