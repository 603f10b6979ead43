//! Dictionary-driven repair of words glued together by scraping ("leatherseats").

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};

/// Minimum length of an alphabetic run before it is considered for splitting.
pub const MIN_CANDIDATE_LEN: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct WordDictionary {
    words: HashSet<String>,
    max_word_len: usize,
}

impl WordDictionary {
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let words: HashSet<String> = words
            .into_iter()
            .map(|w| w.as_ref().trim().to_ascii_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        let max_word_len = words.iter().map(String::len).max().unwrap_or(0);
        Self {
            words,
            max_word_len,
        }
    }

    /// Loads a newline-delimited word list, or a JSON array of strings for `.json` paths.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            let words: Vec<String> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(Self::from_words(words))
        } else {
            Ok(Self::from_words(
                text.lines().filter(|line| !line.trim_start().starts_with('#')),
            ))
        }
    }

    pub fn contains(&self, word: &str) -> bool {
        self.contains_lower(&word.to_ascii_lowercase())
    }

    /// Lookup for a word the caller has already lowercased.
    pub fn contains_lower(&self, lower: &str) -> bool {
        lower.len() <= self.max_word_len && self.words.contains(lower)
    }

    /// Byte length of the longest entry; no prefix longer than this can match.
    pub fn max_word_len(&self) -> usize {
        self.max_word_len
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Word → segmentation cache, scoped to one repair call.
#[derive(Debug, Default)]
pub struct SegmentMemo {
    cache: HashMap<String, Vec<String>>,
}

impl SegmentMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Greedy longest-prefix segmentation of one ASCII word.
///
/// A remainder that is itself a dictionary word is emitted in its original casing; prefixes are
/// emitted lowercased. An unsegmentable remainder contributes nothing. Only prefixes up to the
/// dictionary's longest word are tried, so the cost is linear in the word length.
pub fn segment_word(word: &str, dictionary: &WordDictionary, memo: &mut SegmentMemo) -> Vec<String> {
    if let Some(hit) = memo.cache.get(word) {
        return hit.clone();
    }

    let lower = word.to_ascii_lowercase();
    let mut segments = Vec::new();
    let mut start = 0;
    while start < word.len() {
        let rest = &lower[start..];
        if dictionary.contains_lower(rest) {
            segments.push(word[start..].to_string());
            break;
        }
        let longest = (rest.len() - 1).min(dictionary.max_word_len());
        let prefix = (1..=longest)
            .rev()
            .filter(|&end| rest.is_char_boundary(end))
            .find(|&end| dictionary.contains_lower(&rest[..end]));
        let Some(end) = prefix else {
            break;
        };
        segments.push(rest[..end].to_string());
        start += end;
    }

    memo.cache.insert(word.to_string(), segments.clone());
    segments
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_candidate(token: &str) -> bool {
    token.len() >= MIN_CANDIDATE_LEN && token.chars().all(|c| c.is_ascii_alphabetic())
}

/// Splits concatenated words in `text`; everything that is not a split candidate is kept verbatim.
pub fn repair_concatenated_words(text: &str, dictionary: &WordDictionary) -> String {
    let mut memo = SegmentMemo::new();
    let mut out = String::with_capacity(text.len() + 8);
    let mut rest = text;

    while let Some(first) = rest.chars().next() {
        let in_word = is_word_char(first);
        let split = rest
            .char_indices()
            .find(|&(_, c)| is_word_char(c) != in_word)
            .map_or(rest.len(), |(i, _)| i);
        let (token, tail) = rest.split_at(split);
        rest = tail;

        if in_word && is_candidate(token) {
            let segments = segment_word(token, dictionary, &mut memo);
            if segments.len() > 1 {
                out.push_str(&segments.join(" "));
                continue;
            }
        }
        out.push_str(token);
    }
    out
}
