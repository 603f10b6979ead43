//! Description text repair and synonym-driven feature grouping.

pub mod features;
pub mod segment;

pub use features::{
    compile_synonyms, normalize_variants, EntityGroups, EntityMatch, FeatureEngine, FeatureError,
    FeatureExtraction, FeatureMatcher, IntentGuess, LazySynonymMatcher, MatcherProvider,
    SynonymEntry, SynonymMatcher, DEFAULT_MATCH_THRESHOLD,
};
pub use segment::{repair_concatenated_words, segment_word, SegmentMemo, WordDictionary};

pub const CRATE_NAME: &str = "autolist-nlp";
