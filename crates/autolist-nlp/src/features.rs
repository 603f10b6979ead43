//! Synonym compilation, fuzzy phrase matching and per-listing feature grouping.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use autolist_core::{FeatureCategory, GroupedFeatures};
use serde::{Deserialize, Serialize};
use strsim::normalized_levenshtein;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::segment::{repair_concatenated_words, WordDictionary};

pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.8;

/// `entity_type → canonical feature → phrases`, as declared in `rules/entity-groups.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityGroups(pub BTreeMap<String, BTreeMap<String, Vec<String>>>);

impl EntityGroups {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

/// Lowercase base form (`-`/`_` become spaces) plus its hyphen- and underscore-joined forms.
pub fn normalize_variants(phrase: &str) -> Vec<String> {
    let base = phrase
        .to_lowercase()
        .replace(['-', '_'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if base.is_empty() {
        return Vec::new();
    }
    let mut variants = Vec::with_capacity(3);
    for candidate in [base.clone(), base.replace(' ', "-"), base.replace(' ', "_")] {
        if !variants.contains(&candidate) {
            variants.push(candidate);
        }
    }
    variants
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynonymEntry {
    pub entity_type: String,
    pub canonical: String,
    pub variant: String,
    token_count: usize,
}

/// Expands every configured phrase into its variants. The canonical key only labels its phrases
/// and is never matched itself. Entity types outside the category table are skipped.
pub fn compile_synonyms(groups: &EntityGroups) -> Vec<SynonymEntry> {
    let mut entries = Vec::new();
    for (entity_type, canonicals) in &groups.0 {
        if FeatureCategory::from_entity_type(entity_type).is_none() {
            warn!(entity_type, "skipping entity group with no feature category");
            continue;
        }
        for (canonical, phrases) in canonicals {
            let mut seen: Vec<String> = Vec::new();
            for phrase in phrases {
                for variant in normalize_variants(phrase) {
                    if seen.contains(&variant) {
                        continue;
                    }
                    seen.push(variant.clone());
                    entries.push(SynonymEntry {
                        entity_type: entity_type.clone(),
                        canonical: canonical.clone(),
                        token_count: tokenize(&variant).len(),
                        variant,
                    });
                }
            }
        }
    }
    entries
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMatch {
    pub entity_type: String,
    pub canonical: String,
    /// Matched text, sliced from the input.
    pub span: String,
    pub start: usize,
    pub end: usize,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentGuess {
    pub label: String,
    pub confidence: f64,
}

pub trait FeatureMatcher: Send + Sync {
    /// Non-overlapping matches in text order.
    fn find_entities(&self, text: &str) -> Vec<EntityMatch>;

    fn classify(&self, text: &str) -> Option<IntentGuess>;
}

#[derive(Debug, Clone, Copy)]
struct Token {
    start: usize,
    end: usize,
}

fn is_token_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '_' | '\'')
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        match (is_token_char(c), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                tokens.push(Token { start: s, end: i });
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        tokens.push(Token {
            start: s,
            end: text.len(),
        });
    }
    tokens
}

/// Fuzzy n-gram matcher over compiled synonym variants.
#[derive(Debug, Clone)]
pub struct SynonymMatcher {
    entries: Vec<SynonymEntry>,
    threshold: f64,
    /// token → (entity type, weight), weight split evenly across the types sharing the token.
    intent_weights: HashMap<String, Vec<(String, f64)>>,
}

impl SynonymMatcher {
    pub fn train(groups: &EntityGroups, threshold: f64) -> Self {
        let entries = compile_synonyms(groups);

        let mut owners: HashMap<String, Vec<String>> = HashMap::new();
        for entry in &entries {
            for token in entry.variant.split(' ') {
                let types = owners.entry(token.to_string()).or_default();
                if !types.contains(&entry.entity_type) {
                    types.push(entry.entity_type.clone());
                }
            }
        }
        let intent_weights = owners
            .into_iter()
            .map(|(token, types)| {
                let weight = 1.0 / types.len() as f64;
                let weighted = types.into_iter().map(|t| (t, weight)).collect();
                (token, weighted)
            })
            .collect();

        info!(variants = entries.len(), threshold, "trained synonym matcher");
        Self {
            entries,
            threshold,
            intent_weights,
        }
    }
}

impl FeatureMatcher for SynonymMatcher {
    fn find_entities(&self, text: &str) -> Vec<EntityMatch> {
        let tokens = tokenize(text);
        let mut candidates: Vec<(usize, usize, EntityMatch)> = Vec::new();

        for entry in &self.entries {
            let n = entry.token_count;
            if n == 0 || n > tokens.len() {
                continue;
            }
            for first in 0..=tokens.len() - n {
                let window = &tokens[first..first + n];
                let joined = window
                    .iter()
                    .map(|t| &text[t.start..t.end])
                    .collect::<Vec<_>>()
                    .join(" ");
                let score = normalized_levenshtein(&joined, &entry.variant);
                if score < self.threshold {
                    continue;
                }
                let start = window[0].start;
                let end = window[n - 1].end;
                candidates.push((
                    first,
                    n,
                    EntityMatch {
                        entity_type: entry.entity_type.clone(),
                        canonical: entry.canonical.clone(),
                        span: text[start..end].to_string(),
                        start,
                        end,
                        score,
                    },
                ));
            }
        }

        candidates.sort_by(|a, b| {
            b.2.score
                .total_cmp(&a.2.score)
                .then(b.1.cmp(&a.1))
                .then(a.0.cmp(&b.0))
        });

        let mut taken = vec![false; tokens.len()];
        let mut accepted = Vec::new();
        for (first, n, found) in candidates {
            if taken[first..first + n].iter().any(|t| *t) {
                continue;
            }
            taken[first..first + n].iter_mut().for_each(|t| *t = true);
            accepted.push(found);
        }
        accepted.sort_by_key(|m| m.start);
        accepted
    }

    fn classify(&self, text: &str) -> Option<IntentGuess> {
        let mut scores: BTreeMap<FeatureCategory, f64> = BTreeMap::new();
        for token in tokenize(text) {
            let Some(weights) = self.intent_weights.get(&text[token.start..token.end]) else {
                continue;
            };
            for (entity_type, weight) in weights {
                if let Some(category) = FeatureCategory::from_entity_type(entity_type) {
                    *scores.entry(category).or_default() += weight;
                }
            }
        }

        let total: f64 = scores.values().sum();
        let mut best: Option<(FeatureCategory, f64)> = None;
        for (category, score) in scores {
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((category, score));
            }
        }
        best.filter(|_| total > 0.0).map(|(category, score)| IntentGuess {
            label: category.intent_label(),
            confidence: score / total,
        })
    }
}

/// Hands out a trained matcher, training it on first use.
#[async_trait]
pub trait MatcherProvider: Send + Sync {
    async fn matcher(&self) -> anyhow::Result<Arc<dyn FeatureMatcher>>;
}

#[derive(Debug, Clone)]
enum GroupsSource {
    Path(PathBuf),
    Inline(EntityGroups),
}

/// One-shot matcher initialization shared by all callers of the same instance.
#[derive(Debug)]
pub struct LazySynonymMatcher {
    source: GroupsSource,
    threshold: f64,
    cell: OnceCell<Arc<SynonymMatcher>>,
}

impl LazySynonymMatcher {
    pub fn from_path(path: impl Into<PathBuf>, threshold: f64) -> Self {
        Self {
            source: GroupsSource::Path(path.into()),
            threshold,
            cell: OnceCell::new(),
        }
    }

    pub fn from_groups(groups: EntityGroups, threshold: f64) -> Self {
        Self {
            source: GroupsSource::Inline(groups),
            threshold,
            cell: OnceCell::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    async fn init(&self) -> anyhow::Result<Arc<SynonymMatcher>> {
        let source = self.source.clone();
        let threshold = self.threshold;
        let trained = tokio::task::spawn_blocking(move || -> anyhow::Result<SynonymMatcher> {
            let groups = match source {
                GroupsSource::Path(path) => EntityGroups::load(path)?,
                GroupsSource::Inline(groups) => groups,
            };
            Ok(SynonymMatcher::train(&groups, threshold))
        })
        .await
        .context("synonym matcher training task failed")??;
        Ok(Arc::new(trained))
    }
}

#[async_trait]
impl MatcherProvider for LazySynonymMatcher {
    async fn matcher(&self) -> anyhow::Result<Arc<dyn FeatureMatcher>> {
        let matcher = self.cell.get_or_try_init(|| self.init()).await?;
        Ok(matcher.clone() as Arc<dyn FeatureMatcher>)
    }
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("feature matcher unavailable: {0:#}")]
    Setup(#[from] anyhow::Error),
    #[error("feature matching task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureExtraction {
    pub original_description: String,
    pub grouped_features: GroupedFeatures,
    pub top_intent: Option<String>,
    pub entities: Vec<EntityMatch>,
}

impl FeatureExtraction {
    fn empty(original_description: &str) -> Self {
        Self {
            original_description: original_description.to_string(),
            grouped_features: GroupedFeatures::default(),
            top_intent: None,
            entities: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct FeatureEngine {
    provider: Arc<dyn MatcherProvider>,
    dictionary: Arc<WordDictionary>,
}

impl FeatureEngine {
    pub fn new(provider: Arc<dyn MatcherProvider>, dictionary: Arc<WordDictionary>) -> Self {
        Self {
            provider,
            dictionary,
        }
    }

    pub async fn extract(&self, description: Option<&str>) -> Result<FeatureExtraction, FeatureError> {
        let original = description.unwrap_or_default();
        if original.trim().is_empty() {
            return Ok(FeatureExtraction::empty(original));
        }

        let repaired = repair_concatenated_words(original, &self.dictionary);
        let lowered = repaired.to_lowercase();
        let matcher = self.provider.matcher().await?;
        let (entities, intent) = tokio::task::spawn_blocking(move || {
            (matcher.find_entities(&lowered), matcher.classify(&lowered))
        })
        .await?;

        let mut grouped = GroupedFeatures::default();
        for entity in &entities {
            match FeatureCategory::from_entity_type(&entity.entity_type) {
                Some(category) => {
                    grouped.push_unique(category, &entity.span);
                }
                None => warn!(
                    entity_type = %entity.entity_type,
                    span = %entity.span,
                    "dropping match with unmapped entity type"
                ),
            }
        }
        debug!(
            entities = entities.len(),
            spans = grouped.total_spans(),
            "extracted description features"
        );

        Ok(FeatureExtraction {
            original_description: original.to_string(),
            grouped_features: grouped,
            top_intent: intent.map(|guess| guess.label),
            entities,
        })
    }
}
