//! Consistency scoring: repeated responses → one scalar per unit.
//!
//! A unit's score is the mean pairwise similarity over every unordered pair of
//! its normalized responses. The similarity function is injected; this module
//! only owns normalization, aggregation and the failure contract (a failed
//! pair nulls the unit, it is never counted as zero).

use std::collections::{BTreeMap, HashMap};

use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::design::ExperimentalUnit;
use crate::error::ScoringBackendError;

static BOLD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\*(.*?)\*\*").expect("Invalid bold regex"));
static UNDERSCORE_BOLD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"__(.*?)__").expect("Invalid underscore bold regex"));
static LIST_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+\.\s*").expect("Invalid list number regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("Invalid whitespace regex"));

// ---------------------------------------------------------------------
//  Normalization
// ---------------------------------------------------------------------

fn normalize_pass(text: &str) -> String {
    let text = text.replace('\n', " ");
    let text = BOLD.replace_all(&text, "$1");
    let text = UNDERSCORE_BOLD.replace_all(&text, "$1");
    let text = LIST_NUMBER.replace_all(&text, "");
    let text = WHITESPACE.replace_all(&text, " ");
    text.trim().to_string()
}

/// Strip emphasis and list numbering, collapse whitespace, trim.
///
/// Runs to a fixed point, so `normalize(normalize(x)) == normalize(x)` even
/// when one rewrite exposes another (e.g. `*1.*x*1.*`).
pub fn normalize(text: &str) -> String {
    let mut current = normalize_pass(text);
    loop {
        let next = normalize_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

// ---------------------------------------------------------------------
//  Backends
// ---------------------------------------------------------------------

/// Semantic similarity between a reference and a candidate response.
///
/// Implementations should return a value in [0, 1]; anything else is
/// reported as [`ScoringBackendError::OutOfRange`].
pub trait SimilarityBackend: Send + Sync {
    fn similarity(&self, reference: &str, candidate: &str) -> Result<f64, ScoringBackendError>;
}

impl<F> SimilarityBackend for F
where
    F: Fn(&str, &str) -> Result<f64, ScoringBackendError> + Send + Sync,
{
    fn similarity(&self, reference: &str, candidate: &str) -> Result<f64, ScoringBackendError> {
        self(reference, candidate)
    }
}

/// Async flavour for backends that call out to an inference service.
#[async_trait::async_trait]
pub trait AsyncSimilarityBackend: Send + Sync {
    async fn similarity(&self, reference: &str, candidate: &str)
        -> Result<f64, ScoringBackendError>;
}

/// Run a blocking backend through the async scorer.
pub struct SyncBackend<B>(pub B);

#[async_trait::async_trait]
impl<B: SimilarityBackend> AsyncSimilarityBackend for SyncBackend<B> {
    async fn similarity(
        &self,
        reference: &str,
        candidate: &str,
    ) -> Result<f64, ScoringBackendError> {
        self.0.similarity(reference, candidate)
    }
}

/// Token-overlap F1 over lowercase whitespace tokens.
///
/// A deterministic offline stand-in for an embedding-based scorer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalSimilarity;

impl SimilarityBackend for LexicalSimilarity {
    fn similarity(&self, reference: &str, candidate: &str) -> Result<f64, ScoringBackendError> {
        let ref_counts = token_counts(reference);
        let cand_counts = token_counts(candidate);
        let ref_total: usize = ref_counts.values().sum();
        let cand_total: usize = cand_counts.values().sum();
        if ref_total == 0 && cand_total == 0 {
            return Ok(1.0);
        }
        if ref_total == 0 || cand_total == 0 {
            return Ok(0.0);
        }
        let overlap: usize = cand_counts
            .iter()
            .map(|(tok, &n)| n.min(ref_counts.get(tok).copied().unwrap_or(0)))
            .sum();
        if overlap == 0 {
            return Ok(0.0);
        }
        let precision = overlap as f64 / cand_total as f64;
        let recall = overlap as f64 / ref_total as f64;
        Ok(2.0 * precision * recall / (precision + recall))
    }
}

fn token_counts(text: &str) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for token in text.split_whitespace() {
        let token: String = token
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();
        if !token.is_empty() {
            *counts.entry(token).or_insert(0) += 1;
        }
    }
    counts
}

// ---------------------------------------------------------------------
//  Scorer
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    /// Units with fewer responses get a null score.
    pub min_responses: usize,
    /// Apply [`normalize`] before comparing.
    pub normalize: bool,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            min_responses: 2,
            normalize: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub unit_id: u64,
    pub reason: String,
}

/// What happened to each unit during a scoring pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoringSummary {
    pub scored: usize,
    /// Units left with a null score for lack of responses.
    pub insufficient: Vec<u64>,
    pub failed: Vec<UnitFailure>,
    /// Units already frozen by an earlier pass.
    pub skipped: Vec<u64>,
}

pub struct ConsistencyScorer<B> {
    backend: B,
    config: ScorerConfig,
}

impl<B: SimilarityBackend> ConsistencyScorer<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, ScorerConfig::default())
    }

    pub fn with_config(backend: B, config: ScorerConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    pub fn pairwise_similarity(&self, a: &str, b: &str) -> Result<f64, ScoringBackendError> {
        checked(self.backend.similarity(a, b))
    }

    /// Mean similarity over all C(n, 2) unordered pairs.
    ///
    /// `Ok(None)` when there are too few responses; `Err` when any pair fails.
    pub fn score_unit<S: AsRef<str>>(
        &self,
        responses: &[S],
    ) -> Result<Option<f64>, ScoringBackendError> {
        if responses.len() < self.config.min_responses.max(2) {
            return Ok(None);
        }
        let texts = prepare(responses, &self.config);
        let mut sum = 0.0;
        let mut pairs = 0usize;
        for i in 0..texts.len() {
            for j in (i + 1)..texts.len() {
                sum += self.pairwise_similarity(&texts[i], &texts[j])?;
                pairs += 1;
            }
        }
        Ok(Some(sum / pairs as f64))
    }

    /// Score a `{unit_id: responses}` mapping; each entry is independent.
    pub fn score_responses(
        &self,
        responses: &BTreeMap<u64, Vec<String>>,
    ) -> BTreeMap<u64, Result<Option<f64>, ScoringBackendError>> {
        responses
            .iter()
            .map(|(&id, texts)| (id, self.score_unit(texts)))
            .collect()
    }

    /// Score every unit independently. Failures null that unit only.
    pub fn score_experiment(&self, units: &mut [ExperimentalUnit]) -> ScoringSummary {
        let mut summary = ScoringSummary::default();
        let total = units.len();
        for (idx, unit) in units.iter_mut().enumerate() {
            if unit.is_frozen() {
                summary.skipped.push(unit.id);
                continue;
            }
            debug!(unit_id = unit.id, progress = idx + 1, total, "scoring unit");
            let outcome = self.score_unit(&unit.responses);
            record_outcome(unit, outcome, &mut summary);
        }
        log_summary(&summary);
        summary
    }
}

/// Async counterpart of [`ConsistencyScorer::score_experiment`].
///
/// Units are scored concurrently (at most `concurrency` in flight); pairs
/// within a unit are evaluated in order.
pub async fn score_experiment_concurrent<B>(
    units: &mut [ExperimentalUnit],
    backend: &B,
    config: &ScorerConfig,
    concurrency: usize,
) -> ScoringSummary
where
    B: AsyncSimilarityBackend + ?Sized,
{
    let mut summary = ScoringSummary::default();
    let mut pending: Vec<(usize, Vec<String>)> = Vec::new();
    for (idx, unit) in units.iter().enumerate() {
        if unit.is_frozen() {
            summary.skipped.push(unit.id);
        } else {
            pending.push((idx, unit.responses.clone()));
        }
    }

    let min_responses = config.min_responses.max(2);
    let mut results: Vec<(usize, Result<Option<f64>, ScoringBackendError>)> =
        stream::iter(pending.into_iter().map(|(idx, responses)| async move {
            if responses.len() < min_responses {
                return (idx, Ok(None));
            }
            let texts = prepare(&responses, config);
            let mut sum = 0.0;
            let mut pairs = 0usize;
            for i in 0..texts.len() {
                for j in (i + 1)..texts.len() {
                    match checked(backend.similarity(&texts[i], &texts[j]).await) {
                        Ok(v) => sum += v,
                        Err(e) => return (idx, Err(e)),
                    }
                    pairs += 1;
                }
            }
            (idx, Ok(Some(sum / pairs as f64)))
        }))
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    results.sort_by_key(|(idx, _)| *idx);
    for (idx, outcome) in results {
        record_outcome(&mut units[idx], outcome, &mut summary);
    }
    log_summary(&summary);
    summary
}

fn prepare<S: AsRef<str>>(responses: &[S], config: &ScorerConfig) -> Vec<String> {
    responses
        .iter()
        .map(|r| {
            if config.normalize {
                normalize(r.as_ref())
            } else {
                r.as_ref().to_string()
            }
        })
        .collect()
}

fn checked(value: Result<f64, ScoringBackendError>) -> Result<f64, ScoringBackendError> {
    let v = value?;
    if v.is_finite() && (0.0..=1.0).contains(&v) {
        Ok(v)
    } else {
        Err(ScoringBackendError::OutOfRange(v))
    }
}

fn record_outcome(
    unit: &mut ExperimentalUnit,
    outcome: Result<Option<f64>, ScoringBackendError>,
    summary: &mut ScoringSummary,
) {
    match outcome {
        Ok(Some(score)) => {
            unit.score = Some(score);
            summary.scored += 1;
        }
        Ok(None) => {
            unit.score = None;
            summary.insufficient.push(unit.id);
            debug!(
                unit_id = unit.id,
                responses = unit.responses.len(),
                "too few responses; score left null"
            );
        }
        Err(err) => {
            warn!(unit_id = unit.id, code = err.code(), error = %err, "scoring failed; score left null");
            unit.score = None;
            unit.score_error = Some(err.to_string());
            summary.failed.push(UnitFailure {
                unit_id: unit.id,
                reason: err.to_string(),
            });
        }
    }
}

fn log_summary(summary: &ScoringSummary) {
    info!(
        scored = summary.scored,
        insufficient = summary.insufficient.len(),
        failed = summary.failed.len(),
        skipped = summary.skipped.len(),
        "consistency scoring finished"
    );
}

// ---------------------------------------------------------------------
//  Descriptive statistics over scored units
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub n: usize,
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl ScoreSummary {
    pub fn from_scores(scores: &[f64]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }
        let n = scores.len();
        let mean = scores.iter().sum::<f64>() / n as f64;
        let var = scores.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / n as f64;
        Some(Self {
            n,
            mean,
            std: var.max(0.0).sqrt(),
            min: scores.iter().copied().fold(f64::INFINITY, f64::min),
            max: scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyStatistics {
    pub overall: Option<ScoreSummary>,
    /// dimension (factor or block) → level → summary
    pub by_dimension: BTreeMap<String, BTreeMap<String, ScoreSummary>>,
}

/// Per-level score summaries for every factor in the units' combinations and
/// for the block dimension under `block_name`.
pub fn consistency_statistics(units: &[ExperimentalUnit], block_name: &str) -> ConsistencyStatistics {
    let mut groups: BTreeMap<String, BTreeMap<String, Vec<f64>>> = BTreeMap::new();
    let mut all = Vec::new();
    for unit in units {
        let Some(score) = unit.score else {
            continue;
        };
        all.push(score);
        for (factor, level) in unit.combination.iter() {
            groups
                .entry(factor.to_string())
                .or_default()
                .entry(level.to_string())
                .or_default()
                .push(score);
        }
        groups
            .entry(block_name.to_string())
            .or_default()
            .entry(unit.block.clone())
            .or_default()
            .push(score);
    }

    ConsistencyStatistics {
        overall: ScoreSummary::from_scores(&all),
        by_dimension: groups
            .into_iter()
            .map(|(dim, levels)| {
                let levels = levels
                    .into_iter()
                    .filter_map(|(level, scores)| {
                        ScoreSummary::from_scores(&scores).map(|s| (level, s))
                    })
                    .collect();
                (dim, levels)
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_markup() {
        assert_eq!(normalize("**Bold** 1. item\n\nmore"), "Bold item more");
        assert_eq!(normalize("  __under__\tline  "), "under line");
    }

    #[test]
    fn normalize_is_idempotent_on_nested_markup() {
        for input in [
            "*1.*x*1.*",
            "***a***",
            "1.2.3. done",
            "**a** **b**\n2. **c**",
            "",
            "   ",
        ] {
            let once = normalize(input);
            assert_eq!(normalize(&once), once, "input {input:?}");
        }
    }

    #[test]
    fn lexical_similarity_bounds() {
        let s = LexicalSimilarity;
        assert_eq!(s.similarity("a b c", "a b c").unwrap(), 1.0);
        assert_eq!(s.similarity("a b", "c d").unwrap(), 0.0);
        let mid = s.similarity("a b c d", "a b").unwrap();
        assert!(mid > 0.0 && mid < 1.0);
        assert_eq!(s.similarity("Hello, World", "hello world").unwrap(), 1.0);
    }

    #[test]
    fn out_of_range_backend_values_fail_the_unit() {
        let scorer = ConsistencyScorer::new(|_: &str, _: &str| Ok::<f64, ScoringBackendError>(1.5));
        assert_eq!(
            scorer.score_unit(&["a", "b"]),
            Err(ScoringBackendError::OutOfRange(1.5))
        );
    }
}
