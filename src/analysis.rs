//! Variance decomposition over scored units.
//!
//! Two paths run side by side:
//!
//! 1. **Model path**: OLS with Type II ANOVA (see [`crate::linear_model`]).
//!    Singular or saturated designs produce [`ModelOutcome::Degraded`].
//! 2. **Group-mean path**: per-level means, ranges and standardized effects.
//!    Always available as long as a level has at least one observation.
//!
//! Effect sizes follow two conventions, recorded on every estimate:
//! pooled Cohen's d for two-level factors (eta-squared beyond two) and
//! range over overall standard deviation for the blocking dimension.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::design::{ExperimentalUnit, Factor, FactorCombination};
use crate::error::{ConfigurationError, ModelFitError};
use crate::linear_model::{self, FittedModel, ModelFrame, ModelSpec, Term};
use crate::power;

/// Significance level for the RCBD report.
pub const DEFAULT_ALPHA: f64 = 0.05;

// =============================================================================
// Analysis table
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRow {
    pub unit_id: u64,
    pub levels: FactorCombination,
    pub block: String,
    pub score: f64,
}

/// Scored units flattened for analysis. Unscored units never appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTable {
    pub factors: Vec<Factor>,
    pub block_name: String,
    pub rows: Vec<AnalysisRow>,
}

/// Keep units with a score; drop the rest.
pub fn build_table(units: &[ExperimentalUnit], factors: &[Factor], block_name: &str) -> AnalysisTable {
    let rows: Vec<AnalysisRow> = units
        .iter()
        .filter_map(|u| {
            u.score.map(|score| AnalysisRow {
                unit_id: u.id,
                levels: u.combination.clone(),
                block: u.block.clone(),
                score,
            })
        })
        .collect();
    debug!(
        units = units.len(),
        scored = rows.len(),
        "analysis table built"
    );
    AnalysisTable {
        factors: factors.to_vec(),
        block_name: block_name.to_string(),
        rows,
    }
}

impl AnalysisTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn scores(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.score).collect()
    }

    /// Block levels in first-appearance order.
    pub fn block_levels(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for row in &self.rows {
            if !out.contains(&row.block) {
                out.push(row.block.clone());
            }
        }
        out
    }

    /// Level of `dimension` (a factor or the block name) for a row.
    fn level_of<'a>(&self, row: &'a AnalysisRow, dimension: &str) -> Option<&'a str> {
        if dimension == self.block_name {
            Some(row.block.as_str())
        } else {
            row.levels.level(dimension)
        }
    }

    /// Declared level order for a dimension; observed order for the block.
    fn dimension_levels(&self, dimension: &str) -> Vec<String> {
        if dimension == self.block_name {
            return self.block_levels();
        }
        self.factors
            .iter()
            .find(|f| f.name == dimension)
            .map(|f| f.levels.clone())
            .unwrap_or_default()
    }

    pub fn scores_where(&self, dimension: &str, level: &str) -> Vec<f64> {
        self.rows
            .iter()
            .filter(|r| self.level_of(r, dimension) == Some(level))
            .map(|r| r.score)
            .collect()
    }

    fn frame(&self, variables: &[String]) -> Result<ModelFrame, ModelFitError> {
        let mut frame = ModelFrame::new(self.scores());
        for var in variables {
            let values: Vec<&str> = self
                .rows
                .iter()
                .map(|r| self.level_of(r, var).unwrap_or(""))
                .collect();
            frame.add_categorical(var.as_str(), &values, &self.dimension_levels(var))?;
        }
        Ok(frame)
    }

    fn factor_names(&self) -> Vec<String> {
        self.factors.iter().map(|f| f.name.clone()).collect()
    }
}

// =============================================================================
// Effect estimates
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelStats {
    pub level: String,
    pub n: usize,
    pub mean: f64,
    /// Sample standard deviation; `None` below two observations.
    pub std: Option<f64>,
}

impl LevelStats {
    fn from_scores(level: &str, scores: &[f64]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }
        let n = scores.len();
        let mean = scores.iter().sum::<f64>() / n as f64;
        let std = (n >= 2).then(|| {
            let var = scores.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / (n - 1) as f64;
            var.sqrt()
        });
        Some(Self {
            level: level.to_string(),
            n,
            mean,
            std,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectConvention {
    /// Pooled-variance standardized mean difference of two levels.
    CohensD,
    /// One-way between-level share of total sum of squares.
    EtaSquared,
    /// (max level mean − min level mean) / overall sample std.
    StandardizedRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StandardizedEffect {
    pub convention: EffectConvention,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectEstimate {
    pub dimension: String,
    /// Observed levels in declared order.
    pub levels: Vec<LevelStats>,
    /// Largest minus smallest level mean.
    pub magnitude: f64,
    pub effect: Option<StandardizedEffect>,
    pub warnings: Vec<String>,
}

impl EffectEstimate {
    pub fn level(&self, level: &str) -> Option<&LevelStats> {
        self.levels.iter().find(|l| l.level == level)
    }
}

fn group_levels(
    table: &AnalysisTable,
    dimension: &str,
    warnings: &mut Vec<String>,
) -> Vec<(LevelStats, Vec<f64>)> {
    let mut out = Vec::new();
    for level in table.dimension_levels(dimension) {
        let scores = table.scores_where(dimension, &level);
        match LevelStats::from_scores(&level, &scores) {
            Some(stats) => out.push((stats, scores)),
            None => {
                warn!(dimension, level = %level, "level has no scored observations; excluded");
                warnings.push(format!("level `{level}` has no scored observations"));
            }
        }
    }
    out
}

fn magnitude(groups: &[(LevelStats, Vec<f64>)]) -> f64 {
    let means = groups.iter().map(|(s, _)| s.mean);
    let max = means.clone().fold(f64::NEG_INFINITY, f64::max);
    let min = means.fold(f64::INFINITY, f64::min);
    max - min
}

fn one_way_eta_squared(groups: &[(LevelStats, Vec<f64>)]) -> Option<f64> {
    let all: Vec<f64> = groups.iter().flat_map(|(_, s)| s.iter().copied()).collect();
    let grand = all.iter().sum::<f64>() / all.len() as f64;
    let total: f64 = all.iter().map(|v| (v - grand) * (v - grand)).sum();
    if total <= 0.0 {
        return None;
    }
    let between: f64 = groups
        .iter()
        .map(|(s, _)| s.n as f64 * (s.mean - grand) * (s.mean - grand))
        .sum();
    Some(between / total)
}

fn factor_effect(table: &AnalysisTable, factor: &Factor) -> Option<EffectEstimate> {
    let mut warnings = Vec::new();
    let groups = group_levels(table, &factor.name, &mut warnings);
    if groups.is_empty() {
        warn!(factor = %factor.name, "factor has no scored observations; omitted");
        return None;
    }

    let effect = if factor.levels.len() == 2 {
        if groups.len() == 2 {
            match power::cohens_d(&groups[0].1, &groups[1].1) {
                Ok(d) => Some(StandardizedEffect {
                    convention: EffectConvention::CohensD,
                    value: d,
                }),
                Err(err) => {
                    warn!(factor = %factor.name, error = %err, "cohen's d not estimable");
                    warnings.push(format!("standardized effect omitted: {err}"));
                    None
                }
            }
        } else {
            warnings.push("standardized effect omitted: only one level observed".to_string());
            None
        }
    } else {
        let eta = one_way_eta_squared(&groups);
        if eta.is_none() {
            warnings.push("standardized effect omitted: scores have no variance".to_string());
        }
        eta.map(|value| StandardizedEffect {
            convention: EffectConvention::EtaSquared,
            value,
        })
    };

    Some(EffectEstimate {
        dimension: factor.name.clone(),
        magnitude: magnitude(&groups),
        levels: groups.into_iter().map(|(s, _)| s).collect(),
        effect,
        warnings,
    })
}

/// Group-mean main effect of every declared factor.
///
/// Factors with no scored observations at all are omitted.
pub fn main_effects(table: &AnalysisTable) -> BTreeMap<String, EffectEstimate> {
    table
        .factors
        .iter()
        .filter_map(|f| factor_effect(table, f).map(|e| (f.name.clone(), e)))
        .collect()
}

/// Group-mean effect of the blocking dimension. `None` for an empty table.
pub fn block_effects(table: &AnalysisTable) -> Option<EffectEstimate> {
    if table.is_empty() {
        return None;
    }
    let mut warnings = Vec::new();
    let groups = group_levels(table, &table.block_name, &mut warnings);
    let magnitude = magnitude(&groups);

    let scores = table.scores();
    let effect = LevelStats::from_scores(&table.block_name, &scores)
        .and_then(|overall| overall.std)
        .filter(|std| *std > 0.0)
        .map(|std| StandardizedEffect {
            convention: EffectConvention::StandardizedRange,
            value: magnitude / std,
        });
    if effect.is_none() {
        warnings.push("standardized effect omitted: scores have no variance".to_string());
    }

    Some(EffectEstimate {
        dimension: table.block_name.clone(),
        levels: groups.into_iter().map(|(s, _)| s).collect(),
        magnitude,
        effect,
        warnings,
    })
}

// =============================================================================
// Interactions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionCell {
    pub first_level: String,
    pub second_level: String,
    pub n: usize,
    /// `None` for an empty cell.
    pub mean: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionTable {
    pub first: String,
    pub second: String,
    pub cells: Vec<InteractionCell>,
    /// 2×2 difference of differences, when both dimensions have two levels
    /// and every cell is filled.
    pub contrast: Option<f64>,
}

impl InteractionTable {
    pub fn cell(&self, first_level: &str, second_level: &str) -> Option<&InteractionCell> {
        self.cells
            .iter()
            .find(|c| c.first_level == first_level && c.second_level == second_level)
    }
}

/// Level × level mean table for two dimensions (factors or the block).
pub fn interaction_table(table: &AnalysisTable, first: &str, second: &str) -> InteractionTable {
    let first_levels = table.dimension_levels(first);
    let second_levels = table.dimension_levels(second);
    let mut cells = Vec::with_capacity(first_levels.len() * second_levels.len());
    for a in &first_levels {
        for b in &second_levels {
            let scores: Vec<f64> = table
                .rows
                .iter()
                .filter(|r| {
                    table.level_of(r, first) == Some(a.as_str())
                        && table.level_of(r, second) == Some(b.as_str())
                })
                .map(|r| r.score)
                .collect();
            cells.push(InteractionCell {
                first_level: a.clone(),
                second_level: b.clone(),
                n: scores.len(),
                mean: (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64),
            });
        }
    }

    let contrast = if first_levels.len() == 2 && second_levels.len() == 2 {
        // cells: (a0,b0) (a0,b1) (a1,b0) (a1,b1)
        cells
            .iter()
            .map(|c| c.mean)
            .collect::<Option<Vec<f64>>>()
            .map(|m| (m[3] - m[2]) - (m[1] - m[0]))
    } else {
        None
    };

    InteractionTable {
        first: first.to_string(),
        second: second.to_string(),
        cells,
        contrast,
    }
}

/// Every unordered pair of factors, then every factor paired with the block.
pub fn two_way_interactions(table: &AnalysisTable) -> Vec<InteractionTable> {
    let mut dims = table.factor_names();
    dims.push(table.block_name.clone());
    let mut out = Vec::new();
    for i in 0..dims.len() {
        for j in (i + 1)..dims.len() {
            out.push(interaction_table(table, &dims[i], &dims[j]));
        }
    }
    out
}

// =============================================================================
// Model fitting
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockTreatment {
    /// Additive nuisance term; no interactions with the block.
    Nuisance,
    /// Crossed with every factor.
    Factor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisModel {
    pub block: BlockTreatment,
    /// With a nuisance block, also cross the factors among themselves.
    pub cross_factors: bool,
}

impl Default for AnalysisModel {
    fn default() -> Self {
        Self {
            block: BlockTreatment::Nuisance,
            cross_factors: false,
        }
    }
}

impl AnalysisModel {
    pub fn nuisance() -> Self {
        Self::default()
    }

    pub fn crossed_factors_with_nuisance_block() -> Self {
        Self {
            block: BlockTreatment::Nuisance,
            cross_factors: true,
        }
    }

    pub fn block_as_factor() -> Self {
        Self {
            block: BlockTreatment::Factor,
            cross_factors: true,
        }
    }

    fn spec(&self, factors: &[String], block: &str) -> ModelSpec {
        match self.block {
            BlockTreatment::Nuisance => {
                let block_term = ModelSpec::main_effects(&[block]);
                let factor_terms = if self.cross_factors {
                    ModelSpec::full_cross(factors)
                } else {
                    ModelSpec::main_effects(factors)
                };
                block_term.extend(factor_terms)
            }
            BlockTreatment::Factor => {
                let mut all = factors.to_vec();
                all.push(block.to_string());
                ModelSpec::full_cross(&all)
            }
        }
    }
}

/// Fit the model over every factor and the block.
///
/// A block with a single observed level contributes no columns.
pub fn fit_additive_model(
    table: &AnalysisTable,
    model: AnalysisModel,
) -> Result<FittedModel, ModelFitError> {
    if table.is_empty() {
        return Err(ModelFitError::EmptyTable);
    }
    let factors = table.factor_names();
    let spec = model.spec(&factors, &table.block_name);
    let mut variables = factors;
    variables.push(table.block_name.clone());
    let frame = table.frame(&variables)?;
    linear_model::fit(&frame, &spec)
}

/// A fitted model, or the reason the fit fell back to group means.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ModelOutcome {
    Fitted(FittedModel),
    Degraded { code: String, reason: String },
}

impl ModelOutcome {
    pub fn from_fit(result: Result<FittedModel, ModelFitError>, context: &str) -> Self {
        match result {
            Ok(model) => Self::Fitted(model),
            Err(err) => {
                warn!(
                    model = context,
                    code = err.code(),
                    error = %err,
                    "model fit degraded; falling back to group means"
                );
                Self::Degraded {
                    code: err.code().to_string(),
                    reason: err.to_string(),
                }
            }
        }
    }

    pub fn fitted(&self) -> Option<&FittedModel> {
        match self {
            Self::Fitted(model) => Some(model),
            Self::Degraded { .. } => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorialReport {
    pub model_kind: AnalysisModel,
    pub n_observations: usize,
    pub model: ModelOutcome,
    pub main_effects: BTreeMap<String, EffectEstimate>,
    pub block_effects: Option<EffectEstimate>,
    pub interactions: Vec<InteractionTable>,
}

/// Model fit plus every group-mean summary. The group-mean parts never
/// depend on whether the fit succeeded.
pub fn analyze(table: &AnalysisTable, model: AnalysisModel) -> FactorialReport {
    let context = match model.block {
        BlockTreatment::Nuisance => "block_as_nuisance",
        BlockTreatment::Factor => "block_as_factor",
    };
    FactorialReport {
        model_kind: model,
        n_observations: table.len(),
        model: ModelOutcome::from_fit(fit_additive_model(table, model), context),
        main_effects: main_effects(table),
        block_effects: block_effects(table),
        interactions: two_way_interactions(table),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitComparison {
    pub r_squared_nuisance: Option<f64>,
    pub r_squared_factor: Option<f64>,
    pub aic_nuisance: Option<f64>,
    pub aic_factor: Option<f64>,
    /// Lower AIC; `None` unless both fits produced one.
    pub preferred: Option<BlockTreatment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTreatmentComparison {
    pub as_nuisance: FactorialReport,
    pub as_factor: FactorialReport,
    pub comparison: FitComparison,
}

/// Analyze with the block as a crossed-factor nuisance term and as a full
/// factor, and compare the fits.
pub fn compare_block_treatments(table: &AnalysisTable) -> BlockTreatmentComparison {
    let as_nuisance = analyze(table, AnalysisModel::crossed_factors_with_nuisance_block());
    let as_factor = analyze(table, AnalysisModel::block_as_factor());

    let nuisance_fit = as_nuisance.model.fitted();
    let factor_fit = as_factor.model.fitted();
    let aic_nuisance = nuisance_fit.and_then(|m| m.aic);
    let aic_factor = factor_fit.and_then(|m| m.aic);
    let preferred = match (aic_nuisance, aic_factor) {
        (Some(n), Some(f)) if f < n => Some(BlockTreatment::Factor),
        (Some(_), Some(_)) => Some(BlockTreatment::Nuisance),
        _ => None,
    };

    let comparison = FitComparison {
        r_squared_nuisance: nuisance_fit.and_then(|m| m.r_squared),
        r_squared_factor: factor_fit.and_then(|m| m.r_squared),
        aic_nuisance,
        aic_factor,
        preferred,
    };
    BlockTreatmentComparison {
        as_nuisance,
        as_factor,
        comparison,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermTest {
    pub term: String,
    pub eta_squared: Option<f64>,
    pub f_value: Option<f64>,
    pub p_value: Option<f64>,
    pub significant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RcbdReport {
    pub treatment: String,
    pub block: String,
    pub alpha: f64,
    pub n_observations: usize,
    /// `score ~ treatment + block`
    pub additive: ModelOutcome,
    pub treatment_test: Option<TermTest>,
    pub block_test: Option<TermTest>,
    pub treatment_effect: Option<EffectEstimate>,
    pub block_effects: Option<EffectEstimate>,
    /// `score ~ treatment * block`
    pub crossed: ModelOutcome,
    pub interaction: InteractionTable,
}

fn term_test(model: &FittedModel, term: &str, alpha: f64) -> Option<TermTest> {
    model.anova_row(term).map(|row| TermTest {
        term: term.to_string(),
        eta_squared: row.eta_squared,
        f_value: row.f_value,
        p_value: row.p_value,
        significant: row.p_value.is_some_and(|p| p < alpha),
    })
}

/// Randomized complete block analysis of one treatment factor.
pub fn rcbd_report(
    table: &AnalysisTable,
    treatment: &str,
    alpha: f64,
) -> Result<RcbdReport, ConfigurationError> {
    let factor = table
        .factors
        .iter()
        .find(|f| f.name == treatment)
        .ok_or_else(|| ConfigurationError::UndeclaredFactor(treatment.to_string()))?;
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(ConfigurationError::invalid_parameter(format!(
            "alpha must be in (0, 1), got {alpha}"
        )));
    }

    let block = table.block_name.as_str();
    let variables = vec![treatment.to_string(), block.to_string()];
    let fit_with = |spec: ModelSpec| -> Result<FittedModel, ModelFitError> {
        if table.is_empty() {
            return Err(ModelFitError::EmptyTable);
        }
        linear_model::fit(&table.frame(&variables)?, &spec)
    };

    let additive = ModelOutcome::from_fit(
        fit_with(ModelSpec {
            terms: vec![Term::main(treatment), Term::main(block)],
        }),
        "rcbd_additive",
    );
    let crossed = ModelOutcome::from_fit(fit_with(ModelSpec::full_cross(&variables)), "rcbd_crossed");

    let (treatment_test, block_test) = match additive.fitted() {
        Some(model) => (
            term_test(model, treatment, alpha),
            term_test(model, block, alpha),
        ),
        None => (None, None),
    };

    Ok(RcbdReport {
        treatment: treatment.to_string(),
        block: block.to_string(),
        alpha,
        n_observations: table.len(),
        additive,
        treatment_test,
        block_test,
        treatment_effect: factor_effect(table, factor),
        block_effects: block_effects(table),
        crossed,
        interaction: interaction_table(table, treatment, block),
    })
}
