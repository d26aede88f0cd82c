//! Score → analyze → plan, over units whose responses were collected elsewhere.
//!
//! Usage:
//! ```bash
//! consistency design --mode representative --out units.json
//! # ... collector fills responses ...
//! consistency analyze --units units.json --out report.json
//! ```

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::analysis::{self, AnalysisTable, BlockTreatmentComparison, RcbdReport};
use crate::config::{DesignConfig, RcbdConfig};
use crate::design::ExperimentalUnit;
use crate::error::ConfigurationError;
use crate::power::{PowerPlan, PowerPlanner};
use crate::scoring::{
    self, AsyncSimilarityBackend, ConsistencyScorer, ConsistencyStatistics, ScorerConfig,
    ScoringSummary, SimilarityBackend,
};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Failed to read or write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigurationError),
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, PipelineError> {
    let raw = std::fs::read_to_string(path).map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| PipelineError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PipelineError> {
    let json = serde_json::to_string_pretty(value).map_err(|source| PipelineError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, json).map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub scoring: ScoringSummary,
    pub statistics: ConsistencyStatistics,
    pub table: AnalysisTable,
    pub factorial: BlockTreatmentComparison,
    pub power: PowerPlan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RcbdExperimentReport {
    pub scoring: ScoringSummary,
    pub statistics: ConsistencyStatistics,
    pub rcbd: RcbdReport,
}

/// Analyze units that already carry scores.
pub fn analyze_scored(
    config: &DesignConfig,
    units: &[ExperimentalUnit],
    scoring: ScoringSummary,
    planner: &PowerPlanner,
) -> Result<ExperimentReport, PipelineError> {
    config.validate()?;
    let table = analysis::build_table(units, &config.factors, &config.block_name);
    let factorial = analysis::compare_block_treatments(&table);
    let power = planner.plan(&table);
    info!(
        units = units.len(),
        analyzed = table.len(),
        recommendation = ?power.recommendation,
        "factorial analysis complete"
    );
    Ok(ExperimentReport {
        scoring,
        statistics: scoring::consistency_statistics(units, &config.block_name),
        table,
        factorial,
        power,
    })
}

/// Score every unit with a blocking backend, then analyze.
pub fn run_factorial<B: SimilarityBackend>(
    config: &DesignConfig,
    units: &mut [ExperimentalUnit],
    scorer: &ConsistencyScorer<B>,
    planner: &PowerPlanner,
) -> Result<ExperimentReport, PipelineError> {
    config.validate()?;
    let scoring = scorer.score_experiment(units);
    analyze_scored(config, units, scoring, planner)
}

/// Score units concurrently through an async backend, then analyze.
pub async fn run_factorial_concurrent<B>(
    config: &DesignConfig,
    units: &mut [ExperimentalUnit],
    backend: &B,
    scorer_config: &ScorerConfig,
    concurrency: usize,
    planner: &PowerPlanner,
) -> Result<ExperimentReport, PipelineError>
where
    B: AsyncSimilarityBackend + ?Sized,
{
    config.validate()?;
    let scoring =
        scoring::score_experiment_concurrent(units, backend, scorer_config, concurrency).await;
    analyze_scored(config, units, scoring, planner)
}

/// Score every unit, then run the randomized complete block analysis.
pub fn run_rcbd<B: SimilarityBackend>(
    config: &RcbdConfig,
    units: &mut [ExperimentalUnit],
    scorer: &ConsistencyScorer<B>,
    alpha: f64,
) -> Result<RcbdExperimentReport, PipelineError> {
    let scoring = scorer.score_experiment(units);
    let table = analysis::build_table(
        units,
        std::slice::from_ref(&config.treatment),
        &config.blocks.name,
    );
    let rcbd = analysis::rcbd_report(&table, &config.treatment.name, alpha)?;
    Ok(RcbdExperimentReport {
        scoring,
        statistics: scoring::consistency_statistics(units, &config.blocks.name),
        rcbd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::PowerConfig;
    use crate::scoring::LexicalSimilarity;

    #[test]
    fn read_json_reports_path_on_missing_file() {
        let err = read_json::<Vec<ExperimentalUnit>>(Path::new("/nonexistent/units.json"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/units.json"));
    }

    #[test]
    fn invalid_design_config_is_fatal() {
        let mut config = DesignConfig::prompt_factorial_study();
        config.defaults.insert("model".into(), "gpt-9".into());
        let planner = PowerPlanner::new(PowerConfig::default()).unwrap();
        let scorer = ConsistencyScorer::new(LexicalSimilarity);
        let err = run_factorial(&config, &mut [], &scorer, &planner).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config(ConfigurationError::UndeclaredLevel { .. })
        ));
    }
}
