//! Effect sizes and sample-size planning for two-level factors.
//!
//! Closed-form normal approximations for a two-sided test on one factor:
//!
//! - required n per group: `n = ((z₁₋α/₂ + z_power) / d)²`
//! - achieved power: `Φ(d·√n − z₁₋α/₂) + Φ(−d·√n − z₁₋α/₂)`

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::{info, warn};

use crate::analysis::{self, AnalysisTable};
use crate::error::{ConfigurationError, InsufficientDataError};

/// Effects below this are treated as zero when sizing a study.
const MIN_DETECTABLE_EFFECT: f64 = 1e-12;

// =============================================================================
// Closed forms
// =============================================================================

fn mean_and_var(xs: &[f64]) -> (f64, f64) {
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0);
    (mean, var)
}

/// |mean_a − mean_b| / pooled standard deviation (sample variances).
pub fn cohens_d(a: &[f64], b: &[f64]) -> Result<f64, InsufficientDataError> {
    for (group, xs) in [("first", a), ("second", b)] {
        if xs.len() < 2 {
            return Err(InsufficientDataError::TooFewObservations {
                group: group.to_string(),
                actual: xs.len(),
            });
        }
    }
    let (mean_a, var_a) = mean_and_var(a);
    let (mean_b, var_b) = mean_and_var(b);
    let (na, nb) = (a.len() as f64, b.len() as f64);
    let pooled = ((na - 1.0) * var_a + (nb - 1.0) * var_b) / (na + nb - 2.0);
    if !pooled.is_finite() || pooled <= 0.0 {
        return Err(InsufficientDataError::ZeroVariance);
    }
    Ok((mean_a - mean_b).abs() / pooled.sqrt())
}

fn valid_probability(p: f64) -> bool {
    p > 0.0 && p < 1.0
}

/// Observations per group for a two-sided test at `alpha` to reach `power`.
///
/// Returns `f64::INFINITY` when `d` is zero or not finite (no finite sample
/// detects a null effect) and `NaN` when `alpha` or `power` is not in (0, 1).
pub fn required_n_per_group(d: f64, alpha: f64, power: f64) -> f64 {
    if !valid_probability(alpha) || !valid_probability(power) {
        return f64::NAN;
    }
    if !d.is_finite() || d.abs() < MIN_DETECTABLE_EFFECT {
        return f64::INFINITY;
    }
    let z = Normal::standard();
    let z_alpha = z.inverse_cdf(1.0 - alpha / 2.0);
    let z_beta = z.inverse_cdf(power);
    ((z_alpha + z_beta) / d.abs()).powi(2)
}

/// Power of the two-sided test with `n_per_group` observations per group.
pub fn achieved_power(d: f64, n_per_group: f64, alpha: f64) -> f64 {
    if !valid_probability(alpha) || !d.is_finite() || n_per_group.is_nan() || n_per_group < 0.0 {
        return f64::NAN;
    }
    let z = Normal::standard();
    let z_alpha = z.inverse_cdf(1.0 - alpha / 2.0);
    let ncp = d.abs() * n_per_group.sqrt();
    (z.cdf(ncp - z_alpha) + z.cdf(-ncp - z_alpha)).clamp(0.0, 1.0)
}

/// Total units for a design giving every factor level `n_per_group`
/// observations: ⌈n⌉ × combinations × blocks.
///
/// `None` when `n_per_group` is unbounded or negative.
pub fn scale_to_design(n_per_group: f64, n_combinations: usize, n_blocks: usize) -> Option<u64> {
    if !n_per_group.is_finite() || n_per_group < 0.0 {
        return None;
    }
    // Float-to-int casts saturate at u64::MAX.
    Some(
        (n_per_group.ceil() as u64)
            .saturating_mul(n_combinations as u64)
            .saturating_mul(n_blocks as u64),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectMagnitude {
    Negligible,
    Small,
    Medium,
    Large,
}

/// Cohen's conventional bands: 0.2 / 0.5 / 0.8.
pub fn interpret_effect_size(d: f64) -> EffectMagnitude {
    let d = d.abs();
    if d < 0.2 {
        EffectMagnitude::Negligible
    } else if d < 0.5 {
        EffectMagnitude::Small
    } else if d < 0.8 {
        EffectMagnitude::Medium
    } else {
        EffectMagnitude::Large
    }
}

// =============================================================================
// Planner
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerConfig {
    pub alpha: f64,
    /// The first target is the one used for recommendations.
    pub target_powers: Vec<f64>,
    /// Collection cost of one experimental unit, in USD.
    pub cost_per_unit_usd: f64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            target_powers: vec![0.8, 0.9, 0.95],
            cost_per_unit_usd: 0.01,
        }
    }
}

impl PowerConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !valid_probability(self.alpha) {
            return Err(ConfigurationError::invalid_parameter(format!(
                "alpha must be in (0, 1), got {}",
                self.alpha
            )));
        }
        if self.target_powers.is_empty() {
            return Err(ConfigurationError::invalid_parameter(
                "at least one target power is required",
            ));
        }
        if let Some(bad) = self.target_powers.iter().find(|p| !valid_probability(**p)) {
            return Err(ConfigurationError::invalid_parameter(format!(
                "target power must be in (0, 1), got {bad}"
            )));
        }
        if self.cost_per_unit_usd.is_nan() || self.cost_per_unit_usd < 0.0 {
            return Err(ConfigurationError::invalid_parameter(
                "cost per unit must be non-negative",
            ));
        }
        Ok(())
    }

    fn primary_target(&self) -> f64 {
        self.target_powers.first().copied().unwrap_or(0.8)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerEstimate {
    pub target_power: f64,
    /// `None` when the observed effect is zero.
    pub n_per_group: Option<f64>,
    pub total_units: Option<u64>,
    pub estimated_cost_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorPower {
    pub factor: String,
    pub effect_size: f64,
    pub interpretation: EffectMagnitude,
    pub current_n_per_group: f64,
    pub current_power: f64,
    pub estimates: Vec<PowerEstimate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmittedFactor {
    pub factor: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DesignRecommendation {
    /// Every factor already reaches the primary target power.
    CurrentDesignSufficient,
    /// A few factors are underpowered; add replicates to the current design.
    ExtendCurrentDesign { underpowered: Vec<String> },
    /// Most factors are underpowered; run the full design.
    FullDesign { underpowered: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostProjection {
    pub target_power: f64,
    /// Units needed so that every planned factor reaches `target_power`.
    pub total_units: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerPlan {
    pub alpha: f64,
    pub n_combinations: usize,
    pub n_blocks: usize,
    pub factors: BTreeMap<String, FactorPower>,
    pub omitted: Vec<OmittedFactor>,
    /// Range-over-std effect of the blocking dimension, when estimable.
    pub block_effect: Option<f64>,
    pub projections: Vec<CostProjection>,
    pub recommendation: DesignRecommendation,
}

/// Factors at or below this many underpowered ones are fixed by extending
/// the current design rather than running the full one.
const EXTEND_THRESHOLD: usize = 2;

pub struct PowerPlanner {
    config: PowerConfig,
}

impl PowerPlanner {
    pub fn new(config: PowerConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PowerConfig {
        &self.config
    }

    /// Effect size, current power and required sample sizes for every
    /// two-level factor in `table`.
    pub fn plan(&self, table: &AnalysisTable) -> PowerPlan {
        let cfg = &self.config;
        let n_combinations: usize = table.factors.iter().map(|f| f.levels.len()).product();
        let n_blocks = table.block_levels().len().max(1);

        let mut factors = BTreeMap::new();
        let mut omitted = Vec::new();
        for factor in &table.factors {
            if factor.levels.len() != 2 {
                omitted.push(OmittedFactor {
                    factor: factor.name.clone(),
                    reason: InsufficientDataError::NotTwoLevels {
                        factor: factor.name.clone(),
                        levels: factor.levels.len(),
                    }
                    .to_string(),
                });
                continue;
            }
            let a = table.scores_where(&factor.name, &factor.levels[0]);
            let b = table.scores_where(&factor.name, &factor.levels[1]);
            let d = match cohens_d(&a, &b) {
                Ok(d) => d,
                Err(err) => {
                    warn!(factor = %factor.name, error = %err, "effect size not estimable; factor omitted from power plan");
                    omitted.push(OmittedFactor {
                        factor: factor.name.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            let current_n = (a.len() + b.len()) as f64 / 2.0;
            let estimates = cfg
                .target_powers
                .iter()
                .map(|&target| {
                    let n = required_n_per_group(d, cfg.alpha, target);
                    let total = scale_to_design(n, n_combinations, n_blocks);
                    PowerEstimate {
                        target_power: target,
                        n_per_group: n.is_finite().then_some(n),
                        total_units: total,
                        estimated_cost_usd: total.map(|t| t as f64 * cfg.cost_per_unit_usd),
                    }
                })
                .collect();

            factors.insert(
                factor.name.clone(),
                FactorPower {
                    factor: factor.name.clone(),
                    effect_size: d,
                    interpretation: interpret_effect_size(d),
                    current_n_per_group: current_n,
                    current_power: achieved_power(d, current_n, cfg.alpha),
                    estimates,
                },
            );
        }

        let block_effect = analysis::block_effects(table)
            .and_then(|e| e.effect)
            .map(|e| e.value);

        let projections = cfg
            .target_powers
            .iter()
            .filter_map(|&target| {
                let worst = factors
                    .values()
                    .map(|f| {
                        f.estimates
                            .iter()
                            .find(|e| e.target_power == target)
                            .and_then(|e| e.total_units)
                    })
                    .collect::<Option<Vec<u64>>>()?
                    .into_iter()
                    .max()?;
                Some(CostProjection {
                    target_power: target,
                    total_units: worst,
                    cost_usd: worst as f64 * cfg.cost_per_unit_usd,
                })
            })
            .collect();

        let primary = cfg.primary_target();
        let underpowered: Vec<String> = factors
            .values()
            .filter(|f| f.current_power < primary)
            .map(|f| f.factor.clone())
            .collect();
        let recommendation = match underpowered.len() {
            0 => DesignRecommendation::CurrentDesignSufficient,
            k if k <= EXTEND_THRESHOLD => DesignRecommendation::ExtendCurrentDesign { underpowered },
            _ => DesignRecommendation::FullDesign { underpowered },
        };

        info!(
            planned = factors.len(),
            omitted = omitted.len(),
            n_combinations,
            n_blocks,
            "power plan computed"
        );

        PowerPlan {
            alpha: cfg.alpha,
            n_combinations,
            n_blocks,
            factors,
            omitted,
            block_effect,
            projections,
            recommendation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn cohens_d_rejects_degenerate_groups() {
        assert!(matches!(
            cohens_d(&[1.0], &[0.0, 1.0]),
            Err(InsufficientDataError::TooFewObservations { actual: 1, .. })
        ));
        assert_eq!(
            cohens_d(&[0.5, 0.5], &[0.2, 0.2]),
            Err(InsufficientDataError::ZeroVariance)
        );
    }

    #[test]
    fn required_n_matches_closed_form() {
        let n = required_n_per_group(0.8, 0.05, 0.8);
        let z = Normal::standard();
        let expected = ((z.inverse_cdf(0.975) + z.inverse_cdf(0.8)) / 0.8).powi(2);
        assert!(approx_eq(n, expected, 1e-9));
        assert!(approx_eq(n, 12.264, 1e-3), "n = {n}");
    }

    #[test]
    fn zero_effect_needs_unbounded_sample() {
        assert_eq!(required_n_per_group(0.0, 0.05, 0.8), f64::INFINITY);
        assert_eq!(scale_to_design(f64::INFINITY, 16, 3), None);
        assert!(required_n_per_group(0.5, 1.5, 0.8).is_nan());
    }

    #[test]
    fn achieved_power_inverts_required_n() {
        let n = required_n_per_group(0.5, 0.05, 0.9);
        assert!(approx_eq(achieved_power(0.5, n, 0.05), 0.9, 1e-3));
        assert!(achieved_power(0.5, 10.0, 0.05) < achieved_power(0.5, 40.0, 0.05));
        assert!(achieved_power(0.2, 40.0, 0.05) < achieved_power(0.8, 40.0, 0.05));
        assert!(approx_eq(achieved_power(0.0, 40.0, 0.05), 0.05, 1e-6));
    }

    #[test]
    fn scale_to_design_rounds_up() {
        assert_eq!(scale_to_design(12.26, 16, 3), Some(13 * 16 * 3));
        assert_eq!(scale_to_design(1e30, usize::MAX, 3), Some(u64::MAX));
    }

    #[test]
    fn effect_size_bands() {
        assert_eq!(interpret_effect_size(0.1), EffectMagnitude::Negligible);
        assert_eq!(interpret_effect_size(-0.3), EffectMagnitude::Small);
        assert_eq!(interpret_effect_size(0.5), EffectMagnitude::Medium);
        assert_eq!(interpret_effect_size(3.0), EffectMagnitude::Large);
    }

    #[test]
    fn config_validation() {
        assert!(PowerConfig::default().validate().is_ok());
        let bad = PowerConfig {
            target_powers: vec![1.0],
            ..PowerConfig::default()
        };
        assert!(matches!(
            PowerPlanner::new(bad),
            Err(ConfigurationError::InvalidParameter(_))
        ));
    }
}
