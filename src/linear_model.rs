//! Ordinary least squares over treatment-coded categorical variables.
//!
//! - `ModelFrame` holds the categorical columns and the response.
//! - `ModelSpec` lists the terms (main effects and interactions) to fit.
//! - `fit` checks rank, solves the normal equations by Cholesky and reports
//!   goodness of fit plus a Type II ANOVA table.
//!
//! Uses dense `nalgebra::DMatrix`; designs here have tens of columns at most.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, FisherSnedecor};

use crate::error::ModelFitError;

// =============================================================================
// Model frame
// =============================================================================

/// A categorical column. The first level is the reference level.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub levels: Vec<String>,
    codes: Vec<usize>,
}

impl Variable {
    fn dummy(&self, row: usize, level_idx: usize) -> f64 {
        if self.codes[row] == level_idx {
            1.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelFrame {
    variables: Vec<Variable>,
    response: Vec<f64>,
}

impl ModelFrame {
    pub fn new(response: Vec<f64>) -> Self {
        Self {
            variables: Vec::new(),
            response,
        }
    }

    /// Add a categorical column.
    ///
    /// Levels follow `level_order` where given (restricted to levels actually
    /// observed, so unobserved levels never produce all-zero columns), then
    /// any remaining observed levels in first-appearance order.
    pub fn add_categorical<S: AsRef<str>>(
        &mut self,
        name: impl Into<String>,
        values: &[S],
        level_order: &[String],
    ) -> Result<(), ModelFitError> {
        let name = name.into();
        if values.len() != self.response.len() {
            return Err(ModelFitError::Numerical(format!(
                "column `{name}` has {} values for {} observations",
                values.len(),
                self.response.len()
            )));
        }

        let mut levels: Vec<String> = level_order
            .iter()
            .filter(|l| values.iter().any(|v| v.as_ref() == l.as_str()))
            .cloned()
            .collect();
        for value in values {
            if !levels.iter().any(|l| l == value.as_ref()) {
                levels.push(value.as_ref().to_string());
            }
        }

        let codes = values
            .iter()
            .map(|v| levels.iter().position(|l| l == v.as_ref()).unwrap_or(0))
            .collect();
        self.variables.push(Variable {
            name,
            levels,
            codes,
        });
        Ok(())
    }

    pub fn n_obs(&self) -> usize {
        self.response.len()
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn response(&self) -> &[f64] {
        &self.response
    }
}

// =============================================================================
// Model specification
// =============================================================================

/// A main effect (one variable) or an interaction (several).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub variables: Vec<String>,
}

impl Term {
    pub fn main(variable: impl Into<String>) -> Self {
        Self {
            variables: vec![variable.into()],
        }
    }

    pub fn interaction<I, S>(variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            variables: variables.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> String {
        self.variables.join(":")
    }

    /// True when `other` is a strict sub-term of `self`.
    fn contains(&self, other: &Term) -> bool {
        self.variables.len() > other.variables.len()
            && other.variables.iter().all(|v| self.variables.contains(v))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub terms: Vec<Term>,
}

impl ModelSpec {
    /// `y ~ a + b + c`
    pub fn main_effects<S: AsRef<str>>(variables: &[S]) -> Self {
        Self {
            terms: variables.iter().map(|v| Term::main(v.as_ref())).collect(),
        }
    }

    /// `y ~ a * b * c`: every non-empty subset, lower orders first.
    pub fn full_cross<S: AsRef<str>>(variables: &[S]) -> Self {
        let k = variables.len();
        let mut subsets: Vec<Vec<usize>> = (1u64..(1u64 << k))
            .map(|mask| (0..k).filter(|i| mask & (1 << i) != 0).collect())
            .collect();
        subsets.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        Self {
            terms: subsets
                .into_iter()
                .map(|idx| Term::interaction(idx.into_iter().map(|i| variables[i].as_ref())))
                .collect(),
        }
    }

    /// Append terms that are not already present.
    pub fn extend(mut self, other: ModelSpec) -> Self {
        for term in other.terms {
            if !self.terms.iter().any(|t| same_variables(t, &term)) {
                self.terms.push(term);
            }
        }
        self
    }

    pub fn formula(&self, response: &str) -> String {
        let rhs: Vec<String> = self.terms.iter().map(Term::name).collect();
        if rhs.is_empty() {
            format!("{response} ~ 1")
        } else {
            format!("{response} ~ {}", rhs.join(" + "))
        }
    }
}

fn same_variables(a: &Term, b: &Term) -> bool {
    a.variables.len() == b.variables.len() && a.variables.iter().all(|v| b.variables.contains(v))
}

// =============================================================================
// Fitted model
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub name: String,
    pub estimate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnovaRow {
    pub term: String,
    pub df: usize,
    pub sum_sq: f64,
    pub mean_sq: f64,
    /// `None` when the residual sum of squares is zero.
    pub f_value: Option<f64>,
    pub p_value: Option<f64>,
    /// `sum_sq` over the total of all term and residual sums of squares.
    pub eta_squared: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub formula: String,
    pub n_obs: usize,
    pub n_params: usize,
    pub df_resid: usize,
    pub coefficients: Vec<Coefficient>,
    pub ssr: f64,
    pub centered_tss: f64,
    /// `None` when the response has no variance.
    pub r_squared: Option<f64>,
    pub adj_r_squared: Option<f64>,
    /// `None` for a perfect fit, where the Gaussian likelihood is unbounded.
    pub log_likelihood: Option<f64>,
    pub aic: Option<f64>,
    pub bic: Option<f64>,
    pub anova: Vec<AnovaRow>,
}

impl FittedModel {
    pub fn anova_row(&self, term: &str) -> Option<&AnovaRow> {
        self.anova.iter().find(|r| r.term == term)
    }

    pub fn coefficient(&self, name: &str) -> Option<f64> {
        self.coefficients
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.estimate)
    }
}

struct DesignMatrix {
    x: DMatrix<f64>,
    names: Vec<String>,
    /// Column range of each term (intercept excluded).
    term_columns: Vec<std::ops::Range<usize>>,
}

fn build_design(frame: &ModelFrame, spec: &ModelSpec) -> Result<DesignMatrix, ModelFitError> {
    let n = frame.n_obs();
    let mut columns: Vec<Vec<f64>> = vec![vec![1.0; n]];
    let mut names = vec!["Intercept".to_string()];
    let mut term_columns = Vec::with_capacity(spec.terms.len());

    for term in &spec.terms {
        let vars: Vec<&Variable> = term
            .variables
            .iter()
            .map(|name| {
                frame.variable(name).ok_or_else(|| {
                    ModelFitError::Numerical(format!("term refers to unknown variable `{name}`"))
                })
            })
            .collect::<Result<_, _>>()?;

        // Product of the non-reference dummies of every variable in the term.
        let mut parts: Vec<(String, Vec<f64>)> = vec![(String::new(), vec![1.0; n])];
        for var in vars {
            let mut next = Vec::with_capacity(parts.len() * var.levels.len().saturating_sub(1));
            for (label, col) in &parts {
                for (idx, level) in var.levels.iter().enumerate().skip(1) {
                    let prod: Vec<f64> = (0..n).map(|row| col[row] * var.dummy(row, idx)).collect();
                    let piece = format!("{}[T.{}]", var.name, level);
                    let label = if label.is_empty() {
                        piece
                    } else {
                        format!("{label}:{piece}")
                    };
                    next.push((label, prod));
                }
            }
            parts = next;
        }

        let start = columns.len();
        for (label, col) in parts {
            names.push(label);
            columns.push(col);
        }
        term_columns.push(start..columns.len());
    }

    let p = columns.len();
    let x = DMatrix::from_fn(n, p, |r, c| columns[c][r]);
    Ok(DesignMatrix {
        x,
        names,
        term_columns,
    })
}

fn numerical_rank(x: &DMatrix<f64>) -> usize {
    let svd = x.clone().svd(false, false);
    let max_sv = svd.singular_values.iter().copied().fold(0.0_f64, f64::max);
    let tol = max_sv * (x.nrows().max(x.ncols()) as f64) * f64::EPSILON;
    svd.singular_values.iter().filter(|&&s| s > tol).count()
}

/// Solve `X'X b = X'y`. Returns coefficients and residual sum of squares.
fn least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Result<(DVector<f64>, f64), ModelFitError> {
    let xt = x.transpose();
    let xtx = &xt * x;
    let xty = &xt * y;
    let chol = Cholesky::new(xtx).ok_or_else(|| {
        ModelFitError::Numerical("normal equations are not positive definite".to_string())
    })?;
    let beta = chol.solve(&xty);
    let resid = y - x * &beta;
    Ok((beta, resid.norm_squared()))
}

fn select_columns(x: &DMatrix<f64>, cols: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(x.nrows(), cols.len(), |r, c| x[(r, cols[c])])
}

/// Fit `spec` to `frame` by OLS with an intercept.
pub fn fit(frame: &ModelFrame, spec: &ModelSpec) -> Result<FittedModel, ModelFitError> {
    let n = frame.n_obs();
    if n == 0 {
        return Err(ModelFitError::EmptyTable);
    }

    let design = build_design(frame, spec)?;
    let p = design.x.ncols();
    if n <= p {
        return Err(ModelFitError::NoResidualDegreesOfFreedom {
            observations: n,
            parameters: p,
        });
    }
    let rank = numerical_rank(&design.x);
    if rank < p {
        return Err(ModelFitError::RankDeficient { rank, columns: p });
    }

    let y = DVector::from_column_slice(frame.response());
    let (beta, ssr) = least_squares(&design.x, &y)?;
    if !ssr.is_finite() || beta.iter().any(|b| !b.is_finite()) {
        return Err(ModelFitError::Numerical("non-finite solution".to_string()));
    }

    let mean = y.mean();
    let centered_tss: f64 = y.iter().map(|v| (v - mean) * (v - mean)).sum();
    let df_resid = n - p;
    let scale = centered_tss.max(1.0) * 1e-12;

    let r_squared = (centered_tss > scale).then(|| 1.0 - ssr / centered_tss);
    let adj_r_squared =
        r_squared.map(|r2| 1.0 - (1.0 - r2) * (n as f64 - 1.0) / df_resid as f64);

    let nf = n as f64;
    let log_likelihood = (ssr > 0.0).then(|| {
        -nf / 2.0 * ((2.0 * std::f64::consts::PI).ln() + (ssr / nf).ln() + 1.0)
    });
    let aic = log_likelihood.map(|llf| -2.0 * llf + 2.0 * p as f64);
    let bic = log_likelihood.map(|llf| -2.0 * llf + nf.ln() * p as f64);

    let anova = type2_anova(&design, spec, &y, ssr, df_resid)?;

    Ok(FittedModel {
        formula: spec.formula("score"),
        n_obs: n,
        n_params: p,
        df_resid,
        coefficients: design
            .names
            .iter()
            .zip(beta.iter())
            .map(|(name, &estimate)| Coefficient {
                name: name.clone(),
                estimate,
            })
            .collect(),
        ssr,
        centered_tss,
        r_squared,
        adj_r_squared,
        log_likelihood,
        aic,
        bic,
        anova,
    })
}

/// Type II sums of squares: each term is tested against the model holding
/// every term that does not contain it.
fn type2_anova(
    design: &DesignMatrix,
    spec: &ModelSpec,
    y: &DVector<f64>,
    ssr_full: f64,
    df_resid: usize,
) -> Result<Vec<AnovaRow>, ModelFitError> {
    let mse = ssr_full / df_resid as f64;
    let mut raw: Vec<(String, usize, f64)> = Vec::with_capacity(spec.terms.len());

    for (t_idx, term) in spec.terms.iter().enumerate() {
        // A variable with a single observed level contributes no columns.
        if design.term_columns[t_idx].is_empty() {
            continue;
        }
        let mut base_cols = vec![0usize];
        for (o_idx, other) in spec.terms.iter().enumerate() {
            if o_idx != t_idx && !other.contains(term) {
                base_cols.extend(design.term_columns[o_idx].clone());
            }
        }
        let mut with_cols = base_cols.clone();
        with_cols.extend(design.term_columns[t_idx].clone());

        let (_, ssr_without) = least_squares(&select_columns(&design.x, &base_cols), y)?;
        let (_, ssr_with) = least_squares(&select_columns(&design.x, &with_cols), y)?;
        let df = design.term_columns[t_idx].len();
        raw.push((term.name(), df, (ssr_without - ssr_with).max(0.0)));
    }

    let total: f64 = raw.iter().map(|(_, _, ss)| ss).sum::<f64>() + ssr_full;
    let rows = raw
        .into_iter()
        .map(|(term, df, sum_sq)| {
            let mean_sq = sum_sq / df as f64;
            let f_value = (mse > 0.0).then(|| mean_sq / mse);
            let p_value = f_value.and_then(|f| {
                FisherSnedecor::new(df as f64, df_resid as f64)
                    .ok()
                    .map(|dist| dist.sf(f))
            });
            AnovaRow {
                term,
                df,
                sum_sq,
                mean_sq,
                f_value,
                p_value,
                eta_squared: (total > 0.0).then(|| sum_sq / total),
            }
        })
        .collect();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    fn two_by_two_frame() -> ModelFrame {
        // y = 1 + 2·[a=hi] + 0.5·[b=hi] + noise, two replicates per cell.
        let a = ["lo", "lo", "hi", "hi", "lo", "lo", "hi", "hi"];
        let b = ["lo", "hi", "lo", "hi", "lo", "hi", "lo", "hi"];
        let noise = [0.1, -0.1, 0.05, -0.05, -0.1, 0.1, -0.05, 0.05];
        let y: Vec<f64> = (0..8)
            .map(|i| {
                let a_hi = if a[i] == "hi" { 2.0 } else { 0.0 };
                let b_hi = if b[i] == "hi" { 0.5 } else { 0.0 };
                1.0 + a_hi + b_hi + noise[i]
            })
            .collect();
        let mut frame = ModelFrame::new(y);
        let order = vec!["lo".to_string(), "hi".to_string()];
        frame.add_categorical("a", &a, &order).unwrap();
        frame.add_categorical("b", &b, &order).unwrap();
        frame
    }

    #[test]
    fn recovers_treatment_coded_effects() {
        let model = fit(&two_by_two_frame(), &ModelSpec::main_effects(&["a", "b"])).unwrap();
        assert_eq!(model.n_params, 3);
        assert_eq!(model.df_resid, 5);
        assert!(approx_eq(model.coefficient("a[T.hi]").unwrap(), 2.0, 1e-9));
        assert!(approx_eq(model.coefficient("b[T.hi]").unwrap(), 0.5, 1e-9));
        assert!(model.r_squared.unwrap() > 0.95);
        assert!(model.bic.unwrap() > model.aic.unwrap());
    }

    #[test]
    fn anova_ranks_the_stronger_factor_first() {
        let model = fit(&two_by_two_frame(), &ModelSpec::main_effects(&["a", "b"])).unwrap();
        let a = model.anova_row("a").unwrap();
        let b = model.anova_row("b").unwrap();
        assert!(a.sum_sq > b.sum_sq);
        assert!(a.p_value.unwrap() < 0.001);
        assert!(a.eta_squared.unwrap() > b.eta_squared.unwrap());
        // Balanced design: Type II SS equals 8/4 · effect².
        assert!(approx_eq(a.sum_sq, 8.0, 1e-9));
    }

    #[test]
    fn saturated_model_has_no_residual_df() {
        let frame = two_by_two_frame();
        let spec = ModelSpec::full_cross(&["a", "b"]);
        assert_eq!(spec.formula("score"), "score ~ a + b + a:b");
        let model = fit(&frame, &spec).unwrap();
        assert_eq!(model.df_resid, 4);

        let tiny = {
            let mut f = ModelFrame::new(vec![1.0, 2.0]);
            f.add_categorical("a", &["lo", "hi"], &[]).unwrap();
            f
        };
        assert!(matches!(
            fit(&tiny, &ModelSpec::main_effects(&["a"])),
            Err(ModelFitError::NoResidualDegreesOfFreedom { .. })
        ));
    }

    #[test]
    fn aliased_columns_are_rank_deficient() {
        let mut frame = ModelFrame::new(vec![1.0, 1.1, 2.0, 2.1, 1.5, 2.6]);
        let a = ["x", "x", "y", "y", "x", "y"];
        frame.add_categorical("a", &a, &[]).unwrap();
        frame.add_categorical("copy", &a, &[]).unwrap();
        assert!(matches!(
            fit(&frame, &ModelSpec::main_effects(&["a", "copy"])),
            Err(ModelFitError::RankDeficient { rank: 2, columns: 3 })
        ));
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert_eq!(
            fit(&ModelFrame::new(Vec::new()), &ModelSpec::default()),
            Err(ModelFitError::EmptyTable)
        );
    }
}
