//! Error taxonomy shared by design generation, scoring, analysis and planning.
//!
//! Only [`ConfigurationError`] is fatal. The other kinds are local: they null a
//! single unit's score, omit a single factor's estimate, or degrade a single
//! model fit, and the rest of the pipeline keeps going.

use thiserror::Error;

/// Malformed factor / level / block declarations or references to them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("factor name must not be empty")]
    EmptyFactorName,

    #[error("factor `{factor}` declares {levels} level(s); at least 2 are required")]
    TooFewLevels { factor: String, levels: usize },

    #[error("factor `{factor}` declares level `{level}` more than once")]
    DuplicateLevel { factor: String, level: String },

    #[error("factor `{factor}` has an empty level name")]
    EmptyLevel { factor: String },

    #[error("factor `{0}` is declared more than once")]
    DuplicateFactor(String),

    #[error("factor `{0}` is not declared in this design")]
    UndeclaredFactor(String),

    #[error("level `{level}` is not a declared level of factor `{factor}`")]
    UndeclaredLevel { factor: String, level: String },

    #[error("factor `{0}` is neither varied nor given a fixed default level")]
    MissingDefault(String),

    #[error("block `{0}` is declared more than once")]
    DuplicateBlock(String),

    #[error("block `{0}` has no stimuli")]
    EmptyBlock(String),

    #[error("block level `{0}` has no stimulus set")]
    MissingStimuli(String),

    #[error("unknown experiment mode `{0}`")]
    UnknownMode(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl ConfigurationError {
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }
}

/// Not enough observations for the requested statistic.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InsufficientDataError {
    #[error("group `{group}` has {actual} observation(s); at least 2 are required")]
    TooFewObservations { group: String, actual: usize },

    #[error("pooled variance is zero; standardized effect is undefined")]
    ZeroVariance,

    #[error("factor `{factor}` has {levels} observed level(s); exactly 2 are required")]
    NotTwoLevels { factor: String, levels: usize },
}

/// Linear model could not be fitted. Always recovered by falling back to
/// group-mean summaries.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelFitError {
    #[error("no observations to fit")]
    EmptyTable,

    #[error("design matrix is rank-deficient (rank {rank} < {columns} columns)")]
    RankDeficient { rank: usize, columns: usize },

    #[error("no residual degrees of freedom ({observations} observations, {parameters} parameters)")]
    NoResidualDegreesOfFreedom {
        observations: usize,
        parameters: usize,
    },

    #[error("numerical failure: {0}")]
    Numerical(String),
}

impl ModelFitError {
    /// Short code for structured logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyTable => "empty_table",
            Self::RankDeficient { .. } => "rank_deficient",
            Self::NoResidualDegreesOfFreedom { .. } => "no_residual_df",
            Self::Numerical(_) => "numerical",
        }
    }
}

/// Failure of the injected similarity backend for one pair of responses.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoringBackendError {
    #[error("similarity backend failed: {0}")]
    Backend(String),

    #[error("similarity backend returned {0}, expected a finite value in [0, 1]")]
    OutOfRange(f64),
}

impl ScoringBackendError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Backend(_) => "backend_error",
            Self::OutOfRange(_) => "out_of_range",
        }
    }
}
