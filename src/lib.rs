#![forbid(unsafe_code)]

//! # prompt-consistency
//!
//! Measures how consistently a model answers semantically equivalent prompts
//! while experimental factors (language, model, role, explicitness, framing)
//! are varied under a factorial or randomized complete block design.
//!
//! Three stages, each usable on its own:
//! 1. **Design**: enumerate factor-level combinations and cross them with
//!    blocked stimuli into experimental units.
//! 2. **Score**: reduce each unit's repeated responses to the mean pairwise
//!    similarity reported by an injected backend.
//! 3. **Analyze**: main effects, block effects, interactions and an OLS/ANOVA
//!    fit that degrades to group means, plus power planning.
//!
//! Prompt generation and response collection stay outside the crate.

pub mod analysis;
pub mod config;
pub mod design;
pub mod error;
pub mod linear_model;
pub mod pipeline;
pub mod power;
pub mod scoring;

pub use analysis::{
    analyze, block_effects, build_table, compare_block_treatments, fit_additive_model,
    main_effects, rcbd_report, two_way_interactions, AnalysisModel, AnalysisTable,
    BlockTreatment, EffectConvention, EffectEstimate, FactorialReport, ModelOutcome,
};
pub use config::{DesignConfig, ModeConfig, RcbdConfig};
pub use design::{ExperimentalUnit, Factor, FactorCombination, StimulusBlock, StimulusBlocks};
pub use error::{ConfigurationError, InsufficientDataError, ModelFitError, ScoringBackendError};
pub use pipeline::PipelineError;
pub use power::{
    achieved_power, cohens_d, required_n_per_group, scale_to_design, PowerConfig, PowerPlanner,
};
pub use scoring::{
    normalize, AsyncSimilarityBackend, ConsistencyScorer, LexicalSimilarity, SimilarityBackend,
};
