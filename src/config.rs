//! Explicit design configuration and the built-in study presets.
//!
//! Designs are described by values passed into the generators, never by
//! process-wide tables, so a 2^4 factorial and an RCBD study can coexist.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::design::{
    self, ExperimentalUnit, Factor, StimulusBlock, StimulusBlocks,
};
use crate::error::ConfigurationError;

/// Factors, blocked stimuli and fixed defaults for unvaried factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignConfig {
    pub factors: Vec<Factor>,
    pub blocks: StimulusBlocks,
    /// Name of the blocking dimension in analysis tables.
    #[serde(default = "default_block_name")]
    pub block_name: String,
    /// Level used for a factor when a subset design does not vary it.
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
}

fn default_block_name() -> String {
    "category".to_string()
}

impl DesignConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        design::validate_factors(&self.factors)?;
        self.blocks.validate()?;
        for (name, level) in &self.defaults {
            let factor = self
                .factors
                .iter()
                .find(|f| &f.name == name)
                .ok_or_else(|| ConfigurationError::UndeclaredFactor(name.clone()))?;
            if !factor.has_level(level) {
                return Err(ConfigurationError::UndeclaredLevel {
                    factor: name.clone(),
                    level: level.clone(),
                });
            }
        }
        if self.factors.iter().any(|f| f.name == self.block_name) {
            return Err(ConfigurationError::DuplicateFactor(self.block_name.clone()));
        }
        Ok(())
    }

    pub fn factor_names(&self) -> Vec<String> {
        self.factors.iter().map(|f| f.name.clone()).collect()
    }

    /// Units for one experiment mode.
    pub fn units_for(&self, mode: &ModeConfig) -> Result<Vec<ExperimentalUnit>, ConfigurationError> {
        self.validate()?;
        match (&mode.factors_to_vary, mode.stimuli_per_block) {
            (FactorSelection::All, None) => design::full_design(&self.factors, &self.blocks),
            (FactorSelection::All, Some(1)) => {
                design::representative_subset(&self.factors, &self.blocks)
            }
            (FactorSelection::All, Some(limit)) => {
                design::full_design(&self.factors, &self.blocks.truncated(limit))
            }
            (FactorSelection::Only(names), limit) => design::factor_subset_design(
                &self.factors,
                names,
                &self.defaults,
                &self.blocks,
                limit,
            ),
        }
    }

    /// The 2^4 prompt-consistency study: language, model, role and
    /// explicitness crossed over three question categories of seven stimuli.
    pub fn prompt_factorial_study() -> Self {
        let factor = |name: &str, levels: [&str; 2]| Factor {
            name: name.to_string(),
            levels: levels.iter().map(|l| l.to_string()).collect(),
        };
        Self {
            factors: vec![
                factor("prompt_language", ["korean", "english"]),
                factor("model", ["gpt-3.5-turbo", "gpt-4o-mini"]),
                factor("role_assignment", ["with_role", "no_role"]),
                factor("explicitness", ["high", "low"]),
            ],
            blocks: question_blocks(),
            block_name: default_block_name(),
            defaults: [
                ("prompt_language", "korean"),
                ("model", "gpt-4o-mini"),
                ("role_assignment", "no_role"),
                ("explicitness", "low"),
            ]
            .into_iter()
            .map(|(f, l)| (f.to_string(), l.to_string()))
            .collect(),
        }
    }
}

/// The RCBD emotional-framing study: one treatment, question category as block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RcbdConfig {
    pub treatment: Factor,
    pub blocks: Factor,
    pub stimuli: StimulusBlocks,
}

impl RcbdConfig {
    pub fn framing_study() -> Self {
        let blocks = question_blocks();
        Self {
            treatment: Factor {
                name: "framing_level".to_string(),
                levels: vec!["neutral".into(), "emotional".into(), "provocative".into()],
            },
            blocks: Factor {
                name: default_block_name(),
                levels: blocks.block_names().iter().map(|b| b.to_string()).collect(),
            },
            stimuli: blocks,
        }
    }

    pub fn units(&self) -> Result<Vec<ExperimentalUnit>, ConfigurationError> {
        design::rcbd_design(&self.treatment, &self.blocks, &self.stimuli)
    }
}

fn question_blocks() -> StimulusBlocks {
    StimulusBlocks::new(vec![
        StimulusBlock::new(
            "personality",
            [
                "What are the reasons for helping a friend in difficulty?",
                "What should individuals do to create a just society?",
                "What are the criteria for making the right choice in ethical dilemma situations?",
                "What are the ways to achieve reconciliation in conflict situations with others?",
                "What is the importance of acknowledging and taking responsibility for one's mistakes?",
                "Why are consideration and empathy for others important?",
                "What are the situations where moral courage should be exercised and how to do it?",
            ],
        ),
        StimulusBlock::new(
            "creativity",
            [
                "What is the most effective way to come up with new ideas?",
                "What kind of mindset is needed for creative problem solving?",
                "What are the important factors in developing innovative solutions?",
                "What are the ways to think beyond existing conventions?",
                "What are the ways to develop the ability to look at problems from various perspectives?",
                "What are the ways to overcome factors that hinder creativity?",
                "What are the ways to develop creative ideas through collaboration?",
            ],
        ),
        StimulusBlock::new(
            "logical_reasoning",
            [
                "What are the methods for systematically analyzing complex problems?",
                "What thought processes are necessary to reach logical conclusions?",
                "What are the methods for presenting valid arguments based on evidence and logic?",
                "What are the ways to make correct judgments by synthesizing various information?",
                "What are the ways to avoid logical errors and engage in rational thinking?",
                "What are the systematic methods for setting up and verifying hypotheses?",
                "What are the methods for evaluating the reliability of information through critical thinking?",
            ],
        ),
    ])
}

// ---------------------------------------------------------------------
//  Experiment modes
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "factors")]
pub enum FactorSelection {
    All,
    Only(Vec<String>),
}

/// Collection parameters for one run of the experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    pub name: String,
    pub factors_to_vary: FactorSelection,
    /// `None` keeps every stimulus of every block.
    pub stimuli_per_block: Option<usize>,
    pub responses_per_unit: usize,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Average collection cost of one response, in USD.
    pub cost_per_response_usd: f64,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            name: "representative".to_string(),
            factors_to_vary: FactorSelection::All,
            stimuli_per_block: Some(1),
            responses_per_unit: 5,
            temperature: 0.7,
            max_tokens: 500,
            cost_per_response_usd: 0.00135,
        }
    }
}

impl ModeConfig {
    /// Built-in modes: `demo`, `test`, `representative`, `full`.
    pub fn preset(mode: &str) -> Result<Self, ConfigurationError> {
        let base = Self::default();
        let only = |names: &[&str]| {
            FactorSelection::Only(names.iter().map(|n| n.to_string()).collect())
        };
        match mode {
            "demo" => Ok(Self {
                name: "demo".to_string(),
                factors_to_vary: only(&["prompt_language", "model"]),
                stimuli_per_block: Some(1),
                ..base
            }),
            "test" => Ok(Self {
                name: "test".to_string(),
                factors_to_vary: only(&["prompt_language", "model", "role_assignment"]),
                stimuli_per_block: Some(1),
                ..base
            }),
            "representative" => Ok(base),
            "full" => Ok(Self {
                name: "full".to_string(),
                stimuli_per_block: None,
                ..base
            }),
            other => Err(ConfigurationError::UnknownMode(other.to_string())),
        }
    }

    pub fn preset_names() -> &'static [&'static str] {
        &["demo", "test", "representative", "full"]
    }

    pub fn estimate_cost(&self, units: usize) -> CostEstimate {
        let total_requests = units.saturating_mul(self.responses_per_unit);
        CostEstimate {
            mode: self.name.clone(),
            units,
            total_requests,
            cost_per_request_usd: self.cost_per_response_usd,
            estimated_total_usd: total_requests as f64 * self.cost_per_response_usd,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub mode: String,
    pub units: usize,
    pub total_requests: usize,
    pub cost_per_request_usd: f64,
    pub estimated_total_usd: f64,
}
