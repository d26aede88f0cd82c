//! Experimental design generation.
//!
//! Enumerates factor-level combinations and crosses them with blocked stimuli
//! to produce experimental units. Every generator is a pure function of its
//! inputs: units get contiguous 1-based ids in emission order, so the same
//! declarations always yield the same ids.

use std::collections::{BTreeMap, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

// ---------------------------------------------------------------------
//  Declarations
// ---------------------------------------------------------------------

/// A named experimental variable with ordered, unique levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Factor {
    pub name: String,
    pub levels: Vec<String>,
}

impl Factor {
    pub fn new<I, S>(name: impl Into<String>, levels: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let factor = Self {
            name: name.into(),
            levels: levels.into_iter().map(Into::into).collect(),
        };
        factor.validate()?;
        Ok(factor)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::EmptyFactorName);
        }
        if self.levels.len() < 2 {
            return Err(ConfigurationError::TooFewLevels {
                factor: self.name.clone(),
                levels: self.levels.len(),
            });
        }
        let mut seen = HashSet::new();
        for level in &self.levels {
            if level.trim().is_empty() {
                return Err(ConfigurationError::EmptyLevel {
                    factor: self.name.clone(),
                });
            }
            if !seen.insert(level.as_str()) {
                return Err(ConfigurationError::DuplicateLevel {
                    factor: self.name.clone(),
                    level: level.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn has_level(&self, level: &str) -> bool {
        self.levels.iter().any(|l| l == level)
    }
}

/// Validate a factor list: every factor well formed, names unique.
pub fn validate_factors(factors: &[Factor]) -> Result<(), ConfigurationError> {
    let mut names = HashSet::new();
    for factor in factors {
        factor.validate()?;
        if !names.insert(factor.name.as_str()) {
            return Err(ConfigurationError::DuplicateFactor(factor.name.clone()));
        }
    }
    Ok(())
}

/// Ordered stimuli belonging to one block (e.g. one question category).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StimulusBlock {
    pub name: String,
    pub stimuli: Vec<String>,
}

impl StimulusBlock {
    pub fn new<I, S>(name: impl Into<String>, stimuli: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            stimuli: stimuli.into_iter().map(Into::into).collect(),
        }
    }
}

/// Blocks in declaration order. Block order and stimulus order drive unit ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StimulusBlocks {
    pub blocks: Vec<StimulusBlock>,
}

impl StimulusBlocks {
    pub fn new(blocks: Vec<StimulusBlock>) -> Self {
        Self { blocks }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut names = HashSet::new();
        for block in &self.blocks {
            if !names.insert(block.name.as_str()) {
                return Err(ConfigurationError::DuplicateBlock(block.name.clone()));
            }
            if block.stimuli.is_empty() {
                return Err(ConfigurationError::EmptyBlock(block.name.clone()));
            }
        }
        Ok(())
    }

    /// Keep the first `limit` stimuli of every block.
    pub fn truncated(&self, limit: usize) -> Self {
        Self {
            blocks: self
                .blocks
                .iter()
                .map(|b| StimulusBlock {
                    name: b.name.clone(),
                    stimuli: b.stimuli.iter().take(limit).cloned().collect(),
                })
                .collect(),
        }
    }

    /// One representative stimulus per block: the first in declared order.
    pub fn representative(&self) -> Self {
        self.truncated(1)
    }

    pub fn get(&self, name: &str) -> Option<&StimulusBlock> {
        self.blocks.iter().find(|b| b.name == name)
    }

    pub fn block_names(&self) -> Vec<&str> {
        self.blocks.iter().map(|b| b.name.as_str()).collect()
    }

    pub fn total_stimuli(&self) -> usize {
        self.blocks.iter().map(|b| b.stimuli.len()).sum()
    }
}

// ---------------------------------------------------------------------
//  Combinations and units
// ---------------------------------------------------------------------

/// One level per declared factor. Equality is structural over all assignments.
///
/// Keys iterate and serialize in lexical factor-name order whatever order
/// they were inserted in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactorCombination(BTreeMap<String, String>);

impl FactorCombination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, factor: impl Into<String>, level: impl Into<String>) -> Self {
        self.0.insert(factor.into(), level.into());
        self
    }

    pub fn set(&mut self, factor: impl Into<String>, level: impl Into<String>) {
        self.0.insert(factor.into(), level.into());
    }

    pub fn level(&self, factor: &str) -> Option<&str> {
        self.0.get(factor).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(f, l)| (f.as_str(), l.as_str()))
    }

    /// True when every declared factor has exactly one declared level here.
    pub fn is_valid_for(&self, factors: &[Factor]) -> bool {
        self.0.len() == factors.len()
            && factors
                .iter()
                .all(|f| self.level(&f.name).is_some_and(|l| f.has_level(l)))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FactorCombination {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// The atomic cell of a design: combination × block × stimulus.
///
/// Responses are appended by the external collector, then a score is attached
/// exactly once by the scorer. After that the unit is frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentalUnit {
    pub id: u64,
    pub combination: FactorCombination,
    pub block: String,
    pub stimulus: String,
    #[serde(default)]
    pub responses: Vec<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_error: Option<String>,
}

impl ExperimentalUnit {
    pub fn new(
        id: u64,
        combination: FactorCombination,
        block: impl Into<String>,
        stimulus: impl Into<String>,
    ) -> Self {
        Self {
            id,
            combination,
            block: block.into(),
            stimulus: stimulus.into(),
            responses: Vec::new(),
            score: None,
            score_error: None,
        }
    }

    /// Scored units (or units whose scoring failed) accept no further changes.
    pub fn is_frozen(&self) -> bool {
        self.score.is_some() || self.score_error.is_some()
    }

    /// Content identity independent of the positional id.
    ///
    /// Every field is length-prefixed, so no choice of separators inside
    /// names can make two distinct units collide.
    pub fn fingerprint(&self) -> String {
        fn field(hasher: &mut blake3::Hasher, value: &str) {
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }

        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.combination.len() as u64).to_le_bytes());
        for (factor, level) in self.combination.iter() {
            field(&mut hasher, factor);
            field(&mut hasher, level);
        }
        field(&mut hasher, &self.block);
        field(&mut hasher, &self.stimulus);
        hasher.finalize().to_hex().to_string()
    }
}

// ---------------------------------------------------------------------
//  Generators
// ---------------------------------------------------------------------

/// Cartesian product of all factor levels.
///
/// The first declared factor varies slowest, the last fastest; levels follow
/// declaration order.
pub fn full_factorial(factors: &[Factor]) -> Result<Vec<FactorCombination>, ConfigurationError> {
    validate_factors(factors)?;
    Ok(cartesian(factors, &FactorCombination::new()))
}

fn cartesian(factors: &[Factor], base: &FactorCombination) -> Vec<FactorCombination> {
    let mut out = vec![base.clone()];
    for factor in factors {
        let mut next = Vec::with_capacity(out.len() * factor.levels.len());
        for combo in &out {
            for level in &factor.levels {
                next.push(combo.clone().with(factor.name.as_str(), level.as_str()));
            }
        }
        out = next;
    }
    out
}

/// One unit per combination × (block, stimulus), ids 1..=N.
pub fn cross_with_stimuli(
    combinations: &[FactorCombination],
    stimuli_by_block: &StimulusBlocks,
) -> Result<Vec<ExperimentalUnit>, ConfigurationError> {
    stimuli_by_block.validate()?;
    let mut units = Vec::with_capacity(combinations.len() * stimuli_by_block.total_stimuli());
    let mut next_id = 1u64;
    for combination in combinations {
        for block in &stimuli_by_block.blocks {
            for stimulus in &block.stimuli {
                units.push(ExperimentalUnit::new(
                    next_id,
                    combination.clone(),
                    block.name.as_str(),
                    stimulus.as_str(),
                ));
                next_id += 1;
            }
        }
    }
    Ok(units)
}

/// Full factorial crossed with every stimulus of every block.
pub fn full_design(
    factors: &[Factor],
    stimuli_by_block: &StimulusBlocks,
) -> Result<Vec<ExperimentalUnit>, ConfigurationError> {
    let combinations = full_factorial(factors)?;
    cross_with_stimuli(&combinations, stimuli_by_block)
}

/// Full factorial crossed with the first stimulus of each block.
pub fn representative_subset(
    factors: &[Factor],
    stimuli_by_block: &StimulusBlocks,
) -> Result<Vec<ExperimentalUnit>, ConfigurationError> {
    stimuli_by_block.validate()?;
    let combinations = full_factorial(factors)?;
    cross_with_stimuli(&combinations, &stimuli_by_block.representative())
}

/// Cross only `factors_to_vary`; every other factor is pinned to its default.
pub fn factor_subset_design(
    factors: &[Factor],
    factors_to_vary: &[String],
    fixed_level_defaults: &BTreeMap<String, String>,
    stimuli_by_block: &StimulusBlocks,
    stimuli_limit: Option<usize>,
) -> Result<Vec<ExperimentalUnit>, ConfigurationError> {
    validate_factors(factors)?;
    stimuli_by_block.validate()?;

    let declared: HashMap<&str, &Factor> = factors.iter().map(|f| (f.name.as_str(), f)).collect();
    for name in factors_to_vary {
        if !declared.contains_key(name.as_str()) {
            return Err(ConfigurationError::UndeclaredFactor(name.clone()));
        }
    }
    for (name, level) in fixed_level_defaults {
        let factor = declared
            .get(name.as_str())
            .ok_or_else(|| ConfigurationError::UndeclaredFactor(name.clone()))?;
        if !factor.has_level(level) {
            return Err(ConfigurationError::UndeclaredLevel {
                factor: name.clone(),
                level: level.clone(),
            });
        }
    }

    let vary: HashSet<&str> = factors_to_vary.iter().map(String::as_str).collect();
    let mut base = FactorCombination::new();
    for factor in factors.iter().filter(|f| !vary.contains(f.name.as_str())) {
        let level = fixed_level_defaults
            .get(&factor.name)
            .ok_or_else(|| ConfigurationError::MissingDefault(factor.name.clone()))?;
        base.set(factor.name.as_str(), level.as_str());
    }

    // Varied factors keep their declaration order, not the caller's order.
    let varied: Vec<Factor> = factors
        .iter()
        .filter(|f| vary.contains(f.name.as_str()))
        .cloned()
        .collect();
    let combinations = cartesian(&varied, &base);

    let stimuli = match stimuli_limit {
        Some(limit) => stimuli_by_block.truncated(limit),
        None => stimuli_by_block.clone(),
    };
    cross_with_stimuli(&combinations, &stimuli)
}

/// Randomized complete block design: treatment level × block × stimulus.
///
/// The combination of each unit holds the single treatment factor; the block
/// factor's levels select stimulus sets by name.
pub fn rcbd_design(
    treatment: &Factor,
    blocks: &Factor,
    stimuli_by_block: &StimulusBlocks,
) -> Result<Vec<ExperimentalUnit>, ConfigurationError> {
    validate_factors(&[treatment.clone(), blocks.clone()])?;
    stimuli_by_block.validate()?;

    let mut sets = Vec::with_capacity(blocks.levels.len());
    for block in &blocks.levels {
        let set = stimuli_by_block
            .get(block)
            .ok_or_else(|| ConfigurationError::MissingStimuli(block.clone()))?;
        sets.push(set);
    }

    let mut units = Vec::new();
    let mut next_id = 1u64;
    for level in &treatment.levels {
        let combination = FactorCombination::new().with(treatment.name.as_str(), level.as_str());
        for set in &sets {
            for stimulus in &set.stimuli {
                units.push(ExperimentalUnit::new(
                    next_id,
                    combination.clone(),
                    set.name.as_str(),
                    stimulus.as_str(),
                ));
                next_id += 1;
            }
        }
    }
    Ok(units)
}

/// Seeded run order: unit ids shuffled within each block, blocks in order of
/// first appearance. Ids on the units are untouched.
pub fn randomized_run_order(units: &[ExperimentalUnit], seed: u64) -> Vec<u64> {
    let mut block_order: Vec<&str> = Vec::new();
    let mut by_block: HashMap<&str, Vec<u64>> = HashMap::new();
    for unit in units {
        let ids = by_block.entry(unit.block.as_str()).or_insert_with(|| {
            block_order.push(unit.block.as_str());
            Vec::new()
        });
        ids.push(unit.id);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut order = Vec::with_capacity(units.len());
    for block in block_order {
        if let Some(mut ids) = by_block.remove(block) {
            ids.shuffle(&mut rng);
            order.extend(ids);
        }
    }
    order
}

/// Append collected responses to units by id.
///
/// Returns ids that matched no unit or hit a frozen unit; those responses are
/// dropped.
pub fn attach_responses(
    units: &mut [ExperimentalUnit],
    responses: BTreeMap<u64, Vec<String>>,
) -> Vec<u64> {
    let mut index: HashMap<u64, usize> = HashMap::with_capacity(units.len());
    for (pos, unit) in units.iter().enumerate() {
        index.insert(unit.id, pos);
    }

    let mut rejected = Vec::new();
    for (id, texts) in responses {
        match index.get(&id) {
            Some(&pos) if !units[pos].is_frozen() => units[pos].responses.extend(texts),
            _ => rejected.push(id),
        }
    }
    rejected
}

// ---------------------------------------------------------------------
//  Summary
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignSummary {
    pub total_factors: usize,
    pub levels_per_factor: BTreeMap<String, usize>,
    pub total_combinations: usize,
    pub blocks: usize,
    pub stimuli_per_block: BTreeMap<String, usize>,
    pub total_stimuli: usize,
    pub full_design_units: usize,
    pub representative_design_units: usize,
}

pub fn design_summary(
    factors: &[Factor],
    stimuli_by_block: &StimulusBlocks,
) -> Result<DesignSummary, ConfigurationError> {
    validate_factors(factors)?;
    stimuli_by_block.validate()?;
    let total_combinations: usize = factors.iter().map(|f| f.levels.len()).product();
    let total_stimuli = stimuli_by_block.total_stimuli();
    Ok(DesignSummary {
        total_factors: factors.len(),
        levels_per_factor: factors
            .iter()
            .map(|f| (f.name.clone(), f.levels.len()))
            .collect(),
        total_combinations,
        blocks: stimuli_by_block.blocks.len(),
        stimuli_per_block: stimuli_by_block
            .blocks
            .iter()
            .map(|b| (b.name.clone(), b.stimuli.len()))
            .collect(),
        total_stimuli,
        full_design_units: total_combinations * total_stimuli,
        representative_design_units: total_combinations * stimuli_by_block.blocks.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_level(name: &str) -> Factor {
        Factor::new(name, ["lo", "hi"]).unwrap()
    }

    #[test]
    fn full_factorial_order_is_first_factor_slowest() {
        let combos = full_factorial(&[two_level("a"), two_level("b")]).unwrap();
        let flat: Vec<(String, String)> = combos
            .iter()
            .map(|c| (c.level("a").unwrap().to_string(), c.level("b").unwrap().to_string()))
            .collect();
        assert_eq!(
            flat,
            vec![
                ("lo".into(), "lo".into()),
                ("lo".into(), "hi".into()),
                ("hi".into(), "lo".into()),
                ("hi".into(), "hi".into()),
            ]
        );
    }

    #[test]
    fn factor_rejects_duplicate_and_single_levels() {
        assert!(matches!(
            Factor::new("x", ["a", "a"]),
            Err(ConfigurationError::DuplicateLevel { .. })
        ));
        assert!(matches!(
            Factor::new("x", ["a"]),
            Err(ConfigurationError::TooFewLevels { levels: 1, .. })
        ));
    }

    #[test]
    fn fingerprint_ignores_id() {
        let combo = FactorCombination::new().with("a", "lo");
        let u1 = ExperimentalUnit::new(1, combo.clone(), "b", "q");
        let u2 = ExperimentalUnit::new(7, combo, "b", "q");
        assert_eq!(u1.fingerprint(), u2.fingerprint());
        let u3 = ExperimentalUnit::new(1, FactorCombination::new().with("a", "hi"), "b", "q");
        assert_ne!(u1.fingerprint(), u3.fingerprint());
    }

    #[test]
    fn combination_order_is_canonical() {
        let forward = FactorCombination::new().with("model", "m1").with("language", "ko");
        let backward = FactorCombination::new().with("language", "ko").with("model", "m1");
        assert_eq!(forward, backward);
        assert_eq!(
            serde_json::to_string(&forward).unwrap(),
            r#"{"language":"ko","model":"m1"}"#
        );
        let u1 = ExperimentalUnit::new(1, forward, "b", "q");
        let u2 = ExperimentalUnit::new(1, backward, "b", "q");
        assert_eq!(u1.fingerprint(), u2.fingerprint());
    }

    #[test]
    fn fingerprint_separates_fields_containing_separators() {
        let combo = FactorCombination::new().with("a", "lo");
        let u1 = ExperimentalUnit::new(1, combo.clone(), "b|c", "q");
        let u2 = ExperimentalUnit::new(2, combo, "b", "c|q");
        assert_ne!(u1.fingerprint(), u2.fingerprint());

        let u3 = ExperimentalUnit::new(1, FactorCombination::new().with("a", "x;b=y"), "k", "q");
        let u4 = ExperimentalUnit::new(
            1,
            FactorCombination::new().with("a", "x").with("b", "y"),
            "k",
            "q",
        );
        assert_ne!(u3.fingerprint(), u4.fingerprint());
    }

    #[test]
    fn run_order_is_seeded_permutation_within_blocks() {
        let blocks = StimulusBlocks::new(vec![
            StimulusBlock::new("x", ["q1", "q2"]),
            StimulusBlock::new("y", ["q3"]),
        ]);
        let units = full_design(&[two_level("a"), two_level("b")], &blocks).unwrap();
        let o1 = randomized_run_order(&units, 7);
        let o2 = randomized_run_order(&units, 7);
        assert_eq!(o1, o2);

        let mut sorted = o1.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (1..=units.len() as u64).collect::<Vec<_>>());

        // Block "x" appears first, so its 8 units lead the order.
        let x_ids: HashSet<u64> = units.iter().filter(|u| u.block == "x").map(|u| u.id).collect();
        assert!(o1[..8].iter().all(|id| x_ids.contains(id)));
    }
}
