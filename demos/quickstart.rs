//! Minimal end-to-end example for `prompt-consistency`.
//!
//! Builds the `demo` design of the 2^4 study, fills every unit with synthetic
//! responses (the model under test is simulated), scores them with the
//! lexical backend and prints the main effects and the power plan.
//!
//! To run:
//! - `cargo run --example quickstart`

use prompt_consistency::config::{DesignConfig, ModeConfig};
use prompt_consistency::pipeline;
use prompt_consistency::power::{PowerConfig, PowerPlanner};
use prompt_consistency::{ConsistencyScorer, LexicalSimilarity};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

const FILLER: &[&str] = &[
    "honestly", "overall", "in short", "notably", "in practice", "above all", "typically",
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // -- Design ----------------------------------------------------------------

    let config = DesignConfig::prompt_factorial_study();
    let mode = ModeConfig::preset("demo")?;
    let mut units = config.units_for(&mode)?;
    println!(
        "{} units, ~${:.4} to collect",
        units.len(),
        mode.estimate_cost(units.len()).estimated_total_usd
    );

    // -- Simulated collection --------------------------------------------------

    // English prompts drift less between repetitions than Korean ones.
    let mut rng = StdRng::seed_from_u64(7);
    for unit in &mut units {
        let drift = match unit.combination.level("prompt_language") {
            Some("english") => 1,
            _ => 3,
        };
        for _ in 0..mode.responses_per_unit {
            let mut words: Vec<&str> = unit.stimulus.split_whitespace().collect();
            for _ in 0..drift {
                if let Some(extra) = FILLER.choose(&mut rng) {
                    words.push(*extra);
                }
            }
            unit.responses.push(words.join(" "));
        }
    }

    // -- Score, analyze, plan --------------------------------------------------

    let scorer = ConsistencyScorer::new(LexicalSimilarity);
    let planner = PowerPlanner::new(PowerConfig::default())?;
    let report = pipeline::run_factorial(&config, &mut units, &scorer, &planner)?;

    for (factor, effect) in &report.factorial.as_nuisance.main_effects {
        println!("{factor}: magnitude {:.3}", effect.magnitude);
        for level in &effect.levels {
            println!("  {:<16} n={} mean={:.3}", level.level, level.n, level.mean);
        }
    }
    println!("recommendation: {:?}", report.power.recommendation);
    Ok(())
}
