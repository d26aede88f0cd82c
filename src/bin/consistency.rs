#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;

use prompt_consistency::config::{DesignConfig, ModeConfig, RcbdConfig};
use prompt_consistency::design::{self, ExperimentalUnit};
use prompt_consistency::pipeline::{self, read_json, write_json};
use prompt_consistency::power::{self, PowerConfig, PowerPlanner};
use prompt_consistency::scoring::{ConsistencyScorer, LexicalSimilarity, ScorerConfig, SyncBackend};

#[derive(Parser)]
#[command(name = "consistency", version, about = "Prompt consistency experiment CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate experimental units for a mode
    Design {
        /// demo, test, representative or full (factorial designs only)
        #[arg(long, default_value = "representative", conflicts_with = "rcbd")]
        mode: String,
        /// Design config JSON: a factorial config, or an RCBD config with
        /// `--rcbd` (defaults to the built-in studies)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Generate an RCBD design instead of the factorial design
        #[arg(long)]
        rcbd: bool,
        #[arg(long)]
        out: PathBuf,
        /// Also write a seeded, block-wise randomized run order
        #[arg(long)]
        run_order: Option<PathBuf>,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Print design size and cost for every mode
    Summary {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Attach collected responses ({"unit_id": ["text", ...]}) to units
    Attach {
        #[arg(long)]
        units: PathBuf,
        #[arg(long)]
        responses: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Score units with the lexical backend and write the analysis report
    Analyze {
        #[arg(long)]
        units: PathBuf,
        /// Factorial config JSON, or an RCBD config with `--rcbd`
        #[arg(long)]
        config: Option<PathBuf>,
        /// Analyze as an RCBD study
        #[arg(long)]
        rcbd: bool,
        #[arg(long, default_value_t = 0.05)]
        alpha: f64,
        #[arg(long, default_value_t = 8)]
        concurrency: usize,
        #[arg(long)]
        out: PathBuf,
    },
    /// Closed-form sample size for an effect size
    Power {
        #[arg(long)]
        effect_size: f64,
        #[arg(long, default_value_t = 0.05)]
        alpha: f64,
        #[arg(long, default_value_t = 0.8)]
        power: f64,
        #[arg(long, default_value_t = 16)]
        combinations: usize,
        #[arg(long, default_value_t = 3)]
        blocks: usize,
    },
}

#[derive(Serialize)]
struct ModeSummary {
    mode: String,
    units: usize,
    cost: prompt_consistency::config::CostEstimate,
}

#[derive(Serialize)]
struct PowerAnswer {
    effect_size: f64,
    alpha: f64,
    power: f64,
    /// `null` when the effect is zero.
    n_per_group: Option<f64>,
    total_units: Option<u64>,
    interpretation: power::EffectMagnitude,
}

fn load_design_config(path: Option<&PathBuf>) -> Result<DesignConfig, pipeline::PipelineError> {
    match path {
        Some(path) => read_json(path),
        None => Ok(DesignConfig::prompt_factorial_study()),
    }
}

fn load_rcbd_config(path: Option<&PathBuf>) -> Result<RcbdConfig, pipeline::PipelineError> {
    match path {
        Some(path) => read_json(path),
        None => Ok(RcbdConfig::framing_study()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Design {
            mode,
            config,
            rcbd,
            out,
            run_order,
            seed,
        } => {
            let units = if rcbd {
                let units = load_rcbd_config(config.as_ref())?.units()?;
                tracing::info!(units = units.len(), "rcbd design generated");
                units
            } else {
                let cfg = load_design_config(config.as_ref())?;
                let units = cfg.units_for(&ModeConfig::preset(&mode)?)?;
                tracing::info!(units = units.len(), mode = %mode, "factorial design generated");
                units
            };
            write_json(&out, &units)?;
            if let Some(path) = run_order {
                write_json(&path, &design::randomized_run_order(&units, seed))?;
            }
        }
        Commands::Summary { config } => {
            let cfg = load_design_config(config.as_ref())?;
            let mut modes = Vec::new();
            for name in ModeConfig::preset_names() {
                let mode = ModeConfig::preset(name)?;
                let units = cfg.units_for(&mode)?.len();
                modes.push(ModeSummary {
                    mode: mode.name.clone(),
                    units,
                    cost: mode.estimate_cost(units),
                });
            }
            let summary = design::design_summary(&cfg.factors, &cfg.blocks)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            println!("{}", serde_json::to_string_pretty(&modes)?);
        }
        Commands::Attach {
            units,
            responses,
            out,
        } => {
            let mut loaded: Vec<ExperimentalUnit> = read_json(&units)?;
            let collected: BTreeMap<u64, Vec<String>> = read_json(&responses)?;
            let rejected = design::attach_responses(&mut loaded, collected);
            if !rejected.is_empty() {
                tracing::warn!(?rejected, "responses for unknown or frozen units were dropped");
            }
            write_json(&out, &loaded)?;
        }
        Commands::Analyze {
            units,
            config,
            rcbd,
            alpha,
            concurrency,
            out,
        } => {
            let mut loaded: Vec<ExperimentalUnit> = read_json(&units)?;
            if rcbd {
                let scorer = ConsistencyScorer::new(LexicalSimilarity);
                let rcbd_config = load_rcbd_config(config.as_ref())?;
                let report = pipeline::run_rcbd(&rcbd_config, &mut loaded, &scorer, alpha)?;
                write_json(&out, &report)?;
            } else {
                let cfg = load_design_config(config.as_ref())?;
                let planner = PowerPlanner::new(PowerConfig {
                    alpha,
                    ..PowerConfig::default()
                })?;
                let report = pipeline::run_factorial_concurrent(
                    &cfg,
                    &mut loaded,
                    &SyncBackend(LexicalSimilarity),
                    &ScorerConfig::default(),
                    concurrency,
                    &planner,
                )
                .await?;
                write_json(&out, &report)?;
            }
        }
        Commands::Power {
            effect_size,
            alpha,
            power: target,
            combinations,
            blocks,
        } => {
            let n = power::required_n_per_group(effect_size, alpha, target);
            if n.is_nan() {
                return Err(format!("alpha and power must be in (0, 1), got {alpha} and {target}").into());
            }
            let answer = PowerAnswer {
                effect_size,
                alpha,
                power: target,
                n_per_group: n.is_finite().then_some(n),
                total_units: power::scale_to_design(n, combinations, blocks),
                interpretation: power::interpret_effect_size(effect_size),
            };
            println!("{}", serde_json::to_string_pretty(&answer)?);
        }
    }

    Ok(())
}
