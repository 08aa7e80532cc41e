//! CoV Simulator CLI
//!
//! Run dialogue scenarios against the simulated scene, or a question file
//! through a hosted model.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use cov_env::OpenAiVlm;
use cov_sim::scenarios::ScenarioId;
use cov_sim::{AgentKind, BatchDriver, ExperimentConfig, ScenarioResult, ScenarioRunner, SimSceneLoader};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Chain-of-View agent: simulation and batch runs
#[derive(Parser, Debug)]
#[command(name = "cov-sim")]
#[command(about = "Run Chain-of-View scenarios and experiments", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run deterministic dialogue scenarios
    Scenario(ScenarioArgs),
    /// Answer a question file with a hosted model
    Batch(BatchArgs),
}

#[derive(Args, Debug)]
struct ScenarioArgs {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (quick_answer, blank_recovery, ..., all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Scratch directory for synthetic episodes
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Export dialogue histories to this directory
    #[arg(long)]
    export_dir: Option<PathBuf>,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct BatchArgs {
    /// Experiment config file (JSON); every field is optional
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model preset (qwen, gemini, gemini_lite, gpt, gemma, qwen8b, qwen32b)
    #[arg(short, long)]
    model: Option<String>,

    /// Agent variant (cov, baseline)
    #[arg(short, long)]
    agent: Option<AgentKind>,

    #[arg(long)]
    question_file: Option<PathBuf>,

    #[arg(long)]
    dataset_dir: Option<PathBuf>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Minimum camera actions before answering
    #[arg(long)]
    min_action_step: Option<u32>,

    /// Process only questions with index % shard_count == shard_index
    #[arg(long)]
    shard_index: Option<usize>,

    #[arg(long)]
    shard_count: Option<usize>,
}

impl BatchArgs {
    fn into_config(self) -> anyhow::Result<ExperimentConfig> {
        let mut config = match &self.config {
            Some(path) => ExperimentConfig::load(path)?,
            None => ExperimentConfig::default(),
        };

        if let Some(model) = self.model {
            config.model = model;
        }
        if let Some(agent) = self.agent {
            config.agent = agent;
        }
        if let Some(path) = self.question_file {
            config.question_file = path;
        }
        if let Some(path) = self.dataset_dir {
            config.dataset_dir = path;
        }
        if let Some(path) = self.output_dir {
            config.output_dir = path;
        }
        if let Some(steps) = self.min_action_step {
            config.session.min_action_step = steps;
        }
        if let Some(index) = self.shard_index {
            config.shard_index = index;
        }
        if let Some(count) = self.shard_count {
            config.shard_count = count;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let failed = match cli.command {
        Command::Scenario(args) => run_scenarios(args).await,
        Command::Batch(args) => match run_batch(args).await {
            Ok(failed) => failed,
            Err(err) => {
                error!("Batch aborted: {:#}", err);
                1
            }
        },
    };

    // Exit with proper code for CI
    if failed > 0 {
        std::process::exit(1);
    }
}

async fn run_scenarios(args: ScenarioArgs) -> usize {
    if !args.json {
        info!("CoV Simulator v0.1.0");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<_> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                std::process::exit(1);
            }
        }
    };

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    let work_dir = args.work_dir.unwrap_or_else(|| std::env::temp_dir().join("cov-sim"));

    // Track results
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);

        let mut runner = ScenarioRunner::new(seed, &work_dir);
        if let Some(dir) = &args.export_dir {
            runner = runner.with_export_dir(dir.join(format!("seed-{seed}")));
        }

        for scenario in &scenarios {
            let result = runner.run(*scenario).await;

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if !result.passed {
                failed_count += 1;
            }

            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "turns": r.turns,
                    "vlm_calls": r.metrics.vlm_calls,
                    "renders": r.metrics.renders,
                    "total_tokens": r.metrics.total_tokens,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(err) => error!("Failed to encode summary: {}", err),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);

            for result in &all_results {
                if !result.passed {
                    error!(
                        "  - {} seed={}: {}",
                        result.scenario.name(),
                        result.seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }
    }

    failed_count
}

async fn run_batch(args: BatchArgs) -> anyhow::Result<usize> {
    let config = args.into_config()?;
    config.validate()?;

    let model = config.model_config()?;
    let vlm = OpenAiVlm::from_config(&model).with_context(|| format!("building client for {}", model.model_name))?;

    info!("CoV batch: model={} agent={}", model.model_name, config.agent);
    info!("Questions: {}", config.question_file.display());
    info!("Dataset:   {}", config.dataset_dir.display());

    let driver = BatchDriver::new(config, &model, SimSceneLoader::new(), Arc::new(vlm));
    info!("Output:    {}", driver.layout().root().display());

    let summary = driver.run().await?;
    info!(
        "Done: {} processed, {} skipped, {} failed",
        summary.processed, summary.skipped, summary.failed
    );
    Ok(summary.failed)
}
