// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Evaluation CLI for allergen prediction models
//!
//! Usage:
//!   allergen-eval --dataset synthetic --seed 42
//!   allergen-eval --dataset files --input qwen=runs/qwen.csv --input gemma=runs/gemma.json

use allergen_eval::pipeline::{EvaluationConfig, EvaluationPipeline, ModelInput};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "allergen-eval")]
#[command(about = "Evaluate and compare allergen prediction models")]
#[command(version)]
struct Args {
    /// Record source (synthetic, files)
    #[arg(short, long, default_value = "synthetic")]
    dataset: String,

    /// Model record file as key=path or path (repeatable)
    #[arg(short, long)]
    input: Vec<String>,

    /// Random seed for synthetic runs
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Samples per synthetic model
    #[arg(long, default_value_t = 200)]
    samples: usize,

    /// Minimum scored samples for a model to be ranked
    #[arg(long, default_value_t = allergen_eval::ranking::DEFAULT_MIN_SAMPLES)]
    min_samples: usize,

    /// JSON keyword lexicon replacing the built-in one
    #[arg(long)]
    lexicon: Option<PathBuf>,

    /// Output directory for results
    #[arg(short, long, default_value = "eval/results")]
    output: PathBuf,

    /// Output format (json, markdown, both)
    #[arg(short, long, default_value = "both")]
    format: String,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Allergen Prediction Evaluation");
    tracing::info!("==============================");
    tracing::info!("Dataset: {}", args.dataset);
    tracing::info!("Seed: {}", args.seed);

    let inputs = args
        .input
        .iter()
        .map(|arg| ModelInput::parse(arg))
        .collect::<Result<Vec<_>>>()?;

    let config = EvaluationConfig {
        seed: args.seed,
        dataset_id: args.dataset.clone(),
        inputs,
        synthetic_samples: args.samples,
        min_samples_for_ranking: args.min_samples,
        lexicon_path: args.lexicon.map(|p| p.to_string_lossy().to_string()),
        output_dir: args.output.to_string_lossy().to_string(),
    };

    let pipeline = EvaluationPipeline::new(config)?;
    let results = pipeline.run()?;

    // Print summary to console
    println!("\n{}", "=".repeat(92));
    println!("EVALUATION SUMMARY");
    println!("{}", "=".repeat(92));
    match results.summary.best_model {
        Some(ref best) => println!("\nBest Model: {} (F1 micro={:.4})", best, results.summary.best_f1_micro),
        None => println!("\nBest Model: none (no scored samples)"),
    }
    println!("\nModel Comparison:");
    println!("{:-<92}", "");
    println!(
        "{:<22} {:>6} {:>9} {:>9} {:>9} {:>10} {:>10} {:>10}",
        "Model", "N", "F1 micro", "F1 macro", "Exact", "Halluc %", "OverPred %", "Latency"
    );
    println!("{:-<92}", "");
    for m in &results.models {
        let latency = m.efficiency.avg_latency_ms.map_or("-".to_string(), |v| format!("{:.0}", v));
        println!(
            "{:<22} {:>6} {:>9.4} {:>9.4} {:>9.4} {:>10.2} {:>10.2} {:>10}",
            m.display_name,
            m.prediction_count,
            m.quality.f1_micro,
            m.quality.f1_macro,
            m.quality.exact_match_ratio,
            m.safety.hallucination_rate,
            m.safety.over_prediction_rate,
            latency
        );
    }
    println!("{:-<92}", "");

    for ranking in results.rankings.values() {
        if ranking.badges.is_empty() {
            continue;
        }
        let badges: Vec<&str> = ranking.badges.iter().map(|b| b.title.as_str()).collect();
        println!("{}: {}", ranking.display_name, badges.join(", "));
    }
    if results.summary.total_skipped_records > 0 {
        println!("\nSkipped malformed records: {}", results.summary.total_skipped_records);
    }

    // Save outputs
    std::fs::create_dir_all(&args.output)?;

    if args.format == "json" || args.format == "both" {
        let json_path = EvaluationPipeline::results_path(&args.output, &args.dataset, &results.timestamp, "json");
        EvaluationPipeline::save_results(&results, &json_path)?;
        println!("\nJSON results saved to: {}", json_path.display());
    }

    if args.format == "markdown" || args.format == "both" {
        let report = EvaluationPipeline::generate_report(&results);
        let md_path = EvaluationPipeline::results_path(&args.output, &args.dataset, &results.timestamp, "md");
        std::fs::write(&md_path, report)?;
        println!("Markdown report saved to: {}", md_path.display());
    }

    println!("\nEvaluation complete!");

    Ok(())
}
