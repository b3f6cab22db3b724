#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use resonance_gate::builder::{build_axis_pack, AxisSeed, BuildOptions, DirectionMethod};
use resonance_gate::calibrate::{calibrate, CalibrationOptions, LabeledExample};
use resonance_gate::capacity::Capacity;
use resonance_gate::encoder::HashEncoder;
use resonance_gate::pack::AxisPack;
use resonance_gate::pipeline::{PipelineParams, ResonancePipeline};
use resonance_gate::registry::AxisRegistry;

#[derive(Parser)]
#[command(name = "rgate", version, about = "Resonance gate CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an axis pack from a seeds JSON file
    BuildPack {
        /// Seeds file: {"axes": [{name, positives, negatives, pole?}, ...]}
        #[arg(long)]
        seeds: PathBuf,
        /// Artifact directory for <id>.arrays.json / <id>.meta.json
        #[arg(long)]
        out: PathBuf,
        /// Embedding dimension of the deterministic hash encoder
        #[arg(long, default_value_t = 384)]
        dim: usize,
        /// Direction method: diffmean | cca | lda
        #[arg(long, default_value = "diffmean")]
        method: String,
        /// Pack id override; derived from timestamp + fingerprint if unset
        #[arg(long)]
        id: Option<String>,
    },
    /// Evaluate text against a saved pack and print the decision proof
    Eval {
        #[arg(long)]
        artifacts: PathBuf,
        #[arg(long)]
        pack_id: String,
        #[arg(long)]
        text: String,
        #[arg(long, default_value_t = 384)]
        dim: usize,
        /// Print the full report instead of just the proof
        #[arg(long)]
        full: bool,
    },
    /// Calibrate thresholds from a labeled JSONL dataset
    Calibrate {
        #[arg(long)]
        artifacts: PathBuf,
        #[arg(long)]
        pack_id: String,
        /// JSONL file with {"axis": ..., "text": ..., "label": 0|1} lines
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long, default_value_t = 384)]
        dim: usize,
        #[arg(long, default_value_t = 0.05)]
        fpr_max: f64,
        /// Id for the calibrated pack; defaults to <pack_id>-cal
        #[arg(long)]
        out_id: Option<String>,
    },
}

#[derive(Deserialize)]
struct SeedsFile {
    axes: Vec<AxisSeed>,
    #[serde(default)]
    capacity: Option<BTreeMap<String, f64>>,
}

#[derive(Deserialize)]
struct DatasetLine {
    axis: String,
    text: String,
    label: f64,
}

fn parse_method(name: &str) -> Result<DirectionMethod, String> {
    match name {
        "diffmean" => Ok(DirectionMethod::DiffMean),
        "cca" => Ok(DirectionMethod::Cca),
        "lda" => Ok(DirectionMethod::Lda),
        other => Err(format!("unknown method: {other}")),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber_init();
    let cli = Cli::parse();

    match cli.command {
        Commands::BuildPack {
            seeds,
            out,
            dim,
            method,
            id,
        } => {
            let file: SeedsFile = serde_json::from_str(&fs::read_to_string(&seeds)?)?;
            let capacity = match &file.capacity {
                Some(map) => Some(Capacity::from_json_map(file.axes.len(), map)?),
                None => None,
            };
            let options = BuildOptions {
                method: parse_method(&method)?,
                capacity,
                id,
                ..Default::default()
            };
            let encoder = HashEncoder::new(dim);
            let pack = build_axis_pack(&encoder, &file.axes, &options)?;
            pack.save(&out)?;
            println!(
                "{}",
                serde_json::json!({
                    "pack_id": pack.id,
                    "axes": pack.names,
                    "dim": pack.d(),
                    "fingerprint": pack.fingerprint(),
                })
            );
        }
        Commands::Eval {
            artifacts,
            pack_id,
            text,
            dim,
            full,
        } => {
            let pack = AxisPack::load(&artifacts, &pack_id)?;
            let registry = std::sync::Arc::new(AxisRegistry::new(pack.d()));
            registry.insert(pack)?;
            registry.activate(&pack_id)?;
            let pipeline = ResonancePipeline::new(
                HashEncoder::new(dim),
                registry,
                PipelineParams::default(),
            );
            let report = pipeline.evaluate("cli", &text)?;
            if full {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&report.proof)?);
            }
        }
        Commands::Calibrate {
            artifacts,
            pack_id,
            dataset,
            dim,
            fpr_max,
            out_id,
        } => {
            let pack = AxisPack::load(&artifacts, &pack_id)?;
            let mut datasets: BTreeMap<String, Vec<LabeledExample>> = BTreeMap::new();
            for line in fs::read_to_string(&dataset)?.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let parsed: DatasetLine = serde_json::from_str(line)?;
                datasets.entry(parsed.axis).or_default().push(LabeledExample {
                    text: parsed.text,
                    label: parsed.label,
                });
            }
            let encoder = HashEncoder::new(dim);
            let options = CalibrationOptions {
                fpr_max,
                set_scales: true,
            };
            let outcome = calibrate(&encoder, &pack, &datasets, &options)?;
            let calibrated =
                pack.with_calibration(outcome.thresholds.clone(), outcome.scales.clone(), out_id)?;
            calibrated.save(&artifacts)?;
            println!(
                "{}",
                serde_json::json!({
                    "pack_id": calibrated.id,
                    "thresholds": calibrated.thresholds,
                    "fpr_max": outcome.fpr_max,
                    "per_axis": outcome.per_axis,
                })
            );
        }
    }
    Ok(())
}

fn tracing_subscriber_init() {
    // Logs stay on stderr; stdout is reserved for JSON output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}
