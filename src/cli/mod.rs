//! Kolosal Fusion NAS CLI Module
//!
//! Command-line interface for running a fusion architecture search,
//! inspecting the searchable graph and decoding saved architecture weights.

use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::SearchConfig;
use crate::context::RunContext;
use crate::nas::{derive_genotype, ArchitectureParameters, EdgeOp, FusionTopology, Genotype};
use crate::train::{BilevelSearcher, InMemoryDataset, TracingProgress};

// ─── Styling helpers ───────────────────────────────────────────────────────────

fn dim(s: &str) -> ColoredString   { s.truecolor(100, 100, 100) }
fn accent(s: &str) -> ColoredString { s.truecolor(120, 170, 255) }
fn muted(s: &str) -> ColoredString  { s.truecolor(140, 140, 140) }
fn ok(s: &str) -> ColoredString     { s.truecolor(100, 210, 120) }

fn kv(key: &str, val: &str) {
    println!("  {:<18} {}", muted(key), val.white());
}

fn step_run(msg: &str) {
    print!("  {} {}... ", accent("›"), msg);
}

fn step_done(detail: &str) {
    println!("{} {}", ok("done"), dim(detail));
}

fn section(title: &str) {
    println!();
    println!("  {}", title.white().bold());
    println!("  {}", dim(&"─".repeat(56)));
}

fn print_genotype(genotype: &Genotype) {
    for node in &genotype.nodes {
        let edges: Vec<String> = node
            .edges
            .iter()
            .map(|e| format!("{} {} {}", e.op.to_string().cyan(), dim("<-"), e.source))
            .collect();
        println!("  {} {}", muted(&format!("node {:<2}", node.node)), edges.join(", "));
    }
    println!("  {} {:?}", muted("concat "), genotype.concat);
    println!(
        "  {} {}/{}",
        muted("live   "),
        genotype.num_live_edges(),
        genotype.num_edges()
    );
}

/// Wall-clock duration as `Xm Ys`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}m {}s", secs / 60, secs % 60)
}

// ─── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "kolosal-fusion-nas")]
#[command(author = "KolosalAI")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Differentiable architecture search for multimodal fusion")]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a bi-level fusion architecture search
    Search {
        /// Search configuration (JSON); defaults are used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Dataset file (JSON, see InMemoryDataset)
        #[arg(short, long, conflicts_with = "synthetic")]
        data: Option<PathBuf>,

        /// Generate a synthetic dataset with this many samples
        #[arg(long)]
        synthetic: Option<usize>,

        /// Fraction of samples used for weight training; the rest drives the architecture
        #[arg(long, default_value = "0.8")]
        train_fraction: f64,

        /// Experiment name
        #[arg(long, default_value = "EXP")]
        save: String,

        /// Directory receiving the experiment folder
        #[arg(long, default_value = "final_exp")]
        out_dir: PathBuf,

        /// Override the configured number of epochs
        #[arg(long)]
        epochs: Option<usize>,

        /// Override the configured seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Print the node and edge arena of the searchable graph
    Topology {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Decode a saved architecture parameter snapshot into a genotype
    Decode {
        /// Architecture parameters (JSON)
        #[arg(short, long)]
        arch: PathBuf,

        /// Configuration the snapshot was searched with
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SearchConfig> {
    match path {
        Some(p) => SearchConfig::from_json_file(p)
            .with_context(|| format!("failed to load configuration {}", p.display())),
        None => Ok(SearchConfig::default()),
    }
}

/// Create `out_dir/search-{save}-{timestamp}`
pub fn create_exp_dir(out_dir: &Path, save: &str) -> anyhow::Result<PathBuf> {
    let name = format!("search-{}-{}", save, Local::now().format("%Y%m%d-%H%M%S"));
    let dir = out_dir.join(name);
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(dir)
}

/// Dataset file or synthetic samples, chunked by the configured `batchsize`
pub fn load_dataset(
    config: &SearchConfig,
    data_path: Option<&Path>,
    synthetic: Option<usize>,
    ctx: &mut RunContext,
) -> anyhow::Result<InMemoryDataset> {
    let dataset = match data_path {
        Some(p) => InMemoryDataset::from_json_file(p)
            .with_context(|| format!("failed to load dataset {}", p.display()))?
            .with_batchsize(config.batchsize)?,
        None => InMemoryDataset::synthetic(config, synthetic.unwrap_or(256), ctx.rng())?,
    };
    Ok(dataset)
}

#[allow(clippy::too_many_arguments)]
pub fn cmd_search(
    config_path: Option<&Path>,
    data_path: Option<&Path>,
    synthetic: Option<usize>,
    train_fraction: f64,
    save: &str,
    out_dir: &Path,
    epochs: Option<usize>,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    section("Search");

    let mut config = load_config(config_path)?;
    if let Some(e) = epochs {
        config.epochs = e;
    }
    if let Some(s) = seed {
        config.seed = s;
    }
    config.validate()?;

    let exp_dir = create_exp_dir(out_dir, save)?;
    std::fs::write(exp_dir.join("config.json"), config.to_json()?)?;
    kv("Experiment", &exp_dir.display().to_string());

    step_run("Loading data");
    let mut ctx = RunContext::cpu(config.seed);
    let mut dataset = load_dataset(&config, data_path, synthetic, &mut ctx)?;
    dataset.shuffle(ctx.rng());
    let (train, valid) = dataset.split(train_fraction)?;
    step_done(&format!("{} train / {} valid samples", train.len(), valid.len()));

    let start = Instant::now();
    let mut searcher = BilevelSearcher::with_context(config.clone(), ctx, TracingProgress)?;
    let outcome = searcher.search(&train, &valid)?;
    let elapsed = start.elapsed();

    std::fs::write(exp_dir.join("genotype.json"), outcome.best_genotype.to_json()?)?;
    std::fs::write(exp_dir.join("arch.json"), serde_json::to_string_pretty(&outcome.best_arch)?)?;
    std::fs::write(exp_dir.join("history.json"), serde_json::to_string_pretty(&outcome.history)?)?;

    section("Result");
    kv("Best F1", &format!("{:.4} ({})", outcome.best_f1, config.f1_type));
    kv("Best epoch", &outcome.best_epoch.to_string());
    kv("Search time", &format_elapsed(elapsed));
    println!();
    print_genotype(&outcome.best_genotype);
    println!();
    Ok(())
}

pub fn cmd_topology(config_path: Option<&Path>) -> anyhow::Result<()> {
    section("Topology");
    let config = load_config(config_path)?;
    let topology = FusionTopology::from_config(&config)?;
    kv("Inputs", &topology.num_input_nodes().to_string());
    kv("Nodes", &topology.num_nodes().to_string());
    kv("Edges", &topology.num_edges().to_string());
    let ops: Vec<&str> = EdgeOp::ALL.iter().map(|op| op.name()).collect();
    kv("Operations", &ops.join(", "));
    println!();
    println!("{}", topology);
    Ok(())
}

pub fn cmd_decode(arch_path: &Path, config_path: Option<&Path>) -> anyhow::Result<()> {
    section("Decode");
    let config = load_config(config_path)?;
    let topology = FusionTopology::from_config(&config)?;
    let json = std::fs::read_to_string(arch_path)
        .with_context(|| format!("failed to read {}", arch_path.display()))?;
    let arch: ArchitectureParameters = serde_json::from_str(&json)?;
    let genotype = derive_genotype(&topology, &arch, config.num_keep_edges)?;
    print_genotype(&genotype);
    println!();
    Ok(())
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Search {
            config,
            data,
            synthetic,
            train_fraction,
            save,
            out_dir,
            epochs,
            seed,
        } => cmd_search(
            config.as_deref(),
            data.as_deref(),
            synthetic,
            train_fraction,
            &save,
            &out_dir,
            epochs,
            seed,
        ),
        Commands::Topology { config } => cmd_topology(config.as_deref()),
        Commands::Decode { arch, config } => cmd_decode(&arch, config.as_deref()),
    }
}
