//! Kolosal Explain CLI Module
//!
//! Command-line interface for running explainers on linear models over CSV data.

use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::ExplainConfig;
use crate::explainers::{plot_ale, Ale, AnchorTabular};
use crate::models::LinearModel;
use crate::registry;
use crate::utils::{DataLoader, Dataset};

// ─── Styling helpers ───────────────────────────────────────────────────────────

fn dim(s: &str) -> ColoredString { s.truecolor(100, 100, 100) }
fn accent(s: &str) -> ColoredString { s.truecolor(120, 170, 255) }
fn muted(s: &str) -> ColoredString { s.truecolor(140, 140, 140) }
fn ok(s: &str) -> ColoredString { s.truecolor(100, 210, 120) }

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

fn kv(key: &str, val: &str) {
    println!("  {:<16} {}", muted(key), val.white());
}

// ─── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "kolosal-explain")]
#[command(author = "KolosalAI")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Model explanations: ALE, anchors, counterfactuals and SHAP")]
#[command(long_about = None)]
pub struct Cli {
    /// Explainer configuration file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the exported explainers
    List,

    /// Accumulated local effects of a model over a dataset
    Ale {
        /// Input data file (CSV)
        #[arg(short, long)]
        data: PathBuf,

        /// Linear model file (JSON)
        #[arg(short, long)]
        model: PathBuf,

        /// Comma-separated feature names (default: all)
        #[arg(short, long)]
        features: Option<String>,

        /// Write the explanation as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Anchor rule for one row of a dataset
    Anchor {
        /// Input data file (CSV)
        #[arg(short, long)]
        data: PathBuf,

        /// Linear model file (JSON)
        #[arg(short, long)]
        model: PathBuf,

        /// Row to explain
        #[arg(short, long, default_value = "0")]
        row: usize,

        /// Precision threshold
        #[arg(short, long)]
        threshold: Option<f64>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Kernel SHAP values for the first rows of a dataset
    #[cfg(feature = "shap")]
    Shap {
        /// Input data file (CSV)
        #[arg(short, long)]
        data: PathBuf,

        /// Linear model file (JSON)
        #[arg(short, long)]
        model: PathBuf,

        /// Number of rows to explain
        #[arg(short, long, default_value = "5")]
        rows: usize,

        /// Background rows kept for expectations
        #[arg(short, long, default_value = "50")]
        background: usize,
    },
}

// ─── Data loading ──────────────────────────────────────────────────────────────

/// Load the model and the dataset columns it expects
pub fn load_inputs(data: &Path, model: &Path) -> anyhow::Result<(Dataset, LinearModel)> {
    let model = LinearModel::from_json_file(model)?;
    let dataset = DataLoader::new().load_matrix(data, model.feature_names.as_deref())?;
    if dataset.data.ncols() != model.n_features() {
        anyhow::bail!(
            "model expects {} features but {} has {} columns",
            model.n_features(),
            data.display(),
            dataset.data.ncols()
        );
    }
    Ok((dataset, model))
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ExplainConfig> {
    Ok(match path {
        Some(p) => ExplainConfig::from_json_file(p)?,
        None => ExplainConfig::default(),
    })
}

// ─── Commands ──────────────────────────────────────────────────────────────────

pub fn cmd_list() -> anyhow::Result<()> {
    section("Explainers");
    let names = registry::exported_names()?;
    for name in names {
        println!("  {} {}", ok("•"), name);
    }
    println!();
    let shap = if crate::explainers::SHAP_EXPORTS.iter().all(|n| names.contains(n)) {
        ok("available")
    } else {
        muted("unavailable")
    };
    kv("SHAP group", &shap.to_string());
    println!();
    Ok(())
}

pub fn cmd_ale(
    data: &Path,
    model_path: &Path,
    features: Option<&str>,
    output: Option<&Path>,
    config: Option<&Path>,
) -> anyhow::Result<()> {
    section("ALE");
    let config = load_config(config)?;

    step_run("Loading data");
    let (dataset, model) = load_inputs(data, model_path)?;
    step_done(&format!("{} rows × {} cols", dataset.data.nrows(), dataset.data.ncols()));

    let indices = match features {
        Some(list) => Some(
            list.split(',')
                .map(|name| {
                    let name = name.trim();
                    dataset
                        .feature_names
                        .iter()
                        .position(|n| n == name)
                        .ok_or_else(|| anyhow::anyhow!("unknown feature: {}", name))
                })
                .collect::<anyhow::Result<Vec<usize>>>()?,
        ),
        None => None,
    };

    step_run("Computing effects");
    let start = Instant::now();
    let ale = Ale::new(|x: &ndarray::Array2<f64>| model.predict_proba(x))
        .with_config(config.ale)
        .with_feature_names(dataset.feature_names.clone());
    let exp = ale.explain(&dataset.data, indices.as_deref())?;
    step_done(&format!("{:?}", start.elapsed()));

    // Logistic models have a redundant negative-class column
    let target = exp.n_targets() - 1;
    let plot = plot_ale(&exp, None, Some(&[target][..]), 2)?;
    println!();
    println!("{}", plot.render_text(40, 10));

    if let Some(path) = output {
        std::fs::write(path, exp.to_json()?)?;
        kv("Saved", &path.display().to_string());
    }
    println!();
    Ok(())
}

pub fn cmd_anchor(
    data: &Path,
    model_path: &Path,
    row: usize,
    threshold: Option<f64>,
    seed: Option<u64>,
    config: Option<&Path>,
) -> anyhow::Result<()> {
    section("Anchor");
    let config = load_config(config)?;

    step_run("Loading data");
    let (dataset, model) = load_inputs(data, model_path)?;
    step_done(&format!("{} rows × {} cols", dataset.data.nrows(), dataset.data.ncols()));
    if row >= dataset.data.nrows() {
        anyhow::bail!("row {} out of range ({} rows)", row, dataset.data.nrows());
    }

    let mut anchor_config = config.anchor;
    if let Some(t) = threshold {
        anchor_config.threshold = t;
    }
    if seed.is_some() {
        anchor_config.seed = seed;
    }

    step_run("Searching anchor");
    let start = Instant::now();
    let mut explainer = AnchorTabular::new(
        |x: &ndarray::Array2<f64>| model.predict_class(x),
        dataset.feature_names.clone(),
    )
    .with_config(anchor_config);
    explainer.fit(&dataset.data)?;
    let exp = explainer.explain(&dataset.data.row(row).to_owned())?;
    step_done(&format!("{:?}", start.elapsed()));

    println!();
    kv("Prediction", &exp.prediction.to_string());
    kv("Anchor", &exp.rule());
    kv("Precision", &format!("{:.3}", exp.precision));
    kv("Coverage", &format!("{:.3}", exp.coverage));
    if !exp.meets_threshold {
        println!("  {}", "No anchor reached the precision threshold".yellow());
    }
    println!();
    Ok(())
}

#[cfg(feature = "shap")]
pub fn cmd_shap(
    data: &Path,
    model_path: &Path,
    rows: usize,
    background: usize,
    config: Option<&Path>,
) -> anyhow::Result<()> {
    use crate::explainers::{KernelShap, ShapSummary};
    use ndarray::s;

    section("Kernel SHAP");
    let config = load_config(config)?;

    step_run("Loading data");
    let (dataset, model) = load_inputs(data, model_path)?;
    step_done(&format!("{} rows × {} cols", dataset.data.nrows(), dataset.data.ncols()));

    let n = rows.min(dataset.data.nrows());
    let mut shap_config = config.kernel_shap;
    shap_config.summarise_background = Some(background.max(1));

    step_run(&format!("Explaining {} rows", n));
    let start = Instant::now();
    let explainer = KernelShap::new(
        |x: &ndarray::Array2<f64>| model.predict_proba(x),
        dataset.data.clone(),
    )
    .with_feature_names(dataset.feature_names.clone())
    .with_config(shap_config);
    let exp = explainer.explain(&dataset.data.slice(s![..n, ..]).to_owned())?;
    step_done(&format!("{:?}", start.elapsed()));

    let output = exp.n_outputs() - 1;
    for i in 0..n {
        let local = exp.local(i, output)?;
        println!();
        kv(&format!("Row {}", i), &format!("{:.4}", local.prediction));
        for c in local.top_k_contributors(5) {
            let name = c.feature_name.clone().unwrap_or_else(|| c.feature_index.to_string());
            let value = format!("{:+.4}", c.contribution);
            let value = if c.contribution >= 0.0 { value.green() } else { value.red() };
            println!("    {:<20} {}", muted(&name), value);
        }
    }

    let summary = ShapSummary::from_explanation(&exp, output)?;
    section("Mean |SHAP|");
    for (idx, v) in summary.feature_ranking() {
        kv(&dataset.feature_names[idx], &format!("{:.4}", v));
    }
    println!();
    Ok(())
}
