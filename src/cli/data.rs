//! Dataset commands: `prepare` and `upload`

use anyhow::Context;
use colored::Colorize;
use labflow::codec;
use labflow::config::LabConfig;
use labflow::dataset::prepare::{split_dataset, write_splits, SplitRatios, Standardizer};
use std::path::{Path, PathBuf};
use tracing::info;

/// Options for `labflow prepare`
#[derive(Debug, Clone, clap::Args)]
pub struct PrepareArgs {
    /// Feature matrix (.npy, 2-D)
    #[arg(long)]
    pub x: PathBuf,

    /// Label vector (.npy, 1-D)
    #[arg(long)]
    pub y: PathBuf,

    /// Output directory (defaults to storage.data_dir)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Fraction of all rows held out for test
    #[arg(long, default_value_t = 0.15)]
    pub test_ratio: f64,

    /// Fraction of the remaining rows held out for validation
    #[arg(long, default_value_t = 0.2)]
    pub val_ratio: f64,

    /// Shuffle seed (defaults to training.random_seed)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Keep raw feature values instead of standardizing
    #[arg(long)]
    pub no_standardize: bool,

    /// Upload the splits once written
    #[arg(long)]
    pub upload: bool,
}

fn read_npy(path: &Path) -> anyhow::Result<codec::NpyArray> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    codec::decode(&bytes).with_context(|| format!("decoding {}", path.display()))
}

pub fn cmd_prepare(config: &LabConfig, args: PrepareArgs) -> anyhow::Result<()> {
    let x = read_npy(&args.x)?.into_features()?;
    let y = read_npy(&args.y)?.into_labels()?;
    let seed = args.seed.unwrap_or(config.training.random_seed);
    let ratios = SplitRatios {
        test: args.test_ratio,
        val: args.val_ratio,
    };

    let mut splits = split_dataset(x.view(), &y, ratios, seed)?;
    if !args.no_standardize {
        Standardizer::fit_splits(&mut splits);
    }
    info!(
        "Split {} rows: train={}, val={}, test={}",
        splits.total_rows(),
        splits.y_train.len(),
        splits.y_val.len(),
        splits.y_test.len()
    );

    let output = args
        .output
        .unwrap_or_else(|| config.storage.data_dir.clone());
    let written = write_splits(&splits, &output)?;
    for path in &written {
        println!("  {} {}", "✓".bright_green(), path.display());
    }

    if args.upload {
        cmd_upload(config, Some(output))?;
    }
    Ok(())
}

pub fn cmd_upload(config: &LabConfig, dir: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = dir.unwrap_or_else(|| config.storage.data_dir.clone());
    if !dir.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }

    let rt = super::runtime()?;
    let locations = rt.block_on(async {
        let dataset = config.dataset_store().await?;
        anyhow::Ok(dataset.upload_directory(&dir).await?)
    })?;

    println!(
        "{} Uploaded {} files from {}",
        "✓".bright_green(),
        locations.len(),
        dir.display()
    );
    for location in &locations {
        println!("  {}", location.to_string().dimmed());
    }
    Ok(())
}
