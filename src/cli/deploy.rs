//! `labflow deploy` and `labflow predict`

use anyhow::Context;
use colored::Colorize;
use labflow::codec;
use labflow::config::LabConfig;
use std::path::PathBuf;

/// Options for `labflow deploy`
#[derive(Debug, Clone, clap::Args)]
pub struct DeployArgs {
    /// Model to serve, e.g. `runs:/<run_id>/model`
    #[arg(long)]
    pub model_uri: String,

    /// Deployment name; an existing deployment with this name is replaced
    #[arg(long)]
    pub name: String,

    /// Serving image (defaults to deployment.settings.image_url)
    #[arg(long)]
    pub image: Option<String>,

    #[arg(long)]
    pub region: Option<String>,

    /// Execution role (defaults to deployment.settings.execution_role_arn)
    #[arg(long)]
    pub role: Option<String>,
}

/// Options for `labflow predict`
#[derive(Debug, Clone, clap::Args)]
pub struct PredictArgs {
    /// Rows to score (.npy, 2-D)
    #[arg(long, conflicts_with = "json")]
    pub input: Option<PathBuf>,

    /// Rows to score as a JSON array of arrays
    #[arg(long)]
    pub json: Option<String>,

    /// Scoring URL (defaults to inference.endpoint_url)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Deployment behind the endpoint (defaults to inference.deployment)
    #[arg(long)]
    pub deployment: Option<String>,
}

pub fn cmd_deploy(config: &LabConfig, args: DeployArgs) -> anyhow::Result<()> {
    let Some(client) = config.deployer()? else {
        anyhow::bail!("deployment.service_url is not configured");
    };

    let rt = super::runtime()?;
    let deployment = rt.block_on(client.deploy(
        &args.model_uri,
        &args.name,
        args.image.as_deref(),
        args.region.as_deref(),
        args.role.as_deref(),
    ))?;

    println!(
        "{} {} serving {} [{}]",
        "✓".bright_green(),
        deployment.name.bright_cyan(),
        deployment.model_uri,
        deployment.status
    );
    Ok(())
}

/// Rows from `--input` or `--json`
pub fn load_rows(args: &PredictArgs) -> anyhow::Result<Vec<Vec<f64>>> {
    if let Some(path) = &args.input {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let features = codec::decode(&bytes)?.into_features()?;
        return Ok(features.rows().into_iter().map(|r| r.to_vec()).collect());
    }
    if let Some(json) = &args.json {
        return serde_json::from_str(json).context("--json must be an array of numeric arrays");
    }
    anyhow::bail!("one of --input or --json is required")
}

pub fn cmd_predict(config: &LabConfig, args: PredictArgs) -> anyhow::Result<()> {
    let rows = load_rows(&args)?;
    let inference = &config.inference;
    let endpoint = args
        .endpoint
        .or_else(|| inference.endpoint_url.clone())
        .context("no endpoint: pass --endpoint or set inference.endpoint_url")?;
    let deployment = args
        .deployment
        .or_else(|| inference.deployment.clone())
        .context("no deployment: pass --deployment or set inference.deployment")?;
    let api_key = inference
        .api_key
        .clone()
        .context("no API key: set inference.api_key or LABFLOW_INFERENCE_KEY")?;

    let client = config.inference_client()?;
    let rt = super::runtime()?;
    match rt.block_on(client.predict(&endpoint, &api_key, &deployment, &rows)) {
        Some(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        None => anyhow::bail!("prediction failed, see the log for the endpoint response"),
    }
}
