//! `labflow train`

use colored::Colorize;
use indexmap::IndexMap;
use labflow::config::LabConfig;
use labflow::tracking::RunStatus;
use labflow::train::{builtin, BatchReport, Classifier, TrainingOrchestrator, BUILTIN_CLASSIFIERS};
use tracing::info;

/// Options for `labflow train`
#[derive(Debug, Clone, clap::Args)]
pub struct TrainArgs {
    /// Classifiers to train, in order (defaults to training.classifiers)
    #[arg(long, value_delimiter = ',')]
    pub classifiers: Vec<String>,

    /// Deploy every registered model under this name
    #[arg(long)]
    pub deploy_as: Option<String>,

    /// Output format (text, json)
    #[arg(long, default_value = "text")]
    pub format: String,
}

/// Instantiate built-in classifiers by name, keeping the given order
pub fn resolve_classifiers(names: &[String]) -> anyhow::Result<IndexMap<String, Box<dyn Classifier>>> {
    let mut models = IndexMap::new();
    for name in names {
        let Some(model) = builtin(name) else {
            anyhow::bail!(
                "Unknown classifier: {}. Valid options: {}",
                name,
                BUILTIN_CLASSIFIERS.join(", ")
            );
        };
        models.insert(name.clone(), model);
    }
    Ok(models)
}

pub fn cmd_train(config: &LabConfig, args: TrainArgs) -> anyhow::Result<()> {
    let names = if args.classifiers.is_empty() {
        config.training.classifiers.clone()
    } else {
        args.classifiers
    };
    let models = resolve_classifiers(&names)?;

    let mut settings = config.training.settings();
    if args.deploy_as.is_some() {
        settings.deployment_name = args.deploy_as;
    }

    let rt = super::runtime()?;
    let report = rt.block_on(async {
        let dataset = config.dataset_store().await?;
        let tracker = config.tracker()?;
        let deployer = match settings.deployment_name {
            Some(_) => config.deployer()?,
            None => None,
        };
        if settings.deployment_name.is_some() && deployer.is_none() {
            anyhow::bail!("deployment.service_url must be set to deploy models");
        }

        let mut orchestrator = TrainingOrchestrator::new(&dataset, &tracker, settings);
        if let Some(deployer) = &deployer {
            orchestrator = orchestrator.with_deployer(deployer);
        }
        info!("Training {} classifiers", models.len());
        anyhow::Ok(orchestrator.run(models).await?)
    })?;

    match args.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_report(&report),
    }

    if report.parent_status == RunStatus::Failed {
        anyhow::bail!("every classifier failed");
    }
    Ok(())
}

fn print_report(report: &BatchReport) {
    println!();
    println!("{}", "Training Report".bright_cyan().bold());
    println!("{}", "─".repeat(50).dimmed());
    println!("  Parent run: {}", report.parent_run_id);
    for outcome in &report.outcomes {
        let icon = if outcome.is_success() {
            "✓".bright_green()
        } else {
            "✗".bright_red()
        };
        let accuracy = outcome
            .val_accuracy
            .map(|a| format!("{a:.4}"))
            .unwrap_or_else(|| "-".to_string());
        println!("  {} {:<24} val_acc={}", icon, outcome.model, accuracy);
        if let Some(registered) = &outcome.registered {
            println!(
                "      {} v{}",
                registered.name.dimmed(),
                registered.version
            );
        }
        if let Some(error) = &outcome.error {
            println!("      {}", error.bright_red());
        }
    }
    if let Some(best) = report.best() {
        println!("  Best: {}", best.model.bright_yellow().bold());
    }
    println!("{}", "─".repeat(50).dimmed());
    println!();
}
