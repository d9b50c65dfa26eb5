mod cli;
mod ui;

use std::path::Path;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cli::{Cli, Command};
use remediator::decision::{DecisionEngine, RuleBasedScorer};
use remediator::executor::DryRunExecutor;
use remediator::notify::TracingNotifier;
use remediator::orchestrator::BatchItem;
use remediator::signal::{Activity, DataCategory, RiskLevel, Violation, ViolationSignal};
use remediator::{Orchestrator, RemediatorConfig};

/// Input file layout: `violations = [...]` in TOML, `{"violations": [...]}` or a bare array in JSON.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BatchFile {
    Wrapped { violations: Vec<BatchItem> },
    Bare(Vec<BatchItem>),
}

impl BatchFile {
    fn into_items(self) -> Vec<BatchItem> {
        match self {
            BatchFile::Wrapped { violations } | BatchFile::Bare(violations) => violations,
        }
    }
}

fn read_batch(path: &Path) -> anyhow::Result<Vec<BatchItem>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: BatchFile = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?,
        _ => serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?,
    };
    Ok(file.into_items())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RemediatorConfig> {
    let config = match path {
        Some(path) => RemediatorConfig::load_from(path)?,
        None => RemediatorConfig::load()?,
    };
    Ok(config)
}

fn demo_items() -> Vec<BatchItem> {
    let activity = |id: &str, categories: Vec<DataCategory>, cross_border: bool| Activity {
        id: id.to_string(),
        name: format!("Activity {id}"),
        purpose: "customer support".into(),
        data_categories: categories,
        legal_bases: vec!["contract".into()],
        cross_border_transfers: cross_border,
        automated_decision_making: false,
        recipients: vec!["crm-vendor".into()],
    };
    let violation = |id: &str, activity_id: &str, risk: RiskLevel, actions: &[&str]| Violation {
        id: id.to_string(),
        rule_id: format!("gdpr-{id}"),
        description: "Demo violation".into(),
        risk_level: risk,
        recommended_actions: actions.iter().map(|a| a.to_string()).collect(),
        activity_id: activity_id.to_string(),
    };

    vec![
        BatchItem {
            violation: violation(
                "demo-retention",
                "support-tickets",
                RiskLevel::Low,
                &["Delete records past retention", "Update privacy notice"],
            ),
            activity: activity("support-tickets", vec![DataCategory::PersonalData], false),
            framework: "GDPR".into(),
        },
        BatchItem {
            violation: violation(
                "demo-transfer",
                "analytics-export",
                RiskLevel::High,
                &["Encrypt exported datasets", "Restrict access to analysts"],
            ),
            activity: activity(
                "analytics-export",
                vec![DataCategory::PersonalData, DataCategory::BehavioralData],
                true,
            ),
            framework: "GDPR".into(),
        },
        BatchItem {
            violation: violation(
                "demo-health",
                "claims",
                RiskLevel::Critical,
                &["Review consent records"],
            ),
            activity: activity("claims", vec![DataCategory::HealthData], false),
            framework: "HIPAA".into(),
        },
    ]
}

async fn classify(config: &RemediatorConfig, items: Vec<BatchItem>) -> anyhow::Result<()> {
    let engine = DecisionEngine::new(RuleBasedScorer, config.scoring_timeout());
    let palette = ui::Palette::default();
    for item in items {
        let id = item.violation.id.clone();
        let signal = ViolationSignal::new(item.violation, item.activity, item.framework)
            .with_context(|| format!("violation {id}"))?;
        palette.print_decision(&engine.decide(&signal).await);
    }
    Ok(())
}

async fn run(
    config: RemediatorConfig,
    items: Vec<BatchItem>,
    max_concurrent: usize,
    json: bool,
) -> anyhow::Result<()> {
    let orchestrator =
        Orchestrator::in_memory(config, RuleBasedScorer, DryRunExecutor, TracingNotifier)?;
    orchestrator.start().await;

    let progress = ui::BatchProgress::start(items.len())?;
    let report = orchestrator.submit_batch(items, max_concurrent).await;
    progress.finish();
    let metrics = orchestrator.metrics().await;
    orchestrator.shutdown().await;

    if json {
        let out = serde_json::json!({ "report": report, "metrics": metrics });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        let palette = ui::Palette::default();
        palette.print_batch(&report);
        palette.print_metrics(&metrics);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Classify { file } => classify(&config, read_batch(&file)?).await,
        Command::Run {
            file,
            max_concurrent,
            json,
        } => run(config, read_batch(&file)?, max_concurrent, json).await,
        Command::Demo => {
            let items = demo_items();
            classify(&config, items.clone()).await?;
            run(config, items, 2, false).await
        }
    }
}
