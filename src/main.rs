use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use pacing::config::Config;
use pacing::metrics::{DeliveryDataCost, NoDataCost, PercentOfMediaDataCost};
use pacing::models::DeliveryNetwork;
use pacing::pipeline::{CampaignPass, DeliveryPass, RawReport};
use pacing::storage::{DirectoryHistorySource, MetricsStore, SqliteMetricsStore};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pacing")]
#[command(about = "Delivery reconciliation and rolling node metrics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one delivery pass for a campaign from local report files
    Run {
        /// Campaign ID
        #[arg(long)]
        campaign: String,
        /// Delivery network the reports come from (network-a, network-b)
        #[arg(long)]
        network: DeliveryNetwork,
        /// Total campaign budget
        #[arg(long)]
        budget: Decimal,
        /// Raw report files, in pull order
        #[arg(long = "report", required = true)]
        reports: Vec<PathBuf>,
        /// Pull time applied to every report (RFC 3339); defaults to each file's mtime
        #[arg(long)]
        pulled_at: Option<DateTime<Utc>>,
        /// Data cost as a percentage of media eCPM
        #[arg(long)]
        data_cost_percent: Option<Decimal>,
        /// Cap on the data cost CPM when --data-cost-percent is set
        #[arg(long, requires = "data_cost_percent")]
        data_cost_max_cpm: Option<Decimal>,
    },
    /// Show persisted metrics of a campaign
    Show {
        /// Campaign ID
        #[arg(long)]
        campaign: String,
        /// Print the full per-node metrics as JSON
        #[arg(long)]
        json: bool,
    },
    /// List campaigns with persisted metrics
    List,
}

async fn read_report(path: &Path, pulled_at: Option<DateTime<Utc>>) -> Result<RawReport> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read report {}", path.display()))?;

    let pulled_at = match pulled_at {
        Some(pulled_at) => pulled_at,
        None => {
            let modified = tokio::fs::metadata(path)
                .await
                .and_then(|metadata| metadata.modified())
                .with_context(|| format!("Failed to read modification time of {}", path.display()))?;
            DateTime::<Utc>::from(modified)
        }
    };

    Ok(RawReport {
        name: path.display().to_string(),
        text,
        pulled_at,
    })
}

fn data_cost(percent: Option<Decimal>, max_cpm: Option<Decimal>) -> Result<Arc<dyn DeliveryDataCost>> {
    match percent {
        None => Ok(Arc::new(NoDataCost)),
        Some(percent) if percent.is_sign_negative() => {
            bail!("--data-cost-percent must not be negative, got {percent}")
        }
        Some(percent) => Ok(Arc::new(PercentOfMediaDataCost::new(
            percent / Decimal::ONE_HUNDRED,
            max_cpm,
        ))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let store = Arc::new(
        SqliteMetricsStore::new(&config.database.url, config.database.max_connections).await?,
    );
    // Ensure database is initialized
    store.init().await?;

    match cli.command {
        Commands::Run {
            campaign,
            network,
            budget,
            reports,
            pulled_at,
            data_cost_percent,
            data_cost_max_cpm,
        } => {
            let mut raw_reports = Vec::with_capacity(reports.len());
            for path in &reports {
                raw_reports.push(read_report(path, pulled_at).await?);
            }

            info!(
                "Using allocation history under {}",
                config.history.root_dir.display()
            );
            let history = Arc::new(DirectoryHistorySource::new(config.history.root_dir.clone()));
            let pass = DeliveryPass::new(
                store,
                history,
                config.metrics.delivery_metrics()?,
                data_cost(data_cost_percent, data_cost_max_cpm)?,
            );

            let summary = pass
                .run(&CampaignPass {
                    campaign_id: campaign,
                    network,
                    total_budget: budget,
                    reports: raw_reports,
                })
                .await?;

            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Show { campaign, json } => {
            let node_metrics = store.load_node_metrics(&campaign).await?;
            let figures = store.get_budget_figures(&campaign).await?;

            if json {
                let nodes: std::collections::BTreeMap<_, _> = node_metrics.iter().collect();
                let document = serde_json::json!({
                    "campaign_id": campaign,
                    "budget": figures,
                    "nodes": nodes,
                });
                println!("{}", serde_json::to_string_pretty(&document)?);
                return Ok(());
            }

            match figures {
                Some(figures) => {
                    println!("Campaign {campaign} (updated {})", figures.updated_at);
                    println!("  total budget:              {}", figures.total_budget);
                    println!("  remaining budget:          {}", figures.remaining_budget);
                    println!("  lifetime media budget cap: {}", figures.lifetime_media_budget_cap);
                }
                None => println!("No budget figures stored for campaign {campaign}."),
            }

            if node_metrics.is_empty() {
                println!("No node metrics stored.");
            } else {
                let mut nodes: Vec<_> = node_metrics.iter().collect();
                nodes.sort_by(|a, b| a.0.cmp(b.0));

                println!(
                    "{:<24} {:>10} {:>14} {:>14} {:>14}  {}",
                    "Node", "Hours", "Impressions", "Media spend", "Total spend", "Watermark"
                );
                println!("{}", "-".repeat(110));
                for (node, metrics) in nodes {
                    let watermark = metrics
                        .last_processed_eligibility_hour
                        .map(|hour| hour.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<24} {:>10} {:>14} {:>14} {:>14}  {}",
                        node.to_string(),
                        metrics.total_eligible_hours,
                        metrics.total_impressions,
                        metrics.total_media_spend,
                        metrics.total_spend,
                        watermark
                    );
                }
            }
        }
        Commands::List => {
            let campaigns = store.list_campaigns().await?;
            if campaigns.is_empty() {
                println!("No campaigns with stored metrics.");
            } else {
                for campaign in campaigns {
                    println!("{campaign}");
                }
            }
        }
    }

    Ok(())
}
