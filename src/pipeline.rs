//! One aggregation pass for one campaign
//!
//! Parses the raw reports of a network into canonical delivery data, rebuilds
//! eligibility from the relevant allocation snapshots, merges both into the
//! persisted node metrics and stores the result.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::delivery::{parser_for, CanonicalDeliveryData, ParseError};
use crate::eligibility::{
    allocation_node_map, filter_index, EligibilityError, EligibilityHistoryBuilder,
};
use crate::metrics::{BudgetSummary, DeliveryDataCost, DeliveryMetrics, DeliveryMetricsConfig};
use crate::models::DeliveryNetwork;
use crate::storage::{AllocationHistorySource, BudgetFigures, HistoryError, MetricsStore, StorageError};

#[derive(Debug, Error)]
pub enum PassError {
    #[error("report {report} could not be parsed")]
    Parse {
        report: String,
        #[source]
        source: ParseError,
    },
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Eligibility(#[from] EligibilityError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One raw report as pulled from a network
#[derive(Debug, Clone)]
pub struct RawReport {
    /// Used in errors and logs only
    pub name: String,
    pub text: String,
    pub pulled_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CampaignPass {
    pub campaign_id: String,
    pub network: DeliveryNetwork,
    pub total_budget: Decimal,
    pub reports: Vec<RawReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub campaign_id: String,
    pub network: DeliveryNetwork,
    pub reports: usize,
    pub records: usize,
    pub snapshots: usize,
    pub last_valid_report_hour: Option<DateTime<Utc>>,
    pub budget: BudgetSummary,
}

/// Records whose campaign id differs from the pass campaign, for networks
/// whose reports carry it
fn foreign_campaign_records(canonical: &CanonicalDeliveryData, campaign_id: &str) -> usize {
    if !canonical.network().reports_campaign_id() {
        return 0;
    }
    canonical
        .records()
        .filter(|record| record.campaign_id != campaign_id)
        .count()
}

pub struct DeliveryPass {
    store: Arc<dyn MetricsStore>,
    history: Arc<dyn AllocationHistorySource>,
    config: DeliveryMetricsConfig,
    data_cost: Arc<dyn DeliveryDataCost>,
}

impl DeliveryPass {
    pub fn new(
        store: Arc<dyn MetricsStore>,
        history: Arc<dyn AllocationHistorySource>,
        config: DeliveryMetricsConfig,
        data_cost: Arc<dyn DeliveryDataCost>,
    ) -> Self {
        Self {
            store,
            history,
            config,
            data_cost,
        }
    }

    /// Run one pass. Nothing is persisted unless every step succeeds.
    pub async fn run(&self, pass: &CampaignPass) -> Result<PassSummary, PassError> {
        let campaign_id = pass.campaign_id.as_str();
        info!(
            "Starting {} delivery pass for campaign {} ({} reports)",
            pass.network,
            campaign_id,
            pass.reports.len()
        );

        let parser = parser_for(pass.network);
        let mut canonical = CanonicalDeliveryData::new(pass.network);
        for report in &pass.reports {
            canonical
                .add_raw_data(&report.text, report.pulled_at, parser.as_ref())
                .map_err(|source| PassError::Parse {
                    report: report.name.clone(),
                    source,
                })?;
        }

        let foreign = foreign_campaign_records(&canonical, campaign_id);
        if foreign > 0 {
            warn!(
                "{} delivery records name a campaign other than {}",
                foreign, campaign_id
            );
        }

        let index = self.history.get_index(campaign_id).await?;
        let relevant = filter_index(&index, self.config.look_back, canonical.latest_delivery_data_date())?;

        let mut snapshots = Vec::with_capacity(relevant.len());
        for element in &relevant {
            snapshots.push(self.history.get_snapshot(campaign_id, element).await?);
        }

        let eligibility = EligibilityHistoryBuilder::from_snapshots(&snapshots);
        let node_map = allocation_node_map(&snapshots);

        let prior = self.store.load_node_metrics(campaign_id).await?;
        let mut metrics =
            DeliveryMetrics::new(self.config.clone(), Arc::clone(&self.data_cost)).with_node_metrics(prior);

        let last_valid_report_hour = metrics.last_valid_report_hour(&canonical);
        let budget = metrics.calculate_node_metrics(&canonical, &eligibility, &node_map, pass.total_budget);

        let figures = BudgetFigures {
            total_budget: pass.total_budget,
            remaining_budget: budget.remaining_budget,
            lifetime_media_budget_cap: budget.lifetime_media_budget_cap,
            updated_at: Utc::now(),
        };
        self.store
            .save_node_metrics(campaign_id, metrics.node_metrics(), &figures)
            .await?;

        info!(
            "Finished delivery pass for campaign {}: remaining budget {}, lifetime media cap {}",
            campaign_id, budget.remaining_budget, budget.lifetime_media_budget_cap
        );

        Ok(PassSummary {
            campaign_id: campaign_id.to_string(),
            network: pass.network,
            reports: pass.reports.len(),
            records: canonical.len(),
            snapshots: snapshots.len(),
            last_valid_report_hour,
            budget,
        })
    }
}
