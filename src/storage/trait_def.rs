use crate::metrics::NodeDeliveryMetrics;
use crate::models::MeasureSet;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("stored metrics for campaign {campaign_id} node `{node}` are corrupt: {reason}")]
    Corrupt {
        campaign_id: String,
        node: String,
        reason: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Budget figures persisted alongside the node metrics of a campaign
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetFigures {
    pub total_budget: Decimal,
    pub remaining_budget: Decimal,
    pub lifetime_media_budget_cap: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Initialize the storage (create tables)
    async fn init(&self) -> Result<()>;

    /// Load the persisted metrics of every node of a campaign
    async fn load_node_metrics(
        &self,
        campaign_id: &str,
    ) -> StorageResult<HashMap<MeasureSet, NodeDeliveryMetrics>>;

    /// Persist the node metrics and budget figures of one pass atomically
    async fn save_node_metrics(
        &self,
        campaign_id: &str,
        node_metrics: &HashMap<MeasureSet, NodeDeliveryMetrics>,
        figures: &BudgetFigures,
    ) -> StorageResult<()>;

    async fn get_budget_figures(&self, campaign_id: &str) -> StorageResult<Option<BudgetFigures>>;

    /// Campaign ids with persisted metrics
    async fn list_campaigns(&self) -> Result<Vec<String>>;
}
