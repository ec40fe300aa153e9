use crate::metrics::NodeDeliveryMetrics;
use crate::models::MeasureSet;
use crate::storage::{BudgetFigures, MetricsStore, StorageError, StorageResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

pub struct SqliteMetricsStore {
    pool: Arc<SqlitePool>,
}

impl SqliteMetricsStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid SQLite database URL {database_url}"))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

fn corrupt(campaign_id: &str, node: &str, reason: impl ToString) -> StorageError {
    StorageError::Corrupt {
        campaign_id: campaign_id.to_string(),
        node: node.to_string(),
        reason: reason.to_string(),
    }
}

fn decimal_column(campaign_id: &str, column: &str, value: &str) -> StorageResult<Decimal> {
    Decimal::from_str(value)
        .map_err(|e| corrupt(campaign_id, "", format!("column {column}: {e}")))
}

#[async_trait]
impl MetricsStore for SqliteMetricsStore {
    async fn init(&self) -> Result<()> {
        // Node metrics are stored as JSON documents, one row per node
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS node_delivery_metrics (
                campaign_id TEXT NOT NULL,
                node TEXT NOT NULL,
                metrics TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (campaign_id, node)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        // Money is kept as TEXT to preserve decimal precision
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS campaign_budget_figures (
                campaign_id TEXT PRIMARY KEY,
                total_budget TEXT NOT NULL,
                remaining_budget TEXT NOT NULL,
                lifetime_media_budget_cap TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn load_node_metrics(
        &self,
        campaign_id: &str,
    ) -> StorageResult<HashMap<MeasureSet, NodeDeliveryMetrics>> {
        let rows = sqlx::query(
            r#"
            SELECT node, metrics
            FROM node_delivery_metrics
            WHERE campaign_id = ?
            "#,
        )
        .bind(campaign_id)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::Other(e.into()))?;

        let mut node_metrics = HashMap::with_capacity(rows.len());
        for row in rows {
            let node: String = row
                .try_get("node")
                .map_err(|e| StorageError::Other(e.into()))?;
            let metrics: String = row
                .try_get("metrics")
                .map_err(|e| StorageError::Other(e.into()))?;

            let key = MeasureSet::from_str(&node).map_err(|e| corrupt(campaign_id, &node, e))?;
            let value: NodeDeliveryMetrics =
                serde_json::from_str(&metrics).map_err(|e| corrupt(campaign_id, &node, e))?;
            node_metrics.insert(key, value);
        }

        debug!(
            "Loaded metrics for {} nodes of campaign {}",
            node_metrics.len(),
            campaign_id
        );

        Ok(node_metrics)
    }

    async fn save_node_metrics(
        &self,
        campaign_id: &str,
        node_metrics: &HashMap<MeasureSet, NodeDeliveryMetrics>,
        figures: &BudgetFigures,
    ) -> StorageResult<()> {
        let updated_at = figures.updated_at.timestamp();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Other(e.into()))?;

        for (node, metrics) in node_metrics {
            let json = serde_json::to_string(metrics)
                .map_err(|e| StorageError::Other(e.into()))?;

            sqlx::query(
                r#"
                INSERT INTO node_delivery_metrics (campaign_id, node, metrics, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(campaign_id, node) DO UPDATE SET
                    metrics = excluded.metrics,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(campaign_id)
            .bind(node.to_string())
            .bind(json)
            .bind(updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Other(e.into()))?;
        }

        sqlx::query(
            r#"
            INSERT INTO campaign_budget_figures
                (campaign_id, total_budget, remaining_budget, lifetime_media_budget_cap, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(campaign_id) DO UPDATE SET
                total_budget = excluded.total_budget,
                remaining_budget = excluded.remaining_budget,
                lifetime_media_budget_cap = excluded.lifetime_media_budget_cap,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(campaign_id)
        .bind(figures.total_budget.to_string())
        .bind(figures.remaining_budget.to_string())
        .bind(figures.lifetime_media_budget_cap.to_string())
        .bind(updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Other(e.into()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Other(e.into()))?;

        Ok(())
    }

    async fn get_budget_figures(&self, campaign_id: &str) -> StorageResult<Option<BudgetFigures>> {
        let row = sqlx::query(
            r#"
            SELECT total_budget, remaining_budget, lifetime_media_budget_cap, updated_at
            FROM campaign_budget_figures
            WHERE campaign_id = ?
            "#,
        )
        .bind(campaign_id)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::Other(e.into()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let text = |column: &str| -> StorageResult<String> {
            row.try_get::<String, _>(column)
                .map_err(|e| StorageError::Other(e.into()))
        };
        let updated_at: i64 = row
            .try_get("updated_at")
            .map_err(|e| StorageError::Other(e.into()))?;

        Ok(Some(BudgetFigures {
            total_budget: decimal_column(campaign_id, "total_budget", &text("total_budget")?)?,
            remaining_budget: decimal_column(
                campaign_id,
                "remaining_budget",
                &text("remaining_budget")?,
            )?,
            lifetime_media_budget_cap: decimal_column(
                campaign_id,
                "lifetime_media_budget_cap",
                &text("lifetime_media_budget_cap")?,
            )?,
            updated_at: DateTime::<Utc>::from_timestamp(updated_at, 0)
                .ok_or_else(|| corrupt(campaign_id, "", "updated_at out of range"))?,
        }))
    }

    async fn list_campaigns(&self) -> Result<Vec<String>> {
        let campaigns = sqlx::query_scalar::<_, String>(
            r#"
            SELECT campaign_id
            FROM campaign_budget_figures
            ORDER BY campaign_id
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(campaigns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_corrupt_rows_are_reported() {
        let store = SqliteMetricsStore::new("sqlite::memory:", 1).await.unwrap();
        store.init().await.unwrap();

        sqlx::query(
            "INSERT INTO node_delivery_metrics (campaign_id, node, metrics, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind("campaign-1")
        .bind("1:2")
        .bind("{\"total_impressions\": \"many\"}")
        .bind(0i64)
        .execute(store.pool.as_ref())
        .await
        .unwrap();

        match store.load_node_metrics("campaign-1").await {
            Err(StorageError::Corrupt { node, .. }) => assert_eq!(node, "1:2"),
            other => panic!("expected corrupt metrics, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unparseable_node_key_is_corrupt() {
        let store = SqliteMetricsStore::new("sqlite::memory:", 1).await.unwrap();
        store.init().await.unwrap();

        sqlx::query(
            "INSERT INTO node_delivery_metrics (campaign_id, node, metrics, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind("campaign-1")
        .bind("one:two")
        .bind("{}")
        .bind(0i64)
        .execute(store.pool.as_ref())
        .await
        .unwrap();

        assert!(matches!(
            store.load_node_metrics("campaign-1").await,
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_metrics_from_older_rows_take_defaults() {
        let store = SqliteMetricsStore::new("sqlite::memory:", 1).await.unwrap();
        store.init().await.unwrap();

        sqlx::query(
            "INSERT INTO node_delivery_metrics (campaign_id, node, metrics, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind("campaign-1")
        .bind("4")
        .bind("{\"total_eligible_hours\": 12}")
        .bind(0i64)
        .execute(store.pool.as_ref())
        .await
        .unwrap();

        let loaded = store.load_node_metrics("campaign-1").await.unwrap();
        let metrics = &loaded[&MeasureSet::new([4])];
        assert_eq!(metrics.total_eligible_hours, 12);
        assert_eq!(metrics.sample_window, crate::metrics::DEFAULT_SAMPLE_WINDOW);
        assert!(metrics.last_processed_eligibility_hour.is_none());
    }
}
