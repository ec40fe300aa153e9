use chrono::{TimeZone, Utc};
use pacing::metrics::{HourDelivery, NodeDeliveryMetrics};
use pacing::models::MeasureSet;
use pacing::storage::{BudgetFigures, MetricsStore, SqliteMetricsStore};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;

async fn create_test_store() -> SqliteMetricsStore {
    let store = SqliteMetricsStore::new("sqlite::memory:", 1).await.unwrap();
    store.init().await.unwrap();
    store
}

fn figures(remaining: &str) -> BudgetFigures {
    BudgetFigures {
        total_budget: Decimal::from(1000),
        remaining_budget: Decimal::from_str(remaining).unwrap(),
        lifetime_media_budget_cap: Decimal::from_str("987.654321").unwrap(),
        updated_at: Utc.with_ymd_and_hms(2012, 3, 17, 6, 0, 0).unwrap(),
    }
}

fn sample_metrics() -> HashMap<MeasureSet, NodeDeliveryMetrics> {
    let hour = Utc.with_ymd_and_hms(2012, 3, 16, 15, 0, 0).unwrap();
    let mut metrics = NodeDeliveryMetrics::with_sample_window(3);
    metrics.record_eligible_hour(
        hour,
        HourDelivery::new(1234, Decimal::from_str("2.468").unwrap(), Decimal::from(2)),
        Decimal::from_str("0.0001").unwrap(),
    );
    metrics.last_processed_eligibility_hour = Some(hour);
    metrics.last_processed_delivery_hour = Some(hour);

    HashMap::from([
        (MeasureSet::new([5, 1, 9]), metrics),
        (MeasureSet::new([2]), NodeDeliveryMetrics::default()),
    ])
}

#[tokio::test]
async fn test_node_metrics_round_trip() {
    let store = create_test_store().await;
    let metrics = sample_metrics();

    store
        .save_node_metrics("campaign-1", &metrics, &figures("12.345"))
        .await
        .unwrap();

    let loaded = store.load_node_metrics("campaign-1").await.unwrap();
    assert_eq!(loaded, metrics);

    let loaded_node = &loaded[&MeasureSet::new([1, 5, 9])];
    assert_eq!(loaded_node.sample_window, 3);
    assert_eq!(loaded_node.total_spend, Decimal::from_str("2.4681").unwrap());

    let stored = store.get_budget_figures("campaign-1").await.unwrap().unwrap();
    assert_eq!(stored, figures("12.345"));
}

#[tokio::test]
async fn test_save_overwrites_previous_pass() {
    let store = create_test_store().await;
    let mut metrics = sample_metrics();

    store
        .save_node_metrics("campaign-1", &metrics, &figures("500"))
        .await
        .unwrap();

    metrics.get_mut(&MeasureSet::new([2])).unwrap().total_eligible_hours = 7;
    store
        .save_node_metrics("campaign-1", &metrics, &figures("400"))
        .await
        .unwrap();

    let loaded = store.load_node_metrics("campaign-1").await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[&MeasureSet::new([2])].total_eligible_hours, 7);

    let stored = store.get_budget_figures("campaign-1").await.unwrap().unwrap();
    assert_eq!(stored.remaining_budget, Decimal::from(400));
}

#[tokio::test]
async fn test_campaigns_are_isolated() {
    let store = create_test_store().await;

    store
        .save_node_metrics("campaign-1", &sample_metrics(), &figures("1"))
        .await
        .unwrap();

    assert!(store.load_node_metrics("campaign-2").await.unwrap().is_empty());
    assert!(store.get_budget_figures("campaign-2").await.unwrap().is_none());

    store
        .save_node_metrics("campaign-2", &HashMap::new(), &figures("2"))
        .await
        .unwrap();
    assert_eq!(
        store.get_budget_figures("campaign-2").await.unwrap().unwrap().remaining_budget,
        Decimal::from(2)
    );
    assert_eq!(
        store.list_campaigns().await.unwrap(),
        vec!["campaign-1".to_string(), "campaign-2".to_string()]
    );
}
