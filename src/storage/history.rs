//! Allocation-history source: the snapshot index of a campaign and the
//! snapshots it references
//!
//! The directory implementation lays out one campaign per directory:
//!
//! ```text
//! <root>/<campaign_id>/index.json
//! <root>/<campaign_id>/allocations/<allocation_outputs_id>.json
//! ```

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::models::{BudgetAllocation, HistoryElement};

/// Missing or unreadable upstream state; each cause is a separate variant so
/// callers can alert on them differently
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("campaign {campaign_id} has no allocation history")]
    NoHistoryAssociation { campaign_id: String },

    #[error("allocation history index for campaign {campaign_id} not found")]
    IndexNotFound { campaign_id: String },

    #[error("allocation history index for campaign {campaign_id} is not deserializable")]
    IndexNotDeserializable {
        campaign_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("allocation snapshot {outputs_id} not found")]
    SnapshotNotFound { outputs_id: String },

    #[error("allocation snapshot {outputs_id} is not deserializable")]
    SnapshotNotDeserializable {
        outputs_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type HistoryResult<T> = Result<T, HistoryError>;

#[async_trait]
pub trait AllocationHistorySource: Send + Sync {
    /// Snapshot index of a campaign, newest first
    async fn get_index(&self, campaign_id: &str) -> HistoryResult<Vec<HistoryElement>>;

    async fn get_snapshot(
        &self,
        campaign_id: &str,
        element: &HistoryElement,
    ) -> HistoryResult<BudgetAllocation>;
}

pub struct DirectoryHistorySource {
    root: PathBuf,
}

impl DirectoryHistorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn campaign_dir(&self, campaign_id: &str) -> Option<PathBuf> {
        is_plain_component(campaign_id).then(|| self.root.join(campaign_id))
    }
}

/// Ids are used as path components and must not escape the root
fn is_plain_component(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && !id.contains("..")
        && !id.contains('/')
        && !id.contains('\\')
}

async fn read_optional(path: &Path) -> HistoryResult<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl AllocationHistorySource for DirectoryHistorySource {
    async fn get_index(&self, campaign_id: &str) -> HistoryResult<Vec<HistoryElement>> {
        let no_association = || HistoryError::NoHistoryAssociation {
            campaign_id: campaign_id.to_string(),
        };

        let dir = self.campaign_dir(campaign_id).ok_or_else(no_association)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Err(no_association());
        }

        let path = dir.join("index.json");
        let raw = read_optional(&path)
            .await?
            .ok_or_else(|| HistoryError::IndexNotFound {
                campaign_id: campaign_id.to_string(),
            })?;

        let index: Vec<HistoryElement> =
            serde_json::from_str(&raw).map_err(|source| HistoryError::IndexNotDeserializable {
                campaign_id: campaign_id.to_string(),
                source,
            })?;

        debug!(
            "Read allocation history index for campaign {} ({} entries)",
            campaign_id,
            index.len()
        );

        Ok(index)
    }

    async fn get_snapshot(
        &self,
        campaign_id: &str,
        element: &HistoryElement,
    ) -> HistoryResult<BudgetAllocation> {
        let outputs_id = element.allocation_outputs_id.as_str();
        let not_found = || HistoryError::SnapshotNotFound {
            outputs_id: outputs_id.to_string(),
        };

        if !is_plain_component(outputs_id) {
            return Err(not_found());
        }
        let dir = self
            .campaign_dir(campaign_id)
            .ok_or_else(|| HistoryError::NoHistoryAssociation {
                campaign_id: campaign_id.to_string(),
            })?;

        let path = dir.join("allocations").join(format!("{outputs_id}.json"));
        let raw = read_optional(&path).await?.ok_or_else(not_found)?;

        serde_json::from_str(&raw).map_err(|source| HistoryError::SnapshotNotDeserializable {
            outputs_id: outputs_id.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_must_be_plain_path_components() {
        assert!(is_plain_component("campaign-42"));
        assert!(is_plain_component("2012-03-16T00_00"));
        assert!(!is_plain_component(""));
        assert!(!is_plain_component(".."));
        assert!(!is_plain_component("../etc"));
        assert!(!is_plain_component("a/b"));
    }

    #[tokio::test]
    async fn test_traversal_ids_are_rejected() {
        let source = DirectoryHistorySource::new("/nonexistent");

        assert!(matches!(
            source.get_index("../secrets").await,
            Err(HistoryError::NoHistoryAssociation { .. })
        ));

        let element = HistoryElement::new("2012-03-16T00:00:00Z", "../../index");
        assert!(matches!(
            source.get_snapshot("campaign", &element).await,
            Err(HistoryError::SnapshotNotFound { .. })
        ));
    }
}
