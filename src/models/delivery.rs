use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ad network a delivery report was pulled from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryNetwork {
    /// Combined `hour` timestamp, `campaign_code` node key
    NetworkA,
    /// Separate `dimension.date` / `dimension.hour`, line item external id node key
    NetworkB,
}

impl DeliveryNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryNetwork::NetworkA => "network-a",
            DeliveryNetwork::NetworkB => "network-b",
        }
    }

    /// Whether the campaign id column of this network carries our campaign id.
    /// Network B reports its own line item id there.
    pub fn reports_campaign_id(&self) -> bool {
        match self {
            DeliveryNetwork::NetworkA => true,
            DeliveryNetwork::NetworkB => false,
        }
    }
}

impl fmt::Display for DeliveryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryNetwork {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "network-a" | "a" => Ok(DeliveryNetwork::NetworkA),
            "network-b" | "b" => Ok(DeliveryNetwork::NetworkB),
            other => anyhow::bail!(
                "unknown delivery network '{other}'. Supported values: network-a, network-b"
            ),
        }
    }
}

/// One hour of delivery for one node, from one report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDeliveryRecord {
    pub campaign_id: String,

    /// Top of the UTC hour the delivery belongs to
    pub hour: DateTime<Utc>,

    /// Node allocation key, with any deletion suffix removed
    pub allocation_id: String,

    pub impressions: u64,

    pub ecpm: Decimal,

    pub spend: Decimal,

    pub clicks: Decimal,
}
