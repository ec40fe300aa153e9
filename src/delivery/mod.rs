//! Delivery report parsing and canonicalization
//!
//! Raw CSV reports from each ad network are parsed into
//! [`RawDeliveryRecord`](crate::models::RawDeliveryRecord)s and merged into a
//! per-network [`CanonicalDeliveryData`] set.

pub mod canonical;
pub mod network_a;
pub mod network_b;
pub mod parser;

pub use canonical::{CanonicalDeliveryData, DeliveryKey};
pub use network_a::NetworkAParser;
pub use network_b::NetworkBParser;
pub use parser::{strip_node_suffix, ParseError, ParseResult, RawDeliveryDataParser, DELETION_MARKER};

use crate::models::DeliveryNetwork;

/// Parser for a network's report dialect
pub fn parser_for(network: DeliveryNetwork) -> Box<dyn RawDeliveryDataParser> {
    match network {
        DeliveryNetwork::NetworkA => Box::new(NetworkAParser::new()),
        DeliveryNetwork::NetworkB => Box::new(NetworkBParser::new()),
    }
}
