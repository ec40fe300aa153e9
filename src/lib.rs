pub mod config;
pub mod delivery;
pub mod eligibility;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod storage;
