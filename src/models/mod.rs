pub mod allocation;
pub mod delivery;
pub mod measure_set;

pub use allocation::{BudgetAllocation, HistoryElement, PerNodeBudgetAllocationResult};
pub use delivery::{DeliveryNetwork, RawDeliveryRecord};
pub use measure_set::{MeasureSet, MeasureSetParseError};
