pub mod history;
pub mod sqlite;
pub mod trait_def;

pub use history::{AllocationHistorySource, DirectoryHistorySource, HistoryError, HistoryResult};
pub use sqlite::SqliteMetricsStore;
pub use trait_def::{BudgetFigures, MetricsStore, StorageError, StorageResult};
