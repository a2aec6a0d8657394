pub mod database;
pub mod error;
pub mod histories;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use histories::{HistoryRepo, SessionSummary};
