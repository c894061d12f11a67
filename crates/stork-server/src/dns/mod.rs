//! DNS zone inventory.

mod manager;

pub use manager::{FetchProgress, FetchSummary, ZoneManager, ZoneManagerError};
