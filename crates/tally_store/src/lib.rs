mod config;
mod sqlite;
mod trace;

pub use config::{DatabaseConfig, TallyConfig};
pub use sqlite::SqliteStore;
pub use tally_core::*;
