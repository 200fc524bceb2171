//! SQLite snapshot store: batches plus per-batch process and container rows.

pub mod schema;
pub mod snapshot;
