//! Storage Layer - SQLite-backed adapter
//!
//! Tables are derived from the model catalog:
//! - one table per model, scalar fields plus `<relation>_id` columns
//! - one `(source_id, target_id)` link table per many-to-many pair

pub mod schema;
pub mod sqlite;

pub use sqlite::{SqliteAdapter, TableStats};
