//! # Rowgraph - Item-graph persistence engine
//!
//! Turns a tree of desired records ("items") into saved relational rows
//! ("models") through a pluggable storage adapter.
//!
//! Rowgraph provides:
//! - Declarative item classes with getters, creators and rewrite policies
//! - A fixed-point resolver that finds, creates, links and merges models
//! - An `Adapter` trait with in-memory and SQLite implementations
//! - Bulk deleters and x-to-many unrefs driven by persisted items

pub mod value;
pub mod relation;
pub mod item;
pub mod adapter;
pub mod storage;
pub mod persist;
pub mod config;

// Re-exports for convenient access
pub use value::Value;
pub use relation::RelationType;
pub use item::{DeleterConfig, Item, ItemClass, ItemGraph, ItemId, Registry, Relation, Rewrite};
pub use adapter::{Adapter, Capabilities, Model};
pub use adapter::memory::MemoryAdapter;
pub use adapter::record::Record;
pub use adapter::schema::{Catalog, ModelSchema, RelationSchema};
pub use storage::SqliteAdapter;
pub use persist::{DropReason, ItemHooks, MergePolicy, PersistEvent, Persisted, Persister};
pub use config::PersistConfig;

/// Result type alias for Rowgraph operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Rowgraph operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{count} models match item {item} of class {class}")]
    PersistMultipleItemsMatch { class: String, item: ItemId, count: usize },

    #[error("{count} models fed into x-to-one relation {fkey} of item {item} ({class})")]
    MultipleModelsMatch { class: String, item: ItemId, fkey: String, count: usize },

    #[error("Cannot merge models of {model_cls}: conflicting values in {field}")]
    CannotMergeModels { model_cls: String, field: String },

    #[error("Cannot merge models for item {item} of class {class}: {source}")]
    CannotMergeModelsForItem {
        class: String,
        item: ItemId,
        #[source]
        source: Box<Error>,
    },

    #[error("Merging models of {model_cls} is not allowed: unique conflict in {field}")]
    MergeModelsNotAllowed { model_cls: String, field: String },

    #[error("Cannot clear {class}.{fkey}: {other_class}.{other_field} is required")]
    CannotClearRequiredFieldInRelation {
        class: String,
        fkey: String,
        other_class: String,
        other_field: String,
    },

    #[error("Unknown item class: {0}")]
    UnknownItemClass(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Unknown field {field} on {class}")]
    UnknownField { class: String, field: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
