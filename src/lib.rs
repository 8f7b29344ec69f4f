//! # dualstore
//!
//! A storage abstraction that lets one codebase run unchanged against two
//! very different backends: a document store (MongoDB) and a relational
//! store (PostgreSQL, one JSONB payload column per collection table).
//! Repositories program against the neutral [`Database`] / [`Collection`] /
//! [`Transaction`] / [`Cursor`] traits and a MongoDB-style filter and update
//! vocabulary; the backend is selected once at startup from
//! [`DatabaseConfig`] and never leaks into call sites.
//!
//! ## Architecture
//!
//! - [`store`] — the backend-neutral contract and result types
//! - [`ops`] — the operator vocabulary and fail-fast validation
//! - [`id`] — identifiers across both native formats ([`DocumentId`])
//! - [`mongo`] — the document adapter (driver translation)
//! - [`postgres`] — the relational adapter (SQL translation, JSONB payloads,
//!   trigger-maintained versioning, heuristic index introspection)
//! - [`error`] — the shared error taxonomy ([`StoreError`])
//!
//! Both adapters converge on the same observable behavior: system fields
//! (`_id`, `_created_at`, `_updated_at`, `_version`, actor fields) are
//! stamped by the layer, `_version` starts at 1 and increments by exactly
//! one per successful update, and errors map onto one taxonomy.
//!
//! ## Example
//!
//! ```no_run
//! use dualstore::{connect, BackendKind, DatabaseConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> dualstore::Result<()> {
//!     let config = DatabaseConfig {
//!         backend: BackendKind::Postgres,
//!         uri: "postgres://localhost/app".to_string(),
//!         ..DatabaseConfig::default()
//!     };
//!     let db = connect(&config).await?;
//!
//!     let products = db.collection("products")?;
//!     let payload = json!({ "name": "widget", "price": 9.99 });
//!     let id = products.insert_one(payload.as_object().unwrap().clone()).await?;
//!
//!     let found = products
//!         .find_one(json!({ "_id": id.to_string() }).as_object().unwrap())
//!         .await?;
//!     assert_eq!(found["_version"], json!(1));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod mongo;
pub mod ops;
pub mod postgres;
pub mod store;

pub use config::{BackendKind, DatabaseConfig};
pub use error::{Result, StoreError};
pub use id::DocumentId;
pub use store::{
    document_id, Collection, Cursor, Database, DeleteResult, Document, FindOptions, Index, Order,
    Transaction, TxFn, UpdateResult,
};

use std::sync::Arc;

/// Connect to the backend named by the configuration.
///
/// This is the single selection point: everything downstream holds the
/// returned `Arc<dyn Database>` and never learns which backend is behind it.
///
/// # Errors
///
/// Returns [`StoreError::NotConnected`] when the backend is unreachable and
/// [`StoreError::Internal`] for malformed connection URIs.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn Database>> {
    tracing::info!(backend = %config.backend, database = %config.database, "connecting");
    match config.backend {
        BackendKind::Mongo => Ok(Arc::new(mongo::MongoDatabase::connect(config).await?)),
        BackendKind::Postgres => Ok(Arc::new(postgres::PgDatabase::connect(config).await?)),
    }
}
