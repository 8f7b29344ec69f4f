//! Backend-Neutral Storage Contract
//!
//! The `Database` / `Collection` / `Transaction` / `Cursor` traits every
//! repository programs against. All filters and updates are neutral JSON
//! maps using the [`crate::ops`] vocabulary; all results are neutral types.
//! The two implementing adapters live in [`crate::mongo`] and
//! [`crate::postgres`] and are selected once at startup.
//!
//! # Thread Safety
//!
//! `Database` and `Collection` implementations are `Send + Sync` and shared
//! behind one `Arc<dyn Database>` handle. A `Transaction` is single-owner:
//! its operations take `&mut self`, so concurrent use of one transaction
//! handle is impossible by construction.
//!
//! # Examples
//!
//! ```no_run
//! use dualstore::{connect, DatabaseConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> dualstore::Result<()> {
//!     let db = connect(&DatabaseConfig::default()).await?;
//!     let products = db.collection("products")?;
//!
//!     let doc = json!({ "name": "widget", "price": 9.99 });
//!     let id = products.insert_one(doc.as_object().unwrap().clone()).await?;
//!     assert!(!id.is_zero());
//!     Ok(())
//! }
//! ```

use crate::config::BackendKind;
use crate::error::Result;
use crate::id::DocumentId;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::time::Duration;

/// A schema-flexible document: field name to JSON value.
///
/// System fields (`_id`, `_version`, timestamps, actor fields) appear in
/// documents returned by the layer but are managed exclusively by it.
pub type Document = serde_json::Map<String, Value>;

/// Sort / index key direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

impl Order {
    /// Conventional numeric form: 1 ascending, -1 descending.
    pub fn as_i32(self) -> i32 {
        match self {
            Order::Ascending => 1,
            Order::Descending => -1,
        }
    }

    /// Parse the conventional numeric form; non-negative means ascending.
    pub fn from_i32(value: i32) -> Self {
        if value < 0 {
            Order::Descending
        } else {
            Order::Ascending
        }
    }
}

/// Options for [`Collection::find`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Ordered sort keys; empty means backend-native order
    pub sort: Vec<(String, Order)>,
    /// Maximum number of documents to return
    pub limit: Option<i64>,
    /// Number of matching documents to skip
    pub skip: Option<u64>,
}

/// Backend-neutral index descriptor
///
/// Creation is precise on both backends. Listing is precise on the document
/// backend but heuristic on the relational one, where descriptors are
/// reverse-engineered from textual index definitions; an unparseable
/// definition degrades to empty `keys` rather than hiding the listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Index {
    /// Index name, unique within its collection
    pub name: String,
    /// Ordered field-to-direction pairs
    pub keys: Vec<(String, Order)>,
    /// Whether the index enforces uniqueness
    pub unique: bool,
    /// Whether documents missing the field are skipped
    pub sparse: bool,
    /// Document expiry horizon; unsupported on the relational backend
    pub ttl: Option<Duration>,
}

impl Index {
    /// Single ascending key with a name, the common case.
    pub fn on_field(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: vec![(field.into(), Order::Ascending)],
            unique: false,
            sparse: false,
            ttl: None,
        }
    }

    /// Mark the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Result of an update operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_count: u64,
    pub upserted_id: DocumentId,
}

/// Result of a delete operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// Streaming query results
///
/// Both consumption modes are supported by both adapters: pull one document
/// at a time with [`Cursor::next`], or materialize everything remaining with
/// [`Cursor::all`]. The relational adapter synthesizes pull mode by
/// buffering, since its driver fetches result sets whole.
#[async_trait]
pub trait Cursor: Send {
    /// Pull the next document, or `None` when exhausted.
    async fn next(&mut self) -> Result<Option<Document>>;

    /// Materialize all remaining documents.
    async fn all(&mut self) -> Result<Vec<Document>>;
}

/// One logical collection of documents
///
/// Owns nothing beyond its name and a reference to the active connection.
#[async_trait]
pub trait Collection: Send + Sync {
    /// Logical collection name.
    fn name(&self) -> &str;

    /// Insert a document; returns its identifier (caller-supplied `_id` or
    /// generated by the layer before insertion).
    async fn insert_one(&self, document: Document) -> Result<DocumentId>;

    /// Insert several documents all-or-nothing.
    async fn insert_many(&self, documents: Vec<Document>) -> Result<Vec<DocumentId>>;

    /// Return the first document matching the filter, or
    /// [`crate::StoreError::NotFound`].
    async fn find_one(&self, filter: &Document) -> Result<Document>;

    /// Query documents with sort, limit, and skip options.
    async fn find(&self, filter: &Document, options: FindOptions) -> Result<Box<dyn Cursor>>;

    /// Apply an update to the first matching document.
    async fn update_one(&self, filter: &Document, update: &Document) -> Result<UpdateResult>;

    /// Apply an update to every matching document.
    async fn update_many(&self, filter: &Document, update: &Document) -> Result<UpdateResult>;

    /// Delete the first matching document.
    async fn delete_one(&self, filter: &Document) -> Result<DeleteResult>;

    /// Delete every matching document.
    async fn delete_many(&self, filter: &Document) -> Result<DeleteResult>;

    /// Count documents matching the filter.
    async fn count_documents(&self, filter: &Document) -> Result<u64>;

    /// Create an index; returns the index name.
    async fn create_index(&self, index: Index) -> Result<String>;

    /// Drop an index by name.
    async fn drop_index(&self, name: &str) -> Result<()>;

    /// List index descriptors for this collection.
    async fn list_indexes(&self) -> Result<Vec<Index>>;

    /// Minimal aggregation entry point. The document backend passes the
    /// pipeline through; the relational backend supports `$match`, `$sort`,
    /// `$skip`, `$limit`, and `$count` and rejects other stages.
    async fn aggregate(&self, pipeline: &[Document]) -> Result<Box<dyn Cursor>>;
}

/// An all-or-nothing scope over collection operations
///
/// Owned by one caller for its duration. Dropping an unresolved transaction
/// rolls it back, so a panic between `begin` and `commit` cannot leak the
/// underlying connection.
#[async_trait]
pub trait Transaction: Send {
    /// Insert a document into the named collection inside this transaction.
    async fn insert_one(&mut self, collection: &str, document: Document) -> Result<DocumentId>;

    /// Find the first matching document inside this transaction.
    async fn find_one(&mut self, collection: &str, filter: &Document) -> Result<Document>;

    /// Update every matching document inside this transaction.
    async fn update_many(
        &mut self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult>;

    /// Delete every matching document inside this transaction.
    async fn delete_many(&mut self, collection: &str, filter: &Document) -> Result<DeleteResult>;

    /// Commit all operations issued through this handle.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard all operations issued through this handle.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Callback type for [`Database::run_in_transaction`].
pub type TxFn =
    Box<dyn for<'t> FnOnce(&'t mut dyn Transaction) -> BoxFuture<'t, Result<()>> + Send>;

/// The process-wide database handle
///
/// One implementation per backend, selected once at startup from
/// [`crate::DatabaseConfig`] and shared as `Arc<dyn Database>`.
#[async_trait]
pub trait Database: Send + Sync {
    /// Which backend this handle runs against.
    fn kind(&self) -> BackendKind;

    /// Verify the connection is alive.
    async fn ping(&self) -> Result<()>;

    /// Release the connection pool. Closing an already-closed handle is a
    /// no-op; any later operation fails with `NotConnected`.
    async fn close(&self) -> Result<()>;

    /// Obtain a handle to a logical collection.
    fn collection(&self, name: &str) -> Result<Box<dyn Collection>>;

    /// Create a collection eagerly (collections are otherwise provisioned
    /// lazily on first touch). Idempotent.
    async fn create_collection(&self, name: &str) -> Result<()>;

    /// Drop a collection and its documents.
    async fn drop_collection(&self, name: &str) -> Result<()>;

    /// List logical collection names.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Start an explicit transaction; the caller must commit or roll back.
    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>>;

    /// Run `func` inside a transaction: commit on `Ok`, roll back on `Err`.
    /// A panic inside `func` drops the transaction, which also rolls back.
    async fn run_in_transaction(&self, func: TxFn) -> Result<()> {
        let mut tx = self.begin_transaction().await?;
        match func(tx.as_mut()).await {
            Ok(()) => tx.commit().await,
            Err(err) => {
                // Preserve the callback error even if rollback itself fails.
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }
}

/// Extract a document's `_id` as a [`DocumentId`], if present and valid.
pub fn document_id(document: &Document) -> Option<DocumentId> {
    match document.get("_id") {
        Some(Value::String(s)) => DocumentId::parse(s, None).ok(),
        _ => None,
    }
}
