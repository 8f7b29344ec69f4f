//! PostgreSQL/JSONB Adapter
//!
//! Emulates schema-flexible document collections inside relational tables:
//! one table per collection with a single JSONB payload column beside the
//! layer-managed system columns. Tables are provisioned lazily on first
//! touch (and eagerly for the platform's system collections at connect
//! time), each carrying a row trigger that maintains `_updated_at` and
//! `_version` so version monotonicity never depends on call sites.
//!
//! Filter and update translation lives in [`sql`]; descriptor recovery from
//! `pg_indexes` definitions lives in [`introspect`].

mod introspect;
mod sql;

use crate::config::{BackendKind, DatabaseConfig};
use crate::error::{Result, StoreError};
use crate::id::DocumentId;
use crate::ops;
use crate::store::{
    Collection, Cursor, Database, DeleteResult, Document, FindOptions, Index, Transaction,
    UpdateResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use sql::SqlParam;

/// Collections provisioned eagerly at connect time; everything else is
/// created on first touch.
const SYSTEM_COLLECTIONS: &[&str] = &[
    "users",
    "access_keys",
    "roles",
    "collections",
    "embedding_jobs",
];

struct PgShared {
    pool: PgPool,
    /// Physical table name -> logical collection name. Two logical names
    /// sanitizing to one table is a configuration error, not a merge.
    registry: Mutex<HashMap<String, String>>,
    /// Tables whose DDL has already run in this process.
    provisioned: Mutex<HashSet<String>>,
}

impl PgShared {
    fn ensure_open(&self) -> Result<()> {
        if self.pool.is_closed() {
            Err(StoreError::NotConnected)
        } else {
            Ok(())
        }
    }

    /// Resolve the physical table for a logical collection, guarding
    /// against sanitization collisions.
    fn table_for(&self, logical: &str) -> Result<String> {
        if logical.is_empty() {
            return Err(StoreError::internal("empty collection name"));
        }
        let table = sql::sanitize_table_name(logical);
        let mut registry = self.registry.lock().expect("registry lock");
        match registry.get(&table) {
            Some(existing) if existing != logical => Err(StoreError::internal(format!(
                "collections {existing:?} and {logical:?} collide on table {table:?}"
            ))),
            _ => {
                registry.insert(table.clone(), logical.to_string());
                Ok(table)
            }
        }
    }

    fn is_provisioned(&self, table: &str) -> bool {
        self.provisioned.lock().expect("provision lock").contains(table)
    }

    /// Create the table and its touch trigger if this process has not done
    /// so yet. The DDL itself is idempotent, so a race between two callers
    /// is harmless.
    async fn provision(&self, table: &str) -> Result<()> {
        if self.is_provisioned(table) {
            return Ok(());
        }

        tracing::debug!(%table, "provisioning collection table");
        sqlx::query(&sql::create_table_sql(table))
            .execute(&self.pool)
            .await?;
        for statement in sql::attach_trigger_sql(table) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }

        self.provisioned
            .lock()
            .expect("provision lock")
            .insert(table.to_string());
        Ok(())
    }
}

/// Process-wide handle to a PostgreSQL database.
pub struct PgDatabase {
    shared: Arc<PgShared>,
}

impl PgDatabase {
    /// Connect with the pool bounds from `config`, install the shared touch
    /// trigger function, and eagerly provision the system collections.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_pool_size)
            .min_connections(config.min_pool_size)
            .idle_timeout(Some(config.max_idle_time))
            .acquire_timeout(config.connect_timeout)
            .connect(&config.uri)
            .await?;

        sqlx::query(sql::trigger_function_sql())
            .execute(&pool)
            .await?;

        let shared = Arc::new(PgShared {
            pool,
            registry: Mutex::new(HashMap::new()),
            provisioned: Mutex::new(HashSet::new()),
        });

        for name in SYSTEM_COLLECTIONS {
            let table = shared.table_for(name)?;
            shared.provision(&table).await?;
        }

        tracing::debug!(database = %config.database, "connected to postgres");
        Ok(Self { shared })
    }
}

#[async_trait]
impl Database for PgDatabase {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn ping(&self) -> Result<()> {
        self.shared.ensure_open()?;
        sqlx::query("SELECT 1").execute(&self.shared.pool).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Pool close is idempotent; later operations fail with NotConnected.
        self.shared.pool.close().await;
        Ok(())
    }

    fn collection(&self, name: &str) -> Result<Box<dyn Collection>> {
        self.shared.ensure_open()?;
        let table = self.shared.table_for(name)?;
        Ok(Box::new(PgCollection {
            logical: name.to_string(),
            table,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn create_collection(&self, name: &str) -> Result<()> {
        self.shared.ensure_open()?;
        let table = self.shared.table_for(name)?;
        self.shared.provision(&table).await
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        self.shared.ensure_open()?;
        let table = self.shared.table_for(name)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&self.shared.pool)
            .await?;
        self.shared
            .provisioned
            .lock()
            .expect("provision lock")
            .remove(&table);
        self.shared
            .registry
            .lock()
            .expect("registry lock")
            .remove(&table);
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.shared.ensure_open()?;
        let rows = sqlx::query(
            "SELECT tablename FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename",
        )
        .fetch_all(&self.shared.pool)
        .await?;

        let registry = self.shared.registry.lock().expect("registry lock");
        Ok(rows
            .iter()
            .map(|row| {
                let table: String = row.get(0);
                // Known tables surface under their logical names.
                registry.get(&table).cloned().unwrap_or(table)
            })
            .collect())
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        self.shared.ensure_open()?;
        let tx = self
            .shared
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;
        Ok(Box::new(PgTransaction {
            tx,
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// One logical collection backed by a relational table.
pub struct PgCollection {
    logical: String,
    table: String,
    shared: Arc<PgShared>,
}

impl PgCollection {
    async fn ensure(&self) -> Result<()> {
        self.shared.ensure_open()?;
        self.shared.provision(&self.table).await
    }
}

#[async_trait]
impl Collection for PgCollection {
    fn name(&self) -> &str {
        &self.logical
    }

    async fn insert_one(&self, document: Document) -> Result<DocumentId> {
        self.ensure().await?;
        let insert = InsertRow::from_payload(&document)?;
        let sql = insert_sql(&self.table);
        bind_insert(&sql, &insert).execute(&self.shared.pool).await?;
        Ok(DocumentId::from(insert.id))
    }

    async fn insert_many(&self, documents: Vec<Document>) -> Result<Vec<DocumentId>> {
        self.ensure().await?;
        let mut inserts = Vec::with_capacity(documents.len());
        for document in &documents {
            inserts.push(InsertRow::from_payload(document)?);
        }

        // All-or-nothing across the batch.
        let mut tx = self
            .shared
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;
        let sql = insert_sql(&self.table);
        for insert in &inserts {
            if let Err(err) = bind_insert(&sql, insert).execute(&mut *tx).await {
                let _ = tx.rollback().await;
                return Err(err.into());
            }
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;

        Ok(inserts
            .into_iter()
            .map(|insert| DocumentId::from(insert.id))
            .collect())
    }

    async fn find_one(&self, filter: &Document) -> Result<Document> {
        self.ensure().await?;
        ops::validate_filter(filter)?;
        let mut params = Vec::new();
        let predicate = sql::filter_to_where(filter, &mut params)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {} LIMIT 1",
            sql::DOCUMENT_COLUMNS,
            self.table,
            predicate
        );
        let row = bind_all(&sql, params)
            .fetch_optional(&self.shared.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        row_to_document(&row)
    }

    async fn find(&self, filter: &Document, options: FindOptions) -> Result<Box<dyn Cursor>> {
        self.ensure().await?;
        ops::validate_filter(filter)?;
        let mut params = Vec::new();
        let predicate = sql::filter_to_where(filter, &mut params)?;

        let mut query = format!(
            "SELECT {} FROM {} WHERE {}",
            sql::DOCUMENT_COLUMNS,
            self.table,
            predicate
        );
        if !options.sort.is_empty() {
            query.push_str(&format!(" ORDER BY {}", sql::sort_clause(&options.sort)?));
        }
        if let Some(limit) = options.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(skip) = options.skip {
            query.push_str(&format!(" OFFSET {skip}"));
        }

        let rows = bind_all(&query, params)
            .fetch_all(&self.shared.pool)
            .await?;
        PgCursor::from_rows(&rows)
    }

    async fn update_one(&self, filter: &Document, update: &Document) -> Result<UpdateResult> {
        self.ensure().await?;
        let (sql, params) = update_sql(&self.table, filter, update, true)?;
        let result = bind_all(&sql, params).execute(&self.shared.pool).await?;
        Ok(affected_to_update_result(result.rows_affected()))
    }

    async fn update_many(&self, filter: &Document, update: &Document) -> Result<UpdateResult> {
        self.ensure().await?;
        let (sql, params) = update_sql(&self.table, filter, update, false)?;
        let result = bind_all(&sql, params).execute(&self.shared.pool).await?;
        Ok(affected_to_update_result(result.rows_affected()))
    }

    async fn delete_one(&self, filter: &Document) -> Result<DeleteResult> {
        self.ensure().await?;
        let (sql, params) = delete_sql(&self.table, filter, true)?;
        let result = bind_all(&sql, params).execute(&self.shared.pool).await?;
        Ok(DeleteResult {
            deleted_count: result.rows_affected(),
        })
    }

    async fn delete_many(&self, filter: &Document) -> Result<DeleteResult> {
        self.ensure().await?;
        let (sql, params) = delete_sql(&self.table, filter, false)?;
        let result = bind_all(&sql, params).execute(&self.shared.pool).await?;
        Ok(DeleteResult {
            deleted_count: result.rows_affected(),
        })
    }

    async fn count_documents(&self, filter: &Document) -> Result<u64> {
        self.ensure().await?;
        ops::validate_filter(filter)?;
        let mut params = Vec::new();
        let predicate = sql::filter_to_where(filter, &mut params)?;
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", self.table, predicate);
        let row = bind_all(&sql, params).fetch_one(&self.shared.pool).await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn create_index(&self, index: Index) -> Result<String> {
        self.ensure().await?;
        if index.ttl.is_some() {
            // No native TTL expiry on this backend; the descriptor is
            // honored without it. See DESIGN.md for the decision record.
            tracing::warn!(
                index = %index.name,
                collection = %self.logical,
                "TTL expiry is not supported on the relational backend; ignoring"
            );
        }
        let statement = sql::create_index_sql(&self.table, &index)?;
        sqlx::query(&statement).execute(&self.shared.pool).await?;
        Ok(index.name)
    }

    async fn drop_index(&self, name: &str) -> Result<()> {
        self.ensure().await?;
        sql::validate_field_name(name)?;
        sqlx::query(&format!("DROP INDEX IF EXISTS {name}"))
            .execute(&self.shared.pool)
            .await?;
        Ok(())
    }

    async fn list_indexes(&self) -> Result<Vec<Index>> {
        self.ensure().await?;
        let rows =
            sqlx::query("SELECT indexdef FROM pg_indexes WHERE tablename = $1 ORDER BY indexname")
                .bind(&self.table)
                .fetch_all(&self.shared.pool)
                .await?;
        Ok(rows
            .iter()
            .map(|row| introspect::parse_index_def(row.get(0)))
            .collect())
    }

    async fn aggregate(&self, pipeline: &[Document]) -> Result<Box<dyn Cursor>> {
        self.ensure().await?;
        let mut params = Vec::new();
        let (statement, count_field) = sql::pipeline_to_select(&self.table, pipeline, &mut params)?;

        if let Some(field) = count_field {
            let row = bind_all(&statement, params)
                .fetch_one(&self.shared.pool)
                .await?;
            let count: i64 = row.get(0);
            let mut doc = Document::new();
            doc.insert(field, Value::from(count));
            return Ok(Box::new(PgCursor {
                documents: vec![doc].into_iter(),
            }));
        }

        let rows = bind_all(&statement, params)
            .fetch_all(&self.shared.pool)
            .await?;
        PgCursor::from_rows(&rows)
    }
}

/// Pool-transaction-backed scope. sqlx rolls the transaction back when the
/// handle drops unresolved, so panics cannot leak the connection.
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    shared: Arc<PgShared>,
}

impl PgTransaction {
    async fn table_for(&mut self, collection: &str) -> Result<String> {
        let table = self.shared.table_for(collection)?;
        // DDL runs on this transaction's own connection so a fully bounded
        // pool cannot deadlock on first touch. The statements are
        // idempotent and roll back with the transaction, so the
        // provisioned set is left for the pool path to update.
        if !self.shared.is_provisioned(&table) {
            sqlx::query(&sql::create_table_sql(&table))
                .execute(&mut *self.tx)
                .await?;
            for statement in sql::attach_trigger_sql(&table) {
                sqlx::query(&statement).execute(&mut *self.tx).await?;
            }
        }
        Ok(table)
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn insert_one(&mut self, collection: &str, document: Document) -> Result<DocumentId> {
        let table = self.table_for(collection).await?;
        let insert = InsertRow::from_payload(&document)?;
        let sql = insert_sql(&table);
        bind_insert(&sql, &insert).execute(&mut *self.tx).await?;
        Ok(DocumentId::from(insert.id))
    }

    async fn find_one(&mut self, collection: &str, filter: &Document) -> Result<Document> {
        let table = self.table_for(collection).await?;
        ops::validate_filter(filter)?;
        let mut params = Vec::new();
        let predicate = sql::filter_to_where(filter, &mut params)?;
        let statement = format!(
            "SELECT {} FROM {} WHERE {} LIMIT 1",
            sql::DOCUMENT_COLUMNS,
            table,
            predicate
        );
        let row = bind_all(&statement, params)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or(StoreError::NotFound)?;
        row_to_document(&row)
    }

    async fn update_many(
        &mut self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult> {
        let table = self.table_for(collection).await?;
        let (statement, params) = update_sql(&table, filter, update, false)?;
        let result = bind_all(&statement, params).execute(&mut *self.tx).await?;
        Ok(affected_to_update_result(result.rows_affected()))
    }

    async fn delete_many(&mut self, collection: &str, filter: &Document) -> Result<DeleteResult> {
        let table = self.table_for(collection).await?;
        let (statement, params) = delete_sql(&table, filter, false)?;
        let result = bind_all(&statement, params).execute(&mut *self.tx).await?;
        Ok(DeleteResult {
            deleted_count: result.rows_affected(),
        })
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))
    }
}

/// Buffered cursor: the driver fetches result sets whole, so pull mode is
/// synthesized over the buffer.
pub struct PgCursor {
    documents: std::vec::IntoIter<Document>,
}

impl PgCursor {
    fn from_rows(rows: &[PgRow]) -> Result<Box<dyn Cursor>> {
        let documents = rows
            .iter()
            .map(row_to_document)
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(Self {
            documents: documents.into_iter(),
        }))
    }
}

#[async_trait]
impl Cursor for PgCursor {
    async fn next(&mut self) -> Result<Option<Document>> {
        Ok(self.documents.next())
    }

    async fn all(&mut self) -> Result<Vec<Document>> {
        Ok(self.documents.by_ref().collect())
    }
}

/// Prepared insert values for one document.
struct InsertRow {
    id: Uuid,
    data: Value,
    created_by: Option<String>,
    updated_by: Option<String>,
}

impl InsertRow {
    /// Split the caller payload into the id, the JSONB payload, and the
    /// caller-suppliable actor fields; reject other system fields.
    fn from_payload(payload: &Document) -> Result<Self> {
        for field in payload.keys() {
            if ops::is_system_field(field)
                && !matches!(field.as_str(), "_id" | "_created_by" | "_updated_by")
            {
                return Err(StoreError::unsupported(format!(
                    "system field {field} is managed by the storage layer"
                )));
            }
        }

        // Assign the id before insertion so both backends share the same
        // lifecycle, rather than relying on the column default.
        let id = match payload.get("_id") {
            Some(Value::String(s)) => {
                Uuid::parse_str(s).map_err(|_| StoreError::InvalidId(s.clone()))?
            }
            Some(other) => return Err(StoreError::InvalidId(other.to_string())),
            None => Uuid::new_v4(),
        };

        let mut data = Document::new();
        for (key, value) in payload {
            if !ops::is_system_field(key) {
                data.insert(key.clone(), value.clone());
            }
        }

        Ok(Self {
            id,
            data: Value::Object(data.into_iter().collect()),
            created_by: payload.get("_created_by").and_then(Value::as_str).map(String::from),
            updated_by: payload.get("_updated_by").and_then(Value::as_str).map(String::from),
        })
    }

}

fn insert_sql(table: &str) -> String {
    format!("INSERT INTO {table} (id, data, _created_by, _updated_by) VALUES ($1, $2, $3, $4)")
}

/// Bind one prepared row to the insert statement. The actor columns are
/// nullable, so they bind as options rather than through [`SqlParam`].
fn bind_insert<'q>(
    statement: &'q str,
    insert: &InsertRow,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    sqlx::query(statement)
        .bind(insert.id)
        .bind(sqlx::types::Json(insert.data.clone()))
        .bind(insert.created_by.clone())
        .bind(insert.updated_by.clone())
}

fn update_sql(
    table: &str,
    filter: &Document,
    update: &Document,
    only_first: bool,
) -> Result<(String, Vec<SqlParam>)> {
    ops::validate_filter(filter)?;
    ops::validate_update(update)?;
    let mut params = Vec::new();
    let assignments = sql::update_assignments(update, &mut params)?;
    let predicate = sql::filter_to_where(filter, &mut params)?;
    let statement = if only_first {
        format!(
            "UPDATE {table} SET {assignments} \
             WHERE id = (SELECT id FROM {table} WHERE {predicate} LIMIT 1)"
        )
    } else {
        format!("UPDATE {table} SET {assignments} WHERE {predicate}")
    };
    Ok((statement, params))
}

fn delete_sql(
    table: &str,
    filter: &Document,
    only_first: bool,
) -> Result<(String, Vec<SqlParam>)> {
    ops::validate_filter(filter)?;
    let mut params = Vec::new();
    let predicate = sql::filter_to_where(filter, &mut params)?;
    let statement = if only_first {
        format!(
            "DELETE FROM {table} \
             WHERE id = (SELECT id FROM {table} WHERE {predicate} LIMIT 1)"
        )
    } else {
        format!("DELETE FROM {table} WHERE {predicate}")
    };
    Ok((statement, params))
}

/// The trigger fires for every matched row, so matched and modified agree.
fn affected_to_update_result(rows_affected: u64) -> UpdateResult {
    UpdateResult {
        matched_count: rows_affected,
        modified_count: rows_affected,
        upserted_count: 0,
        upserted_id: DocumentId::Zero,
    }
}

/// Merge a row's payload column and system columns into a neutral document,
/// matching the shapes the document adapter produces.
fn row_to_document(row: &PgRow) -> Result<Document> {
    let id: Uuid = row.try_get("id").map_err(StoreError::from)?;
    let data: Value = row.try_get("data").map_err(StoreError::from)?;
    let created_by: Option<String> = row.try_get("_created_by").map_err(StoreError::from)?;
    let updated_by: Option<String> = row.try_get("_updated_by").map_err(StoreError::from)?;
    let created_at: DateTime<Utc> = row.try_get("_created_at").map_err(StoreError::from)?;
    let updated_at: DateTime<Utc> = row.try_get("_updated_at").map_err(StoreError::from)?;
    let version: i64 = row.try_get("_version").map_err(StoreError::from)?;
    let deleted_at: Option<DateTime<Utc>> =
        row.try_get("_deleted_at").map_err(StoreError::from)?;

    let mut document = match data {
        Value::Object(map) => map.into_iter().collect::<Document>(),
        _ => Document::new(),
    };
    document.insert("_id".to_string(), Value::String(id.to_string()));
    document.insert(
        "_created_at".to_string(),
        Value::String(created_at.to_rfc3339()),
    );
    document.insert(
        "_updated_at".to_string(),
        Value::String(updated_at.to_rfc3339()),
    );
    document.insert("_version".to_string(), Value::from(version));
    if let Some(actor) = created_by {
        document.insert("_created_by".to_string(), Value::String(actor));
    }
    if let Some(actor) = updated_by {
        document.insert("_updated_by".to_string(), Value::String(actor));
    }
    if let Some(at) = deleted_at {
        document.insert("_deleted_at".to_string(), Value::String(at.to_rfc3339()));
    }
    Ok(document)
}

/// Attach typed bind parameters to a query in order.
fn bind_all<'q>(
    statement: &'q str,
    params: Vec<SqlParam>,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    let mut query = sqlx::query(statement);
    for param in params {
        query = match param {
            SqlParam::Json(value) => query.bind(sqlx::types::Json(value)),
            SqlParam::Text(text) => query.bind(text),
            SqlParam::TextArray(items) => query.bind(items),
            SqlParam::Uuid(uuid) => query.bind(uuid),
            SqlParam::UuidArray(items) => query.bind(items),
            SqlParam::Int(int) => query.bind(int),
            SqlParam::Float(float) => query.bind(float),
            SqlParam::Timestamp(at) => query.bind(at),
        };
    }
    query
}
