//! MongoDB Adapter
//!
//! Implements the neutral contract near one-to-one on the driver: the
//! operator vocabulary was designed after this backend, so filters and
//! updates pass through with only `_id` coercion and system-field stamping.
//! This adapter is the correctness reference: any divergence in the
//! relational adapter's output for an equivalent filter is a bug there.

mod convert;

use crate::config::{BackendKind, DatabaseConfig};
use crate::error::{Result, StoreError};
use crate::id::DocumentId;
use crate::ops;
use crate::store::{
    Collection, Cursor, Database, DeleteResult, Document, FindOptions, Index, Order, Transaction,
    UpdateResult,
};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, ClientSession, IndexModel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide handle to a MongoDB deployment.
pub struct MongoDatabase {
    client: Client,
    database: mongodb::Database,
    connected: Arc<AtomicBool>,
}

impl MongoDatabase {
    /// Connect using the pool bounds and timeouts from `config` and verify
    /// the deployment responds to `ping`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.uri).await?;
        options.max_pool_size = Some(config.max_pool_size);
        options.min_pool_size = Some(config.min_pool_size);
        options.max_idle_time = Some(config.max_idle_time);
        options.connect_timeout = Some(config.connect_timeout);

        let client = Client::with_options(options)?;
        let database = client.database(&config.database);
        database.run_command(doc! { "ping": 1 }, None).await?;

        tracing::debug!(database = %config.database, "connected to mongodb");

        Ok(Self {
            client,
            database,
            connected: Arc::new(AtomicBool::new(true)),
        })
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }
}

#[async_trait]
impl Database for MongoDatabase {
    fn kind(&self) -> BackendKind {
        BackendKind::Mongo
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_connected()?;
        self.database.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Second and later closes are no-ops.
        if self.connected.swap(false, Ordering::AcqRel) {
            self.client.clone().shutdown().await;
        }
        Ok(())
    }

    fn collection(&self, name: &str) -> Result<Box<dyn Collection>> {
        self.ensure_connected()?;
        Ok(Box::new(MongoCollection {
            name: name.to_string(),
            coll: self.database.collection::<bson::Document>(name),
            client: self.client.clone(),
            connected: Arc::clone(&self.connected),
        }))
    }

    async fn create_collection(&self, name: &str) -> Result<()> {
        self.ensure_connected()?;
        match self.database.create_collection(name, None).await {
            Ok(()) => Ok(()),
            // Code 48 is NamespaceExists; creation is idempotent.
            Err(err) => match &*err.kind {
                ErrorKind::Command(ce) if ce.code == 48 => Ok(()),
                _ => Err(err.into()),
            },
        }
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        self.ensure_connected()?;
        self.database
            .collection::<bson::Document>(name)
            .drop(None)
            .await?;
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.ensure_connected()?;
        Ok(self.database.list_collection_names(None).await?)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_connected()?;
        let mut session = self.client.start_session(None).await?;
        session
            .start_transaction(None)
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;
        Ok(Box::new(MongoTransaction {
            session,
            database: self.database.clone(),
        }))
    }
}

/// One logical collection on the document backend.
pub struct MongoCollection {
    name: String,
    coll: mongodb::Collection<bson::Document>,
    client: Client,
    connected: Arc<AtomicBool>,
}

impl MongoCollection {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }

    fn translate_filter(filter: &Document) -> Result<bson::Document> {
        ops::validate_filter(filter)?;
        convert::filter_to_bson(filter)
    }

    fn sort_document(sort: &[(String, Order)]) -> bson::Document {
        let mut doc = bson::Document::new();
        for (field, order) in sort {
            doc.insert(field.clone(), Bson::Int32(order.as_i32()));
        }
        doc
    }
}

#[async_trait]
impl Collection for MongoCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert_one(&self, document: Document) -> Result<DocumentId> {
        self.ensure_connected()?;
        let (doc, id) = convert::insert_document(&document)?;
        self.coll.insert_one(doc, None).await?;
        Ok(DocumentId::from(id))
    }

    async fn insert_many(&self, documents: Vec<Document>) -> Result<Vec<DocumentId>> {
        self.ensure_connected()?;
        let mut docs = Vec::with_capacity(documents.len());
        let mut ids = Vec::with_capacity(documents.len());
        for document in &documents {
            let (doc, id) = convert::insert_document(document)?;
            docs.push(doc);
            ids.push(DocumentId::from(id));
        }

        // All-or-nothing: an ordered insert_many stops at the first failure
        // but does not undo earlier writes, so run it inside a transaction.
        let mut session = self.client.start_session(None).await?;
        session
            .start_transaction(None)
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;
        match self
            .coll
            .insert_many_with_session(docs, None, &mut session)
            .await
        {
            Ok(_) => {
                session
                    .commit_transaction()
                    .await
                    .map_err(|e| StoreError::TransactionFailed(e.to_string()))?;
                Ok(ids)
            }
            Err(err) => {
                let _ = session.abort_transaction().await;
                Err(err.into())
            }
        }
    }

    async fn find_one(&self, filter: &Document) -> Result<Document> {
        self.ensure_connected()?;
        let filter = Self::translate_filter(filter)?;
        self.coll
            .find_one(filter, None)
            .await?
            .map(|doc| convert::bson_doc_to_json(&doc))
            .ok_or(StoreError::NotFound)
    }

    async fn find(&self, filter: &Document, options: FindOptions) -> Result<Box<dyn Cursor>> {
        self.ensure_connected()?;
        let filter = Self::translate_filter(filter)?;

        let find_options = mongodb::options::FindOptions::builder()
            .sort((!options.sort.is_empty()).then(|| Self::sort_document(&options.sort)))
            .limit(options.limit)
            .skip(options.skip)
            .build();

        let cursor = self.coll.find(filter, find_options).await?;
        Ok(Box::new(MongoCursor { inner: cursor }))
    }

    async fn update_one(&self, filter: &Document, update: &Document) -> Result<UpdateResult> {
        self.ensure_connected()?;
        ops::validate_update(update)?;
        let filter = Self::translate_filter(filter)?;
        let update = convert::update_to_bson(update)?;
        let result = self.coll.update_one(filter, update, None).await?;
        Ok(to_update_result(
            result.matched_count,
            result.modified_count,
            result.upserted_id,
        ))
    }

    async fn update_many(&self, filter: &Document, update: &Document) -> Result<UpdateResult> {
        self.ensure_connected()?;
        ops::validate_update(update)?;
        let filter = Self::translate_filter(filter)?;
        let update = convert::update_to_bson(update)?;
        let result = self.coll.update_many(filter, update, None).await?;
        Ok(to_update_result(
            result.matched_count,
            result.modified_count,
            result.upserted_id,
        ))
    }

    async fn delete_one(&self, filter: &Document) -> Result<DeleteResult> {
        self.ensure_connected()?;
        let filter = Self::translate_filter(filter)?;
        let result = self.coll.delete_one(filter, None).await?;
        Ok(DeleteResult {
            deleted_count: result.deleted_count,
        })
    }

    async fn delete_many(&self, filter: &Document) -> Result<DeleteResult> {
        self.ensure_connected()?;
        let filter = Self::translate_filter(filter)?;
        let result = self.coll.delete_many(filter, None).await?;
        Ok(DeleteResult {
            deleted_count: result.deleted_count,
        })
    }

    async fn count_documents(&self, filter: &Document) -> Result<u64> {
        self.ensure_connected()?;
        let filter = Self::translate_filter(filter)?;
        Ok(self.coll.count_documents(filter, None).await?)
    }

    async fn create_index(&self, index: Index) -> Result<String> {
        self.ensure_connected()?;
        let mut keys = bson::Document::new();
        for (field, order) in &index.keys {
            keys.insert(field.clone(), Bson::Int32(order.as_i32()));
        }
        let options = IndexOptions::builder()
            .name(Some(index.name.clone()))
            .unique(index.unique.then_some(true))
            .sparse(index.sparse.then_some(true))
            .expire_after(index.ttl)
            .build();
        let model = IndexModel::builder().keys(keys).options(options).build();
        let result = self.coll.create_index(model, None).await?;
        Ok(result.index_name)
    }

    async fn drop_index(&self, name: &str) -> Result<()> {
        self.ensure_connected()?;
        self.coll.drop_index(name, None).await?;
        Ok(())
    }

    async fn list_indexes(&self) -> Result<Vec<Index>> {
        self.ensure_connected()?;
        let mut cursor = self.coll.list_indexes(None).await?;
        let mut indexes = Vec::new();
        while let Some(model) = cursor.try_next().await? {
            indexes.push(to_index(model));
        }
        Ok(indexes)
    }

    async fn aggregate(&self, pipeline: &[Document]) -> Result<Box<dyn Cursor>> {
        self.ensure_connected()?;
        let stages: Vec<bson::Document> = pipeline
            .iter()
            .map(|stage| {
                let bson = convert::json_to_bson(&serde_json::Value::Object(
                    stage.clone().into_iter().collect(),
                ));
                match bson {
                    Bson::Document(doc) => doc,
                    _ => bson::Document::new(),
                }
            })
            .collect();
        let cursor = self.coll.aggregate(stages, None).await?;
        Ok(Box::new(MongoCursor { inner: cursor }))
    }
}

/// Driver update counters and optional upserted id mapped to the neutral
/// result type.
fn to_update_result(
    matched_count: u64,
    modified_count: u64,
    upserted: Option<Bson>,
) -> UpdateResult {
    let upserted_id = match upserted {
        Some(Bson::ObjectId(oid)) => DocumentId::from(oid),
        _ => DocumentId::Zero,
    };
    UpdateResult {
        matched_count,
        modified_count,
        upserted_count: u64::from(!upserted_id.is_zero()),
        upserted_id,
    }
}

fn to_index(model: IndexModel) -> Index {
    let keys = model
        .keys
        .iter()
        .map(|(field, value)| {
            let direction = match value {
                Bson::Int32(i) => Order::from_i32(*i),
                Bson::Int64(i) => Order::from_i32(*i as i32),
                Bson::Double(d) => Order::from_i32(*d as i32),
                _ => Order::Ascending,
            };
            (field.clone(), direction)
        })
        .collect();

    let options = model.options.unwrap_or_default();
    Index {
        name: options.name.unwrap_or_default(),
        keys,
        unique: options.unique.unwrap_or(false),
        sparse: options.sparse.unwrap_or(false),
        ttl: options.expire_after,
    }
}

/// Cursor over driver results; pull mode is native here.
pub struct MongoCursor {
    inner: mongodb::Cursor<bson::Document>,
}

#[async_trait]
impl Cursor for MongoCursor {
    async fn next(&mut self) -> Result<Option<Document>> {
        match self.inner.try_next().await? {
            Some(doc) => Ok(Some(convert::bson_doc_to_json(&doc))),
            None => Ok(None),
        }
    }

    async fn all(&mut self) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        while let Some(doc) = self.next().await? {
            documents.push(doc);
        }
        Ok(documents)
    }
}

/// Session-backed transaction. The driver aborts the server-side
/// transaction when the session drops, so an unresolved handle (including
/// one dropped by a panic) cannot leak its connection.
pub struct MongoTransaction {
    session: ClientSession,
    database: mongodb::Database,
}

#[async_trait]
impl Transaction for MongoTransaction {
    async fn insert_one(&mut self, collection: &str, document: Document) -> Result<DocumentId> {
        let (doc, id) = convert::insert_document(&document)?;
        self.database
            .collection::<bson::Document>(collection)
            .insert_one_with_session(doc, None, &mut self.session)
            .await?;
        Ok(DocumentId::from(id))
    }

    async fn find_one(&mut self, collection: &str, filter: &Document) -> Result<Document> {
        ops::validate_filter(filter)?;
        let filter = convert::filter_to_bson(filter)?;
        self.database
            .collection::<bson::Document>(collection)
            .find_one_with_session(filter, None, &mut self.session)
            .await?
            .map(|doc| convert::bson_doc_to_json(&doc))
            .ok_or(StoreError::NotFound)
    }

    async fn update_many(
        &mut self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult> {
        ops::validate_filter(filter)?;
        ops::validate_update(update)?;
        let filter = convert::filter_to_bson(filter)?;
        let update = convert::update_to_bson(update)?;
        let result = self
            .database
            .collection::<bson::Document>(collection)
            .update_many_with_session(filter, update, None, &mut self.session)
            .await?;
        Ok(to_update_result(
            result.matched_count,
            result.modified_count,
            result.upserted_id,
        ))
    }

    async fn delete_many(&mut self, collection: &str, filter: &Document) -> Result<DeleteResult> {
        ops::validate_filter(filter)?;
        let filter = convert::filter_to_bson(filter)?;
        let result = self
            .database
            .collection::<bson::Document>(collection)
            .delete_many_with_session(filter, None, &mut self.session)
            .await?;
        Ok(DeleteResult {
            deleted_count: result.deleted_count,
        })
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.session
            .commit_transaction()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.session
            .abort_transaction()
            .await
            .map_err(|e| StoreError::TransactionFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_model_round_trip() {
        let mut keys = bson::Document::new();
        keys.insert("email", Bson::Int32(1));
        keys.insert("created", Bson::Int32(-1));
        let model = IndexModel::builder()
            .keys(keys)
            .options(
                IndexOptions::builder()
                    .name(Some("email_unique".to_string()))
                    .unique(Some(true))
                    .build(),
            )
            .build();

        let index = to_index(model);
        assert_eq!(index.name, "email_unique");
        assert_eq!(
            index.keys,
            vec![
                ("email".to_string(), Order::Ascending),
                ("created".to_string(), Order::Descending),
            ]
        );
        assert!(index.unique);
        assert!(!index.sparse);
    }

    #[test]
    fn upsert_id_maps_into_update_result() {
        let oid = bson::oid::ObjectId::new();
        let result = to_update_result(0, 0, Some(Bson::ObjectId(oid)));
        assert_eq!(result.upserted_count, 1);
        assert_eq!(result.upserted_id, DocumentId::from(oid));

        let result = to_update_result(2, 2, None);
        assert_eq!(result.upserted_count, 0);
        assert!(result.upserted_id.is_zero());
    }
}
