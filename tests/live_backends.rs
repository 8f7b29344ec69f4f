//! Integration tests against live backends.
//!
//! These run against real deployments and are ignored by default. Provide
//! the URIs and run with `--ignored`:
//!
//! ```text
//! DUALSTORE_MONGO_URI=mongodb://localhost:27017 \
//! DUALSTORE_POSTGRES_URI=postgres://localhost/dualstore_test \
//! cargo test --test live_backends -- --ignored
//! ```
//!
//! Every scenario runs identically on both backends; the assertions are the
//! portability contract itself.

use dualstore::{
    connect, document_id, BackendKind, Database, DatabaseConfig, FindOptions, Index, Order,
    StoreError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

fn config_for(backend: BackendKind) -> DatabaseConfig {
    let var = match backend {
        BackendKind::Mongo => "DUALSTORE_MONGO_URI",
        BackendKind::Postgres => "DUALSTORE_POSTGRES_URI",
    };
    let uri = std::env::var(var).unwrap_or_else(|_| panic!("{var} must be set for live tests"));
    DatabaseConfig {
        backend,
        uri,
        database: "dualstore_test".to_string(),
        ..DatabaseConfig::default()
    }
}

async fn db_for(backend: BackendKind) -> Arc<dyn Database> {
    connect(&config_for(backend)).await.expect("connect")
}

/// Unique per-test collection name so runs never interfere.
fn scratch(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

fn obj(value: Value) -> dualstore::Document {
    value.as_object().unwrap().clone()
}

async fn document_lifecycle(backend: BackendKind) {
    let db = db_for(backend).await;
    let name = scratch("products");
    let products = db.collection(&name).unwrap();

    // Insert stamps the system fields and starts versions at 1.
    let id = products
        .insert_one(obj(json!({ "name": "widget", "price": 9.99, "tags": ["a"] })))
        .await
        .unwrap();
    assert!(!id.is_zero());
    assert_eq!(id.backend(), Some(backend));

    let by_id = obj(json!({ "_id": id.to_string() }));
    let found = products.find_one(&by_id).await.unwrap();
    assert_eq!(found["name"], json!("widget"));
    assert_eq!(found["_version"], json!(1));
    assert!(found["_created_at"].as_str().unwrap().contains('T'));
    assert_eq!(document_id(&found), Some(id));

    // Each successful update bumps the version by exactly one.
    let result = products
        .update_one(&by_id, &obj(json!({ "$set": { "price": 12.5 } })))
        .await
        .unwrap();
    assert_eq!(result.matched_count, 1);
    assert_eq!(result.modified_count, 1);

    let updated = products.find_one(&by_id).await.unwrap();
    assert_eq!(updated["price"], json!(12.5));
    assert_eq!(updated["_version"], json!(2));
    assert!(updated["_updated_at"].as_str().unwrap() >= updated["_created_at"].as_str().unwrap());

    // Timestamp filters compare as timestamps, not text, on both backends.
    let horizon = obj(json!({ "_created_at": { "$lte": "2100-01-01T00:00:00Z" } }));
    assert_eq!(products.count_documents(&horizon).await.unwrap(), 1);

    let deleted = products.delete_one(&by_id).await.unwrap();
    assert_eq!(deleted.deleted_count, 1);
    assert!(matches!(
        products.find_one(&by_id).await,
        Err(StoreError::NotFound)
    ));

    db.drop_collection(&name).await.unwrap();
}

async fn operator_vocabulary(backend: BackendKind) {
    let db = db_for(backend).await;
    let name = scratch("inventory");
    let items = db.collection(&name).unwrap();

    items
        .insert_many(vec![
            obj(json!({ "name": "anvil", "price": 120, "status": "active", "sku": "A1" })),
            obj(json!({ "name": "bolt", "price": 2, "status": "active" })),
            obj(json!({ "name": "crate", "price": 30, "status": "retired", "sku": "C3" })),
        ])
        .await
        .unwrap();

    // Range + equality.
    let docs = items
        .find(
            &obj(json!({ "status": "active", "price": { "$gt": 1, "$lte": 120 } })),
            FindOptions::default(),
        )
        .await
        .unwrap()
        .all()
        .await
        .unwrap();
    assert_eq!(docs.len(), 2);

    // $in / $exists / $regex.
    assert_eq!(
        items
            .count_documents(&obj(json!({ "status": { "$in": ["active", "retired"] } })))
            .await
            .unwrap(),
        3
    );
    assert_eq!(
        items
            .count_documents(&obj(json!({ "sku": { "$exists": true } })))
            .await
            .unwrap(),
        2
    );
    assert_eq!(
        items
            .count_documents(&obj(json!({ "name": { "$regex": "^[ab]" } })))
            .await
            .unwrap(),
        2
    );

    // Logical combinators.
    assert_eq!(
        items
            .count_documents(&obj(json!({
                "$or": [{ "name": "anvil" }, { "name": "crate" }],
                "$not": { "status": "retired" }
            })))
            .await
            .unwrap(),
        1
    );

    // Sort, skip, limit.
    let page = items
        .find(
            &obj(json!({})),
            FindOptions {
                sort: vec![("price".to_string(), Order::Descending)],
                limit: Some(2),
                skip: Some(1),
            },
        )
        .await
        .unwrap()
        .all()
        .await
        .unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0]["name"], json!("crate"));
    assert_eq!(page[1]["name"], json!("bolt"));

    // Unknown operators fail before touching the backend.
    assert!(matches!(
        items.count_documents(&obj(json!({ "$where": "1" }))).await,
        Err(StoreError::Unsupported(_))
    ));

    db.drop_collection(&name).await.unwrap();
}

async fn update_vocabulary(backend: BackendKind) {
    let db = db_for(backend).await;
    let name = scratch("articles");
    let articles = db.collection(&name).unwrap();

    let id = articles
        .insert_one(obj(json!({
            "title": "draft",
            "views": 10,
            "tags": ["rust"],
            "stale": true
        })))
        .await
        .unwrap();
    let by_id = obj(json!({ "_id": id.to_string() }));

    articles
        .update_one(
            &by_id,
            &obj(json!({
                "$set": { "title": "published" },
                "$inc": { "views": 5 },
                "$unset": { "stale": "" }
            })),
        )
        .await
        .unwrap();
    let doc = articles.find_one(&by_id).await.unwrap();
    assert_eq!(doc["title"], json!("published"));
    assert_eq!(doc["views"].as_f64(), Some(15.0));
    assert!(!doc.contains_key("stale"));

    // Array operators: push, dedup via addToSet, pull.
    articles
        .update_one(&by_id, &obj(json!({ "$push": { "tags": "db" } })))
        .await
        .unwrap();
    articles
        .update_one(&by_id, &obj(json!({ "$addToSet": { "tags": "db" } })))
        .await
        .unwrap();
    articles
        .update_one(&by_id, &obj(json!({ "$pull": { "tags": "rust" } })))
        .await
        .unwrap();
    let doc = articles.find_one(&by_id).await.unwrap();
    assert_eq!(doc["tags"], json!(["db"]));

    // System fields cannot be written through updates.
    assert!(matches!(
        articles
            .update_one(&by_id, &obj(json!({ "$set": { "_version": 99 } })))
            .await,
        Err(StoreError::Unsupported(_))
    ));

    db.drop_collection(&name).await.unwrap();
}

async fn soft_delete_marker(backend: BackendKind) {
    let db = db_for(backend).await;
    let name = scratch("notes");
    let notes = db.collection(&name).unwrap();

    let id = notes.insert_one(obj(json!({ "title": "n1" }))).await.unwrap();
    let by_id = obj(json!({ "_id": id.to_string() }));
    let alive = obj(json!({ "_deleted_at": null }));
    assert_eq!(notes.count_documents(&alive).await.unwrap(), 1);

    // Marking sets the timestamp; the document drops out of the alive set.
    notes
        .update_one(&by_id, &obj(json!({ "$set": { "_deleted_at": "2026-08-23T00:00:00Z" } })))
        .await
        .unwrap();
    assert_eq!(notes.count_documents(&alive).await.unwrap(), 0);
    let doc = notes.find_one(&by_id).await.unwrap();
    assert!(doc["_deleted_at"].as_str().unwrap().starts_with("2026-08-23"));
    assert_eq!(
        notes
            .count_documents(&obj(json!({ "_deleted_at": { "$lte": "2027-01-01T00:00:00Z" } })))
            .await
            .unwrap(),
        1
    );

    // Clearing restores it.
    notes
        .update_one(&by_id, &obj(json!({ "$unset": { "_deleted_at": "" } })))
        .await
        .unwrap();
    assert_eq!(notes.count_documents(&alive).await.unwrap(), 1);

    db.drop_collection(&name).await.unwrap();
}

async fn unique_index_and_duplicates(backend: BackendKind) {
    let db = db_for(backend).await;
    let name = scratch("users");
    let users = db.collection(&name).unwrap();

    let index_name = format!("{name}_email_unique");
    let created = users
        .create_index(Index::on_field(index_name.clone(), "email").unique())
        .await
        .unwrap();
    assert_eq!(created, index_name);

    users
        .insert_one(obj(json!({ "email": "a@example.com" })))
        .await
        .unwrap();
    assert!(matches!(
        users
            .insert_one(obj(json!({ "email": "a@example.com" })))
            .await,
        Err(StoreError::DuplicateKey(_))
    ));

    let listed = users.list_indexes().await.unwrap();
    let ours = listed
        .iter()
        .find(|index| index.name == index_name)
        .expect("created index is listed");
    assert!(ours.unique);
    assert_eq!(ours.keys, vec![("email".to_string(), Order::Ascending)]);

    users.drop_index(&index_name).await.unwrap();
    db.drop_collection(&name).await.unwrap();
}

async fn transaction_commit_and_rollback(backend: BackendKind) {
    let db = db_for(backend).await;
    let name = scratch("ledger");
    db.create_collection(&name).await.unwrap();
    let ledger = db.collection(&name).unwrap();

    // Rolled-back writes are never observable.
    let mut tx = db.begin_transaction().await.unwrap();
    tx.insert_one(&name, obj(json!({ "amount": 10 }))).await.unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(ledger.count_documents(&obj(json!({}))).await.unwrap(), 0);

    let mut tx = db.begin_transaction().await.unwrap();
    tx.insert_one(&name, obj(json!({ "amount": 10 }))).await.unwrap();
    tx.insert_one(&name, obj(json!({ "amount": -10 }))).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(ledger.count_documents(&obj(json!({}))).await.unwrap(), 2);

    // The closure form rolls back on Err.
    let collection = name.clone();
    let outcome = db
        .run_in_transaction(Box::new(move |tx| {
            Box::pin(async move {
                tx.insert_one(&collection, obj(json!({ "amount": 99 }))).await?;
                Err(StoreError::internal("forced failure"))
            })
        }))
        .await;
    assert!(outcome.is_err());
    assert_eq!(ledger.count_documents(&obj(json!({}))).await.unwrap(), 2);

    db.drop_collection(&name).await.unwrap();
}

async fn bounded_pool_transaction(backend: BackendKind) {
    // A single-connection pool must still be able to write to a collection
    // the transaction is first to touch.
    let config = DatabaseConfig {
        max_pool_size: 1,
        min_pool_size: 1,
        ..config_for(backend)
    };
    let db = connect(&config).await.expect("connect");
    let name = scratch("jobs");
    let jobs = db.collection(&name).unwrap();

    let mut tx = db.begin_transaction().await.unwrap();
    tx.insert_one(&name, obj(json!({ "state": "queued" }))).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(jobs.count_documents(&obj(json!({}))).await.unwrap(), 1);

    db.drop_collection(&name).await.unwrap();
}

async fn aggregation_count(backend: BackendKind) {
    let db = db_for(backend).await;
    let name = scratch("events");
    let events = db.collection(&name).unwrap();

    events
        .insert_many(vec![
            obj(json!({ "kind": "click" })),
            obj(json!({ "kind": "click" })),
            obj(json!({ "kind": "view" })),
        ])
        .await
        .unwrap();

    let docs = events
        .aggregate(&[
            obj(json!({ "$match": { "kind": "click" } })),
            obj(json!({ "$count": "total" })),
        ])
        .await
        .unwrap()
        .all()
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["total"].as_i64(), Some(2));

    db.drop_collection(&name).await.unwrap();
}

async fn malformed_ids_fail_fast(backend: BackendKind) {
    let db = db_for(backend).await;
    let name = scratch("misc");
    let misc = db.collection(&name).unwrap();

    assert!(matches!(
        misc.find_one(&obj(json!({ "_id": "not-an-id" }))).await,
        Err(StoreError::InvalidId(_))
    ));

    db.drop_collection(&name).await.unwrap();
}

macro_rules! backend_tests {
    ($module:ident, $backend:expr) => {
        mod $module {
            use super::*;

            #[tokio::test]
            #[ignore]
            async fn lifecycle() {
                document_lifecycle($backend).await;
            }

            #[tokio::test]
            #[ignore]
            async fn operators() {
                operator_vocabulary($backend).await;
            }

            #[tokio::test]
            #[ignore]
            async fn updates() {
                update_vocabulary($backend).await;
            }

            #[tokio::test]
            #[ignore]
            async fn unique_indexes() {
                unique_index_and_duplicates($backend).await;
            }

            #[tokio::test]
            #[ignore]
            async fn transactions() {
                transaction_commit_and_rollback($backend).await;
            }

            #[tokio::test]
            #[ignore]
            async fn soft_delete() {
                soft_delete_marker($backend).await;
            }

            #[tokio::test]
            #[ignore]
            async fn bounded_pool_transactions() {
                bounded_pool_transaction($backend).await;
            }

            #[tokio::test]
            #[ignore]
            async fn aggregation() {
                aggregation_count($backend).await;
            }

            #[tokio::test]
            #[ignore]
            async fn invalid_ids() {
                malformed_ids_fail_fast($backend).await;
            }
        }
    };
}

backend_tests!(mongo, BackendKind::Mongo);
backend_tests!(postgres, BackendKind::Postgres);
