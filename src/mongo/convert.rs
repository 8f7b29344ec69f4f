//! JSON / BSON Conversion
//!
//! The neutral vocabulary speaks `serde_json`; the driver speaks BSON. This
//! module is the single conversion point: neutral filters and updates go in
//! with `_id` strings coerced to `ObjectId`, driver documents come out with
//! ObjectIds rendered as 24-hex text and datetimes as RFC 3339 text, so the
//! caller-visible shape matches the relational adapter exactly.

use crate::error::{Result, StoreError};
use crate::ops;
use crate::store::Document;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{self, Bson};
use serde_json::Value;

/// Convert a neutral JSON value to BSON.
pub fn json_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Bson::Int64(i)
            } else {
                Bson::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(items) => Bson::Array(items.iter().map(json_to_bson).collect()),
        Value::Object(map) => {
            let mut doc = bson::Document::new();
            for (key, item) in map {
                doc.insert(key.clone(), json_to_bson(item));
            }
            Bson::Document(doc)
        }
    }
}

/// Convert a BSON value to neutral JSON.
///
/// ObjectIds become 24-hex strings and datetimes RFC 3339 strings, matching
/// the textual forms the relational adapter produces.
pub fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::from(*i),
        Bson::Int64(i) => Value::from(*i),
        Bson::Double(d) => serde_json::Number::from_f64(*d)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::String(s) => Value::String(s.clone()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::String(dt.to_chrono().to_rfc3339()),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(doc) => Value::Object(bson_doc_to_json(doc).into_iter().collect()),
        other => Value::String(other.to_string()),
    }
}

/// Convert a driver document into a neutral document.
pub fn bson_doc_to_json(doc: &bson::Document) -> Document {
    let mut out = Document::new();
    for (key, value) in doc {
        out.insert(key.clone(), bson_to_json(value));
    }
    out
}

/// Translate a validated neutral filter into a driver filter.
///
/// `_id` comparisons are coerced from hex strings to ObjectIds, including
/// inside `$in`/`$nin` arrays and through the logical combinators.
pub fn filter_to_bson(filter: &Document) -> Result<bson::Document> {
    let mut doc = bson::Document::new();
    for (key, value) in filter {
        match key.as_str() {
            "$and" | "$or" => {
                let clauses = value.as_array().expect("validated by ops");
                let mut translated = Vec::with_capacity(clauses.len());
                for clause in clauses {
                    let map = clause.as_object().expect("validated by ops");
                    translated.push(Bson::Document(filter_to_bson(map)?));
                }
                doc.insert(key.clone(), Bson::Array(translated));
            }
            "$not" => {
                let map = value.as_object().expect("validated by ops");
                // The driver has no top-level $not; express it as $nor.
                doc.insert("$nor", Bson::Array(vec![Bson::Document(filter_to_bson(map)?)]));
            }
            "_id" => {
                doc.insert("_id", id_condition_to_bson(value)?);
            }
            field if ops::TIMESTAMP_FIELDS.contains(&field) => {
                doc.insert(field.to_string(), timestamp_condition_to_bson(value)?);
            }
            _ => {
                doc.insert(key.clone(), json_to_bson(value));
            }
        }
    }
    Ok(doc)
}

fn id_condition_to_bson(value: &Value) -> Result<Bson> {
    match value {
        Value::String(s) => Ok(Bson::ObjectId(parse_object_id(s)?)),
        Value::Object(ops) => {
            let mut doc = bson::Document::new();
            for (op, operand) in ops {
                match operand {
                    Value::String(s) => {
                        doc.insert(op.clone(), Bson::ObjectId(parse_object_id(s)?));
                    }
                    Value::Array(items) => {
                        let mut ids = Vec::with_capacity(items.len());
                        for item in items {
                            let s = item
                                .as_str()
                                .ok_or_else(|| StoreError::InvalidId(item.to_string()))?;
                            ids.push(Bson::ObjectId(parse_object_id(s)?));
                        }
                        doc.insert(op.clone(), Bson::Array(ids));
                    }
                    other => {
                        doc.insert(op.clone(), json_to_bson(other));
                    }
                }
            }
            Ok(Bson::Document(doc))
        }
        other => Ok(json_to_bson(other)),
    }
}

fn parse_object_id(text: &str) -> Result<ObjectId> {
    ObjectId::parse_str(text).map_err(|_| StoreError::InvalidId(text.to_string()))
}

/// Timestamp system fields are stored as native datetimes, so comparing
/// them against the RFC 3339 text this layer hands out would never match;
/// coerce the text back to a datetime before translation.
fn timestamp_condition_to_bson(value: &Value) -> Result<Bson> {
    match value {
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            let mut doc = bson::Document::new();
            for (op, operand) in ops {
                let translated = match (op.as_str(), operand) {
                    // $exists takes a bool and $regex a pattern string.
                    ("$exists" | "$regex", _) => json_to_bson(operand),
                    (_, Value::Array(items)) => Bson::Array(
                        items.iter().map(timestamp_to_bson).collect::<Result<_>>()?,
                    ),
                    (_, other) => timestamp_to_bson(other)?,
                };
                doc.insert(op.clone(), translated);
            }
            Ok(Bson::Document(doc))
        }
        other => timestamp_to_bson(other),
    }
}

fn timestamp_to_bson(value: &Value) -> Result<Bson> {
    match value {
        Value::Null => Ok(Bson::Null),
        Value::String(s) => {
            let parsed = chrono::DateTime::parse_from_rfc3339(s)
                .map_err(|e| StoreError::unsupported(format!("bad timestamp: {e}")))?;
            Ok(Bson::DateTime(bson::DateTime::from_chrono(parsed)))
        }
        other => Err(StoreError::unsupported(format!(
            "expected an RFC 3339 timestamp, got {other}"
        ))),
    }
}

/// Translate a validated neutral update into a driver update, injecting the
/// system stamps: `$set._updated_at = now` and `$inc._version = 1`. The
/// Postgres adapter gets the same behavior from its row trigger; here it is
/// done at translation time since the backend has no trigger mechanism.
pub fn update_to_bson(update: &Document) -> Result<bson::Document> {
    let mut doc = bson::Document::new();
    for (op, fields) in update {
        if op == "$set" {
            let map = fields.as_object().expect("validated by ops");
            let mut set = bson::Document::new();
            for (field, value) in map {
                // The soft-delete marker lands as a native datetime, like
                // the other timestamp fields.
                if field == "_deleted_at" {
                    set.insert(field.clone(), timestamp_to_bson(value)?);
                } else {
                    set.insert(field.clone(), json_to_bson(value));
                }
            }
            doc.insert("$set", Bson::Document(set));
        } else {
            doc.insert(op.clone(), json_to_bson(fields));
        }
    }

    doc.entry("$set".to_string())
        .or_insert_with(|| Bson::Document(bson::Document::new()));
    if let Some(Bson::Document(set)) = doc.get_mut("$set") {
        set.insert("_updated_at", Bson::DateTime(bson::DateTime::now()));
    }

    doc.entry("$inc".to_string())
        .or_insert_with(|| Bson::Document(bson::Document::new()));
    if let Some(Bson::Document(inc)) = doc.get_mut("$inc") {
        inc.insert("_version", Bson::Int64(1));
    }

    Ok(doc)
}

/// Build the driver document for an insert: the caller payload plus the
/// layer-managed system fields. Returns the document and its id (the
/// caller-supplied `_id` or one generated here, before insertion, so both
/// backends share the assign-then-insert lifecycle).
pub fn insert_document(payload: &Document) -> Result<(bson::Document, ObjectId)> {
    for field in payload.keys() {
        if ops::is_system_field(field)
            && !matches!(field.as_str(), "_id" | "_created_by" | "_updated_by")
        {
            return Err(StoreError::unsupported(format!(
                "system field {field} is managed by the storage layer"
            )));
        }
    }

    let id = match payload.get("_id") {
        Some(Value::String(s)) => parse_object_id(s)?,
        Some(other) => return Err(StoreError::InvalidId(other.to_string())),
        None => ObjectId::new(),
    };

    let mut doc = bson::Document::new();
    for (key, value) in payload {
        if key == "_id" {
            continue;
        }
        doc.insert(key.clone(), json_to_bson(value));
    }

    let now = bson::DateTime::now();
    doc.insert("_id", Bson::ObjectId(id));
    doc.insert("_created_at", Bson::DateTime(now));
    doc.insert("_updated_at", Bson::DateTime(now));
    doc.insert("_version", Bson::Int64(1));

    Ok((doc, id))
}
