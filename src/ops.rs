//! Operator Vocabulary
//!
//! The fixed, backend-independent set of filter and update operators both
//! adapters interpret with identical semantics. Validation happens here,
//! before any backend call, so an unknown operator fails fast with
//! `Unsupported` and can never leave a mutation partially applied.

use crate::error::{Result, StoreError};
use serde_json::{Map, Value};

/// Comparison operators usable inside a field's operator map.
pub const COMPARISON_OPERATORS: &[&str] = &[
    "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$exists", "$regex",
];

/// Logical combinators usable at filter level.
pub const LOGICAL_OPERATORS: &[&str] = &["$and", "$or", "$not"];

/// Update operators usable at the top level of an update map.
pub const UPDATE_OPERATORS: &[&str] = &["$set", "$unset", "$inc", "$push", "$pull", "$addToSet"];

/// Reserved fields managed by this layer, never by callers.
pub const SYSTEM_FIELDS: &[&str] = &[
    "_id",
    "_created_at",
    "_updated_at",
    "_version",
    "_deleted_at",
    "_created_by",
    "_updated_by",
];

/// System fields stored as native timestamps on both backends.
pub const TIMESTAMP_FIELDS: &[&str] = &["_created_at", "_updated_at", "_deleted_at"];

/// True if `field` is one of the layer-managed system fields.
pub fn is_system_field(field: &str) -> bool {
    SYSTEM_FIELDS.contains(&field)
}

/// Validate a neutral filter map against the vocabulary.
///
/// Recurses through logical combinators and per-field operator maps. Any
/// `$`-prefixed key outside the vocabulary yields `Unsupported`.
pub fn validate_filter(filter: &Map<String, Value>) -> Result<()> {
    for (key, value) in filter {
        match key.as_str() {
            "$and" | "$or" => {
                let clauses = value.as_array().ok_or_else(|| {
                    StoreError::unsupported(format!("{key} expects an array of filters"))
                })?;
                for clause in clauses {
                    let map = clause.as_object().ok_or_else(|| {
                        StoreError::unsupported(format!("{key} clauses must be objects"))
                    })?;
                    validate_filter(map)?;
                }
            }
            "$not" => {
                let map = value
                    .as_object()
                    .ok_or_else(|| StoreError::unsupported("$not expects a filter object"))?;
                validate_filter(map)?;
            }
            key if key.starts_with('$') => {
                return Err(StoreError::unsupported(format!(
                    "unknown filter operator {key}"
                )));
            }
            _ => {
                if let Value::Object(ops) = value {
                    if ops.keys().any(|k| k.starts_with('$')) {
                        validate_field_operators(key, ops)?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn validate_field_operators(field: &str, ops: &Map<String, Value>) -> Result<()> {
    for (op, value) in ops {
        match op.as_str() {
            "$not" => {
                let inner = value.as_object().ok_or_else(|| {
                    StoreError::unsupported("$not on a field expects an operator object")
                })?;
                validate_field_operators(field, inner)?;
            }
            op if COMPARISON_OPERATORS.contains(&op) => {
                if matches!(op, "$in" | "$nin") && !value.is_array() {
                    return Err(StoreError::unsupported(format!("{op} expects an array")));
                }
            }
            op => {
                return Err(StoreError::unsupported(format!(
                    "unknown operator {op} on field {field}"
                )));
            }
        }
    }
    Ok(())
}

/// Validate a neutral update map against the vocabulary.
///
/// Every top-level key must be an update operator whose value is an object
/// of field assignments, and no assignment may touch a system field.
pub fn validate_update(update: &Map<String, Value>) -> Result<()> {
    if update.is_empty() {
        return Err(StoreError::unsupported("empty update document"));
    }
    for (op, value) in update {
        if !UPDATE_OPERATORS.contains(&op.as_str()) {
            return Err(StoreError::unsupported(format!(
                "unknown update operator {op}"
            )));
        }
        let fields = value
            .as_object()
            .ok_or_else(|| StoreError::unsupported(format!("{op} expects a field map")))?;
        if fields.is_empty() {
            return Err(StoreError::unsupported(format!("{op} has no fields")));
        }
        for (field, value) in fields {
            // The soft-delete marker is repository-managed policy: callers
            // set it to a timestamp or clear it; every other system field
            // stays layer-managed.
            if field == "_deleted_at" && matches!(op.as_str(), "$set" | "$unset") {
                if op == "$set" && !(value.is_null() || value.is_string()) {
                    return Err(StoreError::unsupported(
                        "_deleted_at expects an RFC 3339 timestamp or null",
                    ));
                }
                continue;
            }
            if is_system_field(field) {
                return Err(StoreError::unsupported(format!(
                    "system field {field} is managed by the storage layer"
                )));
            }
        }
        if op == "$inc" {
            for (field, amount) in fields {
                if !amount.is_number() {
                    return Err(StoreError::unsupported(format!(
                        "$inc on {field} expects a numeric amount"
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn accepts_full_vocabulary() {
        let filter = obj(json!({
            "status": { "$in": ["active", "pending"] },
            "price": { "$gt": 1, "$lte": 100 },
            "sku": { "$exists": true },
            "name": { "$regex": "^wid" },
            "$or": [
                { "tier": "gold" },
                { "tier": { "$ne": "free" }, "$and": [{ "region": "eu" }] }
            ],
            "$not": { "archived": true }
        }));
        validate_filter(&filter).unwrap();

        let update = obj(json!({
            "$set": { "price": 12.5 },
            "$unset": { "draft": "" },
            "$inc": { "views": 1 },
            "$push": { "tags": "new" },
            "$pull": { "tags": "old" },
            "$addToSet": { "labels": "a" }
        }));
        validate_update(&update).unwrap();
    }

    #[test]
    fn rejects_unknown_filter_operator() {
        let filter = obj(json!({ "name": { "$near": [0, 0] } }));
        assert!(matches!(
            validate_filter(&filter),
            Err(StoreError::Unsupported(_))
        ));

        let filter = obj(json!({ "$where": "this.x > 1" }));
        assert!(matches!(
            validate_filter(&filter),
            Err(StoreError::Unsupported(_))
        ));
    }

    #[test]
    fn rejects_unknown_update_operator() {
        let update = obj(json!({ "$rename": { "a": "b" } }));
        assert!(matches!(
            validate_update(&update),
            Err(StoreError::Unsupported(_))
        ));
    }

    #[test]
    fn rejects_bare_field_assignment_in_update() {
        // Updates must go through operators; a raw replacement map is not
        // part of the vocabulary.
        let update = obj(json!({ "price": 12.5 }));
        assert!(validate_update(&update).is_err());
    }

    #[test]
    fn rejects_system_field_mutation() {
        let update = obj(json!({ "$set": { "_version": 99 } }));
        assert!(matches!(
            validate_update(&update),
            Err(StoreError::Unsupported(_))
        ));
        let update = obj(json!({ "$inc": { "_version": 1 } }));
        assert!(validate_update(&update).is_err());
    }

    #[test]
    fn soft_delete_marker_is_caller_settable() {
        validate_update(&obj(json!({ "$set": { "_deleted_at": "2026-08-23T00:00:00Z" } })))
            .unwrap();
        validate_update(&obj(json!({ "$set": { "_deleted_at": null } }))).unwrap();
        validate_update(&obj(json!({ "$unset": { "_deleted_at": "" } }))).unwrap();

        // Only $set/$unset, and only with timestamp-shaped values.
        assert!(validate_update(&obj(json!({ "$inc": { "_deleted_at": 1 } }))).is_err());
        assert!(validate_update(&obj(json!({ "$set": { "_deleted_at": 5 } }))).is_err());
    }

    #[test]
    fn rejects_scalar_in_operand() {
        let filter = obj(json!({ "status": { "$in": "active" } }));
        assert!(validate_filter(&filter).is_err());

        let update = obj(json!({ "$inc": { "views": "one" } }));
        assert!(validate_update(&update).is_err());
    }

    #[test]
    fn plain_nested_objects_are_exact_matches() {
        // An object value without $-keys is an exact-match literal.
        let filter = obj(json!({ "dimensions": { "w": 2, "h": 3 } }));
        validate_filter(&filter).unwrap();
    }
}
