//! Neutral-to-SQL Translation
//!
//! Pure functions that turn validated neutral filters, updates, sort specs,
//! and aggregation pipelines into SQL text plus an ordered bind-parameter
//! list over the per-collection table layout: system columns next to one
//! `data` JSONB payload column. Everything here is deterministic and
//! unit-tested without a live database.
//!
//! Field names are embedded in generated SQL as JSON path literals, so they
//! are validated to `[A-Za-z0-9_]` first; anything else is rejected before
//! SQL is produced.

use crate::error::{Result, StoreError};
use crate::store::{Document, Index, Order};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Columns selected for every document read, in row order.
pub const DOCUMENT_COLUMNS: &str =
    "id, data, _created_by, _updated_by, _created_at, _updated_at, _version, _deleted_at";

/// A typed bind parameter accompanying generated SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Json(Value),
    Text(String),
    TextArray(Vec<String>),
    Uuid(Uuid),
    UuidArray(Vec<Uuid>),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
}

/// Reject field names that cannot be embedded as JSON path literals.
pub fn validate_field_name(field: &str) -> Result<()> {
    if field.is_empty()
        || !field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(StoreError::unsupported(format!(
            "field name {field:?} cannot be translated to SQL"
        )));
    }
    Ok(())
}

/// Lower-case a logical collection name and replace non-alphanumerics to
/// form the physical table name. Distinct logical names that sanitize to
/// the same table are a configuration error, detected by the adapter's
/// name registry.
pub fn sanitize_table_name(logical: &str) -> String {
    let mut table: String = logical
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if !table
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic())
    {
        table.insert_str(0, "t_");
    }
    table
}

/// How a neutral field lands in the table.
enum FieldTarget {
    /// Non-system field inside the `data` payload column
    Payload(String),
    /// System field backed by a typed column
    Column(&'static str, ColumnType),
}

#[derive(Clone, Copy)]
enum ColumnType {
    Uuid,
    Int,
    Timestamp,
    Text,
}

fn field_target(field: &str) -> Result<FieldTarget> {
    Ok(match field {
        "_id" => FieldTarget::Column("id", ColumnType::Uuid),
        "_version" => FieldTarget::Column("_version", ColumnType::Int),
        "_created_at" => FieldTarget::Column("_created_at", ColumnType::Timestamp),
        "_updated_at" => FieldTarget::Column("_updated_at", ColumnType::Timestamp),
        "_deleted_at" => FieldTarget::Column("_deleted_at", ColumnType::Timestamp),
        "_created_by" => FieldTarget::Column("_created_by", ColumnType::Text),
        "_updated_by" => FieldTarget::Column("_updated_by", ColumnType::Text),
        other => {
            validate_field_name(other)?;
            FieldTarget::Payload(other.to_string())
        }
    })
}

fn push_param(params: &mut Vec<SqlParam>, param: SqlParam) -> String {
    params.push(param);
    format!("${}", params.len())
}

fn column_param(column_type: ColumnType, value: &Value) -> Result<SqlParam> {
    Ok(match column_type {
        ColumnType::Uuid => {
            let text = value
                .as_str()
                .ok_or_else(|| StoreError::InvalidId(value.to_string()))?;
            SqlParam::Uuid(
                Uuid::parse_str(text).map_err(|_| StoreError::InvalidId(text.to_string()))?,
            )
        }
        ColumnType::Int => SqlParam::Int(
            value
                .as_i64()
                .ok_or_else(|| StoreError::unsupported("expected an integer value"))?,
        ),
        ColumnType::Timestamp => {
            let text = value
                .as_str()
                .ok_or_else(|| StoreError::unsupported("expected an RFC 3339 timestamp"))?;
            SqlParam::Timestamp(
                DateTime::parse_from_rfc3339(text)
                    .map_err(|e| StoreError::unsupported(format!("bad timestamp: {e}")))?
                    .with_timezone(&Utc),
            )
        }
        ColumnType::Text => SqlParam::Text(
            value
                .as_str()
                .ok_or_else(|| StoreError::unsupported("expected a string value"))?
                .to_string(),
        ),
    })
}

/// Translate a validated neutral filter into a WHERE predicate.
///
/// An empty filter matches everything and yields `TRUE`.
pub fn filter_to_where(filter: &Document, params: &mut Vec<SqlParam>) -> Result<String> {
    if filter.is_empty() {
        return Ok("TRUE".to_string());
    }

    let mut predicates = Vec::with_capacity(filter.len());
    for (key, value) in filter {
        match key.as_str() {
            "$and" | "$or" => {
                let joiner = if key == "$and" { " AND " } else { " OR " };
                let clauses = value.as_array().expect("validated by ops");
                let mut parts = Vec::with_capacity(clauses.len());
                for clause in clauses {
                    let map = clause.as_object().expect("validated by ops");
                    parts.push(format!("({})", filter_to_where(map, params)?));
                }
                predicates.push(format!("({})", parts.join(joiner)));
            }
            "$not" => {
                let map = value.as_object().expect("validated by ops");
                predicates.push(format!("NOT ({})", filter_to_where(map, params)?));
            }
            field => {
                predicates.push(field_predicate(field, value, params)?);
            }
        }
    }
    Ok(predicates.join(" AND "))
}

fn field_predicate(field: &str, value: &Value, params: &mut Vec<SqlParam>) -> Result<String> {
    let target = field_target(field)?;
    match value {
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            let mut parts = Vec::with_capacity(ops.len());
            for (op, operand) in ops {
                parts.push(operator_predicate(&target, op, operand, params)?);
            }
            Ok(parts.join(" AND "))
        }
        other => operator_predicate(&target, "$eq", other, params),
    }
}

fn operator_predicate(
    target: &FieldTarget,
    op: &str,
    operand: &Value,
    params: &mut Vec<SqlParam>,
) -> Result<String> {
    match target {
        FieldTarget::Payload(field) => payload_predicate(field, op, operand, params),
        FieldTarget::Column(column, column_type) => {
            column_predicate(column, *column_type, op, operand, params)
        }
    }
}

fn payload_predicate(
    field: &str,
    op: &str,
    operand: &Value,
    params: &mut Vec<SqlParam>,
) -> Result<String> {
    let access = format!("data->'{field}'");
    Ok(match op {
        "$eq" => {
            if operand.is_null() {
                // Null equality matches both an explicit null and a missing
                // field, mirroring the document backend.
                format!("({access} = 'null'::jsonb OR NOT data ? '{field}')")
            } else {
                let p = push_param(params, SqlParam::Json(operand.clone()));
                format!("{access} = {p}")
            }
        }
        "$ne" => {
            let p = push_param(params, SqlParam::Json(operand.clone()));
            format!("{access} IS DISTINCT FROM {p}")
        }
        "$gt" | "$gte" | "$lt" | "$lte" => {
            let sql_op = match op {
                "$gt" => ">",
                "$gte" => ">=",
                "$lt" => "<",
                _ => "<=",
            };
            let p = push_param(params, SqlParam::Json(operand.clone()));
            format!("{access} {sql_op} {p}")
        }
        "$in" => {
            let p = push_param(params, SqlParam::Json(operand.clone()));
            format!("{access} IN (SELECT jsonb_array_elements({p}))")
        }
        "$nin" => {
            let p = push_param(params, SqlParam::Json(operand.clone()));
            format!(
                "(NOT data ? '{field}' OR {access} NOT IN (SELECT jsonb_array_elements({p})))"
            )
        }
        "$exists" => {
            if operand.as_bool().unwrap_or(false) {
                format!("data ? '{field}'")
            } else {
                format!("NOT data ? '{field}'")
            }
        }
        "$regex" => {
            let pattern = operand
                .as_str()
                .ok_or_else(|| StoreError::unsupported("$regex expects a string pattern"))?;
            let p = push_param(params, SqlParam::Text(pattern.to_string()));
            format!("data->>'{field}' ~ {p}")
        }
        "$not" => {
            let inner = operand.as_object().expect("validated by ops");
            let mut parts = Vec::with_capacity(inner.len());
            for (inner_op, inner_operand) in inner {
                parts.push(payload_predicate(field, inner_op, inner_operand, params)?);
            }
            format!("NOT ({})", parts.join(" AND "))
        }
        other => {
            return Err(StoreError::unsupported(format!(
                "operator {other} has no SQL translation"
            )))
        }
    })
}

fn column_predicate(
    column: &str,
    column_type: ColumnType,
    op: &str,
    operand: &Value,
    params: &mut Vec<SqlParam>,
) -> Result<String> {
    Ok(match op {
        "$eq" if operand.is_null() => format!("{column} IS NULL"),
        "$ne" if operand.is_null() => format!("{column} IS NOT NULL"),
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
            let sql_op = match op {
                "$eq" => "=",
                "$ne" => "<>",
                "$gt" => ">",
                "$gte" => ">=",
                "$lt" => "<",
                _ => "<=",
            };
            let p = push_param(params, column_param(column_type, operand)?);
            format!("{column} {sql_op} {p}")
        }
        "$in" | "$nin" => {
            let items = operand.as_array().expect("validated by ops");
            let array_param = match column_type {
                ColumnType::Uuid => {
                    let mut ids = Vec::with_capacity(items.len());
                    for item in items {
                        let text = item
                            .as_str()
                            .ok_or_else(|| StoreError::InvalidId(item.to_string()))?;
                        ids.push(
                            Uuid::parse_str(text)
                                .map_err(|_| StoreError::InvalidId(text.to_string()))?,
                        );
                    }
                    SqlParam::UuidArray(ids)
                }
                ColumnType::Text => SqlParam::TextArray(
                    items
                        .iter()
                        .map(|item| {
                            item.as_str().map(str::to_string).ok_or_else(|| {
                                StoreError::unsupported("expected string values in array")
                            })
                        })
                        .collect::<Result<_>>()?,
                ),
                _ => {
                    return Err(StoreError::unsupported(format!(
                        "{op} is not supported on column {column}"
                    )))
                }
            };
            let p = push_param(params, array_param);
            if op == "$in" {
                format!("{column} = ANY({p})")
            } else {
                format!("{column} <> ALL({p})")
            }
        }
        "$exists" => {
            if operand.as_bool().unwrap_or(false) {
                format!("{column} IS NOT NULL")
            } else {
                format!("{column} IS NULL")
            }
        }
        "$regex" => {
            let pattern = operand
                .as_str()
                .ok_or_else(|| StoreError::unsupported("$regex expects a string pattern"))?;
            let p = push_param(params, SqlParam::Text(pattern.to_string()));
            format!("{column}::text ~ {p}")
        }
        other => {
            return Err(StoreError::unsupported(format!(
                "operator {other} is not supported on system field {column}"
            )))
        }
    })
}

/// Translate a validated neutral update into the SET-clause assignments of
/// an UPDATE statement. Payload operators compose a jsonb expression over
/// the current `data` column left to right; `$set`/`$unset` of the
/// soft-delete marker assign its typed column instead. `_version` and
/// `_updated_at` are maintained by the row trigger, not here.
pub fn update_assignments(update: &Document, params: &mut Vec<SqlParam>) -> Result<String> {
    let mut expr = "data".to_string();
    let mut columns: Vec<String> = Vec::new();
    for (op, value) in update {
        let fields = value.as_object().expect("validated by ops");
        match op.as_str() {
            "$set" => {
                let mut payload = Document::new();
                for (field, item) in fields {
                    if field == "_deleted_at" {
                        if item.is_null() {
                            columns.push("_deleted_at = NULL".to_string());
                        } else {
                            let p =
                                push_param(params, column_param(ColumnType::Timestamp, item)?);
                            columns.push(format!("_deleted_at = {p}"));
                        }
                    } else {
                        payload.insert(field.clone(), item.clone());
                    }
                }
                if !payload.is_empty() {
                    let p = push_param(params, SqlParam::Json(Value::Object(payload)));
                    expr = format!("({expr} || {p})");
                }
            }
            "$unset" => {
                let mut keys = Vec::new();
                for field in fields.keys() {
                    if field == "_deleted_at" {
                        columns.push("_deleted_at = NULL".to_string());
                    } else {
                        validate_field_name(field)?;
                        keys.push(field.clone());
                    }
                }
                if !keys.is_empty() {
                    let p = push_param(params, SqlParam::TextArray(keys));
                    expr = format!("({expr} - {p})");
                }
            }
            "$inc" => {
                for (field, amount) in fields {
                    validate_field_name(field)?;
                    // Integer amounts stay integers so the document backend
                    // and this one render the same JSON number.
                    let p = match amount.as_i64() {
                        Some(int) => push_param(params, SqlParam::Int(int)),
                        None => push_param(
                            params,
                            SqlParam::Float(amount.as_f64().expect("validated by ops")),
                        ),
                    };
                    expr = format!(
                        "jsonb_set({expr}, '{{{field}}}', \
                         to_jsonb(COALESCE(({expr}->>'{field}')::numeric, 0) + {p}))"
                    );
                }
            }
            "$push" => {
                for (field, element) in fields {
                    validate_field_name(field)?;
                    let p = push_param(params, SqlParam::Json(element.clone()));
                    expr = format!(
                        "jsonb_set({expr}, '{{{field}}}', \
                         COALESCE({expr}->'{field}', '[]'::jsonb) || jsonb_build_array({p}))"
                    );
                }
            }
            "$pull" => {
                for (field, element) in fields {
                    validate_field_name(field)?;
                    let p = push_param(params, SqlParam::Json(element.clone()));
                    expr = format!(
                        "jsonb_set({expr}, '{{{field}}}', \
                         (SELECT COALESCE(jsonb_agg(elem), '[]'::jsonb) \
                          FROM jsonb_array_elements(COALESCE({expr}->'{field}', '[]'::jsonb)) AS elem \
                          WHERE elem IS DISTINCT FROM {p}))"
                    );
                }
            }
            "$addToSet" => {
                for (field, element) in fields {
                    validate_field_name(field)?;
                    let p = push_param(params, SqlParam::Json(element.clone()));
                    expr = format!(
                        "(CASE WHEN COALESCE({expr}->'{field}', '[]'::jsonb) \
                           @> jsonb_build_array({p}) THEN {expr} \
                         ELSE jsonb_set({expr}, '{{{field}}}', \
                           COALESCE({expr}->'{field}', '[]'::jsonb) || jsonb_build_array({p})) \
                         END)"
                    );
                }
            }
            other => {
                return Err(StoreError::unsupported(format!(
                    "update operator {other} has no SQL translation"
                )))
            }
        }
    }

    let mut assignments = format!("data = {expr}");
    for column in columns {
        assignments.push_str(", ");
        assignments.push_str(&column);
    }
    Ok(assignments)
}

/// Build an ORDER BY clause (without the keyword) from neutral sort keys.
pub fn sort_clause(sort: &[(String, Order)]) -> Result<String> {
    let mut parts = Vec::with_capacity(sort.len());
    for (field, order) in sort {
        let direction = match order {
            Order::Ascending => "ASC",
            Order::Descending => "DESC",
        };
        let expr = match field_target(field)? {
            FieldTarget::Payload(name) => format!("data->'{name}'"),
            FieldTarget::Column(column, _) => column.to_string(),
        };
        parts.push(format!("{expr} {direction}"));
    }
    Ok(parts.join(", "))
}

/// DDL for one collection table. Identity, payload, and the layer-managed
/// system columns; `_version` starts at 1 and is bumped by the row trigger.
pub fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n\
         \x20   id UUID PRIMARY KEY DEFAULT gen_random_uuid(),\n\
         \x20   data JSONB NOT NULL DEFAULT '{{}}',\n\
         \x20   _created_by TEXT,\n\
         \x20   _updated_by TEXT,\n\
         \x20   _created_at TIMESTAMPTZ NOT NULL DEFAULT now(),\n\
         \x20   _updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),\n\
         \x20   _version BIGINT NOT NULL DEFAULT 1,\n\
         \x20   _deleted_at TIMESTAMPTZ\n\
         )"
    )
}

/// The shared trigger function that maintains `_updated_at` and `_version`
/// on every row update, so version correctness never depends on call sites.
pub fn trigger_function_sql() -> &'static str {
    "CREATE OR REPLACE FUNCTION dualstore_touch_row() RETURNS trigger AS $$\n\
     BEGIN\n\
         NEW._updated_at := now();\n\
         NEW._version := OLD._version + 1;\n\
         RETURN NEW;\n\
     END;\n\
     $$ LANGUAGE plpgsql"
}

/// Statements attaching the touch trigger to one table. Postgres has no
/// CREATE TRIGGER IF NOT EXISTS, so the pair drops then recreates.
pub fn attach_trigger_sql(table: &str) -> [String; 2] {
    [
        format!("DROP TRIGGER IF EXISTS {table}_touch ON {table}"),
        format!(
            "CREATE TRIGGER {table}_touch BEFORE UPDATE ON {table} \
             FOR EACH ROW EXECUTE FUNCTION dualstore_touch_row()"
        ),
    ]
}

/// Translate an index descriptor into CREATE INDEX DDL.
///
/// Payload keys become expression indexes: GIN over `data->'field'` for the
/// plain single-key case, a B-tree over `data->>'field'` when uniqueness or
/// compound keys require B-tree semantics. System keys index their columns
/// directly. Sparse descriptors over payload keys gain a partial-index
/// predicate requiring the fields to exist.
pub fn create_index_sql(table: &str, index: &Index) -> Result<String> {
    if index.keys.is_empty() {
        return Err(StoreError::unsupported("index descriptor has no keys"));
    }
    validate_field_name(&index.name)?;

    let mut payload_fields = Vec::new();
    let mut terms = Vec::with_capacity(index.keys.len());
    for (field, order) in &index.keys {
        let direction = match order {
            Order::Ascending => "",
            Order::Descending => " DESC",
        };
        match field_target(field)? {
            FieldTarget::Payload(name) => {
                payload_fields.push(name.clone());
                terms.push(format!("(data->>'{name}'){direction}"));
            }
            FieldTarget::Column(column, _) => terms.push(format!("{column}{direction}")),
        }
    }

    let unique = if index.unique { "UNIQUE " } else { "" };
    let name = &index.name;

    // Single non-unique payload key: GIN over the jsonb path.
    let mut sql = if payload_fields.len() == 1 && index.keys.len() == 1 && !index.unique {
        format!(
            "CREATE INDEX IF NOT EXISTS {name} ON {table} USING gin ((data->'{field}'))",
            field = payload_fields[0]
        )
    } else {
        format!(
            "CREATE {unique}INDEX IF NOT EXISTS {name} ON {table} ({})",
            terms.join(", ")
        )
    };

    if index.sparse && !payload_fields.is_empty() {
        let existence: Vec<String> = payload_fields
            .iter()
            .map(|field| format!("data ? '{field}'"))
            .collect();
        sql.push_str(&format!(" WHERE {}", existence.join(" AND ")));
    }

    Ok(sql)
}

/// Translate a minimal aggregation pipeline into one SELECT.
///
/// Supported stages: `$match`, `$sort`, `$skip`, `$limit`, `$count`. Any
/// other stage fails with `Unsupported` before SQL is issued.
pub fn pipeline_to_select(
    table: &str,
    pipeline: &[Document],
    params: &mut Vec<SqlParam>,
) -> Result<(String, Option<String>)> {
    let mut where_sql = "TRUE".to_string();
    let mut order_sql = None;
    let mut limit = None;
    let mut skip = None;
    let mut count_field = None;

    for stage in pipeline {
        let (name, spec) = stage
            .iter()
            .next()
            .ok_or_else(|| StoreError::unsupported("empty aggregation stage"))?;
        match name.as_str() {
            "$match" => {
                let filter = spec
                    .as_object()
                    .ok_or_else(|| StoreError::unsupported("$match expects a filter object"))?;
                crate::ops::validate_filter(filter)?;
                where_sql = filter_to_where(filter, params)?;
            }
            "$sort" => {
                let spec = spec
                    .as_object()
                    .ok_or_else(|| StoreError::unsupported("$sort expects a field map"))?;
                let keys: Vec<(String, Order)> = spec
                    .iter()
                    .map(|(field, dir)| {
                        (
                            field.clone(),
                            Order::from_i32(dir.as_i64().unwrap_or(1) as i32),
                        )
                    })
                    .collect();
                order_sql = Some(sort_clause(&keys)?);
            }
            "$skip" => {
                skip = Some(spec.as_u64().ok_or_else(|| {
                    StoreError::unsupported("$skip expects a non-negative integer")
                })?);
            }
            "$limit" => {
                limit = Some(spec.as_u64().ok_or_else(|| {
                    StoreError::unsupported("$limit expects a non-negative integer")
                })?);
            }
            "$count" => {
                let field = spec
                    .as_str()
                    .ok_or_else(|| StoreError::unsupported("$count expects a field name"))?;
                validate_field_name(field)?;
                count_field = Some(field.to_string());
            }
            other => {
                return Err(StoreError::unsupported(format!(
                    "aggregation stage {other} is not supported on the relational backend"
                )))
            }
        }
    }

    let mut sql = if count_field.is_some() {
        format!("SELECT COUNT(*) AS count FROM {table} WHERE {where_sql}")
    } else {
        format!("SELECT {DOCUMENT_COLUMNS} FROM {table} WHERE {where_sql}")
    };
    if count_field.is_none() {
        if let Some(order) = order_sql {
            sql.push_str(&format!(" ORDER BY {order}"));
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(skip) = skip {
            sql.push_str(&format!(" OFFSET {skip}"));
        }
    }
    Ok((sql, count_field))
}
