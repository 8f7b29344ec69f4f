//! Index Introspection
//!
//! Postgres keeps no structured metadata this layer can read back into
//! neutral descriptors, so `list_indexes` reverse-engineers them from the
//! textual definitions in `pg_indexes.indexdef`. Creation is precise;
//! introspection is best-effort by design:
//!
//! 1. JSON-accessor syntax (`data ->> 'field'` / `data -> 'field'`) yields
//!    the quoted payload fields.
//! 2. Otherwise the parenthesized list after the `USING <method>` keyword
//!    yields columns, honoring explicit DESC suffixes.
//! 3. Otherwise a `_pkey` name suffix implies the system id field.
//!
//! Anything else degrades to an empty-keys descriptor rather than hiding
//! the rest of the listing. Indexes created by tooling outside this layer
//! (multi-expression functional indexes, operator classes, non-`data`
//! expressions) are known blind spots of this heuristic.

use crate::store::{Index, Order};
use regex::Regex;
use std::sync::OnceLock;

fn payload_accessor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"data\s*->>?\s*'([^']+)'").expect("static regex"))
}

fn index_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^CREATE\s+(UNIQUE\s+)?INDEX\s+(?:IF\s+NOT\s+EXISTS\s+)?(\S+)\s+ON\b")
            .expect("static regex")
    })
}

fn using_clause_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Captures the index method and everything inside its outer parens.
    RE.get_or_init(|| Regex::new(r"(?is)\bUSING\s+(\w+)\s*\((.*)\)").expect("static regex"))
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*").expect("static regex"))
}

/// Reconstruct a neutral descriptor from one `pg_indexes.indexdef` string.
///
/// Never fails: a definition outside the heuristic's reach produces a
/// descriptor with the parsed name and empty keys.
pub fn parse_index_def(indexdef: &str) -> Index {
    let (unique, name) = match index_name_re().captures(indexdef) {
        Some(caps) => (
            caps.get(1).is_some(),
            caps.get(2).map(|m| strip_quotes(m.as_str())).unwrap_or_default(),
        ),
        None => (false, String::new()),
    };

    let keys = parse_keys(indexdef, &name);
    if keys.is_empty() {
        tracing::warn!(index = %name, "could not parse index definition; returning empty keys");
    }

    Index {
        name,
        keys,
        unique,
        sparse: indexdef.to_ascii_uppercase().contains(" WHERE "),
        ttl: None,
    }
}

fn parse_keys(indexdef: &str, name: &str) -> Vec<(String, Order)> {
    // Heuristic (1): JSON payload accessors anywhere in the definition.
    let payload: Vec<(String, Order)> = payload_accessor_re()
        .captures_iter(indexdef)
        .map(|caps| {
            let field = caps[1].to_string();
            let tail_start = caps.get(0).map(|m| m.end()).unwrap_or(0);
            (field, direction_of_segment(&indexdef[tail_start..]))
        })
        .collect();
    if !payload.is_empty() {
        return payload;
    }

    // Heuristic (2): plain column list after the index method keyword.
    if let Some(caps) = using_clause_re().captures(indexdef) {
        let columns: Vec<(String, Order)> = split_top_level(&caps[2])
            .iter()
            .filter_map(|item| parse_column_item(item))
            .collect();
        if !columns.is_empty() {
            return columns;
        }
    }

    // Heuristic (3): conventional name suffixes.
    if name.ends_with("_pkey") {
        return vec![("_id".to_string(), Order::Ascending)];
    }

    Vec::new()
}

/// DESC applies if it appears in the segment before the next column starts.
fn direction_of_segment(tail: &str) -> Order {
    let segment = tail.split(',').next().unwrap_or("");
    if segment.to_ascii_uppercase().contains("DESC") {
        Order::Descending
    } else {
        Order::Ascending
    }
}

/// Split a column list on commas that are not nested inside parentheses.
fn split_top_level(list: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in list.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                items.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        items.push(current.trim().to_string());
    }
    items
}

fn parse_column_item(item: &str) -> Option<(String, Order)> {
    let trimmed = item.trim().trim_start_matches('"');
    let ident = identifier_re().find(trimmed)?.as_str();
    let order = if item.to_ascii_uppercase().contains(" DESC") {
        Order::Descending
    } else {
        Order::Ascending
    };
    // The physical primary-key column surfaces under its neutral name.
    let field = if ident == "id" { "_id" } else { ident };
    Some((field.to_string(), order))
}

fn strip_quotes(name: &str) -> String {
    name.trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gin_payload_index() {
        let index = parse_index_def(
            "CREATE INDEX tags_idx ON public.products USING gin (((data -> 'tags')))",
        );
        assert_eq!(index.name, "tags_idx");
        assert_eq!(index.keys, vec![("tags".to_string(), Order::Ascending)]);
        assert!(!index.unique);
    }

    #[test]
    fn parses_unique_expression_index() {
        let index = parse_index_def(
            "CREATE UNIQUE INDEX email_unique ON public.users USING btree (((data ->> 'email'::text)))",
        );
        assert_eq!(index.name, "email_unique");
        assert_eq!(index.keys, vec![("email".to_string(), Order::Ascending)]);
        assert!(index.unique);
    }

    #[test]
    fn parses_descending_payload_expression() {
        let index = parse_index_def(
            "CREATE INDEX price_desc ON public.products USING btree (((data ->> 'price'::text)) DESC)",
        );
        assert_eq!(index.keys, vec![("price".to_string(), Order::Descending)]);
    }

    #[test]
    fn parses_multi_column_btree_with_directions() {
        let index = parse_index_def(
            "CREATE INDEX recent ON public.orders USING btree (_created_at DESC, _version)",
        );
        assert_eq!(
            index.keys,
            vec![
                ("_created_at".to_string(), Order::Descending),
                ("_version".to_string(), Order::Ascending),
            ]
        );
    }

    #[test]
    fn primary_key_column_maps_to_neutral_id() {
        let index = parse_index_def(
            "CREATE UNIQUE INDEX products_pkey ON public.products USING btree (id)",
        );
        assert_eq!(index.name, "products_pkey");
        assert_eq!(index.keys, vec![("_id".to_string(), Order::Ascending)]);
        assert!(index.unique);
    }

    #[test]
    fn pkey_name_suffix_is_the_last_resort() {
        // No USING clause and no payload accessor: the name carries it.
        let index = parse_index_def("CREATE UNIQUE INDEX widgets_pkey ON widgets");
        assert_eq!(index.keys, vec![("_id".to_string(), Order::Ascending)]);
    }

    #[test]
    fn unparseable_definition_degrades_to_empty_keys() {
        // A functional index over something other than the payload column
        // is a documented blind spot.
        let index = parse_index_def(
            "CREATE INDEX odd_idx ON public.products USING btree ((lower(other_col::text)))",
        );
        assert_eq!(index.name, "odd_idx");
        assert!(index.keys.is_empty());

        let index = parse_index_def("CREATE INDEX weird ON t USING btree ((1 + 1))");
        assert_eq!(index.name, "weird");
        assert!(index.keys.is_empty());
    }

    #[test]
    fn partial_index_marks_sparse() {
        let index = parse_index_def(
            "CREATE UNIQUE INDEX email_unique ON users USING btree (((data ->> 'email'::text))) WHERE (data ? 'email'::text)",
        );
        assert!(index.sparse);
    }

    #[test]
    fn round_trips_generated_ddl() {
        // What create_index_sql emits must come back equivalent.
        let created = super::super::sql::create_index_sql(
            "products",
            &crate::store::Index::on_field("email_unique", "email").unique(),
        )
        .unwrap();
        let listed = parse_index_def(&created);
        assert_eq!(listed.name, "email_unique");
        assert_eq!(listed.keys, vec![("email".to_string(), Order::Ascending)]);
        assert!(listed.unique);
    }
}
