//! Rendering of change events as SQL statement text.
//!
//! The output format is a compatibility contract with the replay side, which
//! executes statements verbatim:
//!
//! - inserts end with `;`, updates and deletes do not
//! - identifiers are always double-quoted
//! - tables in the `public` schema are emitted unqualified
//!
//! # Example
//!
//! ```rust
//! use pg_sql_replay::postgres::{ChangeEvent, ChangeKind, Column};
//! use pg_sql_replay::sql::SqlSerializer;
//!
//! let event = ChangeEvent {
//!     kind: ChangeKind::Insert,
//!     schema: "public".to_string(),
//!     table: "users".to_string(),
//!     columns: vec![Column::new("name", "O'Brien", "text")],
//!     old_key: None,
//! };
//!
//! let sql = SqlSerializer::default().render(&event).unwrap();
//! assert_eq!(sql, r#"INSERT INTO "users" ("name") VALUES ('O''Brien');"#);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::postgres::{ChangeEvent, ChangeKind, Column};
use crate::{Error, Result};

const DEFAULT_SCHEMA: &str = "public";

const NUMERIC_TYPE_MARKERS: [&str; 6] = ["int", "numeric", "decimal", "float", "double", "real"];

/// How a column's declared type drives value escaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    Numeric,
    Boolean,
    Other,
}

impl TypeClass {
    /// Classifies a declared type name by substring.
    ///
    /// The match is case-sensitive and numeric markers win over `bool`.
    /// `int` also matches types such as `interval` and `point`, while a quoted
    /// user type like `"STATUS_INT"` stays text.
    pub fn classify(type_name: &str) -> Self {
        if NUMERIC_TYPE_MARKERS.iter().any(|m| type_name.contains(m)) {
            TypeClass::Numeric
        } else if type_name.contains("bool") {
            TypeClass::Boolean
        } else {
            TypeClass::Other
        }
    }
}

/// What to do with a numeric-typed value whose text is not a numeric literal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericLiteralPolicy {
    /// Emit the value verbatim without validation.
    #[default]
    Trust,
    /// Emit malformed values as quoted text literals.
    Quote,
    /// Fail rendering with [`Error::UntrustedNumericLiteral`].
    Reject,
}

/// Renders [`ChangeEvent`]s as SQL statements.
#[derive(Debug, Clone, Default)]
pub struct SqlSerializer {
    require_old_key: bool,
    numeric_policy: NumericLiteralPolicy,
}

impl SqlSerializer {
    pub fn new(require_old_key: bool, numeric_policy: NumericLiteralPolicy) -> Self {
        Self {
            require_old_key,
            numeric_policy,
        }
    }

    /// Renders one change event as one statement.
    pub fn render(&self, event: &ChangeEvent) -> Result<String> {
        match event.kind {
            ChangeKind::Insert => self.render_insert(event),
            ChangeKind::Update => self.render_update(event),
            ChangeKind::Delete => self.render_delete(event),
        }
    }

    fn render_insert(&self, event: &ChangeEvent) -> Result<String> {
        let table = format_table(&event.schema, &event.table);
        let columns = event
            .columns
            .iter()
            .map(|c| quote_identifier(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let values = event
            .columns
            .iter()
            .map(|c| self.escape_value(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        Ok(format!("INSERT INTO {} ({}) VALUES ({});", table, columns, values))
    }

    fn render_update(&self, event: &ChangeEvent) -> Result<String> {
        let table = format_table(&event.schema, &event.table);
        let assignments = self.equalities(&event.columns)?.join(", ");
        let where_clause = self.where_clause(event)?;

        Ok(format!("UPDATE {} SET {}{}", table, assignments, where_clause))
    }

    fn render_delete(&self, event: &ChangeEvent) -> Result<String> {
        let table = format_table(&event.schema, &event.table);
        let where_clause = self.where_clause(event)?;

        Ok(format!("DELETE FROM {}{}", table, where_clause))
    }

    /// Builds ` WHERE k = v AND ...` from the old key, or nothing when the
    /// source sent no replica identity.
    fn where_clause(&self, event: &ChangeEvent) -> Result<String> {
        match &event.old_key {
            Some(keys) => Ok(format!(" WHERE {}", self.equalities(keys)?.join(" AND "))),
            None if self.require_old_key => Err(Error::MissingOldKey {
                table: event.qualified_table(),
                kind: event.kind.to_string(),
            }),
            None => Ok(String::new()),
        }
    }

    fn equalities(&self, columns: &[Column]) -> Result<Vec<String>> {
        columns
            .iter()
            .map(|c| -> Result<String> {
                Ok(format!("{} = {}", quote_identifier(&c.name), self.escape_value(c)?))
            })
            .collect()
    }

    /// Escapes a column value according to its declared type.
    pub fn escape_value(&self, column: &Column) -> Result<String> {
        if column.value.is_null() {
            return Ok("NULL".to_string());
        }

        match TypeClass::classify(&column.type_name) {
            TypeClass::Numeric => {
                let text = value_text(&column.value);
                if self.numeric_policy == NumericLiteralPolicy::Trust || is_numeric_literal(&text) {
                    return Ok(text);
                }
                match self.numeric_policy {
                    NumericLiteralPolicy::Reject => Err(Error::UntrustedNumericLiteral {
                        column: column.name.clone(),
                        value: text,
                    }),
                    _ => Ok(quote_literal(&text)),
                }
            }
            TypeClass::Boolean => Ok(if is_truthy(&column.value) { "TRUE" } else { "FALSE" }.to_string()),
            TypeClass::Other => Ok(quote_literal(&value_text(&column.value))),
        }
    }
}

/// Double-quotes an identifier, doubling any embedded double quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quotes a text literal, doubling any embedded single quotes.
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

pub fn format_table(schema: &str, table: &str) -> String {
    if schema == DEFAULT_SCHEMA {
        quote_identifier(table)
    } else {
        format!("{}.{}", quote_identifier(schema), quote_identifier(table))
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Accepts `[+-]digits[.digits][e[+-]digits]`, with digits required on at
/// least one side of the point.
fn is_numeric_literal(text: &str) -> bool {
    let bytes = text.as_bytes();
    let mut i = 0;

    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        i += 1;
    }

    let int_start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    let mut digits = i - int_start;

    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        let frac_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        digits += i - frac_start;
    }

    if digits == 0 {
        return false;
    }

    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        i += 1;
        if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
            i += 1;
        }
        let exp_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == exp_start {
            return false;
        }
    }

    i == bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: ChangeKind, schema: &str, table: &str, columns: Vec<Column>, old_key: Option<Vec<Column>>) -> ChangeEvent {
        ChangeEvent {
            kind,
            schema: schema.to_string(),
            table: table.to_string(),
            columns,
            old_key,
        }
    }

    fn escape(value: Value, type_name: &str) -> String {
        SqlSerializer::default()
            .escape_value(&Column::new("c", value, type_name))
            .unwrap()
    }

    #[test]
    fn test_type_classification() {
        assert_eq!(TypeClass::classify("integer"), TypeClass::Numeric);
        assert_eq!(TypeClass::classify("bigint"), TypeClass::Numeric);
        assert_eq!(TypeClass::classify("numeric(10,2)"), TypeClass::Numeric);
        assert_eq!(TypeClass::classify("double precision"), TypeClass::Numeric);
        assert_eq!(TypeClass::classify("real"), TypeClass::Numeric);
        assert_eq!(TypeClass::classify("NUMERIC"), TypeClass::Other);
        assert_eq!(TypeClass::classify("boolean"), TypeClass::Boolean);
        assert_eq!(TypeClass::classify("text"), TypeClass::Other);
        assert_eq!(TypeClass::classify("character varying"), TypeClass::Other);
        assert_eq!(TypeClass::classify("timestamp with time zone"), TypeClass::Other);
    }

    #[test]
    fn test_upper_case_custom_type_stays_quoted() {
        assert_eq!(TypeClass::classify("\"STATUS_INT\""), TypeClass::Other);
        assert_eq!(escape(json!("ACTIVE"), "\"STATUS_INT\""), "'ACTIVE'");
        assert_eq!(escape(json!("1; DROP TABLE t"), "\"MY_INT\""), "'1; DROP TABLE t'");
    }

    #[test]
    fn test_value_escaping() {
        assert_eq!(escape(json!("O'Brien"), "text"), "'O''Brien'");
        assert_eq!(escape(json!(42), "integer"), "42");
        assert_eq!(escape(json!("42"), "integer"), "42");
        assert_eq!(escape(json!(3.5), "double precision"), "3.5");
        assert_eq!(escape(json!(true), "boolean"), "TRUE");
        assert_eq!(escape(json!(false), "boolean"), "FALSE");
        assert_eq!(escape(json!("2024-01-01"), "date"), "'2024-01-01'");
    }

    #[test]
    fn test_null_ignores_type() {
        for type_name in ["text", "integer", "boolean", "jsonb"] {
            assert_eq!(escape(Value::Null, type_name), "NULL");
        }
    }

    #[test]
    fn test_boolean_truthiness() {
        assert_eq!(escape(json!(0), "bool"), "FALSE");
        assert_eq!(escape(json!(1), "bool"), "TRUE");
        assert_eq!(escape(json!(""), "bool"), "FALSE");
        assert_eq!(escape(json!("f"), "bool"), "TRUE");
    }

    #[test]
    fn test_non_string_values_as_text() {
        assert_eq!(escape(json!(7), "text"), "'7'");
        assert_eq!(escape(json!({"a": "it's"}), "jsonb"), r#"'{"a":"it''s"}'"#);
    }

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quote_identifier("users"), "\"users\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_identifier("select"), "\"select\"");
    }

    #[test]
    fn test_identifier_quoting_reparses() {
        let name = "a\"b\"\"c";
        let quoted = quote_identifier(name);
        let inner = &quoted[1..quoted.len() - 1];
        assert_eq!(inner.replace("\"\"", "\""), name);
    }

    #[test]
    fn test_table_qualification() {
        assert_eq!(format_table("public", "users"), "\"users\"");
        assert_eq!(format_table("audit", "log"), "\"audit\".\"log\"");
    }

    #[test]
    fn test_render_insert() {
        let e = event(
            ChangeKind::Insert,
            "public",
            "users",
            vec![
                Column::new("id", 1, "integer"),
                Column::new("name", "Ann", "text"),
                Column::new("admin", false, "boolean"),
                Column::new("bio", Value::Null, "text"),
            ],
            None,
        );
        assert_eq!(
            SqlSerializer::default().render(&e).unwrap(),
            r#"INSERT INTO "users" ("id", "name", "admin", "bio") VALUES (1, 'Ann', FALSE, NULL);"#
        );
    }

    #[test]
    fn test_render_update() {
        let e = event(
            ChangeKind::Update,
            "public",
            "users",
            vec![Column::new("id", 7, "integer"), Column::new("email", "a@b.com", "text")],
            Some(vec![Column::new("id", 7, "integer")]),
        );
        assert_eq!(
            SqlSerializer::default().render(&e).unwrap(),
            r#"UPDATE "users" SET "id" = 7, "email" = 'a@b.com' WHERE "id" = 7"#
        );
    }

    #[test]
    fn test_render_update_composite_key_in_other_schema() {
        let e = event(
            ChangeKind::Update,
            "billing",
            "lines",
            vec![Column::new("qty", 3, "integer")],
            Some(vec![Column::new("order_id", 9, "bigint"), Column::new("sku", "X-1", "text")]),
        );
        assert_eq!(
            SqlSerializer::default().render(&e).unwrap(),
            r#"UPDATE "billing"."lines" SET "qty" = 3 WHERE "order_id" = 9 AND "sku" = 'X-1'"#
        );
    }

    #[test]
    fn test_render_update_without_old_key_updates_every_row() {
        let e = event(
            ChangeKind::Update,
            "public",
            "flags",
            vec![Column::new("on", true, "boolean")],
            None,
        );
        assert_eq!(SqlSerializer::default().render(&e).unwrap(), r#"UPDATE "flags" SET "on" = TRUE"#);
    }

    #[test]
    fn test_render_delete() {
        let e = event(
            ChangeKind::Delete,
            "public",
            "users",
            vec![],
            Some(vec![Column::new("id", 7, "integer")]),
        );
        assert_eq!(SqlSerializer::default().render(&e).unwrap(), r#"DELETE FROM "users" WHERE "id" = 7"#);
    }

    #[test]
    fn test_render_delete_without_old_key() {
        let e = event(ChangeKind::Delete, "public", "sessions", vec![], None);
        assert_eq!(SqlSerializer::default().render(&e).unwrap(), r#"DELETE FROM "sessions""#);
    }

    #[test]
    fn test_require_old_key_fails_fast() {
        let serializer = SqlSerializer::new(true, NumericLiteralPolicy::Trust);
        let e = event(ChangeKind::Delete, "public", "sessions", vec![], None);

        match serializer.render(&e) {
            Err(Error::MissingOldKey { table, kind }) => {
                assert_eq!(table, "public.sessions");
                assert_eq!(kind, "delete");
            }
            other => panic!("Expected MissingOldKey, got {:?}", other),
        }

        let insert = event(ChangeKind::Insert, "public", "t", vec![Column::new("a", 1, "int")], None);
        assert!(serializer.render(&insert).is_ok());
    }

    #[test]
    fn test_numeric_literal_detection() {
        for ok in ["0", "-12", "+3.25", ".5", "5.", "1e10", "6.02E+23", "-1.5e-3"] {
            assert!(is_numeric_literal(ok), "{} should be numeric", ok);
        }
        for bad in ["", "-", ".", "1e", "1 day", "NaN", "1; DROP TABLE users", "0x1F"] {
            assert!(!is_numeric_literal(bad), "{} should not be numeric", bad);
        }
    }

    #[test]
    fn test_trusted_numeric_is_verbatim() {
        assert_eq!(escape(json!("1; DROP TABLE users"), "integer"), "1; DROP TABLE users");
    }

    #[test]
    fn test_quote_policy_quotes_malformed_numeric() {
        let serializer = SqlSerializer::new(false, NumericLiteralPolicy::Quote);
        let bad = Column::new("n", "1'; DROP TABLE users", "integer");
        assert_eq!(serializer.escape_value(&bad).unwrap(), "'1''; DROP TABLE users'");

        let interval = Column::new("d", "1 day", "interval");
        assert_eq!(serializer.escape_value(&interval).unwrap(), "'1 day'");

        let good = Column::new("n", 12, "integer");
        assert_eq!(serializer.escape_value(&good).unwrap(), "12");
    }

    #[test]
    fn test_reject_policy() {
        let serializer = SqlSerializer::new(false, NumericLiteralPolicy::Reject);
        let bad = Column::new("n", "NaN", "numeric");
        assert!(matches!(
            serializer.escape_value(&bad),
            Err(Error::UntrustedNumericLiteral { .. })
        ));
    }
}
