//! SQL literal encoding for catalog statistics.
//!
//! Catalog rows arrive as untyped JSON. Re-inserting them requires literal
//! text the server will parse back into exactly the same catalog values, so
//! every field is rendered with an explicit type. The encoding chosen for a
//! field depends on its name (see [`FieldRole`]) and on a declared type that
//! comes from the static column contract below, or, for representative
//! values, from the statisticized column's own runtime type.
//!
//! Field order is never taken from the decoded JSON. Composite records are
//! rebuilt positionally from [`composite_columns`].

use anyhow::{bail, Result};
use serde_json::Value;

use crate::version::VersionEpoch;

/// Element type used for representative values inside per-expression
/// statistics. The real expression result type is not captured, so non-integer
/// expressions replay with the wrong element type.
pub const EXPRESSION_VALUES_ELEMENT_TYPE: &str = "pg_catalog.int4";

/// Catalog type of a representative-values column; also the type of its nulls.
const VALUES_ARRAY_TYPE: &str = "anyarray";
/// Composite type of one per-expression statistics record.
const EXPRESSION_RECORD_TYPE: &str = "pg_statistic";

/// Declared SQL type of one statistic column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Same type for every row.
    Fixed(&'static str),
    /// Element type of the statisticized column, resolved per row.
    RuntimeElement,
}

/// One entry of the positional statistic column contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatColumn {
    pub name: &'static str,
    pub ty: ColumnType,
}

impl StatColumn {
    const fn fixed(name: &'static str, ty: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::Fixed(ty),
        }
    }

    const fn runtime(name: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::RuntimeElement,
        }
    }

    /// Resolves the declared type against a row's runtime element type.
    pub fn declared_type<'a>(&self, runtime_type: &'a str) -> &'a str {
        match self.ty {
            ColumnType::Fixed(ty) => ty,
            ColumnType::RuntimeElement => runtime_type,
        }
    }
}

/// Identity columns that lead a composite `pg_statistic` record.
const RECORD_KEY_COLUMNS: &[StatColumn] = &[
    StatColumn::fixed("starelid", "oid"),
    StatColumn::fixed("staattnum", "smallint"),
];

const SCALAR_COLUMNS: &[StatColumn] = &[
    StatColumn::fixed("stainherit", "boolean"),
    StatColumn::fixed("stanullfrac", "real"),
    StatColumn::fixed("stawidth", "integer"),
    StatColumn::fixed("stadistinct", "real"),
    StatColumn::fixed("stakind1", "smallint"),
    StatColumn::fixed("stakind2", "smallint"),
    StatColumn::fixed("stakind3", "smallint"),
    StatColumn::fixed("stakind4", "smallint"),
    StatColumn::fixed("stakind5", "smallint"),
    StatColumn::fixed("staop1", "oid"),
    StatColumn::fixed("staop2", "oid"),
    StatColumn::fixed("staop3", "oid"),
    StatColumn::fixed("staop4", "oid"),
    StatColumn::fixed("staop5", "oid"),
];

const COLLATION_COLUMNS: &[StatColumn] = &[
    StatColumn::fixed("stacoll1", "oid"),
    StatColumn::fixed("stacoll2", "oid"),
    StatColumn::fixed("stacoll3", "oid"),
    StatColumn::fixed("stacoll4", "oid"),
    StatColumn::fixed("stacoll5", "oid"),
];

const ARRAY_COLUMNS: &[StatColumn] = &[
    StatColumn::fixed("stanumbers1", "real[]"),
    StatColumn::fixed("stanumbers2", "real[]"),
    StatColumn::fixed("stanumbers3", "real[]"),
    StatColumn::fixed("stanumbers4", "real[]"),
    StatColumn::fixed("stanumbers5", "real[]"),
    StatColumn::runtime("stavalues1"),
    StatColumn::runtime("stavalues2"),
    StatColumn::runtime("stavalues3"),
    StatColumn::runtime("stavalues4"),
    StatColumn::runtime("stavalues5"),
];

/// Number of statistic slots per row.
pub const STAT_SLOTS: usize = 5;

/// Statistic columns after `(starelid, staattnum)`, in catalog order.
pub fn statistic_columns(epoch: VersionEpoch) -> Vec<&'static StatColumn> {
    let collations: &[StatColumn] = if epoch.has_collation() {
        COLLATION_COLUMNS
    } else {
        &[]
    };
    SCALAR_COLUMNS
        .iter()
        .chain(collations)
        .chain(ARRAY_COLUMNS)
        .collect()
}

/// Full positional field order of a composite `pg_statistic` record.
pub fn composite_columns(epoch: VersionEpoch) -> Vec<&'static StatColumn> {
    RECORD_KEY_COLUMNS
        .iter()
        .chain(statistic_columns(epoch))
        .collect()
}

/// Encoding role of a field, decided by its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    Scalar,
    /// `stanumbersN`: frequency numbers.
    Numbers,
    /// `stavaluesN`: most-common values or histogram bounds.
    Values,
    /// `stxdexpr`: per-expression statistics records.
    ExpressionStatistics,
}

impl FieldRole {
    pub fn for_field(name: &str) -> Self {
        if name.starts_with("stanumbers") {
            Self::Numbers
        } else if name.starts_with("stavalues") {
            Self::Values
        } else if name == "stxdexpr" {
            Self::ExpressionStatistics
        } else {
            Self::Scalar
        }
    }
}

/// Quotes text as a SQL string literal.
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Renders decoded catalog values as typed SQL literals.
#[derive(Debug, Clone, Copy)]
pub struct LiteralEncoder {
    epoch: VersionEpoch,
}

impl LiteralEncoder {
    pub fn new(epoch: VersionEpoch) -> Self {
        Self { epoch }
    }

    pub fn epoch(&self) -> VersionEpoch {
        self.epoch
    }

    /// Encodes `value` of field `field`.
    ///
    /// `declared_type` is the SQL type for scalars and frequency numbers, and
    /// the element type for representative values. It is ignored for
    /// per-expression statistics, whose record type is fixed.
    pub fn encode(&self, field: &str, value: &Value, declared_type: &str) -> Result<String> {
        match FieldRole::for_field(field) {
            FieldRole::Scalar => encode_scalar(field, value, declared_type),
            FieldRole::Numbers => encode_numbers(field, value, declared_type),
            FieldRole::Values => encode_values(field, value, declared_type),
            FieldRole::ExpressionStatistics => self.encode_expression_statistics(value),
        }
    }

    /// Encodes a list of `pg_statistic`-shaped JSON objects as
    /// `ARRAY[(..), ..]::pg_statistic[]`, or bare `NULL` when absent.
    pub fn encode_expression_statistics(&self, value: &Value) -> Result<String> {
        let records = match value {
            Value::Null => return Ok("NULL".to_string()),
            Value::Array(records) => records,
            other => bail!(
                "per-expression statistics must be an array, got {}",
                json_kind(other)
            ),
        };

        let columns = composite_columns(self.epoch);
        let mut elements = Vec::with_capacity(records.len());
        for (idx, record) in records.iter().enumerate() {
            let Value::Object(fields) = record else {
                bail!(
                    "per-expression statistics element {idx} must be an object, got {}",
                    json_kind(record)
                );
            };
            let mut rendered = Vec::with_capacity(columns.len());
            for column in &columns {
                // Engines that omit a field entirely are treated as emitting NULL.
                let field_value = fields.get(column.name).unwrap_or(&Value::Null);
                let declared = column.declared_type(EXPRESSION_VALUES_ELEMENT_TYPE);
                rendered.push(self.encode(column.name, field_value, declared)?);
            }
            elements.push(format!("({})", rendered.join(", ")));
        }
        Ok(format!(
            "ARRAY[{}]::{EXPRESSION_RECORD_TYPE}[]",
            elements.join(", ")
        ))
    }
}

fn encode_scalar(field: &str, value: &Value, declared_type: &str) -> Result<String> {
    match value {
        Value::Null => Ok(format!("NULL::{declared_type}")),
        Value::Bool(flag) => Ok(format!("{flag}::{declared_type}")),
        Value::Number(number) => Ok(format!("{number}::{declared_type}")),
        Value::String(text) => Ok(format!("{}::{declared_type}", quote_literal(text))),
        other => bail!(
            "field {field} expected a scalar, got {}",
            json_kind(other)
        ),
    }
}

fn encode_numbers(field: &str, value: &Value, declared_type: &str) -> Result<String> {
    let items = match value {
        Value::Null => return Ok(format!("NULL::{declared_type}")),
        Value::Array(items) => items,
        other => bail!(
            "field {field} expected an array of numbers, got {}",
            json_kind(other)
        ),
    };
    let mut rendered = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Number(number) => rendered.push(number.to_string()),
            other => bail!(
                "field {field} expected numeric elements, got {}",
                json_kind(other)
            ),
        }
    }
    Ok(format!("'{{{}}}'::{declared_type}", rendered.join(",")))
}

fn encode_values(field: &str, value: &Value, element_type: &str) -> Result<String> {
    let items = match value {
        Value::Null => return Ok(format!("NULL::{VALUES_ARRAY_TYPE}")),
        Value::Array(items) => items,
        other => bail!(
            "field {field} expected an array of values, got {}",
            json_kind(other)
        ),
    };
    let body = array_literal_body(items, is_array_type(element_type));
    Ok(format!(
        "array_in({}, {}::regtype, -1)::{VALUES_ARRAY_TYPE}",
        quote_literal(&body),
        quote_literal(element_type)
    ))
}

/// `true` for array types (`_int4`, `pg_catalog._text`), whose values are
/// themselves arrays.
fn is_array_type(type_name: &str) -> bool {
    let name = type_name.rsplit('.').next().unwrap_or(type_name);
    name.trim_matches('"').starts_with('_')
}

/// Brace-delimited array literal text, before SQL string quoting.
fn array_literal_body(items: &[Value], nested_arrays: bool) -> String {
    let elements = items
        .iter()
        .map(|item| array_element(item, nested_arrays))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{elements}}}")
}

/// One element of an array literal. Nested arrays become array literals of
/// their own when the element type is an array type; otherwise they are
/// json/jsonb documents.
fn array_element(value: &Value, nested_arrays: bool) -> String {
    let text = match value {
        Value::Null => return "NULL".to_string(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(items) if nested_arrays => array_literal_body(items, true),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    };
    let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn names(columns: &[&StatColumn]) -> Vec<&'static str> {
        columns.iter().map(|column| column.name).collect()
    }

    #[test]
    fn frequency_numbers_render_as_real_array() {
        let encoder = LiteralEncoder::new(VersionEpoch::PreCollation);
        let literal = encoder
            .encode("stanumbers1", &json!([0.5, 0.5]), "real[]")
            .unwrap();
        assert_eq!(literal, "'{0.5,0.5}'::real[]");
    }

    #[test]
    fn representative_values_parse_against_runtime_type() {
        let encoder = LiteralEncoder::new(VersionEpoch::PreCollation);
        let literal = encoder
            .encode("stavalues1", &json!([10, 20]), "pg_catalog.int4")
            .unwrap();
        assert_eq!(
            literal,
            "array_in('{\"10\", \"20\"}', 'pg_catalog.int4'::regtype, -1)::anyarray"
        );
    }

    #[test]
    fn escapes_backslash_then_quote_then_apostrophe() {
        let encoder = LiteralEncoder::new(VersionEpoch::Collation);
        let literal = encoder
            .encode("stavalues2", &json!([r#"a\b"c'd"#]), "pg_catalog.text")
            .unwrap();
        assert_eq!(
            literal,
            r#"array_in('{"a\\b\"c''d"}', 'pg_catalog.text'::regtype, -1)::anyarray"#
        );
    }

    #[test]
    fn numeric_values_keep_their_digits_and_scale() {
        let encoder = LiteralEncoder::new(VersionEpoch::Collation);
        let values: Value = serde_json::from_str("[12345678901234567.89, 1.10]").unwrap();
        let literal = encoder
            .encode("stavalues1", &values, "pg_catalog.numeric")
            .unwrap();
        assert_eq!(
            literal,
            "array_in('{\"12345678901234567.89\", \"1.10\"}', 'pg_catalog.numeric'::regtype, -1)::anyarray"
        );

        let numbers: Value = serde_json::from_str("[0.333333343, 1.0]").unwrap();
        assert_eq!(
            encoder.encode("stanumbers1", &numbers, "real[]").unwrap(),
            "'{0.333333343,1.0}'::real[]"
        );
        let scalar: Value = serde_json::from_str("0.10").unwrap();
        assert_eq!(
            encoder.encode("stanullfrac", &scalar, "real").unwrap(),
            "0.10::real"
        );
    }

    #[test]
    fn array_column_values_render_as_nested_array_literals() {
        let encoder = LiteralEncoder::new(VersionEpoch::Collation);
        let literal = encoder
            .encode("stavalues1", &json!([[1, 2], [3, null]]), "pg_catalog._int4")
            .unwrap();
        assert_eq!(
            literal,
            r#"array_in('{"{\"1\", \"2\"}", "{\"3\", NULL}"}', 'pg_catalog._int4'::regtype, -1)::anyarray"#
        );

        let literal = encoder
            .encode("stavalues1", &json!([["it's", "a\"b"]]), "pg_catalog._text")
            .unwrap();
        assert_eq!(
            literal,
            r#"array_in('{"{\"it''s\", \"a\\\"b\"}"}', 'pg_catalog._text'::regtype, -1)::anyarray"#
        );
    }

    #[test]
    fn json_column_values_stay_documents() {
        let encoder = LiteralEncoder::new(VersionEpoch::Collation);
        let literal = encoder
            .encode("stavalues1", &json!([[1, 2], {"a": 1}]), "pg_catalog.jsonb")
            .unwrap();
        assert_eq!(
            literal,
            r#"array_in('{"[1,2]", "{\"a\":1}"}', 'pg_catalog.jsonb'::regtype, -1)::anyarray"#
        );
    }

    #[test]
    fn nulls_always_carry_a_type() {
        let encoder = LiteralEncoder::new(VersionEpoch::Collation);
        for column in statistic_columns(VersionEpoch::Collation) {
            let declared = column.declared_type("pg_catalog.int4");
            let literal = encoder.encode(column.name, &Value::Null, declared).unwrap();
            assert!(literal.starts_with("NULL::"), "{} -> {literal}", column.name);
        }
        assert_eq!(
            encoder.encode("stanullfrac", &Value::Null, "real").unwrap(),
            "NULL::real"
        );
        assert_eq!(
            encoder
                .encode("stavalues3", &Value::Null, "pg_catalog.int4")
                .unwrap(),
            "NULL::anyarray"
        );
    }

    #[test]
    fn scalars_cast_to_declared_type() {
        let encoder = LiteralEncoder::new(VersionEpoch::PreCollation);
        assert_eq!(
            encoder.encode("stainherit", &json!(false), "boolean").unwrap(),
            "false::boolean"
        );
        assert_eq!(
            encoder.encode("stadistinct", &json!(-1), "real").unwrap(),
            "-1::real"
        );
        assert_eq!(
            encoder.encode("staop1", &json!(96), "oid").unwrap(),
            "96::oid"
        );
    }

    #[test]
    fn unknown_shapes_fail_loudly() {
        let encoder = LiteralEncoder::new(VersionEpoch::PreCollation);
        assert!(encoder.encode("stawidth", &json!([1]), "integer").is_err());
        assert!(encoder.encode("stanumbers1", &json!("0.5"), "real[]").is_err());
        assert!(encoder
            .encode("stanumbers1", &json!(["x"]), "real[]")
            .is_err());
        assert!(encoder
            .encode("stavalues1", &json!({"a": 1}), "pg_catalog.int4")
            .is_err());
    }

    #[test]
    fn column_contract_follows_epoch() {
        let pre = names(&statistic_columns(VersionEpoch::PreCollation));
        let post = names(&statistic_columns(VersionEpoch::Collation));
        assert_eq!(pre.len(), 24);
        assert_eq!(post.len(), 29);
        assert!(!pre.iter().any(|name| name.starts_with("stacoll")));
        assert_eq!(post[14], "stacoll1");
        assert_eq!(post[19], "stanumbers1");
        assert_eq!(pre[14], "stanumbers1");

        let composite = names(&composite_columns(VersionEpoch::Collation));
        assert_eq!(&composite[..3], &["starelid", "staattnum", "stainherit"]);
        assert_eq!(composite.last(), Some(&"stavalues5"));
    }

    #[test]
    fn expression_statistics_follow_positional_contract() {
        let encoder = LiteralEncoder::new(VersionEpoch::Collation);
        // Keys deliberately out of order, and stacoll fields omitted entirely.
        let value = json!([{
            "stavalues1": [1, 2],
            "stanullfrac": 0,
            "staattnum": 0,
            "starelid": 0,
            "stainherit": false,
            "stawidth": 4,
            "stadistinct": 2,
            "stakind1": 1, "stakind2": 0, "stakind3": 0, "stakind4": 0, "stakind5": 0,
            "staop1": 96, "staop2": 0, "staop3": 0, "staop4": 0, "staop5": 0,
            "stanumbers1": [0.5, 0.5]
        }]);
        let literal = encoder.encode("stxdexpr", &value, "").unwrap();
        assert!(literal.starts_with(
            "ARRAY[(0::oid, 0::smallint, false::boolean, 0::real, 4::integer, 2::real, 1::smallint"
        ));
        assert!(literal.contains("0::oid, NULL::oid, NULL::oid, NULL::oid, NULL::oid, NULL::oid, '{0.5,0.5}'::real[]"));
        assert!(literal.contains(
            "array_in('{\"1\", \"2\"}', 'pg_catalog.int4'::regtype, -1)::anyarray, NULL::anyarray"
        ));
        assert!(literal.ends_with("NULL::anyarray)]::pg_statistic[]"));
    }

    #[test]
    fn absent_expression_statistics_are_bare_null() {
        let encoder = LiteralEncoder::new(VersionEpoch::Collation);
        assert_eq!(
            encoder.encode("stxdexpr", &Value::Null, "").unwrap(),
            "NULL"
        );
        assert_eq!(
            encoder.encode("stxdexpr", &json!([]), "").unwrap(),
            "ARRAY[]::pg_statistic[]"
        );
        assert!(encoder.encode("stxdexpr", &json!([1]), "").is_err());
    }

    #[test]
    fn field_roles_come_from_names() {
        assert_eq!(FieldRole::for_field("stanumbers4"), FieldRole::Numbers);
        assert_eq!(FieldRole::for_field("stavalues5"), FieldRole::Values);
        assert_eq!(
            FieldRole::for_field("stxdexpr"),
            FieldRole::ExpressionStatistics
        );
        assert_eq!(FieldRole::for_field("stacoll2"), FieldRole::Scalar);
    }
}
