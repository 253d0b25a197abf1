//! Shared helpers for integration tests.
//!
//! [`FakeCatalog`] answers the dump pipeline's catalog queries from canned
//! rows. Rows are keyed by their owning table, and scoped queries only see
//! the tables their `::regclass::oid` filter names, the way the server would.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cbo_stat_dump::client::CatalogClient;
use cbo_stat_dump::DumpConfig;
use serde_json::{json, Map, Value};

pub const PG15_VERSION_NUM: &str = "150004";
/// YugabyteDB reports its PostgreSQL 11 base.
pub const YB_VERSION_NUM: &str = "110002";

/// One canned catalog row and the `schema.table` it belongs to.
#[derive(Debug, Clone)]
pub struct OwnedRow {
    pub table: String,
    pub raw: String,
}

impl OwnedRow {
    pub fn new(table: &str, raw: impl Into<String>) -> Self {
        Self {
            table: table.to_string(),
            raw: raw.into(),
        }
    }
}

#[derive(Default)]
pub struct FakeCatalog {
    pub server_version_num: String,
    pub version_string: String,
    pub scope_plan_json: String,
    pub text_plan: Vec<String>,
    pub class_rows: Vec<OwnedRow>,
    pub statistic_rows: Vec<OwnedRow>,
    pub ext_descriptor_rows: Vec<OwnedRow>,
    pub ext_payload_rows: Vec<OwnedRow>,
    pub settings_rows: Vec<String>,
    queried: Mutex<Vec<String>>,
    executed: Mutex<Vec<String>>,
}

impl FakeCatalog {
    pub fn new(server_version_num: &str) -> Self {
        Self {
            server_version_num: server_version_num.to_string(),
            version_string: format!("PostgreSQL {server_version_num}"),
            ..Self::default()
        }
    }

    pub fn queried(&self) -> Vec<String> {
        self.queried.lock().unwrap().clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    fn visible(rows: &[OwnedRow], sql: &str) -> Vec<String> {
        let scoped = sql.contains("::regclass::oid");
        rows.iter()
            .filter(|row| !scoped || sql.contains(&format!("'{}'::regclass::oid", row.table)))
            .map(|row| row.raw.clone())
            .collect()
    }
}

#[async_trait]
impl CatalogClient for FakeCatalog {
    async fn query_text(&self, sql: &str) -> Result<Vec<String>> {
        self.queried.lock().unwrap().push(sql.to_string());
        let rows = if sql == "SHOW server_version_num" {
            vec![self.server_version_num.clone()]
        } else if sql.starts_with("EXPLAIN (VERBOSE, FORMAT JSON)") {
            vec![self.scope_plan_json.clone()]
        } else if sql.starts_with("EXPLAIN ") {
            self.text_plan.clone()
        } else if sql == "SELECT version()" {
            vec![self.version_string.clone()]
        } else if sql.contains("FROM pg_settings") {
            self.settings_rows.clone()
        } else if sql.contains("JOIN pg_statistic_ext_data d") {
            Self::visible(&self.ext_payload_rows, sql)
        } else if sql.contains("JOIN pg_statistic_ext s") {
            Self::visible(&self.ext_descriptor_rows, sql)
        } else if sql.contains("JOIN pg_statistic s") {
            Self::visible(&self.statistic_rows, sql)
        } else if sql.contains("FROM pg_class c JOIN pg_namespace n") {
            Self::visible(&self.class_rows, sql)
        } else {
            return Err(anyhow!("fake catalog cannot answer `{sql}`"));
        };
        Ok(rows)
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.executed.lock().unwrap().push(sql.to_string());
        Ok(())
    }
}

pub fn class_row(schema: &str, relname: &str, relpages: i32, reltuples: f64) -> String {
    json!({
        "relname": relname,
        "relpages": relpages,
        "reltuples": reltuples,
        "relallvisible": 0,
        "nspname": schema,
    })
    .to_string()
}

/// A `pg_statistic` row with one populated slot of the given kind.
#[allow(clippy::too_many_arguments)]
pub fn statistic_row(
    schema: &str,
    relname: &str,
    attname: &str,
    typname: &str,
    collation: bool,
    kind: i64,
    numbers: Value,
    values: Value,
) -> String {
    let mut row = Map::new();
    row.insert("nspname".into(), json!(schema));
    row.insert("relname".into(), json!(relname));
    row.insert("attname".into(), json!(attname));
    row.insert("typnspname".into(), json!("pg_catalog"));
    row.insert("typname".into(), json!(typname));
    row.insert("stainherit".into(), json!(false));
    row.insert("stanullfrac".into(), json!(0.0));
    row.insert("stawidth".into(), json!(4));
    row.insert("stadistinct".into(), json!(-1));
    for slot in 1..=5 {
        let populated = slot == 1;
        row.insert(format!("stakind{slot}"), json!(if populated { kind } else { 0 }));
        row.insert(format!("staop{slot}"), json!(if populated { 96 } else { 0 }));
        if collation {
            row.insert(format!("stacoll{slot}"), json!(0));
        }
        row.insert(
            format!("stanumbers{slot}"),
            if populated { numbers.clone() } else { Value::Null },
        );
        row.insert(
            format!("stavalues{slot}"),
            if populated { values.clone() } else { Value::Null },
        );
    }
    Value::Object(row).to_string()
}

pub fn dump_config(output_dir: PathBuf) -> DumpConfig {
    DumpConfig {
        host: "127.0.0.1".to_string(),
        port: 5433,
        database: "shop".to_string(),
        user: "yugabyte".to_string(),
        password: None,
        output_dir,
        query_file: None,
        yb_mode: false,
        enable_base_scans_cost_model: false,
        embed_extended_stats: true,
        // Nothing listens here; engine flag fetches fail fast.
        gflags_port: 1,
        // Succeeds without output, leaving an empty ddl.sql.
        dump_program: "true".to_string(),
    }
}
