//! Supplementary artifacts written next to the statistics snapshot: the query
//! and its plan, a filtered schema dump, the server version string, the
//! optimizer-relevant configuration overrides, and engine flags.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::client::CatalogClient;
use crate::literal::quote_literal;
use crate::scope::{apply_cost_model_setting, quote_ident, RelationScope};

pub const QUERY_FILE: &str = "query.sql";
pub const QUERY_PLAN_FILE: &str = "query_plan.txt";
pub const DDL_FILE: &str = "ddl.sql";
pub const VERSION_FILE: &str = "version.txt";
pub const OVERRIDDEN_GUCS_FILE: &str = "overridden_gucs.sql";
pub const GFLAGS_FILE: &str = "gflags.json";

pub const ENGINE_FLAGS_TIMEOUT: Duration = Duration::from_secs(2);
const ENGINE_FLAGS_PATH: &str = "/api/v1/varz";

/// Lines of a schema-only dump that carry no schema: comments, session
/// settings, `search_path` calls, ownership, and the default schema.
const DDL_NOISE_PATTERN: &str =
    r"(?:^--)|(?:^SET)|(?:^SELECT pg_catalog)|(?:^ALTER .+ OWNER TO)|(?:^CREATE SCHEMA public;$)";

/// Configuration parameters that influence plan choice.
pub const OPTIMIZER_PARAMETERS: &[&str] = &[
    "enable_seqscan",
    "enable_indexscan",
    "enable_bitmapscan",
    "enable_indexonlyscan",
    "enable_tidscan",
    "enable_sort",
    "enable_hashagg",
    "enable_nestloop",
    "enable_material",
    "enable_mergejoin",
    "enable_hashjoin",
    "enable_gathermerge",
    "enable_partitionwise_join",
    "enable_partitionwise_aggregate",
    "enable_parallel_append",
    "enable_parallel_hash",
    "enable_partition_pruning",
    "random_page_cost",
    "seq_page_cost",
    "cpu_tuple_cost",
    "cpu_index_tuple_cost",
    "cpu_operator_cost",
    "effective_cache_size",
    "shared_buffers",
    "work_mem",
    "maintenance_work_mem",
    "default_statistics_target",
    "max_parallel_workers_per_gather",
    "yb_enable_geolocation_costing",
    "yb_enable_batchednl",
    "yb_enable_parallel_append",
    "yb_enable_bitmapscan",
    "yb_enable_base_scans_cost_model",
    "yb_bnl_batch_size",
    "yb_enable_expression_pushdown",
    "yb_test_planner_custom_plan_threshold",
];

fn write_artifact(output_dir: &Path, name: &str, contents: &str) -> Result<()> {
    fs::write(output_dir.join(name), contents).with_context(|| format!("write {name}"))
}

/// Copies the query file into the output directory and returns its text.
pub fn copy_query(query_path: &Path, output_dir: &Path) -> Result<String> {
    let query = fs::read_to_string(query_path)
        .with_context(|| format!("read query file {}", query_path.display()))?;
    write_artifact(output_dir, QUERY_FILE, &query)?;
    Ok(query)
}

/// Writes the plain-text plan of `query`, one plan line per row.
pub async fn export_query_plan(
    client: &dyn CatalogClient,
    query: &str,
    enable_base_scans_cost_model: bool,
    output_dir: &Path,
) -> Result<()> {
    apply_cost_model_setting(client, enable_base_scans_cost_model).await?;
    let lines = client
        .query_text(&format!("EXPLAIN {query}"))
        .await
        .context("explain query")?;
    let mut plan = String::new();
    for line in &lines {
        plan.push_str(line);
        plan.push('\n');
    }
    write_artifact(output_dir, QUERY_PLAN_FILE, &plan)?;
    debug!(lines = lines.len(), "wrote query plan");
    Ok(())
}

/// A schema-only `pg_dump` invocation against the source database.
#[derive(Debug, Clone)]
pub struct SchemaDump {
    pub program: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
}

impl SchemaDump {
    pub fn args(&self, scope: &RelationScope) -> Vec<String> {
        let mut args = vec![
            "-h".to_string(),
            self.host.clone(),
            "-p".to_string(),
            self.port.to_string(),
            "-d".to_string(),
            self.database.clone(),
            "-U".to_string(),
            self.user.clone(),
            "-s".to_string(),
        ];
        for relation in scope {
            let pattern = match &relation.schema {
                Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&relation.name)),
                None => quote_ident(&relation.name),
            };
            args.push("-t".to_string());
            args.push(pattern);
        }
        args
    }

    /// Runs the dump and returns its raw standard output.
    pub async fn run(&self, scope: &RelationScope) -> Result<String> {
        let mut command = Command::new(&self.program);
        command.args(self.args(scope)).kill_on_drop(true);
        if let Some(password) = &self.password {
            command.env("PGPASSWORD", password);
        }
        let output = command
            .output()
            .await
            .with_context(|| format!("spawn {}", self.program))?;
        if !output.status.success() {
            bail!(
                "{} failed with {}: {}{}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr),
                String::from_utf8_lossy(&output.stdout)
            );
        }
        String::from_utf8(output.stdout).with_context(|| format!("decode {} output", self.program))
    }
}

/// Keeps only the schema-bearing lines of a schema dump.
pub fn filter_schema_dump(dump: &str) -> Result<String> {
    let noise = Regex::new(DDL_NOISE_PATTERN).context("compile ddl filter")?;
    let mut ddl = String::new();
    for line in dump.lines() {
        if line.trim().is_empty() || noise.is_match(line) {
            continue;
        }
        ddl.push_str(line);
        ddl.push('\n');
    }
    Ok(ddl)
}

pub async fn export_ddl(dump: &SchemaDump, scope: &RelationScope, output_dir: &Path) -> Result<()> {
    let raw = dump.run(scope).await?;
    let ddl = filter_schema_dump(&raw)?;
    write_artifact(output_dir, DDL_FILE, &ddl)?;
    debug!(relations = scope.len(), bytes = ddl.len(), "wrote schema dump");
    Ok(())
}

/// Writes the server's full version string, without a trailing newline.
pub async fn export_server_version(client: &dyn CatalogClient, output_dir: &Path) -> Result<()> {
    let rows = client
        .query_text("SELECT version()")
        .await
        .context("query server version")?;
    let version = rows
        .first()
        .ok_or_else(|| anyhow!("SELECT version() returned no rows"))?;
    write_artifact(output_dir, VERSION_FILE, version)
}

#[derive(Debug, Deserialize)]
struct Setting {
    name: String,
    #[serde(default)]
    setting: Option<String>,
}

/// `SET` statements for optimizer parameters that differ from their boot value.
pub fn overridden_settings_script(rows: &[String]) -> Result<String> {
    let mut script = String::new();
    for raw in rows {
        let row: Setting =
            serde_json::from_str(raw).with_context(|| format!("decode pg_settings row {raw}"))?;
        let Some(setting) = row.setting else {
            continue;
        };
        if OPTIMIZER_PARAMETERS.contains(&row.name.as_str()) {
            script.push_str(&format!("SET {}={};\n", row.name, quote_literal(&setting)));
        }
    }
    Ok(script)
}

pub async fn export_overridden_settings(client: &dyn CatalogClient, output_dir: &Path) -> Result<()> {
    let rows = client
        .query_text(
            "SELECT row_to_json(t) FROM \
             (SELECT name, setting FROM pg_settings WHERE setting <> boot_val ORDER BY name) t",
        )
        .await
        .context("query pg_settings")?;
    let script = overridden_settings_script(&rows)?;
    write_artifact(output_dir, OVERRIDDEN_GUCS_FILE, &script)
}

#[derive(Debug, Deserialize)]
struct VarzBody {
    #[serde(default)]
    flags: Vec<VarzFlag>,
}

#[derive(Debug, Deserialize)]
struct VarzFlag {
    name: String,
    #[serde(default)]
    value: Value,
    #[serde(rename = "type", default)]
    kind: String,
}

impl VarzBody {
    /// Flags explicitly set on the engine (`type == "Custom"`), by name.
    fn into_custom_flags(self) -> BTreeMap<String, Value> {
        self.flags
            .into_iter()
            .filter(|flag| flag.kind == "Custom")
            .map(|flag| (flag.name, flag.value))
            .collect()
    }
}

pub async fn fetch_engine_flags(host: &str, port: u16) -> Result<BTreeMap<String, Value>> {
    let url = format!("http://{host}:{port}{ENGINE_FLAGS_PATH}");
    let client = reqwest::Client::builder()
        .timeout(ENGINE_FLAGS_TIMEOUT)
        .build()
        .context("build http client")?;
    let varz = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?
        .error_for_status()
        .with_context(|| format!("GET {url}"))?
        .json::<VarzBody>()
        .await
        .context("parse engine flags json")?;
    Ok(varz.into_custom_flags())
}

/// Fetches and writes engine flags. Failures are logged and swallowed; the
/// flags are diagnostic only.
pub async fn export_engine_flags(host: &str, port: u16, output_dir: &Path) {
    let flags = match fetch_engine_flags(host, port).await {
        Ok(flags) => flags,
        Err(err) => {
            warn!(error = %format!("{err:#}"), host, port, "failed to fetch engine flags");
            return;
        }
    };
    let written = serde_json::to_string_pretty(&flags)
        .context("encode engine flags")
        .and_then(|json| write_artifact(output_dir, GFLAGS_FILE, &json));
    match written {
        Ok(()) => info!(flags = flags.len(), "wrote engine flags"),
        Err(err) => warn!(error = %format!("{err:#}"), "failed to write engine flags"),
    }
}
