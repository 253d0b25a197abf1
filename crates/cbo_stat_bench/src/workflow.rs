//! Per-query replay workflow.
//!
//! For every benchmark query: dump the source database, rebuild a scratch
//! database from the dump alone, and check that the scratch database plans
//! the query the same way the source did.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use cbo_stat_dump::client::{CatalogClient, ConnectOptions, Connection};
use cbo_stat_dump::exports::{DDL_FILE, OVERRIDDEN_GUCS_FILE, QUERY_PLAN_FILE};
use cbo_stat_dump::scope::{quote_ident, BASE_SCANS_COST_MODEL_SET};
use cbo_stat_dump::snapshot::STATISTICS_REPLAY_FILE;
use cbo_stat_dump::DumpConfig;
use tracing::{debug, info, warn};

use crate::plan_diff::render_plan_diff;

pub const SIMULATED_PLAN_FILE: &str = "sim_query_plan.txt";
pub const PLAN_DIFF_FILE: &str = "query_plan_diff.txt";

/// Maintenance database used to create and drop other databases.
const MAINTENANCE_DATABASE: &str = "postgres";
/// Makes a vanilla server plan with injected statistics instead of its own.
const STATISTICS_SIMULATION_SET: &str = "SET enable_cbo_statistics_simulation=ON";
/// Master web port of the production cluster.
const GFLAGS_PORT: u16 = 7000;

/// A server and the credentials used on it.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
}

impl Endpoint {
    pub fn connect_options(&self, database: &str) -> ConnectOptions {
        ConnectOptions {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: database.to_string(),
        }
    }

    pub async fn connect(&self, database: &str) -> Result<Connection> {
        Connection::open(&self.connect_options(database)).await
    }
}

/// Fully resolved benchmark settings.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub benchmark: String,
    pub benchmark_path: PathBuf,
    pub out_dir: PathBuf,
    pub yb_mode: bool,
    pub colocation: bool,
    pub create_prod_db: bool,
    pub ignore_ran_tests: bool,
    pub enable_base_scans_cost_model: bool,
    pub replay_extended_stats: bool,
    pub prod: Endpoint,
    pub prod_database: String,
    pub test: Endpoint,
    pub dump_program: String,
}

impl BenchConfig {
    fn base_scans_cost_model(&self) -> bool {
        self.yb_mode && self.enable_base_scans_cost_model
    }

    fn dump_config(&self, query_file: &Path, output_dir: PathBuf) -> DumpConfig {
        DumpConfig {
            host: self.prod.host.clone(),
            port: self.prod.port,
            database: self.prod_database.clone(),
            user: self.prod.user.clone(),
            password: self.prod.password.clone(),
            output_dir,
            query_file: Some(query_file.to_path_buf()),
            yb_mode: self.yb_mode,
            enable_base_scans_cost_model: self.enable_base_scans_cost_model,
            embed_extended_stats: self.replay_extended_stats,
            gflags_port: GFLAGS_PORT,
            dump_program: self.dump_program.clone(),
        }
    }

    fn create_script(&self) -> PathBuf {
        let name = if self.yb_mode { "create.yb.sql" } else { "create.sql" };
        self.benchmark_path.join(name)
    }
}

/// A query whose simulated plan differed from the source plan.
#[derive(Debug, Clone)]
pub struct PlanMismatch {
    pub query: String,
    pub diff_path: PathBuf,
}

/// Query files of a benchmark, sorted by file name.
pub fn list_queries(benchmark_path: &Path) -> Result<Vec<PathBuf>> {
    let dir = benchmark_path.join("queries");
    let mut queries = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.context("read queries dir entry")?;
        if entry.file_type().context("stat query file")?.is_file() {
            queries.push(entry.path());
        }
    }
    queries.sort();
    Ok(queries)
}

fn query_name(query_file: &Path) -> String {
    query_file
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Drops psql meta-commands (`\connect`, `\restrict`, ...) that a plain
/// protocol connection cannot run.
pub fn strip_meta_commands(script: &str) -> String {
    script
        .lines()
        .filter(|line| !line.trim_start().starts_with('\\'))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn recreate_database(admin: &Endpoint, database: &str, colocation: bool) -> Result<()> {
    let connection = admin.connect(MAINTENANCE_DATABASE).await?;
    let client: &dyn CatalogClient = connection.client();
    let name = quote_ident(database);
    client
        .execute(&format!("DROP DATABASE IF EXISTS {name}"))
        .await
        .with_context(|| format!("drop database {database}"))?;
    let mut create = format!("CREATE DATABASE {name}");
    if colocation {
        create.push_str(" WITH colocation = true");
    }
    client
        .execute(&create)
        .await
        .with_context(|| format!("create database {database}"))?;
    debug!(database, colocation, "recreated database");
    Ok(())
}

async fn drop_database(admin: &Endpoint, database: &str) -> Result<()> {
    let connection = admin.connect(MAINTENANCE_DATABASE).await?;
    let client: &dyn CatalogClient = connection.client();
    client
        .execute(&format!("DROP DATABASE IF EXISTS {}", quote_ident(database)))
        .await
        .with_context(|| format!("drop database {database}"))
}

async fn replay_script(client: &dyn CatalogClient, path: &Path) -> Result<()> {
    let script = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    client
        .execute(&strip_meta_commands(&script))
        .await
        .with_context(|| format!("replay {}", path.display()))
}

/// Runs `sql` inside a savepoint so a failure leaves the transaction usable.
async fn try_in_savepoint(client: &dyn CatalogClient, sql: &str) -> Result<()> {
    client.execute("SAVEPOINT bench_setting").await?;
    match client.execute(sql).await {
        Ok(()) => client.execute("RELEASE SAVEPOINT bench_setting").await,
        Err(err) => {
            client.execute("ROLLBACK TO SAVEPOINT bench_setting").await?;
            Err(err)
        }
    }
}

/// Plans `query` on the scratch database under the source's settings and
/// returns the plan text, one line per row.
async fn simulated_plan(
    config: &BenchConfig,
    client: &dyn CatalogClient,
    gucs_file: &Path,
    query: &str,
) -> Result<String> {
    client.execute("BEGIN").await.context("begin plan transaction")?;
    if gucs_file.exists() {
        let gucs = fs::read_to_string(gucs_file)
            .with_context(|| format!("read {}", gucs_file.display()))?;
        for line in gucs.lines().map(str::trim).filter(|line| !line.is_empty()) {
            if let Err(err) = try_in_savepoint(client, line).await {
                warn!(setting = line, error = %format!("{err:#}"), "failed to apply setting");
            }
        }
    }
    if config.base_scans_cost_model() {
        try_in_savepoint(client, BASE_SCANS_COST_MODEL_SET).await?;
    }
    if !config.yb_mode {
        if let Err(err) = try_in_savepoint(client, STATISTICS_SIMULATION_SET).await {
            debug!(error = %format!("{err:#}"), "statistics simulation unavailable");
        }
    }

    let plan = client
        .query_text(&format!("EXPLAIN {query}"))
        .await
        .context("explain query on scratch database");
    client.execute("ROLLBACK").await.context("end plan transaction")?;

    let mut rendered = String::new();
    for line in plan? {
        rendered.push_str(&line);
        rendered.push('\n');
    }
    Ok(rendered)
}

/// Dumps, replays and compares one query. Returns the mismatch, if any.
async fn run_query(config: &BenchConfig, query_file: &Path) -> Result<Option<PlanMismatch>> {
    let name = query_name(query_file);
    let query_out = config.out_dir.join(&name);

    cbo_stat_dump::run(&config.dump_config(query_file, query_out.clone()))
        .await
        .with_context(|| format!("dump statistics for {name}"))?;

    let test_database = format!("{}_{name}_test_db", config.benchmark);
    recreate_database(&config.test, &test_database, config.colocation).await?;

    let simulated = {
        let connection = config.test.connect(&test_database).await?;
        let client: &dyn CatalogClient = connection.client();
        replay_script(client, &query_out.join(DDL_FILE)).await?;
        replay_script(client, &query_out.join(STATISTICS_REPLAY_FILE)).await?;
        let query = fs::read_to_string(query_file)
            .with_context(|| format!("read {}", query_file.display()))?;
        simulated_plan(config, client, &query_out.join(OVERRIDDEN_GUCS_FILE), &query).await?
    };
    fs::write(query_out.join(SIMULATED_PLAN_FILE), &simulated)
        .with_context(|| format!("write {SIMULATED_PLAN_FILE}"))?;

    let source_plan = fs::read_to_string(query_out.join(QUERY_PLAN_FILE))
        .with_context(|| format!("read {QUERY_PLAN_FILE}"))?;
    let mismatch = match render_plan_diff(&source_plan, &simulated) {
        Some(diff) => {
            let diff_path = query_out.join(PLAN_DIFF_FILE);
            fs::write(&diff_path, diff).with_context(|| format!("write {PLAN_DIFF_FILE}"))?;
            Some(PlanMismatch {
                query: query_file
                    .file_name()
                    .map(|file| file.to_string_lossy().into_owned())
                    .unwrap_or(name),
                diff_path,
            })
        }
        None => None,
    };

    drop_database(&config.test, &test_database).await?;
    Ok(mismatch)
}

/// Runs the whole benchmark and fails when any query's plan changed.
pub async fn run_benchmark(config: &BenchConfig) -> Result<()> {
    if config.create_prod_db {
        recreate_database(&config.prod, &config.prod_database, config.colocation).await?;
        let connection = config.prod.connect(&config.prod_database).await?;
        replay_script(connection.client(), &config.create_script()).await?;
        info!(database = %config.prod_database, "created production database");
    }

    let mut mismatches = Vec::new();
    for query_file in list_queries(&config.benchmark_path)? {
        let name = query_name(&query_file);
        if config.ignore_ran_tests && config.out_dir.join(&name).exists() {
            debug!(query = %name, "skipping query with existing output");
            continue;
        }
        info!(query = %name, "testing");
        if let Some(mismatch) = run_query(config, &query_file).await? {
            warn!(query = %mismatch.query, diff = %mismatch.diff_path.display(), "plan mismatch");
            mismatches.push(mismatch);
        }
    }

    if mismatches.is_empty() {
        info!("all tests passed");
        return Ok(());
    }
    for mismatch in &mismatches {
        eprintln!("{} : {}", mismatch.query, mismatch.diff_path.display());
    }
    bail!("{} queries planned differently", mismatches.len());
}
