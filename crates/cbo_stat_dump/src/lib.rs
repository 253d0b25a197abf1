//! Capture optimizer statistics from a PostgreSQL-compatible catalog.
//!
//! A dump records relation size estimates (`pg_class`), per-column statistics
//! (`pg_statistic`) and extended statistics (`pg_statistic_ext_data`) as a
//! JSON document plus a SQL script that reinstates them in another database.
//! Together with the schema dump and the overridden planner settings this is
//! enough to reproduce the source's plan for a query on an empty copy.

pub mod client;
pub mod exports;
pub mod ext_stats;
pub mod literal;
pub mod scope;
pub mod snapshot;
pub mod stats;
pub mod version;

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::client::{CatalogClient, ConnectOptions, Connection};
use crate::exports::SchemaDump;
use crate::ext_stats::ExtendedStatisticsExtractor;
use crate::literal::LiteralEncoder;
use crate::scope::{resolve_relation_scope, RelationScope};
use crate::snapshot::SnapshotWriter;
use crate::stats::StatisticsExtractor;
use crate::version::{detect_server_version, ServerVersion};

/// Everything one dump run needs; built by the CLI, never from the environment.
#[derive(Debug, Clone)]
pub struct DumpConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub output_dir: PathBuf,
    /// Restricts the dump to the relations this query reads.
    pub query_file: Option<PathBuf>,
    /// Target is a distributed (YugabyteDB) cluster.
    pub yb_mode: bool,
    /// Only honored in distributed mode.
    pub enable_base_scans_cost_model: bool,
    /// Append extended-statistics pairs to `import_statistics.sql` too.
    pub embed_extended_stats: bool,
    pub gflags_port: u16,
    pub dump_program: String,
}

impl DumpConfig {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: self.database.clone(),
        }
    }

    pub fn schema_dump(&self) -> SchemaDump {
        SchemaDump {
            program: self.dump_program.clone(),
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
        }
    }

    fn base_scans_cost_model(&self) -> bool {
        self.yb_mode && self.enable_base_scans_cost_model
    }
}

/// What a successful run captured.
#[derive(Debug, Clone)]
pub struct DumpSummary {
    pub server_version: ServerVersion,
    /// Empty when no query file was given.
    pub scope: RelationScope,
    pub relations: usize,
    pub columns: usize,
    /// `None` when the server predates extended statistics.
    pub extended_objects: Option<usize>,
}

/// Runs every dump stage, in order, over one catalog connection.
pub struct Dumper<'a> {
    client: &'a dyn CatalogClient,
    config: &'a DumpConfig,
}

impl<'a> Dumper<'a> {
    pub fn new(client: &'a dyn CatalogClient, config: &'a DumpConfig) -> Self {
        Self { client, config }
    }

    pub async fn dump(&self) -> Result<DumpSummary> {
        let config = self.config;
        let output_dir = config.output_dir.as_path();

        let server_version = detect_server_version(self.client).await?;
        let epoch = server_version.epoch();
        info!(
            version = server_version.num(),
            collation = epoch.has_collation(),
            "detected server version"
        );

        let mut scope = RelationScope::new();
        if let Some(query_file) = &config.query_file {
            let query = exports::copy_query(query_file, output_dir)?;
            scope = resolve_relation_scope(self.client, &query, config.base_scans_cost_model())
                .await
                .context("resolve relation scope")?;
            info!(relations = scope.len(), "resolved relation scope");
            exports::export_query_plan(
                self.client,
                &query,
                config.base_scans_cost_model(),
                output_dir,
            )
            .await
            .context("export query plan")?;
        }

        exports::export_ddl(&config.schema_dump(), &scope, output_dir)
            .await
            .context("export ddl")?;

        let base = StatisticsExtractor::new(self.client, epoch)
            .extract(&scope)
            .await
            .context("export statistics")?;

        let extended = if server_version.supports_extended_statistics() {
            let extended = ExtendedStatisticsExtractor::new(self.client)
                .extract(&scope)
                .await
                .context("export extended statistics")?;
            Some(extended)
        } else {
            info!(
                version = server_version.num(),
                "server has no extended statistics data, skipping"
            );
            None
        };

        SnapshotWriter::new(output_dir, config.yb_mode, LiteralEncoder::new(epoch))
            .embed_extended(config.embed_extended_stats)
            .write(&base, extended.as_ref())?;

        exports::export_server_version(self.client, output_dir)
            .await
            .context("export server version")?;
        exports::export_overridden_settings(self.client, output_dir)
            .await
            .context("export overridden settings")?;

        if config.yb_mode {
            exports::export_engine_flags(&config.host, config.gflags_port, output_dir).await;
        }

        Ok(DumpSummary {
            server_version,
            scope,
            relations: base.relations.len(),
            columns: base.columns.len(),
            extended_objects: extended.map(|extended| extended.payloads.len()),
        })
    }
}

/// Creates the output directory, connects, and runs a full dump. The
/// connection is released on return whether or not the dump succeeded.
pub async fn run(config: &DumpConfig) -> Result<DumpSummary> {
    fs::create_dir_all(&config.output_dir).with_context(|| {
        format!("create output dir {}", config.output_dir.display())
    })?;
    let connection = Connection::open(&config.connect_options()).await?;
    let summary = Dumper::new(connection.client(), config).dump().await?;
    info!(
        dir = %config.output_dir.display(),
        relations = summary.relations,
        columns = summary.columns,
        "dump complete"
    );
    Ok(summary)
}
