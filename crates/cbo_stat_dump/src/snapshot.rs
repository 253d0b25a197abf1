//! Snapshot artifacts: the JSON document and the SQL replay script.
//!
//! The document embeds every captured row exactly as the server rendered it,
//! one row per line. Only the surrounding structure is indented, so a re-dump
//! of an unchanged catalog compares byte for byte.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::ext_stats::{extended_replay_statements, ExtendedStatistics};
use crate::literal::LiteralEncoder;
use crate::stats::{base_replay_statements, BaseStatistics, Captured};

pub const STATISTICS_DOCUMENT_FILE: &str = "statistics.json";
pub const STATISTICS_REPLAY_FILE: &str = "import_statistics.sql";
pub const EXTENDED_DOCUMENT_FILE: &str = "statistic_ext.json";
pub const EXTENDED_REPLAY_FILE: &str = "import_statistics_ext.sql";

pub const STATISTICS_DOCUMENT_VERSION: &str = "1.0.0";
pub const EXTENDED_DOCUMENT_VERSION: &str = "0.0.1";

const SYSTEM_TABLE_WRITES_ON: &str = "SET yb_non_ddl_txn_for_sys_tables_allowed = ON;";
const SYSTEM_TABLE_WRITES_OFF: &str = "SET yb_non_ddl_txn_for_sys_tables_allowed = OFF;";
const CATALOG_VERSION_BUMP: &str =
    "update pg_yb_catalog_version set current_version=current_version+1 where db_oid=1;";

const INDENT: &str = "    ";

/// Renders a versioned document of named row arrays, rows kept verbatim.
pub fn format_document(version: &str, sections: &[(&str, Vec<&str>)]) -> String {
    let mut out = String::from("{\n");
    out.push_str(&format!("{INDENT}\"version\": \"{version}\""));
    for (name, rows) in sections {
        out.push_str(&format!(",\n{INDENT}\"{name}\": [\n"));
        for (idx, row) in rows.iter().enumerate() {
            out.push_str(INDENT);
            out.push_str(INDENT);
            out.push_str(row);
            if idx + 1 < rows.len() {
                out.push(',');
            }
            out.push('\n');
        }
        out.push_str(INDENT);
        out.push(']');
    }
    out.push_str("\n}");
    out
}

/// Joins replay statements, wrapped in the distributed-mode system-table
/// toggles and catalog version bump when `distributed` is set.
pub fn format_replay_script(distributed: bool, statements: &[String]) -> String {
    let mut out = String::new();
    if distributed {
        out.push_str(SYSTEM_TABLE_WRITES_ON);
        out.push_str("\n\n");
    }
    for statement in statements {
        out.push_str(statement);
        out.push('\n');
    }
    if distributed {
        out.push('\n');
        out.push_str(CATALOG_VERSION_BUMP);
        out.push('\n');
        out.push_str(SYSTEM_TABLE_WRITES_OFF);
        out.push('\n');
    }
    out
}

fn raw_rows<T>(rows: &[Captured<T>]) -> Vec<&str> {
    rows.iter().map(|row| row.raw.as_str()).collect()
}

/// Writes snapshot artifacts into one output directory.
pub struct SnapshotWriter {
    output_dir: PathBuf,
    distributed: bool,
    embed_extended: bool,
    encoder: LiteralEncoder,
}

impl SnapshotWriter {
    pub fn new(output_dir: impl Into<PathBuf>, distributed: bool, encoder: LiteralEncoder) -> Self {
        Self {
            output_dir: output_dir.into(),
            distributed,
            embed_extended: true,
            encoder,
        }
    }

    /// Whether extended-statistics pairs are also appended to the base
    /// replay script. The standalone extended script is written either way.
    pub fn embed_extended(mut self, embed: bool) -> Self {
        self.embed_extended = embed;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Writes the base document and replay script, plus the extended
    /// artifacts when extended statistics were captured.
    pub fn write(
        &self,
        base: &BaseStatistics,
        extended: Option<&ExtendedStatistics>,
    ) -> Result<()> {
        // Nothing is written until every statement has encoded.
        let mut statements = base_replay_statements(base, &self.encoder)
            .context("generate statistics replay script")?;
        let extended_statements = match extended {
            Some(extended) => Some(
                extended_replay_statements(extended, &self.encoder)
                    .context("generate extended statistics replay script")?,
            ),
            None => None,
        };
        if self.embed_extended {
            if let Some(extra) = &extended_statements {
                statements.extend(extra.iter().cloned());
            }
        }

        let document = format_document(
            STATISTICS_DOCUMENT_VERSION,
            &[
                ("pg_class", raw_rows(&base.relations)),
                ("pg_statistic", raw_rows(&base.columns)),
            ],
        );
        self.write_file(STATISTICS_DOCUMENT_FILE, &document)?;
        self.write_file(
            STATISTICS_REPLAY_FILE,
            &format_replay_script(self.distributed, &statements),
        )?;

        if let (Some(extended), Some(extended_statements)) = (extended, extended_statements) {
            let document = format_document(
                EXTENDED_DOCUMENT_VERSION,
                &[
                    ("pg_statistic_ext", raw_rows(&extended.descriptors)),
                    ("pg_statistic_ext_data", raw_rows(&extended.payloads)),
                ],
            );
            self.write_file(EXTENDED_DOCUMENT_FILE, &document)?;
            self.write_file(
                EXTENDED_REPLAY_FILE,
                &format_replay_script(self.distributed, &extended_statements),
            )?;
        }

        info!(
            dir = %self.output_dir.display(),
            statements = statements.len(),
            extended = extended.is_some(),
            "wrote statistics snapshot"
        );
        Ok(())
    }

    fn write_file(&self, name: &str, contents: &str) -> Result<()> {
        fs::write(self.output_dir.join(name), contents).with_context(|| format!("write {name}"))
    }
}
