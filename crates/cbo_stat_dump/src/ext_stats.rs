//! Extended (multi-column) statistics extraction.
//!
//! Descriptors come from `pg_statistic_ext` with member columns resolved to
//! names; payloads come from `pg_statistic_ext_data`. The three opaque blobs
//! are carried as `bytea` text, and the per-expression statistics are rebuilt
//! through [`LiteralEncoder::encode_expression_statistics`].

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::client::CatalogClient;
use crate::literal::{quote_literal, LiteralEncoder};
use crate::scope::{quote_ident, RelationScope};
use crate::stats::{relation_filter, Captured, SYSTEM_SCHEMAS_FILTER};

/// Definition of one statistics object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExtendedStatDescriptor {
    pub relname: String,
    pub stxname: String,
    pub nspname: String,
    pub stxowner: u32,
    /// `NULL` on servers where the default target is stored as null.
    #[serde(default)]
    pub stxstattarget: Option<i32>,
    #[serde(deserialize_with = "comma_list")]
    pub stxkeys: Vec<String>,
    #[serde(default)]
    pub stxkind: Value,
    #[serde(default)]
    pub stxexprs: Option<String>,
}

fn comma_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .split(',')
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect())
}

/// Computed data of one statistics object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExtendedStatPayload {
    pub stxname: String,
    pub stxnspname: String,
    pub stxdinherit: bool,
    #[serde(default)]
    pub stxdndistinct: Option<String>,
    #[serde(default)]
    pub stxddependencies: Option<String>,
    #[serde(default)]
    pub stxdmcv: Option<String>,
    /// Array of `pg_statistic`-shaped objects, or null.
    #[serde(default)]
    pub stxdexpr: Value,
}

impl ExtendedStatPayload {
    fn object_oid_subquery(&self) -> String {
        format!(
            "(SELECT oid FROM pg_statistic_ext WHERE stxname = {} AND stxnamespace = {}::regnamespace)",
            quote_literal(&self.stxname),
            quote_literal(&quote_ident(&self.stxnspname))
        )
    }

    /// `DELETE` then `INSERT` restoring this object's computed data.
    pub fn replay_statements(&self, encoder: &LiteralEncoder) -> Result<String> {
        let stxoid = self.object_oid_subquery();
        let stxdexpr = encoder
            .encode_expression_statistics(&self.stxdexpr)
            .with_context(|| format!("encode stxdexpr for {}", self.stxname))?;
        Ok(format!(
            "DELETE FROM pg_statistic_ext_data WHERE stxoid = {stxoid} AND stxdinherit = {};\n\
             INSERT INTO pg_statistic_ext_data VALUES ({stxoid}, {}, {}, {}, {}, {stxdexpr});",
            self.stxdinherit,
            self.stxdinherit,
            bytea_literal(self.stxdndistinct.as_deref()),
            bytea_literal(self.stxddependencies.as_deref()),
            bytea_literal(self.stxdmcv.as_deref()),
        ))
    }
}

fn bytea_literal(blob: Option<&str>) -> String {
    match blob {
        Some(text) => format!("{}::bytea", quote_literal(text)),
        None => "NULL".to_string(),
    }
}

/// Everything captured by one extended-statistics pass.
#[derive(Debug, Clone, Default)]
pub struct ExtendedStatistics {
    pub descriptors: Vec<Captured<ExtendedStatDescriptor>>,
    pub payloads: Vec<Captured<ExtendedStatPayload>>,
}

impl ExtendedStatistics {
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty() && self.payloads.is_empty()
    }
}

fn scope_filters(scope: &RelationScope) -> String {
    format!("{SYSTEM_SCHEMAS_FILTER}{}", relation_filter(scope))
}

pub fn descriptor_query(scope: &RelationScope) -> String {
    format!(
        "SELECT row_to_json(t) FROM \
         (SELECT c.relname, s.stxname, n.nspname, s.stxowner, s.stxstattarget, \
         string_agg(a.attname, ',' ORDER BY a.attnum) AS stxkeys, s.stxkind, s.stxexprs \
         FROM pg_class c \
         JOIN pg_statistic_ext s ON c.oid = s.stxrelid \
         JOIN pg_attribute a ON c.oid = a.attrelid AND a.attnum = ANY(s.stxkeys) \
         JOIN pg_namespace n ON c.relnamespace = n.oid{} \
         GROUP BY c.relname, s.stxname, n.nspname, s.stxowner, s.stxstattarget, s.stxkind, s.stxexprs) t \
         ORDER BY t.nspname, t.stxname",
        scope_filters(scope)
    )
}

pub fn payload_query(scope: &RelationScope) -> String {
    format!(
        "SELECT row_to_json(t) FROM \
         (SELECT s.stxname, \
         (SELECT nspname FROM pg_namespace WHERE oid = s.stxnamespace) stxnspname, \
         d.stxdinherit, d.stxdndistinct::bytea, d.stxddependencies::bytea, d.stxdmcv::bytea, d.stxdexpr \
         FROM pg_statistic_ext s \
         JOIN pg_statistic_ext_data d ON s.oid = d.stxoid \
         JOIN pg_class c ON c.oid = s.stxrelid \
         JOIN pg_namespace n ON c.relnamespace = n.oid{}) t \
         ORDER BY t.stxnspname, t.stxname, t.stxdinherit",
        scope_filters(scope)
    )
}

/// Extracts extended statistics over one connection.
///
/// Callers only construct this once the server version supports extended
/// statistics.
pub struct ExtendedStatisticsExtractor<'a> {
    client: &'a dyn CatalogClient,
}

impl<'a> ExtendedStatisticsExtractor<'a> {
    pub fn new(client: &'a dyn CatalogClient) -> Self {
        Self { client }
    }

    pub async fn extract(&self, scope: &RelationScope) -> Result<ExtendedStatistics> {
        let descriptor_rows = self
            .client
            .query_text(&descriptor_query(scope))
            .await
            .context("query pg_statistic_ext")?;
        let mut descriptors = Vec::with_capacity(descriptor_rows.len());
        for raw in descriptor_rows {
            let decoded: ExtendedStatDescriptor = serde_json::from_str(&raw)
                .with_context(|| format!("decode pg_statistic_ext row {raw}"))?;
            descriptors.push(Captured { raw, decoded });
        }

        let payload_rows = self
            .client
            .query_text(&payload_query(scope))
            .await
            .context("query pg_statistic_ext_data")?;
        let mut payloads = Vec::with_capacity(payload_rows.len());
        for raw in payload_rows {
            let decoded: ExtendedStatPayload = serde_json::from_str(&raw)
                .context("decode pg_statistic_ext_data row")?;
            payloads.push(Captured { raw, decoded });
        }

        info!(
            objects = descriptors.len(),
            payloads = payloads.len(),
            "extracted extended statistics"
        );
        Ok(ExtendedStatistics {
            descriptors,
            payloads,
        })
    }
}

/// Replay statements for every captured payload, in order.
pub fn extended_replay_statements(
    statistics: &ExtendedStatistics,
    encoder: &LiteralEncoder,
) -> Result<Vec<String>> {
    statistics
        .payloads
        .iter()
        .map(|payload| payload.decoded.replay_statements(encoder))
        .collect()
}
