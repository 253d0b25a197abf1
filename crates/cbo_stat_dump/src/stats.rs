//! Base statistics extraction: relation cardinalities and per-column statistics.
//!
//! Each catalog row is fetched as the server's own `row_to_json` text. The
//! text is kept verbatim for the snapshot document and decoded separately for
//! replay-script generation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::client::CatalogClient;
use crate::literal::{quote_literal, statistic_columns, LiteralEncoder, StatColumn, STAT_SLOTS};
use crate::scope::{quote_ident, QualifiedName, RelationScope};
use crate::version::VersionEpoch;

/// Schemas whose relations are never captured when no scope is given.
pub(crate) const SYSTEM_SCHEMAS_FILTER: &str =
    " AND n.nspname NOT IN ('pg_catalog', 'pg_toast', 'information_schema')";

/// Schema used when a type's namespace is not reported.
const DEFAULT_TYPE_SCHEMA: &str = "pg_catalog";
/// Suffix of the primary-key index name the engine generates for a table.
const PRIMARY_KEY_INDEX_SUFFIX: &str = "_pkey";

/// A decoded catalog row together with the exact text the server produced.
#[derive(Debug, Clone)]
pub struct Captured<T> {
    pub raw: String,
    pub decoded: T,
}

/// Size and cardinality estimates of one relation (`pg_class`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelationStat {
    pub relname: String,
    pub relpages: i32,
    pub reltuples: f32,
    pub relallvisible: i32,
    pub nspname: String,
}

impl RelationStat {
    /// `UPDATE pg_class ...` restoring this relation's estimates.
    ///
    /// The statement also matches `<name>_pkey` in the same schema so a
    /// table's primary-key index is updated alongside it.
    pub fn update_statement(&self) -> String {
        format!(
            "UPDATE pg_class SET reltuples = {}, relpages = {}, relallvisible = {} \
             WHERE relnamespace = {}::regnamespace AND (relname = {} OR relname = {});",
            self.reltuples,
            self.relpages,
            self.relallvisible,
            quote_literal(&quote_ident(&self.nspname)),
            quote_literal(&self.relname),
            quote_literal(&format!("{}{PRIMARY_KEY_INDEX_SUFFIX}", self.relname)),
        )
    }
}

#[derive(Debug, Deserialize)]
struct ColumnIdentity {
    nspname: String,
    relname: String,
    attname: String,
    #[serde(default)]
    typnspname: Option<String>,
    typname: String,
}

/// Univariate statistics of one column (`pg_statistic`).
///
/// `fields` holds exactly the statistic columns of the row's epoch, in
/// contract order. Keys the epoch does not know are dropped at decode time.
#[derive(Debug, Clone)]
pub struct ColumnStat {
    pub nspname: String,
    pub relname: String,
    pub attname: String,
    pub typnspname: Option<String>,
    pub typname: String,
    fields: Vec<(&'static StatColumn, Value)>,
}

impl ColumnStat {
    /// Decodes one `row_to_json` row captured under `epoch`.
    pub fn decode(raw: &str, epoch: VersionEpoch) -> Result<Self> {
        let identity: ColumnIdentity =
            serde_json::from_str(raw).context("decode pg_statistic row identity")?;
        let mut row: Map<String, Value> =
            serde_json::from_str(raw).context("decode pg_statistic row")?;

        let mut fields = Vec::new();
        for column in statistic_columns(epoch) {
            let Some(value) = row.remove(column.name) else {
                bail!(
                    "pg_statistic row for {}.{}.{} is missing {}",
                    identity.nspname,
                    identity.relname,
                    identity.attname,
                    column.name
                );
            };
            fields.push((column, value));
        }

        let stat = Self {
            nspname: identity.nspname,
            relname: identity.relname,
            attname: identity.attname,
            typnspname: identity.typnspname.filter(|schema| !schema.is_empty()),
            typname: identity.typname,
            fields,
        };
        stat.check_slot_alignment()?;
        Ok(stat)
    }

    /// Schema-qualified type of the column, e.g. `pg_catalog.int4`.
    pub fn runtime_type(&self) -> String {
        format!(
            "{}.{}",
            self.typnspname.as_deref().unwrap_or(DEFAULT_TYPE_SCHEMA),
            self.typname
        )
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(column, _)| column.name == name)
            .map(|(_, value)| value)
    }

    pub fn relation(&self) -> QualifiedName {
        QualifiedName::new(Some(self.nspname.as_str()), &self.relname)
    }

    /// Slot `i` is described jointly by `stakindi`, `staopi`, `stanumbersi`
    /// and `stavaluesi`. An empty kind must not carry any payload.
    fn check_slot_alignment(&self) -> Result<()> {
        for slot in 1..=STAT_SLOTS {
            let kind = self
                .field(&format!("stakind{slot}"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            if kind != 0 {
                continue;
            }
            for payload in ["stanumbers", "stavalues"] {
                let name = format!("{payload}{slot}");
                if self.field(&name).is_some_and(|value| !value.is_null()) {
                    bail!(
                        "pg_statistic row for {}.{}.{} has {name} without a statistic kind",
                        self.nspname,
                        self.relname,
                        self.attname
                    );
                }
            }
        }
        Ok(())
    }

    /// `DELETE` then `INSERT` restoring this row; the delete makes replay
    /// idempotent against a catalog that already holds a row for the column.
    pub fn replay_statements(&self, encoder: &LiteralEncoder) -> Result<String> {
        let runtime_type = self.runtime_type();
        let mut values = Vec::with_capacity(self.fields.len());
        for (column, value) in &self.fields {
            let literal = encoder
                .encode(column.name, value, column.declared_type(&runtime_type))
                .with_context(|| {
                    format!(
                        "encode {} for {}.{}.{}",
                        column.name, self.nspname, self.relname, self.attname
                    )
                })?;
            values.push(literal);
        }

        let starelid = self.relation().regclass_literal();
        let staattnum = format!(
            "(SELECT a.attnum FROM pg_attribute a WHERE a.attrelid = {starelid} and a.attname = {})",
            quote_literal(&self.attname)
        );
        let stainherit = self
            .field("stainherit")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(format!(
            "DELETE FROM pg_statistic WHERE starelid = {starelid} AND staattnum = {staattnum} AND stainherit = {stainherit};\n\
             INSERT INTO pg_statistic VALUES ({starelid}, {staattnum}, {});",
            values.join(", ")
        ))
    }
}

/// Everything captured by one base-statistics pass.
#[derive(Debug, Clone, Default)]
pub struct BaseStatistics {
    pub relations: Vec<Captured<RelationStat>>,
    pub columns: Vec<Captured<ColumnStat>>,
}

/// `AND (...)` clause limiting `c` to the scope and the scope's indexes.
pub(crate) fn relation_filter(scope: &RelationScope) -> String {
    if scope.is_empty() {
        return String::new();
    }
    let oids = scope
        .iter()
        .map(QualifiedName::regclass_oid_literal)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        " AND (c.oid IN ({oids}) OR c.oid IN (SELECT indexrelid FROM pg_index WHERE indrelid IN ({oids})))"
    )
}

fn scope_filters(scope: &RelationScope) -> String {
    if scope.is_empty() {
        SYSTEM_SCHEMAS_FILTER.to_string()
    } else {
        relation_filter(scope)
    }
}

/// Query returning one `row_to_json` row per in-scope relation.
pub fn relation_stats_query(scope: &RelationScope) -> String {
    format!(
        "SELECT row_to_json(t) FROM \
         (SELECT c.relname, c.relpages, c.reltuples, c.relallvisible, n.nspname \
         FROM pg_class c JOIN pg_namespace n ON c.relnamespace = n.oid{}) t \
         ORDER BY t.nspname, t.relname",
        scope_filters(scope)
    )
}

/// Query returning one `row_to_json` row per statisticized in-scope column.
pub fn column_stats_query(epoch: VersionEpoch, scope: &RelationScope) -> String {
    let columns = statistic_columns(epoch)
        .iter()
        .map(|column| format!("s.{}", column.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT row_to_json(t) FROM \
         (SELECT n.nspname nspname, c.relname relname, a.attname attname, \
         (SELECT nspname FROM pg_namespace WHERE oid = ty.typnamespace) typnspname, \
         ty.typname typname, {columns} \
         FROM pg_class c \
         JOIN pg_namespace n ON c.relnamespace = n.oid{} \
         JOIN pg_statistic s ON s.starelid = c.oid \
         JOIN pg_attribute a ON c.oid = a.attrelid AND s.staattnum = a.attnum \
         JOIN pg_type ty ON a.atttypid = ty.oid) t \
         ORDER BY t.nspname, t.relname, t.attname, t.stainherit",
        scope_filters(scope)
    )
}

/// Extracts base statistics over one connection.
pub struct StatisticsExtractor<'a> {
    client: &'a dyn CatalogClient,
    epoch: VersionEpoch,
}

impl<'a> StatisticsExtractor<'a> {
    pub fn new(client: &'a dyn CatalogClient, epoch: VersionEpoch) -> Self {
        Self { client, epoch }
    }

    pub async fn extract(&self, scope: &RelationScope) -> Result<BaseStatistics> {
        let relation_rows = self
            .client
            .query_text(&relation_stats_query(scope))
            .await
            .context("query pg_class statistics")?;
        let mut relations = Vec::with_capacity(relation_rows.len());
        for raw in relation_rows {
            let decoded: RelationStat =
                serde_json::from_str(&raw).with_context(|| format!("decode pg_class row {raw}"))?;
            relations.push(Captured { raw, decoded });
        }

        let column_rows = self
            .client
            .query_text(&column_stats_query(self.epoch, scope))
            .await
            .context("query pg_statistic")?;
        let mut columns = Vec::with_capacity(column_rows.len());
        for raw in column_rows {
            let decoded = ColumnStat::decode(&raw, self.epoch)?;
            debug!(
                relation = %decoded.relation(),
                column = %decoded.attname,
                "captured column statistics"
            );
            columns.push(Captured { raw, decoded });
        }

        info!(
            relations = relations.len(),
            columns = columns.len(),
            collation = self.epoch.has_collation(),
            "extracted base statistics"
        );
        Ok(BaseStatistics { relations, columns })
    }
}

/// Replay statements for every captured relation and column, in order.
pub fn base_replay_statements(
    statistics: &BaseStatistics,
    encoder: &LiteralEncoder,
) -> Result<Vec<String>> {
    let mut statements = Vec::with_capacity(statistics.relations.len() + statistics.columns.len());
    for relation in &statistics.relations {
        statements.push(relation.decoded.update_statement());
    }
    for column in &statistics.columns {
        statements.push(column.decoded.replay_statements(encoder)?);
    }
    Ok(statements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::ScriptedClient;

    const USERS_ID_ROW_PG14: &str = r#"{"nspname":"public","relname":"users","attname":"id","typnspname":"pg_catalog","typname":"int4","stainherit":false,"stanullfrac":0,"stawidth":4,"stadistinct":-1,"stakind1":1,"stakind2":0,"stakind3":0,"stakind4":0,"stakind5":0,"staop1":96,"staop2":0,"staop3":0,"staop4":0,"staop5":0,"stanumbers1":[0.5,0.5],"stanumbers2":null,"stanumbers3":null,"stanumbers4":null,"stanumbers5":null,"stavalues1":[10,20],"stavalues2":null,"stavalues3":null,"stavalues4":null,"stavalues5":null}"#;

    fn scope_of(names: &[&str]) -> RelationScope {
        names.iter().map(|name| QualifiedName::parse(name)).collect()
    }

    #[test]
    fn column_insert_uses_typed_literals() {
        let stat = ColumnStat::decode(USERS_ID_ROW_PG14, VersionEpoch::PreCollation).unwrap();
        assert_eq!(stat.runtime_type(), "pg_catalog.int4");
        let sql = stat
            .replay_statements(&LiteralEncoder::new(VersionEpoch::PreCollation))
            .unwrap();

        assert!(sql.starts_with(
            "DELETE FROM pg_statistic WHERE starelid = 'public.users'::regclass AND staattnum = (SELECT a.attnum FROM pg_attribute a WHERE a.attrelid = 'public.users'::regclass and a.attname = 'id') AND stainherit = false;\n"
        ));
        assert!(sql.contains("INSERT INTO pg_statistic VALUES ('public.users'::regclass, (SELECT"));
        assert!(sql.contains(
            "false::boolean, 0::real, 4::integer, -1::real, 1::smallint, 0::smallint"
        ));
        assert!(sql.contains("'{0.5,0.5}'::real[]"));
        assert!(sql.contains(
            "array_in('{\"10\", \"20\"}', 'pg_catalog.int4'::regtype, -1)::anyarray"
        ));
        assert!(!sql.contains("stacoll"));
        assert!(sql.ends_with("NULL::anyarray);"));
    }

    #[test]
    fn decode_ignores_unknown_keys_and_requires_known_ones() {
        let with_extra = USERS_ID_ROW_PG14.replacen('{', r#"{"future_column":7,"#, 1);
        let stat = ColumnStat::decode(&with_extra, VersionEpoch::PreCollation).unwrap();
        assert!(stat.field("future_column").is_none());

        // Collation epoch expects stacoll fields the PG14 row does not have.
        let err = ColumnStat::decode(USERS_ID_ROW_PG14, VersionEpoch::Collation).unwrap_err();
        assert!(err.to_string().contains("missing stacoll1"));
    }

    #[test]
    fn misaligned_slot_is_rejected() {
        let broken = USERS_ID_ROW_PG14.replace(r#""stanumbers2":null"#, r#""stanumbers2":[1.0]"#);
        let err = ColumnStat::decode(&broken, VersionEpoch::PreCollation).unwrap_err();
        assert!(err.to_string().contains("stanumbers2 without a statistic kind"));
    }

    #[test]
    fn missing_type_schema_defaults_to_pg_catalog() {
        let row = USERS_ID_ROW_PG14.replace(r#""typnspname":"pg_catalog""#, r#""typnspname":null"#);
        let stat = ColumnStat::decode(&row, VersionEpoch::PreCollation).unwrap();
        assert_eq!(stat.runtime_type(), "pg_catalog.int4");
    }

    #[test]
    fn relation_update_covers_primary_key_index() {
        let relation = RelationStat {
            relname: "users".to_string(),
            relpages: 10,
            reltuples: 1000.0,
            relallvisible: 0,
            nspname: "public".to_string(),
        };
        assert_eq!(
            relation.update_statement(),
            "UPDATE pg_class SET reltuples = 1000, relpages = 10, relallvisible = 0 \
             WHERE relnamespace = 'public'::regnamespace AND (relname = 'users' OR relname = 'users_pkey');"
        );
    }

    #[test]
    fn queries_follow_scope_and_epoch() {
        let unscoped = relation_stats_query(&RelationScope::new());
        assert!(unscoped.contains("NOT IN ('pg_catalog', 'pg_toast', 'information_schema')"));

        let scope = scope_of(&["public.orders", "public.customers"]);
        let scoped = relation_stats_query(&scope);
        assert!(scoped.contains(
            "c.oid IN ('public.customers'::regclass::oid, 'public.orders'::regclass::oid) OR c.oid IN (SELECT indexrelid FROM pg_index WHERE indrelid IN"
        ));
        assert!(!scoped.contains("information_schema"));

        let pre = column_stats_query(VersionEpoch::PreCollation, &scope);
        let post = column_stats_query(VersionEpoch::Collation, &scope);
        assert!(!pre.contains("s.stacoll1"));
        assert!(post.contains("s.staop5, s.stacoll1, s.stacoll2, s.stacoll3, s.stacoll4, s.stacoll5, s.stanumbers1"));
    }

    #[tokio::test]
    async fn extract_keeps_raw_text_and_decodes() {
        let class_row = r#"{"relname":"users","relpages":10,"reltuples":1e+06,"relallvisible":3,"nspname":"public"}"#;
        // The statistic query also joins pg_class, so it is scripted first.
        let client = ScriptedClient::new()
            .respond("JOIN pg_statistic s", &[USERS_ID_ROW_PG14])
            .respond("FROM pg_class c JOIN pg_namespace n", &[class_row]);
        let extractor = StatisticsExtractor::new(&client, VersionEpoch::PreCollation);
        let stats = extractor.extract(&RelationScope::new()).await.unwrap();

        assert_eq!(stats.relations.len(), 1);
        assert_eq!(stats.relations[0].raw, class_row);
        assert_eq!(stats.relations[0].decoded.reltuples, 1_000_000.0);
        assert_eq!(stats.columns.len(), 1);
        assert_eq!(stats.columns[0].raw, USERS_ID_ROW_PG14);

        let statements =
            base_replay_statements(&stats, &LiteralEncoder::new(VersionEpoch::PreCollation))
                .unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("UPDATE pg_class SET reltuples = 1000000,"));
    }

    #[tokio::test]
    async fn decode_failure_is_fatal() {
        let client = ScriptedClient::new()
            .respond("FROM pg_class c JOIN pg_namespace n", &[r#"{"relname":"x"}"#]);
        let extractor = StatisticsExtractor::new(&client, VersionEpoch::PreCollation);
        let err = extractor.extract(&RelationScope::new()).await.unwrap_err();
        assert!(format!("{err:#}").contains("decode pg_class row"));
    }
}
