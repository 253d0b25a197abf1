//! Relation scope resolution from a structured execution plan.
//!
//! The server is asked to explain the query as a JSON plan tree; every plan
//! node that names a relation contributes that relation to the scope. The
//! resulting set restricts statistics extraction to what the query touches.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::client::CatalogClient;

/// Session parameter that switches the distributed engine to its base-scan cost model.
pub const BASE_SCANS_COST_MODEL_SET: &str = "SET yb_enable_base_scans_cost_model=ON";

/// A relation name, optionally schema-qualified.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    pub schema: Option<String>,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: Option<&str>, name: &str) -> Self {
        Self {
            schema: schema.filter(|s| !s.is_empty()).map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Parses `schema.name` or a bare `name`.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('.') {
            Some((schema, name)) => Self::new(Some(schema), name),
            None => Self::new(None, raw),
        }
    }

    /// SQL literal resolving this relation: `'"S"."n"'::regclass`.
    pub fn regclass_literal(&self) -> String {
        let ident = match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        };
        format!("'{}'::regclass", ident.replace('\'', "''"))
    }

    /// Same as [`Self::regclass_literal`], cast on to `oid` for `IN` lists.
    pub fn regclass_oid_literal(&self) -> String {
        format!("{}::oid", self.regclass_literal())
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Deduplicated set of relations referenced by a query.
pub type RelationScope = BTreeSet<QualifiedName>;

/// Double-quotes an identifier unless it is a plain lower-case identifier.
pub fn quote_ident(ident: &str) -> String {
    let plain = ident
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$');
    if plain {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

#[derive(Debug, Deserialize)]
struct ExplainEntry {
    #[serde(rename = "Plan")]
    plan: PlanNode,
}

/// The subset of a plan node this resolver reads; every other key is ignored.
#[derive(Debug, Deserialize)]
struct PlanNode {
    #[serde(rename = "Relation Name", default)]
    relation_name: Option<String>,
    #[serde(rename = "Schema", default)]
    schema: Option<String>,
    #[serde(rename = "Plans", default)]
    plans: Vec<PlanNode>,
}

/// Extracts the relation scope from `EXPLAIN (FORMAT JSON)` output text.
pub fn relations_in_plan_json(plan_json: &str) -> Result<RelationScope> {
    let entries: Vec<ExplainEntry> =
        serde_json::from_str(plan_json).context("parse explain json plan")?;
    let mut relations = RelationScope::new();
    if let Some(first) = entries.first() {
        collect_relations(&first.plan, &mut relations);
    }
    Ok(relations)
}

fn collect_relations(node: &PlanNode, relations: &mut RelationScope) {
    if let Some(name) = node.relation_name.as_deref().filter(|n| !n.is_empty()) {
        relations.insert(QualifiedName::new(node.schema.as_deref(), name));
    }
    for child in &node.plans {
        collect_relations(child, relations);
    }
}

/// Applies the optional cost-model session setting. The change lasts for the
/// rest of the session, so later stages observe it too.
pub async fn apply_cost_model_setting(
    client: &dyn CatalogClient,
    enable_base_scans_cost_model: bool,
) -> Result<()> {
    if enable_base_scans_cost_model {
        client
            .execute(BASE_SCANS_COST_MODEL_SET)
            .await
            .context("set yb_enable_base_scans_cost_model")?;
    }
    Ok(())
}

/// Explains `query` on the server and returns the relations its plan reads.
pub async fn resolve_relation_scope(
    client: &dyn CatalogClient,
    query: &str,
    enable_base_scans_cost_model: bool,
) -> Result<RelationScope> {
    apply_cost_model_setting(client, enable_base_scans_cost_model).await?;

    // VERBOSE makes scan nodes carry their schema.
    let explain = format!("EXPLAIN (VERBOSE, FORMAT JSON) {query}");
    let lines = client
        .query_text(&explain)
        .await
        .context("explain query for relation scope")?;
    let relations = relations_in_plan_json(&lines.concat())?;
    debug!(
        relations = %relations.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
        "resolved relation scope"
    );
    Ok(relations)
}
