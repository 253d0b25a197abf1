//! Server version detection and the catalog-shape policy derived from it.
//!
//! The statistics catalog changes shape at exactly one point this tool cares
//! about: from major version 15 onward every statistic slot carries a
//! collation column. Extended statistics have their own, independent minimum.

use anyhow::{anyhow, Context, Result};

use crate::client::CatalogClient;

/// Major version from which `pg_statistic` rows are read and written with
/// `stacoll1..5`. The catalog itself gained those columns in 12, so dumps
/// from 12 to 14 produce positionally misaligned `INSERT`s; those servers are
/// not supported.
pub const COLLATION_MIN_MAJOR: u32 = 15;
/// First major version whose extended-statistics data this tool can capture.
pub const EXTENDED_STATS_MIN_MAJOR: u32 = 15;

/// Server version as reported by `server_version_num` (e.g. `150004`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    num: u32,
}

impl ServerVersion {
    pub fn from_num(num: u32) -> Self {
        Self { num }
    }

    /// Parses the text form of `SHOW server_version_num`.
    pub fn parse(raw: &str) -> Result<Self> {
        let num = raw
            .trim()
            .parse::<u32>()
            .with_context(|| format!("invalid server_version_num: {raw:?}"))?;
        Ok(Self { num })
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn major(&self) -> u32 {
        self.num / 10_000
    }

    pub fn epoch(&self) -> VersionEpoch {
        epoch_for(self.major())
    }

    pub fn supports_extended_statistics(&self) -> bool {
        self.major() >= EXTENDED_STATS_MIN_MAJOR
    }
}

/// Catalog shape split. All column sets and literal orderings are keyed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionEpoch {
    /// Slots are `(kind, operator)` pairs.
    PreCollation,
    /// Slots are `(kind, operator, collation)` triples.
    Collation,
}

impl VersionEpoch {
    pub fn has_collation(self) -> bool {
        matches!(self, Self::Collation)
    }
}

/// Maps a major version number to its catalog epoch.
pub fn epoch_for(major: u32) -> VersionEpoch {
    if major >= COLLATION_MIN_MAJOR {
        VersionEpoch::Collation
    } else {
        VersionEpoch::PreCollation
    }
}

/// Asks the connected server for its numeric version.
pub async fn detect_server_version(client: &dyn CatalogClient) -> Result<ServerVersion> {
    let rows = client
        .query_text("SHOW server_version_num")
        .await
        .context("query server_version_num")?;
    let raw = rows
        .first()
        .ok_or_else(|| anyhow!("SHOW server_version_num returned no rows"))?;
    ServerVersion::parse(raw)
}
