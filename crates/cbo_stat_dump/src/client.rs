//! Database access seam used by every extractor.
//!
//! Extractors only ever need "run this statement" and "give me the first
//! column of every row as the server's own text". Keeping that behind a trait
//! lets unit and integration tests script catalog responses without a server.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::{debug, warn};

/// Minimal catalog access used by the dump pipeline.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Runs `sql` and returns the first column of every result row as text.
    ///
    /// A SQL `NULL` in that column is an error: every query issued by this
    /// crate selects a non-null value.
    async fn query_text(&self, sql: &str) -> Result<Vec<String>>;

    /// Runs one or more statements, discarding any rows.
    async fn execute(&self, sql: &str) -> Result<()>;
}

#[async_trait]
impl CatalogClient for tokio_postgres::Client {
    async fn query_text(&self, sql: &str) -> Result<Vec<String>> {
        // The simple-query protocol returns every value in its text form,
        // which keeps `row_to_json` output byte-for-byte.
        let messages = self
            .simple_query(sql)
            .await
            .with_context(|| format!("run query `{}`", statement_head(sql)))?;
        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let value = row
                    .try_get(0)
                    .context("read first result column")?
                    .ok_or_else(|| anyhow!("query `{}` returned NULL", statement_head(sql)))?;
                rows.push(value.to_string());
            }
        }
        Ok(rows)
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.batch_execute(sql)
            .await
            .with_context(|| format!("execute `{}`", statement_head(sql)))
    }
}

/// Connection parameters for the source (or target) database.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

/// One open connection whose background driver task is stopped on drop.
pub struct Connection {
    client: tokio_postgres::Client,
    driver: JoinHandle<()>,
}

impl Connection {
    pub async fn open(options: &ConnectOptions) -> Result<Self> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&options.host)
            .port(options.port)
            .user(&options.user)
            .dbname(&options.database)
            .application_name("cbo_stat_dump");
        if let Some(password) = options.password.as_deref() {
            config.password(password);
        }

        let (client, connection) = config.connect(NoTls).await.with_context(|| {
            format!(
                "connect to {}:{}/{} as {}",
                options.host, options.port, options.database, options.user
            )
        })?;
        let driver = tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "database connection closed with error");
            }
        });
        debug!(
            host = %options.host,
            port = options.port,
            database = %options.database,
            "connected"
        );
        Ok(Self { client, driver })
    }

    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// First line of a statement, for error context.
pub(crate) fn statement_head(sql: &str) -> &str {
    sql.trim_start().lines().next().unwrap_or("").trim()
}
