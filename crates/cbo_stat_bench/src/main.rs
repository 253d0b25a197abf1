//! `cbo_stat_bench` binary entrypoint.
//!
//! Checks that a statistics dump is enough to reproduce the source plan: for
//! each benchmark query the source is dumped, a scratch database is rebuilt
//! from the dump, and the two plans are compared.

mod plan_diff;
mod workflow;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::workflow::{run_benchmark, BenchConfig, Endpoint};

const PG_DEFAULT_PORT: u16 = 5432;
const YB_DEFAULT_PORT: u16 = 5433;

/// CLI options for one benchmark run.
#[derive(Parser, Debug, Clone)]
#[command(name = "cbo_stat_bench")]
struct Args {
    /// Benchmark name; selects `test/<name>` and `<name>_db` by default.
    #[arg(short = 'b', long)]
    benchmark: String,

    /// Target is a YugabyteDB cluster.
    #[arg(long)]
    yb_mode: bool,

    /// Directory holding `queries/` and the create scripts.
    #[arg(long)]
    benchmark_path: Option<PathBuf>,

    /// Recreate the production database from `create.sql` (`create.yb.sql` in YugabyteDB mode).
    #[arg(long)]
    create_prod_db: bool,

    #[arg(long, default_value = "localhost")]
    prod_host: String,

    /// Defaults to 5432, or 5433 in YugabyteDB mode.
    #[arg(long)]
    prod_port: Option<u16>,

    /// Defaults to `postgres`, or `yugabyte` in YugabyteDB mode.
    #[arg(long)]
    prod_user: Option<String>,

    #[arg(long)]
    prod_password: Option<String>,

    /// Defaults to `<benchmark>_db`.
    #[arg(long)]
    prod_database: Option<String>,

    /// Scratch server settings; each defaults to its production value.
    #[arg(long)]
    test_host: Option<String>,

    #[arg(long)]
    test_port: Option<u16>,

    #[arg(long)]
    test_user: Option<String>,

    #[arg(long)]
    test_password: Option<String>,

    /// Skip queries whose output directory already exists.
    #[arg(long)]
    ignore_ran_tests: bool,

    #[arg(long)]
    enable_base_scans_cost_model: bool,

    /// Create scratch databases colocated (YugabyteDB only).
    #[arg(long)]
    colocation: bool,

    /// Replay extended statistics along with the base statistics.
    #[arg(long)]
    replay_extended_stats: bool,

    /// Defaults to `test_out_dir/<benchmark>`.
    #[arg(long)]
    outdir: Option<PathBuf>,

    #[arg(long, default_value = "pg_dump")]
    dump_bin: String,

    /// Debug logging.
    #[arg(short = 'd', long)]
    debug: bool,
}

impl Args {
    fn resolve(self) -> Result<BenchConfig> {
        anyhow::ensure!(
            !self.colocation || self.yb_mode,
            "--colocation is only supported with --yb-mode"
        );

        let default_port = if self.yb_mode {
            YB_DEFAULT_PORT
        } else {
            PG_DEFAULT_PORT
        };
        let default_user = if self.yb_mode { "yugabyte" } else { "postgres" };
        let prod = Endpoint {
            host: self.prod_host,
            port: self.prod_port.unwrap_or(default_port),
            user: self.prod_user.unwrap_or_else(|| default_user.to_string()),
            password: self.prod_password,
        };
        let test = Endpoint {
            host: self.test_host.unwrap_or_else(|| prod.host.clone()),
            port: self.test_port.unwrap_or(prod.port),
            user: self.test_user.unwrap_or_else(|| prod.user.clone()),
            password: self.test_password.or_else(|| prod.password.clone()),
        };

        Ok(BenchConfig {
            benchmark_path: self
                .benchmark_path
                .unwrap_or_else(|| PathBuf::from("test").join(&self.benchmark)),
            out_dir: self
                .outdir
                .unwrap_or_else(|| PathBuf::from("test_out_dir").join(&self.benchmark)),
            prod_database: self
                .prod_database
                .unwrap_or_else(|| format!("{}_db", self.benchmark)),
            benchmark: self.benchmark,
            yb_mode: self.yb_mode,
            colocation: self.colocation,
            create_prod_db: self.create_prod_db,
            ignore_ran_tests: self.ignore_ran_tests,
            enable_base_scans_cost_model: self.enable_base_scans_cost_model,
            replay_extended_stats: self.replay_extended_stats,
            prod,
            test,
            dump_program: self.dump_bin,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.debug {
        "cbo_stat_bench=debug,cbo_stat_dump=debug,warn"
    } else {
        "cbo_stat_bench=info,cbo_stat_dump=info,warn"
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = args.resolve()?;
    run_benchmark(&config).await
}
