//! `cbo_stat_dump` binary entrypoint.

use std::path::PathBuf;

use anyhow::Result;
use cbo_stat_dump::{run, DumpConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Dump optimizer statistics, schema and planner settings for offline replay.
///
/// `-h` selects the host, so help is only available as `--help`.
#[derive(Parser, Debug)]
#[command(name = "cbo_stat_dump", disable_help_flag = true)]
struct Args {
    /// Print help.
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// Database server host.
    #[arg(short = 'h', long, env = "PGHOST", default_value = "localhost")]
    host: String,

    /// Database server port.
    #[arg(short = 'p', long, env = "PGPORT", default_value_t = 5433)]
    port: u16,

    /// Database to dump.
    #[arg(short = 'd', long, env = "PGDATABASE")]
    database: String,

    /// User to connect as.
    #[arg(short = 'u', long, env = "PGUSER")]
    user: String,

    /// Password; also passed to the schema dump.
    #[arg(short = 'W', long, env = "PGPASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Directory that receives every artifact; created when missing.
    #[arg(short = 'o', long)]
    output_dir: PathBuf,

    /// Only dump the relations this query reads, and record its plan.
    #[arg(short = 'q', long)]
    query_file: Option<PathBuf>,

    /// Target is a YugabyteDB cluster.
    #[arg(long)]
    yb_mode: bool,

    /// Set `yb_enable_base_scans_cost_model=ON` before explaining (YugabyteDB only).
    #[arg(long)]
    enable_base_scans_cost_model: bool,

    /// Also append extended statistics to `import_statistics.sql`.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    embed_extended_stats: bool,

    /// Master web port serving `/api/v1/varz` (YugabyteDB only).
    #[arg(long, default_value_t = 7000)]
    gflags_port: u16,

    /// Schema dump program.
    #[arg(long, default_value = "pg_dump")]
    dump_bin: String,

    /// Debug logging for this tool.
    #[arg(short = 'v', long)]
    verbose: bool,
}

impl From<Args> for DumpConfig {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            database: args.database,
            user: args.user,
            password: args.password,
            output_dir: args.output_dir,
            query_file: args.query_file,
            yb_mode: args.yb_mode,
            enable_base_scans_cost_model: args.enable_base_scans_cost_model,
            embed_extended_stats: args.embed_extended_stats,
            gflags_port: args.gflags_port,
            dump_program: args.dump_bin,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_filter = if args.verbose {
        "cbo_stat_dump=debug,warn"
    } else {
        "cbo_stat_dump=info,warn"
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    run(&DumpConfig::from(args)).await?;
    Ok(())
}
