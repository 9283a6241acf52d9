//! Beacon CLI - entrypoint for the custom-domain provisioning service

mod commands;

use clap::{Parser, Subcommand};
use commands::ServeCommand;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "BEACON_LOG_LEVEL", global = true)]
    log_level: String,

    /// Log format: compact, full
    #[arg(
        long,
        default_value = "compact",
        env = "BEACON_LOG_FORMAT",
        global = true
    )]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server and the provisioning scheduler
    Serve(ServeCommand),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = cli.log_level.clone();

    // If RUST_LOG is set, use it directly; otherwise use our default filter
    // with all beacon crates at the requested level and noisy dependencies
    // capped at warn
    let filter = if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .expect("Invalid RUST_LOG environment variable")
    } else {
        tracing_subscriber::EnvFilter::new(format!(
            "beacon_cli={level},\
             beacon_core={level},\
             beacon_database={level},\
             beacon_domains={level},\
             beacon_entities={level},\
             beacon_migrations={level},\
             beacon_provisioner={level},\
             sqlx=warn,\
             sea_orm=warn,\
             hyper=warn,\
             hickory_resolver=warn,\
             rustls=warn"
        ))
    };

    match cli.log_format.as_str() {
        "full" => tracing_subscriber::fmt().with_env_filter(filter).init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init(),
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        match cli.command {
            Commands::Serve(cmd) => cmd.run().await,
        }
    })
}
