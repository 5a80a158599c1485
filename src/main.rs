use clap::{Parser, Subcommand};
use relevo::config::{Config, ConfigError};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relevo")]
#[command(about = "A failover-aware connectivity layer for clustered relational databases")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Relevo Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long, default_value = "relevo.toml")]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { output } => {
            generate_config(output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

fn generate_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output)
        .map_err(|e| format!("Failed to generate config: {}", e))?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your cluster and validate it with:");
    println!("  relevo validate --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            init_logging(&config);

            println!("✓ Configuration file is valid");
            println!(
                "  Topology refresh interval: {}ms",
                config.topology.refresh_interval_ms
            );
            println!(
                "  Topology staleness threshold: {}ms",
                config.topology.staleness_threshold_ms
            );
            println!(
                "  Host probe: every {}ms, timeout {}ms, dead after {} failures",
                config.monitor.probe_interval_ms,
                config.monitor.probe_timeout_ms,
                config.monitor.failure_threshold
            );
            println!(
                "  Writer failover budget: {}ms (poll every {}ms)",
                config.failover.writer_failover_timeout_ms,
                config.failover.writer_poll_interval_ms
            );
            println!(
                "  Reconnect: {} attempts, backoff {}ms..{}ms",
                config.failover.reconnect_max_attempts,
                config.failover.reconnect_backoff_base_ms,
                config.failover.reconnect_backoff_cap_ms
            );
            println!(
                "  Calls during failover: {}",
                if config.failover.reject_calls_during_failover {
                    "rejected"
                } else {
                    "queued"
                }
            );
            println!(
                "  Retry reads after failover: {}",
                config.failover.retry_reads_after_failover
            );
            println!("  Log level: {}", config.logging.level);
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
            }
            return Err(Box::new(e));
        }
    }

    Ok(())
}

fn show_version() {
    println!("relevo v{}", env!("CARGO_PKG_VERSION"));
    println!("A failover-aware connectivity layer for clustered relational databases");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Shared cluster topology cache with collapsed refreshes");
    println!("  • Per-host liveness probing with reference-counted monitors");
    println!("  • Pluggable call pipeline around every connection");
    println!("  • Automatic writer and reader failover with session replay");
    println!("  • Async I/O with Tokio");
}

/// RUST_LOG wins over the configured level when set.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
