use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quotagate::config::{LimiterConfig, Mode};
use quotagate::ratelimit::{new_limiter, Context, LimitSpec};
use quotagate::store::{MemoryStore, ScheduleStore};

#[derive(Parser)]
#[command(name = "quotagate", version, about = "Token-bucket admission control")]
struct Cli {
    /// YAML configuration file; QUOTAGATE__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `info` or `quotagate=debug`
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fire a sequence of admission checks and print each decision
    Probe {
        /// Key identifying the quota scope
        #[arg(long)]
        key: String,

        /// Tokens refilled per second
        #[arg(long)]
        rate: f64,

        /// Bucket capacity
        #[arg(long)]
        burst: u64,

        /// Units requested per check
        #[arg(long, default_value_t = 1)]
        n: u64,

        /// Number of checks to run
        #[arg(long, default_value_t = 10)]
        requests: u32,

        /// Pause between checks in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Override the configured backend
        #[arg(long)]
        mode: Option<Mode>,
    },
    /// Load and validate the configuration, then print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs)?;

    let mut config = LimiterConfig::load(cli.config.as_deref())?;
    info!(mode = %config.mode, "Configuration loaded");

    match cli.command {
        Command::CheckConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Probe {
            key,
            rate,
            burst,
            n,
            requests,
            interval_ms,
            mode,
        } => {
            if let Some(mode) = mode {
                config.mode = mode;
            }

            // Without a real store to connect to, distributed mode runs against
            // an in-process one.
            let store: Option<Arc<dyn ScheduleStore>> = match config.mode {
                Mode::Distributed => Some(Arc::new(MemoryStore::new())),
                Mode::Standalone => None,
            };
            let limiter = new_limiter(&config, store)?;
            let spec = LimitSpec::new(rate, burst);
            let ctx = Context::background();

            let probe = async {
                let mut admitted = 0u32;
                for i in 1..=requests {
                    let allowed = limiter.allow_n(&ctx, &key, spec, n).await?;
                    if allowed {
                        admitted += 1;
                    }
                    println!("request {:>4}: {}", i, if allowed { "allowed" } else { "denied" });
                    if interval_ms > 0 && i < requests {
                        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                    }
                }
                anyhow::Ok(admitted)
            };

            tokio::select! {
                result = probe => {
                    let admitted = result?;
                    println!("{} of {} requests admitted", admitted, requests);
                }
                _ = shutdown_signal() => {}
            }

            limiter.close().await;
        }
    }

    Ok(())
}

fn init_tracing(directive: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(directive))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping probe");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping probe");
        }
    }
}
