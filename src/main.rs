use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use feedrelay::config::Config;
use feedrelay::server;
use feedrelay::service::Service;
use feedrelay::storage::{Database, DatabaseError};

#[derive(Parser, Debug)]
#[command(name = "feedrelay", version, about = "Feed aggregator daemon routing new entries to outputs")]
struct Args {
    /// Configuration file
    #[arg(long, short, value_name = "FILE", default_value = "feedrelay.toml")]
    config: PathBuf,

    /// SQLite database path (overrides the config file)
    #[arg(long, value_name = "FILE")]
    database: Option<String>,

    /// Address to serve HTTP on (overrides the config file)
    #[arg(long, value_name = "ADDR")]
    listen_addr: Option<String>,

    /// Externally reachable base URL used for push callbacks
    #[arg(long, value_name = "URL")]
    public_url: Option<String>,

    /// Forget all seen articles before starting
    #[arg(long)]
    clear_cache: bool,

    /// Print the available plugins and exit
    #[arg(long)]
    list_plugins: bool,
}

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config '{}'", args.config.display()))?;
    if let Some(database) = args.database {
        config.database_path = database;
    }
    if let Some(listen_addr) = args.listen_addr {
        config.listen_addr = listen_addr;
    }
    if let Some(public_url) = args.public_url {
        config.public_url = Some(public_url);
    }
    config.validate().context("Invalid command-line override")?;

    init_tracing(&config.log_level);
    tracing::debug!(config = ?config, "Effective configuration");

    let db = match Database::open(&config.database_path).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: the database '{}' is locked by another feedrelay instance.",
                config.database_path
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    let service = Service::from_config(&config, db).await?;

    if args.list_plugins {
        let specs = serde_json::json!({
            "outputs": service.output_plugins(),
            "filters": service.filter_plugins(),
        });
        println!("{}", serde_json::to_string_pretty(&specs)?);
        return Ok(());
    }

    if args.clear_cache {
        let removed = service.clear_cache().await.context("Failed to clear cache")?;
        println!("Cleared {} cached fingerprints", removed);
    }

    service.seed(&config).await.context("Failed to seed definitions")?;
    service
        .aggregator
        .start()
        .await
        .context("Failed to start aggregator")?;

    let addr = config.listen_socket()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(addr = %addr, push = config.public_url.is_some(), "Listening");

    let app = server::router(service.aggregator.clone());
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let stopped = service.aggregator.shutdown(config.shutdown_timeout()).await;
    served.context("HTTP server error")?;
    if let Err(e) = stopped {
        tracing::warn!(error = %e, "Aggregator did not stop cleanly");
    }

    tracing::info!("Goodbye");
    Ok(())
}
