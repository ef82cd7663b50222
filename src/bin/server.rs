//! Validation server binary

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use octofhir_validator_service::core::{Args, Command, MonitoringConfig, ServiceConfig};
use octofhir_validator_service::engine::session;
use octofhir_validator_service::Server;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServiceConfig::load(&args).context("Failed to load configuration")?;

    init_tracing(&config.monitoring)?;

    match args.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Prepare => prepare(config).await,
    }
}

fn init_tracing(monitoring: &MonitoringConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&monitoring.log_level)
        .with_context(|| format!("Invalid log level '{}'", monitoring.log_level))?;

    if monitoring.structured_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

async fn serve(config: ServiceConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        fhir_version = %config.engine.fhir_version,
        terminology = %config.terminology.mode,
        "Starting validation server"
    );

    let server = match Server::new(config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Engine initialization failed, not serving traffic");
            return Err(e).context("Engine initialization failed");
        }
    };

    server.start().await?;
    Ok(())
}

/// Resolve every configured package into the cache, then exit
async fn prepare(config: ServiceConfig) -> Result<()> {
    let loader = session::package_loader(&config.engine)?;
    match session::load_packages(&config.engine, &loader).await {
        Ok(packages) => {
            for package in &packages {
                info!(
                    package = %package.key(),
                    resources = package.resources.len(),
                    "Package ready"
                );
            }
            info!(
                packages = packages.len(),
                cache = %loader.cache_dir().display(),
                "Packages prepared"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Package preparation failed");
            Err(e).context("Package preparation failed")
        }
    }
}
