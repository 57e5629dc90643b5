//! kiosk - fetch, unpack and run display modules.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use kiosk::config::{default_config_path, Config};
use kiosk::plugins::{CachedClient, Extraction, PluginInstance, ProxyClient, Service, TracingLogger};

mod headless;

use headless::HeadlessUi;

/// Kiosk module runner
#[derive(Parser)]
#[command(name = "kiosk")]
#[command(about = "Fetch, unpack and run kiosk display modules", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Module root (overrides plugins.dir)
    #[arg(long)]
    modules: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Extract every configured module and exit
    Extract,
    /// Extract and start every configured module until interrupted (default)
    Run,
}

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn close_all(instances: Vec<PluginInstance>) {
    for mut instance in instances {
        if let Err(e) = instance.close() {
            tracing::error!(module = %instance.name(), error = %e, "Failed to close module");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config_path = cli
        .config
        .clone()
        .or_else(default_config_path)
        .context("could not determine a config location; pass --config")?;
    let config = Config::load(&config_path)?;
    let registry = config.registry()?;

    let mod_root = match &cli.modules {
        Some(dir) => dir.clone(),
        None => config.plugins.modules_dir()?,
    };
    let cache_dir = config.plugins.cache_dir()?;
    for dir in [&mod_root, &cache_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("could not create {}", dir.display()))?;
    }

    let http = reqwest::Client::builder()
        .timeout(config.registry.timeout())
        .build()
        .context("could not build HTTP client")?;
    let proxy = ProxyClient::new(&config.registry.proxy_url)?.with_http_client(http);
    let client = CachedClient::new(proxy, &cache_dir)?;
    let service = Service::new(&mod_root, client).with_fuel_limit(config.plugins.fuel_limit);

    tracing::info!(
        config = %config_path.display(),
        modules = registry.len(),
        root = %mod_root.display(),
        proxy = %config.registry.proxy_url,
        "Starting kiosk"
    );

    for desc in &registry {
        let outcome = service
            .extract(desc)
            .await
            .with_context(|| format!("{}: could not extract module {}", desc.name, desc.path))?;
        match outcome {
            Extraction::Extracted { version, .. } => {
                tracing::info!(module = %desc.name, %version, "Module extracted");
            }
            Extraction::Current { version, .. } => {
                tracing::info!(module = %desc.name, %version, "Module up to date");
            }
            Extraction::UserOwned { .. } | Extraction::Skipped => {}
        }
    }

    if matches!(cli.command, Some(Command::Extract)) {
        return Ok(());
    }

    let ctx = CancellationToken::new();
    let mut running = Vec::with_capacity(registry.len());
    for desc in &registry {
        let ui = Arc::new(HeadlessUi::new(&desc.name, desc.position));
        let logger = Arc::new(TracingLogger::new(&desc.name));
        match service.run(&ctx, desc, ui, logger) {
            Ok(instance) => running.push(instance),
            Err(e) => {
                tracing::error!(module = %desc.name, kind = e.kind(), error = %e, "Module failed to start");
                ctx.cancel();
                close_all(running);
                return Err(e.into());
            }
        }
    }

    tracing::info!(running = running.len(), "All modules started; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("could not listen for Ctrl-C")?;

    tracing::info!("Shutting down");
    ctx.cancel();
    close_all(running);
    Ok(())
}
