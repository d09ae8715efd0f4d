mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use manifold::{Proxy, client_config};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // Logs go to stderr so stdout stays clean for the printed config.
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("failed to read config file: {}", cli.config.display()))?;
    let doc: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", cli.config.display()))?;

    let proxy = Proxy::new(cli.name.clone());
    let added = proxy.load_registrations(&doc).await;
    if added == 0 {
        anyhow::bail!("no usable backends in {}", cli.config.display());
    }
    info!(proxy = %proxy.name(), backends = added, "starting proxy");

    proxy.startup().await?;

    let endpoints = proxy.endpoints().await;
    let client_config = client_config::generate(cli.client, &endpoints);
    match &cli.output {
        Some(dir) => {
            let path = client_config::write_atomic(&client_config, dir, cli.client)?;
            info!(path = %path.display(), "client configuration written");
        }
        None => println!("{}", serde_json::to_string_pretty(&client_config)?),
    }

    wait_for_signal().await?;

    info!("shutting down");
    proxy.shutdown().await;
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}
