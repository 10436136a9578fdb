use anyhow::Result;
use nabla_forge::ForgeConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Nabla Forge firmware server");

    let config = ForgeConfig::load()?;
    info!(
        "Toolchain image {}, local probe {}, {} remote bridge(s), policy {:?}",
        config.sandbox.image,
        if config.local_probe.enabled { "enabled" } else { "disabled" },
        config.remote_bridges.len(),
        config.selection
    );

    nabla_forge::server::run_server(config).await?;

    Ok(())
}
