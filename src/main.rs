use anyhow::Result;
use clap::Parser;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway_ratelimit::{
    config::load_config_from_file, metrics::Metrics, service::app, GatewayService,
};

/// Rate-limited API gateway
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CONFIG_PATH", default_value = "gateway.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway_ratelimit=debug,gateway=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting rate-limited API gateway");

    info!("Loading configuration from: {}", cli.config);
    let config = load_config_from_file(&cli.config)?;
    config.validate()?;

    let metrics = Arc::new(Metrics::new()?);
    let service = Arc::new(GatewayService::from_config(&config, metrics).await?);
    info!(
        "Serving {} services with the {} store",
        service.engine().registry().len(),
        service.engine().store_name()
    );

    let addr = config.listen.parse::<SocketAddr>()?;
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(
        listener,
        app(service).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
        }
    })
    .await?;

    info!("Gateway stopped");
    Ok(())
}
