use switchboard::config::SignalingConfig;
use switchboard::signaling::SignalingServer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match SignalingConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };

    println!("   Switchboard Signaling Server");
    println!("   Binding to {}", config.bind_addr);
    println!("   Press Ctrl+C to stop\n");

    let server = SignalingServer::bind(&config).await?;
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl+C received");
        })
        .await
}
