use anyhow::Context;
use plaza_server::config::ServerConfig;
use plaza_server::hub::{run_hub, HubBroadcast, HubCommand};
use plaza_server::ws::{router, AppState};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        eprintln!("Invalid server configuration: {}", e);
        std::process::exit(1);
    }

    let (hub_tx, hub_rx) = mpsc::channel::<HubCommand>(256);
    let (broadcast_tx, _) = broadcast::channel::<HubBroadcast>(64);

    let app_state = AppState::new(&config, hub_tx, broadcast_tx.clone());
    let app = router(app_state, config.static_dir.as_deref());

    let listen_addr = config.listen_addr.clone();

    // Spawn hub
    tokio::spawn(async move {
        run_hub(hub_rx, broadcast_tx, config).await;
    });

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {}", listen_addr))?;
    tracing::info!("Plaza server listening on http://{}", listen_addr);

    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}
