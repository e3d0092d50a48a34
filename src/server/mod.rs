pub mod negotiate;
pub mod state;

mod handler;
mod router;


use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use tracing::info;

pub use state::AppState;

pub async fn run(addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow!(e).context(format!("bind failed: {addr}")))?;
    info!(target: "vf", "listening on http://{}/", listener.local_addr()?);

    axum::serve(listener, router::build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow!("server exited: {e}"))?;
    info!(target: "vf", "server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
