//! spoold: serves configured resources over the Spool transfer protocol.
//!
//! Every accepted TCP connection gets its own responder engine. Peers read
//! resources with `START` on the Read stream and upload to writable
//! resources with `START` on the Write stream.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use spool_core::SpoolConfig;
use spool_transfer::{DirectoryProvider, EngineConfig, TransferEngine, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = SpoolConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SpoolConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SpoolConfig::default()
    });
    config.validate().context("invalid configuration")?;

    let provider = Arc::new(DirectoryProvider::from_config(&config.server.resources));
    if provider.is_empty() {
        tracing::warn!("no resources configured; every transfer will be refused");
    }
    let engine_config = EngineConfig::from(&config);

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        resources = provider.len(),
        "spoold listening"
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
            }
            shutdown.cancel();
        });
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        serve(stream, peer, engine_config, provider.clone(), shutdown.child_token());
    }

    tracing::info!("spoold stopped");
    Ok(())
}

fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    config: EngineConfig,
    provider: Arc<DirectoryProvider>,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%peer, error = %e, "set_nodelay failed");
    }
    let (reader, writer) = stream.into_split();
    let transport = Transport::spawn_stream(reader, writer, config.outbound_queue, shutdown.clone());
    let engine = TransferEngine::new(config, transport)
        .with_provider(provider)
        .with_shutdown(shutdown);

    tracing::info!(%peer, "connection opened");
    tokio::spawn(async move {
        engine.run().await;
        tracing::info!(%peer, "connection closed");
    });
}
