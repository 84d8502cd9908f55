// Codex host daemon: create a node, start it, run until SIGINT/SIGTERM, stop, destroy.

mod config;

use std::sync::Arc;

use anyhow::Context;
use codex_bridge::{NativeApi, Node};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("codex-daemon {} ({})", VERSION, BACKEND);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = config::load();

    // The bridge blocks while waiting on native callbacks, so the node is driven from
    // this thread and the runtime only waits for the shutdown signal.
    let node = Node::new(native_api(), &cfg.node).context("creating node")?;
    if cfg.log_events {
        node.set_event_handler(|event| {
            tracing::info!(code = event.code, message = %event.message_lossy(), "node event");
        });
    }
    tracing::info!(
        version = %node.version().context("querying version")?,
        revision = %node.revision().context("querying revision")?,
        repo = %node.repo().context("querying repo")?,
        "node created"
    );

    node.start().context("starting node")?;
    match node.peer_id() {
        Ok(peer_id) => tracing::info!(%peer_id, "node running"),
        Err(e) => tracing::warn!(error = %e, "peer id unavailable"),
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(shutdown_signal())?;

    tracing::info!("shutting down");
    node.stop().context("stopping node")?;
    node.destroy().context("destroying node")?;
    Ok(())
}

#[cfg(not(any(feature = "libcodex", feature = "sim")))]
compile_error!("codex-daemon needs a native backend: enable `libcodex` or `sim`");

/// Native backend compiled in. `libcodex` wins when both features are enabled.
#[cfg(feature = "libcodex")]
const BACKEND: &str = "libcodex";
#[cfg(all(feature = "sim", not(feature = "libcodex")))]
const BACKEND: &str = "sim";

#[cfg(feature = "libcodex")]
fn native_api() -> Arc<dyn NativeApi> {
    Arc::new(codex_bridge::LibCodex)
}

#[cfg(all(feature = "sim", not(feature = "libcodex")))]
fn native_api() -> Arc<dyn NativeApi> {
    tracing::warn!("built without libcodex; running against the in-process simulator");
    Arc::new(codex_bridge::sim::SimNative::new())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_follows_features() {
        if cfg!(feature = "libcodex") {
            assert_eq!(BACKEND, "libcodex");
        } else {
            assert_eq!(BACKEND, "sim");
        }
    }

    #[cfg(all(feature = "sim", not(feature = "libcodex")))]
    #[test]
    fn simulator_backend_creates_a_node() {
        let node = Node::new(native_api(), &codex_bridge::NodeConfig::default()).unwrap();
        assert!(!node.version().unwrap().is_empty());
        node.destroy().unwrap();
    }
}
