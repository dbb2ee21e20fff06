use std::sync::Arc;

use blender_bridge::config::BridgeConfig;
use blender_bridge::debugger::{AttachRequest, DebugConfiguration, DebuggerAttach};
use blender_bridge::notify::TracingNotifier;
use blender_bridge::{BridgeError, BridgeSession};
use futures_util::future::BoxFuture;
use tracing_subscriber::EnvFilter;

/// Prints the attach configuration as one JSON line on stdout for the editor
/// to pick up, and reports success.
struct StdoutAttach;

impl DebuggerAttach for StdoutAttach {
    fn attach(&self, request: AttachRequest) -> BoxFuture<'_, Result<(), BridgeError>> {
        Box::pin(async move {
            let config = DebugConfiguration::from(&request);
            let line = serde_json::to_string(&config)
                .map_err(|e| BridgeError::Attach(format!("Failed to encode configuration: {}", e)))?;
            println!("{}", line);
            Ok(())
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = BridgeConfig::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_filter.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!("Blender bridge starting");

    let session = BridgeSession::new(cfg, Arc::new(StdoutAttach), Arc::new(TracingNotifier))?;
    let port = session.start()?;
    tracing::info!("Editor port: {}", port);

    // Optional: blender-bridge <blender-executable> [launch-script]
    let mut args = std::env::args().skip(1);
    let mut launched = None;
    if let Some(executable) = args.next() {
        let mut options = session.launch_options(executable)?;
        if let Some(script) = args.next() {
            options = options.with_launch_script(script);
        }
        let task = session.launch(options)?;
        tracing::info!("Launched Blender, pid {:?}", task.pid());
        launched = Some(task);
    }

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received, cleaning up...");

    let registry = session.registry();
    let mut ids = registry.task_identifiers();
    ids.extend(registry.get_alive().iter().map(|i| i.session_id().to_string()));
    ids.sort();
    ids.dedup();
    for id in ids {
        session.kill(&id);
    }
    session.stop();

    if let Some(task) = launched {
        let wait = tokio::time::timeout(std::time::Duration::from_secs(5), task.wait_exit()).await;
        if wait.is_err() {
            tracing::warn!("Blender (pid {:?}) did not exit within 5s", task.pid());
        }
    }

    tracing::info!("Blender bridge shutting down");
    Ok(())
}
