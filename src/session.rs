//! Explicitly owned editor session: one registry, one transport server.

use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::BridgeConfig;
use crate::debugger::{DebugConfiguration, DebuggerAttach};
use crate::error::BridgeError;
use crate::notify::Notifier;
use crate::protocol::EditorCommand;
use crate::registry::{BroadcastSummary, InstanceRegistry};
use crate::server::TransportServer;
use crate::task::{LaunchOptions, ProcessTask, TaskHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunScriptOutcome {
    Sent(BroadcastSummary),
    /// Nobody answered; the caller may launch a new Blender with the script.
    NoResponsiveInstance,
}

pub struct BridgeSession {
    config: BridgeConfig,
    registry: Arc<InstanceRegistry>,
    server: TransportServer,
}

impl BridgeSession {
    pub fn new(
        config: BridgeConfig,
        attach: Arc<dyn DebuggerAttach>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, BridgeError> {
        let registry = Arc::new(InstanceRegistry::new());
        let server = TransportServer::new(&config, registry.clone(), attach, notifier)?;
        Ok(Self {
            config,
            registry,
            server,
        })
    }

    pub fn start(&self) -> Result<u16, BridgeError> {
        self.server.start()
    }

    pub fn stop(&self) {
        self.server.stop();
    }

    pub fn server_port(&self) -> Result<u16, BridgeError> {
        self.server.port()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn server(&self) -> &TransportServer {
        &self.server
    }

    /// Launch options pointing at our server, with the configured args and env.
    /// Starts the server if needed.
    pub fn launch_options(&self, executable: impl Into<PathBuf>) -> Result<LaunchOptions, BridgeError> {
        let port = self.start()?;
        Ok(LaunchOptions::new(executable, port).with_config(&self.config.launch))
    }

    /// Spawn Blender and register its task.
    ///
    /// When the process exits, instances registered under its identifier are
    /// dropped from the registry.
    pub fn launch(&self, options: LaunchOptions) -> Result<Arc<ProcessTask>, BridgeError> {
        let task = Arc::new(options.spawn()?);
        self.registry.register_task(task.clone());

        let mut exited = task.exit_receiver();
        let registry = self.registry.clone();
        let id = task.identifier().to_string();
        tokio::spawn(async move {
            let _ = exited.wait_for(|code| code.is_some()).await;
            registry.clear_instances(|i| i.session_id() != id);
        });

        Ok(task)
    }

    pub fn kill(&self, id: &str) {
        self.registry.kill(id);
    }

    /// Forget instances of a debug session the editor reports as ended.
    pub fn debug_session_ended(&self, session_name: &str, identifier: &str) {
        if !DebugConfiguration::is_bridge_session_name(session_name) {
            return;
        }
        self.registry.clear_instances(|i| i.session_id() != identifier);
    }

    pub async fn send_command(&self, command: EditorCommand) -> BroadcastSummary {
        self.registry
            .send_to_responsive(&command.to_value(), self.config.responsive_timeout())
            .await
    }

    pub async fn run_script(&self, path: &str) -> RunScriptOutcome {
        let summary = self
            .send_command(EditorCommand::Script {
                path: path.to_string(),
            })
            .await;
        if summary.responsive == 0 {
            RunScriptOutcome::NoResponsiveInstance
        } else {
            RunScriptOutcome::Sent(summary)
        }
    }

    /// Ask every responsive instance for completions, deduplicated by `complete`.
    pub async fn completion_items(&self, request: EditorCommand) -> Vec<Value> {
        let answers = self
            .registry
            .get_from_responsive(&request.to_value(), self.config.responsive_timeout())
            .await;

        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for answer in answers {
            let Some(list) = answer.get("items").and_then(Value::as_array) else {
                continue;
            };
            for item in list {
                let key = item
                    .get("complete")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if seen.insert(key) {
                    items.push(item.clone());
                }
            }
        }
        items
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        self.stop();
    }
}
