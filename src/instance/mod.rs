use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::debugger::{AttachRequest, DebuggerAttach};
use crate::error::BridgeError;
use crate::protocol::SetupMessage;

/// Default time an instance gets to answer a liveness probe.
pub const DEFAULT_RESPONSIVE_TIMEOUT: Duration = Duration::from_millis(1000);

const PING_PATH: &str = "/ping";

/// Debugger source mapping. Order matters: the first matching root wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathMapping {
    pub local_root: String,
    pub remote_root: String,
}

/// Static description of one Blender session, as announced by its `setup` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub session_id: String,
    /// Port Blender's own control server listens on
    pub control_port: u16,
    /// Port debugpy listens on
    pub debug_port: u16,
    pub executable_path: String,
    pub scripts_folder: String,
    pub just_my_code: bool,
    pub path_mappings: Vec<PathMapping>,
}

impl InstanceInfo {
    pub fn from_setup(setup: &SetupMessage, just_my_code: bool) -> Self {
        Self {
            session_id: setup.vscode_identifier.clone(),
            control_port: setup.blender_port,
            debug_port: setup.debugpy_port,
            executable_path: setup.blender_path.clone(),
            scripts_folder: setup.scripts_folder.clone(),
            just_my_code,
            path_mappings: setup
                .addon_path_mappings
                .iter()
                .map(|m| PathMapping {
                    local_root: m.src.clone(),
                    remote_root: m.load.clone(),
                })
                .collect(),
        }
    }
}

/// One entry of an instance's diagnostic log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionError {
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub message: String,
}

/// Build the HTTP client used for talking to instances.
pub fn http_client(request_timeout: Duration) -> Result<reqwest::Client, BridgeError> {
    reqwest::Client::builder()
        .timeout(request_timeout)
        .build()
        .map_err(|e| BridgeError::Network {
            address: "<client>".to_string(),
            message: format!("Failed to create HTTP client: {}", e),
        })
}

/// A running Blender reachable over HTTP.
///
/// The identity and ports never change after construction. The only mutable
/// state is the append-only `connection_errors` log, which is diagnostic and
/// never consulted for routing decisions.
#[derive(Debug)]
pub struct BlenderInstance {
    info: InstanceInfo,
    connection_errors: Mutex<Vec<ConnectionError>>,
    client: reqwest::Client,
}

impl BlenderInstance {
    pub fn new(info: InstanceInfo, client: reqwest::Client) -> Self {
        Self {
            info,
            connection_errors: Mutex::new(Vec::new()),
            client,
        }
    }

    pub fn info(&self) -> &InstanceInfo {
        &self.info
    }

    pub fn session_id(&self) -> &str {
        &self.info.session_id
    }

    pub fn control_port(&self) -> u16 {
        self.info.control_port
    }

    pub fn debug_port(&self) -> u16 {
        self.info.debug_port
    }

    pub fn address(&self) -> String {
        format!("http://localhost:{}", self.info.control_port)
    }

    /// POST a JSON payload to the instance. No retry.
    pub async fn post(&self, payload: &Value) -> Result<(), BridgeError> {
        let address = self.address();
        tracing::debug!("POST {} -> {}", address, payload);

        self.client
            .post(&address)
            .json(payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| BridgeError::from_reqwest(&e, &address))?;
        Ok(())
    }

    /// GET with a JSON body; returns the JSON the instance answered with.
    pub async fn get(&self, payload: &Value) -> Result<Value, BridgeError> {
        let address = self.address();
        tracing::debug!("GET {} -> {}", address, payload);

        let resp = self
            .client
            .get(&address)
            .json(payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| BridgeError::from_reqwest(&e, &address))?;

        resp.json::<Value>()
            .await
            .map_err(|e| BridgeError::InvalidResponse {
                address,
                message: e.to_string(),
            })
    }

    /// Liveness probe. A failure is recorded and then returned.
    pub async fn ping(&self) -> Result<(), BridgeError> {
        let url = format!("{}{}", self.address(), PING_PATH);
        let result = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map(|_| ())
            .map_err(|e| BridgeError::from_reqwest(&e, &url));

        if let Err(e) = &result {
            self.record_error(e);
        }
        result
    }

    /// True only if `ping` succeeds before `timeout`. Never fails.
    ///
    /// When the timer wins the in-flight ping is dropped; the instance is
    /// only considered unresponsive for this call.
    pub async fn is_responsive(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                self.record_error(&BridgeError::Timeout {
                    address: self.address(),
                    timeout_ms: timeout.as_millis() as u64,
                });
                false
            }
        }
    }

    pub fn attach_request(&self) -> AttachRequest {
        AttachRequest {
            port: self.info.debug_port,
            executable_path: self.info.executable_path.clone(),
            just_my_code: self.info.just_my_code,
            scripts_folder: self.info.scripts_folder.clone(),
            path_mappings: self.info.path_mappings.clone(),
            identifier: self.info.session_id.clone(),
        }
    }

    pub async fn attach_debugger(&self, attach: &dyn DebuggerAttach) -> Result<(), BridgeError> {
        attach.attach(self.attach_request()).await
    }

    pub fn record_error(&self, err: &BridgeError) {
        let entry = ConnectionError {
            timestamp: current_timestamp(),
            message: err.to_string(),
        };
        let mut errors = self
            .connection_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        errors.push(entry);
    }

    /// Snapshot of every error recorded so far, oldest first.
    pub fn connection_errors(&self) -> Vec<ConnectionError> {
        self.connection_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
