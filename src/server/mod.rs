//! Transport server: receives control messages from Blender processes.
//!
//! One endpoint, POST only, one JSON object per body. Protocol problems are
//! answered with a status code and never leave this module. A valid `setup`
//! is acknowledged right away; attaching the debugger and registering the
//! instance happen afterwards in a background task whose outcome is only
//! visible through the registry and the notifier.

use axum::{
    body::Bytes,
    extract::State,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::BridgeConfig;
use crate::debugger::DebuggerAttach;
use crate::error::{BridgeError, ProtocolError};
use crate::instance::{http_client, BlenderInstance, InstanceInfo};
use crate::notify::Notifier;
use crate::protocol::{FailureReport, InboundMessage, SetupMessage};
use crate::registry::InstanceRegistry;

/// Status and plain-text body returned for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusCode,
    pub body: String,
}

impl Reply {
    fn ok() -> Self {
        Self {
            status: StatusCode::OK,
            body: "OK".to_string(),
        }
    }
}

impl From<ProtocolError> for Reply {
    fn from(err: ProtocolError) -> Self {
        Self {
            status: err.status_code(),
            body: err.to_string(),
        }
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        (self.status, self.body).into_response()
    }
}

/// Shared by the axum handlers and the background setup tasks.
pub struct ServerContext {
    registry: Arc<InstanceRegistry>,
    attach: Arc<dyn DebuggerAttach>,
    notifier: Arc<dyn Notifier>,
    client: reqwest::Client,
    just_my_code: bool,
    pending_attaches: AtomicUsize,
}

impl ServerContext {
    pub fn handle_request(self: &Arc<Self>, method: &Method, body: &[u8]) -> Reply {
        if *method != Method::POST {
            return ProtocolError::MethodNotAllowed(method.clone()).into();
        }

        let message = match InboundMessage::parse(body) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Rejected request ({}): {}", e.error_code(), e);
                return e.into();
            }
        };
        tracing::debug!("Received '{}' message", message.kind());

        match message {
            InboundMessage::Setup(setup) => {
                self.registry.begin_setup(&setup.vscode_identifier);
                self.pending_attaches.fetch_add(1, Ordering::SeqCst);
                let ctx = self.clone();
                tokio::spawn(async move {
                    ctx.complete_setup(setup).await;
                    ctx.pending_attaches.fetch_sub(1, Ordering::SeqCst);
                });
            }
            InboundMessage::EnableFailure(report) => {
                self.notifier.warn(&failure_text("Enabling the add-on failed", &report));
            }
            InboundMessage::DisableFailure(report) => {
                self.notifier.warn(&failure_text("Disabling the add-on failed", &report));
            }
            InboundMessage::AddonUpdated => {}
        }
        Reply::ok()
    }

    /// Attach the debugger, then register the instance only if that worked.
    ///
    /// Two setups with the same identifier run independently; whichever
    /// attach finishes last owns the registry slot.
    async fn complete_setup(&self, setup: SetupMessage) {
        let info = InstanceInfo::from_setup(&setup, self.just_my_code);
        let instance = Arc::new(BlenderInstance::new(info, self.client.clone()));
        tracing::info!(
            "Setup from session {} (control port {}, debugpy port {})",
            instance.session_id(),
            instance.control_port(),
            instance.debug_port()
        );

        match instance.attach_debugger(self.attach.as_ref()).await {
            Ok(()) => {
                self.registry.attach_succeeded(instance.clone());
                if let Some(task) = self.registry.get_task(instance.session_id()) {
                    task.on_start_debugging();
                }
            }
            Err(e) => {
                instance.record_error(&e);
                self.registry.attach_failed(instance.session_id());
                self.notifier.warn(&format!(
                    "Could not attach debugger to Blender at port {}: {}",
                    instance.debug_port(),
                    e
                ));
            }
        }
    }
}

fn failure_text(prefix: &str, report: &FailureReport) -> String {
    let prefix = match &report.addon_path {
        Some(path) => format!("{} ({})", prefix, path),
        None => prefix.to_string(),
    };
    match &report.message {
        Some(message) => format!("{}: {}", prefix, message),
        None => format!("{}, check the Blender console for details", prefix),
    }
}

async fn dispatch(State(ctx): State<Arc<ServerContext>>, method: Method, body: Bytes) -> Reply {
    ctx.handle_request(&method, &body)
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

/// Embedded HTTP server with an explicit start/stop lifecycle.
pub struct TransportServer {
    context: Arc<ServerContext>,
    bind_host: String,
    state: Mutex<Option<RunningServer>>,
}

impl TransportServer {
    pub fn new(
        config: &BridgeConfig,
        registry: Arc<InstanceRegistry>,
        attach: Arc<dyn DebuggerAttach>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, BridgeError> {
        let client = http_client(config.request_timeout())?;
        Ok(Self {
            context: Arc::new(ServerContext {
                registry,
                attach,
                notifier,
                client,
                just_my_code: config.just_my_code,
                pending_attaches: AtomicUsize::new(0),
            }),
            bind_host: config.bind_host.clone(),
            state: Mutex::new(None),
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(self.context.clone())
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
    }

    /// Bind an OS-assigned port and start serving. No-op while running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<u16, BridgeError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(running) = state.as_ref() {
            return Ok(running.addr.port());
        }

        let listener =
            StdTcpListener::bind((self.bind_host.as_str(), 0)).map_err(BridgeError::Bind)?;
        listener.set_nonblocking(true).map_err(BridgeError::Bind)?;
        let addr = listener.local_addr().map_err(BridgeError::Bind)?;
        let listener = tokio::net::TcpListener::from_std(listener).map_err(BridgeError::Bind)?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let router = self.router();
        tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!("Transport server error: {}", e);
            }
        });

        tracing::info!("Transport server listening on http://{}", addr);
        *state = Some(RunningServer { addr, shutdown });
        Ok(addr.port())
    }

    /// Close the listener. No-op when not running.
    pub fn stop(&self) {
        let running = self.state.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(running) = running {
            running.shutdown.cancel();
            tracing::info!("Transport server on {} stopped", running.addr);
        }
    }

    /// Port of the running server; an error before `start` or after `stop`.
    pub fn port(&self) -> Result<u16, BridgeError> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|running| running.addr.port())
            .ok_or(BridgeError::NotStarted)
    }

    /// Handle one request as if it came in over HTTP.
    pub fn handle_request(&self, method: &Method, body: &[u8]) -> Reply {
        self.context.handle_request(method, body)
    }

    /// Setups whose debugger attach has not finished yet.
    pub fn pending_attaches(&self) -> usize {
        self.context.pending_attaches.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.context.registry
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.stop();
    }
}
