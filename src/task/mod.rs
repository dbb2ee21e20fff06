//! Launch tasks and their correlation with registered instances.
//!
//! A task is the OS-level side of one Blender session. It shares the session
//! identifier with the [`BlenderInstance`](crate::instance::BlenderInstance)
//! that later announces itself, so killing an identifier can terminate both.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::watch;

use crate::config::LaunchConfig;
use crate::error::BridgeError;

/// Handle to something launched on behalf of a session.
pub trait TaskHandle: Send + Sync {
    fn identifier(&self) -> &str;

    /// Best-effort termination; failures are the task's own concern.
    fn terminate(&self);

    /// Called once the debugger attached to the session's instance.
    fn on_start_debugging(&self);
}

/// Add-on entry passed to Blender in `ADDONS_TO_LOAD`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddonToLoad {
    pub load_dir: String,
    pub module_name: String,
}

/// Everything needed to start a Blender that will report back to us.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub executable: PathBuf,
    pub identifier: String,
    /// Port of our transport server, exported as `EDITOR_PORT`
    pub editor_port: u16,
    /// Script passed via `--python`; it starts the in-Blender side
    pub launch_script: Option<PathBuf>,
    pub addons_to_load: Vec<AddonToLoad>,
    pub additional_arguments: Vec<String>,
    pub environment: HashMap<String, String>,
    pub allow_modify_external_python: bool,
}

impl LaunchOptions {
    pub fn new(executable: impl Into<PathBuf>, editor_port: u16) -> Self {
        Self {
            executable: executable.into(),
            identifier: uuid::Uuid::new_v4().to_string(),
            editor_port,
            launch_script: None,
            addons_to_load: Vec::new(),
            additional_arguments: Vec::new(),
            environment: HashMap::new(),
            allow_modify_external_python: false,
        }
    }

    pub fn with_config(mut self, config: &LaunchConfig) -> Self {
        self.additional_arguments
            .extend(config.additional_arguments.iter().cloned());
        for (key, value) in &config.environment {
            self.environment.insert(key.clone(), value.clone());
        }
        self.allow_modify_external_python = config.allow_modify_external_python;
        self
    }

    pub fn with_launch_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.launch_script = Some(script.into());
        self
    }

    pub fn with_addon(mut self, load_dir: &str, module_name: &str) -> Self {
        self.addons_to_load.push(AddonToLoad {
            load_dir: load_dir.to_string(),
            module_name: module_name.to_string(),
        });
        self
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(script) = &self.launch_script {
            args.push("--python".to_string());
            args.push(script.to_string_lossy().into_owned());
        }
        args.extend(self.additional_arguments.iter().cloned());
        args
    }

    /// Bridge variables first; user-configured ones may override them.
    pub fn env(&self) -> Result<Vec<(String, String)>, BridgeError> {
        let addons = serde_json::to_string(&self.addons_to_load)
            .map_err(|e| BridgeError::Launch(format!("Failed to encode ADDONS_TO_LOAD: {}", e)))?;

        let mut vars: Vec<(String, String)> = vec![
            ("ADDONS_TO_LOAD".to_string(), addons),
            ("EDITOR_PORT".to_string(), self.editor_port.to_string()),
            ("VSCODE_IDENTIFIER".to_string(), self.identifier.clone()),
            (
                "ALLOW_MODIFY_EXTERNAL_PYTHON".to_string(),
                if self.allow_modify_external_python { "yes" } else { "no" }.to_string(),
            ),
        ];
        let mut extra: Vec<_> = self.environment.iter().collect();
        extra.sort();
        for (key, value) in extra {
            vars.retain(|(k, _)| k != key);
            vars.push((key.clone(), value.clone()));
        }
        Ok(vars)
    }

    /// Start the process. Output lines are forwarded to the log.
    pub fn spawn(self) -> Result<ProcessTask, BridgeError> {
        let args = self.args();
        let env_vars = self.env()?;

        let mut cmd = TokioCommand::new(&self.executable);
        cmd.args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);
        for (key, value) in &env_vars {
            cmd.env(key, value);
        }

        hide_console_window(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            BridgeError::Launch(format!("'{}': {}", self.executable.display(), e))
        })?;
        let pid = child.id();
        tracing::info!(
            "Launched {} (session {}, pid {:?})",
            self.executable.display(),
            self.identifier,
            pid
        );

        if let Some(stdout) = child.stdout.take() {
            let id = self.identifier.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(target: "blender", "[{}] {}", id, line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let id = self.identifier.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(target: "blender", "[{}] {}", id, line);
                }
            });
        }

        let (terminate_tx, mut terminate_rx) = watch::channel(false);
        let (exited_tx, exited_rx) = watch::channel(None);
        let (debugging_tx, _) = watch::channel(false);

        // ── process waiter ───────────────────────────────────
        {
            let id = self.identifier.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    Ok(()) = async { terminate_rx.wait_for(|t| *t).await.map(|_| ()) } => {
                        send_terminate(&mut child);
                        child.wait().await
                    }
                };
                let code = match status {
                    Ok(status) => {
                        tracing::info!("Session {} exited with {}", id, status);
                        status.code().unwrap_or(-1)
                    }
                    Err(e) => {
                        tracing::warn!("Failed to wait for session {}: {}", id, e);
                        -1
                    }
                };
                let _ = exited_tx.send(Some(code));
            });
        }

        Ok(ProcessTask {
            identifier: self.identifier,
            pid,
            terminate_tx,
            exited_rx,
            debugging_tx,
        })
    }
}

#[cfg(target_os = "windows")]
fn hide_console_window(cmd: &mut TokioCommand) {
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(target_os = "windows"))]
fn hide_console_window(_cmd: &mut TokioCommand) {}

#[cfg(unix)]
fn send_terminate(child: &mut tokio::process::Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!("SIGTERM to pid {} failed: {}, killing", pid, e);
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut tokio::process::Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to kill process: {}", e);
    }
}

/// A Blender process started by [`LaunchOptions::spawn`].
pub struct ProcessTask {
    identifier: String,
    pid: Option<u32>,
    terminate_tx: watch::Sender<bool>,
    /// Exit code once the process is gone; -1 when it was killed by a signal
    exited_rx: watch::Receiver<Option<i32>>,
    debugging_tx: watch::Sender<bool>,
}

impl ProcessTask {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited_rx.borrow().is_some()
    }

    /// Resolves with the exit code once the process has gone away.
    pub async fn wait_exit(&self) -> i32 {
        let mut rx = self.exited_rx.clone();
        let code = match rx.wait_for(|code| code.is_some()).await {
            Ok(code) => (*code).unwrap_or(-1),
            Err(_) => -1,
        };
        code
    }

    pub fn exit_receiver(&self) -> watch::Receiver<Option<i32>> {
        self.exited_rx.clone()
    }

    pub fn debugging_started(&self) -> bool {
        *self.debugging_tx.borrow()
    }

    pub fn subscribe_debugging(&self) -> watch::Receiver<bool> {
        self.debugging_tx.subscribe()
    }
}

impl TaskHandle for ProcessTask {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn terminate(&self) {
        if self.has_exited() {
            return;
        }
        tracing::info!("Terminating session {} (pid {:?})", self.identifier, self.pid);
        let _ = self.terminate_tx.send(true);
    }

    fn on_start_debugging(&self) {
        let first = self.debugging_tx.send_if_modified(|started| {
            if *started {
                false
            } else {
                *started = true;
                true
            }
        });
        if first {
            tracing::info!("Debugger attached to session {}", self.identifier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_order() {
        let opts = LaunchOptions::new("/opt/blender/blender", 4000)
            .with_launch_script("/ext/launch.py")
            .with_config(&LaunchConfig {
                additional_arguments: vec!["--factory-startup".into()],
                ..Default::default()
            });
        assert_eq!(
            opts.args(),
            vec!["--python", "/ext/launch.py", "--factory-startup"]
        );
    }

    #[test]
    fn test_env_contains_bridge_variables() {
        let mut opts = LaunchOptions::new("blender", 4321).with_addon("/work", "my_addon");
        opts.identifier = "fixed-id".into();
        let env: HashMap<_, _> = opts.env().unwrap().into_iter().collect();
        assert_eq!(env["EDITOR_PORT"], "4321");
        assert_eq!(env["VSCODE_IDENTIFIER"], "fixed-id");
        assert_eq!(env["ALLOW_MODIFY_EXTERNAL_PYTHON"], "no");
        let addons: serde_json::Value = serde_json::from_str(&env["ADDONS_TO_LOAD"]).unwrap();
        assert_eq!(addons[0]["load_dir"], "/work");
        assert_eq!(addons[0]["module_name"], "my_addon");
    }

    #[test]
    fn test_configured_env_overrides() {
        let mut config = LaunchConfig::default();
        config.environment.insert("EDITOR_PORT".into(), "1".into());
        config.environment.insert("EXTRA".into(), "x".into());
        config.allow_modify_external_python = true;
        let opts = LaunchOptions::new("blender", 4321).with_config(&config);
        let env = opts.env().unwrap();
        let editor_ports: Vec<_> = env.iter().filter(|(k, _)| k == "EDITOR_PORT").collect();
        assert_eq!(editor_ports.len(), 1);
        assert_eq!(editor_ports[0].1, "1");
        assert!(env.contains(&("ALLOW_MODIFY_EXTERNAL_PYTHON".to_string(), "yes".to_string())));
        assert!(env.contains(&("EXTRA".to_string(), "x".to_string())));
    }

    #[test]
    fn test_fresh_identifier_per_launch() {
        let a = LaunchOptions::new("blender", 1);
        let b = LaunchOptions::new("blender", 1);
        assert_ne!(a.identifier, b.identifier);
    }

    #[tokio::test]
    async fn test_spawn_missing_executable_fails() {
        let opts = LaunchOptions::new("/definitely/not/a/blender", 1);
        assert!(matches!(opts.spawn(), Err(BridgeError::Launch(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_process() {
        let mut opts = LaunchOptions::new("sleep", 1);
        opts.additional_arguments = vec!["30".into()];
        let task = opts.spawn().unwrap();
        assert!(!task.has_exited());

        task.terminate();
        let exited = tokio::time::timeout(std::time::Duration::from_secs(5), task.wait_exit()).await;
        assert!(exited.is_ok(), "process should exit after terminate");
        assert!(task.has_exited());

        // second terminate is a no-op
        task.terminate();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_exit_reports_exit_code() {
        let mut opts = LaunchOptions::new("sh", 1);
        opts.additional_arguments = vec!["-c".into(), "exit 3".into()];
        let task = opts.spawn().unwrap();

        let code = tokio::time::timeout(std::time::Duration::from_secs(5), task.wait_exit())
            .await
            .unwrap();
        assert_eq!(code, 3);
        // already exited, resolves immediately
        assert_eq!(task.wait_exit().await, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_on_start_debugging_fires_once() {
        let mut opts = LaunchOptions::new("sleep", 1);
        opts.additional_arguments = vec!["30".into()];
        let task = opts.spawn().unwrap();
        let mut rx = task.subscribe_debugging();

        task.on_start_debugging();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        task.on_start_debugging();
        assert!(!rx.has_changed().unwrap());
        assert!(task.debugging_started());

        task.terminate();
        task.wait_exit().await;
    }
}
