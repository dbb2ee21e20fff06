//! Debugger attach boundary.
//!
//! The actual attach is performed by the editor's debug adapter, so it is a
//! trait here. The bridge only prepares the request and waits for the outcome.

use futures_util::future::BoxFuture;
use serde::Serialize;

use crate::error::BridgeError;
use crate::instance::PathMapping;

/// Everything needed to attach a Python debugger to one Blender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub port: u16,
    pub executable_path: String,
    pub just_my_code: bool,
    pub scripts_folder: String,
    pub path_mappings: Vec<PathMapping>,
    pub identifier: String,
}

/// Attaches a source-level debugger to a remote debugpy listener.
pub trait DebuggerAttach: Send + Sync {
    fn attach(&self, request: AttachRequest) -> BoxFuture<'_, Result<(), BridgeError>>;
}

/// Launch configuration handed to the debug adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugConfiguration {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub request: String,
    pub connect: ConnectInfo,
    pub path_mappings: Vec<PathMapping>,
    pub just_my_code: bool,
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectInfo {
    pub host: String,
    pub port: u16,
}

impl From<&AttachRequest> for DebugConfiguration {
    fn from(req: &AttachRequest) -> Self {
        Self {
            name: format!("Python at Port {}", req.port),
            kind: "python".to_string(),
            request: "attach".to_string(),
            connect: ConnectInfo {
                host: "localhost".to_string(),
                port: req.port,
            },
            path_mappings: req
                .path_mappings
                .iter()
                .map(|m| PathMapping {
                    local_root: fix_drive_letter(&m.local_root),
                    remote_root: m.remote_root.clone(),
                })
                .collect(),
            just_my_code: req.just_my_code,
            identifier: req.identifier.clone(),
        }
    }
}

impl DebugConfiguration {
    /// Session names the bridge creates; used to recognise our sessions when they end.
    pub fn is_bridge_session_name(name: &str) -> bool {
        name.starts_with("Python at Port ")
    }
}

/// Debug adapters only match `C:\...`, not `c:\...`.
pub fn fix_drive_letter(path: &str) -> String {
    let mut chars = path.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some(':')) if drive.is_ascii_alphabetic() => {
            let mut fixed = String::with_capacity(path.len());
            fixed.push(drive.to_ascii_uppercase());
            fixed.push_str(&path[1..]);
            fixed
        }
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> AttachRequest {
        AttachRequest {
            port: 5678,
            executable_path: "/opt/blender/blender".into(),
            just_my_code: false,
            scripts_folder: "/opt/blender/4.1/scripts".into(),
            path_mappings: vec![
                PathMapping {
                    local_root: "c:\\work\\addon".into(),
                    remote_root: "C:\\Users\\u\\addons\\addon".into(),
                },
                PathMapping {
                    local_root: "/work/other".into(),
                    remote_root: "/addons/other".into(),
                },
            ],
            identifier: "id-1".into(),
        }
    }

    #[test]
    fn test_fix_drive_letter() {
        assert_eq!(fix_drive_letter("c:\\x"), "C:\\x");
        assert_eq!(fix_drive_letter("D:/y"), "D:/y");
        assert_eq!(fix_drive_letter("/usr/share"), "/usr/share");
        assert_eq!(fix_drive_letter("1:"), "1:");
        assert_eq!(fix_drive_letter(""), "");
    }

    #[test]
    fn test_debug_configuration_json() {
        let cfg = DebugConfiguration::from(&request());
        assert!(DebugConfiguration::is_bridge_session_name(&cfg.name));
        let v = serde_json::to_value(&cfg).unwrap();
        assert_eq!(v["name"], "Python at Port 5678");
        assert_eq!(v["type"], "python");
        assert_eq!(v["request"], "attach");
        assert_eq!(v["connect"], json!({"host": "localhost", "port": 5678}));
        assert_eq!(v["justMyCode"], false);
        assert_eq!(v["pathMappings"][0]["localRoot"], "C:\\work\\addon");
        assert_eq!(v["pathMappings"][1]["remoteRoot"], "/addons/other");
    }
}
