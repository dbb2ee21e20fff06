//! Wire types for the control channel.
//!
//! Inbound messages arrive as one JSON object per POST body and are parsed
//! and validated in a single step into [`InboundMessage`]. Outbound payloads
//! sent to instances live in [`command`].

pub mod command;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

pub use command::EditorCommand;

/// A validated message received from a Blender process.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Setup(SetupMessage),
    EnableFailure(FailureReport),
    DisableFailure(FailureReport),
    AddonUpdated,
}

impl InboundMessage {
    /// Parse a request body and validate it against its `type`.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        match kind {
            "setup" => SetupMessage::from_value(&value).map(Self::Setup),
            "enableFailure" => Ok(Self::EnableFailure(FailureReport::from_value(&value))),
            "disableFailure" => Ok(Self::DisableFailure(FailureReport::from_value(&value))),
            "addonUpdated" => Ok(Self::AddonUpdated),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup",
            Self::EnableFailure(_) => "enableFailure",
            Self::DisableFailure(_) => "disableFailure",
            Self::AddonUpdated => "addonUpdated",
        }
    }
}

/// Connection information a freshly started Blender sends back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub blender_port: u16,
    pub debugpy_port: u16,
    pub blender_path: String,
    pub scripts_folder: String,
    pub vscode_identifier: String,
    pub addon_path_mappings: Vec<AddonPathMapping>,
}

/// `src` is the folder in the editor workspace, `load` where Blender loads it from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonPathMapping {
    pub src: String,
    pub load: String,
}

impl SetupMessage {
    fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        Ok(Self {
            blender_port: port_field(value, "blenderPort")?,
            debugpy_port: port_field(value, "debugpyPort")?,
            blender_path: non_empty_str_field(value, "blenderPath")?,
            scripts_folder: non_empty_str_field(value, "scriptsFolder")?,
            vscode_identifier: non_empty_str_field(value, "vscodeIdentifier")?,
            addon_path_mappings: path_mappings_field(value),
        })
    }
}

/// Payload of `enableFailure` / `disableFailure`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureReport {
    /// Load directory of the add-on that failed, when Blender names it
    pub addon_path: Option<String>,
    pub message: Option<String>,
}

impl FailureReport {
    fn from_value(value: &Value) -> Self {
        Self {
            addon_path: optional_str(value, "addonPath"),
            message: optional_str(value, "message"),
        }
    }
}

fn optional_str(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn port_field(value: &Value, field: &'static str) -> Result<u16, ProtocolError> {
    let invalid = |reason: &str| ProtocolError::InvalidField {
        field,
        reason: reason.to_string(),
    };

    let number = match value.get(field) {
        None | Some(Value::Null) => return Err(invalid("missing")),
        Some(Value::Number(n)) => n,
        Some(_) => return Err(invalid("not a number")),
    };
    if let Some(port) = number.as_u64() {
        return u16::try_from(port).map_err(|_| invalid("out of port range"));
    }

    // 8080.0 is still a port; negatives and fractions are not
    match number.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && (0.0..=u16::MAX as f64).contains(&f) => {
            Ok(f as u16)
        }
        Some(f) if !f.is_finite() => Err(invalid("not finite")),
        _ => Err(invalid("not a valid port")),
    }
}

fn non_empty_str_field(value: &Value, field: &'static str) -> Result<String, ProtocolError> {
    match value.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(ProtocolError::InvalidField {
            field,
            reason: "empty string".to_string(),
        }),
        Some(_) => Err(ProtocolError::InvalidField {
            field,
            reason: "not a string".to_string(),
        }),
        None => Err(ProtocolError::InvalidField {
            field,
            reason: "missing".to_string(),
        }),
    }
}

/// Keeps only well-formed `{src, load}` entries; anything else is dropped.
fn path_mappings_field(value: &Value) -> Vec<AddonPathMapping> {
    let Some(entries) = value.get("addonPathMappings").and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let src = entry.get("src")?.as_str()?;
            let load = entry.get("load")?.as_str()?;
            Some(AddonPathMapping {
                src: src.to_string(),
                load: load.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_setup() -> Value {
        json!({
            "type": "setup",
            "blenderPort": 6001,
            "debugpyPort": 6002,
            "blenderPath": "/opt/blender/blender",
            "scriptsFolder": "/opt/blender/4.1/scripts",
            "vscodeIdentifier": "abc123",
            "addonPathMappings": [
                {"src": "/work/my_addon", "load": "/home/u/.config/blender/addons/my_addon"}
            ]
        })
    }

    fn parse_value(v: &Value) -> Result<InboundMessage, ProtocolError> {
        InboundMessage::parse(v.to_string().as_bytes())
    }

    #[test]
    fn test_parse_full_setup() {
        let msg = parse_value(&full_setup()).unwrap();
        let InboundMessage::Setup(setup) = msg else {
            panic!("expected setup, got {:?}", msg);
        };
        assert_eq!(setup.blender_port, 6001);
        assert_eq!(setup.debugpy_port, 6002);
        assert_eq!(setup.blender_path, "/opt/blender/blender");
        assert_eq!(setup.scripts_folder, "/opt/blender/4.1/scripts");
        assert_eq!(setup.vscode_identifier, "abc123");
        assert_eq!(setup.addon_path_mappings.len(), 1);
        assert_eq!(setup.addon_path_mappings[0].src, "/work/my_addon");
    }

    #[test]
    fn test_malformed_json_rejected() {
        for body in ["", "{", "not json", "{\"type\": \"setup\",}"] {
            let err = InboundMessage::parse(body.as_bytes()).unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidJson(_)), "body {:?}", body);
        }
    }

    #[test]
    fn test_missing_or_unknown_type() {
        assert_eq!(parse_value(&json!({})).unwrap_err(), ProtocolError::MissingType);
        assert_eq!(parse_value(&json!([1, 2])).unwrap_err(), ProtocolError::MissingType);
        assert_eq!(parse_value(&json!({"type": 3})).unwrap_err(), ProtocolError::MissingType);
        assert_eq!(
            parse_value(&json!({"type": "ping"})).unwrap_err(),
            ProtocolError::UnknownType("ping".into())
        );
    }

    #[test]
    fn test_each_required_setup_field_is_checked() {
        for field in [
            "blenderPort",
            "debugpyPort",
            "blenderPath",
            "scriptsFolder",
            "vscodeIdentifier",
        ] {
            let mut v = full_setup();
            v.as_object_mut().unwrap().remove(field);
            match parse_value(&v) {
                Err(ProtocolError::InvalidField { field: f, .. }) => assert_eq!(f, field),
                other => panic!("removing {} gave {:?}", field, other),
            }
        }
    }

    #[test]
    fn test_invalid_port_values() {
        for bad in [json!("6001"), json!(-1), json!(1.5), json!(70000), json!(null)] {
            let mut v = full_setup();
            v["blenderPort"] = bad.clone();
            assert!(
                matches!(parse_value(&v), Err(ProtocolError::InvalidField { field: "blenderPort", .. })),
                "port {:?} should be rejected",
                bad
            );
        }

        let mut v = full_setup();
        v["debugpyPort"] = json!(5678.0);
        let InboundMessage::Setup(setup) = parse_value(&v).unwrap() else {
            panic!("expected setup");
        };
        assert_eq!(setup.debugpy_port, 5678);
    }

    #[test]
    fn test_empty_strings_rejected() {
        let mut v = full_setup();
        v["vscodeIdentifier"] = json!("");
        assert!(matches!(
            parse_value(&v),
            Err(ProtocolError::InvalidField { field: "vscodeIdentifier", .. })
        ));
    }

    #[test]
    fn test_malformed_mappings_dropped() {
        let mut v = full_setup();
        v["addonPathMappings"] = json!([
            {"src": "/a", "load": "/b"},
            {"src": "/only-src"},
            {"src": 1, "load": "/c"},
            "junk",
            {"src": "/d", "load": "/e", "extra": true}
        ]);
        let InboundMessage::Setup(setup) = parse_value(&v).unwrap() else {
            panic!("expected setup");
        };
        assert_eq!(
            setup.addon_path_mappings,
            vec![
                AddonPathMapping { src: "/a".into(), load: "/b".into() },
                AddonPathMapping { src: "/d".into(), load: "/e".into() },
            ]
        );

        v["addonPathMappings"] = json!("nope");
        let InboundMessage::Setup(setup) = parse_value(&v).unwrap() else {
            panic!("expected setup");
        };
        assert!(setup.addon_path_mappings.is_empty());
    }

    #[test]
    fn test_notification_messages() {
        assert_eq!(
            parse_value(&json!({"type": "addonUpdated"})).unwrap(),
            InboundMessage::AddonUpdated
        );
        assert_eq!(
            parse_value(&json!({"type": "enableFailure"})).unwrap(),
            InboundMessage::EnableFailure(FailureReport::default())
        );
        let msg = parse_value(&json!({"type": "disableFailure", "message": "boom"})).unwrap();
        assert_eq!(msg.kind(), "disableFailure");
        assert_eq!(
            msg,
            InboundMessage::DisableFailure(FailureReport {
                addon_path: None,
                message: Some("boom".into()),
            })
        );
        let msg = parse_value(&json!({"type": "enableFailure", "addonPath": "/work/addon"})).unwrap();
        assert_eq!(
            msg,
            InboundMessage::EnableFailure(FailureReport {
                addon_path: Some("/work/addon".into()),
                message: None,
            })
        );
    }
}
