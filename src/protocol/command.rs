use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payloads the editor sends to a running Blender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EditorCommand {
    /// Run a script file inside Blender.
    Script { path: String },
    /// Reload add-ons; `names[i]` is loaded from `dirs[i]`.
    Reload { names: Vec<String>, dirs: Vec<String> },
    /// Quit Blender.
    Stop,
    /// Code completion request, sent with GET.
    Complete {
        #[serde(rename = "sessionId")]
        session_id: String,
        line: String,
        document: String,
        current_line: u32,
        current_character: u32,
    },
}

impl EditorCommand {
    pub fn to_value(&self) -> Value {
        // Serializing a plain enum of strings and integers cannot fail
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl From<EditorCommand> for Value {
    fn from(cmd: EditorCommand) -> Self {
        cmd.to_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_script_command_shape() {
        let cmd = EditorCommand::Script {
            path: "/tmp/hello.py".into(),
        };
        assert_eq!(cmd.to_value(), json!({"type": "script", "path": "/tmp/hello.py"}));
    }

    #[test]
    fn test_stop_and_reload_shape() {
        assert_eq!(EditorCommand::Stop.to_value(), json!({"type": "stop"}));
        let reload = EditorCommand::Reload {
            names: vec!["my_addon".into()],
            dirs: vec!["/addons/my_addon".into()],
        };
        assert_eq!(
            Value::from(reload),
            json!({"type": "reload", "names": ["my_addon"], "dirs": ["/addons/my_addon"]})
        );
    }

    #[test]
    fn test_complete_field_names() {
        let cmd = EditorCommand::Complete {
            session_id: "s1".into(),
            line: "bpy.".into(),
            document: "import bpy\nbpy.".into(),
            current_line: 1,
            current_character: 4,
        };
        let v = cmd.to_value();
        assert_eq!(v["type"], "complete");
        assert_eq!(v["sessionId"], "s1");
        assert_eq!(v["current_line"], 1);
        assert_eq!(v["current_character"], 4);
    }
}
