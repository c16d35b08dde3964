use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Greeting sent by QEMU when a QMP connection opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QmpGreeting {
    #[serde(rename = "QMP")]
    pub qmp: QmpVersionInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QmpVersionInfo {
    pub version: QmpVersion,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QmpVersion {
    pub qemu: QemuVersion,
    #[serde(default)]
    pub package: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QemuVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl std::fmt::Display for QmpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.qemu.major, self.qemu.minor, self.qemu.micro
        )
    }
}

/// An `execute` request.
#[derive(Debug, Serialize, Deserialize)]
pub struct QmpCommand {
    pub execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl QmpCommand {
    pub fn new(command: &str) -> Self {
        Self {
            execute: command.to_string(),
            arguments: None,
            id: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: String) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn with_args(mut self, args: Value) -> Self {
        self.arguments = Some(args);
        self
    }
}

/// Reply to a command: either a `return` payload or an `error` object.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QmpResponse {
    Success {
        #[serde(rename = "return")]
        result: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Error {
        error: QmpError,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl QmpResponse {
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Success { id, .. } | Self::Error { id, .. } => id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QmpError {
    pub class: String,
    pub desc: String,
}

/// Asynchronous event, e.g. SHUTDOWN or POWERDOWN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QmpEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<QmpTimestamp>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QmpTimestamp {
    pub seconds: u64,
    pub microseconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn greeting_parses() {
        let raw = json!({
            "QMP": {
                "version": {
                    "qemu": {"major": 8, "minor": 2, "micro": 1},
                    "package": "qemu-8.2.1"
                },
                "capabilities": ["oob"]
            }
        });
        let greeting: QmpGreeting = serde_json::from_value(raw).expect("greeting");
        assert_eq!(greeting.qmp.version.to_string(), "8.2.1");
        assert_eq!(greeting.qmp.capabilities, vec!["oob"]);
    }

    #[test]
    fn success_and_error_responses_are_distinguished() {
        let ok: QmpResponse =
            serde_json::from_value(json!({"return": {}, "id": "1"})).expect("ok");
        assert!(matches!(ok, QmpResponse::Success { .. }));
        assert_eq!(ok.id(), Some("1"));

        let err: QmpResponse = serde_json::from_value(json!({
            "error": {"class": "GenericError", "desc": "it broke"}
        }))
        .expect("err");
        match err {
            QmpResponse::Error { error, .. } => {
                assert_eq!(error.class, "GenericError");
                assert_eq!(error.desc, "it broke");
            }
            QmpResponse::Success { .. } => panic!("expected error variant"),
        }
    }

    #[test]
    fn command_serializes_without_empty_fields() {
        let cmd = QmpCommand::new("system_powerdown");
        let value = serde_json::to_value(&cmd).expect("serialize");
        assert_eq!(value, json!({"execute": "system_powerdown"}));
    }

    #[test]
    fn event_parses() {
        let raw = json!({
            "event": "SHUTDOWN",
            "data": {"guest": true},
            "timestamp": {"seconds": 1700000000u64, "microseconds": 42}
        });
        let event: QmpEvent = serde_json::from_value(raw).expect("event");
        assert_eq!(event.event, "SHUTDOWN");
        assert!(event.timestamp.is_some());
    }
}
