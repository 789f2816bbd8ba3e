//! Status events pushed to live observers

use serde::{Deserialize, Serialize};

/// Event delivered over the observer push channel.
///
/// The serialized form is the JSON the web client understands, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StatusEvent {
    /// A chat session received a new title
    #[serde(rename = "session_title_update")]
    TitleChanged { session_id: String, title: String },

    /// Background indexing state or accelerator load changed
    #[serde(rename = "gpu_status_update")]
    GpuStatus { payload: GpuStatusPayload },

    /// Sent once to an observer when it registers
    #[serde(rename = "connected")]
    Connected { status: String },

    /// Reply to any message an observer sends
    #[serde(rename = "ping")]
    Ping { status: String },
}

/// Body of a `gpu_status_update` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuStatusPayload {
    pub is_indexing: bool,
    pub gpu_utilization: f64,
}

impl StatusEvent {
    pub fn title_changed(session_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self::TitleChanged {
            session_id: session_id.into(),
            title: title.into(),
        }
    }

    pub fn gpu_status(is_indexing: bool, gpu_utilization: f64) -> Self {
        Self::GpuStatus {
            payload: GpuStatusPayload {
                is_indexing,
                gpu_utilization,
            },
        }
    }

    pub fn connected() -> Self {
        Self::Connected {
            status: "ok".to_string(),
        }
    }

    pub fn ping() -> Self {
        Self::Ping {
            status: "ok".to_string(),
        }
    }

    /// Wire name of the event
    pub fn event_type(&self) -> &'static str {
        match self {
            StatusEvent::TitleChanged { .. } => "session_title_update",
            StatusEvent::GpuStatus { .. } => "gpu_status_update",
            StatusEvent::Connected { .. } => "connected",
            StatusEvent::Ping { .. } => "ping",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_title_changed_wire_format() {
        let event = StatusEvent::title_changed("chat-1", "Trip planning");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "session_title_update",
                "session_id": "chat-1",
                "title": "Trip planning"
            })
        );
    }

    #[test]
    fn test_gpu_status_wire_format() {
        let event = StatusEvent::gpu_status(true, 4.5);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "gpu_status_update",
                "payload": {"is_indexing": true, "gpu_utilization": 4.5}
            })
        );
        assert_eq!(event.event_type(), "gpu_status_update");
    }

    #[test]
    fn test_connected_and_ping() {
        let connected = serde_json::to_value(StatusEvent::connected()).unwrap();
        assert_eq!(connected, json!({"type": "connected", "status": "ok"}));

        let parsed: StatusEvent =
            serde_json::from_str(r#"{"type":"ping","status":"ok"}"#).unwrap();
        assert_eq!(parsed, StatusEvent::ping());
    }
}
