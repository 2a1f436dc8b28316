//! Protocol message types for streaming connections.
//!
//! A SignalK server sends a Hello message when a stream opens and delta
//! messages afterwards. Messages are serialized as JSON over WebSocket text
//! frames or as newline-delimited JSON over plain TCP.

use serde::{Deserialize, Serialize};
use signalk_core::Delta;

// ============================================================================
// Hello Message (Server → Client on connect)
// ============================================================================

/// Hello message sent by server immediately on WebSocket connection.
///
/// This message identifies the server and provides the client's context.
///
/// # Example
/// ```json
/// {
///   "name": "signalk-server-rust",
///   "version": "1.7.0",
///   "self": "vessels.urn:mrn:signalk:uuid:c0d79334-4e25-4245-8892-54e8ccc8021d",
///   "roles": ["main"],
///   "timestamp": "2024-01-17T10:30:00.000Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Server name identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// SignalK protocol version supported.
    pub version: String,

    /// The "self" context identifier for this vessel.
    #[serde(rename = "self", default, skip_serializing_if = "Option::is_none")]
    pub self_urn: Option<String>,

    /// Server roles (e.g., ["main"], ["main", "master"]).
    #[serde(default)]
    pub roles: Vec<String>,

    /// Current server timestamp in ISO 8601 format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl HelloMessage {
    /// Create a new Hello message.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        self_urn: impl Into<String>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            version: version.into(),
            self_urn: Some(self_urn.into()),
            roles: vec!["main".to_string()],
            timestamp: Some(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        }
    }
}

// ============================================================================
// Unified Message Enum
// ============================================================================

/// Messages that a server streams to its clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Hello message sent on connection.
    Hello(HelloMessage),

    /// Delta update with new data.
    Delta(Delta),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_serialization() {
        let hello = HelloMessage::new("test-server", "1.7.0", "vessels.urn:mrn:signalk:uuid:test");
        let json = serde_json::to_string(&hello).unwrap();

        assert!(json.contains("\"name\":\"test-server\""));
        assert!(json.contains("\"version\":\"1.7.0\""));
        assert!(json.contains("\"self\":\"vessels.urn:mrn:signalk:uuid:test\""));
        assert!(json.contains("\"roles\":[\"main\"]"));
    }

    #[test]
    fn test_minimal_hello_deserialization() {
        let json = r#"{"version": "1.0.0", "self": "vessels.urn:mrn:imo:mmsi:230099999"}"#;
        let hello: HelloMessage = serde_json::from_str(json).unwrap();
        assert_eq!(hello.version, "1.0.0");
        assert!(hello.roles.is_empty());
        assert!(hello.name.is_none());
    }
}
