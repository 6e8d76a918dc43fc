//! Wire types shared by the gateway and the message bus.
//!
//! Two directions of traffic:
//! - outbound: lifecycle events and data frames the gateway publishes on
//!   [`OUTPUT_CHANNEL`] (`onConnect`, `onClose`, `onTextMessage`,
//!   `onBinaryMessage`)
//! - inbound: administrative commands the gateway consumes from
//!   [`INPUT_CHANNEL`] (`closeDeviceConnections`, `closeUserConnections`,
//!   `publishTextMessage`)
//!
//! All bus traffic is JSON. Frame bodies are raw bytes on the Rust side and
//! base64 strings on the wire.

use serde::{Deserialize, Serialize};

// ── Bus channels ─────────────────────────────────────────────────────────────

/// Channel the gateway publishes connection events and frames on.
pub const OUTPUT_CHANNEL: &str = "wsOutput";
/// Channel the gateway consumes administrative commands from.
pub const INPUT_CHANNEL: &str = "wsinput";

// ── Identities ───────────────────────────────────────────────────────────────

/// Opaque user identifier. The empty string means unknown/unauthenticated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the reserved empty identity.
    pub fn is_unknown(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque device identifier. The empty string means unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-local connection identifier.
///
/// Live connections carry ids ≥ 1, assigned from a monotonic counter.
/// `0` is uninitialized and `-1` marks a connection that has been removed
/// from the registry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ConnectionId(i64);

impl ConnectionId {
    pub const UNINITIALIZED: ConnectionId = ConnectionId(0);
    pub const TOMBSTONE: ConnectionId = ConnectionId(-1);

    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn value(self) -> i64 {
        self.0
    }

    pub fn is_tombstone(self) -> bool {
        self.0 == Self::TOMBSTONE.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Message type ─────────────────────────────────────────────────────────────

/// Frame payload kind, wire-encoded as an integer (`0` text, `1` binary).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageType {
    #[default]
    Text,
    Binary,
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> Self {
        match t {
            MessageType::Text => 0,
            MessageType::Binary => 1,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Text),
            1 => Ok(MessageType::Binary),
            other => Err(format!("invalid message type: {other}")),
        }
    }
}

// ── Event methods ────────────────────────────────────────────────────────────

/// Lifecycle and data events published on [`OUTPUT_CHANNEL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMethod {
    Connect,
    Close,
    TextMessage,
    BinaryMessage,
}

impl EventMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            EventMethod::Connect => "onConnect",
            EventMethod::Close => "onClose",
            EventMethod::TextMessage => "onTextMessage",
            EventMethod::BinaryMessage => "onBinaryMessage",
        }
    }
}

impl std::fmt::Display for EventMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Bus message ──────────────────────────────────────────────────────────────

/// A single message on the bus: a method name plus JSON params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub method: String,
    pub params: serde_json::Value,
}

impl BusMessage {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

// ── Outbound envelope ────────────────────────────────────────────────────────

/// Params of an outbound event envelope.
///
/// `user_id`/`device_id` serialize as JSON `null` when the connection has no
/// identity. `type` is always present; non-data events (`onConnect`,
/// `onClose`) carry `0`. An empty body serializes as an empty base64 string,
/// never null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventParams {
    pub input_time: i64,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl EventParams {
    /// Build params stamped with the current wall-clock time in nanoseconds.
    pub fn now(
        user_id: Option<&UserId>,
        device_id: Option<&DeviceId>,
        message_type: MessageType,
        body: Vec<u8>,
    ) -> Self {
        Self {
            input_time: now_nanos(),
            user_id: user_id.map(|u| u.as_str().to_string()),
            device_id: device_id.map(|d| d.as_str().to_string()),
            message_type,
            body,
        }
    }
}

/// Pack an event into a bus message ready for publishing.
pub fn pack_event(method: EventMethod, params: &EventParams) -> Result<BusMessage, CodecError> {
    Ok(BusMessage {
        method: method.as_str().to_string(),
        params: serde_json::to_value(params)?,
    })
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

// ── Admin commands ───────────────────────────────────────────────────────────

/// Params of `closeDeviceConnections`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseDeviceParams {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub reason: String,
}

/// Params of `closeUserConnections`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseUserParams {
    pub user_id: UserId,
    pub reason: String,
}

/// One delivery target of `publishTextMessage`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub device_id: Option<DeviceId>,
}

/// Params of `publishTextMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishParams {
    pub to: Vec<Recipient>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// An administrative command addressed to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    CloseDeviceConnections(CloseDeviceParams),
    CloseUserConnections(CloseUserParams),
    PublishTextMessage(PublishParams),
}

impl AdminCommand {
    /// Decode a bus message into a command.
    ///
    /// Field order is free; types are strict. Callers log and drop
    /// undecodable messages — a bad command must never take the gateway down.
    pub fn decode(message: &BusMessage) -> Result<Self, CommandError> {
        fn params<T: serde::de::DeserializeOwned>(
            message: &BusMessage,
        ) -> Result<T, CommandError> {
            serde_json::from_value(message.params.clone()).map_err(|source| {
                CommandError::BadParams {
                    method: message.method.clone(),
                    source,
                }
            })
        }

        match message.method.as_str() {
            "closeDeviceConnections" => Ok(Self::CloseDeviceConnections(params(message)?)),
            "closeUserConnections" => Ok(Self::CloseUserConnections(params(message)?)),
            "publishTextMessage" => Ok(Self::PublishTextMessage(params(message)?)),
            other => Err(CommandError::UnknownMethod(other.to_string())),
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("malformed params for {method}: {source}")]
    BadParams {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("envelope encoding failed: {0}")]
pub struct CodecError(#[from] serde_json::Error);

// ── Base64 bodies ────────────────────────────────────────────────────────────

/// Serde adapter encoding byte bodies as standard base64 strings.
pub mod base64_bytes {
    use {
        base64::{Engine as _, engine::general_purpose::STANDARD},
        serde::{Deserialize, Deserializer, Serializer},
    };

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_params_round_trip() {
        let params = EventParams {
            input_time: 1_700_000_000_000_000_000,
            user_id: Some("u1".into()),
            device_id: Some("d1".into()),
            message_type: MessageType::Binary,
            body: vec![0, 159, 146, 150],
        };
        let json = serde_json::to_string(&params).unwrap();
        let back: EventParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn anonymous_ids_serialize_as_null() {
        let params = EventParams::now(None, None, MessageType::Text, Vec::new());
        let json = serde_json::to_value(&params).unwrap();
        assert!(json["userId"].is_null());
        assert!(json["deviceId"].is_null());
        // Empty body is an empty string, not null.
        assert_eq!(json["body"], "");
        assert_eq!(json["type"], 0);
    }

    #[test]
    fn identified_event_carries_ids_and_body() {
        let user = UserId::new("u1");
        let device = DeviceId::new("d1");
        let params = EventParams::now(
            Some(&user),
            Some(&device),
            MessageType::Text,
            b"hello".to_vec(),
        );
        let message = pack_event(EventMethod::TextMessage, &params).unwrap();
        assert_eq!(message.method, "onTextMessage");
        assert_eq!(message.params["userId"], "u1");
        assert_eq!(message.params["deviceId"], "d1");
        // "hello" in standard base64.
        assert_eq!(message.params["body"], "aGVsbG8=");
        assert!(message.params["inputTime"].as_i64().unwrap() > 0);
    }

    #[test]
    fn message_type_wire_encoding() {
        assert_eq!(serde_json::to_string(&MessageType::Text).unwrap(), "0");
        assert_eq!(serde_json::to_string(&MessageType::Binary).unwrap(), "1");
        let t: MessageType = serde_json::from_str("1").unwrap();
        assert_eq!(t, MessageType::Binary);
        assert!(serde_json::from_str::<MessageType>("2").is_err());
    }

    #[test]
    fn decode_close_user_connections() {
        let message = BusMessage::new(
            "closeUserConnections",
            serde_json::json!({ "userId": "u1", "reason": "bye" }),
        );
        let command = AdminCommand::decode(&message).unwrap();
        assert_eq!(
            command,
            AdminCommand::CloseUserConnections(CloseUserParams {
                user_id: "u1".into(),
                reason: "bye".into(),
            })
        );
    }

    #[test]
    fn decode_close_device_connections() {
        let message = BusMessage::new(
            "closeDeviceConnections",
            serde_json::json!({ "deviceId": "d1", "userId": "u1", "reason": "rotate" }),
        );
        let command = AdminCommand::decode(&message).unwrap();
        assert_eq!(
            command,
            AdminCommand::CloseDeviceConnections(CloseDeviceParams {
                user_id: "u1".into(),
                device_id: "d1".into(),
                reason: "rotate".into(),
            })
        );
    }

    #[test]
    fn decode_publish_text_message() {
        let message = BusMessage::new(
            "publishTextMessage",
            serde_json::json!({
                "to": [{ "userId": "u1", "deviceId": "d1" }, { "userId": "u2" }],
                "type": 0,
                "body": "aGk=",
            }),
        );
        let AdminCommand::PublishTextMessage(params) = AdminCommand::decode(&message).unwrap()
        else {
            panic!("wrong variant");
        };
        assert_eq!(params.to.len(), 2);
        assert_eq!(params.to[1].device_id, None);
        assert_eq!(params.message_type, MessageType::Text);
        assert_eq!(params.body, b"hi");
    }

    #[test]
    fn decode_rejects_unknown_method() {
        let message = BusMessage::new("selfDestruct", serde_json::json!({}));
        assert!(matches!(
            AdminCommand::decode(&message),
            Err(CommandError::UnknownMethod(m)) if m == "selfDestruct"
        ));
    }

    #[test]
    fn decode_rejects_malformed_params() {
        let message = BusMessage::new(
            "closeUserConnections",
            serde_json::json!({ "userId": 42, "reason": "bye" }),
        );
        assert!(matches!(
            AdminCommand::decode(&message),
            Err(CommandError::BadParams { .. })
        ));
    }
}
