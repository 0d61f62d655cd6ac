// WebSocket frames for the fanline broadcast protocol.
//
// Inbound frames arrive as `{event, data, id?, ack?}` envelopes and are
// classified into a closed `ClientCommand` set at the boundary. Outbound
// frames are serde-tagged on `event`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ── Error codes ─────────────────────────────────────────────────────

/// Numeric codes carried in `error` and `subscription_error` frames.
///
/// 4001 doubles as the close code for authentication timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AuthRequired,
    AuthTimeout,
    UnsupportedEvent,
    MissingField,
    InvalidRecoveryId,
    InvalidAck,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub const fn code(self) -> u16 {
        match self {
            Self::AuthRequired | Self::AuthTimeout | Self::UnsupportedEvent => 4001,
            Self::MissingField | Self::InvalidRecoveryId => 4002,
            Self::InvalidAck => 4004,
            Self::RateLimited => 429,
            Self::Internal => 5000,
        }
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::AuthRequired => "Authentication required",
            Self::AuthTimeout => "Authentication timeout",
            Self::UnsupportedEvent => "Unsupported event type",
            Self::MissingField => "Missing required field",
            Self::InvalidRecoveryId => "Invalid recovery ID",
            Self::InvalidAck => "Invalid acknowledgment",
            Self::RateLimited => "Rate limit exceeded",
            Self::Internal => "Internal server error",
        }
    }
}

/// WebSocket close codes used by the relay.
pub mod close_code {
    /// Authentication timed out or failed.
    pub const AUTH_TIMEOUT: u16 = 4001;
    /// Repeated throttle violations led to a ban.
    pub const POLICY_VIOLATION: u16 = 1008;
}

// ── Inbound frames ──────────────────────────────────────────────────

/// Raw inbound envelope as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub ack: Option<String>,
}

/// A classified inbound frame: the command plus the client correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequest {
    pub command: ClientCommand,
    pub id: Option<String>,
}

/// Every inbound message kind the relay understands, decoded at the
/// boundary. Unrecognized event names land in `Unknown` so dispatch stays
/// exhaustive.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Subscribe(SubscribeRequest),
    Unsubscribe { channel: String },
    Ping { time: Option<i64> },
    Reconnect { recovery_id: String, last_message_id: Option<String> },
    Sync { channel: String, last_message_id: Option<String> },
    Acknowledge { ack_id: String },
    Unknown { event: String },
}

impl ClientCommand {
    /// Stable label for logs and metrics.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Ping { .. } => "ping",
            Self::Reconnect { .. } => "reconnect",
            Self::Sync { .. } => "sync",
            Self::Acknowledge { .. } => "ack",
            Self::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    pub channel: String,
    /// Hex HMAC presented for `private-*` channels.
    pub signature: Option<String>,
    /// Identity joining a `presence-*` channel.
    pub user_id: Option<String>,
    pub user_info: Value,
    /// Present when the subscribe doubles as a recovery request.
    pub recovery_id: Option<String>,
    pub last_message_id: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Event type is required")]
    MissingEvent,
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("invalid {field} value")]
    InvalidField { field: &'static str },
}

impl FrameError {
    pub const fn error_code(&self) -> ErrorCode {
        ErrorCode::MissingField
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawSubscribe {
    channel: Option<String>,
    signature: Option<String>,
    user_id: Option<String>,
    #[serde(default)]
    user_info: Value,
    recovery_id: Option<String>,
    last_message_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawChannel {
    channel: Option<String>,
    last_message_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPing {
    time: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawReconnect {
    recovery_id: Option<String>,
    last_message_id: Option<String>,
}

impl ClientFrame {
    /// Classify a raw envelope into a typed command.
    ///
    /// A frame carrying an `ack` field takes the acknowledgment path
    /// regardless of its `event`.
    pub fn classify(self) -> Result<ClientRequest, FrameError> {
        let ClientFrame { event, data, id, ack } = self;

        if let Some(ack_id) = ack {
            return Ok(ClientRequest { command: ClientCommand::Acknowledge { ack_id }, id });
        }

        let Some(event) = event else {
            return Err(FrameError::MissingEvent);
        };

        let command = match event.as_str() {
            "subscribe" => {
                let raw: RawSubscribe = parse_data(data)?;
                ClientCommand::Subscribe(SubscribeRequest {
                    channel: raw.channel.ok_or(FrameError::MissingField("channel"))?,
                    signature: raw.signature,
                    user_id: raw.user_id,
                    user_info: raw.user_info,
                    recovery_id: raw.recovery_id,
                    last_message_id: raw.last_message_id,
                })
            }
            "unsubscribe" => {
                let raw: RawChannel = parse_data(data)?;
                ClientCommand::Unsubscribe {
                    channel: raw.channel.ok_or(FrameError::MissingField("channel"))?,
                }
            }
            "ping" => {
                let raw: RawPing = parse_data(data)?;
                ClientCommand::Ping { time: raw.time }
            }
            "reconnect" => {
                let raw: RawReconnect = parse_data(data)?;
                ClientCommand::Reconnect {
                    recovery_id: raw.recovery_id.ok_or(FrameError::MissingField("recovery_id"))?,
                    last_message_id: raw.last_message_id,
                }
            }
            "sync" => {
                let raw: RawChannel = parse_data(data)?;
                ClientCommand::Sync {
                    channel: raw.channel.ok_or(FrameError::MissingField("channel"))?,
                    last_message_id: raw.last_message_id,
                }
            }
            _ => ClientCommand::Unknown { event },
        };

        Ok(ClientRequest { command, id })
    }
}

fn parse_data<T>(data: Value) -> Result<T, FrameError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(data).map_err(|_| FrameError::InvalidField { field: "data" })
}

// ── Outbound frames ─────────────────────────────────────────────────

/// All server-to-client frames, tagged on `event`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        data: WelcomeData,
    },
    Error {
        data: ErrorData,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    ConnectionRejected {
        data: RejectionData,
    },
    SubscriptionSucceeded {
        channel: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
    },
    SubscriptionError {
        channel: String,
        data: ErrorData,
    },
    Pong {
        data: PongData,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Message {
        data: Value,
        message_id: String,
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recovery_id: Option<String>,
    },
    /// Server-side acknowledgment of a client frame that carried an `id`.
    Ack {
        ack: String,
        timestamp: String,
    },
    AckReceived {
        data: AckReceivedData,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    ReconnectAck {
        data: ReconnectAckData,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    RecoveryComplete {
        data: RecoveryCompleteData,
    },
    SyncComplete {
        data: SyncCompleteData,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    MemberAdded {
        channel: String,
        data: MemberData,
    },
    MemberRemoved {
        channel: String,
        data: MemberData,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WelcomeData {
    pub connection_id: String,
    pub message: String,
    pub server_time: String,
    pub requires_auth: bool,
    pub ping_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorData {
    pub message: String,
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorData {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { message: message.into(), code: code.code(), retry_after: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_retry_after(mut self, retry_after: u64) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectionData {
    pub reason: String,
    pub retry_after: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PongData {
    pub time: i64,
    pub server_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckReceivedData {
    pub ack_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectAckData {
    pub recovery_id: String,
    pub recovered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryCompleteData {
    pub recovery_id: String,
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncCompleteData {
    pub channel: String,
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberData {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub user_info: Value,
}

#[cfg(test)]
mod tests {
    use super::{ClientCommand, ClientFrame, ErrorCode, FrameError};
    use serde_json::json;

    fn frame(raw: serde_json::Value) -> ClientFrame {
        serde_json::from_value(raw).expect("frame should deserialize")
    }

    // ── Classification ─────────────────────────────────────────────

    #[test]
    fn subscribe_with_channel_classifies() {
        let request = frame(json!({
            "event": "subscribe",
            "data": { "channel": "presence-lobby", "user_id": "7", "user_info": {"name": "a"} },
            "id": "c-1"
        }))
        .classify()
        .expect("subscribe should classify");

        assert_eq!(request.id.as_deref(), Some("c-1"));
        match request.command {
            ClientCommand::Subscribe(subscribe) => {
                assert_eq!(subscribe.channel, "presence-lobby");
                assert_eq!(subscribe.user_id.as_deref(), Some("7"));
                assert_eq!(subscribe.user_info["name"], "a");
            }
            other => panic!("expected subscribe, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_without_channel_is_missing_field() {
        let error = frame(json!({ "event": "subscribe", "data": {} }))
            .classify()
            .expect_err("missing channel should error");
        assert_eq!(error, FrameError::MissingField("channel"));
        assert_eq!(error.error_code().code(), 4002);
    }

    #[test]
    fn missing_event_is_rejected() {
        let error = frame(json!({ "data": {} })).classify().expect_err("missing event");
        assert_eq!(error, FrameError::MissingEvent);
    }

    #[test]
    fn ack_field_wins_over_event() {
        let request = frame(json!({ "event": "ping", "ack": "m-42" }))
            .classify()
            .expect("ack frame should classify");
        assert_eq!(request.command, ClientCommand::Acknowledge { ack_id: "m-42".into() });
    }

    #[test]
    fn ping_without_data_defaults() {
        let request =
            frame(json!({ "event": "ping" })).classify().expect("ping should classify");
        assert_eq!(request.command, ClientCommand::Ping { time: None });
    }

    #[test]
    fn unknown_event_is_preserved() {
        let request = frame(json!({ "event": "teleport", "data": {} }))
            .classify()
            .expect("unknown event should classify");
        assert_eq!(request.command, ClientCommand::Unknown { event: "teleport".into() });
    }

    #[test]
    fn reconnect_requires_recovery_id() {
        let error = frame(json!({ "event": "reconnect", "data": {} }))
            .classify()
            .expect_err("reconnect without recovery_id");
        assert_eq!(error, FrameError::MissingField("recovery_id"));
    }

    #[test]
    fn malformed_data_is_invalid_field() {
        let error = frame(json!({ "event": "subscribe", "data": "not-an-object" }))
            .classify()
            .expect_err("string data should error");
        assert_eq!(error, FrameError::InvalidField { field: "data" });
    }

    // ── Error codes ────────────────────────────────────────────────

    #[test]
    fn error_codes_match_protocol_registry() {
        assert_eq!(ErrorCode::AuthRequired.code(), 4001);
        assert_eq!(ErrorCode::AuthTimeout.code(), 4001);
        assert_eq!(ErrorCode::UnsupportedEvent.code(), 4001);
        assert_eq!(ErrorCode::MissingField.code(), 4002);
        assert_eq!(ErrorCode::InvalidAck.code(), 4004);
        assert_eq!(ErrorCode::RateLimited.code(), 429);
        assert_eq!(ErrorCode::Internal.code(), 5000);
    }
}
