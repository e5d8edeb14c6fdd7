//! Broker wire protocol
//!
//! Every message is three frames:
//!
//! | frame | content                            |
//! |-------|------------------------------------|
//! | 0     | message class, one byte (`'C'`)    |
//! | 1     | message type, e.g. `REG_REQ`       |
//! | 2     | JSON body                          |
//!
//! Requests and replies are paired by ordering on the socket; there is no
//! request id, so a client keeps at most one request in flight.

use crate::error::{Result, SwitchyardError};
use crate::schema::SchemaHash;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message class of control traffic
pub const MSG_CLASS_CONTROL: u8 = b'C';

/// Number of frames in a message as sent by a client
pub const FRAME_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    RegReq,
    RegAck,
    DiscReq,
    DiscResp,
    HeartbeatReq,
    ConsumerRegReq,
    ConsumerRegAck,
    ConsumerDeregReq,
    ConsumerDeregAck,
    DeregReq,
    DeregAck,
    ChannelClosingNotify,
}

impl MessageType {
    pub const ALL: [MessageType; 12] = [
        MessageType::RegReq,
        MessageType::RegAck,
        MessageType::DiscReq,
        MessageType::DiscResp,
        MessageType::HeartbeatReq,
        MessageType::ConsumerRegReq,
        MessageType::ConsumerRegAck,
        MessageType::ConsumerDeregReq,
        MessageType::ConsumerDeregAck,
        MessageType::DeregReq,
        MessageType::DeregAck,
        MessageType::ChannelClosingNotify,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::RegReq => "REG_REQ",
            MessageType::RegAck => "REG_ACK",
            MessageType::DiscReq => "DISC_REQ",
            MessageType::DiscResp => "DISC_RESP",
            MessageType::HeartbeatReq => "HEARTBEAT_REQ",
            MessageType::ConsumerRegReq => "CONSUMER_REG_REQ",
            MessageType::ConsumerRegAck => "CONSUMER_REG_ACK",
            MessageType::ConsumerDeregReq => "CONSUMER_DEREG_REQ",
            MessageType::ConsumerDeregAck => "CONSUMER_DEREG_ACK",
            MessageType::DeregReq => "DEREG_REQ",
            MessageType::DeregAck => "DEREG_ACK",
            MessageType::ChannelClosingNotify => "CHANNEL_CLOSING_NOTIFY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Reply type the broker sends for this request, if any
    pub fn reply(self) -> Option<Self> {
        match self {
            MessageType::RegReq => Some(MessageType::RegAck),
            MessageType::DiscReq => Some(MessageType::DiscResp),
            MessageType::ConsumerRegReq => Some(MessageType::ConsumerRegAck),
            MessageType::ConsumerDeregReq => Some(MessageType::ConsumerDeregAck),
            MessageType::DeregReq => Some(MessageType::DeregAck),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Socket pattern of a channel's data plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChannelPattern {
    #[default]
    PubSub,
    Pipeline,
    Bidir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ChannelNotReady,
    ChannelNotFound,
    SchemaMismatch,
    NotOwner,
    InvalidRequest,
    /// Any code this build does not know
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ChannelNotReady => "CHANNEL_NOT_READY",
            ErrorCode::ChannelNotFound => "CHANNEL_NOT_FOUND",
            ErrorCode::SchemaMismatch => "SCHEMA_MISMATCH",
            ErrorCode::NotOwner => "NOT_OWNER",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    pub fn into_error(self, channel: &str) -> SwitchyardError {
        let channel = channel.to_string();
        match self {
            ErrorCode::ChannelNotReady => SwitchyardError::ChannelNotReady(channel),
            ErrorCode::ChannelNotFound => SwitchyardError::ChannelNotFound(channel),
            ErrorCode::SchemaMismatch => SwitchyardError::SchemaMismatch { channel },
            ErrorCode::NotOwner => SwitchyardError::NotOwner(channel),
            code => SwitchyardError::Rejected {
                channel,
                code: code.as_str().to_string(),
            },
        }
    }
}

/// Everything a consumer needs to reach a producer
///
/// Sent flattened inside `REG_REQ` and `DISC_RESP` bodies.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerInfo {
    /// 64 lowercase hex chars, or empty when the producer has no schema
    pub schema_hash: String,
    pub schema_version: u32,
    pub producer_pid: u64,
    pub producer_hostname: String,
    pub has_shared_memory: bool,
    pub channel_pattern: ChannelPattern,
    pub zmq_ctrl_endpoint: String,
    pub zmq_data_endpoint: String,
    /// Z85 public key of the producer's data-plane sockets
    pub zmq_pubkey: String,
    pub shm_name: String,
    pub shm_size: u64,
    pub consumer_count: u32,
}

impl ProducerInfo {
    /// Decoded schema hash; `None` if absent or malformed
    pub fn schema_hash(&self) -> Option<SchemaHash> {
        SchemaHash::from_hex(&self.schema_hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub channel_name: String,
    #[serde(flatten)]
    pub info: ProducerInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub channel_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub channel_name: String,
    pub producer_pid: u64,
}

/// `DEREG_REQ`: producer-initiated close
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeregisterRequest {
    pub channel_name: String,
    pub producer_pid: u64,
}

/// `CONSUMER_REG_REQ` and `CONSUMER_DEREG_REQ`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerRequest {
    pub channel_name: String,
    pub consumer_pid: u64,
    #[serde(default)]
    pub consumer_hostname: String,
}

/// Generic acknowledgement carrying a status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub channel_name: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Reply {
    pub fn success(channel: &str) -> Self {
        Self {
            channel_name: channel.to_string(),
            status: Status::Success,
            error_code: None,
            error_message: None,
        }
    }

    pub fn error(channel: &str, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            channel_name: channel.to_string(),
            status: Status::Error,
            error_code: Some(code),
            error_message: Some(message.into()),
        }
    }

    /// Turn an error status into the matching error
    pub fn into_result(self) -> Result<()> {
        match self.status {
            Status::Success => Ok(()),
            Status::Error => Err(self
                .error_code
                .unwrap_or(ErrorCode::Unknown)
                .into_error(&self.channel_name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverResponse {
    #[serde(flatten)]
    pub reply: Reply,
    #[serde(flatten)]
    pub info: ProducerInfo,
}

impl DiscoverResponse {
    pub fn found(channel: &str, info: ProducerInfo) -> Self {
        Self {
            reply: Reply::success(channel),
            info,
        }
    }

    pub fn error(channel: &str, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            reply: Reply::error(channel, code, message),
            info: ProducerInfo::default(),
        }
    }
}

/// Why a channel is going away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    HeartbeatTimeout,
    Deregistered,
    #[serde(other)]
    Unknown,
}

/// Unsolicited `CHANNEL_CLOSING_NOTIFY`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosingNotice {
    pub channel_name: String,
    #[serde(default = "unknown_reason")]
    pub reason: CloseReason,
}

fn unknown_reason() -> CloseReason {
    CloseReason::Unknown
}

/// A decoded control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_type: MessageType,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn parse_body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Channel name of any body, without knowing its type
    pub fn channel_name(&self) -> Option<String> {
        #[derive(Deserialize)]
        struct Named {
            channel_name: String,
        }
        serde_json::from_slice::<Named>(&self.body)
            .ok()
            .map(|n| n.channel_name)
    }
}

/// Build the three frames of a control message
pub fn encode<T: Serialize>(msg_type: MessageType, body: &T) -> Result<Vec<Vec<u8>>> {
    Ok(vec![
        vec![MSG_CLASS_CONTROL],
        msg_type.as_str().as_bytes().to_vec(),
        serde_json::to_vec(body)?,
    ])
}

/// Validate and split the three frames of a control message
pub fn decode(frames: Vec<Vec<u8>>) -> Result<Envelope> {
    if frames.len() != FRAME_COUNT {
        return Err(SwitchyardError::Protocol(format!(
            "expected {} frames, got {}",
            FRAME_COUNT,
            frames.len()
        )));
    }

    let mut frames = frames.into_iter();
    let class = frames.next().unwrap_or_default();
    let type_frame = frames.next().unwrap_or_default();
    let body = frames.next().unwrap_or_default();

    if class.as_slice() != [MSG_CLASS_CONTROL] {
        return Err(SwitchyardError::Protocol(format!(
            "unexpected message class {:?}",
            String::from_utf8_lossy(&class)
        )));
    }

    let type_str = std::str::from_utf8(&type_frame)
        .map_err(|_| SwitchyardError::Protocol("message type is not UTF-8".into()))?;
    let msg_type = MessageType::parse(type_str)
        .ok_or_else(|| SwitchyardError::Protocol(format!("unknown message type '{}'", type_str)))?;

    Ok(Envelope { msg_type, body })
}
