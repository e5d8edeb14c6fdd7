//! Error types for Switchyard

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for Switchyard operations
pub type Result<T> = std::result::Result<T, SwitchyardError>;

/// Errors that can occur in Switchyard operations
#[derive(Debug, Error)]
pub enum SwitchyardError {
    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Segment size outside the accepted range
    #[error("Shared memory size {size} out of bounds: min {min} bytes, max {max} bytes")]
    CapacityOutOfBounds { size: usize, min: usize, max: usize },

    /// Segment header was never initialized by a producer
    #[error("Invalid segment magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Payload does not fit the data region
    #[error("Buffer overflow: max {max} bytes, got {got} bytes")]
    BufferOverflow { max: usize, got: usize },

    /// A process-shared pthread primitive failed
    #[error("{op} failed with errno {code}")]
    Pthread { op: &'static str, code: i32 },

    /// Could not take the segment init lock in time
    #[error("Timed out waiting for the init lock of segment '{0}'")]
    InitLockTimeout(String),

    /// A live producer already owns the segment
    #[error("Shared memory segment '{name}' is in use by pid {pid}")]
    SegmentInUse { name: String, pid: u64 },

    /// Channel name unusable as a registry key or segment name
    #[error("Invalid channel name '{name}': {reason}")]
    InvalidChannelName { name: String, reason: &'static str },

    /// CURVE key is not a 40-character Z85 string
    #[error("Invalid CURVE key: {0}")]
    InvalidKey(String),

    /// Empty or malformed endpoint
    #[error("Invalid endpoint: '{0}'")]
    InvalidEndpoint(String),

    /// ZeroMQ transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] zmq::Error),

    /// Malformed message on the wire
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON body could not be encoded or decoded
    #[error("Malformed JSON body: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel is registered but has not heartbeated yet
    #[error("Channel '{0}' is not ready")]
    ChannelNotReady(String),

    /// Channel is unknown to the broker
    #[error("Channel '{0}' not found")]
    ChannelNotFound(String),

    /// Schema hashes disagree
    #[error("Schema mismatch on channel '{channel}'")]
    SchemaMismatch { channel: String },

    /// Another producer owns the channel
    #[error("Channel '{0}' is owned by another producer")]
    NotOwner(String),

    /// Any other error status returned by the broker
    #[error("Broker rejected request for '{channel}': {code}")]
    Rejected { channel: String, code: String },

    /// Round trip exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// No broker connection on this client
    #[error("Client is not connected to a broker")]
    NotConnected,

    /// Worker thread is gone
    #[error("Client worker has stopped")]
    WorkerStopped,

    /// Failed to read a configuration file
    #[error("Failed to read config '{path}': {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: io::Error,
    },
}
