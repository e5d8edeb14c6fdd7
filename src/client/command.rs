//! Commands queued from API callers to the client worker

use crate::error::Result;
use crate::protocol::ProducerInfo;
use crate::schema::SchemaHash;
use std::time::Duration;

/// One-shot reply slot; the worker sends exactly one value
pub(crate) type ReplyTx<T> = flume::Sender<Result<T>>;

pub(crate) enum Command {
    Connect {
        endpoint: String,
        broker_key: String,
        reply: ReplyTx<()>,
    },
    Disconnect {
        reply: ReplyTx<()>,
    },
    /// Fire-and-forget registration; the ack is only logged
    RegisterProducer {
        channel: String,
        info: ProducerInfo,
    },
    CreateChannel {
        channel: String,
        info: ProducerInfo,
        timeout: Duration,
        reply: ReplyTx<()>,
    },
    /// Discovery, schema check and consumer registration in one step
    ConnectChannel {
        channel: String,
        expected_schema: Option<SchemaHash>,
        timeout: Duration,
        reply: ReplyTx<ProducerInfo>,
    },
    Discover {
        channel: String,
        timeout: Duration,
        reply: ReplyTx<ProducerInfo>,
    },
    RegisterConsumer {
        channel: String,
        timeout: Duration,
        reply: ReplyTx<()>,
    },
    DeregisterConsumer {
        channel: String,
        timeout: Duration,
        reply: ReplyTx<()>,
    },
    DeregisterChannel {
        channel: String,
        timeout: Duration,
        reply: ReplyTx<()>,
    },
    Stop,
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::Disconnect { .. } => "disconnect",
            Command::RegisterProducer { .. } => "register_producer",
            Command::CreateChannel { .. } => "create_channel",
            Command::ConnectChannel { .. } => "connect_channel",
            Command::Discover { .. } => "discover",
            Command::RegisterConsumer { .. } => "register_consumer",
            Command::DeregisterConsumer { .. } => "deregister_consumer",
            Command::DeregisterChannel { .. } => "deregister_channel",
            Command::Stop => "stop",
        }
    }
}
