//! Per-channel data plane
//!
//! Producers bind CURVE-server sockets on ephemeral ports and advertise
//! them through the broker; consumers connect to what discovery returned.
//!
//! | pattern  | producer data | consumer data |
//! |----------|---------------|---------------|
//! | PubSub   | PUB           | SUB           |
//! | Pipeline | PUSH          | PULL          |
//! | Bidir    | PAIR          | PAIR          |
//!
//! Every channel also carries a control socket (ROUTER on the producer,
//! DEALER on the consumer) for application-level side traffic.

use crate::auth::KeyPair;
use crate::broker::last_endpoint;
use crate::config::ClientConfig;
use crate::error::{Result, SwitchyardError};
use crate::process::{current_process_id, hostname};
use crate::protocol::{ChannelPattern, ProducerInfo};
use crate::schema::SchemaHash;
use crate::shm::segment_name;
use crate::shm_channel::{ShmConsumer, ShmProducer, HEADER_SIZE};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Producer,
    Consumer,
}

fn data_socket_type(pattern: ChannelPattern, role: ChannelRole) -> zmq::SocketType {
    match (pattern, role) {
        (ChannelPattern::PubSub, ChannelRole::Producer) => zmq::PUB,
        (ChannelPattern::PubSub, ChannelRole::Consumer) => zmq::SUB,
        (ChannelPattern::Pipeline, ChannelRole::Producer) => zmq::PUSH,
        (ChannelPattern::Pipeline, ChannelRole::Consumer) => zmq::PULL,
        (ChannelPattern::Bidir, _) => zmq::PAIR,
    }
}

/// An open channel, either end
pub struct ChannelHandle {
    name: String,
    role: ChannelRole,
    info: ProducerInfo,
    data: zmq::Socket,
    ctrl: zmq::Socket,
    shm_producer: Option<ShmProducer>,
    shm_consumer: Option<ShmConsumer>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("pattern", &self.info.channel_pattern)
            .field("data_endpoint", &self.info.zmq_data_endpoint)
            .field("shared_memory", &self.info.has_shared_memory)
            .finish()
    }
}

impl ChannelHandle {
    /// Bind the producer end of `name`
    ///
    /// Nothing is registered yet; dropping the handle releases the ports
    /// and unlinks the segment.
    pub(crate) fn bind_producer(
        ctx: &zmq::Context,
        config: &ClientConfig,
        name: &str,
        pattern: ChannelPattern,
        has_shared_memory: bool,
        schema_hash: Option<&SchemaHash>,
        schema_version: u32,
    ) -> Result<Self> {
        let keys = KeyPair::generate()?;
        let bind_endpoint = format!("tcp://{}:*", config.data_bind_host);

        let data = ctx.socket(data_socket_type(pattern, ChannelRole::Producer))?;
        let ctrl = ctx.socket(zmq::ROUTER)?;
        for socket in [&data, &ctrl] {
            keys.apply_server(socket)?;
            socket.set_linger(0)?;
            socket.bind(&bind_endpoint).map_err(|e| match e {
                zmq::Error::EINVAL => SwitchyardError::InvalidEndpoint(bind_endpoint.clone()),
                e => SwitchyardError::Transport(e),
            })?;
        }

        let shm_producer = if has_shared_memory {
            Some(ShmProducer::create(name, HEADER_SIZE + config.shm_capacity)?)
        } else {
            None
        };

        let info = ProducerInfo {
            schema_hash: schema_hash.map(SchemaHash::to_hex).unwrap_or_default(),
            schema_version,
            producer_pid: current_process_id(),
            producer_hostname: hostname(),
            has_shared_memory,
            channel_pattern: pattern,
            zmq_ctrl_endpoint: last_endpoint(&ctrl)?,
            zmq_data_endpoint: last_endpoint(&data)?,
            zmq_pubkey: keys.public_key,
            shm_name: if shm_producer.is_some() {
                segment_name(name)?
            } else {
                String::new()
            },
            shm_size: shm_producer.as_ref().map_or(0, |s| s.segment_size() as u64),
            consumer_count: 0,
        };
        debug!(channel = name, data = %info.zmq_data_endpoint, ctrl = %info.zmq_ctrl_endpoint, "Bound producer sockets");

        Ok(Self {
            name: name.to_string(),
            role: ChannelRole::Producer,
            info,
            data,
            ctrl,
            shm_producer,
            shm_consumer: None,
        })
    }

    /// Connect the consumer end to a discovered producer
    pub(crate) fn connect_consumer(
        ctx: &zmq::Context,
        config: &ClientConfig,
        name: &str,
        info: ProducerInfo,
    ) -> Result<Self> {
        if info.zmq_data_endpoint.is_empty() {
            return Err(SwitchyardError::InvalidEndpoint(format!(
                "channel '{}' advertised no data endpoint",
                name
            )));
        }
        let keys = KeyPair::generate()?;

        let data = ctx.socket(data_socket_type(info.channel_pattern, ChannelRole::Consumer))?;
        keys.apply_client(&data, &info.zmq_pubkey)?;
        data.set_linger(0)?;
        if info.channel_pattern == ChannelPattern::PubSub {
            data.set_subscribe(b"")?;
        }
        data.connect(&info.zmq_data_endpoint)?;

        let ctrl = ctx.socket(zmq::DEALER)?;
        keys.apply_client(&ctrl, &info.zmq_pubkey)?;
        ctrl.set_linger(0)?;
        if !info.zmq_ctrl_endpoint.is_empty() {
            ctrl.connect(&info.zmq_ctrl_endpoint)?;
        }

        let shm_consumer = if info.has_shared_memory {
            let consumer = ShmConsumer::attach(name, config.shm_lock_timeout())?;
            if info.shm_size != 0 && info.shm_size != consumer.segment_size() as u64 {
                warn!(
                    channel = name,
                    advertised = info.shm_size,
                    mapped = consumer.segment_size(),
                    "Shared memory size differs from advertisement"
                );
            }
            Some(consumer)
        } else {
            None
        };
        debug!(channel = name, data = %info.zmq_data_endpoint, "Connected consumer sockets");

        Ok(Self {
            name: name.to_string(),
            role: ChannelRole::Consumer,
            info,
            data,
            ctrl,
            shm_producer: None,
            shm_consumer,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn pattern(&self) -> ChannelPattern {
        self.info.channel_pattern
    }

    /// What the producer advertised (or, on the producer, what it sent)
    pub fn info(&self) -> &ProducerInfo {
        &self.info
    }

    pub fn schema_hash(&self) -> Option<SchemaHash> {
        self.info.schema_hash()
    }

    pub fn schema_version(&self) -> u32 {
        self.info.schema_version
    }

    /// Send one message on the data socket
    ///
    /// Blocks on PUSH and PAIR while no peer is connected; PUB drops instead.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.data.send(payload, 0)?;
        Ok(())
    }

    pub fn send_multipart(&self, parts: &[&[u8]]) -> Result<()> {
        self.data.send_multipart(parts.iter().copied(), 0)?;
        Ok(())
    }

    /// Receive one message; `None` on timeout
    ///
    /// `timeout: None` waits indefinitely.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        if !self.wait_readable(timeout)? {
            return Ok(None);
        }
        match self.data.recv_bytes(zmq::DONTWAIT) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn recv_multipart(&self, timeout: Option<Duration>) -> Result<Option<Vec<Vec<u8>>>> {
        if !self.wait_readable(timeout)? {
            return Ok(None);
        }
        match self.data.recv_multipart(zmq::DONTWAIT) {
            Ok(parts) => Ok(Some(parts)),
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn wait_readable(&self, timeout: Option<Duration>) -> Result<bool> {
        let timeout_ms = timeout.map_or(-1, |t| t.as_millis() as i64);
        Ok(self.data.poll(zmq::POLLIN, timeout_ms)? > 0)
    }

    pub fn data_socket(&self) -> &zmq::Socket {
        &self.data
    }

    pub fn ctrl_socket(&self) -> &zmq::Socket {
        &self.ctrl
    }

    /// Shared-memory writer, on producers created with shared memory
    pub fn shm_producer(&mut self) -> Option<&mut ShmProducer> {
        self.shm_producer.as_mut()
    }

    /// Shared-memory reader, on consumers of channels with shared memory
    pub fn shm_consumer(&mut self) -> Option<&mut ShmConsumer> {
        self.shm_consumer.as_mut()
    }
}
