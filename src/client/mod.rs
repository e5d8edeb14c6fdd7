//! Client protocol engine
//!
//! [`Client`] is a thin facade: every broker interaction is queued to a
//! single worker thread that owns the broker socket, and the caller
//! blocks on a one-shot reply. Data-plane sockets are created on the
//! calling thread and handed back as a [`ChannelHandle`].
//!
//! # Example
//!
//! ```no_run
//! use switchyard::{ChannelPattern, Client, ClientConfig};
//! use std::time::Duration;
//!
//! # fn main() -> switchyard::Result<()> {
//! let client = Client::new(ClientConfig::default())?;
//! client.connect("tcp://127.0.0.1:5550", "<broker public key>")?;
//! let channel = client.create_channel("camera", ChannelPattern::PubSub, false, None, 1, Duration::from_secs(2))?;
//! channel.send(b"frame")?;
//! # Ok(())
//! # }
//! ```

mod command;
mod handle;
mod worker;

pub use handle::{ChannelHandle, ChannelRole};

use crate::config::ClientConfig;
use crate::error::{Result, SwitchyardError};
use crate::protocol::{ChannelPattern, ClosingNotice, ProducerInfo};
use crate::schema::SchemaHash;
use crate::shm::validate_channel_name;
use command::{Command, ReplyTx};
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};
use worker::Worker;

/// Called on the worker thread for each `CHANNEL_CLOSING_NOTIFY`
pub type ClosingCallback = Arc<dyn Fn(&ClosingNotice) + Send + Sync>;

pub(crate) type CallbackSlot = Arc<RwLock<Option<ClosingCallback>>>;

pub struct Client {
    ctx: zmq::Context,
    config: ClientConfig,
    commands: flume::Sender<Command>,
    on_closing: CallbackSlot,
    worker: Option<JoinHandle<()>>,
}

impl Client {
    /// Start a client and its worker thread
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_context(zmq::Context::new(), config)
    }

    /// Start a client sharing an existing ZeroMQ context
    pub fn with_context(ctx: zmq::Context, config: ClientConfig) -> Result<Self> {
        let (tx, rx) = flume::unbounded();
        let on_closing: CallbackSlot = Arc::new(RwLock::new(None));

        let worker = Worker::new(ctx.clone(), config.clone(), rx, Arc::clone(&on_closing));
        let handle = thread::Builder::new()
            .name("switchyard-client".into())
            .spawn(move || worker.run())
            .map_err(|e| SwitchyardError::Protocol(format!("failed to spawn client worker: {}", e)))?;

        Ok(Self {
            ctx,
            config,
            commands: tx,
            on_closing,
            worker: Some(handle),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Queue a command and wait for the worker's answer
    fn request<T>(&self, make: impl FnOnce(ReplyTx<T>) -> Command) -> Result<T> {
        let (tx, rx) = flume::bounded(1);
        self.commands
            .send(make(tx))
            .map_err(|_| SwitchyardError::WorkerStopped)?;
        rx.recv().map_err(|_| SwitchyardError::WorkerStopped)?
    }

    /// Connect to a broker
    ///
    /// `broker_key` is the broker's Z85 public key. Replaces any existing
    /// connection, which also forgets the channels produced over it.
    pub fn connect(&self, endpoint: &str, broker_key: &str) -> Result<()> {
        self.request(|reply| Command::Connect {
            endpoint: endpoint.to_string(),
            broker_key: broker_key.to_string(),
            reply,
        })
    }

    /// Drop the broker connection; a no-op when not connected
    pub fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply })
    }

    /// Register a producer without waiting for the broker's answer
    ///
    /// Heartbeats start once the broker acknowledges. Failures are only
    /// logged; use [`Client::create_channel`] to observe them.
    pub fn register_producer(&self, channel: &str, info: ProducerInfo) -> Result<()> {
        validate_channel_name(channel)?;
        self.commands
            .send(Command::RegisterProducer {
                channel: channel.to_string(),
                info,
            })
            .map_err(|_| SwitchyardError::WorkerStopped)
    }

    /// Create and register a channel this process produces
    ///
    /// Binds the data-plane sockets (and the shared-memory segment when
    /// `has_shared_memory`) before registering. On any failure nothing is
    /// left bound or registered.
    pub fn create_channel(
        &self,
        name: &str,
        pattern: ChannelPattern,
        has_shared_memory: bool,
        schema_hash: Option<&SchemaHash>,
        schema_version: u32,
        timeout: Duration,
    ) -> Result<ChannelHandle> {
        validate_channel_name(name)?;
        let handle = ChannelHandle::bind_producer(
            &self.ctx,
            &self.config,
            name,
            pattern,
            has_shared_memory,
            schema_hash,
            schema_version,
        )?;

        self.request(|reply| Command::CreateChannel {
            channel: name.to_string(),
            info: handle.info().clone(),
            timeout,
            reply,
        })?;
        Ok(handle)
    }

    /// Discover `name`, check its schema, register as a consumer and
    /// connect to its data plane
    ///
    /// With `expected_schema: None` any advertised schema is accepted.
    pub fn connect_channel(
        &self,
        name: &str,
        timeout: Duration,
        expected_schema: Option<&SchemaHash>,
    ) -> Result<ChannelHandle> {
        validate_channel_name(name)?;
        let info = self.request(|reply| Command::ConnectChannel {
            channel: name.to_string(),
            expected_schema: expected_schema.copied(),
            timeout,
            reply,
        })?;

        match ChannelHandle::connect_consumer(&self.ctx, &self.config, name, info) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!(channel = name, error = %e, "Data plane connect failed, deregistering");
                if let Err(dereg) = self.deregister_consumer(name, timeout) {
                    debug!(channel = name, error = %dereg, "Consumer deregistration failed");
                }
                Err(e)
            }
        }
    }

    /// Look up a producer, retrying while the channel is not ready
    pub fn discover_producer(&self, channel: &str, timeout: Duration) -> Result<ProducerInfo> {
        self.request(|reply| Command::Discover {
            channel: channel.to_string(),
            timeout,
            reply,
        })
    }

    pub fn register_consumer(&self, channel: &str, timeout: Duration) -> Result<()> {
        self.request(|reply| Command::RegisterConsumer {
            channel: channel.to_string(),
            timeout,
            reply,
        })
    }

    pub fn deregister_consumer(&self, channel: &str, timeout: Duration) -> Result<()> {
        self.request(|reply| Command::DeregisterConsumer {
            channel: channel.to_string(),
            timeout,
            reply,
        })
    }

    /// Close a channel this process produces
    ///
    /// Heartbeats stop and the broker notifies its consumers.
    pub fn deregister_channel(&self, channel: &str, timeout: Duration) -> Result<()> {
        self.request(|reply| Command::DeregisterChannel {
            channel: channel.to_string(),
            timeout,
            reply,
        })
    }

    /// Install the callback for channel-closing notices, replacing any
    /// previous one
    ///
    /// The callback runs on the worker thread and must not call back into
    /// this client.
    pub fn on_channel_closing<F>(&self, callback: F)
    where
        F: Fn(&ClosingNotice) + Send + Sync + 'static,
    {
        *self.on_closing.write() = Some(Arc::new(callback));
    }

    /// Stop the worker thread; idempotent
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        // The worker may already be gone
        let _ = self.commands.send(Command::Stop);
        if worker.join().is_err() {
            warn!("Client worker panicked");
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}
