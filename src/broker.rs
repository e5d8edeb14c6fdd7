//! Rendezvous broker
//!
//! A single thread owns the CURVE-server ROUTER socket and the
//! [`ChannelRegistry`]. Requests are handled one at a time in arrival
//! order; every tick the broker also expires channels whose producer
//! stopped heartbeating and tells their consumers.

use crate::auth::KeyPair;
use crate::config::BrokerConfig;
use crate::error::{Result, SwitchyardError};
use crate::protocol::{
    self, ClosingNotice, CloseReason, ConsumerRequest, DeregisterRequest, DiscoverRequest,
    DiscoverResponse, Envelope, ErrorCode, HeartbeatRequest, MessageType, RegisterRequest, Reply,
};
use crate::registry::{ChannelEntry, ChannelRegistry, ChannelStatus, ConsumerRecord};
use crate::shm::validate_channel_name;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub struct Broker {
    socket: zmq::Socket,
    registry: ChannelRegistry,
    keys: KeyPair,
    endpoint: String,
    config: BrokerConfig,
}

impl Broker {
    /// Bind the broker socket
    ///
    /// Generates a key pair when the config does not carry one.
    pub fn bind(config: BrokerConfig) -> Result<Self> {
        Self::bind_with_context(zmq::Context::new(), config)
    }

    pub fn bind_with_context(ctx: zmq::Context, config: BrokerConfig) -> Result<Self> {
        let keys = if config.public_key.is_empty() || config.secret_key.is_empty() {
            let keys = KeyPair::generate()?;
            info!(public_key = %keys.public_key, "Generated broker key pair");
            keys
        } else {
            KeyPair::from_z85(&config.public_key, &config.secret_key)?
        };

        let socket = ctx.socket(zmq::ROUTER)?;
        keys.apply_server(&socket)?;
        socket.set_linger(0)?;
        socket
            .bind(&config.endpoint)
            .map_err(|e| {
                error!(endpoint = %config.endpoint, error = %e, "Failed to bind broker socket");
                SwitchyardError::Transport(e)
            })?;
        let endpoint = last_endpoint(&socket)?;

        info!(endpoint = %endpoint, "Broker listening");
        Ok(Self {
            socket,
            registry: ChannelRegistry::new(),
            keys,
            endpoint,
            config,
        })
    }

    /// Endpoint actually bound (wildcard ports resolved)
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Z85 public key clients need to connect
    pub fn public_key(&self) -> &str {
        &self.keys.public_key
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Serve until `stop` is set
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        let tick = self.config.tick();
        let poll_ms = tick.as_millis().max(1) as i64;
        let mut next_sweep = Instant::now() + tick;

        while !stop.load(Ordering::Acquire) {
            match self.socket.poll(zmq::POLLIN, poll_ms) {
                Ok(n) if n > 0 => self.drain_requests(),
                Ok(_) => {}
                Err(zmq::Error::EINTR) => {}
                Err(e) => {
                    error!(error = %e, "Broker poll failed");
                    return Err(e.into());
                }
            }

            let now = Instant::now();
            if now >= next_sweep {
                self.expire_channels(now);
                next_sweep = now + tick;
            }
        }

        info!(channels = self.registry.len(), "Broker stopped");
        Ok(())
    }

    /// Run on a dedicated thread
    pub fn spawn(config: BrokerConfig) -> Result<BrokerHandle> {
        let mut broker = Self::bind(config)?;
        let endpoint = broker.endpoint.clone();
        let public_key = broker.keys.public_key.clone();
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("switchyard-broker".into())
                .spawn(move || broker.run(&stop))
                .map_err(|e| SwitchyardError::Protocol(format!("failed to spawn broker: {}", e)))?
        };

        Ok(BrokerHandle {
            endpoint,
            public_key,
            stop,
            thread: Some(thread),
        })
    }

    fn drain_requests(&mut self) {
        loop {
            match self.socket.recv_multipart(zmq::DONTWAIT) {
                Ok(frames) => self.handle_frames(frames),
                Err(zmq::Error::EAGAIN) => break,
                Err(e) => {
                    warn!(error = %e, "Broker receive failed");
                    break;
                }
            }
        }
    }

    fn handle_frames(&mut self, mut frames: Vec<Vec<u8>>) {
        if frames.is_empty() {
            return;
        }
        let routing_id = frames.remove(0);

        let env = match protocol::decode(frames) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "Dropping malformed message");
                return;
            }
        };

        let now = Instant::now();
        let result = match env.msg_type {
            MessageType::RegReq => self.on_register(&routing_id, &env, now),
            MessageType::DiscReq => self.on_discover(&routing_id, &env),
            MessageType::HeartbeatReq => self.on_heartbeat(&env, now),
            MessageType::ConsumerRegReq => self.on_consumer_register(&routing_id, &env),
            MessageType::ConsumerDeregReq => self.on_consumer_deregister(&routing_id, &env),
            MessageType::DeregReq => self.on_deregister(&routing_id, &env),
            other => {
                warn!(msg_type = %other, "Unexpected message type from client");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(msg_type = %env.msg_type, error = %e, "Failed to handle request");
        }
    }

    fn send<T: Serialize>(&self, routing_id: &[u8], msg_type: MessageType, body: &T) -> Result<()> {
        let mut frames = protocol::encode(msg_type, body)?;
        frames.insert(0, routing_id.to_vec());
        self.socket.send_multipart(frames, zmq::DONTWAIT)?;
        Ok(())
    }

    /// Parse a request body, answering `INVALID_REQUEST` when it is unusable
    fn parse_or_reject<T: serde::de::DeserializeOwned>(
        &self,
        routing_id: &[u8],
        env: &Envelope,
    ) -> Result<Option<T>> {
        match env.parse_body::<T>() {
            Ok(body) => Ok(Some(body)),
            Err(e) => {
                let channel = env.channel_name().unwrap_or_default();
                warn!(msg_type = %env.msg_type, channel = %channel, error = %e, "Rejecting malformed request");
                if let Some(reply_type) = env.msg_type.reply() {
                    self.send(
                        routing_id,
                        reply_type,
                        &Reply::error(&channel, ErrorCode::InvalidRequest, e.to_string()),
                    )?;
                }
                Ok(None)
            }
        }
    }

    fn on_register(&mut self, routing_id: &[u8], env: &Envelope, now: Instant) -> Result<()> {
        let Some(req) = self.parse_or_reject::<RegisterRequest>(routing_id, env)? else {
            return Ok(());
        };
        let name = req.channel_name.clone();

        if let Err(e) = validate_channel_name(&name) {
            let reply = Reply::error(&name, ErrorCode::InvalidRequest, e.to_string());
            return self.send(routing_id, MessageType::RegAck, &reply);
        }

        let pid = req.info.producer_pid;
        let pattern = req.info.channel_pattern;
        let entry = ChannelEntry::new(&name, req.info, routing_id.to_vec(), now);
        let reply = if self.registry.register_channel(&name, entry) {
            info!(channel = %name, producer_pid = pid, ?pattern, "Channel registered");
            Reply::success(&name)
        } else {
            warn!(channel = %name, producer_pid = pid, "Registration rejected: schema mismatch");
            Reply::error(
                &name,
                ErrorCode::SchemaMismatch,
                "channel already registered with a different schema",
            )
        };
        self.send(routing_id, MessageType::RegAck, &reply)
    }

    fn on_discover(&mut self, routing_id: &[u8], env: &Envelope) -> Result<()> {
        let Some(req) = self.parse_or_reject::<DiscoverRequest>(routing_id, env)? else {
            return Ok(());
        };
        let name = req.channel_name;

        let resp = match self.registry.find_channel(&name) {
            Some(entry) if entry.status == ChannelStatus::Ready => {
                DiscoverResponse::found(&name, entry.discovery_info())
            }
            Some(entry) if entry.status == ChannelStatus::Pending => {
                DiscoverResponse::error(&name, ErrorCode::ChannelNotReady, "waiting for first heartbeat")
            }
            _ => DiscoverResponse::error(&name, ErrorCode::ChannelNotFound, "no such channel"),
        };
        debug!(channel = %name, status = ?resp.reply.status, code = ?resp.reply.error_code, "Discovery");
        self.send(routing_id, MessageType::DiscResp, &resp)
    }

    fn on_heartbeat(&mut self, env: &Envelope, now: Instant) -> Result<()> {
        let req: HeartbeatRequest = env.parse_body()?;

        let owner = self
            .registry
            .find_channel(&req.channel_name)
            .map(|e| (e.producer_pid(), e.status));

        match owner {
            Some((pid, status)) if pid == req.producer_pid => {
                self.registry.update_heartbeat(&req.channel_name, now);
                if status == ChannelStatus::Pending {
                    info!(channel = %req.channel_name, "Channel ready");
                }
            }
            Some((owner_pid, _)) => {
                debug!(
                    channel = %req.channel_name,
                    producer_pid = req.producer_pid,
                    owner_pid,
                    "Ignoring heartbeat from non-owner"
                );
            }
            None => debug!(channel = %req.channel_name, "Heartbeat for unknown channel"),
        }
        Ok(())
    }

    fn on_consumer_register(&mut self, routing_id: &[u8], env: &Envelope) -> Result<()> {
        let Some(req) = self.parse_or_reject::<ConsumerRequest>(routing_id, env)? else {
            return Ok(());
        };
        let name = req.channel_name;

        let reply = match self.registry.find_channel(&name).map(|e| e.status) {
            Some(ChannelStatus::Ready) => {
                let record = ConsumerRecord {
                    pid: req.consumer_pid,
                    hostname: req.consumer_hostname,
                    routing_id: routing_id.to_vec(),
                };
                let count = self.registry.register_consumer(&name, record).unwrap_or(0);
                info!(channel = %name, consumer_pid = req.consumer_pid, consumers = count, "Consumer registered");
                Reply::success(&name)
            }
            Some(ChannelStatus::Pending) => {
                Reply::error(&name, ErrorCode::ChannelNotReady, "waiting for first heartbeat")
            }
            _ => Reply::error(&name, ErrorCode::ChannelNotFound, "no such channel"),
        };
        self.send(routing_id, MessageType::ConsumerRegAck, &reply)
    }

    fn on_consumer_deregister(&mut self, routing_id: &[u8], env: &Envelope) -> Result<()> {
        let Some(req) = self.parse_or_reject::<ConsumerRequest>(routing_id, env)? else {
            return Ok(());
        };
        let name = req.channel_name;

        let reply = if self.registry.deregister_consumer(&name, req.consumer_pid) {
            info!(channel = %name, consumer_pid = req.consumer_pid, "Consumer deregistered");
            Reply::success(&name)
        } else {
            Reply::error(&name, ErrorCode::ChannelNotFound, "consumer not registered")
        };
        self.send(routing_id, MessageType::ConsumerDeregAck, &reply)
    }

    fn on_deregister(&mut self, routing_id: &[u8], env: &Envelope) -> Result<()> {
        let Some(req) = self.parse_or_reject::<DeregisterRequest>(routing_id, env)? else {
            return Ok(());
        };
        let name = req.channel_name;

        if self.registry.deregister_channel(&name, req.producer_pid) {
            self.send(routing_id, MessageType::DeregAck, &Reply::success(&name))?;
            self.close_channel(&name, CloseReason::Deregistered, false);
            return Ok(());
        }

        let reply = if self.registry.find_channel(&name).is_some() {
            warn!(channel = %name, producer_pid = req.producer_pid, "Deregistration by non-owner");
            Reply::error(&name, ErrorCode::NotOwner, "channel belongs to another producer")
        } else {
            Reply::error(&name, ErrorCode::ChannelNotFound, "no such channel")
        };
        self.send(routing_id, MessageType::DeregAck, &reply)
    }

    fn expire_channels(&mut self, now: Instant) {
        let timeout = self.config.heartbeat_timeout();
        for name in self.registry.find_timed_out_channels(timeout, now) {
            warn!(channel = %name, timeout_ms = self.config.heartbeat_timeout_ms, "Channel heartbeat expired");
            self.registry.mark_closing(&name);
            self.close_channel(&name, CloseReason::HeartbeatTimeout, true);
        }

        let pending_timeout = self.config.pending_timeout();
        for name in self.registry.find_abandoned_pending(pending_timeout, now) {
            warn!(channel = %name, timeout_ms = self.config.pending_timeout_ms, "Channel never became ready");
            self.registry.mark_closing(&name);
            self.close_channel(&name, CloseReason::HeartbeatTimeout, true);
        }
    }

    /// Notify everyone attached to a closing channel, then forget it
    fn close_channel(&mut self, name: &str, reason: CloseReason, notify_producer: bool) {
        let Some(entry) = self.registry.remove_channel(name) else {
            return;
        };

        let notice = ClosingNotice {
            channel_name: name.to_string(),
            reason,
        };
        let producer = notify_producer.then_some(entry.producer_routing_id.as_slice());
        let targets = entry
            .consumers
            .iter()
            .map(|c| c.routing_id.as_slice())
            .chain(producer);

        for routing_id in targets {
            if let Err(e) = self.send(routing_id, MessageType::ChannelClosingNotify, &notice) {
                warn!(channel = %name, error = %e, "Failed to send closing notice");
            }
        }
        info!(channel = %name, ?reason, consumers = entry.consumers.len(), "Channel closed");
    }
}

/// A broker running on its own thread
///
/// Dropping the handle stops the broker and joins the thread.
pub struct BrokerHandle {
    endpoint: String,
    public_key: String,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl BrokerHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Stop the broker and return how its run loop ended
    pub fn shutdown(mut self) -> Result<()> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| SwitchyardError::Protocol("broker thread panicked".into()))?,
            None => Ok(()),
        }
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        let _ = self.stop_and_join();
    }
}

pub(crate) fn last_endpoint(socket: &zmq::Socket) -> Result<String> {
    socket
        .get_last_endpoint()?
        .map_err(|raw| SwitchyardError::InvalidEndpoint(String::from_utf8_lossy(&raw).into_owned()))
}
