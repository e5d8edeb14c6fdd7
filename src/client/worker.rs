//! Client worker thread
//!
//! The only owner of the broker socket. Requests run one at a time so
//! replies pair with requests by ordering; heartbeats for produced
//! channels go out between commands and between discovery retries.

use super::command::{Command, ReplyTx};
use super::CallbackSlot;
use crate::auth::{decode_key, KeyPair};
use crate::config::ClientConfig;
use crate::error::{Result, SwitchyardError};
use crate::process::{current_process_id, current_thread_id, hostname};
use crate::protocol::{
    self, ClosingNotice, ConsumerRequest, DeregisterRequest, DiscoverRequest, DiscoverResponse,
    Envelope, HeartbeatRequest, MessageType, ProducerInfo, RegisterRequest, Reply,
};
use crate::schema::{schema_accepts, SchemaHash};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Ack wait for fire-and-forget registrations
const REGISTER_ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct Worker {
    ctx: zmq::Context,
    config: ClientConfig,
    commands: flume::Receiver<Command>,
    socket: Option<zmq::Socket>,
    endpoint: String,
    /// Produced channels and the pid heartbeats carry
    heartbeats: HashMap<String, u64>,
    next_heartbeat: Instant,
    pending_notices: Vec<ClosingNotice>,
    on_closing: CallbackSlot,
    pid: u64,
    hostname: String,
}

impl Worker {
    pub(crate) fn new(
        ctx: zmq::Context,
        config: ClientConfig,
        commands: flume::Receiver<Command>,
        on_closing: CallbackSlot,
    ) -> Self {
        Self {
            ctx,
            config,
            commands,
            socket: None,
            endpoint: String::new(),
            heartbeats: HashMap::new(),
            next_heartbeat: Instant::now(),
            pending_notices: Vec::new(),
            on_closing,
            pid: current_process_id(),
            hostname: hostname(),
        }
    }

    pub(crate) fn run(mut self) {
        info!(tid = current_thread_id(), "Client worker started");

        loop {
            match self.commands.recv_timeout(self.config.tick()) {
                Ok(cmd) => {
                    if !self.handle(cmd) {
                        break;
                    }
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }

            self.poll_notifications();
            self.dispatch_notices();
            self.send_due_heartbeats(Instant::now());
        }

        self.close_socket();
        info!("Client worker stopped");
    }

    /// Returns `false` once the worker should exit
    fn handle(&mut self, cmd: Command) -> bool {
        trace!(command = cmd.name(), "Handling command");
        match cmd {
            Command::Connect {
                endpoint,
                broker_key,
                reply,
            } => respond(reply, self.connect(&endpoint, &broker_key)),
            Command::Disconnect { reply } => {
                self.close_socket();
                respond(reply, Ok(()));
            }
            Command::RegisterProducer { channel, info } => {
                if let Err(e) = self.register(&channel, info, REGISTER_ACK_TIMEOUT) {
                    warn!(channel = %channel, error = %e, "Producer registration failed");
                }
            }
            Command::CreateChannel {
                channel,
                info,
                timeout,
                reply,
            } => respond(reply, self.register(&channel, info, timeout)),
            Command::ConnectChannel {
                channel,
                expected_schema,
                timeout,
                reply,
            } => respond(
                reply,
                self.connect_channel(&channel, expected_schema.as_ref(), timeout),
            ),
            Command::Discover {
                channel,
                timeout,
                reply,
            } => respond(reply, self.discover(&channel, timeout)),
            Command::RegisterConsumer {
                channel,
                timeout,
                reply,
            } => respond(
                reply,
                self.consumer_request(MessageType::ConsumerRegReq, &channel, timeout),
            ),
            Command::DeregisterConsumer {
                channel,
                timeout,
                reply,
            } => respond(
                reply,
                self.consumer_request(MessageType::ConsumerDeregReq, &channel, timeout),
            ),
            Command::DeregisterChannel {
                channel,
                timeout,
                reply,
            } => respond(reply, self.deregister_channel(&channel, timeout)),
            Command::Stop => return false,
        }
        true
    }

    fn connect(&mut self, endpoint: &str, broker_key: &str) -> Result<()> {
        if !endpoint.contains("://") {
            return Err(SwitchyardError::InvalidEndpoint(endpoint.to_string()));
        }
        decode_key(broker_key)?;

        if self.socket.is_some() {
            info!(old = %self.endpoint, new = endpoint, "Replacing broker connection");
            self.close_socket();
        }

        let keys = KeyPair::generate()?;
        let socket = self.ctx.socket(zmq::DEALER)?;
        keys.apply_client(&socket, broker_key)?;
        socket.set_linger(0)?;
        socket.connect(endpoint).map_err(|e| match e {
            zmq::Error::EINVAL | zmq::Error::EPROTONOSUPPORT => {
                SwitchyardError::InvalidEndpoint(endpoint.to_string())
            }
            e => SwitchyardError::Transport(e),
        })?;

        self.socket = Some(socket);
        self.endpoint = endpoint.to_string();
        info!(endpoint, "Connected to broker");
        Ok(())
    }

    fn close_socket(&mut self) {
        if self.socket.take().is_some() {
            info!(endpoint = %self.endpoint, "Disconnected from broker");
        }
        self.heartbeats.clear();
        self.pending_notices.clear();
    }

    fn register(&mut self, channel: &str, info: ProducerInfo, timeout: Duration) -> Result<()> {
        let pid = info.producer_pid;
        let req = RegisterRequest {
            channel_name: channel.to_string(),
            info,
        };
        let reply: Reply = self
            .round_trip(MessageType::RegReq, &req, channel, timeout)?
            .parse_body()?;
        reply.into_result()?;

        // First heartbeat right away so the channel turns ready
        self.send_heartbeat(channel, pid)?;
        self.heartbeats.insert(channel.to_string(), pid);
        info!(channel, producer_pid = pid, "Producer registered");
        Ok(())
    }

    fn connect_channel(
        &mut self,
        channel: &str,
        expected: Option<&SchemaHash>,
        timeout: Duration,
    ) -> Result<ProducerInfo> {
        let deadline = Instant::now() + timeout;
        let info = self.discover(channel, timeout)?;

        let advertised = info.schema_hash();
        if !schema_accepts(expected, advertised.as_ref()) {
            warn!(channel, ?expected, ?advertised, "Schema mismatch");
            return Err(SwitchyardError::SchemaMismatch {
                channel: channel.to_string(),
            });
        }

        let remaining = time_left(deadline, timeout)?;
        self.consumer_request(MessageType::ConsumerRegReq, channel, remaining)?;
        Ok(info)
    }

    /// Discover a producer, retrying while the channel is not ready
    fn discover(&mut self, channel: &str, timeout: Duration) -> Result<ProducerInfo> {
        let deadline = Instant::now() + timeout;
        let req = DiscoverRequest {
            channel_name: channel.to_string(),
        };
        let mut last_error = SwitchyardError::Timeout(timeout);

        loop {
            let attempt_start = Instant::now();
            let remaining = deadline.saturating_duration_since(attempt_start);
            if remaining.is_zero() {
                return Err(last_error);
            }
            let slice = remaining.min(self.config.discovery_retry());

            match self.round_trip(MessageType::DiscReq, &req, channel, slice) {
                Ok(env) => {
                    let resp: DiscoverResponse = env.parse_body()?;
                    match resp.reply.into_result() {
                        Ok(()) => {
                            debug!(channel, endpoint = %resp.info.zmq_data_endpoint, "Discovered producer");
                            return Ok(resp.info);
                        }
                        Err(e @ SwitchyardError::ChannelNotReady(_)) => {
                            trace!(channel, "Channel not ready, retrying");
                            last_error = e;
                            let wake = (attempt_start + slice).min(deadline);
                            thread::sleep(wake.saturating_duration_since(Instant::now()));
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(SwitchyardError::Timeout(_)) => {
                    last_error = SwitchyardError::Timeout(timeout);
                }
                Err(e) => return Err(e),
            }

            self.send_due_heartbeats(Instant::now());
        }
    }

    fn consumer_request(
        &mut self,
        msg_type: MessageType,
        channel: &str,
        timeout: Duration,
    ) -> Result<()> {
        let req = ConsumerRequest {
            channel_name: channel.to_string(),
            consumer_pid: self.pid,
            consumer_hostname: self.hostname.clone(),
        };
        let reply: Reply = self
            .round_trip(msg_type, &req, channel, timeout)?
            .parse_body()?;
        reply.into_result()
    }

    fn deregister_channel(&mut self, channel: &str, timeout: Duration) -> Result<()> {
        let producer_pid = self.heartbeats.get(channel).copied().unwrap_or(self.pid);
        let req = DeregisterRequest {
            channel_name: channel.to_string(),
            producer_pid,
        };
        let reply: Reply = self
            .round_trip(MessageType::DeregReq, &req, channel, timeout)?
            .parse_body()?;

        let result = reply.into_result();
        if matches!(result, Ok(()) | Err(SwitchyardError::ChannelNotFound(_))) {
            self.heartbeats.remove(channel);
        }
        result
    }

    /// Send one request and wait for its reply
    ///
    /// Closing notices seen meanwhile are buffered. Replies that do not
    /// match the expected type and channel are late answers to an earlier
    /// timed-out request and are dropped.
    fn round_trip<T: Serialize>(
        &mut self,
        msg_type: MessageType,
        body: &T,
        channel: &str,
        timeout: Duration,
    ) -> Result<Envelope> {
        let expected = msg_type
            .reply()
            .ok_or_else(|| SwitchyardError::Protocol(format!("{} has no reply", msg_type)))?;
        let Some(socket) = self.socket.as_ref() else {
            return Err(SwitchyardError::NotConnected);
        };

        socket.send_multipart(protocol::encode(msg_type, body)?, zmq::DONTWAIT)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(channel, %msg_type, "Request timed out");
                return Err(SwitchyardError::Timeout(timeout));
            }
            if socket.poll(zmq::POLLIN, remaining.as_millis().max(1) as i64)? == 0 {
                continue;
            }

            let frames = match socket.recv_multipart(zmq::DONTWAIT) {
                Ok(frames) => frames,
                Err(zmq::Error::EAGAIN) => continue,
                Err(e) => return Err(e.into()),
            };
            let env = protocol::decode(frames).map_err(|e| {
                warn!(channel, %msg_type, error = %e, "Malformed reply");
                e
            })?;

            if env.msg_type == MessageType::ChannelClosingNotify {
                buffer_notice(&mut self.pending_notices, &env);
                continue;
            }
            if env.msg_type != expected || env.channel_name().as_deref() != Some(channel) {
                debug!(msg_type = %env.msg_type, channel = ?env.channel_name(), "Discarding stale reply");
                continue;
            }
            return Ok(env);
        }
    }

    fn poll_notifications(&mut self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        loop {
            match socket.recv_multipart(zmq::DONTWAIT) {
                Ok(frames) => match protocol::decode(frames) {
                    Ok(env) if env.msg_type == MessageType::ChannelClosingNotify => {
                        buffer_notice(&mut self.pending_notices, &env);
                    }
                    Ok(env) => debug!(msg_type = %env.msg_type, "Discarding unsolicited message"),
                    Err(e) => warn!(error = %e, "Dropping malformed message"),
                },
                Err(zmq::Error::EAGAIN) => break,
                Err(e) => {
                    warn!(error = %e, "Broker receive failed");
                    break;
                }
            }
        }
    }

    fn dispatch_notices(&mut self) {
        if self.pending_notices.is_empty() {
            return;
        }
        let callback = self.on_closing.read().clone();

        for notice in std::mem::take(&mut self.pending_notices) {
            info!(channel = %notice.channel_name, reason = ?notice.reason, "Channel closing");
            if self.heartbeats.remove(&notice.channel_name).is_some() {
                debug!(channel = %notice.channel_name, "Stopped heartbeats");
            }
            if let Some(callback) = &callback {
                if panic::catch_unwind(AssertUnwindSafe(|| callback(&notice))).is_err() {
                    error!(channel = %notice.channel_name, "Channel closing callback panicked");
                }
            }
        }
    }

    fn send_due_heartbeats(&mut self, now: Instant) {
        if now < self.next_heartbeat {
            return;
        }
        self.next_heartbeat = now + self.config.heartbeat_interval();

        for (channel, pid) in &self.heartbeats {
            if let Err(e) = self.send_heartbeat(channel, *pid) {
                warn!(channel = %channel, error = %e, "Heartbeat failed");
            }
        }
    }

    fn send_heartbeat(&self, channel: &str, producer_pid: u64) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(SwitchyardError::NotConnected)?;
        let req = HeartbeatRequest {
            channel_name: channel.to_string(),
            producer_pid,
        };
        socket.send_multipart(protocol::encode(MessageType::HeartbeatReq, &req)?, zmq::DONTWAIT)?;
        trace!(channel, "Heartbeat sent");
        Ok(())
    }
}

/// Time until `deadline`, or a timeout error once it has passed
fn time_left(deadline: Instant, timeout: Duration) -> Result<Duration> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(SwitchyardError::Timeout(timeout));
    }
    Ok(remaining)
}

fn buffer_notice(pending: &mut Vec<ClosingNotice>, env: &Envelope) {
    match env.parse_body::<ClosingNotice>() {
        Ok(notice) => pending.push(notice),
        Err(e) => warn!(error = %e, "Malformed closing notice"),
    }
}

fn respond<T>(reply: ReplyTx<T>, result: Result<T>) {
    if reply.send(result).is_err() {
        debug!("Caller went away before the reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_left_never_extends_the_deadline() {
        let timeout = Duration::from_millis(200);
        let left = time_left(Instant::now() + timeout, timeout).unwrap();
        assert!(left <= timeout);

        let spent = Instant::now() - Duration::from_millis(1);
        assert!(matches!(
            time_left(spent, timeout),
            Err(SwitchyardError::Timeout(t)) if t == timeout
        ));
    }
}
