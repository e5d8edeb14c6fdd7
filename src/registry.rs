//! Broker-side channel registry
//!
//! The registry is the authoritative map from channel name to producer
//! metadata, consumers and lifecycle status. It has no interior locking:
//! the broker's run loop owns it and is the only thread that touches it.
//!
//! Time is passed in explicitly so expiry can be tested without sleeping.

use crate::protocol::ProducerInfo;
use crate::schema::SchemaHash;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Lifecycle of a channel
///
/// `Pending -> Ready -> Closing -> removed`, plus `Pending -> Closing` for a
/// producer that goes away before its first heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelStatus {
    Pending,
    Ready,
    Closing,
}

impl ChannelStatus {
    pub fn can_transition_to(self, next: ChannelStatus) -> bool {
        matches!(
            (self, next),
            (ChannelStatus::Pending, ChannelStatus::Ready)
                | (ChannelStatus::Pending, ChannelStatus::Closing)
                | (ChannelStatus::Ready, ChannelStatus::Closing)
        )
    }
}

/// A registered consumer of a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub pid: u64,
    pub hostname: String,
    /// ROUTER identity used to push notifications
    pub routing_id: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ChannelEntry {
    pub name: String,
    pub info: ProducerInfo,
    /// `None` when the producer registered without a decodable hash
    pub schema_hash: Option<SchemaHash>,
    pub producer_routing_id: Vec<u8>,
    pub consumers: Vec<ConsumerRecord>,
    pub status: ChannelStatus,
    pub last_heartbeat: Instant,
}

impl ChannelEntry {
    pub fn new(name: &str, info: ProducerInfo, producer_routing_id: Vec<u8>, now: Instant) -> Self {
        Self {
            name: name.to_string(),
            schema_hash: info.schema_hash(),
            info,
            producer_routing_id,
            consumers: Vec::new(),
            status: ChannelStatus::Pending,
            last_heartbeat: now,
        }
    }

    #[inline]
    pub fn producer_pid(&self) -> u64 {
        self.info.producer_pid
    }

    /// Producer info as handed out on discovery
    pub fn discovery_info(&self) -> ProducerInfo {
        ProducerInfo {
            consumer_count: self.consumers.len() as u32,
            ..self.info.clone()
        }
    }

    fn transition(&mut self, next: ChannelStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, ChannelEntry>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new channel or refresh an existing one
    ///
    /// Re-registration (e.g. after a producer restart) is accepted only
    /// with the same schema hash; it replaces the producer fields and keeps
    /// consumers and status. Returns `false` on a schema mismatch, leaving
    /// the existing entry untouched.
    pub fn register_channel(&mut self, name: &str, entry: ChannelEntry) -> bool {
        match self.channels.get_mut(name) {
            Some(existing) => {
                if existing.schema_hash != entry.schema_hash {
                    return false;
                }
                existing.info = entry.info;
                existing.producer_routing_id = entry.producer_routing_id;
                true
            }
            None => {
                self.channels.insert(name.to_string(), entry);
                true
            }
        }
    }

    /// Mark a channel closing on behalf of its producer
    ///
    /// Only the recorded producer may do this.
    pub fn deregister_channel(&mut self, name: &str, producer_pid: u64) -> bool {
        match self.channels.get_mut(name) {
            Some(entry) if entry.producer_pid() == producer_pid => {
                entry.transition(ChannelStatus::Closing)
            }
            _ => false,
        }
    }

    pub fn find_channel(&self, name: &str) -> Option<&ChannelEntry> {
        self.channels.get(name)
    }

    /// Refresh the heartbeat; the first one makes the channel ready
    pub fn update_heartbeat(&mut self, name: &str, now: Instant) -> bool {
        let Some(entry) = self.channels.get_mut(name) else {
            return false;
        };
        if entry.status == ChannelStatus::Closing {
            return false;
        }
        entry.last_heartbeat = now;
        if entry.status == ChannelStatus::Pending {
            entry.transition(ChannelStatus::Ready);
        }
        true
    }

    /// Ready channels whose last heartbeat is older than `timeout`
    pub fn find_timed_out_channels(&self, timeout: Duration, now: Instant) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .values()
            .filter(|e| e.status == ChannelStatus::Ready)
            .filter(|e| now.saturating_duration_since(e.last_heartbeat) > timeout)
            .map(|e| e.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Pending channels registered longer than `timeout` ago without ever
    /// heartbeating
    pub fn find_abandoned_pending(&self, timeout: Duration, now: Instant) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .values()
            .filter(|e| e.status == ChannelStatus::Pending)
            .filter(|e| now.saturating_duration_since(e.last_heartbeat) > timeout)
            .map(|e| e.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn mark_closing(&mut self, name: &str) -> bool {
        self.channels
            .get_mut(name)
            .is_some_and(|e| e.transition(ChannelStatus::Closing))
    }

    /// Remove an entry for good
    pub fn remove_channel(&mut self, name: &str) -> Option<ChannelEntry> {
        self.channels.remove(name)
    }

    /// Add a consumer, replacing an earlier record of the same pid
    ///
    /// Returns the consumer count, or `None` for an unknown channel.
    pub fn register_consumer(&mut self, name: &str, consumer: ConsumerRecord) -> Option<usize> {
        let entry = self.channels.get_mut(name)?;
        match entry.consumers.iter_mut().find(|c| c.pid == consumer.pid) {
            Some(existing) => *existing = consumer,
            None => entry.consumers.push(consumer),
        }
        Some(entry.consumers.len())
    }

    pub fn deregister_consumer(&mut self, name: &str, consumer_pid: u64) -> bool {
        let Some(entry) = self.channels.get_mut(name) else {
            return false;
        };
        let before = entry.consumers.len();
        entry.consumers.retain(|c| c.pid != consumer_pid);
        entry.consumers.len() != before
    }

    pub fn consumers(&self, name: &str) -> &[ConsumerRecord] {
        self.channels
            .get(name)
            .map(|e| e.consumers.as_slice())
            .unwrap_or(&[])
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
