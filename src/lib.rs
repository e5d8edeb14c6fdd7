//! Switchyard - brokered discovery for ZeroMQ and shared-memory channels
//!
//! Producers register named channels with a central broker and keep them
//! alive with heartbeats. Consumers discover a producer by channel name,
//! check its schema hash and connect straight to its data plane. All
//! broker and data-plane traffic is CURVE-authenticated.
//!
//! # Architecture
//!
//! - **Broker**: single-threaded ROUTER service owning the channel registry
//! - **Client**: facade over a worker thread that owns the broker socket
//! - **Shared memory**: optional same-host fast path, one frame per channel
//!   guarded by a process-shared mutex and condition variable
//!
//! # Channel lifecycle
//!
//! A registered channel is `Pending` until its first heartbeat, `Ready`
//! while heartbeats arrive, and `Closing` once it times out or its producer
//! deregisters. Consumers are notified and the entry is removed.

pub mod auth;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod shm;
pub mod shm_channel;
pub mod spinlock;

pub use auth::KeyPair;
pub use broker::{Broker, BrokerHandle};
pub use client::{ChannelHandle, ChannelRole, Client, ClosingCallback};
pub use config::{BrokerConfig, ClientConfig};
pub use error::{Result, SwitchyardError};
pub use protocol::{ChannelPattern, CloseReason, ClosingNotice, ProducerInfo};
pub use schema::SchemaHash;
pub use shm_channel::{Frame, FrameInfo, ShmConsumer, ShmProducer};
