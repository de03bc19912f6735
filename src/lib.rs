//! Per-peer connection subsystem for a distributed array-database cluster.
//!
//! This crate provides the component that owns one bidirectional,
//! message-oriented transport to a single remote party and enforces
//! per-channel ordered delivery with cooperative, credit-based flow
//! control. Outbound traffic is partitioned by [`MessageQueueType`] into
//! independent FIFO channels drained round robin; peers exchange credit
//! and generation state in control frames so either side can detect a
//! restarted peer without durable storage.
//!
//! The enclosing network manager attaches through the [`NetworkHooks`]
//! seam and talks to a running connection through its
//! [`ConnectionHandle`].

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod hooks;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod queue_kind;

pub use channel::ConnectionStatus;
pub use config::NetConfig;
pub use connection::{Connection, ConnectionHandle, ConnectionState, DisconnectHandler};
pub use control::{ControlEntry, ControlRecord};
pub use error::{MalformedMessage, NetError, ProtocolViolation};
pub use hooks::NetworkHooks;
pub use message::{InstanceId, MessageDesc, MessageHeader, MessageId, QueryId};
pub use queue::MultiChannelQueue;
pub use queue_kind::MessageQueueType;
