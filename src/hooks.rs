//! The seam between a connection and the enclosing network manager.
//!
//! The connection never owns a reference back to the manager; instead the
//! manager hands it a [`NetworkHooks`] capability at construction. All
//! hook invocations happen on the connection's actor task, one activation
//! at a time, so implementations need no internal locking but must never
//! block.

use crate::{
    channel::ConnectionStatus,
    message::{InstanceId, MessageDesc},
    queue_kind::MessageQueueType,
};

/// Callbacks and queries a connection needs from its network manager.
pub trait NetworkHooks: Send + 'static {
    /// A data message arrived from `peer` and should be dispatched.
    fn on_data_message(&mut self, peer: InstanceId, msg: MessageDesc);

    /// A channel's available send space crossed zero in either direction.
    /// The manager publishes the change upstream as local backpressure.
    fn on_status(&mut self, status: ConnectionStatus);

    /// A queued message was dropped at teardown before reaching the wire.
    /// Called once per dropped message; safe to invoke during disconnect.
    fn on_message_abort(&mut self, msg: MessageDesc) {
        let _ = msg;
    }

    /// Receive capacity to advertise to the peer for `mqt` in the next
    /// control frame, in messages. Values below one are raised to one.
    fn advertised_capacity(&self, mqt: MessageQueueType) -> u64;
}
