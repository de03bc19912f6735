//! Metric helpers for `gridlink`.
//!
//! Thin wrappers over the [`metrics`](https://docs.rs/metrics) crate. All
//! functions become no-ops when the optional `metrics` Cargo feature is
//! disabled, so callers never need their own conditional compilation.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking live connections.
pub const CONNECTIONS_ACTIVE: &str = "gridlink_connections_active";
/// Name of the counter tracking messages handed to the transport.
pub const MESSAGES_SENT: &str = "gridlink_messages_sent_total";
/// Name of the counter tracking messages dropped at teardown.
pub const MESSAGES_ABORTED: &str = "gridlink_messages_aborted_total";
/// Name of the counter tracking flow-control frames by direction.
pub const CONTROL_FRAMES: &str = "gridlink_control_frames_total";

/// Direction of a flow-control frame.
#[derive(Clone, Copy)]
pub enum Direction {
    /// Received from the peer.
    Inbound,
    /// Sent to the peer.
    Outbound,
}

impl Direction {
    #[cfg(feature = "metrics")]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the live-connection gauge.
#[cfg(feature = "metrics")]
pub fn inc_connections() { gauge!(CONNECTIONS_ACTIVE).increment(1.0); }

#[cfg(not(feature = "metrics"))]
pub fn inc_connections() {}

/// Decrement the live-connection gauge.
#[cfg(feature = "metrics")]
pub fn dec_connections() { gauge!(CONNECTIONS_ACTIVE).decrement(1.0); }

#[cfg(not(feature = "metrics"))]
pub fn dec_connections() {}

/// Record a message handed to the transport.
#[cfg(feature = "metrics")]
pub fn inc_messages_sent() { counter!(MESSAGES_SENT).increment(1); }

#[cfg(not(feature = "metrics"))]
pub fn inc_messages_sent() {}

/// Record messages dropped during connection teardown.
#[cfg(feature = "metrics")]
pub fn add_messages_aborted(count: usize) {
    counter!(MESSAGES_ABORTED).increment(count as u64);
}

#[cfg(not(feature = "metrics"))]
pub fn add_messages_aborted(_count: usize) {}

/// Record a flow-control frame in the given direction.
#[cfg(feature = "metrics")]
pub fn inc_control_frames(direction: Direction) {
    counter!(CONTROL_FRAMES, "direction" => direction.as_str()).increment(1);
}

#[cfg(not(feature = "metrics"))]
pub fn inc_control_frames(_direction: Direction) {}
