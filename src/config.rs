//! Connection configuration supplied by the enclosing network manager.

use crate::queue_kind::MessageQueueType;

/// Default cap on locally queued messages for unthrottled traffic.
const DEFAULT_NONE_SEND_LIMIT: u64 = 4096;
/// Default cap on locally queued messages for flow-controlled traffic.
const DEFAULT_SEND_LIMIT: u64 = 64;
/// Default receive capacity advertised before any peer update arrives.
const DEFAULT_RECEIVE_HINT: u64 = 16;
/// Default limit on a frame's record part (16 MiB).
const DEFAULT_MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;
/// Default limit on a frame's binary part (256 MiB, sized for array chunks).
const DEFAULT_MAX_BINARY_SIZE: usize = 256 * 1024 * 1024;

/// Per-queue-type limits and framing bounds for one connection.
///
/// Values come from the enclosing network manager's configuration. Both
/// per-queue knobs are clamped to at least one so a misconfigured limit can
/// never wedge a channel shut.
#[derive(Clone, Debug)]
pub struct NetConfig {
    send_queue_limits: [u64; MessageQueueType::COUNT],
    receive_queue_hints: [u64; MessageQueueType::COUNT],
    max_record_size: usize,
    max_binary_size: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        let mut send_queue_limits = [DEFAULT_SEND_LIMIT; MessageQueueType::COUNT];
        send_queue_limits[MessageQueueType::None.index()] = DEFAULT_NONE_SEND_LIMIT;
        Self {
            send_queue_limits,
            receive_queue_hints: [DEFAULT_RECEIVE_HINT; MessageQueueType::COUNT],
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
            max_binary_size: DEFAULT_MAX_BINARY_SIZE,
        }
    }
}

impl NetConfig {
    /// Cap on queued-but-unsent messages for `mqt`, at least one.
    #[must_use]
    pub fn send_queue_limit(&self, mqt: MessageQueueType) -> u64 {
        self.send_queue_limits[mqt.index()].max(1)
    }

    /// Receive capacity advertised for `mqt` before any peer update, at
    /// least one.
    #[must_use]
    pub fn receive_queue_hint(&self, mqt: MessageQueueType) -> u64 {
        self.receive_queue_hints[mqt.index()].max(1)
    }

    /// Largest record part accepted on inbound frames.
    #[must_use]
    pub const fn max_record_size(&self) -> usize { self.max_record_size }

    /// Largest binary part accepted on inbound frames.
    #[must_use]
    pub const fn max_binary_size(&self) -> usize { self.max_binary_size }

    /// Replace the send-queue limit for `mqt`.
    #[must_use]
    pub fn with_send_queue_limit(mut self, mqt: MessageQueueType, limit: u64) -> Self {
        self.send_queue_limits[mqt.index()] = limit;
        self
    }

    /// Replace the advertised receive capacity for `mqt`.
    #[must_use]
    pub fn with_receive_queue_hint(mut self, mqt: MessageQueueType, hint: u64) -> Self {
        self.receive_queue_hints[mqt.index()] = hint;
        self
    }

    /// Replace the inbound record-part limit.
    #[must_use]
    pub fn with_max_record_size(mut self, max: usize) -> Self {
        self.max_record_size = max;
        self
    }

    /// Replace the inbound binary-part limit.
    #[must_use]
    pub fn with_max_binary_size(mut self, max: usize) -> Self {
        self.max_binary_size = max;
        self
    }
}
