//! A per-queue-type FIFO with credit state and status-delta reporting.
//!
//! Each channel tracks how many messages it has handed to the transport
//! (`local_seq_num`), how many of those the peer acknowledges having seen
//! (`local_seq_num_on_peer`), and the peer's advertised receive capacity
//! (`remote_size`). A channel may pop only while the unacknowledged window
//! is below that capacity; unthrottled channels skip the credit check
//! entirely.

use std::collections::VecDeque;

use crate::{
    config::NetConfig,
    error::{NetError, ProtocolViolation},
    message::{InstanceId, MessageDesc},
    queue_kind::MessageQueueType,
};

/// Snapshot of a channel's available send space.
///
/// Emitted only when the space crosses zero in either direction, so the
/// publication stream stays sparse. The enclosing network manager uses
/// these edges to publish local backpressure upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Peer the channel belongs to.
    pub instance_id: InstanceId,
    /// Queue type the channel carries.
    pub mqt: MessageQueueType,
    /// Space now available, in messages.
    pub available: u64,
}

/// A single FIFO stream of outgoing messages for one queue type.
pub(crate) struct Channel {
    instance_id: InstanceId,
    mqt: MessageQueueType,
    remote_size: u64,
    local_seq_num: u64,
    remote_seq_num: u64,
    local_seq_num_on_peer: u64,
    send_queue_limit: u64,
    msg_q: VecDeque<MessageDesc>,
}

impl Channel {
    pub(crate) fn new(instance_id: InstanceId, mqt: MessageQueueType, cfg: &NetConfig) -> Self {
        Self {
            instance_id,
            mqt,
            remote_size: cfg.receive_queue_hint(mqt),
            local_seq_num: 0,
            remote_seq_num: 0,
            local_seq_num_on_peer: 0,
            send_queue_limit: cfg.send_queue_limit(mqt),
            msg_q: VecDeque::new(),
        }
    }

    /// Messages handed to the transport but not yet acknowledged by the
    /// peer.
    fn outstanding(&self) -> u64 {
        debug_assert!(self.local_seq_num >= self.local_seq_num_on_peer);
        self.local_seq_num - self.local_seq_num_on_peer
    }

    /// Whether the channel has a message ready to pop: non-empty and, for
    /// flow-controlled queue types, within peer credit.
    pub(crate) fn is_active(&self) -> bool {
        if self.msg_q.is_empty() {
            return false;
        }
        !self.mqt.is_flow_controlled() || self.remote_size > self.outstanding()
    }

    /// Available send space: the tighter of the local queue limit and the
    /// peer's remaining credit, floored at zero. Unthrottled channels are
    /// bounded only locally.
    pub(crate) fn available(&self) -> u64 {
        let local = self.send_queue_limit.saturating_sub(self.msg_q.len() as u64);
        if !self.mqt.is_flow_controlled() {
            return local;
        }
        local.min(self.remote_size.saturating_sub(self.outstanding()))
    }

    /// Append a message to the tail of the channel.
    ///
    /// # Errors
    ///
    /// [`NetError::OverflowSender`] when the local queue is at its limit;
    /// [`NetError::OverflowReceiver`] when a flow-controlled channel has
    /// already queued up to the peer's advertised capacity.
    pub(crate) fn push_back(
        &mut self,
        msg: MessageDesc,
    ) -> Result<Option<ConnectionStatus>, NetError> {
        let queued = self.msg_q.len() as u64;
        if queued >= self.send_queue_limit {
            return Err(NetError::OverflowSender { mqt: self.mqt });
        }
        if self.mqt.is_flow_controlled() && queued >= self.remote_size {
            return Err(NetError::OverflowReceiver { mqt: self.mqt });
        }
        let before = self.available();
        self.msg_q.push_back(msg);
        Ok(self.new_status(before))
    }

    /// Remove and return the head message if the channel is active.
    pub(crate) fn pop_front(&mut self) -> (Option<MessageDesc>, Option<ConnectionStatus>) {
        if !self.is_active() {
            return (None, None);
        }
        let before = self.available();
        let msg = self.msg_q.pop_front();
        debug_assert!(msg.is_some());
        self.local_seq_num += 1;
        (msg, self.new_status(before))
    }

    /// Apply a peer credit update.
    ///
    /// `local_seq_on_peer` is the peer's claim about the sequence we have
    /// emitted; `remote_seq` is the last sequence the peer itself emitted.
    /// Claims that run ahead of local state or regress within a generation
    /// are protocol violations.
    ///
    /// # Errors
    ///
    /// [`NetError::Protocol`] when the update is inconsistent; the channel
    /// is left unchanged and the connection must be aborted.
    pub(crate) fn set_remote_state(
        &mut self,
        remote_size: u64,
        local_seq_on_peer: u64,
        remote_seq: u64,
    ) -> Result<Option<ConnectionStatus>, NetError> {
        self.validate_remote_state(local_seq_on_peer, remote_seq)?;
        let before = self.available();
        self.remote_size = remote_size;
        self.local_seq_num_on_peer = local_seq_on_peer;
        self.remote_seq_num = remote_seq;
        Ok(self.new_status(before))
    }

    fn validate_remote_state(
        &self,
        local_seq_on_peer: u64,
        remote_seq: u64,
    ) -> Result<(), ProtocolViolation> {
        if local_seq_on_peer > self.local_seq_num {
            return Err(ProtocolViolation::SequenceClaimAhead {
                mqt: self.mqt,
                claimed: local_seq_on_peer,
                local: self.local_seq_num,
            });
        }
        if local_seq_on_peer < self.local_seq_num_on_peer {
            return Err(ProtocolViolation::SequenceRegression {
                mqt: self.mqt,
                previous: self.local_seq_num_on_peer,
                claimed: local_seq_on_peer,
            });
        }
        if remote_seq < self.remote_seq_num {
            return Err(ProtocolViolation::SequenceRegression {
                mqt: self.mqt,
                previous: self.remote_seq_num,
                claimed: remote_seq,
            });
        }
        Ok(())
    }

    /// Forget all sequence bookkeeping; used when the peer's generation
    /// advances and its incarnation starts counting from zero.
    pub(crate) fn reset_sequence_state(&mut self) {
        self.local_seq_num = 0;
        self.remote_seq_num = 0;
        self.local_seq_num_on_peer = 0;
    }

    /// Drain every queued message for the caller to abort. Never blocks.
    pub(crate) fn abort_messages(&mut self) -> Vec<MessageDesc> {
        self.msg_q.drain(..).collect()
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> u64 { self.msg_q.len() as u64 }

    pub(crate) fn local_seq_num(&self) -> u64 { self.local_seq_num }

    pub(crate) fn remote_seq_num(&self) -> u64 { self.remote_seq_num }

    /// Status delta if available space crossed zero since `before`.
    fn new_status(&self, before: u64) -> Option<ConnectionStatus> {
        let after = self.available();
        ((before == 0) != (after == 0)).then_some(ConnectionStatus {
            instance_id: self.instance_id,
            mqt: self.mqt,
            available: after,
        })
    }
}
