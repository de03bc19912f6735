//! The multi-channel send queue: parallel FIFO channels drained round
//! robin, plus the generation protocol that survives peer restarts.
//!
//! One channel exists per [`MessageQueueType`], created on first use. FIFO
//! holds within a channel and nowhere else; the round-robin cursor is a
//! fairness device, not an ordering one. Each queue mints a process-unique
//! generation identifier at construction; peers echo generations in
//! control frames, which lets either side detect a restarted peer and
//! reset sequence bookkeeping without durable storage.

use std::{
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::debug;

use crate::{
    channel::{Channel, ConnectionStatus},
    config::NetConfig,
    error::{NetError, ProtocolViolation},
    message::{InstanceId, MessageDesc},
    queue_kind::MessageQueueType,
};

/// High-water mark keeping minted generations strictly increasing even if
/// the clock is read twice within a nanosecond or steps backwards.
static LAST_GEN_ID: AtomicU64 = AtomicU64::new(0);

/// Mint a fresh generation identifier from the system clock.
///
/// The value is opaque to peers; only its strict per-process increase
/// matters.
fn next_gen_id() -> Result<u64, NetError> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
    let ticks = u64::try_from(now.as_nanos()).unwrap_or(u64::MAX);
    let mut prev = LAST_GEN_ID.load(Ordering::Relaxed);
    loop {
        let next = ticks.max(prev + 1);
        match LAST_GEN_ID.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return Ok(next),
            Err(observed) => prev = observed,
        }
    }
}

/// An ordered set of per-queue-type channels behind one connection.
pub struct MultiChannelQueue {
    instance_id: InstanceId,
    cfg: Arc<NetConfig>,
    channels: [Option<Channel>; MessageQueueType::COUNT],
    curr_channel: usize,
    active_channel_count: usize,
    size: u64,
    remote_gen_id: u64,
    local_gen_id: u64,
}

impl MultiChannelQueue {
    /// Create an empty queue for the peer `instance_id`.
    ///
    /// # Errors
    ///
    /// [`NetError::SystemTime`] if the clock needed for the generation
    /// identifier cannot be read.
    pub fn new(instance_id: InstanceId, cfg: Arc<NetConfig>) -> Result<Self, NetError> {
        Ok(Self {
            instance_id,
            cfg,
            channels: Default::default(),
            curr_channel: 0,
            active_channel_count: 0,
            size: 0,
            remote_gen_id: 0,
            local_gen_id: next_gen_id()?,
        })
    }

    fn channel_mut(&mut self, mqt: MessageQueueType) -> &mut Channel {
        let slot = &mut self.channels[mqt.index()];
        slot.get_or_insert_with(|| Channel::new(self.instance_id, mqt, &self.cfg))
    }

    fn recount_active(&mut self) {
        self.active_channel_count = self
            .channels
            .iter()
            .flatten()
            .filter(|c| c.is_active())
            .count();
    }

    /// Append `msg` to the channel for `mqt`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Propagates the channel's overflow errors; the queue is unchanged on
    /// failure.
    pub fn push_back(
        &mut self,
        mqt: MessageQueueType,
        msg: MessageDesc,
    ) -> Result<Option<ConnectionStatus>, NetError> {
        let status = self.channel_mut(mqt).push_back(msg)?;
        self.size += 1;
        self.recount_active();
        Ok(status)
    }

    /// Dequeue the next available message, serving channels round robin
    /// starting at the cursor and advancing it past the served channel.
    pub fn pop_front(&mut self) -> (Option<MessageDesc>, Option<ConnectionStatus>) {
        let count = self.channels.len();
        for step in 0..count {
            let idx = (self.curr_channel + step) % count;
            let ready = self.channels[idx]
                .as_ref()
                .is_some_and(Channel::is_active);
            if !ready {
                continue;
            }
            let Some(channel) = self.channels[idx].as_mut() else {
                continue;
            };
            let (msg, status) = channel.pop_front();
            if msg.is_some() {
                self.size -= 1;
            }
            self.curr_channel = (idx + 1) % count;
            self.recount_active();
            return (msg, status);
        }
        (None, None)
    }

    /// Apply a peer flow-control update for `mqt`, running the generation
    /// protocol first.
    ///
    /// `local_gen` is the peer's claim about our generation and `remote_gen`
    /// is the peer's own; `local_seq` is the peer's claim about the sequence
    /// we emitted and `remote_seq` the last sequence the peer emitted.
    /// Stale generations are ignored; a peer that reports a generation we
    /// have not minted is lying or corrupt.
    ///
    /// # Errors
    ///
    /// [`NetError::Protocol`] on generation or sequence inconsistencies;
    /// fatal to the connection.
    pub fn set_remote_state(
        &mut self,
        mqt: MessageQueueType,
        remote_size: u64,
        local_gen: u64,
        remote_gen: u64,
        local_seq: u64,
        remote_seq: u64,
    ) -> Result<Option<ConnectionStatus>, NetError> {
        if local_gen > self.local_gen_id {
            return Err(ProtocolViolation::GenerationAhead {
                reported: local_gen,
                actual: self.local_gen_id,
            }
            .into());
        }
        if remote_gen < self.remote_gen_id {
            debug!(
                instance = %self.instance_id,
                reported = remote_gen,
                current = self.remote_gen_id,
                "ignoring flow-control update from a stale peer incarnation"
            );
            return Ok(None);
        }
        if remote_gen > self.remote_gen_id {
            // A new peer incarnation counts from zero. Adoption happens
            // even when the payload below is discarded, otherwise two
            // fresh peers would ignore each other's generations forever.
            debug!(
                instance = %self.instance_id,
                old_gen = self.remote_gen_id,
                new_gen = remote_gen,
                "peer generation advanced; resetting sequence state"
            );
            for channel in self.channels.iter_mut().flatten() {
                channel.reset_sequence_state();
            }
            self.remote_gen_id = remote_gen;
            self.recount_active();
        }
        if local_gen < self.local_gen_id {
            // The peer has not yet seen our current generation; its claims
            // about our sequence numbers are meaningless.
            debug!(
                instance = %self.instance_id,
                reported = local_gen,
                current = self.local_gen_id,
                "ignoring flow-control payload for a stale local generation"
            );
            return Ok(None);
        }
        let status = self
            .channel_mut(mqt)
            .set_remote_state(remote_size, local_seq, remote_seq)?;
        self.recount_active();
        Ok(status)
    }

    /// Available send space for `mqt` without instantiating its channel.
    #[must_use]
    pub fn available(&self, mqt: MessageQueueType) -> u64 {
        match &self.channels[mqt.index()] {
            Some(channel) => channel.available(),
            None => {
                let local = self.cfg.send_queue_limit(mqt);
                if mqt.is_flow_controlled() {
                    local.min(self.cfg.receive_queue_hint(mqt))
                } else {
                    local
                }
            }
        }
    }

    /// Whether any channel has a poppable message.
    #[must_use]
    pub fn is_active(&self) -> bool {
        debug_assert!(self.active_channel_count <= MessageQueueType::COUNT);
        self.active_channel_count > 0
    }

    /// Total queued messages across all channels.
    #[must_use]
    pub const fn size(&self) -> u64 { self.size }

    /// Generation identifier minted for this queue instance.
    #[must_use]
    pub const fn local_gen_id(&self) -> u64 { self.local_gen_id }

    /// The peer's generation as last reported; zero until first observed.
    #[must_use]
    pub const fn remote_gen_id(&self) -> u64 { self.remote_gen_id }

    /// Last sequence number emitted on `mqt`.
    #[must_use]
    pub fn local_seq_num(&self, mqt: MessageQueueType) -> u64 {
        self.channels[mqt.index()]
            .as_ref()
            .map_or(0, Channel::local_seq_num)
    }

    /// Last sequence number observed from the peer on `mqt`.
    #[must_use]
    pub fn remote_seq_num(&self, mqt: MessageQueueType) -> u64 {
        self.channels[mqt.index()]
            .as_ref()
            .map_or(0, Channel::remote_seq_num)
    }

    /// Drain every channel, returning the dropped messages for the caller
    /// to abort.
    pub fn abort_messages(&mut self) -> Vec<MessageDesc> {
        let mut dropped = Vec::new();
        for channel in self.channels.iter_mut().flatten() {
            dropped.append(&mut channel.abort_messages());
        }
        self.size = 0;
        self.recount_active();
        dropped
    }

    /// Exchange the entire state of two queues; used to carry messages
    /// queued for a previous incarnation over to a reconnected peer.
    pub fn swap(&mut self, other: &mut Self) { mem::swap(self, other); }

    #[cfg(test)]
    pub(crate) fn queued_on(&self, mqt: MessageQueueType) -> u64 {
        self.channels[mqt.index()].as_ref().map_or(0, Channel::queued)
    }

    #[cfg(test)]
    pub(crate) fn active_channel_count(&self) -> usize { self.active_channel_count }
}
