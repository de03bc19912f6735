//! Canonical error types for the crate.
//!
//! The taxonomy distinguishes recoverable queue overflows, which are
//! surfaced to the caller of a send, from fatal conditions that tear the
//! connection down. Every fatal path funnels through the connection's
//! single teardown routine.

use std::{io, time::SystemTimeError};

use thiserror::Error;

use crate::queue_kind::MessageQueueType;

/// Fatal inconsistencies in peer-reported credit or generation data.
///
/// Any of these indicates the peer and the local instance no longer agree
/// on the channel bookkeeping; the connection is aborted rather than
/// guessing which side is right.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// The peer claims to have observed more messages from us than we have
    /// ever emitted on this channel.
    #[error("peer observed sequence {claimed} ahead of local sequence {local} on {mqt:?}")]
    SequenceClaimAhead {
        /// Channel the claim was made for.
        mqt: MessageQueueType,
        /// Sequence number the peer claims to have observed.
        claimed: u64,
        /// Sequence number actually emitted locally.
        local: u64,
    },

    /// A peer-reported sequence number moved backwards within a generation.
    #[error("peer sequence on {mqt:?} regressed from {previous} to {claimed}")]
    SequenceRegression {
        /// Channel the regression was observed on.
        mqt: MessageQueueType,
        /// Previously reported value.
        previous: u64,
        /// Newly reported, smaller value.
        claimed: u64,
    },

    /// The peer reports a generation for this instance that has not been
    /// minted here yet.
    #[error("peer reports local generation {reported}, ours is {actual}")]
    GenerationAhead {
        /// Generation the peer attributes to us.
        reported: u64,
        /// Generation actually minted locally.
        actual: u64,
    },
}

/// Inbound frames that cannot be interpreted.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MalformedMessage {
    /// The header announces a record part larger than the configured limit.
    #[error("record part of {size} bytes exceeds limit {max}")]
    OversizedRecord {
        /// Announced record length.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The header announces a binary part larger than the configured limit.
    #[error("binary part of {size} bytes exceeds limit {max}")]
    OversizedBinary {
        /// Announced binary length.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The transport closed with a partially received frame pending.
    #[error("connection closed mid-frame with {pending} bytes pending")]
    TruncatedFrame {
        /// Bytes received of the incomplete frame.
        pending: usize,
    },

    /// The record part of a control frame failed to decode.
    #[error("undecodable control record: {reason}")]
    ControlRecord {
        /// Decoder diagnostic.
        reason: String,
    },

    /// A control frame carried no flow-control entries.
    #[error("control frame carries no entries")]
    EmptyControl,
}

/// Top-level error type exposed by `gridlink`.
#[derive(Debug, Error)]
pub enum NetError {
    /// The local send queue for the addressed queue type is full. The
    /// caller decides whether to block, drop, or fail the operation.
    #[error("local send queue full on {mqt:?}")]
    OverflowSender {
        /// Queue type whose send queue is full.
        mqt: MessageQueueType,
    },

    /// The peer has no advertised receive capacity left on the addressed
    /// queue type. Recoverable once a credit update arrives.
    #[error("peer receive queue full on {mqt:?}")]
    OverflowReceiver {
        /// Queue type whose peer credit is exhausted.
        mqt: MessageQueueType,
    },

    /// The peer sent credit or generation data inconsistent with local
    /// state. Fatal to the connection.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// The underlying socket failed. Fatal to the connection.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Inbound bytes failed framing or validation. Fatal to the connection.
    #[error("malformed message: {0}")]
    Malformed(#[from] MalformedMessage),

    /// The system clock could not be read while minting a generation
    /// identifier. Fatal: without a fresh generation the restart protocol
    /// cannot distinguish peer incarnations.
    #[error("system time unavailable: {0}")]
    SystemTime(#[from] SystemTimeError),

    /// The operation requires an established connection.
    #[error("connection is not established")]
    NotConnected,

    /// A connect was attempted on a connection that is not in the
    /// `NotConnected` state.
    #[error("connect attempted while already connecting or connected")]
    AlreadyConnected,

    /// The connection actor has terminated; the handle is stale.
    #[error("connection closed")]
    Closed,
}

impl NetError {
    /// Whether the error is a recoverable queue overflow rather than a
    /// condition fatal to the connection.
    #[must_use]
    pub const fn is_overflow(&self) -> bool {
        matches!(
            self,
            Self::OverflowSender { .. } | Self::OverflowReceiver { .. }
        )
    }
}
