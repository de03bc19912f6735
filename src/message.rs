//! Message descriptors exchanged between cluster instances.
//!
//! A [`MessageDesc`] is one framed unit on the wire: a fixed-size header,
//! an opaque record part, and an optional binary part (typically an array
//! chunk). The record and binary payloads are [`Bytes`] so queueing and
//! encoding never copy them.

use std::fmt;

use bytes::Bytes;

/// Identity of a cluster instance (or the client side of a session).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub u64);

impl InstanceId {
    /// Placeholder identity for peers not yet registered in the catalog,
    /// such as freshly accepted client sockets.
    pub const UNKNOWN: Self = Self(u64::MAX);
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::UNKNOWN {
            f.write_str("unknown")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Identifier of a query registered on a connection. Never zero; zero is
/// the wire encoding for "no query".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Identifies the meaning of a message's record part.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub u32);

impl MessageId {
    /// Reserved for flow-control frames, consumed inside the connection
    /// and never dispatched upstream.
    pub const CONTROL: Self = Self(0);

    /// Whether this id designates a flow-control frame.
    #[must_use]
    pub const fn is_control(self) -> bool { self.0 == Self::CONTROL.0 }
}

/// Fixed-size wire header preceding every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Meaning of the record part.
    pub message_id: MessageId,
    /// Length of the record part in bytes.
    pub record_len: u32,
    /// Length of the binary part in bytes; zero when absent.
    pub binary_len: u32,
    /// Associated query, zero when the message has none.
    pub query_id: u64,
}

impl MessageHeader {
    /// Encoded size of the header on the wire.
    pub const SIZE: usize = 4 + 4 + 4 + 8;
}

/// One message: header metadata plus record and optional binary parts.
#[derive(Clone, Debug)]
pub struct MessageDesc {
    message_id: MessageId,
    query: Option<QueryId>,
    record: Bytes,
    binary: Option<Bytes>,
}

impl MessageDesc {
    /// Create a message carrying `record`.
    #[must_use]
    pub const fn new(message_id: MessageId, record: Bytes) -> Self {
        Self {
            message_id,
            query: None,
            record,
            binary: None,
        }
    }

    /// Associate the message with a query so teardown can abort it.
    #[must_use]
    pub fn with_query(mut self, query: QueryId) -> Self {
        self.query = Some(query);
        self
    }

    /// Attach an opaque binary part.
    #[must_use]
    pub fn with_binary(mut self, binary: Bytes) -> Self {
        self.binary = Some(binary);
        self
    }

    /// Meaning of the record part.
    #[must_use]
    pub const fn message_id(&self) -> MessageId { self.message_id }

    /// Query this message belongs to, if any.
    #[must_use]
    pub const fn query(&self) -> Option<QueryId> { self.query }

    /// The record part.
    #[must_use]
    pub const fn record(&self) -> &Bytes { &self.record }

    /// The binary part, if any.
    #[must_use]
    pub const fn binary(&self) -> Option<&Bytes> { self.binary.as_ref() }

    /// Wire header for this message.
    #[must_use]
    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            message_id: self.message_id,
            record_len: u32::try_from(self.record.len()).unwrap_or(u32::MAX),
            binary_len: self
                .binary
                .as_ref()
                .map_or(0, |b| u32::try_from(b.len()).unwrap_or(u32::MAX)),
            query_id: self.query.map_or(0, |q| q.0),
        }
    }
}
