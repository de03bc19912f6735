//! Flow-control frames exchanged between peers.
//!
//! A control frame is an ordinary message on the unthrottled queue whose
//! record part carries one [`ControlEntry`] per queue type the sender wants
//! to update. Entries are written from the sender's perspective; the
//! receiving connection swaps `local_*` and `remote_*` before applying
//! them to its own queue.

use bincode::{config, decode_from_slice, encode_to_vec, Decode, Encode};
use bytes::Bytes;

use crate::{
    error::{MalformedMessage, NetError},
    message::{MessageDesc, MessageId},
    queue_kind::MessageQueueType,
};

/// One per-queue-type flow-control tuple, in the sender's perspective.
#[derive(Clone, Copy, Debug, Decode, Encode, PartialEq, Eq)]
pub struct ControlEntry {
    /// Queue type the tuple describes.
    pub mqt: MessageQueueType,
    /// Receive capacity the sender currently advertises, in messages.
    pub remote_size: u64,
    /// The sender's own generation.
    pub local_gen_id: u64,
    /// The sender's view of the receiver's generation.
    pub remote_gen_id: u64,
    /// Last sequence number the sender has emitted on this queue type.
    pub local_seq_num: u64,
    /// Last sequence number the sender has observed from the receiver.
    pub remote_seq_num: u64,
}

/// Record part of a [`MessageId::CONTROL`] frame.
#[derive(Clone, Debug, Default, Decode, Encode, PartialEq, Eq)]
pub struct ControlRecord {
    /// Updates carried by this frame, at most one per queue type.
    pub entries: Vec<ControlEntry>,
}

impl ControlRecord {
    /// Append an entry.
    pub fn push(&mut self, entry: ControlEntry) { self.entries.push(entry); }

    /// Encode the record into a ready-to-queue control message.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Malformed`] if the record is empty or fails to
    /// encode.
    pub fn into_message(self) -> Result<MessageDesc, NetError> {
        if self.entries.is_empty() {
            return Err(MalformedMessage::EmptyControl.into());
        }
        let record = encode_to_vec(&self, config::standard()).map_err(|e| {
            NetError::Malformed(MalformedMessage::ControlRecord {
                reason: e.to_string(),
            })
        })?;
        Ok(MessageDesc::new(MessageId::CONTROL, Bytes::from(record)))
    }

    /// Decode a control record from a frame's record part.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Malformed`] when the bytes do not decode to a
    /// non-empty record consuming the whole part.
    pub fn from_record(record: &[u8]) -> Result<Self, NetError> {
        let (decoded, consumed): (Self, usize) = decode_from_slice(record, config::standard())
            .map_err(|e| {
                NetError::Malformed(MalformedMessage::ControlRecord {
                    reason: e.to_string(),
                })
            })?;
        if consumed != record.len() {
            return Err(MalformedMessage::ControlRecord {
                reason: format!("{} trailing bytes", record.len() - consumed),
            }
            .into());
        }
        if decoded.entries.is_empty() {
            return Err(MalformedMessage::EmptyControl.into());
        }
        Ok(decoded)
    }
}
