//! Three-stage framing codec for [`MessageDesc`] frames.
//!
//! Decoding progresses through the fixed-size header, the record part, and
//! the binary part, yielding one message per cycle. Part lengths are
//! validated against the configured limits as soon as the header is parsed
//! so an adversarial length prefix can never force an allocation. Any
//! framing failure is fatal for the connection that owns the codec.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    config::NetConfig,
    error::MalformedMessage,
    message::{MessageDesc, MessageHeader, MessageId, QueryId},
};

/// Decode progress for the frame currently being read.
enum DecodeState {
    /// Waiting for a complete header.
    Header,
    /// Header parsed; waiting for the record part.
    Record(MessageHeader),
    /// Record consumed; waiting for the binary part.
    Binary(MessageHeader, Bytes),
}

/// Codec converting between byte streams and [`MessageDesc`] frames.
pub struct MessageCodec {
    max_record_size: usize,
    max_binary_size: usize,
    state: DecodeState,
}

impl MessageCodec {
    /// Create a codec bounded by the connection's configured part limits.
    /// Limits are clamped to what the u32 length fields can express.
    #[must_use]
    pub fn new(cfg: &NetConfig) -> Self {
        Self {
            max_record_size: cfg.max_record_size().min(u32::MAX as usize),
            max_binary_size: cfg.max_binary_size().min(u32::MAX as usize),
            state: DecodeState::Header,
        }
    }

    fn parse_header(
        src: &mut BytesMut,
        max_record: usize,
        max_binary: usize,
    ) -> Result<MessageHeader, MalformedMessage> {
        let message_id = MessageId(src.get_u32());
        let record_len = src.get_u32();
        let binary_len = src.get_u32();
        let query_id = src.get_u64();
        if record_len as usize > max_record {
            return Err(MalformedMessage::OversizedRecord {
                size: record_len as usize,
                max: max_record,
            });
        }
        if binary_len as usize > max_binary {
            return Err(MalformedMessage::OversizedBinary {
                size: binary_len as usize,
                max: max_binary,
            });
        }
        Ok(MessageHeader {
            message_id,
            record_len,
            binary_len,
            query_id,
        })
    }
}

/// Wrap a structured framing failure for transport through `FramedRead`.
fn malformed(err: MalformedMessage) -> io::Error { io::Error::new(io::ErrorKind::InvalidData, err) }

/// Recover the structured framing failure from a read error, if present.
#[must_use]
pub fn as_malformed(err: &io::Error) -> Option<&MalformedMessage> {
    err.get_ref()?.downcast_ref::<MalformedMessage>()
}

impl Decoder for MessageCodec {
    type Item = MessageDesc;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match &mut self.state {
                DecodeState::Header => {
                    if src.len() < MessageHeader::SIZE {
                        src.reserve(MessageHeader::SIZE - src.len());
                        return Ok(None);
                    }
                    let header =
                        Self::parse_header(src, self.max_record_size, self.max_binary_size)
                            .map_err(malformed)?;
                    src.reserve(header.record_len as usize + header.binary_len as usize);
                    self.state = DecodeState::Record(header);
                }
                DecodeState::Record(header) => {
                    let header = *header;
                    let need = header.record_len as usize;
                    if src.len() < need {
                        return Ok(None);
                    }
                    let record = src.split_to(need).freeze();
                    self.state = DecodeState::Binary(header, record);
                }
                DecodeState::Binary(header, record) => {
                    let header = *header;
                    let need = header.binary_len as usize;
                    if src.len() < need {
                        return Ok(None);
                    }
                    let record = std::mem::take(record);
                    let mut msg = MessageDesc::new(header.message_id, record);
                    if header.query_id != 0 {
                        msg = msg.with_query(QueryId(header.query_id));
                    }
                    if need > 0 {
                        msg = msg.with_binary(src.split_to(need).freeze());
                    }
                    self.state = DecodeState::Header;
                    return Ok(Some(msg));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                let mid_frame = !matches!(self.state, DecodeState::Header);
                if src.is_empty() && !mid_frame {
                    return Ok(None);
                }
                Err(malformed(MalformedMessage::TruncatedFrame {
                    pending: src.len(),
                }))
            }
        }
    }
}

impl Encoder<MessageDesc> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: MessageDesc, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if msg.record().len() > self.max_record_size {
            return Err(malformed(MalformedMessage::OversizedRecord {
                size: msg.record().len(),
                max: self.max_record_size,
            }));
        }
        let binary_len = msg.binary().map_or(0, Bytes::len);
        if binary_len > self.max_binary_size {
            return Err(malformed(MalformedMessage::OversizedBinary {
                size: binary_len,
                max: self.max_binary_size,
            }));
        }
        let header = msg.header();
        dst.reserve(MessageHeader::SIZE + msg.record().len() + binary_len);
        dst.put_u32(header.message_id.0);
        dst.put_u32(header.record_len);
        dst.put_u32(header.binary_len);
        dst.put_u64(header.query_id);
        dst.extend_from_slice(msg.record());
        if let Some(binary) = msg.binary() {
            dst.extend_from_slice(binary);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> MessageCodec { MessageCodec::new(&NetConfig::default()) }

    fn encode(msg: MessageDesc) -> BytesMut {
        let mut buf = BytesMut::new();
        codec().encode(msg, &mut buf).expect("encode");
        buf
    }

    #[test]
    fn decodes_across_partial_reads() {
        let msg = MessageDesc::new(MessageId(3), Bytes::from_static(b"record"))
            .with_query(QueryId(9))
            .with_binary(Bytes::from_static(b"payload"));
        let wire = encode(msg);

        let mut codec = codec();
        let mut src = BytesMut::new();
        // Header alone: not enough for a frame.
        src.extend_from_slice(&wire[..MessageHeader::SIZE]);
        assert!(codec.decode(&mut src).expect("header stage").is_none());
        // Header plus record: still waiting on the binary part.
        src.extend_from_slice(&wire[MessageHeader::SIZE..MessageHeader::SIZE + 6]);
        assert!(codec.decode(&mut src).expect("record stage").is_none());
        // Remainder completes the frame.
        src.extend_from_slice(&wire[MessageHeader::SIZE + 6..]);
        let decoded = codec
            .decode(&mut src)
            .expect("binary stage")
            .expect("complete frame");
        assert_eq!(decoded.message_id(), MessageId(3));
        assert_eq!(decoded.query(), Some(QueryId(9)));
        assert_eq!(decoded.record().as_ref(), b"record");
        assert_eq!(decoded.binary().map(Bytes::as_ref), Some(&b"payload"[..]));
    }

    #[test]
    fn frame_without_binary_part() {
        let wire = encode(MessageDesc::new(MessageId(5), Bytes::from_static(b"r")));
        let mut codec = codec();
        let mut src = BytesMut::from(&wire[..]);
        let decoded = codec.decode(&mut src).expect("decode").expect("frame");
        assert!(decoded.binary().is_none());
        assert!(decoded.query().is_none());
        assert!(src.is_empty());
    }

    #[test]
    fn oversized_record_is_rejected_before_payload() {
        let cfg = NetConfig::default().with_max_record_size(8);
        let mut codec = MessageCodec::new(&cfg);
        let mut src = BytesMut::new();
        src.put_u32(1);
        src.put_u32(9); // record length over the limit
        src.put_u32(0);
        src.put_u64(0);
        let err = codec.decode(&mut src).expect_err("oversized record");
        assert!(matches!(
            as_malformed(&err),
            Some(MalformedMessage::OversizedRecord { size: 9, max: 8 })
        ));
    }

    #[test]
    fn eof_mid_frame_is_truncation() {
        let wire = encode(MessageDesc::new(MessageId(2), Bytes::from_static(b"rec")));
        let mut codec = codec();
        let mut src = BytesMut::from(&wire[..MessageHeader::SIZE + 1]);
        assert!(codec.decode(&mut src).expect("incomplete").is_none());
        let err = codec.decode_eof(&mut src).expect_err("truncated frame");
        assert!(matches!(
            as_malformed(&err),
            Some(MalformedMessage::TruncatedFrame { .. })
        ));
    }

    #[test]
    fn eof_at_frame_boundary_is_clean() {
        let mut codec = codec();
        let mut src = BytesMut::new();
        assert!(codec.decode_eof(&mut src).expect("clean close").is_none());
    }
}
