//! Transmission frames.
//!
//! Every unit written to the physical transport is a frame with a fixed
//! 18-byte big-endian header:
//!
//! ```text
//! +--------+--------+-----+-----+-------+-------+--------------+-------------+---------+
//! | 0xBEEF | length | seg | pri | flags | chunk | conversation | correlation | payload |
//! |   2    |   4    |  1  |  1  |   1   |   1   |      4       |      4      |    n    |
//! +--------+--------+-----+-----+-------+-------+--------------+-------------+---------+
//! ```
//!
//! `length` covers header and payload. Conversation id 0 addresses the
//! connection itself (handshake, heartbeats, physical close).
//!
//! [`FrameDecoder`] accumulates partial reads and yields complete frames:
//! - `WaitingForHeader`: need 18 bytes
//! - `WaitingForPayload`: header parsed, need N more payload bytes
//! - `Discarding`: header of a conversation frame was malformed, skip N bytes
//!
//! A bad eyecatcher or length, or a bad header on conversation 0, loses
//! framing for the whole stream. Any other bad header byte only spoils its
//! own frame, which is skipped and reported as [`Decoded::Malformed`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{JfapError, Result};

/// Frame eyecatcher
pub const EYECATCHER: u16 = 0xBEEF;

/// Header size in bytes
pub const HEADER_SIZE: usize = 18;

/// Highest transport priority on the wire
pub const MAX_TRANSPORT_PRIORITY: u8 = 16;

/// Segment types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegmentType {
    /// Handshake request or reply
    Handshake = 0x01,
    /// Application data
    Data = 0x02,
    /// Conversation close request
    LogicalClose = 0x03,
    /// Conversation close acknowledgement
    LogicalCloseAck = 0x04,
    /// Heartbeat probe
    Heartbeat = 0x05,
    /// Heartbeat answer
    HeartbeatResponse = 0x06,
    /// Whole connection is going away
    PhysicalClose = 0x07,
    /// Open a conversation
    ConversationOpen = 0x08,
    /// Consumer read-ahead refill
    ReadAheadRequest = 0x09,
    /// Schema fetch
    RequestSchema = 0x6E,
}

impl SegmentType {
    /// Decode a segment type byte
    pub fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0x01 => Self::Handshake,
            0x02 => Self::Data,
            0x03 => Self::LogicalClose,
            0x04 => Self::LogicalCloseAck,
            0x05 => Self::Heartbeat,
            0x06 => Self::HeartbeatResponse,
            0x07 => Self::PhysicalClose,
            0x08 => Self::ConversationOpen,
            0x09 => Self::ReadAheadRequest,
            0x6E => Self::RequestSchema,
            other => {
                return Err(JfapError::Framing(format!(
                    "unknown segment type 0x{other:02x}"
                )))
            },
        })
    }
}

/// Exchange flags in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Sender waits for a correlated reply
    pub const EXCHANGE_REQUEST: u8 = 0x01;
    /// Frame answers an exchange
    pub const EXCHANGE_REPLY: u8 = 0x02;

    /// Empty flags
    pub fn new() -> Self {
        Self(0)
    }

    /// Check if flag is set
    pub fn has(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    /// Copy with flag set
    pub fn with(mut self, flag: u8) -> Self {
        self.0 |= flag;
        self
    }

    /// Raw value
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Decode, rejecting unknown bits and request+reply together
    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits & !(Self::EXCHANGE_REQUEST | Self::EXCHANGE_REPLY) != 0
            || bits == Self::EXCHANGE_REQUEST | Self::EXCHANGE_REPLY
        {
            return Err(JfapError::Framing(format!("invalid frame flags 0x{bits:02x}")));
        }
        Ok(Self(bits))
    }
}

/// Position of a frame within a chunked message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkFlag {
    /// Not chunked
    Whole = 0x00,
    /// First chunk
    First = 0x01,
    /// Middle chunk
    Middle = 0x02,
    /// Last chunk
    Last = 0x04,
}

impl ChunkFlag {
    /// Decode the chunk flags byte
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x00 => Ok(Self::Whole),
            0x01 => Ok(Self::First),
            0x02 => Ok(Self::Middle),
            0x04 => Ok(Self::Last),
            other => Err(JfapError::Framing(format!(
                "invalid chunk flags 0x{other:02x}"
            ))),
        }
    }
}

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Segment type
    pub segment: SegmentType,
    /// Transport priority (0..=16)
    pub priority: u8,
    /// Exchange flags
    pub flags: FrameFlags,
    /// Chunk position
    pub chunk: ChunkFlag,
    /// Conversation id (0 = connection level)
    pub conversation_id: u32,
    /// Correlation id (0 = none)
    pub correlation_id: u32,
}

impl FrameHeader {
    /// Header for a plain frame
    pub fn new(segment: SegmentType, priority: u8, conversation_id: u32) -> Self {
        Self {
            segment,
            priority,
            flags: FrameFlags::new(),
            chunk: ChunkFlag::Whole,
            conversation_id,
            correlation_id: 0,
        }
    }

    /// Mark as exchange request
    pub fn request(mut self, correlation_id: u32) -> Self {
        self.flags = FrameFlags::new().with(FrameFlags::EXCHANGE_REQUEST);
        self.correlation_id = correlation_id;
        self
    }

    /// Mark as exchange reply
    pub fn reply(mut self, correlation_id: u32) -> Self {
        self.flags = FrameFlags::new().with(FrameFlags::EXCHANGE_REPLY);
        self.correlation_id = correlation_id;
        self
    }

    /// Set chunk position
    pub fn chunk(mut self, chunk: ChunkFlag) -> Self {
        self.chunk = chunk;
        self
    }

    /// Whether this frame is an exchange request
    pub fn is_request(&self) -> bool {
        self.flags.has(FrameFlags::EXCHANGE_REQUEST)
    }

    /// Whether this frame is an exchange reply
    pub fn is_reply(&self) -> bool {
        self.flags.has(FrameFlags::EXCHANGE_REPLY)
    }

    fn encode(&self, payload_len: usize, buf: &mut BytesMut) -> Result<()> {
        let total = u32::try_from(HEADER_SIZE + payload_len).map_err(|_| {
            JfapError::Usage(format!("frame payload of {payload_len} bytes is too large"))
        })?;
        buf.put_u16(EYECATCHER);
        buf.put_u32(total);
        buf.put_u8(self.segment as u8);
        buf.put_u8(self.priority);
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.chunk as u8);
        buf.put_u32(self.conversation_id);
        buf.put_u32(self.correlation_id);
        Ok(())
    }

    /// Read the parts of a header that keep the stream in sync: eyecatcher,
    /// length and conversation id. Returns `(payload_len, conversation_id)`.
    pub fn decode_envelope(buf: &[u8]) -> Result<(usize, u32)> {
        if buf.len() < HEADER_SIZE {
            return Err(JfapError::Framing(format!(
                "frame header needs {HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let mut prefix = &buf[..6];
        let eyecatcher = prefix.get_u16();
        if eyecatcher != EYECATCHER {
            return Err(JfapError::Framing(format!(
                "bad eyecatcher 0x{eyecatcher:04x}"
            )));
        }
        let total = prefix.get_u32() as usize;
        if total < HEADER_SIZE {
            return Err(JfapError::Framing(format!(
                "frame length {total} shorter than header"
            )));
        }
        let mut conversation = &buf[10..14];
        Ok((total - HEADER_SIZE, conversation.get_u32()))
    }

    /// Decode a header from exactly `HEADER_SIZE` bytes, returning the
    /// header and payload length.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (len, _) = Self::decode_envelope(buf)?;
        let mut buf = &buf[6..HEADER_SIZE];
        let segment = SegmentType::from_byte(buf.get_u8())?;
        let priority = buf.get_u8();
        if priority > MAX_TRANSPORT_PRIORITY {
            return Err(JfapError::Framing(format!(
                "transport priority {priority} out of range"
            )));
        }
        let flags = FrameFlags::from_bits(buf.get_u8())?;
        let chunk = ChunkFlag::from_byte(buf.get_u8())?;
        let conversation_id = buf.get_u32();
        let correlation_id = buf.get_u32();

        Ok((
            Self {
                segment,
                priority,
                flags,
                chunk,
                conversation_id,
                correlation_id,
            },
            len,
        ))
    }
}

/// A complete frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Header
    pub header: FrameHeader,
    /// Payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame
    pub fn new(header: FrameHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Encoded size
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(self.encoded_len());
        self.header.encode(self.payload.len(), buf)?;
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Encode into a fresh buffer
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Output of [`FrameDecoder::next_decoded`]
#[derive(Debug)]
pub enum Decoded {
    /// A well-formed frame
    Frame(Frame),
    /// A frame on `conversation_id` whose header was invalid; its payload
    /// has been skipped and the stream is still in sync
    Malformed {
        /// Conversation the frame was addressed to
        conversation_id: u32,
        /// What was wrong with it
        error: JfapError,
    },
}

#[derive(Debug, Clone)]
enum State {
    WaitingForHeader,
    WaitingForPayload { header: FrameHeader, len: usize },
    Discarding { conversation_id: u32, len: usize, reason: String },
}

/// Incremental frame decoder over partial reads.
pub struct FrameDecoder {
    buffer: BytesMut,
    state: State,
    max_payload: usize,
}

impl FrameDecoder {
    /// Decoder rejecting payloads above `max_payload` bytes
    pub fn new(max_payload: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_payload,
        }
    }

    /// Raise or lower the payload limit (after negotiation)
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    /// Buffered, not yet decoded bytes
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer for direct reads
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extract the next complete frame, if one is buffered. A malformed
    /// conversation frame is returned as an error.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.next_decoded()? {
            Some(Decoded::Frame(frame)) => Ok(Some(frame)),
            Some(Decoded::Malformed { error, .. }) => Err(error),
            None => Ok(None),
        }
    }

    /// Extract the next complete frame or skipped malformed frame.
    ///
    /// `Err` means framing is lost for the whole stream.
    pub fn next_decoded(&mut self) -> Result<Option<Decoded>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(None);
                    }
                    let (len, conversation_id) =
                        FrameHeader::decode_envelope(&self.buffer[..HEADER_SIZE])?;
                    if len > self.max_payload {
                        return Err(JfapError::Framing(format!(
                            "payload of {len} bytes exceeds maximum {}",
                            self.max_payload
                        )));
                    }
                    let next = match FrameHeader::decode(&self.buffer[..HEADER_SIZE]) {
                        Ok((header, _)) => State::WaitingForPayload { header, len },
                        Err(e) if conversation_id == 0 => return Err(e),
                        Err(e) => State::Discarding {
                            conversation_id,
                            len,
                            reason: match e {
                                JfapError::Framing(reason) => reason,
                                other => other.to_string(),
                            },
                        },
                    };
                    self.buffer.advance(HEADER_SIZE);
                    self.state = next;
                },
                State::WaitingForPayload { header, len } => {
                    let (header, len) = (*header, *len);
                    if self.buffer.len() < len {
                        return Ok(None);
                    }
                    let payload = self.buffer.split_to(len).freeze();
                    self.state = State::WaitingForHeader;
                    return Ok(Some(Decoded::Frame(Frame::new(header, payload))));
                },
                State::Discarding { len, .. } => {
                    if self.buffer.len() < *len {
                        return Ok(None);
                    }
                    let len = *len;
                    self.buffer.advance(len);
                    if let State::Discarding {
                        conversation_id,
                        reason,
                        ..
                    } = std::mem::replace(&mut self.state, State::WaitingForHeader)
                    {
                        return Ok(Some(Decoded::Malformed {
                            conversation_id,
                            error: JfapError::Framing(reason),
                        }));
                    }
                },
            }
        }
    }

    /// Append `data` and drain every complete frame.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.extend(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_frame(conv: u32, payload: &'static [u8]) -> Frame {
        Frame::new(
            FrameHeader::new(SegmentType::Data, 5, conv).request(9),
            Bytes::from_static(payload),
        )
    }

    #[test]
    fn test_header_layout() {
        let bytes = data_frame(3, b"hi").encode().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 2);
        assert_eq!(&bytes[..2], &[0xBE, 0xEF]);
        assert_eq!(&bytes[2..6], &[0, 0, 0, 20]);
        assert_eq!(bytes[6], SegmentType::Data as u8);
        assert_eq!(bytes[7], 5);
        assert_eq!(bytes[8], FrameFlags::EXCHANGE_REQUEST);
        assert_eq!(bytes[9], 0);
        assert_eq!(&bytes[10..14], &[0, 0, 0, 3]);
        assert_eq!(&bytes[14..18], &[0, 0, 0, 9]);
    }

    #[test]
    fn test_decoder_handles_fragmented_input() {
        let a = data_frame(1, b"first");
        let b = data_frame(2, b"");
        let mut wire = BytesMut::new();
        a.encode_into(&mut wire).unwrap();
        b.encode_into(&mut wire).unwrap();

        let mut decoder = FrameDecoder::new(1024);
        let mut frames = Vec::new();
        for byte in wire.iter() {
            frames.extend(decoder.push(&[*byte]).unwrap());
        }
        assert_eq!(frames, vec![a, b]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_bad_eyecatcher() {
        let mut bytes = BytesMut::from(&data_frame(1, b"x").encode().unwrap()[..]);
        bytes[0] = 0xCA;
        let mut decoder = FrameDecoder::new(1024);
        assert!(matches!(decoder.push(&bytes), Err(JfapError::Framing(_))));
    }

    #[test]
    fn test_payload_limit() {
        let bytes = data_frame(1, b"0123456789").encode().unwrap();
        let mut decoder = FrameDecoder::new(4);
        assert!(decoder.push(&bytes).is_err());
    }

    #[test]
    fn test_invalid_header_fields() {
        let mut bytes = BytesMut::from(&data_frame(1, b"").encode().unwrap()[..]);
        bytes[7] = 17;
        assert!(FrameHeader::decode(&bytes).is_err());

        bytes[7] = 1;
        bytes[9] = 0x03;
        assert!(FrameHeader::decode(&bytes).is_err());

        bytes[9] = 0;
        bytes[8] = 0x03;
        assert!(FrameHeader::decode(&bytes).is_err());

        bytes[8] = 0;
        bytes[6] = 0x55;
        assert!(FrameHeader::decode(&bytes).is_err());
    }

    #[test]
    fn test_malformed_conversation_frame_is_skipped() {
        let mut wire = BytesMut::new();
        data_frame(1, b"spoiled").encode_into(&mut wire).unwrap();
        wire[9] = 0x03;
        let good = data_frame(3, b"intact");
        good.encode_into(&mut wire).unwrap();

        let mut decoder = FrameDecoder::new(1024);
        decoder.extend(&wire);
        match decoder.next_decoded().unwrap() {
            Some(Decoded::Malformed {
                conversation_id,
                error,
            }) => {
                assert_eq!(conversation_id, 1);
                assert!(matches!(error, JfapError::Framing(_)));
            },
            other => panic!("expected a malformed frame, got {other:?}"),
        }
        assert_eq!(decoder.next_frame().unwrap(), Some(good));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_malformed_connection_frame_is_fatal() {
        let mut bytes = BytesMut::from(&data_frame(0, b"x").encode().unwrap()[..]);
        bytes[6] = 0x55;
        let mut decoder = FrameDecoder::new(1024);
        decoder.extend(&bytes);
        assert!(matches!(decoder.next_decoded(), Err(JfapError::Framing(_))));
    }

    #[test]
    fn test_raised_payload_limit() {
        let bytes = data_frame(1, b"0123456789").encode().unwrap();
        let mut decoder = FrameDecoder::new(4);
        decoder.set_max_payload(16);
        assert_eq!(decoder.push(&bytes).unwrap().len(), 1);
    }
}
