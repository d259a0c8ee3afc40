//! Message chunking and reassembly.
//!
//! Large messages are split into `FIRST`, zero or more `MIDDLE`, and `LAST`
//! frames. Chunks of one message are queued together, but a frame of higher
//! priority on the same conversation may be written between them, so
//! reassembly is keyed by `(conversation, priority)`.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use super::frame::ChunkFlag;
use crate::error::{JfapError, Result};

/// Splits outbound payloads into chunks.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    threshold: usize,
    chunk_size: usize,
}

impl Chunker {
    /// Chunk payloads of at least `threshold` bytes, or larger than
    /// `chunk_size`, into pieces of at most `chunk_size` bytes.
    pub fn new(threshold: usize, chunk_size: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Whether a payload of `len` bytes is sent in chunks
    pub fn needs_chunking(&self, len: usize) -> bool {
        len >= 2 && (len >= self.threshold || len > self.chunk_size)
    }

    /// Split a payload. Unchunked payloads come back as a single `Whole` piece.
    pub fn split(&self, payload: Bytes) -> Vec<(ChunkFlag, Bytes)> {
        let len = payload.len();
        if !self.needs_chunking(len) {
            return vec![(ChunkFlag::Whole, payload)];
        }

        // At least two pieces, so FIRST and LAST both exist.
        let size = self.chunk_size.min((len + 1) / 2);
        let count = (len + size - 1) / size;

        (0..count)
            .map(|i| {
                let start = i * size;
                let end = (start + size).min(len);
                let flag = match i {
                    0 => ChunkFlag::First,
                    i if i == count - 1 => ChunkFlag::Last,
                    _ => ChunkFlag::Middle,
                };
                (flag, payload.slice(start..end))
            })
            .collect()
    }
}

/// Reassembles inbound chunks per `(conversation, priority)`.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: HashMap<(u32, u8), BytesMut>,
    max_message_size: usize,
}

impl Reassembler {
    /// Reassembler rejecting messages above `max_message_size`
    pub fn new(max_message_size: usize) -> Self {
        Self {
            partial: HashMap::new(),
            max_message_size,
        }
    }

    /// Accept one frame's payload. Returns the complete message once the
    /// `LAST` chunk (or an unchunked frame) arrives.
    ///
    /// A `MIDDLE`/`LAST` without a preceding `FIRST`, or a `FIRST` while a
    /// message is still open, is a framing error for the conversation.
    pub fn accept(
        &mut self,
        conversation_id: u32,
        priority: u8,
        chunk: ChunkFlag,
        payload: Bytes,
    ) -> Result<Option<Bytes>> {
        let key = (conversation_id, priority);
        match chunk {
            ChunkFlag::Whole => {
                if self.partial.contains_key(&key) {
                    self.partial.remove(&key);
                    return Err(JfapError::Framing(format!(
                        "unchunked frame inside chunked message on conversation {conversation_id}"
                    )));
                }
                Ok(Some(payload))
            },
            ChunkFlag::First => {
                if self.partial.remove(&key).is_some() {
                    return Err(JfapError::Framing(format!(
                        "FIRST chunk before previous message completed on conversation {conversation_id}"
                    )));
                }
                self.check_size(conversation_id, payload.len())?;
                self.partial.insert(key, BytesMut::from(&payload[..]));
                Ok(None)
            },
            ChunkFlag::Middle | ChunkFlag::Last => {
                let Some(mut buf) = self.partial.remove(&key) else {
                    return Err(JfapError::Framing(format!(
                        "{chunk:?} chunk without FIRST on conversation {conversation_id}"
                    )));
                };
                self.check_size(conversation_id, buf.len() + payload.len())?;
                buf.extend_from_slice(&payload);
                if chunk == ChunkFlag::Last {
                    Ok(Some(buf.freeze()))
                } else {
                    self.partial.insert(key, buf);
                    Ok(None)
                }
            },
        }
    }

    fn check_size(&self, conversation_id: u32, len: usize) -> Result<()> {
        if len > self.max_message_size {
            return Err(JfapError::Framing(format!(
                "chunked message of {len} bytes exceeds maximum {} on conversation {conversation_id}",
                self.max_message_size
            )));
        }
        Ok(())
    }

    /// Drop partial messages of a conversation
    pub fn discard(&mut self, conversation_id: u32) {
        self.partial.retain(|(conv, _), _| *conv != conversation_id);
    }

    /// Number of messages being reassembled
    pub fn in_progress(&self) -> usize {
        self.partial.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    fn roundtrip(chunker: &Chunker, len: usize) -> Vec<ChunkFlag> {
        let original = payload(len);
        let pieces = chunker.split(original.clone());
        let flags: Vec<ChunkFlag> = pieces.iter().map(|(f, _)| *f).collect();

        let mut reassembler = Reassembler::new(usize::MAX);
        let mut out = None;
        for (flag, piece) in pieces {
            assert!(out.is_none());
            out = reassembler.accept(1, 3, flag, piece).unwrap();
        }
        assert_eq!(out.unwrap(), original);
        assert_eq!(reassembler.in_progress(), 0);
        flags
    }

    #[test]
    fn test_threshold_boundaries() {
        let chunker = Chunker::new(1000, 256);
        for len in [1000, 1001, 256 * 8, 256 * 8 + 1] {
            let flags = roundtrip(&chunker, len);
            assert_eq!(flags.first(), Some(&ChunkFlag::First));
            assert_eq!(flags.last(), Some(&ChunkFlag::Last));
            assert!(flags[1..flags.len() - 1]
                .iter()
                .all(|f| *f == ChunkFlag::Middle));
        }
        assert_eq!(roundtrip(&chunker, 200), vec![ChunkFlag::Whole]);
    }

    #[test]
    fn test_threshold_below_chunk_size_still_splits() {
        let chunker = Chunker::new(10, 1024);
        assert_eq!(roundtrip(&chunker, 10), vec![ChunkFlag::First, ChunkFlag::Last]);
    }

    #[test]
    fn test_oversized_payload_chunked_below_threshold() {
        let chunker = Chunker::new(1_024_000, 100);
        assert!(chunker.needs_chunking(101));
        assert_eq!(roundtrip(&chunker, 250).len(), 3);
    }

    #[test]
    fn test_middle_without_first() {
        let mut r = Reassembler::new(1024);
        assert!(matches!(
            r.accept(5, 1, ChunkFlag::Middle, Bytes::from_static(b"x")),
            Err(JfapError::Framing(_))
        ));
        assert!(r.accept(5, 1, ChunkFlag::Last, Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_interleaved_priorities() {
        let mut r = Reassembler::new(1024);
        assert!(r
            .accept(1, 2, ChunkFlag::First, Bytes::from_static(b"ab"))
            .unwrap()
            .is_none());
        // Higher priority frame on the same conversation passes straight through.
        assert_eq!(
            r.accept(1, 9, ChunkFlag::Whole, Bytes::from_static(b"urgent"))
                .unwrap(),
            Some(Bytes::from_static(b"urgent"))
        );
        assert_eq!(
            r.accept(1, 2, ChunkFlag::Last, Bytes::from_static(b"cd"))
                .unwrap(),
            Some(Bytes::from_static(b"abcd"))
        );
    }

    #[test]
    fn test_size_limit_and_discard() {
        let mut r = Reassembler::new(4);
        r.accept(1, 1, ChunkFlag::First, Bytes::from_static(b"abc"))
            .unwrap();
        assert!(r.accept(1, 1, ChunkFlag::Last, Bytes::from_static(b"de")).is_err());

        r.accept(2, 1, ChunkFlag::First, Bytes::from_static(b"a"))
            .unwrap();
        r.discard(2);
        assert_eq!(r.in_progress(), 0);
    }
}
