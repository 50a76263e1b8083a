//! Length-prefixed message framing.
//!
//! # Wire Format
//! ```text
//! DELIM + decimal payload length + DELIM + payload bytes
//! e.g. "&5&hello"
//! ```
//!
//! # Responsibilities
//! - Encode payloads into frames
//! - Reassemble frames from arbitrarily split reads (per-channel decoder)
//! - Resynchronize after a malformed header
//!
//! # Design Decisions
//! - Payloads are raw bytes; the wire charset is single-byte (ISO-8859-1),
//!   so byte arrays round-trip exactly and lengths are byte counts
//! - A malformed size consumes both delimiters and emits nothing. Whatever
//!   payload followed is lost until the next valid header. This is lossy and
//!   can desynchronize a channel under unlucky byte patterns; it is kept for
//!   wire compatibility with existing peers.

use thiserror::Error;

use crate::config::FramingConfig;
use crate::observability::metrics;

/// Default header delimiter.
pub const DEFAULT_DELIMITER: &str = "&";

/// Longest size field accepted before the header is declared malformed.
const MAX_HEADER_DIGITS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("delimiter {0:?} must be non-empty and must not contain digits")]
    InvalidDelimiter(String),
}

/// Frame encoder and decoder factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameCodec {
    delimiter: Vec<u8>,
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the given delimiter and frame size limit.
    ///
    /// The delimiter must be non-empty and digit-free, otherwise headers
    /// cannot be told apart from their size field.
    pub fn new(delimiter: &str, max_frame_size: usize) -> Result<Self, FramingError> {
        if delimiter.is_empty() || delimiter.bytes().any(|b| b.is_ascii_digit()) {
            return Err(FramingError::InvalidDelimiter(delimiter.to_string()));
        }
        Ok(Self {
            delimiter: delimiter.as_bytes().to_vec(),
            max_frame_size,
        })
    }

    pub fn from_config(config: &FramingConfig) -> Result<Self, FramingError> {
        Self::new(&config.delimiter, config.max_frame_size)
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode one payload into a fresh frame.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 2 * self.delimiter.len() + 10);
        self.encode_into(payload, &mut out);
        out
    }

    /// Append one encoded frame to `out`.
    pub fn encode_into(&self, payload: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(&self.delimiter);
        out.extend_from_slice(payload.len().to_string().as_bytes());
        out.extend_from_slice(&self.delimiter);
        out.extend_from_slice(payload);
    }

    /// Create a decoder with an empty partial buffer.
    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder {
            codec: self.clone(),
            partial: Vec::new(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER.as_bytes().to_vec(),
            max_frame_size: FramingConfig::default().max_frame_size,
        }
    }
}

/// Per-channel frame decoder holding the bytes of an incomplete frame.
#[derive(Debug)]
pub struct FrameDecoder {
    codec: FrameCodec,
    partial: Vec<u8>,
}

/// Outcome of parsing one header at a position.
enum Header {
    /// Header complete and valid: payload size and payload start offset.
    Valid { size: usize, body: usize },
    /// Header complete but unusable: offset to resume scanning from.
    Malformed { resume: usize },
    /// More bytes are needed.
    Incomplete,
}

impl FrameDecoder {
    /// Feed newly read bytes and return every frame they complete, in order.
    pub fn process_data(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.partial.extend_from_slice(data);

        let mut frames = Vec::new();
        let mut pos = 0;
        let delim_len = self.codec.delimiter.len();

        loop {
            let Some(start) = find(&self.partial[pos..], &self.codec.delimiter).map(|i| pos + i) else {
                // No header start in the tail; only a split delimiter can be worth keeping.
                pos = pos.max(self.partial.len().saturating_sub(delim_len - 1));
                break;
            };

            match self.parse_header(start) {
                Header::Valid { size, body } => {
                    if self.partial.len() - body < size {
                        pos = start;
                        break;
                    }
                    frames.push(self.partial[body..body + size].to_vec());
                    pos = body + size;
                }
                Header::Malformed { resume } => {
                    tracing::warn!(
                        header = %String::from_utf8_lossy(&self.partial[start..resume]),
                        "Malformed frame header, resynchronizing"
                    );
                    metrics::record_malformed_header();
                    pos = resume;
                }
                Header::Incomplete => {
                    pos = start;
                    break;
                }
            }
        }

        self.partial.drain(..pos);
        frames
    }

    fn parse_header(&self, start: usize) -> Header {
        let delim = &self.codec.delimiter;
        let field_start = start + delim.len();
        let Some(end) = find(&self.partial[field_start..], delim).map(|i| field_start + i) else {
            if self.partial.len() - field_start > MAX_HEADER_DIGITS {
                // The size field can never close within bounds; drop the opening delimiter.
                return Header::Malformed { resume: field_start };
            }
            return Header::Incomplete;
        };

        let body = end + delim.len();
        match parse_size(&self.partial[field_start..end]) {
            Some(size) if size <= self.codec.max_frame_size => Header::Valid { size, body },
            _ => Header::Malformed { resume: body },
        }
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered_len(&self) -> usize {
        self.partial.len()
    }

    /// Drop any partially received frame.
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

fn parse_size(field: &[u8]) -> Option<usize> {
    if field.is_empty() || field.len() > MAX_HEADER_DIGITS || !field.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(field).ok()?.parse().ok()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    match needle {
        [byte] => haystack.iter().position(|b| b == byte),
        _ => haystack.windows(needle.len()).position(|w| w == needle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn codec() -> FrameCodec {
        FrameCodec::default()
    }

    #[test]
    fn encodes_header_then_payload() {
        assert_eq!(codec().encode(b"hello"), b"&5&hello".to_vec());
        assert_eq!(codec().encode(b""), b"&0&".to_vec());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let codec = codec();
        let mut wire = codec.encode(b"one");
        codec.encode_into(b"two", &mut wire);
        codec.encode_into(b"", &mut wire);

        let mut decoder = codec.decoder();
        assert_eq!(
            decoder.process_data(&wire),
            vec![b"one".to_vec(), b"two".to_vec(), Vec::new()]
        );
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn payload_may_contain_delimiter() {
        let codec = codec();
        let mut decoder = codec.decoder();
        assert_eq!(decoder.process_data(&codec.encode(b"a&1&b")), vec![b"a&1&b".to_vec()]);
    }

    #[test]
    fn holds_partial_frame_until_complete() {
        let codec = codec();
        let mut decoder = codec.decoder();
        assert!(decoder.process_data(b"&11&hello").is_empty());
        assert_eq!(decoder.buffered_len(), 9);
        assert_eq!(decoder.process_data(b" world"), vec![b"hello world".to_vec()]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn malformed_header_is_discarded_once() {
        let codec = codec();
        let mut decoder = codec.decoder();
        let mut wire = b"&xyz&".to_vec();
        wire.extend_from_slice(&codec.encode(b"payload"));
        assert_eq!(decoder.process_data(&wire), vec![b"payload".to_vec()]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn malformed_header_drops_following_bytes() {
        // The bytes after a garbage header are swallowed until the next header.
        let mut decoder = codec().decoder();
        assert_eq!(decoder.process_data(b"&zz&lost&2&ok"), vec![b"ok".to_vec()]);
    }

    #[test]
    fn garbage_before_header_is_skipped() {
        let mut decoder = codec().decoder();
        assert_eq!(decoder.process_data(b"noise&2&hi"), vec![b"hi".to_vec()]);
    }

    #[test]
    fn oversized_frame_is_malformed() {
        let codec = FrameCodec::new("&", 4).unwrap();
        let mut decoder = codec.decoder();
        assert_eq!(decoder.process_data(b"&5&hello&2&ok"), vec![b"ok".to_vec()]);
    }

    #[test]
    fn unterminated_header_is_bounded() {
        let mut decoder = codec().decoder();
        let garbage = vec![b'9'; 64];
        let mut wire = b"&".to_vec();
        wire.extend_from_slice(&garbage);
        assert!(decoder.process_data(&wire).is_empty());
        assert!(decoder.buffered_len() <= MAX_HEADER_DIGITS + 1);
    }

    #[test]
    fn multi_byte_delimiter() {
        let codec = FrameCodec::new("##", 1024).unwrap();
        let wire = codec.encode(b"x#y");
        assert_eq!(wire, b"##3##x#y".to_vec());

        let mut decoder = codec.decoder();
        assert!(decoder.process_data(&wire[..1]).is_empty());
        assert_eq!(decoder.process_data(&wire[1..]), vec![b"x#y".to_vec()]);
    }

    #[test]
    fn unusable_delimiters_are_rejected() {
        assert_eq!(FrameCodec::new("", 16), Err(FramingError::InvalidDelimiter(String::new())));
        assert!(FrameCodec::new("&1", 16).is_err());
        assert!(FrameCodec::from_config(&FramingConfig::default()).is_ok());
    }

    #[test]
    fn clear_discards_partial() {
        let mut decoder = codec().decoder();
        decoder.process_data(b"&10&abc");
        decoder.clear();
        assert_eq!(decoder.buffered_len(), 0);
    }

    proptest! {
        #[test]
        fn round_trip(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
            let codec = codec();
            let mut decoder = codec.decoder();
            prop_assert_eq!(decoder.process_data(&codec.encode(&payload)), vec![payload]);
        }

        #[test]
        fn split_reads_reconstruct(
            first in proptest::collection::vec(any::<u8>(), 0..256),
            second in proptest::collection::vec(any::<u8>(), 0..256),
            split in any::<prop::sample::Index>(),
        ) {
            let codec = codec();
            let mut wire = codec.encode(&first);
            codec.encode_into(&second, &mut wire);
            let at = split.index(wire.len() + 1);

            let mut decoder = codec.decoder();
            let mut frames = decoder.process_data(&wire[..at]);
            frames.extend(decoder.process_data(&wire[at..]));
            prop_assert_eq!(frames, vec![first, second]);
        }
    }
}
