//! Incremental UTF-8 decoding
//!
//! Byte chunks arrive with arbitrary boundaries, so a multi-byte character may
//! be split across two reads. The decoder holds back an incomplete trailing
//! sequence until the next chunk completes it.

use tracing::warn;

const REPLACEMENT: char = '\u{FFFD}';
const BOM: char = '\u{FEFF}';

/// Stateful UTF-8 decoder for a single byte stream.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    /// Bytes of an incomplete sequence carried into the next chunk (at most 3).
    pending: Vec<u8>,
    /// Invalid sequences replaced with U+FFFD so far.
    malformed: u64,
    /// Cleared once the first character has been produced.
    at_start: bool,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            malformed: 0,
            at_start: true,
        }
    }

    /// Number of invalid byte sequences replaced so far.
    pub fn malformed_sequences(&self) -> u64 {
        self.malformed
    }

    /// Decode the next chunk, returning every complete character.
    ///
    /// Invalid sequences become U+FFFD. A leading byte-order mark at the very
    /// start of the stream is dropped.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let joined;
        let mut rest: &[u8] = if self.pending.is_empty() {
            chunk
        } else {
            let mut buf = std::mem::take(&mut self.pending);
            buf.extend_from_slice(chunk);
            joined = buf;
            &joined
        };

        let mut out = String::with_capacity(rest.len());
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                },
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));

                    match err.error_len() {
                        Some(len) => {
                            self.record_malformed(len);
                            out.push(REPLACEMENT);
                            rest = &tail[len..];
                        },
                        None => {
                            // Incomplete sequence at the end of the chunk
                            self.pending.extend_from_slice(tail);
                            break;
                        },
                    }
                },
            }
        }

        self.strip_bom(out)
    }

    /// Flush the decoder at end of stream.
    ///
    /// An incomplete sequence left over from the last chunk decodes to a
    /// single U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }

        let len = self.pending.len();
        self.pending.clear();
        self.record_malformed(len);
        self.strip_bom(REPLACEMENT.to_string())
    }

    fn record_malformed(&mut self, len: usize) {
        self.malformed += 1;
        if self.malformed == 1 {
            warn!(bytes = len, "Invalid UTF-8 in input, substituting U+FFFD");
        }
    }

    fn strip_bom(&mut self, mut text: String) -> String {
        if self.at_start && !text.is_empty() {
            self.at_start = false;
            if text.starts_with(BOM) {
                text.drain(..BOM.len_utf8());
            }
        }
        text
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passthrough() {
        let mut decoder = Utf8StreamDecoder::new();
        assert_eq!(decoder.decode(b"a,b\n"), "a,b\n");
        assert_eq!(decoder.finish(), "");
        assert_eq!(decoder.malformed_sequences(), 0);
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        // "é" is 0xC3 0xA9, "€" is 0xE2 0x82 0xAC
        let bytes = "é€".as_bytes();
        for split in 0..=bytes.len() {
            let mut decoder = Utf8StreamDecoder::new();
            let mut text = decoder.decode(&bytes[..split]);
            text.push_str(&decoder.decode(&bytes[split..]));
            text.push_str(&decoder.finish());
            assert_eq!(text, "é€", "split at {split}");
            assert_eq!(decoder.malformed_sequences(), 0);
        }
    }

    #[test]
    fn test_four_byte_char_one_byte_at_a_time() {
        let bytes = "x🦀y".as_bytes();
        let mut decoder = Utf8StreamDecoder::new();
        let text: String = bytes.iter().map(|b| decoder.decode(&[*b])).collect();
        assert_eq!(text, "x🦀y");
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut decoder = Utf8StreamDecoder::new();
        assert_eq!(decoder.decode(b"a\xFFb"), "a\u{FFFD}b");
        assert_eq!(decoder.malformed_sequences(), 1);
    }

    #[test]
    fn test_truncated_sequence_at_end_of_stream() {
        let mut decoder = Utf8StreamDecoder::new();
        assert_eq!(decoder.decode(b"ok\xE2\x82"), "ok");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert_eq!(decoder.malformed_sequences(), 1);
    }

    #[test]
    fn test_leading_bom_is_dropped_even_when_split() {
        let mut decoder = Utf8StreamDecoder::new();
        let mut text = decoder.decode(b"\xEF\xBB");
        text.push_str(&decoder.decode(b"\xBFid\n"));
        assert_eq!(text, "id\n");

        // Only at the start of the stream
        assert_eq!(decoder.decode("\u{FEFF}x".as_bytes()), "\u{FEFF}x");
    }
}
