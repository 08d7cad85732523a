//! Incremental decoder for the backend's event stream.
//!
//! The transport delivers arbitrarily sized byte chunks; frames are
//! blank-line delimited and carry their payload on `data:` field lines.
//! The decoder buffers bytes until a delimiter lands, then emits every
//! complete frame the buffer holds, keeping the unterminated remainder
//! for the next chunk.

use memchr::memmem;

use crate::core::event::DecodeError;

const FRAME_DELIMITER: &[u8] = b"\n\n";

#[derive(Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport chunk and collect the payloads of every frame it
    /// completes. Whitespace-only frames are dropped without notice; frames
    /// that never carry a `data:` field surface as decode errors so the
    /// caller can log them and move on.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, DecodeError>> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(pos) = memmem::find(&self.buffer, FRAME_DELIMITER) {
            let frame: Vec<u8> = self.buffer.drain(..pos + FRAME_DELIMITER.len()).collect();
            let frame = &frame[..pos];
            match std::str::from_utf8(frame) {
                Ok(text) => {
                    if let Some(payload) = extract_payload(text) {
                        payloads.push(payload);
                    }
                }
                Err(source) => payloads.push(Err(DecodeError::InvalidUtf8(source))),
            }
        }
        payloads
    }

    /// Bytes still waiting for a delimiter. A non-empty remainder at
    /// end-of-stream is a truncated frame and is simply discarded with the
    /// decoder.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Pull the payload out of one complete frame. Multiple `data:` lines are
/// joined with newlines, per the SSE field rules.
fn extract_payload(frame: &str) -> Option<Result<String, DecodeError>> {
    if frame.trim().is_empty() {
        return None;
    }

    let mut data_lines = Vec::new();
    for line in frame.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim_start());
        }
    }

    if data_lines.is_empty() {
        Some(Err(DecodeError::MissingDataField {
            frame: frame.to_string(),
        }))
    } else {
        Some(Ok(data_lines.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_ok(results: Vec<Result<String, DecodeError>>) -> Vec<String> {
        results
            .into_iter()
            .map(|r| r.expect("expected well-formed frame"))
            .collect()
    }

    #[test]
    fn whole_stream_decodes_every_frame() {
        let mut decoder = FrameDecoder::new();
        let stream = b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\ndata: {\"c\":3}\n\n";
        let frames = collect_ok(decoder.push(stream));
        assert_eq!(frames, vec!["{\"a\":1}", "{\"b\":2}", "{\"c\":3}"]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn chunk_boundaries_do_not_change_the_decoded_sequence() {
        let stream = "data: {\"type\":\"token\",\"content\":\"héllo\"}\n\ndata: {\"type\":\"thinking\",\"content\":\"hmm\"}\n\ndata: {\"type\":\"done\"}\n\n".as_bytes();

        let mut whole = FrameDecoder::new();
        let expected = collect_ok(whole.push(stream));

        for split in 0..=stream.len() {
            let mut decoder = FrameDecoder::new();
            let mut frames = collect_ok(decoder.push(&stream[..split]));
            frames.extend(collect_ok(decoder.push(&stream[split..])));
            assert_eq!(frames, expected, "split at byte {split} diverged");
        }
    }

    #[test]
    fn delimiter_split_across_chunks_still_terminates_the_frame() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: one\n").is_empty());
        let frames = collect_ok(decoder.push(b"\ndata: two\n\n"));
        assert_eq!(frames, vec!["one", "two"]);
    }

    #[test]
    fn whitespace_only_frames_are_dropped() {
        let mut decoder = FrameDecoder::new();
        let results = decoder.push(b"   \n\ndata: kept\n\n");
        let frames = collect_ok(results);
        assert_eq!(frames, vec!["kept"]);
    }

    #[test]
    fn frames_without_a_data_field_are_decode_errors() {
        let mut decoder = FrameDecoder::new();
        let mut results = decoder.push(b"event: ping\n\n");
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results.remove(0),
            Err(DecodeError::MissingDataField { .. })
        ));
    }

    #[test]
    fn multiple_data_lines_join_with_newlines() {
        let mut decoder = FrameDecoder::new();
        let frames = collect_ok(decoder.push(b"data: first\ndata: second\n\n"));
        assert_eq!(frames, vec!["first\nsecond"]);
    }

    #[test]
    fn truncated_remainder_is_left_pending() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: never finished").is_empty());
        assert!(decoder.pending() > 0);
    }
}
