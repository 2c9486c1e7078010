//! Server-Sent Events framing
//!
//! One frame on the wire:
//!
//! ```text
//! event: <event-type>
//! data: <json-payload>
//! <blank line>
//! ```
//!
//! Lines starting with `:` are comments (keep-alive heartbeats) and are
//! dropped by the decoder. Network chunks are not aligned to frames, so
//! [`FrameDecoder`] keeps any trailing partial frame until the next chunk,
//! up to [`MAX_PENDING_BYTES`].

use crate::events::ProgressEvent;
use crate::{Error, Result};

/// Event name assumed when a frame has no `event:` line
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// Largest partial frame the decoder holds before giving up on it
pub const MAX_PENDING_BYTES: usize = 8 * 1024 * 1024;

/// Serialize one event as a complete SSE frame
pub fn encode_frame(event: &ProgressEvent) -> Result<String> {
    let data = event.payload_json()?;
    Ok(format!("event: {}\ndata: {}\n\n", event.event_type(), data))
}

/// A decoded but not yet validated frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl RawFrame {
    /// Event label, defaulting to `message`
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or(DEFAULT_EVENT_TYPE)
    }

    /// Parse one frame body (without the trailing blank line).
    ///
    /// Returns `None` for comment-only frames.
    pub fn parse(block: &str) -> Option<Self> {
        let mut frame = RawFrame::default();
        let mut data_lines: Vec<&str> = Vec::new();
        let mut has_field = false;

        for line in block.split('\n') {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => {
                    frame.event = Some(value.to_string());
                    has_field = true;
                }
                "data" => {
                    data_lines.push(value);
                    has_field = true;
                }
                "id" => {
                    frame.id = Some(value.to_string());
                    has_field = true;
                }
                // retry and unknown fields carry nothing we use
                _ => {}
            }
        }

        if !has_field {
            return None;
        }
        frame.data = data_lines.join("\n");
        Some(frame)
    }
}

/// Incremental frame decoder, independent of chunk boundaries
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Offset from which the next delimiter search starts
    scan_from: usize,
    limit: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_PENDING_BYTES)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that holds at most `limit` bytes of an unfinished frame
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scan_from: 0,
            limit,
        }
    }

    /// Append a network chunk and return every frame it completes.
    ///
    /// If the unfinished remainder grows past the limit the decoder is reset
    /// and [`Error::StreamDesync`] is returned. Frames completed by that same
    /// chunk are dropped with it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<RawFrame>> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        while let Some(pos) = find_delimiter(&self.buffer, self.scan_from) {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            self.scan_from = 0;
            let text = String::from_utf8_lossy(&block[..pos]);
            if let Some(frame) = RawFrame::parse(&text) {
                frames.push(frame);
            }
        }
        if self.buffer.len() > self.limit {
            let pending = self.buffer.len();
            self.reset();
            return Err(Error::StreamDesync(format!(
                "unterminated frame exceeds {} bytes ({} pending)",
                self.limit, pending
            )));
        }
        // A delimiter may straddle the next chunk boundary
        self.scan_from = self.buffer.len().saturating_sub(1);
        Ok(frames)
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame (used when a connection is re-established)
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scan_from = 0;
    }
}

fn find_delimiter(buffer: &[u8], from: usize) -> Option<usize> {
    if buffer.len() < 2 {
        return None;
    }
    (from..buffer.len() - 1).find(|&i| buffer[i] == b'\n' && buffer[i + 1] == b'\n')
}

/// Validate a raw frame into a typed event.
///
/// `Ok(None)` means the frame is of a kind this client ignores.
pub fn decode_event(frame: &RawFrame) -> Result<Option<ProgressEvent>> {
    ProgressEvent::from_parts(frame.event_type(), &frame.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::QueueStatus;

    fn status_frame() -> String {
        encode_frame(&ProgressEvent::QueueStatus(QueueStatus {
            pending: 2,
            queued: 0,
            processing: 1,
            is_processing: true,
            total_in_queue: 1,
        }))
        .unwrap()
    }

    #[test]
    fn test_encode_frame_layout() {
        let frame = status_frame();
        assert!(frame.starts_with("event: queue_status\ndata: {"));
        assert!(frame.ends_with("}\n\n"));
        assert_eq!(frame.matches('\n').count(), 3);
    }

    #[test]
    fn test_whole_frame_decodes() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(status_frame().as_bytes()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type(), "queue_status");
        let event = decode_event(&frames[0]).unwrap().unwrap();
        assert!(matches!(event, ProgressEvent::QueueStatus(s) if s.processing == 1));
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let wire = status_frame();
        let (head, tail) = wire.split_at(wire.len() - 1);
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(head.as_bytes()).unwrap().is_empty());
        assert!(decoder.pending_bytes() > 0);
        assert_eq!(decoder.push(tail.as_bytes()).unwrap().len(), 1);
    }

    #[test]
    fn test_byte_at_a_time_matches_whole() {
        let wire = format!("{}{}", status_frame(), status_frame());
        let mut whole = FrameDecoder::new();
        let expected = whole.push(wire.as_bytes()).unwrap();

        let mut split = FrameDecoder::new();
        let mut got = Vec::new();
        for byte in wire.as_bytes() {
            got.extend(split.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(expected, got);
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_comments_and_crlf() {
        let wire = concat!(
            ": heartbeat\n\n",
            "event: queue_status\r\n",
            "data: {\"pending\":0,\"queued\":0,\"processing\":0,",
            "\"isProcessing\":false,\"totalInQueue\":0}\r\n\r\n",
        );
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(wire.as_bytes()).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(decode_event(&frames[0]).unwrap().is_some());
    }

    #[test]
    fn test_multiline_data_is_joined() {
        let frame = RawFrame::parse("event: note\ndata: first\ndata:second").unwrap();
        assert_eq!(frame.data, "first\nsecond");
        assert_eq!(frame.event_type(), "note");
    }

    #[test]
    fn test_frame_without_event_defaults_to_message() {
        let frame = RawFrame::parse("data: {}").unwrap();
        assert_eq!(frame.event_type(), DEFAULT_EVENT_TYPE);
        assert!(decode_event(&frame).unwrap().is_none());
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let wire = "event: x\ndata: \"Şartname İdari\"\n\n".as_bytes();
        // split inside the two-byte 'Ş'
        let cut = wire.iter().position(|b| *b == 0xC5).unwrap() + 1;
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&wire[..cut]).unwrap().is_empty());
        let frames = decoder.push(&wire[cut..]).unwrap();
        assert_eq!(frames[0].data, "\"Şartname İdari\"");
    }

    #[test]
    fn test_oversized_partial_frame_resets_decoder() {
        let mut decoder = FrameDecoder::with_limit(64);
        let err = decoder.push(&[b'x'; 65]).unwrap_err();
        assert!(matches!(err, Error::StreamDesync(_)));
        assert_eq!(decoder.pending_bytes(), 0);

        // The rest of the oversized frame parses to nothing, then frames resume
        assert!(decoder.push(b"tail\n\n").unwrap().is_empty());
        assert_eq!(decoder.push(status_frame().as_bytes()).unwrap().len(), 1);
    }

    #[test]
    fn test_limit_only_counts_unfinished_bytes() {
        let wire = status_frame().repeat(4);
        let mut decoder = FrameDecoder::with_limit(wire.len() / 2);
        assert_eq!(decoder.push(wire.as_bytes()).unwrap().len(), 4);
    }
}
