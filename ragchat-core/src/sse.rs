//! Incremental Server-Sent-Events frame decoder.
//!
//! Remote chat-completion backends stream their response as a sequence of
//! `data: <json>\n\n` (optionally prefixed by `event: <name>\n`) frames over
//! an HTTP byte stream that arrives in arbitrarily-sized chunks — a frame
//! boundary never lines up with a `bytes_stream()` poll. This decoder buffers
//! partial frames and yields only complete ones, so callers never see a
//! half-written JSON payload.

use anyhow::Result;
use serde::de::DeserializeOwned;

/// One decoded SSE frame.
#[derive(Debug, Clone, Default)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// True for the conventional `data: [DONE]` terminator used by
    /// OpenAI-compatible chat-completions streams.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// Parse this frame's `data` payload as JSON.
    pub fn try_parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// Stateful decoder: feed it raw bytes as they arrive, drain complete frames.
#[derive(Default)]
pub struct SseDecoder {
    buf: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of raw bytes and return every complete frame it produced.
    /// Bytes belonging to a not-yet-terminated frame remain buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        // Frames are separated by a blank line; process every complete block,
        // keep the trailing partial block (if any) buffered.
        while let Some(boundary) = find_blank_line(&self.buf) {
            let block: String = self.buf.drain(..boundary).collect();
            // Drop the blank-line separator itself (either "\n\n" or "\r\n\r\n").
            consume_blank_line(&mut self.buf);

            if let Some(frame) = parse_block(&block) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn find_blank_line(buf: &str) -> Option<usize> {
    buf.find("\n\n").map(|i| i).or_else(|| buf.find("\r\n\r\n"))
}

fn consume_blank_line(buf: &mut String) {
    if buf.starts_with("\r\n\r\n") {
        buf.drain(..4);
    } else if buf.starts_with("\n\n") {
        buf.drain(..2);
    } else if buf.starts_with("\n") {
        buf.drain(..1);
    }
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data_lines = Vec::new();

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_frame() {
        let mut dec = SseDecoder::new();
        let frames = dec.push(b"data: {\"a\":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"a\":1}");
    }

    #[test]
    fn buffers_split_frame_across_chunks() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"data: {\"a\":").is_empty());
        let frames = dec.push(b"1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"a\":1}");
    }

    #[test]
    fn decodes_done_sentinel() {
        let mut dec = SseDecoder::new();
        let frames = dec.push(b"data: [DONE]\n\n");
        assert!(frames[0].is_done());
    }

    #[test]
    fn decodes_event_name() {
        let mut dec = SseDecoder::new();
        let frames = dec.push(b"event: delta\ndata: {\"x\":true}\n\n");
        assert_eq!(frames[0].event.as_deref(), Some("delta"));
    }

    #[test]
    fn decodes_multiple_frames_in_one_chunk() {
        let mut dec = SseDecoder::new();
        let frames = dec.push(b"data: {\"a\":1}\n\ndata: {\"a\":2}\n\n");
        assert_eq!(frames.len(), 2);
    }
}
