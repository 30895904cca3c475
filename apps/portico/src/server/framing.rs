//! Native-messaging frame decoding for traffic inspection.
//!
//! The wire format is a 4-byte little-endian length prefix followed by that
//! many bytes of UTF-8 JSON, repeated. The decoder reassembles frames from
//! however the copy loop happens to chunk the stream: a length prefix split
//! across reads, a payload spread over many reads, several frames in one
//! read. Decoding is diagnostics only; it never feeds back into the copy and
//! never terminates it.

use serde_json::Value;
use tracing::{info, warn};

/// Frames claiming to be larger than this are treated as a framing desync:
/// decoding for the rest of the stream direction is abandoned rather than
/// buffering forever waiting for bytes that will never line up again.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes flowing from the extension to the native app.
    ToApp,
    /// Bytes flowing from the native app back to the extension.
    ToExtension,
}

impl Direction {
    pub fn label(&self) -> &'static str {
        match self {
            Direction::ToApp => "extension->app",
            Direction::ToExtension => "app->extension",
        }
    }
}

/// Incremental frame reassembler. One instance per stream direction; state
/// carries across `feed` calls and is never shared between connections.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    header: [u8; 4],
    header_len: usize,
    expected: Option<usize>,
    payload: Vec<u8>,
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the decoder has given up on this stream direction.
    pub fn poisoned(&self) -> bool {
        self.poisoned
    }

    /// Consumes a chunk of the stream, invoking `on_frame` for every payload
    /// completed by it.
    pub fn feed(&mut self, mut chunk: &[u8], on_frame: &mut dyn FnMut(&[u8])) {
        while !chunk.is_empty() && !self.poisoned {
            match self.expected {
                None => {
                    let need = self.header.len() - self.header_len;
                    let take = need.min(chunk.len());
                    self.header[self.header_len..self.header_len + take]
                        .copy_from_slice(&chunk[..take]);
                    self.header_len += take;
                    chunk = &chunk[take..];
                    if self.header_len == self.header.len() {
                        self.header_len = 0;
                        let declared = u32::from_le_bytes(self.header) as usize;
                        if declared > MAX_FRAME_LEN {
                            self.poisoned = true;
                            warn!(
                                declared,
                                "frame length exceeds the decode cap; giving up on this stream"
                            );
                            return;
                        }
                        self.expected = Some(declared);
                        self.payload.clear();
                    }
                }
                Some(declared) => {
                    let take = (declared - self.payload.len()).min(chunk.len());
                    self.payload.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                    if self.payload.len() == declared {
                        self.expected = None;
                        on_frame(&self.payload);
                    }
                }
            }
        }
    }
}

/// Decoder plus the logging that makes it useful: pretty-prints each decoded
/// message tagged with direction and extension id.
#[derive(Debug)]
pub struct StreamSniffer {
    decoder: FrameDecoder,
    direction: Direction,
    extension: String,
}

impl StreamSniffer {
    pub fn new(direction: Direction, extension: impl Into<String>) -> Self {
        Self {
            decoder: FrameDecoder::new(),
            direction,
            extension: extension.into(),
        }
    }

    pub fn observe(&mut self, chunk: &[u8]) {
        let direction = self.direction;
        let extension = &self.extension;
        self.decoder.feed(chunk, &mut |payload| {
            log_frame(direction, extension, payload);
        });
    }
}

fn log_frame(direction: Direction, extension: &str, payload: &[u8]) {
    match serde_json::from_slice::<Value>(payload) {
        Ok(value) => {
            let pretty =
                serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
            info!(
                extension = %extension,
                direction = direction.label(),
                "message:\n{pretty}"
            );
        }
        Err(err) => {
            // A frame that isn't JSON is logged raw; framing is still intact
            // because the boundary came from the length prefix.
            warn!(
                extension = %extension,
                direction = direction.label(),
                error = %err,
                "frame is not valid JSON: {:?}",
                String::from_utf8_lossy(payload)
            );
        }
    }
}
