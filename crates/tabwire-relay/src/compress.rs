//! Optional gzip for large outbound frames.
//!
//! The frame type carries the signal: binary frames are gzip, text frames
//! are plain JSON.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{self, Read, Write};
use tokio_tungstenite::tungstenite::Message;

/// Turns serialized envelopes into frames, compressing when it pays off.
#[derive(Debug)]
pub struct Compressor {
    enabled: bool,
    threshold: usize,
    buf: Vec<u8>,
}

impl Compressor {
    pub fn new(enabled: bool, threshold: usize) -> Self {
        Self {
            enabled,
            threshold,
            buf: Vec::new(),
        }
    }

    /// Frame `text`, as gzip if enabled, above threshold and actually smaller.
    pub fn encode(&mut self, text: String) -> io::Result<Message> {
        if !self.enabled || text.len() <= self.threshold {
            return Ok(Message::Text(text.into()));
        }

        self.buf.clear();
        let mut encoder = GzEncoder::new(&mut self.buf, Compression::default());
        encoder.write_all(text.as_bytes())?;
        encoder.finish()?;

        if self.buf.len() < text.len() {
            // The frame takes the bytes; the replacement is sized for the next one.
            let len = self.buf.len();
            let frame = std::mem::replace(&mut self.buf, Vec::with_capacity(len));
            Ok(Message::binary(frame))
        } else {
            Ok(Message::Text(text.into()))
        }
    }
}

/// Inflate a binary frame back into JSON text.
pub fn decompress(bytes: &[u8]) -> io::Result<String> {
    let mut text = String::new();
    GzDecoder::new(bytes).read_to_string(&mut text)?;
    Ok(text)
}
