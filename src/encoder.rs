//! Envelope encoding for the forward protocol.
//!
//! Each event becomes a MessagePack array `[tag, time, record]`. MessagePack
//! arrays and maps carry their element counts, so envelopes can be
//! concatenated into one write and split again by the collector.

use std::fmt;

use serde::Serialize;

use crate::record::Record;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error returned when an event cannot be encoded.
///
/// Carries the tag and a rendering of the value that failed alongside the
/// underlying cause.
#[derive(Debug)]
pub struct EncodingError {
    pub tag: String,
    pub value: String,
    source: BoxError,
}

impl EncodingError {
    pub fn new(tag: impl Into<String>, value: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            tag: tag.into(),
            value: value.into(),
            source: source.into(),
        }
    }
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to encode '{}' for tag '{}': {}",
            self.value, self.tag, self.source
        )
    }
}

impl std::error::Error for EncodingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Turns one event into the bytes written to the collector.
///
/// Implementations must produce self-delimiting output: the collector reads a
/// stream of concatenated envelopes without any extra framing.
pub trait Encoder: Send + Sync {
    fn encode(&self, tag: &str, timestamp: i64, record: &Record) -> Result<Vec<u8>, EncodingError>;
}

/// Default encoder emitting forward protocol "message mode" entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgpackEncoder;

#[derive(Serialize)]
struct Envelope<'a>(&'a str, i64, &'a Record);

impl Encoder for MsgpackEncoder {
    fn encode(&self, tag: &str, timestamp: i64, record: &Record) -> Result<Vec<u8>, EncodingError> {
        let mut buf = Vec::with_capacity(64);
        rmp_serde::encode::write(&mut buf, &Envelope(tag, timestamp, record))
            .map_err(|e| EncodingError::new(tag, format!("{:?}", record), e))?;
        Ok(buf)
    }
}
