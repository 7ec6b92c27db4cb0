//! NDJSON codec for session channel streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! misbehaving peer cannot make the receiver allocate without bound. The
//! limit is sized for base64 snapshots and audio segments, which dominate
//! line length on this protocol.
//!
//! # Usage
//!
//! Use [`WireCodec`] as the codec parameter for
//! [`tokio_util::codec::FramedRead`] (inbound) and
//! [`tokio_util::codec::FramedWrite`] (outbound).

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::{AppError, Result};

/// Maximum line length accepted on a session channel: 8 MiB.
pub const MAX_LINE_BYTES: usize = 8 * 1_048_576;

/// Line-delimited JSON codec shared by students, observers, and the relay.
///
/// # Decoder
///
/// Inbound lines longer than [`MAX_LINE_BYTES`] are logged and discarded up
/// to their terminating newline; decoding resumes with the next line. An
/// error would end a `FramedRead` stream, so only I/O failures surface, as
/// [`AppError::Channel`].
///
/// # Encoder
///
/// Outbound strings are encoded as `item\n`.
#[derive(Debug)]
pub struct WireCodec(LinesCodec);

impl WireCodec {
    /// Create a new `WireCodec` with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode(src) {
                Err(LinesCodecError::MaxLineLengthExceeded) => log_oversized(),
                other => return other.map_err(map_codec_error),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.0.decode_eof(src) {
                Err(LinesCodecError::MaxLineLengthExceeded) => log_oversized(),
                other => return other.map_err(map_codec_error),
            }
        }
    }
}

impl Encoder<String> for WireCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        // The length limit applies only to decoding.
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn log_oversized() {
    warn!(limit = MAX_LINE_BYTES, "line too long, discarding");
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Protocol(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Channel(io_err.to_string()),
    }
}
