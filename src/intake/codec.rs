//! NDJSON codec for the intake socket.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! misbehaving client cannot make the server allocate unbounded memory for
//! a single unterminated message. Use as the codec parameter for
//! [`tokio_util::codec::FramedRead`]; one `\n`-terminated UTF-8 line is one
//! protocol message.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{RelayError, Result};

/// Maximum line length accepted on the intake socket: 256 KiB.
///
/// Hook events are small; anything past this limit is a framing bug or
/// abuse, rejected as `RelayError::Intake` before allocation.
pub const MAX_LINE_BYTES: usize = 262_144;

/// Line codec for intake streams, bounded by [`MAX_LINE_BYTES`].
#[derive(Debug)]
pub struct IntakeCodec(LinesCodec);

impl IntakeCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for IntakeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for IntakeCodec {
    type Item = String;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for IntakeCodec {
    type Error = RelayError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        // The length limit is a decoder-side concern only.
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> RelayError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            RelayError::Intake(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => RelayError::Io(io_err.to_string()),
    }
}
