//! Framed codec for the service side of the ROI protocol.
//!
//! Decodes one newline-terminated header (and, when enabled, the `w*h` payload
//! bytes that follow it) into a [`RoiRequest`]; encodes a
//! [`ClassificationResponse`] as one response line. Works over any
//! AsyncRead/AsyncWrite via `tokio_util::codec::Framed`.

use std::io;

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{ClassificationResponse, HeaderError, RoiRequest};

/// Longest accepted header line, newline included.
pub const MAX_HEADER_LEN: usize = 256;

/// Largest payload the service will buffer for one request.
pub const MAX_PAYLOAD_LEN: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error("header exceeds {MAX_HEADER_LEN} bytes without a newline")]
    HeaderTooLong,

    #[error("header is not valid UTF-8")]
    NotUtf8,

    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit")]
    PayloadTooLarge(u64),

    #[error("connection closed mid-request")]
    Truncated,

    #[error(transparent)]
    Io(#[from] io::Error),
}

enum DecodeState {
    Header,
    Payload { request: RoiRequest, len: usize },
}

/// Service-side codec.
pub struct RoiCodec {
    read_payload: bool,
    state: DecodeState,
}

impl Default for RoiCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl RoiCodec {
    /// Header-only codec; any bytes after the newline are ignored.
    pub fn new() -> Self {
        Self {
            read_payload: false,
            state: DecodeState::Header,
        }
    }

    /// Codec that also consumes the `w*h` payload after each header.
    pub fn with_payload() -> Self {
        Self {
            read_payload: true,
            state: DecodeState::Header,
        }
    }

    fn decode_header(&mut self, src: &mut BytesMut) -> Result<Option<RoiRequest>, ProtocolError> {
        let Some(newline) = src.iter().position(|b| *b == b'\n') else {
            if src.len() >= MAX_HEADER_LEN {
                return Err(ProtocolError::HeaderTooLong);
            }
            return Ok(None);
        };
        if newline + 1 > MAX_HEADER_LEN {
            return Err(ProtocolError::HeaderTooLong);
        }

        let line = src.split_to(newline + 1);
        let line = std::str::from_utf8(&line).map_err(|_| ProtocolError::NotUtf8)?;
        let request = RoiRequest::parse_header(line)?;
        tracing::trace!(header = line.trim_end(), "Decoded ROI header");
        Ok(Some(request))
    }
}

impl Decoder for RoiCodec {
    type Item = RoiRequest;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match std::mem::replace(&mut self.state, DecodeState::Header) {
                DecodeState::Header => {
                    let Some(request) = self.decode_header(src)? else {
                        return Ok(None);
                    };
                    if !self.read_payload || request.payload_len() == 0 {
                        return Ok(Some(request));
                    }
                    let len = request.payload_len();
                    if len > MAX_PAYLOAD_LEN {
                        return Err(ProtocolError::PayloadTooLarge(len));
                    }
                    self.state = DecodeState::Payload {
                        request,
                        len: len as usize,
                    };
                }
                DecodeState::Payload { request, len } => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        self.state = DecodeState::Payload { request, len };
                        return Ok(None);
                    }
                    let payload = src.split_to(len).to_vec();
                    return Ok(Some(request.with_payload(payload)));
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(request) => Ok(Some(request)),
            None if buf.is_empty() && matches!(self.state, DecodeState::Header) => Ok(None),
            None => {
                buf.advance(buf.len());
                Err(ProtocolError::Truncated)
            }
        }
    }
}

impl Encoder<ClassificationResponse> for RoiCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: ClassificationResponse, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = item.response_line();
        dst.reserve(line.len());
        dst.put_slice(line.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Classification, EmotionLabel};

    #[test]
    fn decodes_header_split_across_reads() {
        let mut codec = RoiCodec::new();
        let mut buf = BytesMut::from(&b"ROI 10 1"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"0 48 48\n");
        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req, RoiRequest::new(10, 10, 48, 48));
        assert!(buf.is_empty());
    }

    #[test]
    fn header_only_codec_leaves_payload_bytes() {
        let mut codec = RoiCodec::new();
        let mut buf = BytesMut::from(&b"ROI 0 0 2 2\nabcd"[..]);
        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert!(req.payload.is_none());
        assert_eq!(&buf[..], b"abcd");
    }

    #[test]
    fn payload_codec_waits_for_full_payload() {
        let mut codec = RoiCodec::with_payload();
        let mut buf = BytesMut::from(&b"ROI 0 0 2 2\nab"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"cd");
        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req.payload.as_deref(), Some(&b"abcd"[..]));
    }

    #[test]
    fn payload_codec_rejects_oversized_payload() {
        let mut codec = RoiCodec::with_payload();
        let mut buf = BytesMut::from(&b"ROI 0 0 4096 4096\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn rejects_overlong_header() {
        let mut codec = RoiCodec::new();
        let mut buf = BytesMut::from(vec![b'R'; MAX_HEADER_LEN].as_slice());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::HeaderTooLong)
        ));
    }

    #[test]
    fn rejects_unknown_command() {
        let mut codec = RoiCodec::new();
        let mut buf = BytesMut::from(&b"PING\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::Header(HeaderError::UnknownCommand(_)))
        ));
    }

    #[test]
    fn eof_mid_header_is_truncated() {
        let mut codec = RoiCodec::new();
        let mut buf = BytesMut::from(&b"ROI 1 2"[..]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(ProtocolError::Truncated)
        ));

        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn encodes_response_line() {
        let mut codec = RoiCodec::new();
        let mut buf = BytesMut::new();
        let resp = Classification::new(EmotionLabel::Neutral, 85.0).unwrap();
        codec.encode(resp, &mut buf).unwrap();
        assert_eq!(&buf[..], b"Neutral (confidence: 85.00%)\n");
    }
}
