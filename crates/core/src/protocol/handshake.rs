use std::collections::HashMap;

use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::error::{HandshakeErrorKind, RecorderError, Result};
use crate::pipeline::{ByteStage, Progress, StageEvent};
use crate::protocol::interleaved::InterleavedDemuxer;
use crate::protocol::sdp::SessionDescription;

const RTSP_PREFIX: &[u8] = b"RTSP/";

/// Header carrying the base64-encoded session description.
pub const SDP_HEADER: &str = "x-sdp";
/// Header carrying the pre-capture offset in seconds.
pub const PRECAPTURE_HEADER: &str = "x-precapture";
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Header block of a push handshake.
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// Authorization: Basic <credential>\r\n
/// X-Sdp: <base64 SDP>\r\n
/// X-Precapture: 5.0\r\n
/// \r\n
/// ```
///
/// Keys are stored lowercased; lookups are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct PushHeaders {
    pub status_line: String,
    headers: HashMap<String, String>,
}

impl PushHeaders {
    /// Parse a complete header block (terminator optional).
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.split("\r\n");
        let status_line = lines.next().unwrap_or_default().to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or(RecorderError::Handshake {
                kind: HandshakeErrorKind::InvalidHeader,
            })?;
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        Ok(Self {
            status_line,
            headers,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.headers.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn authorization(&self) -> Option<&str> {
        self.get(AUTHORIZATION_HEADER)
    }

    /// Pre-capture offset in seconds, `0.0` when absent or malformed.
    pub fn precapture(&self) -> f64 {
        match self.get(PRECAPTURE_HEADER) {
            None => 0.0,
            Some(v) => v.parse().unwrap_or_else(|_| {
                tracing::warn!(value = v, "invalid precapture header");
                0.0
            }),
        }
    }

    /// Decode the `x-sdp` header, if present.
    pub fn session_description(&self) -> Result<Option<SessionDescription>> {
        let Some(encoded) = self.get(SDP_HEADER) else {
            return Ok(None);
        };
        let bytes = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| RecorderError::InvalidSdp(e.to_string()))?;
        let text = String::from_utf8(bytes).map_err(|e| RecorderError::InvalidSdp(e.to_string()))?;
        tracing::trace!(sdp = %text, "decoded session description");
        Ok(Some(SessionDescription::parse(&text)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// Inside a line, looking for CR.
    Line,
    /// Saw CR, expecting LF.
    LineCr,
    /// At the start of a line, a CR here begins the terminator.
    LineStart,
    /// Saw the blank line's CR, expecting the final LF.
    BlankCr,
    Done,
}

/// One-shot parser for the push handshake header block.
///
/// Accumulates bytes until the blank-line terminator, then emits
/// [`StageEvent::Headers`] and, if an `x-sdp` header is present,
/// [`StageEvent::Sdp`]. It then replaces itself with an
/// [`InterleavedDemuxer`] which receives any bytes left over from the
/// same read.
#[derive(Debug)]
pub struct HandshakeParser {
    buffer: Vec<u8>,
    state: Scan,
    max_size: usize,
}

impl HandshakeParser {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            state: Scan::Line,
            max_size,
        }
    }

    fn step(&mut self, byte: u8) {
        self.state = match (self.state, byte) {
            (Scan::Line, b'\r') => Scan::LineCr,
            (Scan::Line, _) => Scan::Line,
            (Scan::LineCr, b'\n') => Scan::LineStart,
            (Scan::LineCr, b'\r') => Scan::LineCr,
            (Scan::LineCr, _) => Scan::Line,
            (Scan::LineStart, b'\r') => Scan::BlankCr,
            (Scan::LineStart, _) => Scan::Line,
            (Scan::BlankCr, b'\n') => Scan::Done,
            (Scan::BlankCr, b'\r') => Scan::LineCr,
            (Scan::BlankCr, _) => Scan::Line,
            (Scan::Done, _) => Scan::Done,
        };
    }

    fn check_prefix(&self) -> Result<()> {
        let n = self.buffer.len().min(RTSP_PREFIX.len());
        if self.buffer[..n] != RTSP_PREFIX[..n] {
            return Err(RecorderError::Handshake {
                kind: HandshakeErrorKind::NotRtsp,
            });
        }
        Ok(())
    }

    fn finish(&mut self, events: &mut Vec<StageEvent>) -> Result<()> {
        let text = std::str::from_utf8(&self.buffer).map_err(|_| RecorderError::Handshake {
            kind: HandshakeErrorKind::InvalidEncoding,
        })?;
        let headers = PushHeaders::parse(text)?;
        tracing::debug!(
            status = %headers.status_line,
            headers = headers.len(),
            "push handshake received"
        );

        let sdp = headers.session_description()?;
        events.push(StageEvent::Headers(headers));
        if let Some(sdp) = sdp {
            events.push(StageEvent::Sdp(sdp));
        }
        Ok(())
    }
}

impl ByteStage for HandshakeParser {
    fn name(&self) -> &'static str {
        "handshake"
    }

    fn on_bytes(&mut self, data: &[u8], events: &mut Vec<StageEvent>) -> Result<Progress> {
        for (i, &byte) in data.iter().enumerate() {
            self.buffer.push(byte);
            if self.buffer.len() <= RTSP_PREFIX.len() {
                self.check_prefix()?;
            }
            if self.buffer.len() > self.max_size {
                return Err(RecorderError::Handshake {
                    kind: HandshakeErrorKind::HeaderTooLarge {
                        limit: self.max_size,
                    },
                });
            }

            self.step(byte);
            if self.state == Scan::Done {
                self.finish(events)?;
                return Ok(Progress::replace(i + 1, Box::new(InterleavedDemuxer::new())));
            }
        }

        Ok(Progress::consumed_all(data.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Transition;

    const SDP: &str = "v=0\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n";

    fn handshake(sdp: Option<&str>) -> Vec<u8> {
        let mut text =
            String::from("RTSP/1.0 200 OK\r\nAuthorization: Basic abc\r\nX-Precapture: 2.5\r\n");
        if let Some(sdp) = sdp {
            text.push_str(&format!("X-Sdp: {}\r\n", BASE64_STANDARD.encode(sdp)));
        }
        text.push_str("\r\n");
        text.into_bytes()
    }

    fn headers(events: &[StageEvent]) -> &PushHeaders {
        events
            .iter()
            .find_map(|e| match e {
                StageEvent::Headers(h) => Some(h),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn parses_complete_handshake() {
        let mut parser = HandshakeParser::new(8192);
        let bytes = handshake(Some(SDP));
        let mut events = Vec::new();
        let progress = parser.on_bytes(&bytes, &mut events).unwrap();

        assert_eq!(progress.consumed, bytes.len());
        assert!(matches!(progress.transition, Transition::Replace(_)));
        assert_eq!(events.len(), 2);

        let h = headers(&events);
        assert_eq!(h.status_line, "RTSP/1.0 200 OK");
        assert_eq!(h.authorization(), Some("Basic abc"));
        assert_eq!(h.get("AUTHORIZATION"), Some("Basic abc"));
        assert_eq!(h.precapture(), 2.5);

        let StageEvent::Sdp(sdp) = &events[1] else {
            panic!("expected sdp event");
        };
        assert_eq!(sdp.media[0].encoding_name(), "H264");
    }

    #[test]
    fn without_sdp_emits_only_headers() {
        let mut parser = HandshakeParser::new(8192);
        let mut events = Vec::new();
        parser.on_bytes(&handshake(None), &mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StageEvent::Headers(_)));
    }

    #[test]
    fn byte_at_a_time() {
        let mut parser = HandshakeParser::new(8192);
        let bytes = handshake(Some(SDP));
        let mut events = Vec::new();

        for (i, b) in bytes.iter().enumerate() {
            let progress = parser.on_bytes(std::slice::from_ref(b), &mut events).unwrap();
            assert_eq!(progress.consumed, 1);
            let done = matches!(progress.transition, Transition::Replace(_));
            assert_eq!(done, i == bytes.len() - 1);
        }
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn leaves_trailing_bytes_unconsumed() {
        let mut parser = HandshakeParser::new(8192);
        let mut bytes = handshake(None);
        let header_len = bytes.len();
        bytes.extend_from_slice(&[0x24, 0x00, 0x00, 0x02, 0xaa, 0xbb]);

        let mut events = Vec::new();
        let progress = parser.on_bytes(&bytes, &mut events).unwrap();
        assert_eq!(progress.consumed, header_len);
    }

    #[test]
    fn rejects_foreign_protocol_early() {
        let mut parser = HandshakeParser::new(8192);
        let mut events = Vec::new();
        let err = parser.on_bytes(b"GET / HTTP/1.1\r\n", &mut events).unwrap_err();
        assert!(matches!(
            err,
            RecorderError::Handshake {
                kind: HandshakeErrorKind::NotRtsp
            }
        ));
    }

    #[test]
    fn rejects_oversized_header() {
        let mut parser = HandshakeParser::new(64);
        let mut events = Vec::new();
        let mut bytes = b"RTSP/1.0 200 OK\r\n".to_vec();
        bytes.extend(std::iter::repeat_n(b'a', 100));

        let err = parser.on_bytes(&bytes, &mut events).unwrap_err();
        assert!(matches!(
            err,
            RecorderError::Handshake {
                kind: HandshakeErrorKind::HeaderTooLarge { limit: 64 }
            }
        ));
    }

    #[test]
    fn rejects_header_without_colon() {
        let mut parser = HandshakeParser::new(8192);
        let mut events = Vec::new();
        let err = parser
            .on_bytes(b"RTSP/1.0 200 OK\r\nbogus\r\n\r\n", &mut events)
            .unwrap_err();
        assert!(matches!(
            err,
            RecorderError::Handshake {
                kind: HandshakeErrorKind::InvalidHeader
            }
        ));
    }

    #[test]
    fn bad_sdp_encoding_is_fatal() {
        let mut parser = HandshakeParser::new(8192);
        let mut events = Vec::new();
        let err = parser
            .on_bytes(b"RTSP/1.0 200 OK\r\nx-sdp: !!!\r\n\r\n", &mut events)
            .unwrap_err();
        assert!(matches!(err, RecorderError::InvalidSdp(_)));
    }

    #[test]
    fn precapture_defaults_to_zero() {
        let h = PushHeaders::parse("RTSP/1.0 200 OK\r\nx-precapture: soon\r\n").unwrap();
        assert_eq!(h.precapture(), 0.0);
        let h = PushHeaders::parse("RTSP/1.0 200 OK\r\n").unwrap();
        assert_eq!(h.precapture(), 0.0);
    }
}
