//! Push-RTSP wire protocol.
//!
//! A camera opens a TCP connection and, instead of waiting for requests,
//! immediately sends an RTSP-style header block (RFC 2326 §4) carrying
//! its credential and session description:
//!
//! ```text
//! RTSP/1.0 200 OK\r\n
//! Authorization: Basic <credential>\r\n
//! X-Sdp: <base64 SDP>\r\n
//! \r\n
//! $<ch><len><RTP packet>$<ch><len><RTP packet>...
//! ```
//!
//! Media follows as interleaved binary frames (RFC 2326 §10.12).
//!
//! | Module | Role |
//! |--------|------|
//! | [`handshake`] | one-shot header block parser |
//! | [`interleaved`] | `$`-framed channel demultiplexer |
//! | [`sdp`] | session description parser (RFC 8866) |

pub mod handshake;
pub mod interleaved;
pub mod sdp;

pub use handshake::{HandshakeParser, PushHeaders};
pub use interleaved::InterleavedDemuxer;
pub use sdp::SessionDescription;
