//! RTP depacketization, H.264 reassembly and MPEG-TS output.
//!
//! ## Data flow
//!
//! ```text
//! RtpPacket ─► H264Reassembler ─► FrameSink ─► TsAdapter ─► TsWriter
//!                                                  │            │
//!                                                  │            └─► storage
//!                                                  └─► FrameIndex (frame / I-frame records)
//! ```
//!
//! | Module | Role | Reference |
//! |--------|------|-----------|
//! | [`rtp`] | packet parsing, sequence tracking, RTCP filter | [RFC 3550] |
//! | [`h264`] | single NAL and FU-A/FU-B reassembly | [RFC 6184] |
//! | [`sps`] | picture size from sequence parameter sets | ITU-T H.264 §7.3.2.1 |
//! | [`mpegts`] | transport stream packetization | ISO/IEC 13818-1 |
//! | [`adapter`] | delayed frame index and flush cadence | |
//!
//! [RFC 3550]: https://tools.ietf.org/html/rfc3550
//! [RFC 6184]: https://tools.ietf.org/html/rfc6184

pub mod adapter;
pub mod h264;
pub mod mpegts;
pub mod rtp;
pub mod sps;

use crate::error::Result;

/// Mask of the type field in an H.264 NAL header byte.
pub const NAL_TYPE_MASK: u8 = 0x1f;
/// Forbidden-zero bit of a NAL header byte.
pub const NAL_FORBIDDEN_BIT: u8 = 0x80;
/// `nal_ref_idc` bits plus the forbidden bit.
pub const NAL_REF_MASK: u8 = 0xe0;

pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;
pub const NAL_FU_A: u8 = 28;
pub const NAL_FU_B: u8 = 29;

/// 90 kHz media clock used by H.264 over RTP and by MPEG-TS.
pub const VIDEO_CLOCK_RATE: u64 = 90_000;

/// Whether a NAL header byte denotes an IDR picture.
pub fn is_iframe(nal_header: u8) -> bool {
    nal_header & NAL_TYPE_MASK == NAL_IDR
}

/// Destination for reassembled H.264 NAL units.
///
/// A unit arrives either whole through [`write_nal`](Self::write_nal) or
/// as a `start_nal`, zero or more `append_nal`, `finish_nal` run.
/// `data` never includes the NAL header byte; timestamps are on the
/// 90 kHz clock, relative to the first packet of the connection.
pub trait FrameSink {
    fn write_nal(&mut self, nal_header: u8, data: &[u8], timestamp: u64) -> Result<()>;

    fn start_nal(&mut self, nal_header: u8, data: &[u8], timestamp: u64) -> Result<()>;

    fn append_nal(&mut self, data: &[u8], timestamp: u64) -> Result<()>;

    fn finish_nal(&mut self, data: &[u8], timestamp: u64) -> Result<()>;
}
