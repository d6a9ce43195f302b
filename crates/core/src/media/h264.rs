use std::sync::Arc;

use super::rtp::RtpPacket;
use super::{FrameSink, NAL_FORBIDDEN_BIT, NAL_FU_A, NAL_FU_B, NAL_REF_MASK, NAL_TYPE_MASK};
use crate::error::{RecorderError, Result};
use crate::metrics::{self, Metrics};

/// H.264 RTP depacketizer (RFC 6184).
///
/// Turns RTP payloads into NAL units delivered to a [`FrameSink`]:
///
/// - **Single NAL Unit** (§5.6, types 1–23): forwarded whole.
/// - **FU-A / FU-B** (§5.8, types 28/29): fragments are forwarded as they
///   arrive, bracketed by `start_nal` / `finish_nal`. The NAL header byte
///   is rebuilt from the indicator's F/NRI bits and the FU header's type.
///
///   ```text
///   FU indicator:  [F|NRI|Type=28|29]  (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   DON:           [u16]               (FU-B only, discarded)
///   Fragment data: [...]
///   ```
///
/// Aggregation packets (STAP/MTAP) and reserved types are counted and
/// dropped. A forbidden-zero bit is logged but the unit is still
/// forwarded.
///
/// Fragments are not buffered, so the sink sees every byte exactly once
/// and can record a unit's start offset when its first fragment lands.
///
/// RTP timestamps are extended to 64 bits and rebased so the first
/// packet of the connection is at 0.
#[derive(Debug)]
pub struct H264Reassembler {
    metrics: Arc<Metrics>,
    last_rtp_timestamp: Option<u32>,
    timestamp: u64,
    /// Reconstructed header of the fragmented NAL in progress.
    fragment: Option<u8>,
}

impl H264Reassembler {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            last_rtp_timestamp: None,
            timestamp: 0,
            fragment: None,
        }
    }

    /// Whether a fragmented NAL unit is open.
    pub fn in_fragment(&self) -> bool {
        self.fragment.is_some()
    }

    /// Extended timestamp of the most recent packet.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn extend_timestamp(&mut self, rtp_ts: u32) -> u64 {
        if let Some(last) = self.last_rtp_timestamp {
            let delta = rtp_ts.wrapping_sub(last) as i32 as i64;
            self.timestamp = (self.timestamp as i64 + delta).max(0) as u64;
        }
        self.last_rtp_timestamp = Some(rtp_ts);
        self.timestamp
    }

    /// Process one RTP packet.
    ///
    /// Fails with [`RecorderError::NoSession`] when there is no sink yet.
    pub fn push(&mut self, packet: &RtpPacket, sink: Option<&mut dyn FrameSink>) -> Result<()> {
        let Some(sink) = sink else {
            tracing::warn!(seq = packet.sequence(), "media received before session");
            return Err(RecorderError::NoSession);
        };

        let payload = packet.payload();
        let Some(&nal) = payload.first() else {
            tracing::trace!(seq = packet.sequence(), "empty RTP payload");
            return Ok(());
        };
        let ts = self.extend_timestamp(packet.timestamp());

        if nal & NAL_FORBIDDEN_BIT != 0 {
            metrics::incr(&self.metrics.forbidden_bit);
            tracing::warn!(seq = packet.sequence(), nal, "forbidden bit set in NAL header");
        }

        match nal & NAL_TYPE_MASK {
            1..=23 => {
                self.interrupt_fragment(sink, ts)?;
                tracing::trace!(
                    nal_type = nal & NAL_TYPE_MASK,
                    len = payload.len(),
                    ts,
                    "single NAL unit"
                );
                sink.write_nal(nal, &payload[1..], ts)
            }
            t @ (NAL_FU_A | NAL_FU_B) => self.on_fragment(t, nal, payload, ts, sink),
            other => {
                metrics::incr(&self.metrics.unknown_nal);
                tracing::warn!(
                    nal_type = other,
                    seq = packet.sequence(),
                    "dropping unsupported NAL type"
                );
                Ok(())
            }
        }
    }

    fn on_fragment(
        &mut self,
        fu_type: u8,
        indicator: u8,
        payload: &[u8],
        ts: u64,
        sink: &mut dyn FrameSink,
    ) -> Result<()> {
        let skip = if fu_type == NAL_FU_B { 4 } else { 2 };
        if payload.len() < skip {
            tracing::warn!(len = payload.len(), fu_type, "truncated fragmentation unit");
            return Ok(());
        }

        let fu_header = payload[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let header = (indicator & NAL_REF_MASK) | (fu_header & NAL_TYPE_MASK);
        let data = &payload[skip..];

        match (start, end) {
            (true, true) => {
                self.interrupt_fragment(sink, ts)?;
                sink.write_nal(header, data, ts)
            }
            (true, false) => {
                self.interrupt_fragment(sink, ts)?;
                tracing::trace!(nal_type = header & NAL_TYPE_MASK, ts, "fragment start");
                self.fragment = Some(header);
                sink.start_nal(header, data, ts)
            }
            (false, true) => {
                if self.fragment.take().is_none() {
                    tracing::warn!(ts, "fragment end without start");
                    return Ok(());
                }
                tracing::trace!(nal_type = header & NAL_TYPE_MASK, ts, "fragment end");
                sink.finish_nal(data, ts)
            }
            (false, false) => {
                if self.fragment.is_none() {
                    tracing::warn!(ts, "fragment continuation without start");
                    return Ok(());
                }
                sink.append_nal(data, ts)
            }
        }
    }

    /// Close an unterminated fragmented NAL before a new unit begins.
    fn interrupt_fragment(&mut self, sink: &mut dyn FrameSink, ts: u64) -> Result<()> {
        if let Some(header) = self.fragment.take() {
            tracing::warn!(
                nal_type = header & NAL_TYPE_MASK,
                "fragmented NAL interrupted before end"
            );
            sink.finish_nal(&[], ts)?;
        }
        Ok(())
    }
}
