use std::sync::Arc;

use crate::error::{RecorderError, Result, RtpErrorKind};
use crate::metrics::{self, Metrics};
use crate::pipeline::PacketStage;

/// Size of the RTP fixed header.
pub const RTP_HEADER_LEN: usize = 12;

/// Payload type RTCP sender reports collide with when parsed as RTP
/// (second byte `0xC8` = marker set, PT 72).
pub const RTCP_PAYLOAD_TYPE: u8 = 72;

/// RTP header extension (RFC 3550 §5.3.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpExtension {
    pub profile: u16,
    pub data: Vec<u8>,
}

/// A parsed RTP packet (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |                  CSRC list (CC × 32 bits)                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   profile (if X)              |   length in 32-bit words      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                  payload ... [padding ... count]              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// When P is set the last byte of the packet is the padding count,
/// which includes itself; the payload excludes the whole trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    header: u32,
    timestamp: u32,
    ssrc: u32,
    csrc: Vec<u32>,
    extension: Option<RtpExtension>,
    payload: Vec<u8>,
}

fn truncated(needed: usize, available: usize) -> RecorderError {
    RecorderError::Rtp {
        kind: RtpErrorKind::Truncated { needed, available },
    }
}

impl RtpPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RTP_HEADER_LEN {
            return Err(truncated(RTP_HEADER_LEN, data.len()));
        }

        let header = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let version = data[0] >> 6;
        if version != 2 {
            return Err(RecorderError::Rtp {
                kind: RtpErrorKind::BadVersion(version),
            });
        }

        let csrc_count = (data[0] & 0x0f) as usize;
        let mut pos = RTP_HEADER_LEN;
        let csrc_end = pos + csrc_count * 4;
        if data.len() < csrc_end {
            return Err(truncated(csrc_end, data.len()));
        }
        let csrc = data[pos..csrc_end]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        pos = csrc_end;

        let extension = if data[0] & 0x10 != 0 {
            if data.len() < pos + 4 {
                return Err(truncated(pos + 4, data.len()));
            }
            let profile = u16::from_be_bytes([data[pos], data[pos + 1]]);
            let words = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            let end = pos + 4 + words * 4;
            if data.len() < end {
                return Err(truncated(end, data.len()));
            }
            let ext = RtpExtension {
                profile,
                data: data[pos + 4..end].to_vec(),
            };
            pos = end;
            Some(ext)
        } else {
            None
        };

        let mut end = data.len();
        if data[0] & 0x20 != 0 {
            // The count is the final byte of the untrimmed packet.
            let pad = data[data.len() - 1];
            if pad == 0 || pos + pad as usize > end {
                return Err(RecorderError::Rtp {
                    kind: RtpErrorKind::BadPadding(pad),
                });
            }
            end -= pad as usize;
        }

        Ok(Self {
            header,
            timestamp,
            ssrc,
            csrc,
            extension,
            payload: data[pos..end].to_vec(),
        })
    }

    pub fn version(&self) -> u8 {
        (self.header >> 30) as u8
    }

    pub fn has_padding(&self) -> bool {
        self.header & 0x2000_0000 != 0
    }

    pub fn has_extension(&self) -> bool {
        self.header & 0x1000_0000 != 0
    }

    pub fn csrc_count(&self) -> u8 {
        ((self.header >> 24) & 0x0f) as u8
    }

    pub fn marker(&self) -> bool {
        self.header & 0x0080_0000 != 0
    }

    pub fn payload_type(&self) -> u8 {
        ((self.header >> 16) & 0x7f) as u8
    }

    pub fn sequence(&self) -> u16 {
        self.header as u16
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn csrc(&self) -> &[u32] {
        &self.csrc
    }

    pub fn extension(&self) -> Option<&RtpExtension> {
        self.extension.as_ref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Warns about RTP sequence numbers that do not advance.
///
/// Packets are never reordered or dropped; a non-advancing sequence
/// number is only logged and counted. The distance is taken modulo
/// 2^16, so `65535 → 0` is in order.
#[derive(Debug)]
pub struct SequenceTracker {
    last: Option<u16>,
    metrics: Arc<Metrics>,
}

impl SequenceTracker {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            last: None,
            metrics,
        }
    }

    /// Record `seq`, returning whether it advanced past the previous one.
    pub fn observe(&mut self, seq: u16) -> bool {
        let in_order = match self.last {
            Some(prev) => (seq.wrapping_sub(prev) as i16) > 0,
            None => true,
        };
        if !in_order {
            metrics::incr(&self.metrics.out_of_order);
            tracing::warn!(seq, prev = ?self.last, "out of order RTP sequence number");
        }
        self.last = Some(seq);
        in_order
    }
}

impl PacketStage for SequenceTracker {
    fn on_packet(&mut self, packet: RtpPacket) -> Option<RtpPacket> {
        self.observe(packet.sequence());
        Some(packet)
    }
}

/// Drops RTCP packets that arrive on the media path.
#[derive(Debug)]
pub struct RtcpFilter {
    metrics: Arc<Metrics>,
}

impl RtcpFilter {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl PacketStage for RtcpFilter {
    fn on_packet(&mut self, packet: RtpPacket) -> Option<RtpPacket> {
        if packet.payload_type() == RTCP_PAYLOAD_TYPE {
            metrics::incr(&self.metrics.rtcp_dropped);
            tracing::trace!(ssrc = packet.ssrc(), "dropping RTCP packet");
            return None;
        }
        Some(packet)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a minimal RTP packet (no CSRC, extension or padding).
    pub(crate) fn packet(pt: u8, seq: u16, ts: u32, marker: bool, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x80, ((marker as u8) << 7) | pt];
        out.extend_from_slice(&seq.to_be_bytes());
        out.extend_from_slice(&ts.to_be_bytes());
        out.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn parses_fixed_header() {
        let bytes = packet(96, 0xBEEF, 90_000, true, &[0x65, 1, 2, 3]);
        let p = RtpPacket::parse(&bytes).unwrap();
        assert_eq!(p.version(), 2);
        assert!(p.marker());
        assert_eq!(p.payload_type(), 96);
        assert_eq!(p.sequence(), 0xBEEF);
        assert_eq!(p.timestamp(), 90_000);
        assert_eq!(p.ssrc(), 0x1234_5678);
        assert_eq!(p.payload(), &[0x65, 1, 2, 3]);
        assert!(p.extension().is_none());
    }

    #[test]
    fn parses_csrc_and_extension() {
        let mut bytes = vec![0x80 | 0x10 | 0x02, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        bytes.extend_from_slice(&[0, 0, 0, 0xAA, 0, 0, 0, 0xBB]);
        bytes.extend_from_slice(&[0xBE, 0xDE, 0x00, 0x01, 1, 2, 3, 4]);
        bytes.extend_from_slice(&[0x41, 9, 9]);

        let p = RtpPacket::parse(&bytes).unwrap();
        assert_eq!(p.csrc_count(), 2);
        assert_eq!(p.csrc(), &[0xAA, 0xBB]);
        let ext = p.extension().unwrap();
        assert_eq!(ext.profile, 0xBEDE);
        assert_eq!(ext.data, vec![1, 2, 3, 4]);
        assert_eq!(p.payload(), &[0x41, 9, 9]);
    }

    #[test]
    fn strips_padding() {
        let mut bytes = packet(96, 1, 0, false, &[0x41, 7, 7]);
        bytes[0] |= 0x20;
        bytes.extend_from_slice(&[0, 0, 3]);

        let p = RtpPacket::parse(&bytes).unwrap();
        assert!(p.has_padding());
        assert_eq!(p.payload(), &[0x41, 7, 7]);
    }

    #[test]
    fn rejects_oversized_padding() {
        let mut bytes = packet(96, 1, 0, false, &[0x41]);
        bytes[0] |= 0x20;
        bytes.push(200);
        assert!(matches!(
            RtpPacket::parse(&bytes),
            Err(RecorderError::Rtp {
                kind: RtpErrorKind::BadPadding(200)
            })
        ));
    }

    #[test]
    fn rejects_truncated_and_bad_version() {
        assert!(matches!(
            RtpPacket::parse(&[0x80, 96, 0]),
            Err(RecorderError::Rtp {
                kind: RtpErrorKind::Truncated { needed: 12, available: 3 }
            })
        ));

        let mut bytes = packet(96, 1, 0, false, &[]);
        bytes[0] = 0x40;
        assert!(matches!(
            RtpPacket::parse(&bytes),
            Err(RecorderError::Rtp {
                kind: RtpErrorKind::BadVersion(1)
            })
        ));
    }

    #[test]
    fn truncated_extension() {
        let bytes = [0x90, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1, 0xBE, 0xDE, 0x00, 0x04];
        assert!(matches!(
            RtpPacket::parse(&bytes),
            Err(RecorderError::Rtp {
                kind: RtpErrorKind::Truncated { .. }
            })
        ));
    }

    #[test]
    fn sequence_wraparound_is_in_order() {
        let metrics = Arc::new(Metrics::default());
        let mut tracker = SequenceTracker::new(metrics.clone());
        assert!(tracker.observe(65534));
        assert!(tracker.observe(65535));
        assert!(tracker.observe(0));
        assert!(tracker.observe(1));
        assert_eq!(metrics.snapshot().out_of_order, 0);
    }

    #[test]
    fn sequence_regression_is_counted() {
        let metrics = Arc::new(Metrics::default());
        let mut tracker = SequenceTracker::new(metrics.clone());
        tracker.observe(10);
        assert!(!tracker.observe(9));
        assert!(!tracker.observe(9));
        assert!(tracker.observe(10));
        assert_eq!(metrics.snapshot().out_of_order, 2);
    }

    #[test]
    fn rtcp_filter_drops_sender_reports() {
        let metrics = Arc::new(Metrics::default());
        let mut filter = RtcpFilter::new(metrics.clone());

        let rtcp =
            RtpPacket::parse(&[0x80, 0xC8, 0, 6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 0]).unwrap();
        assert_eq!(rtcp.payload_type(), RTCP_PAYLOAD_TYPE);
        assert!(filter.on_packet(rtcp).is_none());

        let rtp = RtpPacket::parse(&packet(96, 1, 0, false, &[0x41])).unwrap();
        assert!(filter.on_packet(rtp).is_some());
        assert_eq!(metrics.snapshot().rtcp_dropped, 1);
    }
}
