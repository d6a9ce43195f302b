use crate::error::{RecorderError, Result};
use crate::pipeline::{ByteStage, Progress, StageEvent};

/// Magic byte that opens every interleaved frame (RFC 2326 §10.12).
pub const INTERLEAVED_MAGIC: u8 = 0x24;

const FRAME_HEADER_LEN: usize = 4;

/// Demultiplexer for RTSP interleaved binary framing.
///
/// ```text
/// +------+---------+----------------+---------------------+
/// | 0x24 | channel | length (u16 BE)| payload (length)    |
/// +------+---------+----------------+---------------------+
/// ```
///
/// Bytes are accumulated until a whole frame is buffered, then the
/// payload is emitted as [`StageEvent::Payload`]. A change of channel
/// id between consecutive frames is signalled with
/// [`StageEvent::ChannelSwitch`] before the payload.
///
/// There is no resynchronization: a frame boundary that does not start
/// with the magic byte is a fatal [`RecorderError::Framing`].
#[derive(Debug, Default)]
pub struct InterleavedDemuxer {
    buffer: Vec<u8>,
    channel: Option<u8>,
}

impl InterleavedDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel id of the most recently emitted frame.
    pub fn channel(&self) -> Option<u8> {
        self.channel
    }

    /// Bytes buffered towards the next (incomplete) frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn drain_frames(&mut self, events: &mut Vec<StageEvent>) -> Result<()> {
        let mut pos = 0usize;

        loop {
            let available = &self.buffer[pos..];
            let Some(&magic) = available.first() else {
                break;
            };
            if magic != INTERLEAVED_MAGIC {
                return Err(RecorderError::Framing { byte: magic });
            }
            if available.len() < FRAME_HEADER_LEN {
                break;
            }

            let channel = available[1];
            let length = u16::from_be_bytes([available[2], available[3]]) as usize;
            if available.len() < FRAME_HEADER_LEN + length {
                break;
            }

            if self.channel != Some(channel) {
                tracing::debug!(from = ?self.channel, to = channel, "interleaved channel switch");
                self.channel = Some(channel);
                events.push(StageEvent::ChannelSwitch(channel));
            }

            let data = available[FRAME_HEADER_LEN..FRAME_HEADER_LEN + length].to_vec();
            tracing::trace!(channel, length, "interleaved frame");
            events.push(StageEvent::Payload { channel, data });
            pos += FRAME_HEADER_LEN + length;
        }

        self.buffer.drain(..pos);
        Ok(())
    }
}

impl ByteStage for InterleavedDemuxer {
    fn name(&self) -> &'static str {
        "interleaved"
    }

    fn on_bytes(&mut self, data: &[u8], events: &mut Vec<StageEvent>) -> Result<Progress> {
        self.buffer.extend_from_slice(data);
        self.drain_frames(events)?;
        Ok(Progress::consumed_all(data.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(channel: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![INTERLEAVED_MAGIC, channel];
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn payloads(events: &[StageEvent]) -> Vec<(u8, Vec<u8>)> {
        events
            .iter()
            .filter_map(|e| match e {
                StageEvent::Payload { channel, data } => Some((*channel, data.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_frame() {
        let mut demux = InterleavedDemuxer::new();
        let mut events = Vec::new();
        demux.on_bytes(&frame(0, b"abc"), &mut events).unwrap();

        assert!(matches!(events[0], StageEvent::ChannelSwitch(0)));
        assert_eq!(payloads(&events), vec![(0, b"abc".to_vec())]);
        assert_eq!(demux.buffered(), 0);
    }

    #[test]
    fn frame_split_across_reads() {
        let mut demux = InterleavedDemuxer::new();
        let bytes = frame(0, &[1, 2, 3, 4, 5, 6]);
        let mut events = Vec::new();

        demux.on_bytes(&bytes[..2], &mut events).unwrap();
        assert!(events.is_empty());
        demux.on_bytes(&bytes[2..7], &mut events).unwrap();
        assert!(events.is_empty());
        demux.on_bytes(&bytes[7..], &mut events).unwrap();

        assert_eq!(payloads(&events), vec![(0, vec![1, 2, 3, 4, 5, 6])]);
    }

    #[test]
    fn multiple_frames_one_read() {
        let mut demux = InterleavedDemuxer::new();
        let mut bytes = frame(0, b"one");
        bytes.extend(frame(0, b"two"));
        bytes.extend(frame(1, b"rtcp"));
        bytes.extend(frame(0, b"three"));

        let mut events = Vec::new();
        demux.on_bytes(&bytes, &mut events).unwrap();

        let switches = events
            .iter()
            .filter(|e| matches!(e, StageEvent::ChannelSwitch(_)))
            .count();
        assert_eq!(switches, 3);
        assert_eq!(payloads(&events).len(), 4);
        assert_eq!(demux.channel(), Some(0));
    }

    #[test]
    fn zero_length_frame() {
        let mut demux = InterleavedDemuxer::new();
        let mut events = Vec::new();
        demux.on_bytes(&frame(2, &[]), &mut events).unwrap();
        assert_eq!(payloads(&events), vec![(2, vec![])]);
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut demux = InterleavedDemuxer::new();
        let mut events = Vec::new();
        let err = demux.on_bytes(&[0x80, 0x60, 0, 1], &mut events).unwrap_err();
        assert!(matches!(err, RecorderError::Framing { byte: 0x80 }));
    }

    #[test]
    fn bad_magic_after_valid_frame() {
        let mut demux = InterleavedDemuxer::new();
        let mut bytes = frame(0, b"ok");
        bytes.push(b'X');

        let mut events = Vec::new();
        assert!(demux.on_bytes(&bytes, &mut events).is_err());
        assert_eq!(payloads(&events).len(), 1);
    }
}
