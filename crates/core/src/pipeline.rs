//! Per-connection ingestion pipeline.
//!
//! Bytes read from a push connection flow through an ordered set of
//! stages owned by a single [`Pipeline`]:
//!
//! ```text
//! bytes ─► HandshakeParser ─(replaced by)─► InterleavedDemuxer
//!                │                               │
//!          Headers, Sdp                    ChannelSwitch, Payload
//!                ▼                               ▼
//!          SessionFactory                  RtpPacket::parse
//!                                                │
//!                                   RtcpFilter ─► SequenceTracker
//!                                                │
//!                                          H264Reassembler ─► RecordingSession
//! ```
//!
//! Stages never reference the pipeline. Byte stages report how much input
//! they consumed and whether they should be replaced; the pipeline feeds
//! any unconsumed bytes to the replacement within the same call.
//!
//! A pipeline is confined to the thread that owns its connection, so no
//! stage needs internal locking.

use std::fmt;
use std::sync::Arc;

use crate::error::{RecorderError, Result};
use crate::media::FrameSink;
use crate::media::h264::H264Reassembler;
use crate::media::rtp::{RtcpFilter, RtpPacket, SequenceTracker};
use crate::metrics::{self, Metrics};
use crate::protocol::handshake::{HandshakeParser, PushHeaders};
use crate::protocol::sdp::SessionDescription;
use crate::session::RecordingSession;
use crate::session::factory::SessionFactory;
use crate::session::registry::ConnectionHandle;

/// Output of a byte stage, consumed by the pipeline in order.
#[derive(Debug)]
pub enum StageEvent {
    /// The push handshake header block was received.
    Headers(PushHeaders),
    /// The handshake carried an `x-sdp` session description.
    Sdp(SessionDescription),
    /// Interleaved frames switched to a different channel id.
    ChannelSwitch(u8),
    /// One interleaved frame payload (an RTP or RTCP packet).
    Payload { channel: u8, data: Vec<u8> },
}

/// What the pipeline should do with a byte stage after a call.
pub enum Transition {
    Stay,
    /// Swap in a new stage and feed it the bytes this one did not consume.
    Replace(Box<dyn ByteStage>),
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stay => f.write_str("Stay"),
            Self::Replace(next) => f.debug_tuple("Replace").field(&next.name()).finish(),
        }
    }
}

/// Result of feeding bytes to a [`ByteStage`].
#[derive(Debug)]
pub struct Progress {
    pub consumed: usize,
    pub transition: Transition,
}

impl Progress {
    pub fn consumed_all(consumed: usize) -> Self {
        Self {
            consumed,
            transition: Transition::Stay,
        }
    }

    pub fn replace(consumed: usize, next: Box<dyn ByteStage>) -> Self {
        Self {
            consumed,
            transition: Transition::Replace(next),
        }
    }
}

/// A stage that consumes raw connection bytes.
pub trait ByteStage: Send {
    fn name(&self) -> &'static str;

    /// Consume bytes, appending any produced events.
    ///
    /// An error is fatal for the connection.
    fn on_bytes(&mut self, data: &[u8], events: &mut Vec<StageEvent>) -> Result<Progress>;
}

/// A stage that inspects parsed RTP packets.
///
/// Returning `None` drops the packet.
pub trait PacketStage: Send {
    fn on_packet(&mut self, packet: RtpPacket) -> Option<RtpPacket>;
}

/// Connection-owned driver for the ingestion stages.
pub struct Pipeline {
    front: Box<dyn ByteStage>,
    packet_stages: Vec<Box<dyn PacketStage>>,
    reassembler: H264Reassembler,
    factory: Arc<SessionFactory>,
    handle: Option<ConnectionHandle>,
    session: Option<RecordingSession>,
    video_payload_type: Option<u8>,
    channel: Option<u8>,
    metrics: Arc<Metrics>,
    events: Vec<StageEvent>,
    closed: bool,
}

impl Pipeline {
    /// Create a pipeline awaiting the push handshake.
    ///
    /// `handle` is the live connection, used to register the session for
    /// out-of-band stop requests. Without it the session is never registered.
    pub fn new(factory: Arc<SessionFactory>, handle: Option<ConnectionHandle>) -> Self {
        let metrics = factory.metrics();
        let max_header = factory.config().max_header_size;
        Self {
            front: Box::new(HandshakeParser::new(max_header)),
            packet_stages: vec![
                Box::new(RtcpFilter::new(metrics.clone())),
                Box::new(SequenceTracker::new(metrics.clone())),
            ],
            reassembler: H264Reassembler::new(metrics.clone()),
            factory,
            handle,
            session: None,
            video_payload_type: None,
            channel: None,
            metrics,
            events: Vec::new(),
            closed: false,
        }
    }

    /// Name of the stage currently receiving bytes.
    pub fn stage(&self) -> &'static str {
        self.front.name()
    }

    /// Interleaved channel of the most recent frame.
    pub fn channel(&self) -> Option<u8> {
        self.channel
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.session.as_ref()
    }

    /// Feed bytes read from the connection.
    pub fn on_bytes(&mut self, mut data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(RecorderError::SessionClosed);
        }

        loop {
            let result = self.front.on_bytes(data, &mut self.events);
            self.drain_events()?;
            let progress = result.inspect_err(|e| {
                if matches!(e, RecorderError::Framing { .. } | RecorderError::Handshake { .. }) {
                    metrics::incr(&self.metrics.framing_errors);
                }
            })?;

            data = &data[progress.consumed.min(data.len())..];
            match progress.transition {
                Transition::Stay => break,
                Transition::Replace(next) => {
                    tracing::debug!(
                        from = self.front.name(),
                        to = next.name(),
                        "pipeline stage replaced"
                    );
                    self.front = next;
                    if data.is_empty() {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Feed one raw RTP packet (datagram transport, no interleaving).
    pub fn on_packet(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(RecorderError::SessionClosed);
        }
        self.on_rtp(data)
    }

    fn drain_events(&mut self) -> Result<()> {
        let events = std::mem::take(&mut self.events);
        for event in events {
            self.on_event(event)?;
        }
        Ok(())
    }

    fn on_event(&mut self, event: StageEvent) -> Result<()> {
        match event {
            StageEvent::Headers(headers) => {
                let session = self.factory.create_session(&headers, self.handle.clone())?;
                self.session = Some(session);
            }
            StageEvent::Sdp(sdp) => {
                let session = self.session.as_mut().ok_or(RecorderError::NoSession)?;
                session.attach_sdp(&sdp)?;
                self.video_payload_type = session.video_payload_type();
            }
            StageEvent::ChannelSwitch(channel) => {
                self.channel = Some(channel);
            }
            StageEvent::Payload { channel, data } => {
                tracing::trace!(channel, len = data.len(), "payload");
                self.on_rtp(&data)?;
            }
        }
        Ok(())
    }

    fn on_rtp(&mut self, data: &[u8]) -> Result<()> {
        let mut packet = Some(RtpPacket::parse(data)?);
        for stage in &mut self.packet_stages {
            packet = packet.and_then(|p| stage.on_packet(p));
        }
        let Some(packet) = packet else {
            return Ok(());
        };

        if let Some(pt) = self.video_payload_type
            && packet.payload_type() != pt
        {
            metrics::incr(&self.metrics.non_video_dropped);
            tracing::trace!(pt = packet.payload_type(), "dropping non-video packet");
            return Ok(());
        }

        let sink = self.session.as_mut().map(|s| s as &mut dyn FrameSink);
        self.reassembler.push(&packet, sink)
    }

    /// Graceful end of stream: close and complete the session.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    /// Forced teardown after an error or idle timeout.
    ///
    /// The session is closed best-effort and the connection handle shut down.
    pub fn abort(&mut self, reason: &str) {
        if let Some(session) = &self.session {
            tracing::warn!(recording_id = %session.recording_id(), reason, "aborting session");
        }
        self.close();
        if let Some(handle) = &self.handle {
            handle.close();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.close();
    }
}
