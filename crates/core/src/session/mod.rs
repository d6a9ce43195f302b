//! Recording sessions.
//!
//! One [`RecordingSession`] exists per authenticated push connection. It
//! is created by the [`SessionFactory`](factory::SessionFactory) once the
//! handshake credential checks out, receives codec metadata from the
//! session description, and owns the transport stream adapter that frames
//! are written into.
//!
//! ## Lifecycle
//!
//! ```text
//! handshake ─► create (auth, freshness, storage) ─► registered
//! x-sdp     ─► attach_sdp ─► metadata saved, Added event
//! media     ─► write_nal / start_nal / append_nal / finish_nal
//! teardown  ─► close ─► unregister, adapter close, complete
//! complete  ─► storage.complete ─► ValueChanged event (once)
//! ```
//!
//! A session is never reopened; writes after close fail.

pub mod factory;
pub mod registry;
pub mod token;

use std::io::Write;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{RecorderError, Result};
use crate::events::{EventPublisher, RecordingEvent};
use crate::media::FrameSink;
use crate::media::adapter::TsAdapter;
use crate::metrics::{self, Metrics};
use crate::protocol::sdp::{Media, SessionDescription};
use crate::storage::VideoStorage;
pub use registry::{ConnectionHandle, SessionRegistry};
pub use token::{SessionKind, SessionToken};

/// Identifiers of a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionIds {
    pub account_id: Uuid,
    pub place_id: Uuid,
    pub camera_id: Uuid,
    pub person_id: Uuid,
    pub recording_id: Uuid,
}

/// Audio codec advertised alongside the video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    Pcmu,
    Pcma,
    Other(String),
}

impl AudioCodec {
    pub fn from_encoding(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "MPEG4-GENERIC" | "MP4A-LATM" | "AAC" => AudioCodec::Aac,
            "PCMU" => AudioCodec::Pcmu,
            "PCMA" => AudioCodec::Pcma,
            _ => AudioCodec::Other(name.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Pcmu => "pcmu",
            AudioCodec::Pcma => "pcma",
            AudioCodec::Other(name) => name,
        }
    }
}

/// Codec and stream parameters derived from the session description.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingMetadata {
    pub ids: SessionIds,
    pub kind: SessionKind,
    /// Seconds of footage captured before the triggering event.
    pub precapture: f64,
    pub video_codec: String,
    pub resolution: Option<(u32, u32)>,
    pub framerate: Option<f64>,
    /// Bandwidth in kbps.
    pub bandwidth: Option<u32>,
    pub audio_codec: Option<AudioCodec>,
}

/// Picks the H.264 video section of a description.
fn select_video(sdp: &SessionDescription) -> Result<&Media> {
    let mut video = sdp.video().peekable();
    let first = video.peek().copied().ok_or(RecorderError::NoVideoMedia)?;
    video
        .find(|m| m.encoding_name().eq_ignore_ascii_case("h264"))
        .ok_or_else(|| RecorderError::UnsupportedCodec(first.encoding_name().to_string()))
}

/// A session's entry in the [`SessionRegistry`], tied to its connection.
pub(crate) struct Registration {
    pub(crate) registry: SessionRegistry,
    pub(crate) handle: ConnectionHandle,
}

/// State of one push recording.
pub struct RecordingSession {
    ids: SessionIds,
    kind: SessionKind,
    precapture: f64,
    adapter: TsAdapter<Box<dyn Write + Send>>,
    metadata: Option<RecordingMetadata>,
    video_payload_type: Option<u8>,
    storage: Arc<dyn VideoStorage>,
    events: Arc<dyn EventPublisher>,
    registration: Option<Registration>,
    metrics: Arc<Metrics>,
    closed: bool,
    completed: bool,
}

impl RecordingSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ids: SessionIds,
        kind: SessionKind,
        precapture: f64,
        adapter: TsAdapter<Box<dyn Write + Send>>,
        storage: Arc<dyn VideoStorage>,
        events: Arc<dyn EventPublisher>,
        registration: Option<Registration>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ids,
            kind,
            precapture,
            adapter,
            metadata: None,
            video_payload_type: None,
            storage,
            events,
            registration,
            metrics,
            closed: false,
            completed: false,
        }
    }

    pub fn ids(&self) -> &SessionIds {
        &self.ids
    }

    pub fn recording_id(&self) -> Uuid {
        self.ids.recording_id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn precapture(&self) -> f64 {
        self.precapture
    }

    pub fn metadata(&self) -> Option<&RecordingMetadata> {
        self.metadata.as_ref()
    }

    /// RTP payload type of the selected video media.
    pub fn video_payload_type(&self) -> Option<u8> {
        self.video_payload_type
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn duration_secs(&self) -> f64 {
        self.adapter.duration_secs()
    }

    pub fn bytes_written(&self) -> u64 {
        self.adapter.bytes_written()
    }

    /// Derive codec metadata from the session description, persist it and
    /// publish [`RecordingEvent::Added`].
    ///
    /// Only the first description is used. A description without H.264
    /// video is fatal.
    pub fn attach_sdp(&mut self, sdp: &SessionDescription) -> Result<()> {
        if self.metadata.is_some() {
            tracing::debug!(
                recording_id = %self.ids.recording_id,
                "ignoring repeated session description"
            );
            return Ok(());
        }

        let video = select_video(sdp)?;
        let audio = sdp.audio().next().map(|m| AudioCodec::from_encoding(m.encoding_name()));

        if video.resolution.is_none() {
            metrics::incr(&self.metrics.missing_resolution);
            tracing::debug!(
                recording_id = %self.ids.recording_id,
                "no resolution in session description"
            );
        }
        if video.framerate.is_none() {
            metrics::incr(&self.metrics.missing_framerate);
            tracing::debug!(
                recording_id = %self.ids.recording_id,
                "no framerate in session description"
            );
        }
        if video.bandwidth.is_none() {
            metrics::incr(&self.metrics.missing_bandwidth);
            tracing::debug!(
                recording_id = %self.ids.recording_id,
                "no bandwidth in session description"
            );
        }

        self.adapter.set_parameter_sets(video.parameter_sets());
        self.video_payload_type = video.payload_type();

        let metadata = RecordingMetadata {
            ids: self.ids,
            kind: self.kind,
            precapture: self.precapture,
            video_codec: video.encoding_name().to_string(),
            resolution: video.resolution,
            framerate: video.framerate,
            bandwidth: video.bandwidth.as_ref().map(|b| b.value),
            audio_codec: audio,
        };
        self.storage.save_metadata(&metadata)?;

        tracing::info!(
            recording_id = %self.ids.recording_id,
            codec = %metadata.video_codec,
            resolution = ?metadata.resolution,
            framerate = ?metadata.framerate,
            audio = ?metadata.audio_codec.as_ref().map(AudioCodec::name),
            "recording metadata attached"
        );
        self.events.publish(RecordingEvent::Added(metadata.clone()));
        self.metadata = Some(metadata);
        Ok(())
    }

    /// Report the final duration and size. Runs at most once.
    pub fn complete(&mut self) -> Result<()> {
        if self.completed {
            return Ok(());
        }
        self.completed = true;

        let duration_secs = self.adapter.duration_secs();
        let size = self.adapter.bytes_written();
        let purge_at = self
            .storage
            .complete(self.ids.recording_id, self.kind, duration_secs, size)?;

        metrics::incr(&self.metrics.sessions_completed);
        tracing::info!(
            recording_id = %self.ids.recording_id,
            duration_secs,
            size,
            purge = purge_at.is_some(),
            "recording completed"
        );
        self.events.publish(RecordingEvent::ValueChanged {
            ids: self.ids,
            duration_secs,
            size,
            completed: true,
            purge_at,
        });
        Ok(())
    }

    /// Tear the session down. Idempotent.
    ///
    /// Completion only runs if metadata was attached; a session that never
    /// received a description was never announced.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(Registration { registry, handle }) = &self.registration {
            registry.remove_owned(&self.ids.recording_id, handle);
        }
        if let Err(e) = self.adapter.close() {
            tracing::warn!(
                recording_id = %self.ids.recording_id,
                error = %e,
                "failed to close recording"
            );
        }
        if self.metadata.is_some()
            && let Err(e) = self.complete()
        {
            tracing::warn!(
                recording_id = %self.ids.recording_id,
                error = %e,
                "failed to complete recording"
            );
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(RecorderError::SessionClosed);
        }
        Ok(())
    }
}

impl FrameSink for RecordingSession {
    fn write_nal(&mut self, nal_header: u8, data: &[u8], timestamp: u64) -> Result<()> {
        self.ensure_open()?;
        self.adapter.write_nal(nal_header, data, timestamp)
    }

    fn start_nal(&mut self, nal_header: u8, data: &[u8], timestamp: u64) -> Result<()> {
        self.ensure_open()?;
        self.adapter.start_nal(nal_header, data, timestamp)
    }

    fn append_nal(&mut self, data: &[u8], timestamp: u64) -> Result<()> {
        self.ensure_open()?;
        self.adapter.append_nal(data, timestamp)
    }

    fn finish_nal(&mut self, data: &[u8], timestamp: u64) -> Result<()> {
        self.ensure_open()?;
        self.adapter.finish_nal(data, timestamp)
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        self.close();
    }
}
