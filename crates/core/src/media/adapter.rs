use std::io::Write;

use super::mpegts::TsWriter;
use super::{FrameSink, VIDEO_CLOCK_RATE, is_iframe};
use crate::error::{RecorderError, Result};

/// A completed frame: one NAL unit as written to the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRecord {
    /// 90 kHz timestamp of the unit.
    pub timestamp: u64,
    /// Ticks until the next unit, `0` for the final unit.
    pub duration: u64,
    /// Container byte offset of the unit (including any PAT/PMT before it).
    pub offset: u64,
    pub size: u64,
    pub iframe: bool,
}

/// A completed I-frame, for building a seek index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IFrameRecord {
    pub timestamp: u64,
    /// Ticks until the next I-frame, `0` for the final one.
    pub time_to_next: u64,
    pub offset: u64,
    pub size: u64,
}

/// Receiver of completed frame records.
pub trait FrameIndex: Send {
    fn frame(&mut self, record: &FrameRecord) -> Result<()>;

    fn iframe(&mut self, record: &IFrameRecord) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Unit {
    timestamp: u64,
    start: u64,
    end: u64,
    iframe: bool,
}

/// Writes NAL units to a transport stream and indexes them.
///
/// Records are emitted one unit late: a unit's duration is only known
/// when the next unit arrives, so unit *n-1* is reported when unit *n*
/// starts. I-frames are tracked on a separate cursor so each I-frame
/// record carries the distance to the next I-frame. [`close`](Self::close)
/// reports whatever is still pending with a zero duration.
///
/// The underlying sink is flushed once per `flush_interval` of stream
/// time, not per frame.
pub struct TsAdapter<W: Write> {
    writer: TsWriter<W>,
    index: Box<dyn FrameIndex>,
    flush_interval: u64,
    last_flush: Option<u64>,
    current: Option<Unit>,
    pending: Option<Unit>,
    pending_iframe: Option<Unit>,
    first_timestamp: Option<u64>,
    last_timestamp: u64,
    frames: u64,
    closed: bool,
}

impl<W: Write> TsAdapter<W> {
    pub fn new(sink: W, index: Box<dyn FrameIndex>, flush_interval_secs: u64) -> Self {
        Self {
            writer: TsWriter::new(sink),
            index,
            flush_interval: flush_interval_secs * VIDEO_CLOCK_RATE,
            last_flush: None,
            current: None,
            pending: None,
            pending_iframe: None,
            first_timestamp: None,
            last_timestamp: 0,
            frames: 0,
            closed: false,
        }
    }

    /// SPS/PPS written in front of every IDR unit.
    pub fn set_parameter_sets(&mut self, sets: Vec<Vec<u8>>) {
        self.writer.set_parameter_sets(sets);
    }

    pub fn bytes_written(&self) -> u64 {
        self.writer.position()
    }

    /// Units started so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Stream time between the first and last unit, in 90 kHz ticks.
    pub fn duration_ticks(&self) -> u64 {
        self.first_timestamp
            .map(|first| self.last_timestamp.saturating_sub(first))
            .unwrap_or(0)
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_ticks() as f64 / VIDEO_CLOCK_RATE as f64
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn writer(&self) -> &TsWriter<W> {
        &self.writer
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(RecorderError::SessionClosed);
        }
        Ok(())
    }

    fn begin(&mut self, timestamp: u64, iframe: bool) -> Result<()> {
        self.ensure_open()?;
        if self.current.is_some() {
            self.end()?;
        }

        if let Some(prev) = self.pending.take() {
            self.emit_frame(prev, timestamp.saturating_sub(prev.timestamp))?;
        }
        if iframe && let Some(prev) = self.pending_iframe.take() {
            self.emit_iframe(prev, timestamp.saturating_sub(prev.timestamp))?;
        }

        self.first_timestamp.get_or_insert(timestamp);
        self.last_timestamp = self.last_timestamp.max(timestamp);
        self.frames += 1;

        let start = self.writer.position();
        self.current = Some(Unit {
            timestamp,
            start,
            end: start,
            iframe,
        });
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        let Some(mut unit) = self.current.take() else {
            return Ok(());
        };
        unit.end = self.writer.position();
        self.pending = Some(unit);
        if unit.iframe {
            self.pending_iframe = Some(unit);
        }
        self.maybe_flush(unit.timestamp)
    }

    fn maybe_flush(&mut self, timestamp: u64) -> Result<()> {
        match self.last_flush {
            None => self.last_flush = Some(timestamp),
            Some(last) if timestamp.saturating_sub(last) >= self.flush_interval => {
                tracing::trace!(timestamp, bytes = self.writer.position(), "flushing recording");
                self.writer.flush()?;
                self.last_flush = Some(timestamp);
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn emit_frame(&mut self, unit: Unit, duration: u64) -> Result<()> {
        self.index.frame(&FrameRecord {
            timestamp: unit.timestamp,
            duration,
            offset: unit.start,
            size: unit.end - unit.start,
            iframe: unit.iframe,
        })
    }

    fn emit_iframe(&mut self, unit: Unit, time_to_next: u64) -> Result<()> {
        self.index.iframe(&IFrameRecord {
            timestamp: unit.timestamp,
            time_to_next,
            offset: unit.start,
            size: unit.end - unit.start,
        })
    }

    /// Report pending records with zero duration and flush the sink.
    ///
    /// Later writes fail with [`RecorderError::SessionClosed`].
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.end()?;
        self.closed = true;

        if let Some(unit) = self.pending.take() {
            self.emit_frame(unit, 0)?;
        }
        if let Some(unit) = self.pending_iframe.take() {
            self.emit_iframe(unit, 0)?;
        }
        self.writer.flush()?;
        tracing::debug!(
            frames = self.frames,
            bytes = self.writer.position(),
            duration_secs = self.duration_secs(),
            "transport stream closed"
        );
        Ok(())
    }
}

impl<W: Write> FrameSink for TsAdapter<W> {
    fn write_nal(&mut self, nal_header: u8, data: &[u8], timestamp: u64) -> Result<()> {
        self.begin(timestamp, is_iframe(nal_header))?;
        self.writer.start_unit(nal_header, data, timestamp)?;
        self.end()
    }

    fn start_nal(&mut self, nal_header: u8, data: &[u8], timestamp: u64) -> Result<()> {
        self.begin(timestamp, is_iframe(nal_header))?;
        self.writer.start_unit(nal_header, data, timestamp)?;
        Ok(())
    }

    fn append_nal(&mut self, data: &[u8], _timestamp: u64) -> Result<()> {
        self.ensure_open()?;
        if self.current.is_none() {
            tracing::warn!(len = data.len(), "fragment data without an open unit");
            return Ok(());
        }
        self.writer.continue_unit(data)?;
        Ok(())
    }

    fn finish_nal(&mut self, data: &[u8], timestamp: u64) -> Result<()> {
        self.append_nal(data, timestamp)?;
        self.end()
    }
}
