//! Storage and directory collaborators.
//!
//! The ingestion core only needs a byte sink and a frame index per
//! recording, a place to put metadata, and a way to resolve the account
//! owning a place. [`MemoryStorage`] keeps everything in memory for tests
//! and embedding; [`FileStorage`] writes into a directory.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{RecorderError, Result};
use crate::media::adapter::{FrameIndex, FrameRecord, IFrameRecord};
use crate::session::{RecordingMetadata, SessionIds, SessionKind};

const HOUR_SECS: u64 = 3600;

/// Output of a newly allocated recording.
pub struct StorageSession {
    pub sink: Box<dyn Write + Send>,
    pub index: Box<dyn FrameIndex>,
}

pub trait VideoStorage: Send + Sync {
    fn create_session(&self, ids: &SessionIds, kind: SessionKind) -> Result<StorageSession>;

    fn save_metadata(&self, metadata: &RecordingMetadata) -> Result<()>;

    /// Persist final duration and size. Returns the purge time, if any.
    fn complete(
        &self,
        recording_id: Uuid,
        kind: SessionKind,
        duration_secs: f64,
        size: u64,
    ) -> Result<Option<SystemTime>>;
}

/// `now + ttl`, rounded up to the next whole hour.
///
/// A time already on an hour boundary is kept as is.
pub fn purge_time(now: SystemTime, ttl: Duration) -> SystemTime {
    let since_epoch = (now + ttl).duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = since_epoch.as_secs();
    if secs % HOUR_SECS == 0 && since_epoch.subsec_nanos() == 0 {
        return UNIX_EPOCH + since_epoch;
    }
    UNIX_EPOCH + Duration::from_secs(secs / HOUR_SECS * HOUR_SECS + HOUR_SECS)
}

fn purge_for(kind: SessionKind, ttl: Option<Duration>) -> Option<SystemTime> {
    match (kind, ttl) {
        (SessionKind::Stream, Some(ttl)) => Some(purge_time(SystemTime::now(), ttl)),
        _ => None,
    }
}

/// Everything stored for one recording.
#[derive(Debug, Clone)]
pub struct StoredRecording {
    pub ids: SessionIds,
    pub kind: SessionKind,
    pub bytes: Vec<u8>,
    pub flushes: usize,
    pub frames: Vec<FrameRecord>,
    pub iframes: Vec<IFrameRecord>,
    pub metadata: Option<RecordingMetadata>,
    /// Duration in seconds and size in bytes, once completed.
    pub completion: Option<(f64, u64)>,
    pub purge_at: Option<SystemTime>,
}

type SharedRecording = Arc<Mutex<StoredRecording>>;

struct MemorySink(SharedRecording);

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().flushes += 1;
        Ok(())
    }
}

struct MemoryIndex(SharedRecording);

impl FrameIndex for MemoryIndex {
    fn frame(&mut self, record: &FrameRecord) -> Result<()> {
        self.0.lock().frames.push(*record);
        Ok(())
    }

    fn iframe(&mut self, record: &IFrameRecord) -> Result<()> {
        self.0.lock().iframes.push(*record);
        Ok(())
    }
}

/// In-memory storage.
#[derive(Default)]
pub struct MemoryStorage {
    recordings: RwLock<HashMap<Uuid, SharedRecording>>,
    stream_ttl: Option<Duration>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream_ttl(mut self, ttl: Duration) -> Self {
        self.stream_ttl = Some(ttl);
        self
    }

    /// Snapshot of a recording.
    pub fn recording(&self, recording_id: &Uuid) -> Option<StoredRecording> {
        self.recordings
            .read()
            .get(recording_id)
            .map(|r| r.lock().clone())
    }

    pub fn recording_ids(&self) -> Vec<Uuid> {
        self.recordings.read().keys().copied().collect()
    }

    fn get(&self, recording_id: &Uuid) -> Result<SharedRecording> {
        self.recordings
            .read()
            .get(recording_id)
            .cloned()
            .ok_or_else(|| RecorderError::Storage(format!("unknown recording {recording_id}")))
    }
}

impl VideoStorage for MemoryStorage {
    fn create_session(&self, ids: &SessionIds, kind: SessionKind) -> Result<StorageSession> {
        let mut recordings = self.recordings.write();
        if recordings.contains_key(&ids.recording_id) {
            return Err(RecorderError::Storage(format!(
                "recording {} already exists",
                ids.recording_id
            )));
        }
        let recording = Arc::new(Mutex::new(StoredRecording {
            ids: *ids,
            kind,
            bytes: Vec::new(),
            flushes: 0,
            frames: Vec::new(),
            iframes: Vec::new(),
            metadata: None,
            completion: None,
            purge_at: None,
        }));
        recordings.insert(ids.recording_id, recording.clone());
        drop(recordings);

        Ok(StorageSession {
            sink: Box::new(MemorySink(recording.clone())),
            index: Box::new(MemoryIndex(recording)),
        })
    }

    fn save_metadata(&self, metadata: &RecordingMetadata) -> Result<()> {
        self.get(&metadata.ids.recording_id)?.lock().metadata = Some(metadata.clone());
        Ok(())
    }

    fn complete(
        &self,
        recording_id: Uuid,
        kind: SessionKind,
        duration_secs: f64,
        size: u64,
    ) -> Result<Option<SystemTime>> {
        let recording = self.get(&recording_id)?;
        let purge_at = purge_for(kind, self.stream_ttl);
        let mut recording = recording.lock();
        recording.completion = Some((duration_secs, size));
        recording.purge_at = purge_at;
        Ok(purge_at)
    }
}

/// Text index written next to the transport stream.
///
/// One line per record:
///
/// ```text
/// F <timestamp> <duration> <offset> <size> <iframe 0|1>
/// I <timestamp> <time-to-next> <offset> <size>
/// ```
struct FileIndex {
    out: BufWriter<File>,
}

impl FrameIndex for FileIndex {
    fn frame(&mut self, r: &FrameRecord) -> Result<()> {
        writeln!(
            self.out,
            "F {} {} {} {} {}",
            r.timestamp, r.duration, r.offset, r.size, r.iframe as u8
        )?;
        if r.duration == 0 {
            self.out.flush()?;
        }
        Ok(())
    }

    fn iframe(&mut self, r: &IFrameRecord) -> Result<()> {
        writeln!(
            self.out,
            "I {} {} {} {}",
            r.timestamp, r.time_to_next, r.offset, r.size
        )?;
        Ok(())
    }
}

/// Create a file, failing if it already exists.
fn create_new(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| RecorderError::Storage(format!("{}: {e}", path.display())))
}

/// Writes `<recording>.ts`, `<recording>.idx` and `<recording>.meta`
/// into a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
    stream_ttl: Option<Duration>,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            stream_ttl: None,
        })
    }

    pub fn with_stream_ttl(mut self, ttl: Duration) -> Self {
        self.stream_ttl = Some(ttl);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stream_path(&self, recording_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{recording_id}.ts"))
    }

    pub fn index_path(&self, recording_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{recording_id}.idx"))
    }

    pub fn metadata_path(&self, recording_id: &Uuid) -> PathBuf {
        self.dir.join(format!("{recording_id}.meta"))
    }

    fn append_metadata(&self, recording_id: &Uuid, lines: &[(&str, String)]) -> Result<()> {
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.metadata_path(recording_id))?;
        for (key, value) in lines {
            writeln!(out, "{key}={value}")?;
        }
        Ok(())
    }
}

impl VideoStorage for FileStorage {
    fn create_session(&self, ids: &SessionIds, kind: SessionKind) -> Result<StorageSession> {
        let id = &ids.recording_id;
        let sink = BufWriter::new(create_new(&self.stream_path(id))?);
        let index = BufWriter::new(create_new(&self.index_path(id))?);
        tracing::debug!(
            recording_id = %id,
            kind = kind.as_str(),
            dir = %self.dir.display(),
            "storage session created"
        );

        Ok(StorageSession {
            sink: Box::new(sink),
            index: Box::new(FileIndex { out: index }),
        })
    }

    fn save_metadata(&self, md: &RecordingMetadata) -> Result<()> {
        let mut lines = vec![
            ("account", md.ids.account_id.to_string()),
            ("place", md.ids.place_id.to_string()),
            ("camera", md.ids.camera_id.to_string()),
            ("person", md.ids.person_id.to_string()),
            ("kind", md.kind.as_str().to_string()),
            ("precapture", md.precapture.to_string()),
            ("video_codec", md.video_codec.clone()),
        ];
        if let Some((w, h)) = md.resolution {
            lines.push(("resolution", format!("{w}x{h}")));
        }
        if let Some(fps) = md.framerate {
            lines.push(("framerate", fps.to_string()));
        }
        if let Some(kbps) = md.bandwidth {
            lines.push(("bandwidth", kbps.to_string()));
        }
        if let Some(audio) = &md.audio_codec {
            lines.push(("audio_codec", audio.name().to_string()));
        }
        self.append_metadata(&md.ids.recording_id, &lines)
    }

    fn complete(
        &self,
        recording_id: Uuid,
        kind: SessionKind,
        duration_secs: f64,
        size: u64,
    ) -> Result<Option<SystemTime>> {
        let purge_at = purge_for(kind, self.stream_ttl);
        let mut lines = vec![
            ("duration", duration_secs.to_string()),
            ("size", size.to_string()),
        ];
        if let Some(at) = purge_at {
            let secs = at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
            lines.push(("purge_at", secs.to_string()));
        }
        self.append_metadata(&recording_id, &lines)?;
        Ok(purge_at)
    }
}

/// Resolves the account that owns a place.
pub trait PlaceDirectory: Send + Sync {
    fn account_for_place(&self, place_id: Uuid) -> Option<Uuid>;
}

/// Fixed place to account map.
#[derive(Debug, Clone, Default)]
pub struct StaticPlaceDirectory {
    places: HashMap<Uuid, Uuid>,
    fallback: Option<Uuid>,
}

impl StaticPlaceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_place(mut self, place_id: Uuid, account_id: Uuid) -> Self {
        self.places.insert(place_id, account_id);
        self
    }

    /// Account used for places not in the map.
    pub fn with_fallback(mut self, account_id: Uuid) -> Self {
        self.fallback = Some(account_id);
        self
    }
}

impl PlaceDirectory for StaticPlaceDirectory {
    fn account_for_place(&self, place_id: Uuid) -> Option<Uuid> {
        self.places.get(&place_id).copied().or(self.fallback)
    }
}

/// Memoises successful lookups of another directory.
pub struct CachedPlaceDirectory<D> {
    inner: D,
    cache: RwLock<HashMap<Uuid, Uuid>>,
}

impl<D: PlaceDirectory> CachedPlaceDirectory<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.read().len()
    }
}

impl<D: PlaceDirectory> PlaceDirectory for CachedPlaceDirectory<D> {
    fn account_for_place(&self, place_id: Uuid) -> Option<Uuid> {
        if let Some(account) = self.cache.read().get(&place_id) {
            return Some(*account);
        }
        let account = self.inner.account_for_place(place_id)?;
        self.cache.write().insert(place_id, account);
        Some(account)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn ids(recording: u128) -> SessionIds {
        SessionIds {
            account_id: Uuid::from_u128(1),
            place_id: Uuid::from_u128(2),
            camera_id: Uuid::from_u128(3),
            person_id: Uuid::from_u128(4),
            recording_id: Uuid::from_u128(recording),
        }
    }

    #[test]
    fn purge_rounds_up_to_next_hour() {
        let now = UNIX_EPOCH + Duration::from_secs(10 * HOUR_SECS + 120);
        let at = purge_time(now, Duration::from_secs(HOUR_SECS));
        assert_eq!(at, UNIX_EPOCH + Duration::from_secs(12 * HOUR_SECS));

        let exact = UNIX_EPOCH + Duration::from_secs(5 * HOUR_SECS);
        assert_eq!(purge_time(exact, Duration::ZERO), exact);
        assert_eq!(
            purge_time(exact, Duration::from_secs(HOUR_SECS)),
            UNIX_EPOCH + Duration::from_secs(6 * HOUR_SECS)
        );

        let just_past = exact + Duration::from_millis(1);
        assert_eq!(
            purge_time(just_past, Duration::ZERO),
            UNIX_EPOCH + Duration::from_secs(6 * HOUR_SECS)
        );
    }

    #[test]
    fn memory_storage_collects_output() {
        let storage = MemoryStorage::new().with_stream_ttl(Duration::from_secs(60));
        let mut out = storage.create_session(&ids(9), SessionKind::Stream).unwrap();
        out.sink.write_all(&[1, 2, 3]).unwrap();
        out.sink.flush().unwrap();
        out.index
            .frame(&FrameRecord {
                timestamp: 0,
                duration: 0,
                offset: 0,
                size: 3,
                iframe: true,
            })
            .unwrap();

        let purge = storage
            .complete(Uuid::from_u128(9), SessionKind::Stream, 1.5, 3)
            .unwrap();
        assert!(purge.is_some());

        let rec = storage.recording(&Uuid::from_u128(9)).unwrap();
        assert_eq!(rec.bytes, vec![1, 2, 3]);
        assert_eq!(rec.flushes, 1);
        assert_eq!(rec.frames.len(), 1);
        assert_eq!(rec.completion, Some((1.5, 3)));

        assert!(matches!(
            storage.complete(Uuid::from_u128(10), SessionKind::Recording, 0.0, 0),
            Err(RecorderError::Storage(_))
        ));
    }

    #[test]
    fn recordings_are_never_purged() {
        let storage = MemoryStorage::new().with_stream_ttl(Duration::from_secs(60));
        storage.create_session(&ids(5), SessionKind::Recording).unwrap();
        let purge = storage
            .complete(Uuid::from_u128(5), SessionKind::Recording, 1.0, 1)
            .unwrap();
        assert!(purge.is_none());
    }

    #[test]
    fn file_storage_writes_three_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("rec")).unwrap();
        let ids = ids(11);

        {
            let mut out = storage.create_session(&ids, SessionKind::Recording).unwrap();
            out.sink.write_all(&[0x47; 188]).unwrap();
            out.index
                .iframe(&IFrameRecord {
                    timestamp: 0,
                    time_to_next: 0,
                    offset: 0,
                    size: 188,
                })
                .unwrap();
            out.index
                .frame(&FrameRecord {
                    timestamp: 0,
                    duration: 0,
                    offset: 0,
                    size: 188,
                    iframe: true,
                })
                .unwrap();
        }
        storage
            .save_metadata(&RecordingMetadata {
                ids,
                kind: SessionKind::Recording,
                precapture: 2.0,
                video_codec: "H264".into(),
                resolution: Some((640, 480)),
                framerate: None,
                bandwidth: None,
                audio_codec: None,
            })
            .unwrap();
        storage
            .complete(ids.recording_id, SessionKind::Recording, 0.5, 188)
            .unwrap();

        let ts = fs::read(storage.stream_path(&ids.recording_id)).unwrap();
        assert_eq!(ts.len(), 188);

        let index = fs::read_to_string(storage.index_path(&ids.recording_id)).unwrap();
        assert_eq!(index, "I 0 0 0 188\nF 0 0 0 188 1\n");

        let meta = fs::read_to_string(storage.metadata_path(&ids.recording_id)).unwrap();
        assert!(meta.contains("resolution=640x480\n"));
        assert!(meta.contains("duration=0.5\n"));
        assert!(meta.contains("size=188\n"));
        assert!(!meta.contains("framerate"));
        assert!(!meta.contains("purge_at"));
    }

    #[test]
    fn existing_recordings_are_not_overwritten() {
        let memory = MemoryStorage::new();
        let mut out = memory.create_session(&ids(21), SessionKind::Recording).unwrap();
        out.sink.write_all(&[7]).unwrap();
        assert!(matches!(
            memory.create_session(&ids(21), SessionKind::Recording),
            Err(RecorderError::Storage(_))
        ));
        assert_eq!(memory.recording(&Uuid::from_u128(21)).unwrap().bytes, vec![7]);

        let dir = tempfile::tempdir().unwrap();
        let files = FileStorage::new(dir.path()).unwrap();
        {
            let mut out = files.create_session(&ids(22), SessionKind::Recording).unwrap();
            out.sink.write_all(&[0x47; 188]).unwrap();
        }
        assert!(matches!(
            files.create_session(&ids(22), SessionKind::Recording),
            Err(RecorderError::Storage(_))
        ));
        let ts = fs::read(files.stream_path(&Uuid::from_u128(22))).unwrap();
        assert_eq!(ts.len(), 188);
    }

    struct Counting {
        lookups: AtomicUsize,
    }

    impl PlaceDirectory for Counting {
        fn account_for_place(&self, place_id: Uuid) -> Option<Uuid> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            (place_id != Uuid::nil()).then_some(Uuid::from_u128(42))
        }
    }

    #[test]
    fn cached_directory_memoises_hits() {
        let dir = CachedPlaceDirectory::new(Counting {
            lookups: AtomicUsize::new(0),
        });
        assert_eq!(dir.account_for_place(Uuid::from_u128(1)), Some(Uuid::from_u128(42)));
        assert_eq!(dir.account_for_place(Uuid::from_u128(1)), Some(Uuid::from_u128(42)));
        assert_eq!(dir.account_for_place(Uuid::nil()), None);
        assert_eq!(dir.account_for_place(Uuid::nil()), None);
        assert_eq!(dir.inner.lookups.load(Ordering::SeqCst), 3);
        assert_eq!(dir.cached(), 1);
    }

    #[test]
    fn static_directory_fallback() {
        let dir = StaticPlaceDirectory::new()
            .with_place(Uuid::from_u128(1), Uuid::from_u128(10))
            .with_fallback(Uuid::from_u128(99));
        assert_eq!(dir.account_for_place(Uuid::from_u128(1)), Some(Uuid::from_u128(10)));
        assert_eq!(dir.account_for_place(Uuid::from_u128(2)), Some(Uuid::from_u128(99)));
        assert_eq!(StaticPlaceDirectory::new().account_for_place(Uuid::from_u128(1)), None);
    }
}
