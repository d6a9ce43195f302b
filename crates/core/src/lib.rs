pub mod error;
pub mod events;
pub mod media;
pub mod metrics;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

pub use error::{RecorderError, Result};
pub use events::{EventPublisher, MemoryPublisher, RecordingEvent, TracingPublisher};
pub use pipeline::Pipeline;
pub use server::{Server, ServerConfig};
pub use session::{RecordingSession, SessionKind, SessionToken};
pub use storage::{
    CachedPlaceDirectory, FileStorage, MemoryStorage, PlaceDirectory, StaticPlaceDirectory,
    VideoStorage,
};
