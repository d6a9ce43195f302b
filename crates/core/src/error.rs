//! Error types for the recording pipeline.

use std::fmt;

use uuid::Uuid;

/// Errors that can occur while ingesting a push stream.
///
/// Every variant that escapes the connection pipeline is fatal for that
/// connection: the byte stream cannot be resynchronized, so the driver
/// tears the connection down instead of retrying.
///
/// - **Framing**: [`Framing`](Self::Framing), [`Handshake`](Self::Handshake),
///   [`Rtp`](Self::Rtp).
/// - **Authentication**: [`Auth`](Self::Auth), [`TokenExpired`](Self::TokenExpired),
///   [`TokenFromFuture`](Self::TokenFromFuture), [`UnknownPlace`](Self::UnknownPlace).
/// - **Media**: [`NoVideoMedia`](Self::NoVideoMedia),
///   [`UnsupportedCodec`](Self::UnsupportedCodec), [`InvalidSdp`](Self::InvalidSdp).
/// - **Session**: [`NoSession`](Self::NoSession), [`SessionClosed`](Self::SessionClosed),
///   [`DuplicateRecording`](Self::DuplicateRecording), [`Storage`](Self::Storage).
/// - **Server**: [`NotStarted`](Self::NotStarted), [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A byte at an interleaved frame boundary was not the `$` magic.
    #[error("interleaved framing error: expected 0x24, found {byte:#04x}")]
    Framing { byte: u8 },

    /// The push handshake header block was malformed.
    #[error("handshake error: {kind}")]
    Handshake { kind: HandshakeErrorKind },

    /// An RTP packet could not be parsed.
    #[error("RTP parse error: {kind}")]
    Rtp { kind: RtpErrorKind },

    /// The `Authorization` credential was missing, malformed or forged.
    #[error("authentication failed: {kind}")]
    Auth { kind: AuthErrorKind },

    /// The recording id was minted longer ago than the session timeout.
    #[error("session token expired ({age_secs}s old)")]
    TokenExpired { age_secs: u64 },

    /// The recording id carries a creation time in the future.
    #[error("session token issued {ahead_secs}s in the future")]
    TokenFromFuture { ahead_secs: u64 },

    /// No account is known for the place carried in the token.
    #[error("no account for place {0}")]
    UnknownPlace(Uuid),

    /// The session description has no video media section.
    #[error("session description has no video media")]
    NoVideoMedia,

    /// The video media section uses a codec other than H.264.
    #[error("unsupported video codec: {0}")]
    UnsupportedCodec(String),

    /// The `x-sdp` header could not be decoded.
    #[error("invalid session description: {0}")]
    InvalidSdp(String),

    /// Media arrived before a recording session was established.
    #[error("media received without an active session")]
    NoSession,

    /// Frames were written to a session that has already been closed.
    #[error("recording session already closed")]
    SessionClosed,

    /// Another connection is already recording under this id.
    #[error("recording {0} is already in progress")]
    DuplicateRecording(Uuid),

    /// The storage collaborator rejected an operation.
    #[error("storage error: {0}")]
    Storage(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

/// Specific kind of push-handshake failure.
#[derive(Debug)]
pub enum HandshakeErrorKind {
    /// The message does not begin with `RTSP/`.
    NotRtsp,
    /// The header block exceeded the configured maximum size.
    HeaderTooLarge { limit: usize },
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// The header block was not valid UTF-8.
    InvalidEncoding,
}

impl fmt::Display for HandshakeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRtsp => write!(f, "not an RTSP message"),
            Self::HeaderTooLarge { limit } => write!(f, "header block exceeds {limit} bytes"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidEncoding => write!(f, "header block is not UTF-8"),
        }
    }
}

/// Specific kind of RTP parse failure.
#[derive(Debug)]
pub enum RtpErrorKind {
    /// Fewer bytes than the fixed header, CSRC list or extension require.
    Truncated { needed: usize, available: usize },
    /// Version field was not 2.
    BadVersion(u8),
    /// The padding count exceeds the remaining payload.
    BadPadding(u8),
}

impl fmt::Display for RtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, available } => {
                write!(f, "truncated packet (need {needed} bytes, have {available})")
            }
            Self::BadVersion(v) => write!(f, "unsupported RTP version {v}"),
            Self::BadPadding(n) => write!(f, "padding count {n} exceeds payload"),
        }
    }
}

/// Specific kind of authentication failure.
#[derive(Debug)]
pub enum AuthErrorKind {
    /// No `Authorization` header in the handshake.
    MissingAuthorization,
    /// The credential is not of the `Basic` scheme.
    UnsupportedScheme,
    /// The credential is not valid base64 or lacks the `user:password` split.
    InvalidEncoding,
    /// A decoded credential segment has the wrong length.
    SegmentLength { expected: usize, actual: usize },
    /// The HMAC signature does not match the ids.
    SignatureMismatch,
    /// The recording id is neither nil nor time-based.
    InvalidRecordingId,
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingAuthorization => write!(f, "missing authorization"),
            Self::UnsupportedScheme => write!(f, "unsupported authorization scheme"),
            Self::InvalidEncoding => write!(f, "invalid credential encoding"),
            Self::SegmentLength { expected, actual } => {
                write!(f, "credential segment is {actual} bytes, expected {expected}")
            }
            Self::SignatureMismatch => write!(f, "signature mismatch"),
            Self::InvalidRecordingId => write!(f, "recording id is not time-based"),
        }
    }
}

/// Convenience alias for `Result<T, RecorderError>`.
pub type Result<T> = std::result::Result<T, RecorderError>;
