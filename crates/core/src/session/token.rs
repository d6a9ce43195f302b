//! Signed push credentials.
//!
//! A camera authenticates with a `Basic` credential whose user and
//! password halves are base64url-encoded binary blobs:
//!
//! ```text
//! user     = camera_id (16) ‖ place_id (16)                      → 32 bytes
//! password = person_id (16) ‖ recording_id (16) ‖ signature (16) → 48 bytes
//!
//! signature = HMAC-SHA256(secret, camera ‖ account ‖ place ‖ person ‖ recording)[..16]
//! ```
//!
//! The signed message concatenates the hyphenated textual form of each
//! id. The account is not carried in the token; it is looked up from the
//! place, so a token cannot be replayed against another account.
//!
//! Recording ids are version-1 (time-based) UUIDs. The time they encode
//! is the token's issue time, and bit `0x0000020000000000` of the low 64
//! bits marks a live stream rather than a recording.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::prelude::{BASE64_STANDARD, BASE64_URL_SAFE, BASE64_URL_SAFE_NO_PAD, Engine as _};
use rand::RngExt;
use ring::hmac;
use uuid::Uuid;

use crate::error::{AuthErrorKind, RecorderError, Result};

pub const SIGNATURE_LEN: usize = 16;
const USER_LEN: usize = 32;
const PASSWORD_LEN: usize = 48;

/// Stream marker in the low 64 bits of a recording id.
pub const STREAM_FLAG: u64 = 0x0000_0200_0000_0000;

/// 100 ns ticks between the Gregorian epoch (1582-10-15) and the Unix epoch.
const GREGORIAN_OFFSET: u64 = 0x01b2_1dd2_1381_4000;

/// Whether a session is a persisted recording or a transient live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Recording,
    Stream,
}

impl SessionKind {
    /// Kind encoded in a recording id.
    pub fn of(recording_id: &Uuid) -> Self {
        let (_, low) = recording_id.as_u64_pair();
        if low & STREAM_FLAG != 0 {
            SessionKind::Stream
        } else {
            SessionKind::Recording
        }
    }

    pub fn is_stream(self) -> bool {
        self == SessionKind::Stream
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Recording => "recording",
            SessionKind::Stream => "stream",
        }
    }
}

/// Mint a time-based recording id for the current time.
pub fn mint_recording_id(kind: SessionKind) -> Uuid {
    mint_recording_id_at(kind, SystemTime::now())
}

/// Mint a time-based recording id carrying `time`.
pub fn mint_recording_id_at(kind: SessionKind, time: SystemTime) -> Uuid {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    let ticks = GREGORIAN_OFFSET + (since_epoch.as_nanos() / 100) as u64;

    let mut rng = rand::rng();
    let clock_seq = rng.random::<u16>() & 0x3fff;
    let node = rng.random::<u64>().to_be_bytes();

    let mut tail = [0u8; 8];
    tail[0] = 0x80 | (clock_seq >> 8) as u8;
    tail[1] = clock_seq as u8;
    tail[2..].copy_from_slice(&node[2..]);
    match kind {
        SessionKind::Stream => tail[2] |= 0x02,
        SessionKind::Recording => tail[2] &= !0x02,
    }

    Uuid::from_fields(
        ticks as u32,
        (ticks >> 32) as u16,
        0x1000 | ((ticks >> 48) as u16 & 0x0fff),
        &tail,
    )
}

/// Issue time of a version-1 recording id.
pub fn recording_time(recording_id: &Uuid) -> Option<SystemTime> {
    if recording_id.get_version_num() != 1 {
        return None;
    }
    let (time_low, time_mid, time_hi, _) = recording_id.as_fields();
    let ticks = ((time_hi as u64 & 0x0fff) << 48) | ((time_mid as u64) << 32) | time_low as u64;
    let since_epoch = ticks.checked_sub(GREGORIAN_OFFSET)?;
    Some(UNIX_EPOCH + Duration::from_nanos(since_epoch * 100))
}

fn auth_error(kind: AuthErrorKind) -> RecorderError {
    RecorderError::Auth { kind }
}

fn uuid_at(bytes: &[u8], at: usize) -> Uuid {
    let mut id = [0u8; 16];
    id.copy_from_slice(&bytes[at..at + 16]);
    Uuid::from_bytes(id)
}

fn decode_segment(segment: &str, expected: usize) -> Result<Vec<u8>> {
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|_| auth_error(AuthErrorKind::InvalidEncoding))?;
    if bytes.len() != expected {
        return Err(auth_error(AuthErrorKind::SegmentLength {
            expected,
            actual: bytes.len(),
        }));
    }
    Ok(bytes)
}

/// The ids and signature carried by a push credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub camera_id: Uuid,
    pub place_id: Uuid,
    pub person_id: Uuid,
    pub recording_id: Uuid,
    pub signature: [u8; SIGNATURE_LEN],
}

impl SessionToken {
    /// Build a token and sign it for `account_id`.
    pub fn issue(
        secret: &[u8],
        account_id: Uuid,
        camera_id: Uuid,
        place_id: Uuid,
        person_id: Uuid,
        recording_id: Uuid,
    ) -> Self {
        let mut token = Self {
            camera_id,
            place_id,
            person_id,
            recording_id,
            signature: [0; SIGNATURE_LEN],
        };
        token.signature = token.expected_signature(secret, account_id);
        token
    }

    /// Parse an `Authorization` header value (`Basic <credential>`).
    pub fn parse(authorization: &str) -> Result<Self> {
        let (scheme, credential) = authorization
            .trim()
            .split_once(' ')
            .ok_or(auth_error(AuthErrorKind::UnsupportedScheme))?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(auth_error(AuthErrorKind::UnsupportedScheme));
        }

        let decoded = BASE64_STANDARD
            .decode(credential.trim())
            .map_err(|_| auth_error(AuthErrorKind::InvalidEncoding))?;
        let decoded =
            String::from_utf8(decoded).map_err(|_| auth_error(AuthErrorKind::InvalidEncoding))?;
        let (user, password) = decoded
            .split_once(':')
            .ok_or(auth_error(AuthErrorKind::InvalidEncoding))?;

        let user = decode_segment(user, USER_LEN)?;
        let password = decode_segment(password, PASSWORD_LEN)?;

        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&password[32..]);

        Ok(Self {
            camera_id: uuid_at(&user, 0),
            place_id: uuid_at(&user, 16),
            person_id: uuid_at(&password, 0),
            recording_id: uuid_at(&password, 16),
            signature,
        })
    }

    pub fn kind(&self) -> SessionKind {
        SessionKind::of(&self.recording_id)
    }

    fn expected_signature(&self, secret: &[u8], account_id: Uuid) -> [u8; SIGNATURE_LEN] {
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
        let message = format!(
            "{}{}{}{}{}",
            self.camera_id, account_id, self.place_id, self.person_id, self.recording_id
        );
        let tag = hmac::sign(&key, message.as_bytes());

        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&tag.as_ref()[..SIGNATURE_LEN]);
        signature
    }

    /// Check the signature against the ids and `account_id`.
    pub fn verify(&self, secret: &[u8], account_id: Uuid) -> Result<()> {
        let expected = self.expected_signature(secret, account_id);
        ring::constant_time::verify_slices_are_equal(&expected, &self.signature)
            .map_err(|_| auth_error(AuthErrorKind::SignatureMismatch))
    }

    /// Encode as an `Authorization` header value.
    pub fn authorization_header(&self) -> String {
        let mut user = Vec::with_capacity(USER_LEN);
        user.extend_from_slice(self.camera_id.as_bytes());
        user.extend_from_slice(self.place_id.as_bytes());

        let mut password = Vec::with_capacity(PASSWORD_LEN);
        password.extend_from_slice(self.person_id.as_bytes());
        password.extend_from_slice(self.recording_id.as_bytes());
        password.extend_from_slice(&self.signature);

        let credential = format!(
            "{}:{}",
            BASE64_URL_SAFE.encode(&user),
            BASE64_URL_SAFE.encode(&password)
        );
        format!("Basic {}", BASE64_STANDARD.encode(credential))
    }
}
