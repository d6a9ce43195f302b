use std::sync::Arc;
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use super::registry::{ConnectionHandle, SessionRegistry};
use super::token::{self, SessionKind, SessionToken};
use super::{RecordingSession, Registration, SessionIds};
use crate::error::{AuthErrorKind, RecorderError, Result};
use crate::events::EventPublisher;
use crate::media::adapter::TsAdapter;
use crate::metrics::{self, Metrics};
use crate::protocol::handshake::PushHeaders;
use crate::server::ServerConfig;
use crate::storage::{PlaceDirectory, VideoStorage};

/// Builds recording sessions from push handshakes.
///
/// Shared by every connection; holds the collaborators a session needs
/// and nothing connection-specific.
pub struct SessionFactory {
    config: Arc<ServerConfig>,
    storage: Arc<dyn VideoStorage>,
    places: Arc<dyn PlaceDirectory>,
    events: Arc<dyn EventPublisher>,
    registry: SessionRegistry,
    metrics: Arc<Metrics>,
}

impl SessionFactory {
    pub fn new(
        config: Arc<ServerConfig>,
        storage: Arc<dyn VideoStorage>,
        places: Arc<dyn PlaceDirectory>,
        events: Arc<dyn EventPublisher>,
        registry: SessionRegistry,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            storage,
            places,
            events,
            registry,
            metrics,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Authenticate a handshake and open its recording.
    ///
    /// The session is registered only when `handle` is present.
    pub fn create_session(
        &self,
        headers: &PushHeaders,
        handle: Option<ConnectionHandle>,
    ) -> Result<RecordingSession> {
        self.create_session_at(headers, handle, SystemTime::now())
    }

    /// [`create_session`](Self::create_session) with an explicit clock.
    pub fn create_session_at(
        &self,
        headers: &PushHeaders,
        handle: Option<ConnectionHandle>,
        now: SystemTime,
    ) -> Result<RecordingSession> {
        let ids = self.authenticate(headers, now).inspect_err(|e| match e {
            RecorderError::TokenExpired { .. } => metrics::incr(&self.metrics.tokens_expired),
            RecorderError::TokenFromFuture { .. } => {
                metrics::incr(&self.metrics.tokens_from_future)
            }
            _ => metrics::incr(&self.metrics.auth_failures),
        })?;

        let registration = self.register(ids.recording_id, handle)?;
        let kind = SessionKind::of(&ids.recording_id);
        let precapture = headers.precapture();
        let out = match self.storage.create_session(&ids, kind) {
            Ok(out) => out,
            Err(e) => {
                if let Some(Registration { registry, handle }) = &registration {
                    registry.remove_owned(&ids.recording_id, handle);
                }
                return Err(e);
            }
        };
        let adapter = TsAdapter::new(out.sink, out.index, self.config.flush_interval_secs);

        metrics::incr(&self.metrics.sessions_started);
        tracing::info!(
            recording_id = %ids.recording_id,
            camera_id = %ids.camera_id,
            place_id = %ids.place_id,
            kind = kind.as_str(),
            precapture,
            registered = registration.is_some(),
            "recording session created"
        );

        Ok(RecordingSession::new(
            ids,
            kind,
            precapture,
            adapter,
            self.storage.clone(),
            self.events.clone(),
            registration,
            self.metrics.clone(),
        ))
    }

    /// Claim `recording_id` for `handle`.
    ///
    /// An id that is already live is refused, with or without a handle.
    fn register(
        &self,
        recording_id: Uuid,
        handle: Option<ConnectionHandle>,
    ) -> Result<Option<Registration>> {
        let claimed = match &handle {
            Some(handle) => self.registry.try_put(recording_id, handle.clone()),
            None => !self.registry.contains(&recording_id),
        };
        if !claimed {
            tracing::warn!(%recording_id, "refusing second connection for live recording");
            return Err(RecorderError::DuplicateRecording(recording_id));
        }
        Ok(handle.map(|handle| Registration {
            registry: self.registry.clone(),
            handle,
        }))
    }

    fn authenticate(&self, headers: &PushHeaders, now: SystemTime) -> Result<SessionIds> {
        let authorization = headers.authorization().ok_or(RecorderError::Auth {
            kind: AuthErrorKind::MissingAuthorization,
        })?;
        let token = SessionToken::parse(authorization)?;

        let account_id = self
            .places
            .account_for_place(token.place_id)
            .ok_or(RecorderError::UnknownPlace(token.place_id))?;
        token.verify(&self.config.secret, account_id)?;

        let recording_id = if token.recording_id.is_nil() {
            token::mint_recording_id_at(SessionKind::Recording, now)
        } else {
            self.check_freshness(&token.recording_id, now)?;
            token.recording_id
        };

        Ok(SessionIds {
            account_id,
            place_id: token.place_id,
            camera_id: token.camera_id,
            person_id: token.person_id,
            recording_id,
        })
    }

    fn check_freshness(&self, recording_id: &Uuid, now: SystemTime) -> Result<()> {
        let created = token::recording_time(recording_id).ok_or(RecorderError::Auth {
            kind: AuthErrorKind::InvalidRecordingId,
        })?;

        if let Ok(ahead) = created.duration_since(now)
            && !ahead.is_zero()
        {
            return Err(RecorderError::TokenFromFuture {
                ahead_secs: ahead.as_secs(),
            });
        }

        let age = now.duration_since(created).unwrap_or_default();
        if age > Duration::from_secs(self.config.session_timeout_secs) {
            return Err(RecorderError::TokenExpired {
                age_secs: age.as_secs(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryPublisher;
    use crate::storage::{MemoryStorage, StaticPlaceDirectory};

    const SECRET: &[u8] = b"push-secret";
    const ACCOUNT: Uuid = Uuid::from_u128(0xa1);
    const PLACE: Uuid = Uuid::from_u128(0xb2);
    const CAMERA: Uuid = Uuid::from_u128(0xc3);
    const PERSON: Uuid = Uuid::from_u128(0xd4);

    fn factory() -> (SessionFactory, Arc<MemoryStorage>) {
        let config = ServerConfig {
            secret: SECRET.to_vec(),
            session_timeout_secs: 60,
            ..ServerConfig::default()
        };
        let storage = Arc::new(MemoryStorage::new());
        let factory = SessionFactory::new(
            Arc::new(config),
            storage.clone(),
            Arc::new(StaticPlaceDirectory::new().with_place(PLACE, ACCOUNT)),
            Arc::new(MemoryPublisher::new()),
            SessionRegistry::new(),
            Arc::new(Metrics::default()),
        );
        (factory, storage)
    }

    fn headers(token: &SessionToken) -> PushHeaders {
        let mut headers = PushHeaders::default();
        headers.insert("Authorization", token.authorization_header());
        headers
    }

    fn signed(recording_id: Uuid) -> SessionToken {
        SessionToken::issue(SECRET, ACCOUNT, CAMERA, PLACE, PERSON, recording_id)
    }

    #[test]
    fn nil_recording_id_is_minted() {
        let (factory, storage) = factory();
        let now = SystemTime::now();
        let session = factory
            .create_session_at(&headers(&signed(Uuid::nil())), None, now)
            .unwrap();

        let id = session.recording_id();
        assert!(!id.is_nil());
        assert_eq!(session.kind(), SessionKind::Recording);
        assert_eq!(session.ids().account_id, ACCOUNT);
        assert!(!session.is_registered());
        assert!(storage.recording(&id).is_some());
        assert_eq!(factory.metrics().snapshot().sessions_started, 1);
    }

    #[test]
    fn freshness_window() {
        let (factory, _) = factory();
        let now = SystemTime::now();

        let recent =
            token::mint_recording_id_at(SessionKind::Stream, now - Duration::from_secs(30));
        let session = factory
            .create_session_at(&headers(&signed(recent)), None, now)
            .unwrap();
        assert_eq!(session.kind(), SessionKind::Stream);

        let stale =
            token::mint_recording_id_at(SessionKind::Recording, now - Duration::from_secs(61));
        assert!(matches!(
            factory.create_session_at(&headers(&signed(stale)), None, now),
            Err(RecorderError::TokenExpired { .. })
        ));

        let future =
            token::mint_recording_id_at(SessionKind::Recording, now + Duration::from_secs(5));
        assert!(matches!(
            factory.create_session_at(&headers(&signed(future)), None, now),
            Err(RecorderError::TokenFromFuture { .. })
        ));

        let snap = factory.metrics().snapshot();
        assert_eq!(snap.tokens_expired, 1);
        assert_eq!(snap.tokens_from_future, 1);
        assert_eq!(snap.auth_failures, 0);
    }

    #[test]
    fn rejects_forged_or_foreign_tokens() {
        let (factory, _) = factory();
        let now = SystemTime::now();

        let mut forged = signed(Uuid::nil());
        forged.signature[3] ^= 0x10;
        assert!(matches!(
            factory.create_session_at(&headers(&forged), None, now),
            Err(RecorderError::Auth {
                kind: AuthErrorKind::SignatureMismatch
            })
        ));

        let other_place = SessionToken::issue(
            SECRET,
            ACCOUNT,
            CAMERA,
            Uuid::from_u128(9),
            PERSON,
            Uuid::nil(),
        );
        assert!(matches!(
            factory.create_session_at(&headers(&other_place), None, now),
            Err(RecorderError::UnknownPlace(_))
        ));

        let random = signed(Uuid::from_u128(0x1234_5678_9abc_4def_8000_0000_0000_0001));
        assert!(matches!(
            factory.create_session_at(&headers(&random), None, now),
            Err(RecorderError::Auth {
                kind: AuthErrorKind::InvalidRecordingId
            })
        ));

        assert!(matches!(
            factory.create_session_at(&PushHeaders::default(), None, now),
            Err(RecorderError::Auth {
                kind: AuthErrorKind::MissingAuthorization
            })
        ));
        assert_eq!(factory.metrics().snapshot().auth_failures, 4);
    }

    #[test]
    fn live_recording_id_is_not_reused() {
        let (factory, _) = factory();
        let now = SystemTime::now();
        let id = token::mint_recording_id_at(SessionKind::Recording, now);
        let token = headers(&signed(id));

        let first = ConnectionHandle::detached();
        let mut session = factory
            .create_session_at(&token, Some(first.clone()), now)
            .unwrap();

        let second = ConnectionHandle::detached();
        assert!(matches!(
            factory.create_session_at(&token, Some(second), now),
            Err(RecorderError::DuplicateRecording(dup)) if dup == id
        ));
        assert!(matches!(
            factory.create_session_at(&token, None, now),
            Err(RecorderError::DuplicateRecording(_))
        ));

        assert!(factory.registry().get(&id).unwrap().same_connection(&first));
        assert!(factory.registry().stop(&id));
        assert!(first.is_closed());

        session.close();
        assert!(!factory.registry().contains(&id));
    }

    #[test]
    fn closing_stale_session_keeps_newer_registration() {
        let (factory, _) = factory();
        let now = SystemTime::now();
        let id = token::mint_recording_id_at(SessionKind::Recording, now);

        let mut old = factory
            .create_session_at(&headers(&signed(id)), Some(ConnectionHandle::detached()), now)
            .unwrap();
        let live = ConnectionHandle::detached();
        factory.registry().put(id, live.clone());

        old.close();
        assert!(factory.registry().contains(&id));
        assert!(factory.registry().stop(&id));
        assert!(live.is_closed());
    }

    #[test]
    fn registers_only_with_handle() {
        let (factory, _) = factory();
        let handle = ConnectionHandle::detached();
        let mut session = factory
            .create_session(&headers(&signed(Uuid::nil())), Some(handle))
            .unwrap();

        let id = session.recording_id();
        assert!(factory.registry().contains(&id));
        session.close();
        assert!(!factory.registry().contains(&id));
    }
}
