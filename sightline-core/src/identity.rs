//! Anonymous visitor and session identity
//!
//! The anonymous id lives in long-lived storage and never changes until the
//! host clears storage or the visitor resets. The session id lives in
//! session storage and rotates after an idle timeout.
//!
//! Writes are fire-and-forget. When storage rejects a write, ids are kept in
//! memory for the rest of the page life and the store keeps working.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use uuid::Uuid;

use crate::storage::{keys, Storage};

/// When a session is considered over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Inactivity after which the next lookup starts a new session
    pub idle_timeout: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl SessionPolicy {
    pub fn is_expired(&self, session: &SessionRecord, now_ms: i64) -> bool {
        now_ms.saturating_sub(session.last_activity_ms) >= self.idle_timeout.as_millis() as i64
    }
}

/// A session as persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: String,
    pub started_at_ms: i64,
    pub last_activity_ms: i64,
}

#[derive(Debug, Default)]
struct IdentityState {
    anonymous_id: Option<String>,
    /// The last write of `anonymous_id` reached storage
    anonymous_persisted: bool,
    session: Option<SessionRecord>,
    session_persisted: bool,
}

/// Reads and mints visitor/session identifiers
pub struct IdentityStore {
    local: Arc<dyn Storage>,
    session: Arc<dyn Storage>,
    policy: SessionPolicy,
    state: Mutex<IdentityState>,
}

impl IdentityStore {
    pub fn new(local: Arc<dyn Storage>, session: Arc<dyn Storage>, policy: SessionPolicy) -> Self {
        Self {
            local,
            session,
            policy,
            state: Mutex::new(IdentityState::default()),
        }
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    /// The anonymous id, minting and persisting one on first use
    pub fn get_or_create_anonymous_id(&self) -> String {
        let mut state = self.lock();

        match self.local.get(keys::ANONYMOUS_ID) {
            Ok(Some(stored)) if !stored.is_empty() => {
                state.anonymous_id = Some(stored.clone());
                state.anonymous_persisted = true;
                return stored;
            }
            Ok(_) => {
                // Never persisted: keep the in-memory id and try to store it again.
                if let Some(id) = state.anonymous_id.clone() {
                    if !state.anonymous_persisted {
                        state.anonymous_persisted = write(&*self.local, keys::ANONYMOUS_ID, &id);
                        return id;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "anonymous id read failed, using in-memory identity");
                if let Some(id) = state.anonymous_id.clone() {
                    return id;
                }
            }
        }

        let id = generate_anonymous_id();
        state.anonymous_persisted = write(&*self.local, keys::ANONYMOUS_ID, &id);
        state.anonymous_id = Some(id.clone());
        id
    }

    /// Adopt an anonymous id handed over by another origin
    pub fn adopt_anonymous_id(&self, id: &str) {
        let mut state = self.lock();
        state.anonymous_persisted = write(&*self.local, keys::ANONYMOUS_ID, id);
        state.anonymous_id = Some(id.to_string());
    }

    /// The session id, rotating it when the current session is idle too long
    pub fn get_or_create_session_id(&self, now_ms: i64) -> String {
        let mut state = self.lock();

        let current = match self.read_session() {
            Ok(Some(stored)) => {
                state.session_persisted = true;
                Some(stored)
            }
            Ok(None) if state.session_persisted => None,
            Ok(None) => state.session.clone(),
            Err(e) => {
                tracing::debug!(error = %e, "session read failed, using in-memory session");
                state.session.clone()
            }
        };

        if let Some(mut session) = current {
            if !self.policy.is_expired(&session, now_ms) {
                session.last_activity_ms = session.last_activity_ms.max(now_ms);
                state.session_persisted = if state.session_persisted {
                    write(
                        &*self.session,
                        keys::SESSION_TIMESTAMP,
                        &session.last_activity_ms.to_string(),
                    )
                } else {
                    self.persist_session(&session)
                };
                let id = session.id.clone();
                state.session = Some(session);
                return id;
            }

            tracing::debug!(session_id = %session.id, "session expired, rotating");
            self.clear_session_keys();
        }

        let session = SessionRecord {
            id: generate_session_id(),
            started_at_ms: now_ms,
            last_activity_ms: now_ms,
        };
        state.session_persisted = self.persist_session(&session);
        let id = session.id.clone();
        state.session = Some(session);
        id
    }

    /// Adopt a session id handed over by another origin, starting it now
    pub fn adopt_session_id(&self, id: &str, now_ms: i64) {
        let mut state = self.lock();
        let session = SessionRecord {
            id: id.to_string(),
            started_at_ms: now_ms,
            last_activity_ms: now_ms,
        };
        state.session_persisted = self.persist_session(&session);
        state.session = Some(session);
    }

    /// Start time of the current session, if one exists
    pub fn session_start_ms(&self) -> Option<i64> {
        self.lock().session.as_ref().map(|s| s.started_at_ms)
    }

    /// The anonymous id known so far, without minting one
    pub fn anonymous_id(&self) -> Option<String> {
        let state = self.lock();
        state.anonymous_id.clone().or_else(|| {
            self.local
                .get(keys::ANONYMOUS_ID)
                .ok()
                .flatten()
                .filter(|id| !id.is_empty())
        })
    }

    /// The session known so far, without minting one
    pub fn session(&self) -> Option<SessionRecord> {
        let state = self.lock();
        state
            .session
            .clone()
            .or_else(|| self.read_session().ok().flatten())
    }

    /// End the current session; the next lookup starts a new one
    pub fn expire_session(&self) {
        let mut state = self.lock();
        self.clear_session_keys();
        state.session = None;
        state.session_persisted = false;
    }

    /// Forget both identities and mint fresh ones
    pub fn reset(&self, now_ms: i64) -> (String, String) {
        {
            let mut state = self.lock();
            if let Err(e) = self.local.remove(keys::ANONYMOUS_ID) {
                tracing::debug!(error = %e, "failed to remove anonymous id");
            }
            self.clear_session_keys();
            *state = IdentityState::default();
        }
        (
            self.get_or_create_anonymous_id(),
            self.get_or_create_session_id(now_ms),
        )
    }

    fn read_session(&self) -> crate::error::Result<Option<SessionRecord>> {
        let id = match self.session.get(keys::SESSION_ID)? {
            Some(id) if !id.is_empty() => id,
            _ => return Ok(None),
        };
        let last_activity_ms = match self
            .session
            .get(keys::SESSION_TIMESTAMP)?
            .and_then(|ts| ts.parse::<i64>().ok())
        {
            Some(ts) => ts,
            None => return Ok(None),
        };
        let started_at_ms = self
            .session
            .get(keys::SESSION_START)?
            .and_then(|ts| ts.parse::<i64>().ok())
            .unwrap_or(last_activity_ms);

        Ok(Some(SessionRecord {
            id,
            started_at_ms,
            last_activity_ms,
        }))
    }

    fn persist_session(&self, session: &SessionRecord) -> bool {
        write(&*self.session, keys::SESSION_ID, &session.id)
            && write(
                &*self.session,
                keys::SESSION_TIMESTAMP,
                &session.last_activity_ms.to_string(),
            )
            && write(
                &*self.session,
                keys::SESSION_START,
                &session.started_at_ms.to_string(),
            )
    }

    fn clear_session_keys(&self) {
        for key in [keys::SESSION_ID, keys::SESSION_TIMESTAMP, keys::SESSION_START] {
            if let Err(e) = self.session.remove(key) {
                tracing::debug!(key, error = %e, "failed to remove session key");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, IdentityState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Write `value`, returning whether it reached storage
fn write(storage: &dyn Storage, key: &str, value: &str) -> bool {
    match storage.set(key, value) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(key, error = %e, "storage write failed, identity kept in memory");
            false
        }
    }
}

/// A new opaque visitor id
pub fn generate_anonymous_id() -> String {
    format!("anon_{}", Uuid::new_v4())
}

/// A new opaque session id
pub fn generate_session_id() -> String {
    format!("sess_{}", Uuid::new_v4())
}
