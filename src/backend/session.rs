//! Reference-Counted Array Sessions
//!
//! Every backend shares one logged-in session with its array across all
//! concurrent operations. Callers acquire a [`SessionLease`] before talking to
//! the array and release it afterwards; the last release logs out.
//!
//! The holder count and the online flag change together under one async
//! mutex, which is also held across login and logout so that two callers can
//! never race a login against a logout.

use crate::domain::ArrayClient;
use crate::error::Result;
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

// =============================================================================
// Session State
// =============================================================================

#[derive(Debug, Default)]
struct SessionState {
    holders: u32,
    online: bool,
    logins: u64,
    last_login: Option<DateTime<Utc>>,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub holders: u32,
    pub online: bool,
    pub logins: u64,
    pub last_login: Option<DateTime<Utc>>,
}

// =============================================================================
// Array Session
// =============================================================================

/// Shared login session of one backend
pub struct ArraySession {
    backend: String,
    client: Arc<dyn ArrayClient>,
    state: Mutex<SessionState>,
    /// Lock-free mirror of `state.online` for hot-path reads
    online: AtomicBool,
}

impl std::fmt::Debug for ArraySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArraySession")
            .field("backend", &self.backend)
            .field("online", &self.is_online())
            .finish()
    }
}

impl ArraySession {
    pub fn new(backend: impl Into<String>, client: Arc<dyn ArrayClient>) -> Arc<Self> {
        Arc::new(Self {
            backend: backend.into(),
            client,
            state: Mutex::new(SessionState::default()),
            online: AtomicBool::new(false),
        })
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn client(&self) -> &Arc<dyn ArrayClient> {
        &self.client
    }

    /// Whether the last login succeeded and holders remain
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        SessionSnapshot {
            holders: state.holders,
            online: state.online,
            logins: state.logins,
            last_login: state.last_login,
        }
    }

    fn set_online(&self, state: &mut SessionState, online: bool) {
        state.online = online;
        self.online.store(online, Ordering::Release);
    }

    /// Take a hold on the session, logging in when offline or unheld
    ///
    /// On login failure the holder count is unchanged and the session is
    /// marked offline.
    pub async fn acquire(self: &Arc<Self>) -> Result<SessionLease> {
        let mut state = self.state.lock().await;

        if !state.online || state.holders == 0 {
            match self.client.login().await {
                Ok(()) => {
                    state.logins += 1;
                    state.last_login = Some(Utc::now());
                    metrics::record_login(&self.backend, true);
                    debug!("Logged in to backend {}", self.backend);
                }
                Err(e) => {
                    self.set_online(&mut state, false);
                    metrics::record_login(&self.backend, false);
                    warn!("Login to backend {} failed: {}", self.backend, e);
                    return Err(e);
                }
            }
        }

        state.holders += 1;
        self.set_online(&mut state, true);
        metrics::set_session_holders(&self.backend, state.holders);

        Ok(SessionLease {
            client: Arc::clone(&self.client),
            session: Some(Arc::clone(self)),
        })
    }

    /// Drop one hold; the last one logs out
    async fn release_one(&self) {
        let mut state = self.state.lock().await;

        if state.holders == 0 {
            warn!(
                "Release of backend {} session without holders, ignoring",
                self.backend
            );
            return;
        }

        state.holders -= 1;
        metrics::set_session_holders(&self.backend, state.holders);

        if state.holders == 0 {
            self.logout_locked(&mut state).await;
        }
    }

    async fn logout_locked(&self, state: &mut SessionState) {
        if let Err(e) = self.client.logout().await {
            warn!("Logout from backend {} failed: {}", self.backend, e);
        } else {
            debug!("Logged out of backend {}", self.backend);
        }
        metrics::record_logout(&self.backend);
        self.set_online(state, false);
    }

    /// Demote the session after a failed liveness probe
    ///
    /// Holders are kept; the next acquire logs in again.
    pub async fn mark_offline(&self) {
        let mut state = self.state.lock().await;
        if state.online {
            warn!("Backend {} marked offline", self.backend);
        }
        self.set_online(&mut state, false);
    }

    /// Force logout regardless of holders
    pub async fn terminate(&self) {
        let mut state = self.state.lock().await;
        if state.holders > 0 || state.online {
            info!(
                "Terminating backend {} session with {} holders",
                self.backend, state.holders
            );
            self.logout_locked(&mut state).await;
        }
        state.holders = 0;
        metrics::set_session_holders(&self.backend, 0);
    }
}

// =============================================================================
// Session Lease
// =============================================================================

/// One hold on an [`ArraySession`]
///
/// Call [`SessionLease::release`] when done. A lease dropped without release
/// (e.g. a cancelled future) releases itself on the runtime.
#[must_use = "a lease holds the array session open until released"]
pub struct SessionLease {
    client: Arc<dyn ArrayClient>,
    session: Option<Arc<ArraySession>>,
}

impl SessionLease {
    /// Client of the held session
    pub fn client(&self) -> &Arc<dyn ArrayClient> {
        &self.client
    }

    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            session.release_one().await;
        }
    }

    /// Keep the hold for the lifetime of the backend
    ///
    /// Used by keep-login initialization; the hold ends at
    /// [`ArraySession::terminate`].
    pub fn into_resident(mut self) {
        if let Some(session) = self.session.take() {
            debug!("Backend {} session kept resident", session.backend());
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        warn!(
            "Session lease on backend {} dropped without release, releasing in background",
            session.backend()
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    session.release_one().await;
                });
            }
            Err(_) => error!(
                "No runtime to release backend {} session, holder leaked",
                session.backend()
            ),
        }
    }
}
