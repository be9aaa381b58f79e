//! Session registry: session key → live [`Session`].
//!
//! Sessions are created lazily by [`SessionRegistry::resolve`]. The lookup,
//! launch, and insert run under one acquisition of the map lock, so two
//! concurrent first requests for the same key start exactly one child.
//!
//! Every session gets one eviction task when it is created. Under
//! [`EvictionPolicy::Fixed`] the task fires once, a fixed lifetime after
//! creation, no matter how recently the session was used. Under
//! [`EvictionPolicy::Idle`] it re-arms from the last activity instead, and
//! never fires while an exchange is in progress. On firing it unregisters
//! the session (only if the key still maps to it) and closes it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::session::instance::Session;
use crate::session::spawner::{Launcher, ProcessLauncher};
use crate::Result;

/// How a session's eviction timer is measured.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict once, a fixed lifetime after creation.
    #[default]
    Fixed,
    /// Evict once the session has been idle for the whole window.
    Idle,
}

/// What the gateway does with a session whose exchange timed out.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Unregister and close it; its pipe may still hold a late reply.
    #[default]
    Evict,
    /// Keep it registered.
    Retain,
}

type SessionMap = Arc<Mutex<HashMap<String, Arc<Session>>>>;

/// Concurrent map of live sessions with per-session eviction.
pub struct SessionRegistry {
    launcher: Arc<dyn Launcher>,
    sessions: SessionMap,
    ttl: Duration,
    eviction: EvictionPolicy,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("ttl", &self.ttl)
            .field("eviction", &self.eviction)
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Create an empty registry that launches sessions through `launcher`.
    #[must_use]
    pub fn new(launcher: Arc<dyn Launcher>, ttl: Duration, eviction: EvictionPolicy) -> Self {
        Self {
            launcher,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            eviction,
            cancel: CancellationToken::new(),
        }
    }

    /// Registry spawning `config.command` per session.
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            Arc::new(ProcessLauncher::new(config.spawn_config())),
            config.session_ttl(),
            config.eviction,
        )
    }

    /// Return the live session for `key`, launching one if none exists.
    ///
    /// # Errors
    ///
    /// Propagates the launcher's [`AppError::ProcessStart`](crate::AppError::ProcessStart);
    /// nothing is registered in that case.
    pub async fn resolve(&self, key: &str) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(key) {
            if !existing.is_closed() {
                return Ok(Arc::clone(existing));
            }
            debug!(session_key = key, "replacing closed session");
        }

        let session = Arc::new(self.launcher.launch(key)?);
        sessions.insert(key.to_owned(), Arc::clone(&session));
        let live = sessions.len();
        drop(sessions);

        self.arm_eviction(key.to_owned(), &session);
        info!(
            session_key = key,
            live_sessions = live,
            ttl = ?self.ttl,
            eviction = ?self.eviction,
            "session created"
        );
        Ok(session)
    }

    /// Unregister and close the session for `key`.
    ///
    /// Returns `false` when no session was registered under `key`.
    ///
    /// # Errors
    ///
    /// Propagates [`Session::close`] failures.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let removed = self.sessions.lock().await.remove(key);
        match removed {
            Some(session) => {
                session.close().await?;
                info!(session_key = key, "session removed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Unregister `session` if its key still maps to it, then close it.
    ///
    /// A newer session registered under the same key is left alone.
    ///
    /// # Errors
    ///
    /// Propagates [`Session::close`] failures.
    pub async fn discard(&self, session: &Arc<Session>) -> Result<()> {
        unregister(&self.sessions, session).await;
        session.close().await
    }

    /// Whether a session is registered under `key`.
    pub async fn contains(&self, key: &str) -> bool {
        self.sessions.lock().await.contains_key(key)
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether no session is registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Stop all eviction timers and close every registered session.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let drained: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        let count = drained.len();

        let results = join_all(drained.iter().map(|session| session.close())).await;
        for (session, result) in drained.iter().zip(results) {
            if let Err(err) = result {
                warn!(session_key = session.key(), %err, "failed to close session on shutdown");
            }
        }

        info!(sessions = count, "session registry shut down");
    }

    fn arm_eviction(&self, key: String, session: &Arc<Session>) {
        let sessions = Arc::clone(&self.sessions);
        let weak: Weak<Session> = Arc::downgrade(session);
        let ttl = self.ttl;
        let policy = self.eviction;
        let cancel = self.cancel.clone();
        let mut deadline = session.created_at() + ttl;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep_until(deadline) => {}
                }

                let Some(session) = weak.upgrade() else {
                    return;
                };
                if session.is_closed() {
                    unregister(&sessions, &session).await;
                    return;
                }

                if policy == EvictionPolicy::Idle {
                    let now = tokio::time::Instant::now();
                    if session.is_busy() {
                        // An exchange in progress counts as activity.
                        deadline = now + ttl;
                        continue;
                    }
                    let idle_deadline = session.last_activity() + ttl;
                    if idle_deadline > now {
                        deadline = idle_deadline;
                        continue;
                    }
                }

                unregister(&sessions, &session).await;
                info!(session_key = key.as_str(), ?policy, "evicting session");
                if let Err(err) = session.close().await {
                    warn!(session_key = key.as_str(), %err, "failed to close evicted session");
                }
                return;
            }
        });
    }
}

/// Remove `session` from `sessions` if its key still maps to it.
async fn unregister(sessions: &SessionMap, session: &Arc<Session>) {
    let mut map = sessions.lock().await;
    if map
        .get(session.key())
        .is_some_and(|current| Arc::ptr_eq(current, session))
    {
        map.remove(session.key());
    }
}
