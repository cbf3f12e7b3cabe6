use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::config::Config;
use crate::driver::{Driver, DriverError, Handoff, Liveness};

use super::{NewSession, Scope, Session, SessionError, SessionFilter, SessionStatus};

/// How long a background metadata write may take before it is dropped.
const PERSIST_DEADLINE: Duration = Duration::from_secs(5);

/// Single source of truth for active sessions. The index is guarded by one
/// RW lock: list/get take read locks, create/delete/touch take write locks,
/// and no lock is held across a driver call. The backing store is the
/// driver itself; the index can always be rebuilt via `resync`.
pub struct SessionManager {
    config: Arc<Config>,
    driver: Arc<Driver>,
    index: RwLock<HashMap<String, Session>>,
    client: reqwest::Client,
}

impl SessionManager {
    pub fn new(config: Arc<Config>, driver: Arc<Driver>) -> Self {
        Self {
            config,
            driver,
            index: RwLock::new(HashMap::new()),
            client: reqwest::Client::new(),
        }
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    /// Rebuild the index from driver-managed resources. Sessions already
    /// present locally win over rediscovered state.
    pub async fn resync(&self) -> Result<usize, SessionError> {
        let discovered = self
            .driver
            .discover()
            .await
            .map_err(|e| SessionError::Internal(e.into()))?;

        let mut index = self.index.write();
        let mut adopted = 0;
        for session in discovered {
            if !index.contains_key(&session.id) {
                index.insert(session.id.clone(), session);
                adopted += 1;
            }
        }
        Ok(adopted)
    }

    /// Register an externally materialised session (rediscovery, tests).
    pub fn adopt(&self, session: Session) {
        self.index.write().insert(session.id.clone(), session);
    }

    /// Allocate driver resources and insert the session, `active` with a
    /// populated address, into the index.
    #[tracing::instrument(skip(self, req), fields(user_id = %req.user_id), err)]
    pub async fn create(&self, req: NewSession) -> Result<Session, SessionError> {
        let team_id = match req.scope {
            Scope::Team => match req.team_id {
                Some(ref t) if !t.trim().is_empty() => Some(t.trim().to_owned()),
                _ => {
                    return Err(SessionError::InvalidScope(
                        "team scope requires a team_id".into(),
                    ));
                }
            },
            Scope::User => None,
        };

        let now = Utc::now();
        let mut session = Session {
            id: Uuid::new_v4().to_string(),
            user_id: req.user_id,
            scope: req.scope,
            team_id,
            status: SessionStatus::Initializing,
            addr: String::new(),
            environment: req.environment,
            tags: req.tags,
            started_at: now,
            updated_at: now,
            description: req.description,
            repository: req.repository,
        };

        let handoff = Handoff {
            initial_message: req.initial_message,
            github_token: req
                .github_token
                .or_else(|| session.repository.as_ref().and_then(|r| r.token.clone())),
            agent_type: req.agent_type,
            oneshot: req.oneshot,
            webhook_payload: req.webhook_payload,
        };

        match self.driver.provision(&session, &handoff).await {
            Ok(addr) => {
                session.addr = addr;
                session.status = SessionStatus::Active;
                session.updated_at = Utc::now();
                self.index
                    .write()
                    .insert(session.id.clone(), session.clone());
                tracing::info!(session_id = %session.id, addr = %session.addr, "session active");
                Ok(session)
            }
            Err(e) => {
                // Compensate for partially created resources.
                if let Err(cleanup) = self.driver.teardown(&session).await {
                    tracing::warn!(
                        session_id = %session.id,
                        error = %cleanup,
                        "cleanup after failed provision also failed"
                    );
                }
                match e {
                    DriverError::NotReady(msg) => Err(SessionError::BackendUnavailable(msg)),
                    other => Err(SessionError::Internal(other.into())),
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.index.read().get(id).cloned()
    }

    /// Snapshot of sessions matching the filter; the underlying set may
    /// change the moment the lock is released.
    pub fn list(&self, filter: &SessionFilter) -> Vec<Session> {
        self.index
            .read()
            .values()
            .filter(|s| s.matches(filter))
            .cloned()
            .collect()
    }

    /// Tear the session down and drop it from the index. Repeated deletes
    /// of the same id succeed.
    #[tracing::instrument(skip(self), err)]
    pub async fn delete(&self, id: &str) -> Result<(), SessionError> {
        let session = {
            let mut index = self.index.write();
            let Some(session) = index.get_mut(id) else {
                return Ok(());
            };
            session.status = SessionStatus::Terminating;
            session.clone()
        };

        if let Err(e) = self.driver.teardown(&session).await {
            // Leave the record in `terminating`; a repeated delete retries.
            tracing::error!(session_id = %id, error = %e, "driver teardown failed");
            return Err(SessionError::Internal(e.into()));
        }

        self.index.write().remove(id);
        tracing::info!(session_id = %id, "session terminated");
        Ok(())
    }

    /// Forward a user-role message to the session's backend. Used by the
    /// webhook reuse path.
    #[tracing::instrument(skip(self, text), err)]
    pub async fn send_message(&self, id: &str, text: &str) -> Result<(), SessionError> {
        let session = self
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_owned()))?;

        if session.status != SessionStatus::Active {
            return Err(SessionError::NotReachable(format!(
                "session {id} is {}",
                session.status.as_str()
            )));
        }

        let url = format!("http://{}/message", session.addr);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "content": text, "type": "user" }))
            .send()
            .await
            .map_err(|e| SessionError::NotReachable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(SessionError::NotReachable(format!(
                "message endpoint returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Bump `updated_at` (and capture a first-message description when none
    /// exists), then persist the metadata in the background. Persistence
    /// failures are logged, never surfaced.
    pub fn touch_updated_at(&self, id: &str, description: Option<String>) {
        let updated = {
            let mut index = self.index.write();
            let Some(session) = index.get_mut(id) else {
                return;
            };
            let now = Utc::now();
            if now > session.updated_at {
                session.updated_at = now;
            }
            if session.description.is_none()
                && let Some(desc) = description
            {
                session.description = Some(desc);
            }
            session.clone()
        };

        let driver = Arc::clone(&self.driver);
        tokio::spawn(async move {
            let result =
                tokio::time::timeout(PERSIST_DEADLINE, driver.persist_metadata(&updated)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(session_id = %updated.id, error = %e, "metadata persist failed");
                }
                Err(_) => {
                    tracing::warn!(session_id = %updated.id, "metadata persist timed out");
                }
            }
        });
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Background reaper
// ---------------------------------------------------------------------------

/// Periodically probe active sessions and drop the ones whose backend has
/// gone away. Terminal sessions never linger in the index.
pub async fn run_reaper(manager: Arc<SessionManager>, mut shutdown: tokio::sync::watch::Receiver<()>) {
    tracing::info!("session reaper started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("session reaper shutting down");
                break;
            }
            () = tokio::time::sleep(Duration::from_secs(30)) => {
                reap_dead_sessions(&manager).await;
            }
        }
    }
}

async fn reap_dead_sessions(manager: &Arc<SessionManager>) {
    let active = manager.list(&SessionFilter {
        status: Some(SessionStatus::Active),
        ..Default::default()
    });

    for session in active {
        match manager.driver.liveness(&session).await {
            Ok(Liveness::Running) => {}
            Ok(state) => {
                let status = if state == Liveness::Failed {
                    SessionStatus::Failed
                } else {
                    SessionStatus::Terminated
                };
                tracing::warn!(
                    session_id = %session.id,
                    status = status.as_str(),
                    "backend gone, reaping session"
                );
                let _ = manager.driver.teardown(&session).await;
                manager.index.write().remove(&session.id);
            }
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "liveness probe failed");
            }
        }
    }
}
