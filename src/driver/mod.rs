pub mod kubernetes;
pub mod local;
pub mod resources;

use bytes::Bytes;

use crate::session::Session;

pub use kubernetes::KubernetesDriver;
pub use local::LocalProcessDriver;

// ---------------------------------------------------------------------------
// Capability surface
// ---------------------------------------------------------------------------

/// Provisioning-time handoff to the agent. Delivered through a side channel
/// (Secret mount under Kubernetes, environment under local mode) so each
/// session observes its initial message exactly once.
#[derive(Debug, Clone, Default)]
pub struct Handoff {
    pub initial_message: Option<String>,
    pub github_token: Option<String>,
    pub agent_type: Option<String>,
    pub oneshot: bool,
    /// Raw webhook request body, materialised as a file for the agent.
    pub webhook_payload: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("no free ports in configured range")]
    PortsExhausted,

    #[error("agent process failed to start: {0}")]
    Spawn(String),

    #[error("backend not ready: {0}")]
    NotReady(String),

    #[error(transparent)]
    Kubernetes(#[from] kube::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// The provisioning backend, selected once at startup from config. Both
/// variants expose the same capability set: provision, teardown, liveness,
/// initial-message retrieval, discovery, and metadata persistence.
pub enum Driver {
    LocalProcess(LocalProcessDriver),
    Kubernetes(KubernetesDriver),
}

impl Driver {
    /// Materialise the session into a reachable endpoint. Returns the
    /// address (`host:port`) once the backend accepts connections, or
    /// `NotReady` if that does not happen within the configured grace
    /// window.
    pub async fn provision(
        &self,
        session: &Session,
        handoff: &Handoff,
    ) -> Result<String, DriverError> {
        match self {
            Self::LocalProcess(d) => d.provision(session, handoff).await,
            Self::Kubernetes(d) => d.provision(session, handoff).await,
        }
    }

    /// Destroy the session's backend resources. Idempotent.
    pub async fn teardown(&self, session: &Session) -> Result<(), DriverError> {
        match self {
            Self::LocalProcess(d) => d.teardown(&session.id).await,
            Self::Kubernetes(d) => d.teardown(&session.id).await,
        }
    }

    pub async fn liveness(&self, session: &Session) -> Result<Liveness, DriverError> {
        match self {
            Self::LocalProcess(d) => Ok(d.liveness(&session.id)),
            Self::Kubernetes(d) => d.liveness(&session.id).await,
        }
    }

    /// Read back the initial message handed to the agent at provision time.
    pub async fn initial_message(&self, session: &Session) -> Result<Option<String>, DriverError> {
        match self {
            Self::LocalProcess(d) => Ok(d.initial_message(&session.id)),
            Self::Kubernetes(d) => d.initial_message(&session.id).await,
        }
    }

    /// Rebuild the session set from driver-managed resources. The local
    /// driver owns no state that survives a restart, so it reports nothing.
    pub async fn discover(&self) -> Result<Vec<Session>, DriverError> {
        match self {
            Self::LocalProcess(_) => Ok(Vec::new()),
            Self::Kubernetes(d) => d.discover().await,
        }
    }

    /// Persist mutable session metadata (updated-at, description, tags)
    /// back to the driver's annotation store.
    pub async fn persist_metadata(&self, session: &Session) -> Result<(), DriverError> {
        match self {
            Self::LocalProcess(_) => Ok(()),
            Self::Kubernetes(d) => d.persist_metadata(session).await,
        }
    }
}
