use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::process::{Child, Command};

use crate::config::Config;
use crate::session::Session;

use super::{DriverError, Handoff, Liveness};

/// A session backed by a child process on this host.
struct LocalAgent {
    port: u16,
    child: Child,
    initial_message: Option<String>,
}

/// Local-process driver: allocates a port from a configured range, spawns
/// the agent command with the session's environment bound, and reaps the
/// process on teardown.
pub struct LocalProcessDriver {
    config: Arc<Config>,
    /// Free ports. Allocation reserves, successful stop reclaims.
    ports: Mutex<BTreeSet<u16>>,
    agents: Mutex<HashMap<String, LocalAgent>>,
}

impl LocalProcessDriver {
    pub fn new(config: Arc<Config>) -> Self {
        let ports = (config.port_min..=config.port_max).collect();
        Self {
            config,
            ports: Mutex::new(ports),
            agents: Mutex::new(HashMap::new()),
        }
    }

    fn allocate_port(&self) -> Result<u16, DriverError> {
        let mut ports = self.ports.lock();
        let port = ports.iter().next().copied().ok_or(DriverError::PortsExhausted)?;
        ports.remove(&port);
        Ok(port)
    }

    fn release_port(&self, port: u16) {
        self.ports.lock().insert(port);
    }

    #[tracing::instrument(skip(self, session, handoff), fields(session_id = %session.id), err)]
    pub async fn provision(
        &self,
        session: &Session,
        handoff: &Handoff,
    ) -> Result<String, DriverError> {
        let port = self.allocate_port()?;

        let mut child = match self.spawn_agent(session, handoff, port).await {
            Ok(child) => child,
            Err(e) => {
                self.release_port(port);
                return Err(e);
            }
        };

        if let Err(e) = wait_listening(&mut child, port, self.config.ready_grace).await {
            let _ = child.kill().await;
            self.release_port(port);
            return Err(e);
        }

        tracing::info!(session_id = %session.id, port, pid = child.id(), "local agent listening");
        self.agents.lock().insert(
            session.id.clone(),
            LocalAgent {
                port,
                child,
                initial_message: handoff.initial_message.clone(),
            },
        );

        Ok(format!("127.0.0.1:{port}"))
    }

    async fn spawn_agent(
        &self,
        session: &Session,
        handoff: &Handoff,
        port: u16,
    ) -> Result<Child, DriverError> {
        let mut words = self.config.agent_command.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| DriverError::Spawn("agent command is empty".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(words)
            .envs(&session.environment)
            .env("AGENT_SESSION_ID", &session.id)
            .env("AGENT_PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(ref msg) = handoff.initial_message {
            cmd.env("AGENT_INITIAL_MESSAGE", msg);
        }
        if let Some(ref token) = handoff.github_token {
            cmd.env("GITHUB_TOKEN", token);
        }
        if let Some(ref agent_type) = handoff.agent_type {
            cmd.env("AGENT_TYPE", agent_type);
        }
        if handoff.oneshot {
            cmd.env("AGENT_ONESHOT", "1");
        }
        if let Some(ref repo) = session.repository {
            cmd.env("AGENT_REPOSITORY", &repo.full_name);
        }
        if let Some(ref payload) = handoff.webhook_payload {
            let path = std::env::temp_dir().join(format!("agent-{}-payload.json", session.id));
            tokio::fs::write(&path, payload).await?;
            cmd.env("AGENT_WEBHOOK_PAYLOAD_FILE", &path);
        }

        cmd.spawn()
            .map_err(|e| DriverError::Spawn(format!("{program}: {e}")))
    }

    /// Graceful stop: SIGTERM, grace window, then SIGKILL. Idempotent on
    /// unknown sessions. The port is reclaimed once the process is gone.
    #[tracing::instrument(skip(self), err)]
    pub async fn teardown(&self, session_id: &str) -> Result<(), DriverError> {
        let Some(mut agent) = self.agents.lock().remove(session_id) else {
            return Ok(());
        };

        if let Some(pid) = agent.child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        match tokio::time::timeout(self.config.stop_grace, agent.child.wait()).await {
            Ok(status) => {
                tracing::info!(session_id, status = ?status.ok(), "local agent stopped");
            }
            Err(_) => {
                tracing::warn!(session_id, "local agent ignored SIGTERM, force killing");
                let _ = agent.child.kill().await;
            }
        }

        self.release_port(agent.port);
        let payload_file = std::env::temp_dir().join(format!("agent-{session_id}-payload.json"));
        let _ = tokio::fs::remove_file(payload_file).await;
        Ok(())
    }

    pub fn liveness(&self, session_id: &str) -> Liveness {
        let mut agents = self.agents.lock();
        let Some(agent) = agents.get_mut(session_id) else {
            return Liveness::Stopped;
        };
        match agent.child.try_wait() {
            Ok(None) => Liveness::Running,
            Ok(Some(status)) if status.success() => Liveness::Stopped,
            Ok(Some(_)) | Err(_) => Liveness::Failed,
        }
    }

    pub fn initial_message(&self, session_id: &str) -> Option<String> {
        self.agents
            .lock()
            .get(session_id)
            .and_then(|a| a.initial_message.clone())
    }
}

/// Poll until the agent accepts TCP connections on its port, bounded by the
/// grace window. A child that exits during startup fails immediately.
async fn wait_listening(child: &mut Child, port: u16, grace: Duration) -> Result<(), DriverError> {
    let deadline = tokio::time::Instant::now() + grace;

    loop {
        if let Some(status) = child.try_wait()? {
            return Err(DriverError::Spawn(format!(
                "agent exited during startup: {status}"
            )));
        }
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(DriverError::NotReady(format!(
                "agent not listening on port {port} within {}s",
                grace.as_secs()
            )));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;

    use crate::session::{Scope, SessionStatus};

    use super::*;

    fn test_config(port_min: u16, port_max: u16) -> Arc<Config> {
        let mut cfg = Config::load();
        cfg.port_min = port_min;
        cfg.port_max = port_max;
        cfg.ready_grace = Duration::from_millis(300);
        cfg.stop_grace = Duration::from_millis(300);
        cfg.agent_command = "definitely-not-a-real-agent-binary".into();
        Arc::new(cfg)
    }

    fn test_session(id: &str) -> Session {
        Session {
            id: id.into(),
            user_id: "u1".into(),
            scope: Scope::User,
            team_id: None,
            status: SessionStatus::Initializing,
            addr: String::new(),
            environment: HashMap::new(),
            tags: HashMap::new(),
            started_at: Utc::now(),
            updated_at: Utc::now(),
            description: None,
            repository: None,
        }
    }

    #[test]
    fn port_pool_exhaustion() {
        let driver = LocalProcessDriver::new(test_config(19300, 19302));
        assert_eq!(driver.allocate_port().unwrap(), 19300);
        assert_eq!(driver.allocate_port().unwrap(), 19301);
        assert_eq!(driver.allocate_port().unwrap(), 19302);
        assert!(matches!(
            driver.allocate_port(),
            Err(DriverError::PortsExhausted)
        ));
    }

    #[test]
    fn released_port_is_reusable() {
        let driver = LocalProcessDriver::new(test_config(19310, 19310));
        let port = driver.allocate_port().unwrap();
        assert!(driver.allocate_port().is_err());
        driver.release_port(port);
        assert_eq!(driver.allocate_port().unwrap(), port);
    }

    #[tokio::test]
    async fn spawn_failure_releases_port() {
        let driver = LocalProcessDriver::new(test_config(19320, 19320));
        let session = test_session("s-spawn-fail");
        let err = driver
            .provision(&session, &Handoff::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Spawn(_)), "got {err:?}");
        // The single port must be back in the pool.
        assert_eq!(driver.allocate_port().unwrap(), 19320);
    }

    #[tokio::test]
    async fn non_listening_agent_times_out() {
        let mut cfg = Config::load();
        cfg.port_min = 19330;
        cfg.port_max = 19330;
        cfg.ready_grace = Duration::from_millis(300);
        cfg.stop_grace = Duration::from_millis(300);
        // Alive but never listens.
        cfg.agent_command = "sleep 30".into();
        let driver = LocalProcessDriver::new(Arc::new(cfg));

        let session = test_session("s-no-listen");
        let err = driver
            .provision(&session, &Handoff::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::NotReady(_)), "got {err:?}");
        assert_eq!(driver.allocate_port().unwrap(), 19330);
    }

    #[tokio::test]
    async fn teardown_unknown_session_is_idempotent() {
        let driver = LocalProcessDriver::new(test_config(19340, 19341));
        driver.teardown("never-existed").await.unwrap();
        driver.teardown("never-existed").await.unwrap();
    }

    #[test]
    fn liveness_unknown_session_is_stopped() {
        let driver = LocalProcessDriver::new(test_config(19350, 19351));
        assert_eq!(driver.liveness("nope"), Liveness::Stopped);
    }
}
