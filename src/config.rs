use std::env;
use std::time::Duration;

/// Which provisioning backend materialises sessions. Selected once at
/// startup; there is no per-request branching on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    LocalProcess,
    Kubernetes,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub driver: DriverKind,

    /// Kubernetes namespace agent resources are created in.
    pub namespace: String,
    /// Container image for agent pods.
    pub agent_image: String,
    /// Fixed internal port the agent process serves on (Kubernetes driver).
    pub agent_port: u16,

    /// Command line used to launch a local agent process. The allocated
    /// port is exported to the child as `AGENT_PORT`.
    pub agent_command: String,
    /// Inclusive port range the local driver allocates from.
    pub port_min: u16,
    pub port_max: u16,

    /// How long a driver may take to produce a reachable endpoint.
    pub ready_grace: Duration,
    /// Graceful-termination window before force-kill.
    pub stop_grace: Duration,

    /// Lifetime of a share token.
    pub share_ttl: Duration,

    /// Request body cap enforced at the HTTP server layer.
    pub max_body_bytes: usize,
}

impl Config {
    pub fn load() -> Self {
        Self {
            listen: env::var("GATEWAY_LISTEN").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            driver: match env::var("GATEWAY_DRIVER").as_deref() {
                Ok("kubernetes") => DriverKind::Kubernetes,
                _ => DriverKind::LocalProcess,
            },
            namespace: env::var("GATEWAY_K8S_NAMESPACE").unwrap_or_else(|_| "agents".into()),
            agent_image: env::var("GATEWAY_AGENT_IMAGE")
                .unwrap_or_else(|_| "agent-server:latest".into()),
            agent_port: parse_env("GATEWAY_AGENT_PORT", 3284),
            agent_command: env::var("GATEWAY_AGENT_COMMAND")
                .unwrap_or_else(|_| "agent-server serve".into()),
            port_min: parse_env("GATEWAY_PORT_MIN", 9000),
            port_max: parse_env("GATEWAY_PORT_MAX", 9999),
            ready_grace: Duration::from_secs(parse_env("GATEWAY_READY_GRACE_SECS", 30)),
            stop_grace: Duration::from_secs(parse_env("GATEWAY_STOP_GRACE_SECS", 10)),
            share_ttl: Duration::from_secs(parse_env("GATEWAY_SHARE_TTL_SECS", 86_400)),
            max_body_bytes: parse_env("GATEWAY_MAX_BODY_BYTES", 10 * 1024 * 1024),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
