pub mod manager;

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use manager::SessionManager;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Resource visibility: private to the owner, or shared with a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    User,
    Team,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Team => "team",
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "team" => Ok(Self::Team),
            other => anyhow::bail!("unknown scope: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Active,
    Terminating,
    Terminated,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "active" => Ok(Self::Active),
            "terminating" => Ok(Self::Terminating),
            "terminated" => Ok(Self::Terminated),
            "failed" => Ok(Self::Failed),
            other => anyhow::bail!("unknown session status: {other}"),
        }
    }
}

/// Repository the agent works against, plus an optional VCS access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// A live conversation/worker context addressable by its id.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub scope: Scope,
    pub team_id: Option<String>,
    pub status: SessionStatus,
    /// host:port (or cluster DNS name:port) reachable by the proxy.
    /// Populated before the session becomes `active`.
    pub addr: String,
    pub environment: HashMap<String, String>,
    /// User metadata, and the webhook routing fingerprint.
    pub tags: HashMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub description: Option<String>,
    pub repository: Option<RepositoryRef>,
}

impl Session {
    /// Tag subset match: every filter key must be present with the exact
    /// value. This is the identity used by webhook session-reuse.
    pub fn tags_match(&self, filter: &HashMap<String, String>) -> bool {
        filter
            .iter()
            .all(|(k, v)| self.tags.get(k).is_some_and(|tag| tag == v))
    }

    pub fn matches(&self, filter: &SessionFilter) -> bool {
        if let Some(status) = filter.status
            && self.status != status
        {
            return false;
        }
        if let Some(scope) = filter.scope
            && self.scope != scope
        {
            return false;
        }
        if let Some(ref user_id) = filter.user_id
            && &self.user_id != user_id
        {
            return false;
        }
        if let Some(ref team_id) = filter.team_id
            && self.team_id.as_ref() != Some(team_id)
        {
            return false;
        }
        if let Some(ref team_ids) = filter.team_ids
            && !self
                .team_id
                .as_ref()
                .is_some_and(|t| team_ids.contains(t))
        {
            return false;
        }
        self.tags_match(&filter.tags)
    }
}

/// Filter for `SessionManager::list`. All set fields must hold (AND).
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub scope: Option<Scope>,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    /// Any-of team match.
    pub team_ids: Option<Vec<String>>,
    pub tags: HashMap<String, String>,
}

/// Request to materialise a new session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub user_id: String,
    pub scope: Scope,
    pub team_id: Option<String>,
    pub environment: HashMap<String, String>,
    pub tags: HashMap<String, String>,
    pub initial_message: Option<String>,
    pub repository: Option<RepositoryRef>,
    pub github_token: Option<String>,
    pub agent_type: Option<String>,
    pub oneshot: bool,
    /// Raw webhook request body the driver materialises as a file in the
    /// agent's environment.
    pub webhook_payload: Option<Bytes>,
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("session backend not reachable: {0}")]
    NotReachable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_tags(tags: &[(&str, &str)]) -> Session {
        Session {
            id: "s1".into(),
            user_id: "u1".into(),
            scope: Scope::User,
            team_id: None,
            status: SessionStatus::Active,
            addr: "127.0.0.1:9000".into(),
            environment: HashMap::new(),
            tags: tags
                .iter()
                .map(|&(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
            started_at: Utc::now(),
            updated_at: Utc::now(),
            description: None,
            repository: None,
        }
    }

    fn tag_map(tags: &[(&str, &str)]) -> HashMap<String, String> {
        tags.iter()
            .map(|&(k, v)| (k.to_owned(), v.to_owned()))
            .collect()
    }

    #[test]
    fn tag_subset_match_requires_all_keys() {
        let s = session_with_tags(&[("a", "1"), ("b", "2")]);
        assert!(s.tags_match(&tag_map(&[("a", "1")])));
        assert!(s.tags_match(&tag_map(&[("a", "1"), ("b", "2")])));
        assert!(!s.tags_match(&tag_map(&[("a", "1"), ("c", "3")])));
    }

    #[test]
    fn tag_subset_match_requires_exact_values() {
        let s = session_with_tags(&[("a", "1")]);
        assert!(!s.tags_match(&tag_map(&[("a", "2")])));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let s = session_with_tags(&[]);
        assert!(s.matches(&SessionFilter::default()));
    }

    #[test]
    fn status_filter() {
        let mut s = session_with_tags(&[]);
        s.status = SessionStatus::Failed;
        let filter = SessionFilter {
            status: Some(SessionStatus::Active),
            ..Default::default()
        };
        assert!(!s.matches(&filter));
    }

    #[test]
    fn team_ids_any_of() {
        let mut s = session_with_tags(&[]);
        s.scope = Scope::Team;
        s.team_id = Some("team-b".into());
        let filter = SessionFilter {
            team_ids: Some(vec!["team-a".into(), "team-b".into()]),
            ..Default::default()
        };
        assert!(s.matches(&filter));

        let miss = SessionFilter {
            team_ids: Some(vec!["team-c".into()]),
            ..Default::default()
        };
        assert!(!s.matches(&miss));
    }

    #[test]
    fn scope_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Scope::Team).unwrap(), "\"team\"");
        assert_eq!(
            serde_json::to_string(&SessionStatus::Initializing).unwrap(),
            "\"initializing\""
        );
    }

    #[test]
    fn status_roundtrip() {
        for status in [
            SessionStatus::Initializing,
            SessionStatus::Active,
            SessionStatus::Terminating,
            SessionStatus::Terminated,
            SessionStatus::Failed,
        ] {
            let parsed: SessionStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn terminal_states() {
        assert!(SessionStatus::Terminated.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
    }
}
