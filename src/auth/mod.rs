use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ApiError;
use crate::session::Scope;

/// Per-request authorization context. Identity resolution happens in
/// upstream middleware (OAuth, API tokens); this service only reads the
/// forwarded identity headers:
///
/// - `X-Auth-User`: opaque user id (required)
/// - `X-Auth-Admin`: `true` for platform admins
/// - `X-Auth-Teams`: comma-separated team memberships
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub is_admin: bool,
    pub teams: Vec<String>,
}

impl AuthContext {
    /// True if the caller may read a resource owned by `owner_id` under the
    /// given scope. Admins see everything.
    pub fn can_access_resource(
        &self,
        owner_id: &str,
        scope: Scope,
        team_id: Option<&str>,
    ) -> bool {
        if self.is_admin {
            return true;
        }
        match scope {
            Scope::User => owner_id == self.user_id,
            Scope::Team => team_id.is_some_and(|t| self.is_member_of(t)),
        }
    }

    /// Mutation follows the same rule as access for sessions and webhooks.
    pub fn can_modify_resource(
        &self,
        owner_id: &str,
        scope: Scope,
        team_id: Option<&str>,
    ) -> bool {
        self.can_access_resource(owner_id, scope, team_id)
    }

    /// Creating a team-scoped resource requires membership; admin status
    /// alone is not membership.
    pub fn can_create_in_team(&self, team_id: &str) -> bool {
        self.is_admin || self.is_member_of(team_id)
    }

    /// Any authenticated user may create user-scoped resources.
    pub fn personal_can_create(&self) -> bool {
        true
    }

    /// Owner-only check with NO admin bypass. Memory and task resources are
    /// private to their owner even from admins; anything brokering them must
    /// use this predicate instead of `can_access_resource`.
    pub fn can_access_private(&self, owner_id: &str) -> bool {
        owner_id == self.user_id
    }

    fn is_member_of(&self, team_id: &str) -> bool {
        self.teams.iter().any(|t| t == team_id)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for AuthContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        extract_context(parts).ok_or(ApiError::Unauthorized)
    }
}

/// Optional variant returning `None` for unauthenticated requests instead
/// of a 401.
/// Used by the proxy dispatcher, which must let OPTIONS through unchecked.
#[derive(Debug, Clone)]
pub struct OptionalAuthContext(pub Option<AuthContext>);

impl<S: Send + Sync> FromRequestParts<S> for OptionalAuthContext {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(extract_context(parts)))
    }
}

fn extract_context(parts: &Parts) -> Option<AuthContext> {
    let user_id = parts
        .headers
        .get("x-auth-user")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())?
        .to_owned();

    let is_admin = parts
        .headers
        .get("x-auth-admin")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));

    let teams = parts
        .headers
        .get("x-auth-teams")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Some(AuthContext {
        user_id,
        is_admin,
        teams,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn make_parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/test");
        for &(k, v) in headers {
            builder = builder.header(k, v);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        parts
    }

    fn ctx(user: &str, admin: bool, teams: &[&str]) -> AuthContext {
        AuthContext {
            user_id: user.into(),
            is_admin: admin,
            teams: teams.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    // -- extraction --

    #[test]
    fn extracts_full_context() {
        let parts = make_parts(&[
            ("x-auth-user", "u1"),
            ("x-auth-admin", "true"),
            ("x-auth-teams", "team-a, team-b"),
        ]);
        let ctx = extract_context(&parts).unwrap();
        assert_eq!(ctx.user_id, "u1");
        assert!(ctx.is_admin);
        assert_eq!(ctx.teams, vec!["team-a", "team-b"]);
    }

    #[test]
    fn missing_user_header_is_unauthenticated() {
        let parts = make_parts(&[("x-auth-admin", "true")]);
        assert!(extract_context(&parts).is_none());
    }

    #[test]
    fn empty_user_header_is_unauthenticated() {
        let parts = make_parts(&[("x-auth-user", "  ")]);
        assert!(extract_context(&parts).is_none());
    }

    #[test]
    fn admin_header_must_be_true() {
        let parts = make_parts(&[("x-auth-user", "u1"), ("x-auth-admin", "1")]);
        assert!(!extract_context(&parts).unwrap().is_admin);
    }

    // -- access predicates --

    #[test]
    fn owner_accesses_own_user_scoped() {
        assert!(ctx("u1", false, &[]).can_access_resource("u1", Scope::User, None));
    }

    #[test]
    fn stranger_denied_user_scoped() {
        assert!(!ctx("u2", false, &[]).can_access_resource("u1", Scope::User, None));
    }

    #[test]
    fn team_member_accesses_team_scoped() {
        let c = ctx("u2", false, &["team-a"]);
        assert!(c.can_access_resource("u1", Scope::Team, Some("team-a")));
        assert!(!c.can_access_resource("u1", Scope::Team, Some("team-b")));
    }

    #[test]
    fn team_scoped_without_team_id_denied() {
        assert!(!ctx("u2", false, &["team-a"]).can_access_resource("u1", Scope::Team, None));
    }

    #[test]
    fn admin_bypasses_ownership() {
        let c = ctx("admin", true, &[]);
        assert!(c.can_access_resource("u1", Scope::User, None));
        assert!(c.can_access_resource("u1", Scope::Team, Some("team-z")));
        assert!(c.can_modify_resource("u1", Scope::User, None));
    }

    #[test]
    fn private_resources_have_no_admin_bypass() {
        let c = ctx("admin", true, &[]);
        assert!(!c.can_access_private("u1"));
        assert!(ctx("u1", false, &[]).can_access_private("u1"));
    }

    #[test]
    fn team_create_requires_membership() {
        assert!(ctx("u1", false, &["team-a"]).can_create_in_team("team-a"));
        assert!(!ctx("u1", false, &["team-a"]).can_create_in_team("team-b"));
        assert!(ctx("admin", true, &[]).can_create_in_team("team-b"));
    }

    #[test]
    fn personal_create_always_allowed() {
        assert!(ctx("u1", false, &[]).personal_can_create());
    }
}
