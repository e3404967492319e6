//! Auth interface boundary (§6): a `Principal` extracted from the request's
//! bearer token, and a development-mode stub that resolves it from a
//! configured token->groups map. Real token issuance/validation is an
//! external collaborator this daemon only consumes.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;

use crate::config::AuthConfiguration;

#[derive(Debug, Clone, Default)]
pub struct Principal {
    pub groups: Vec<String>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self { groups: Vec::new() }
    }

    /// "admin" implicitly grants every group.
    pub fn is_in_group(&self, group: &str, admin_group: &str) -> bool {
        self.groups.iter().any(|g| g == group || g == admin_group)
    }
}

/// Resolves bearer tokens to `Principal`s via the development-mode map in
/// `[auth]`. A real deployment replaces this with a call to its own identity
/// provider; the daemon only depends on the `Principal` shape.
pub struct AuthResolver {
    config: AuthConfiguration,
}

impl AuthResolver {
    pub fn new(config: AuthConfiguration) -> Self {
        Self { config }
    }

    pub fn resolve(&self, bearer_token: Option<&str>) -> Principal {
        match bearer_token {
            Some(token) => match self.config.tokens.get(token) {
                Some(groups) => Principal {
                    groups: groups.clone(),
                },
                None => Principal::anonymous(),
            },
            None => Principal::anonymous(),
        }
    }

    pub fn admin_group(&self) -> &str {
        &self.config.admin_group
    }
}

/// Extracts the bearer token from the `Authorization` header, for handlers
/// that need to resolve a `Principal` against `AppState`'s `AuthResolver`.
pub struct BearerToken(pub Option<String>);

#[async_trait::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for BearerToken {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.to_string());
        Ok(BearerToken(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolver() -> AuthResolver {
        let mut tokens = HashMap::new();
        tokens.insert("secret".to_string(), vec!["inference".to_string()]);
        AuthResolver::new(AuthConfiguration {
            tokens,
            admin_group: "admin".to_string(),
        })
    }

    #[test]
    fn unknown_token_resolves_to_anonymous() {
        let principal = resolver().resolve(Some("not-a-real-token"));
        assert!(principal.groups.is_empty());
    }

    #[test]
    fn known_token_resolves_to_its_groups() {
        let principal = resolver().resolve(Some("secret"));
        assert!(principal.is_in_group("inference", "admin"));
    }

    #[test]
    fn admin_group_grants_every_group() {
        let principal = Principal {
            groups: vec!["admin".to_string()],
        };
        assert!(principal.is_in_group("anything", "admin"));
    }
}
