//! Token authentication.
//!
//! Tokens are opaque secrets presented as `Authorization: Bearer <token>` or
//! `X-API-Key: <token>`. Only their SHA-256 digests are kept.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha256};

use hearth_core::extension::{AuthService, AuthUser, ExtensionError, Result};

use crate::config::AuthConfig;
use crate::models::ApiError;
use crate::server::ApiState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Role that grants every permission and the admin API.
pub const ADMIN_ROLE: &str = "admin";

/// Hex SHA-256 of a raw token.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn presented_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let value = value.to_str().ok()?;
        return value
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty());
    }
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[derive(Debug, Clone)]
struct TokenEntry {
    user: AuthUser,
    permissions: Vec<String>,
}

/// [`AuthService`] backed by configured API tokens.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthService {
    by_digest: HashMap<String, TokenEntry>,
    anonymous_admin: bool,
}

impl TokenAuthService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        let mut service = Self::new();
        for token in &config.tokens {
            service.insert_digest(
                token.token_sha256.to_ascii_lowercase(),
                AuthUser {
                    id: token.user.clone(),
                    roles: token.roles.clone(),
                },
                token.permissions.clone(),
            );
        }
        service.anonymous_admin = config.anonymous_admin;
        service
    }

    /// Add a raw token.
    pub fn with_token(mut self, token: &str, user: AuthUser, permissions: Vec<String>) -> Self {
        self.insert_digest(token_digest(token), user, permissions);
        self
    }

    pub fn insert_digest(&mut self, digest: String, user: AuthUser, permissions: Vec<String>) {
        self.by_digest.insert(digest, TokenEntry { user, permissions });
    }

    pub fn allow_anonymous_admin(mut self, allow: bool) -> Self {
        self.anonymous_admin = allow;
        self
    }

    pub fn token_count(&self) -> usize {
        self.by_digest.len()
    }

    fn lookup(&self, headers: &HeaderMap) -> Option<&TokenEntry> {
        let token = presented_token(headers)?;
        self.by_digest.get(&token_digest(token))
    }

    /// The admin behind a request, if it carries one.
    pub fn admin(&self, headers: &HeaderMap) -> std::result::Result<AuthUser, ExtensionError> {
        match self.lookup(headers) {
            Some(entry) if entry.user.roles.iter().any(|r| r == ADMIN_ROLE) => Ok(entry.user.clone()),
            Some(entry) => Err(ExtensionError::PermissionDenied(format!(
                "{} is not an administrator",
                entry.user.id
            ))),
            None if self.anonymous_admin => Ok(AuthUser {
                id: "anonymous".to_string(),
                roles: vec![ADMIN_ROLE.to_string()],
            }),
            None => Err(ExtensionError::Unauthorized("admin token required".to_string())),
        }
    }
}

#[async_trait]
impl AuthService for TokenAuthService {
    async fn current_user(&self, headers: &HeaderMap) -> Result<Option<AuthUser>> {
        Ok(self.lookup(headers).map(|entry| entry.user.clone()))
    }

    async fn permissions(&self, user_id: &str) -> Result<Vec<String>> {
        let mut permissions: Vec<String> = self
            .by_digest
            .values()
            .filter(|entry| entry.user.id == user_id)
            .flat_map(|entry| {
                let mut perms = entry.permissions.clone();
                if entry.user.roles.iter().any(|r| r == ADMIN_ROLE) {
                    perms.push("*".to_string());
                }
                perms
            })
            .collect();
        permissions.sort();
        permissions.dedup();
        Ok(permissions)
    }
}

/// Extractor for admin-only handlers.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

#[async_trait]
impl FromRequestParts<ApiState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &ApiState) -> std::result::Result<Self, Self::Rejection> {
        let user = state.auth.admin(&parts.headers)?;
        Ok(AdminUser(user))
    }
}
