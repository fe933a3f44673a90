//! Authentication-related models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Login credentials (form-encoded or JSON body)
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// OAuth2 password-grant token request
#[derive(Debug, Deserialize)]
pub struct OAuth2TokenRequest {
    pub grant_type: Option<String>,
    pub username: String,
    pub password: String,
    pub scope: Option<String>,
}

/// Token pair returned by login and refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub refresh_expires_in: u64,
}

/// Token refresh request
#[derive(Debug, Deserialize)]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

/// Logout request
#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: String,
}

/// Persisted refresh token row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub jti: String,
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub is_revoked: bool,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    /// jti of the token that replaced this one on rotation
    pub replaced_by: Option<String>,
}

impl RefreshTokenRecord {
    /// Not revoked and not yet expired
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked && self.expires_at > now
    }

    /// Revoked by a rotation no longer ago than `grace`
    pub fn rotated_within(&self, grace: chrono::Duration, now: DateTime<Utc>) -> bool {
        match (&self.replaced_by, self.revoked_at) {
            (Some(_), Some(revoked_at)) if self.is_revoked => now - revoked_at < grace,
            _ => false,
        }
    }
}

/// A freshly issued refresh token about to be registered
#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub jti: String,
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&RefreshTokenRecord> for NewRefreshToken {
    fn from(record: &RefreshTokenRecord) -> Self {
        Self {
            jti: record.jti.clone(),
            user_id: record.user_id,
            token_hash: record.token_hash.clone(),
            expires_at: record.expires_at,
        }
    }
}

/// Result of an atomic refresh-token rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotateOutcome {
    /// The presented token was active and has been replaced
    Rotated,
    /// The presented token was unknown, revoked, expired or did not match its hash
    NotActive,
}
