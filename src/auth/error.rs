//! Error types for the authentication core

use crate::repository::StoreError;
use std::fmt;
use thiserror::Error;

/// Token verification / issuance failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("malformed token")]
    Malformed,

    /// Refresh token unknown to the store, revoked or already rotated
    #[error("token revoked")]
    Revoked,

    #[error("wrong token type: expected {expected}, found {found}")]
    WrongType { expected: String, found: String },

    #[error("failed to encode token: {0}")]
    Encoding(String),
}

/// A single password policy violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordRule {
    TooShort(usize),
    MissingUppercase,
    MissingLowercase,
    MissingDigit,
    MissingSymbol,
}

impl fmt::Display for PasswordRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PasswordRule::TooShort(min) => {
                write!(f, "Password must be at least {} characters", min)
            }
            PasswordRule::MissingUppercase => {
                write!(f, "Password must contain at least one uppercase letter")
            }
            PasswordRule::MissingLowercase => {
                write!(f, "Password must contain at least one lowercase letter")
            }
            PasswordRule::MissingDigit => write!(f, "Password must contain at least one digit"),
            PasswordRule::MissingSymbol => {
                write!(f, "Password must contain at least one ASCII punctuation character")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum PasswordError {
    /// Stored digest is neither a PHC string nor a legacy digest
    #[error("unrecognized password hash format")]
    HashFormat,

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error("password does not meet policy: {}", join_rules(.0))]
    Weak(Vec<PasswordRule>),
}

fn join_rules(rules: &[PasswordRule]) -> String {
    rules
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Authentication / authorization outcome consumed by handlers and middleware
#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown user or wrong password, deliberately indistinguishable
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("User not found")]
    UserNotFound,

    #[error("User is not active")]
    AccountInactive,

    #[error("Missing credentials")]
    MissingCredentials,

    #[error("Invalid token: {0}")]
    InvalidToken(TokenError),

    #[error("Wrong token type")]
    WrongTokenType,

    /// A refresh token that was already rotated or revoked was presented again
    #[error("Refresh token reuse detected")]
    TokenReuse,

    #[error("{0}")]
    WeakPassword(String),

    #[error("Access denied")]
    Forbidden,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<TokenError> for AuthError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::WrongType { .. } => AuthError::WrongTokenType,
            TokenError::Encoding(msg) => AuthError::Internal(msg),
            other => AuthError::InvalidToken(other),
        }
    }
}

impl From<PasswordError> for AuthError {
    fn from(e: PasswordError) -> Self {
        match e {
            PasswordError::Weak(rules) => AuthError::WeakPassword(join_rules(&rules)),
            other => AuthError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => AuthError::Conflict(msg),
            other => AuthError::Store(other),
        }
    }
}

impl AuthError {
    /// Short label used in logs and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::UserNotFound => "user_not_found",
            AuthError::AccountInactive => "inactive",
            AuthError::MissingCredentials => "missing_token",
            AuthError::InvalidToken(TokenError::Expired) => "expired",
            AuthError::InvalidToken(TokenError::InvalidSignature) => "bad_signature",
            AuthError::InvalidToken(TokenError::Revoked) => "revoked",
            AuthError::InvalidToken(TokenError::Malformed) => "malformed",
            AuthError::InvalidToken(_) => "invalid_token",
            AuthError::WrongTokenType => "wrong_type",
            AuthError::TokenReuse => "reuse",
            AuthError::WeakPassword(_) => "weak_password",
            AuthError::Forbidden => "forbidden",
            AuthError::Conflict(_) => "conflict",
            AuthError::NotFound(_) => "not_found",
            AuthError::Store(_) => "store",
            AuthError::Internal(_) => "internal",
        }
    }
}
