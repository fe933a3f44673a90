//! JWT token generation and validation
//! Implements access token + refresh token pattern

use crate::{auth::error::TokenError, config::AppConfig, error::AppError};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const ACCESS_SCOPE: &str = "user_access";
pub const REFRESH_SCOPE: &str = "refresh";

const MIN_SECRET_LEN: usize = 32;

/// Token kind carried in the `type` claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn scope(&self) -> &'static str {
        match self {
            TokenKind::Access => ACCESS_SCOPE,
            TokenKind::Refresh => REFRESH_SCOPE,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Access => write!(f, "access"),
            TokenKind::Refresh => write!(f, "refresh"),
        }
    }
}

/// Claims common to both token kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,

    /// Issued at
    pub iat: i64,

    /// Expiration
    pub exp: i64,

    /// JWT ID (unique token identifier)
    pub jti: String,

    pub scope: String,
}

pub type AccessClaims = Claims;
pub type RefreshClaims = Claims;

impl Claims {
    pub fn user_id(&self) -> Result<Uuid, TokenError> {
        Uuid::parse_str(&self.sub).map_err(|_| TokenError::Malformed)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// Decoded claim set, tagged by token kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenClaims {
    Access(AccessClaims),
    Refresh(RefreshClaims),
}

impl TokenClaims {
    pub fn kind(&self) -> TokenKind {
        match self {
            TokenClaims::Access(_) => TokenKind::Access,
            TokenClaims::Refresh(_) => TokenKind::Refresh,
        }
    }

    pub fn claims(&self) -> &Claims {
        match self {
            TokenClaims::Access(c) | TokenClaims::Refresh(c) => c,
        }
    }

    pub fn into_claims(self) -> Claims {
        match self {
            TokenClaims::Access(c) | TokenClaims::Refresh(c) => c,
        }
    }
}

/// Wire representation; every field required, nothing else allowed
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireClaims {
    sub: String,
    iat: i64,
    exp: i64,
    jti: String,
    #[serde(rename = "type")]
    kind: TokenKind,
    scope: String,
}

impl From<WireClaims> for TokenClaims {
    fn from(wire: WireClaims) -> Self {
        let claims = Claims {
            sub: wire.sub,
            iat: wire.iat,
            exp: wire.exp,
            jti: wire.jti,
            scope: wire.scope,
        };
        match wire.kind {
            TokenKind::Access => TokenClaims::Access(claims),
            TokenKind::Refresh => TokenClaims::Refresh(claims),
        }
    }
}

/// A freshly signed token with its identifying metadata
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    /// Seconds until expiry
    pub expires_in: u64,
    pub expires_at: DateTime<Utc>,
}

/// JWT service
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(
        secret: &str,
        algorithm: Algorithm,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Result<Self, AppError> {
        // Ensure secret is long enough for HMAC signing
        if secret.len() < MIN_SECRET_LEN {
            return Err(AppError::Config(format!(
                "JWT secret too short (min {} chars)",
                MIN_SECRET_LEN
            )));
        }

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            algorithm,
            access_ttl,
            refresh_ttl,
        })
    }

    /// Create JWT service from config
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let security = &config.security;
        Self::new(
            security.jwt_secret.expose_secret(),
            security.algorithm()?,
            Duration::minutes(security.access_token_exp_minutes as i64),
            Duration::days(security.refresh_token_exp_days as i64),
        )
    }

    pub fn access_ttl_secs(&self) -> u64 {
        self.access_ttl.num_seconds().max(0) as u64
    }

    pub fn refresh_ttl_secs(&self) -> u64 {
        self.refresh_ttl.num_seconds().max(0) as u64
    }

    /// Generate access token
    pub fn issue_access_token(&self, user_id: Uuid) -> Result<IssuedToken, TokenError> {
        self.issue_access_token_at(user_id, Utc::now())
    }

    /// Generate access token as if issued at `now`
    pub fn issue_access_token_at(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, TokenError> {
        let jti = Uuid::new_v4().to_string();
        self.issue(user_id, TokenKind::Access, jti, now, self.access_ttl)
    }

    /// Generate refresh token
    pub fn issue_refresh_token(&self, user_id: Uuid) -> Result<IssuedToken, TokenError> {
        self.issue_refresh_token_at(user_id, Utc::now())
    }

    pub fn issue_refresh_token_at(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, TokenError> {
        let bytes: [u8; 32] = rand::random();
        self.issue(user_id, TokenKind::Refresh, hex::encode(bytes), now, self.refresh_ttl)
    }

    fn issue(
        &self,
        user_id: Uuid,
        kind: TokenKind,
        jti: String,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<IssuedToken, TokenError> {
        let expires_at = now + ttl;

        let claims = WireClaims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: jti.clone(),
            kind,
            scope: kind.scope().to_string(),
        };

        let token = encode(&Header::new(self.algorithm), &claims, &self.encoding_key).map_err(
            |e| {
                tracing::error!("Failed to encode {} token: {:?}", kind, e);
                TokenError::Encoding(e.to_string())
            },
        )?;

        Ok(IssuedToken {
            token,
            jti,
            expires_in: ttl.num_seconds().max(0) as u64,
            expires_at,
        })
    }

    fn validation(&self, validate_exp: bool) -> Validation {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        validation.validate_exp = validate_exp;
        validation.set_required_spec_claims(&["exp", "sub"]);
        validation
    }

    fn decode_with(&self, token: &str, validation: &Validation) -> Result<TokenClaims, TokenError> {
        let data = decode::<WireClaims>(token, &self.decoding_key, validation).map_err(|e| {
            tracing::debug!("Token validation failed: {:?}", e);
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                _ => TokenError::Malformed,
            }
        })?;

        Ok(data.claims.into())
    }

    /// Validate signature, expiry and claim shape
    pub fn decode(&self, token: &str) -> Result<TokenClaims, TokenError> {
        self.decode_with(token, &self.validation(true))
    }

    /// Decode and require the given kind with its matching scope
    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<TokenClaims, TokenError> {
        let claims = self.decode(token)?;
        check_kind(&claims, expected)?;
        Ok(claims)
    }

    /// Validate access token specifically
    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, TokenError> {
        self.verify(token, TokenKind::Access)
            .map(TokenClaims::into_claims)
    }

    /// Validate refresh token specifically
    pub fn verify_refresh(&self, token: &str) -> Result<RefreshClaims, TokenError> {
        self.verify(token, TokenKind::Refresh)
            .map(TokenClaims::into_claims)
    }

    /// Signature and type check only; expired refresh tokens still decode
    pub fn decode_refresh_for_revocation(&self, token: &str) -> Result<RefreshClaims, TokenError> {
        let claims = self.decode_with(token, &self.validation(false))?;
        check_kind(&claims, TokenKind::Refresh)?;
        Ok(claims.into_claims())
    }
}

fn check_kind(claims: &TokenClaims, expected: TokenKind) -> Result<(), TokenError> {
    let found = claims.kind();
    if found != expected || claims.claims().scope != expected.scope() {
        tracing::debug!(
            "Token type mismatch: expected '{}', got '{}' (scope '{}')",
            expected,
            found,
            claims.claims().scope
        );
        return Err(TokenError::WrongType {
            expected: expected.to_string(),
            found: found.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test_secret_key_32_characters_long!";

    fn service() -> TokenService {
        TokenService::new(
            SECRET,
            Algorithm::HS256,
            Duration::minutes(30),
            Duration::days(7),
        )
        .unwrap()
    }

    fn sign(value: &serde_json::Value) -> String {
        encode(
            &Header::default(),
            value,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_generate_and_validate_access_token() {
        let service = service();
        let user_id = Uuid::new_v4();

        let issued = service.issue_access_token(user_id).unwrap();
        assert_eq!(issued.expires_in, 30 * 60);

        let claims = service.verify_access(&issued.token).unwrap();
        assert_eq!(claims.user_id().unwrap(), user_id);
        assert_eq!(claims.jti, issued.jti);
        assert_eq!(claims.scope, ACCESS_SCOPE);
        assert_eq!(claims.exp - claims.iat, 30 * 60);
    }

    #[test]
    fn test_generate_and_validate_refresh_token() {
        let service = service();
        let user_id = Uuid::new_v4();

        let issued = service.issue_refresh_token(user_id).unwrap();
        assert_eq!(issued.jti.len(), 64);
        assert_eq!(issued.expires_in, 7 * 24 * 3600);

        let claims = service.verify_refresh(&issued.token).unwrap();
        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.scope, REFRESH_SCOPE);
    }

    #[test]
    fn test_token_type_validation() {
        let service = service();
        let user_id = Uuid::new_v4();

        let access = service.issue_access_token(user_id).unwrap();
        assert!(matches!(
            service.verify_refresh(&access.token),
            Err(TokenError::WrongType { .. })
        ));

        let refresh = service.issue_refresh_token(user_id).unwrap();
        assert!(matches!(
            service.verify_access(&refresh.token),
            Err(TokenError::WrongType { .. })
        ));
    }

    #[test]
    fn test_expired_token() {
        let service = service();
        let issued = service
            .issue_access_token_at(Uuid::new_v4(), Utc::now() - Duration::minutes(31))
            .unwrap();

        assert_eq!(service.verify_access(&issued.token), Err(TokenError::Expired));
    }

    #[test]
    fn test_expired_refresh_decodes_for_revocation() {
        let service = service();
        let user_id = Uuid::new_v4();
        let issued = service
            .issue_refresh_token_at(user_id, Utc::now() - Duration::days(8))
            .unwrap();

        assert_eq!(service.verify_refresh(&issued.token), Err(TokenError::Expired));
        let claims = service.decode_refresh_for_revocation(&issued.token).unwrap();
        assert_eq!(claims.jti, issued.jti);
    }

    #[test]
    fn test_wrong_secret_is_bad_signature() {
        let other = TokenService::new(
            "another_secret_key_that_is_32_chars!!",
            Algorithm::HS256,
            Duration::minutes(30),
            Duration::days(7),
        )
        .unwrap();
        let token = other.issue_access_token(Uuid::new_v4()).unwrap().token;

        assert_eq!(service().verify_access(&token), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn test_invalid_token_fails() {
        let service = service();
        assert_eq!(service.verify_access("invalid_token"), Err(TokenError::Malformed));
        assert_eq!(service.verify_refresh(""), Err(TokenError::Malformed));
    }

    #[test]
    fn test_unknown_or_missing_claims_rejected() {
        let service = service();
        let now = Utc::now().timestamp();

        let extra = sign(&serde_json::json!({
            "sub": Uuid::new_v4().to_string(), "iat": now, "exp": now + 600,
            "jti": "x", "type": "access", "scope": ACCESS_SCOPE, "admin": true
        }));
        assert_eq!(service.verify_access(&extra), Err(TokenError::Malformed));

        let untyped = sign(&serde_json::json!({
            "sub": Uuid::new_v4().to_string(), "iat": now, "exp": now + 600,
            "jti": "x", "scope": ACCESS_SCOPE
        }));
        assert_eq!(service.verify_access(&untyped), Err(TokenError::Malformed));

        let bogus_type = sign(&serde_json::json!({
            "sub": Uuid::new_v4().to_string(), "iat": now, "exp": now + 600,
            "jti": "x", "type": "admin", "scope": ACCESS_SCOPE
        }));
        assert_eq!(service.verify_access(&bogus_type), Err(TokenError::Malformed));
    }

    #[test]
    fn test_scope_mismatch_rejected() {
        let service = service();
        let now = Utc::now().timestamp();
        let token = sign(&serde_json::json!({
            "sub": Uuid::new_v4().to_string(), "iat": now, "exp": now + 600,
            "jti": "x", "type": "access", "scope": REFRESH_SCOPE
        }));
        assert!(matches!(
            service.verify_access(&token),
            Err(TokenError::WrongType { .. })
        ));
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(TokenService::new(
            "short",
            Algorithm::HS256,
            Duration::minutes(30),
            Duration::days(7)
        )
        .is_err());
    }
}
