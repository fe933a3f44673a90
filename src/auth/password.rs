//! Password hashing and verification using Argon2id
//!
//! Stored digests are self-describing PHC strings, so verification always
//! uses the parameters embedded in the digest. Bare 64-char hex SHA-256
//! digests from older accounts are still accepted for verification and
//! flagged for rehash.

use crate::auth::error::{PasswordError, PasswordRule};
use crate::config::SecurityConfig;
use argon2::{
    password_hash::{
        rand_core::OsRng, Error as PhcError, PasswordHash, PasswordHasher as _,
        PasswordVerifier, SaltString,
    },
    Algorithm, Argon2, Params, Version,
};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const LEGACY_SHA256_HEX_LEN: usize = 64;

/// Password hasher with configurable parameters
#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
    params: Params,
}

impl PasswordHasher {
    /// Create hasher with explicit cost parameters
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self, PasswordError> {
        let params = Params::new(memory_kib, iterations, parallelism, None)
            .map_err(|e| PasswordError::Hashing(format!("Invalid Argon2 params: {}", e)))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.clone());

        Ok(Self { argon2, params })
    }

    pub fn from_config(config: &SecurityConfig) -> Result<Self, PasswordError> {
        Self::new(
            config.argon2_memory_kib,
            config.argon2_iterations,
            config.argon2_parallelism,
        )
    }

    /// Hash a password into a PHC string with a fresh random salt
    pub fn hash(&self, password: &str) -> Result<String, PasswordError> {
        let salt = SaltString::generate(&mut OsRng);

        let password_hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| {
                tracing::error!("Failed to hash password: {:?}", e);
                PasswordError::Hashing(e.to_string())
            })?
            .to_string();

        Ok(password_hash)
    }

    /// Verify a password against a stored digest
    ///
    /// `Ok(false)` means a well-formed digest that does not match.
    pub fn verify(&self, password: &str, digest: &str) -> Result<bool, PasswordError> {
        if is_legacy_digest(digest) {
            let computed = legacy_sha256_hex(password);
            return Ok(computed.as_bytes().ct_eq(digest.as_bytes()).into());
        }

        let parsed = PasswordHash::new(digest).map_err(|e| {
            tracing::debug!("Failed to parse password hash: {:?}", e);
            PasswordError::HashFormat
        })?;

        match self.argon2.verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(PhcError::Password) => Ok(false),
            Err(e) => {
                tracing::debug!("Password verification error: {:?}", e);
                Err(PasswordError::HashFormat)
            }
        }
    }

    /// True when the digest should be replaced with one using current parameters
    pub fn needs_rehash(&self, digest: &str) -> bool {
        if is_legacy_digest(digest) {
            return true;
        }

        let Ok(parsed) = PasswordHash::new(digest) else {
            return false;
        };

        if parsed.algorithm.as_str() != Algorithm::Argon2id.as_str() {
            return true;
        }

        match Params::try_from(&parsed) {
            Ok(stored) => {
                stored.m_cost() != self.params.m_cost()
                    || stored.t_cost() != self.params.t_cost()
                    || stored.p_cost() != self.params.p_cost()
            }
            Err(_) => true,
        }
    }
}

fn is_legacy_digest(digest: &str) -> bool {
    digest.len() == LEGACY_SHA256_HEX_LEN
        && digest
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn legacy_sha256_hex(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Password strength rules applied on registration and password change
#[derive(Debug, Clone)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_digit: bool,
    pub require_special: bool,
}

impl PasswordPolicy {
    pub fn from_config(config: &SecurityConfig) -> Self {
        Self {
            min_length: config.password_min_length,
            require_uppercase: config.password_require_uppercase,
            require_lowercase: config.password_require_lowercase,
            require_digit: config.password_require_digit,
            require_special: config.password_require_special,
        }
    }

    /// Validate a candidate password, collecting every violated rule
    pub fn validate(&self, password: &str) -> Result<(), PasswordError> {
        let mut violations = Vec::new();

        if password.chars().count() < self.min_length {
            violations.push(PasswordRule::TooShort(self.min_length));
        }

        if self.require_uppercase && !password.chars().any(|c| c.is_uppercase()) {
            violations.push(PasswordRule::MissingUppercase);
        }

        if self.require_lowercase && !password.chars().any(|c| c.is_lowercase()) {
            violations.push(PasswordRule::MissingLowercase);
        }

        if self.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            violations.push(PasswordRule::MissingDigit);
        }

        if self.require_special
            && !password.chars().any(|c| c.is_ascii_punctuation())
        {
            violations.push(PasswordRule::MissingSymbol);
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(PasswordError::Weak(violations))
        }
    }
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            require_uppercase: true,
            require_lowercase: true,
            require_digit: true,
            require_special: true,
        }
    }
}
