//! Authentication and authorization module

pub mod cache;
pub mod error;
pub mod jwt;
pub mod middleware;
pub mod password;
pub mod registry;

pub use cache::CacheRegistry;
pub use error::{AuthError, PasswordError, PasswordRule, TokenError};
pub use jwt::{AccessClaims, Claims, IssuedToken, RefreshClaims, TokenClaims, TokenKind, TokenService};
pub use middleware::{auth_middleware, extract_token, AuthContext, PublicPaths};
pub use password::{PasswordHasher, PasswordPolicy};
pub use registry::{FallbackTokenStore, RefreshTokenStore, TokenRegistry};
