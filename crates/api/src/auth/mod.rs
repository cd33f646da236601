//! Authentication module for PrepBuddy

pub mod jwt;
pub mod middleware;

pub use jwt::{JwtError, JwtManager, SupabaseClaims};
pub use middleware::{require_auth, AuthState, AuthUser};
