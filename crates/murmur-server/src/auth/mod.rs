//! Token validation for WebSocket and HTTP clients.
//!
//! Murmur does not issue tokens; it verifies HS256 JWTs minted by the account
//! service with a shared secret.

mod jwt;

pub use jwt::JwtValidator;

#[cfg(test)]
pub(crate) use jwt::tests as test_tokens;
