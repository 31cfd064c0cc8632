//! Caller identity: token verification, context resolution and the HTTP
//! middleware that attaches it to requests.

pub mod middleware;
pub mod propagator;
pub mod verifier;

pub use middleware::load_auth_context;
pub use propagator::AuthPropagator;
pub use verifier::{CredentialVerifier, JwtVerifier, TokenClaims, TokenType, VerifyError};
