//! `jobforge-auth` — authentication boundary.
//!
//! Two distinct credentials live here: end-user JWTs (HS256) carrying
//! organization context, and the shared secret protecting the
//! batch-processing trigger. Authorization *policy* is out of scope; routes
//! only need the authenticated organization/user identities.

pub mod claims;
pub mod secret;

pub use claims::{
    Hs256JwtValidator, JwtClaims, JwtValidator, TokenValidationError, validate_claims,
};
pub use secret::{MIN_PRODUCTION_SECRET_LEN, ProcessingSecret};
