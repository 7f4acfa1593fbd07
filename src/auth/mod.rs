//! Device authentication.
//!
//! Registration takes the shared device secret (or the startup pairing
//! code) and returns a device key. The device exchanges its key for an
//! opaque session token, presented as the first message on a persistent
//! connection or as a bearer token on REST calls. Keys and tokens are
//! stored only as SHA-256 hashes.

pub mod tokens;

pub use tokens::{IssuedToken, TokenClaims, TokenStore};
