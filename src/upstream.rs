//! Upstream-facing pieces: the auth endpoint client and the error translation layer.

pub mod auth;
pub mod errors;

pub use auth::*;
pub use errors::*;
