//! Token value types: redacted secrets, unverified JWT claims, and per-user credentials.

pub mod claims;
pub mod credential;
pub mod secret;
