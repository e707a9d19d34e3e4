//! Client side of the attestation broker.
//!
//! [`BrokerClient`] exchanges a user's upstream access token for a leased attestation token;
//! [`crypto`] binds that token to the requesting credential with AES-CBC; the transport
//! decorators inject the bearer and attestation headers into each upstream call.

pub mod crypto;

mod client;
mod transport;

pub use client::*;
pub use crypto::CryptoError;
pub use transport::*;
