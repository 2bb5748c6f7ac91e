//! HSM Service - PKCS#11 key custody over HTTP
//!
//! Exposes the `custody` key lifecycle and signing operations as a REST API.
//! Keys are identified by their hex `CKA_ID`.
//!
//! Key features:
//! - P-256 key pair generation, listing, lookup and deletion
//! - ECDSA signing with DER and raw `(r, s)` output
//! - Keys persist on the token across restarts

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod handlers;
pub mod server;

pub use handlers::AppState;
pub use server::create_router;
