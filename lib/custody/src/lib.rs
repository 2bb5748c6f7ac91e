//! Custody - P-256 key custody and signing over a PKCS#11 token
//!
//! Keys are generated and held by the token; this crate only ever sees public
//! material and signatures.
//!
//! - [`SessionManager`] owns the loaded module and runs scoped sessions
//! - [`KeyService`] creates, lists, looks up and deletes key pairs
//! - [`Signer`] hashes, signs and normalizes signatures
//! - [`signature`] converts between DER and raw `(r, s)` encodings

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod config;
pub mod error;
pub mod keys;
pub mod module;
pub mod pkcs11;
pub mod session;
pub mod signature;
pub mod signing;
pub mod spki;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{SlotSelection, TokenConfig};
pub use error::CustodyError;
pub use keys::{CreateKeyParams, Curve, KeyInfo, KeyListing, KeyService, KeySummary};
pub use module::{Module, ModuleError, ModuleSession};
pub use pkcs11::CryptokiModule;
pub use session::{SessionAccess, SessionManager};
pub use signing::{SignResult, SignatureComponents, Signer};
