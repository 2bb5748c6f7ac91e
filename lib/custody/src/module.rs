//! Module adapter contract
//!
//! The only boundary between the custody core and a PKCS#11 library. Every
//! binding quirk (return-value conventions, output buffers, error codes) is
//! absorbed by the implementation of these traits; the session manager, key
//! service and signer only ever see the shapes defined here.

use std::fmt;

use cryptoki::types::AuthPin;
use thiserror::Error;

/// Failures reported by a module, classified so callers never inspect message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("User already logged in")]
    AlreadyLoggedIn,
    #[error("PIN incorrect")]
    PinIncorrect,
    #[error("Session handle invalid")]
    SessionInvalid,
    #[error("{0}")]
    Other(String),
}

/// Object classes the custody core searches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyClass {
    PublicKey,
    PrivateKey,
}

/// Attributes the custody core reads back from key objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAttribute {
    Id,
    Label,
    EcPoint,
}

/// Attribute values read from an object. Attributes the module could not
/// return are left as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyAttributes {
    pub id: Option<Vec<u8>>,
    pub label: Option<String>,
    pub ec_point: Option<Vec<u8>>,
}

/// Search template: object class plus an optional `CKA_ID` match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectQuery {
    pub class: KeyClass,
    pub id: Option<Vec<u8>>,
}

impl ObjectQuery {
    pub fn class(class: KeyClass) -> Self {
        Self { class, id: None }
    }

    pub fn by_id(class: KeyClass, id: &[u8]) -> Self {
        Self {
            class,
            id: Some(id.to_vec()),
        }
    }
}

/// Everything needed to generate a persistent EC key pair.
///
/// The public half is verify-capable; the private half is sign-capable,
/// sensitive and non-extractable. Both are token objects sharing `id` and `label`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairTemplate {
    pub id: Vec<u8>,
    pub label: String,
    /// DER-encoded named curve OID (`CKA_EC_PARAMS`)
    pub ec_params: Vec<u8>,
}

/// A loaded PKCS#11 library.
pub trait Module: Send + Sync + Sized + 'static {
    type Slot: Copy + fmt::Debug + Send + Sync;
    type Session: ModuleSession;

    /// Slots that currently hold a token, in module order.
    fn slots_with_token(&self) -> Result<Vec<Self::Slot>, ModuleError>;

    /// Token label for a slot, as reported (possibly space-padded).
    fn token_label(&self, slot: Self::Slot) -> Result<String, ModuleError>;

    fn open_session(&self, slot: Self::Slot, read_write: bool)
    -> Result<Self::Session, ModuleError>;

    /// Finalize the library. Called once, after which the module is dropped.
    fn finalize(self);
}

/// An open session against one slot.
pub trait ModuleSession {
    type Object: Copy + fmt::Debug;

    fn login(&self, pin: &AuthPin) -> Result<(), ModuleError>;

    fn logout(&self) -> Result<(), ModuleError>;

    /// Close the session. Consumes it so a closed session cannot be reused.
    fn close(self) -> Result<(), ModuleError>;

    /// All objects matching `query`. Implementations page through the token
    /// in bounded batches.
    fn find_objects(&self, query: &ObjectQuery) -> Result<Vec<Self::Object>, ModuleError>;

    fn read_attributes(
        &self,
        object: Self::Object,
        attributes: &[KeyAttribute],
    ) -> Result<KeyAttributes, ModuleError>;

    /// Generate a P-256 key pair, returning `(public, private)` handles.
    fn generate_key_pair(
        &self,
        template: &KeyPairTemplate,
    ) -> Result<(Self::Object, Self::Object), ModuleError>;

    /// Raw ECDSA (`CKM_ECDSA`) over a precomputed digest.
    ///
    /// Returns exactly the bytes the module produced, whatever their encoding.
    fn sign(&self, key: Self::Object, digest: &[u8]) -> Result<Vec<u8>, ModuleError>;

    fn destroy_object(&self, object: Self::Object) -> Result<(), ModuleError>;
}
