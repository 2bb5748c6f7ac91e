//! Key lifecycle operations
//!
//! Key pairs live on the token as a public and a private object sharing one
//! `CKA_ID` and one `CKA_LABEL`. Identifiers cross this API as lowercase hex.

use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CustodyError;
use crate::module::{KeyAttribute, KeyClass, KeyPairTemplate, Module, ModuleSession, ObjectQuery};
use crate::session::{SessionAccess, SessionManager};
use crate::spki::spki_pem;

/// DER OID for prime256v1 (`CKA_EC_PARAMS`).
pub const P256_EC_PARAMS: [u8; 10] = [
    0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07,
];

/// Random identifier length in bytes.
pub const KEY_ID_LEN: usize = 16;

/// Supported curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Curve {
    #[default]
    #[serde(rename = "P-256")]
    P256,
}

impl Curve {
    pub fn name(&self) -> &'static str {
        match self {
            Curve::P256 => "P-256",
        }
    }

    pub fn ec_params(&self) -> &'static [u8] {
        match self {
            Curve::P256 => &P256_EC_PARAMS,
        }
    }

    /// Parse a requested curve name. Anything but `P-256` is refused.
    pub fn parse(name: Option<&str>) -> Result<Self, CustodyError> {
        match name {
            None | Some("P-256") => Ok(Curve::P256),
            Some(other) => Err(CustodyError::Configuration(format!(
                "Unsupported curve: {}",
                other
            ))),
        }
    }
}

/// Decode a caller-supplied hex identifier.
pub fn parse_key_id(id: &str) -> Result<Vec<u8>, CustodyError> {
    let bytes = hex::decode(id.trim())
        .map_err(|e| CustodyError::InvalidRequest(format!("Invalid key id '{}': {}", id, e)))?;
    if bytes.is_empty() {
        return Err(CustodyError::InvalidRequest("Key id is empty".to_string()));
    }
    Ok(bytes)
}

fn random_key_id() -> Vec<u8> {
    let mut id = vec![0u8; KEY_ID_LEN];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// `key-<base36 millis>-<first 6 hex chars of id>`
fn default_label(id_hex: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let fragment: String = id_hex.chars().take(6).collect();
    format!("key-{}-{}", to_base36(millis), fragment)
}

/// Parameters for [`KeyService::create_key_pair`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateKeyParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Hex identifier; 16 random bytes when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curve: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    pub id: String,
    pub label: String,
    pub curve: Curve,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_pem: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySummary {
    pub id: String,
    pub label: String,
    pub curve: Curve,
}

/// Result of a lenient enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyListing {
    pub keys: Vec<KeySummary>,
    /// Objects left out because their attributes could not be read.
    pub skipped: usize,
}

/// Create, enumerate, look up and delete key pairs.
pub struct KeyService<M: Module> {
    sessions: Arc<SessionManager<M>>,
}

impl<M: Module> Clone for KeyService<M> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
        }
    }
}

/// PEM for the public object, when the token reports its EC point.
fn public_key_pem<S: ModuleSession>(
    session: &S,
    public: S::Object,
) -> Result<Option<String>, CustodyError> {
    let attrs = session.read_attributes(public, &[KeyAttribute::EcPoint])?;
    attrs.ec_point.as_deref().map(spki_pem).transpose()
}

impl<M: Module> KeyService<M> {
    pub fn new(sessions: Arc<SessionManager<M>>) -> Self {
        Self { sessions }
    }

    pub fn create_key_pair(&self, params: CreateKeyParams) -> Result<KeyInfo, CustodyError> {
        let curve = Curve::parse(params.curve.as_deref())?;
        let id = match params.id.as_deref() {
            Some(id) => parse_key_id(id)?,
            None => random_key_id(),
        };
        let id_hex = hex::encode(&id);
        let label = match params.label {
            Some(label) if label.is_empty() => {
                return Err(CustodyError::InvalidRequest("Label is empty".to_string()));
            }
            Some(label) => label,
            None => default_label(&id_hex),
        };

        let template = KeyPairTemplate {
            id,
            label: label.clone(),
            ec_params: curve.ec_params().to_vec(),
        };

        // The pair exists once generation succeeds; a failed read-back only
        // drops the PEM from the result.
        let public_key_pem = self
            .sessions
            .with_session(SessionAccess::USER_READ_WRITE, |session| {
                let (public, _private) = session.generate_key_pair(&template)?;
                Ok(match public_key_pem(session, public) {
                    Ok(pem) => pem,
                    Err(e) => {
                        warn!(key_id = %id_hex, error = %e, "Failed to read back public key");
                        None
                    }
                })
            })?;

        info!(key_id = %id_hex, label = %label, "Created key pair");

        Ok(KeyInfo {
            id: id_hex,
            label,
            curve,
            public_key_pem,
        })
    }

    /// Every public key on the token. Objects whose id or label cannot be read
    /// are skipped and counted.
    pub fn list_keys(&self) -> Result<KeyListing, CustodyError> {
        self.sessions.with_session(SessionAccess::USER, |session| {
            let objects = session.find_objects(&ObjectQuery::class(KeyClass::PublicKey))?;

            let mut listing = KeyListing::default();
            for object in objects {
                let attrs = match session
                    .read_attributes(object, &[KeyAttribute::Id, KeyAttribute::Label])
                {
                    Ok(attrs) => attrs,
                    Err(e) => {
                        warn!(object = ?object, error = %e, "Skipping unreadable key object");
                        listing.skipped += 1;
                        continue;
                    }
                };

                match (attrs.id, attrs.label) {
                    (Some(id), Some(label)) if !id.is_empty() => listing.keys.push(KeySummary {
                        id: hex::encode(id),
                        label,
                        curve: Curve::P256,
                    }),
                    _ => {
                        debug!(object = ?object, "Skipping key object without id or label");
                        listing.skipped += 1;
                    }
                }
            }
            Ok(listing)
        })
    }

    pub fn get_key_by_id(&self, id: &str) -> Result<KeyInfo, CustodyError> {
        let key_id = parse_key_id(id)?;
        let id_hex = hex::encode(&key_id);

        self.sessions.with_session(SessionAccess::USER, |session| {
            let public = session
                .find_objects(&ObjectQuery::by_id(KeyClass::PublicKey, &key_id))?
                .into_iter()
                .next()
                .ok_or_else(|| CustodyError::KeyNotFound(id_hex.clone()))?;

            let attrs = session.read_attributes(public, &[KeyAttribute::Label])?;
            Ok(KeyInfo {
                id: id_hex.clone(),
                label: attrs.label.unwrap_or_else(|| id_hex.clone()),
                curve: Curve::P256,
                public_key_pem: public_key_pem(session, public)?,
            })
        })
    }

    /// Destroy both halves of a key pair. Absent objects are not an error, and
    /// individual destroy failures are logged without failing the call.
    pub fn delete_key_by_id(&self, id: &str) -> Result<(), CustodyError> {
        let key_id = parse_key_id(id)?;
        let id_hex = hex::encode(&key_id);

        let destroyed = self
            .sessions
            .with_session(SessionAccess::USER_READ_WRITE, |session| {
                let mut destroyed = 0usize;
                for class in [KeyClass::PublicKey, KeyClass::PrivateKey] {
                    for object in session.find_objects(&ObjectQuery::by_id(class, &key_id))? {
                        match session.destroy_object(object) {
                            Ok(()) => destroyed += 1,
                            Err(e) => warn!(
                                key_id = %id_hex,
                                class = ?class,
                                error = %e,
                                "Failed to destroy key object"
                            ),
                        }
                    }
                }
                Ok(destroyed)
            })?;

        info!(key_id = %id_hex, destroyed, "Deleted key pair");
        Ok(())
    }
}
