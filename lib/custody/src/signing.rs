//! Signing pipeline
//!
//! SHA-256 digest, `CKM_ECDSA` on the token, then normalization of whatever
//! encoding the module returned into both DER and fixed-width `(r, s)`.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::CustodyError;
use crate::keys::parse_key_id;
use crate::module::{KeyClass, Module, ModuleSession, ObjectQuery};
use crate::session::{SessionAccess, SessionManager};
use crate::signature::{P256_COMPONENT_SIZE, RawSignature, der_to_raw, raw_to_der};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureComponents {
    pub r_hex: String,
    pub s_hex: String,
    pub r_base64_url: String,
    pub s_base64_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResult {
    pub algorithm: String,
    pub hash: String,
    pub hash_hex: String,
    pub signature_der_base64: String,
    pub signature_raw: SignatureComponents,
}

/// Both encodings of one signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSignature {
    pub der: Vec<u8>,
    pub raw: RawSignature,
}

/// Accept DER or raw `r || s` module output.
///
/// Output is DER only when it starts with the SEQUENCE tag and decodes as a
/// sequence spanning every byte. A raw `r` may itself start with 0x30, so a
/// 64-byte output that fails to decode is taken as raw.
pub fn normalize_signature(output: &[u8]) -> Result<NormalizedSignature, CustodyError> {
    if output.first() == Some(&0x30) {
        match der_to_raw(output, P256_COMPONENT_SIZE) {
            Ok(raw) => {
                return Ok(NormalizedSignature {
                    der: output.to_vec(),
                    raw,
                });
            }
            Err(e) if output.len() != 2 * P256_COMPONENT_SIZE => return Err(e),
            Err(_) => {}
        }
    }

    if output.len() == 2 * P256_COMPONENT_SIZE {
        let (r, s) = output.split_at(P256_COMPONENT_SIZE);
        return Ok(NormalizedSignature {
            der: raw_to_der(r, s),
            raw: RawSignature {
                r: r.to_vec(),
                s: s.to_vec(),
            },
        });
    }

    Err(CustodyError::SignatureFormat(format!(
        "{} bytes, expected DER or {} raw bytes",
        output.len(),
        2 * P256_COMPONENT_SIZE
    )))
}

pub struct Signer<M: Module> {
    sessions: Arc<SessionManager<M>>,
}

impl<M: Module> Clone for Signer<M> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
        }
    }
}

impl<M: Module> Signer<M> {
    pub fn new(sessions: Arc<SessionManager<M>>) -> Self {
        Self { sessions }
    }

    /// Sign the SHA-256 digest of `data` with the private key `id`.
    pub fn sign_data(&self, id: &str, data: &[u8]) -> Result<SignResult, CustodyError> {
        let key_id = parse_key_id(id)?;
        let digest = Sha256::digest(data);

        let output = self.sessions.with_session(SessionAccess::USER, |session| {
            let key = session
                .find_objects(&ObjectQuery::by_id(KeyClass::PrivateKey, &key_id))?
                .into_iter()
                .next()
                .ok_or_else(|| CustodyError::KeyNotFound(hex::encode(&key_id)))?;
            Ok(session.sign(key, &digest)?)
        })?;

        let signature = normalize_signature(&output)?;
        debug!(key_id = %hex::encode(&key_id), output_len = output.len(), "Signed digest");

        Ok(SignResult {
            algorithm: "ECDSA".to_string(),
            hash: "SHA-256".to_string(),
            hash_hex: hex::encode(digest),
            signature_der_base64: STANDARD.encode(&signature.der),
            signature_raw: SignatureComponents {
                r_hex: hex::encode(&signature.raw.r),
                s_hex: hex::encode(&signature.raw.s),
                r_base64_url: URL_SAFE_NO_PAD.encode(&signature.raw.r),
                s_base64_url: URL_SAFE_NO_PAD.encode(&signature.raw.s),
            },
        })
    }
}
