//! In-memory PKCS#11 module for tests
//!
//! Behaves like a single SoftHSM token: key pairs are generated with `p256`,
//! private objects are only visible to a logged-in user, writes need a
//! read-write session, and the login state is shared by every session of the
//! module. Faults can be injected to exercise the session manager's error paths.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cryptoki::types::AuthPin;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use secrecy::ExposeSecret;

use crate::config::TokenConfig;
use crate::keys::P256_EC_PARAMS;
use crate::module::{
    KeyAttribute, KeyAttributes, KeyClass, KeyPairTemplate, Module, ModuleError, ModuleSession,
    ObjectQuery,
};
use crate::session::SessionManager;

/// Encoding the token uses for `CKM_ECDSA` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureOutput {
    /// `r || s`, as the PKCS#11 specification requires
    #[default]
    Raw,
    /// DER sequence, as some vendor modules return
    Der,
}

/// Call counters for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub sessions_opened: usize,
    pub sessions_closed: usize,
    pub logins: usize,
    pub logouts: usize,
    pub signatures: usize,
    pub finalized: bool,
}

struct StoredObject {
    class: KeyClass,
    id: Option<Vec<u8>>,
    label: Option<String>,
    ec_point: Option<Vec<u8>>,
    signing_key: Option<SigningKey>,
}

#[derive(Default)]
struct Faults {
    invalidate_next: usize,
    fail_logout: bool,
    fail_close: bool,
    fail_destroy: bool,
    unreadable_ids: HashSet<Vec<u8>>,
    signature_override: Option<Vec<u8>>,
}

struct TokenState {
    labels: Vec<String>,
    pin: String,
    objects: BTreeMap<u64, StoredObject>,
    next_handle: u64,
    next_session: u64,
    open_sessions: HashSet<u64>,
    logged_in: bool,
    signature_output: SignatureOutput,
    faults: Faults,
    stats: MemoryStats,
}

impl TokenState {
    fn take_invalidation(&mut self) -> Result<(), ModuleError> {
        if self.faults.invalidate_next > 0 {
            self.faults.invalidate_next -= 1;
            return Err(ModuleError::SessionInvalid);
        }
        Ok(())
    }

    fn insert(&mut self, object: StoredObject) -> u64 {
        self.next_handle += 1;
        self.objects.insert(self.next_handle, object);
        self.next_handle
    }
}

/// Shared handle to an in-memory token. Clones observe the same state.
#[derive(Clone)]
pub struct MemoryToken {
    state: Arc<Mutex<TokenState>>,
}

impl MemoryToken {
    pub fn new(label: &str, pin: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(TokenState {
                labels: vec![label.to_string()],
                pin: pin.to_string(),
                objects: BTreeMap::new(),
                next_handle: 0,
                next_session: 0,
                open_sessions: HashSet::new(),
                logged_in: false,
                signature_output: SignatureOutput::default(),
                faults: Faults::default(),
                stats: MemoryStats::default(),
            })),
        }
    }

    /// A token with no slots at all.
    pub fn empty(pin: &str) -> Self {
        let token = Self::new("", pin);
        token.lock().labels.clear();
        token
    }

    /// Add another slot holding a token with `label`.
    pub fn with_slot(self, label: &str) -> Self {
        self.lock().labels.push(label.to_string());
        self
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn module(&self) -> MemoryModule {
        MemoryModule {
            state: self.state.clone(),
        }
    }

    /// Session manager over this token. The configured module path is only
    /// checked for existence; the loader ignores it.
    pub fn session_manager(&self, config: TokenConfig) -> SessionManager<MemoryModule> {
        let config = if config.module_path.is_none() {
            config.with_module_path(placeholder_module_path())
        } else {
            config
        };
        let token = self.clone();
        SessionManager::new(config, move |_path: &Path| Ok(token.module()))
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions.len()
    }

    pub fn is_logged_in(&self) -> bool {
        self.lock().logged_in
    }

    /// The next `count` object operations fail with an invalidated session.
    pub fn invalidate_sessions(&self, count: usize) {
        self.lock().faults.invalidate_next = count;
    }

    pub fn fail_logout(&self, fail: bool) {
        self.lock().faults.fail_logout = fail;
    }

    pub fn fail_close(&self, fail: bool) {
        self.lock().faults.fail_close = fail;
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.lock().faults.fail_destroy = fail;
    }

    pub fn set_signature_output(&self, output: SignatureOutput) {
        self.lock().signature_output = output;
    }

    /// Return these bytes from every sign call instead of a real signature.
    pub fn override_signature(&self, bytes: Vec<u8>) {
        self.lock().faults.signature_override = Some(bytes);
    }

    /// Attribute reads on objects with this id fail.
    pub fn make_unreadable(&self, id: &[u8]) {
        self.lock().faults.unreadable_ids.insert(id.to_vec());
    }

    /// A public key object with a label but no `CKA_ID`.
    pub fn insert_orphan_public_key(&self, label: &str) {
        self.lock().insert(StoredObject {
            class: KeyClass::PublicKey,
            id: None,
            label: Some(label.to_string()),
            ec_point: None,
            signing_key: None,
        });
    }

    /// Number of objects of `class` carrying `id`.
    pub fn count_objects(&self, class: KeyClass, id: &[u8]) -> usize {
        self.lock()
            .objects
            .values()
            .filter(|o| o.class == class && o.id.as_deref() == Some(id))
            .count()
    }
}

/// Path of a file guaranteed to exist, for configurations whose loader
/// never opens it.
pub fn placeholder_module_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml")
}

/// [`Module`] implementation over a [`MemoryToken`].
pub struct MemoryModule {
    state: Arc<Mutex<TokenState>>,
}

impl MemoryModule {
    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Module for MemoryModule {
    type Slot = usize;
    type Session = MemorySession;

    fn slots_with_token(&self) -> Result<Vec<usize>, ModuleError> {
        Ok((0..self.lock().labels.len()).collect())
    }

    fn token_label(&self, slot: usize) -> Result<String, ModuleError> {
        self.lock()
            .labels
            .get(slot)
            .map(|label| format!("{:<32}", label))
            .ok_or_else(|| ModuleError::Other("CKR_SLOT_ID_INVALID".to_string()))
    }

    fn open_session(&self, _slot: usize, read_write: bool) -> Result<MemorySession, ModuleError> {
        let mut state = self.lock();
        if state.stats.finalized {
            return Err(ModuleError::Other(
                "CKR_CRYPTOKI_NOT_INITIALIZED".to_string(),
            ));
        }
        state.next_session += 1;
        let handle = state.next_session;
        state.open_sessions.insert(handle);
        state.stats.sessions_opened += 1;
        Ok(MemorySession {
            state: self.state.clone(),
            handle,
            read_write,
        })
    }

    fn finalize(self) {
        let mut state = self.lock();
        state.stats.finalized = true;
        state.open_sessions.clear();
        state.logged_in = false;
    }
}

/// One open session on a [`MemoryToken`].
pub struct MemorySession {
    state: Arc<Mutex<TokenState>>,
    handle: u64,
    read_write: bool,
}

impl MemorySession {
    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_write(&self) -> Result<(), ModuleError> {
        if self.read_write {
            Ok(())
        } else {
            Err(ModuleError::Other("CKR_SESSION_READ_ONLY".to_string()))
        }
    }
}

fn not_logged_in() -> ModuleError {
    ModuleError::Other("CKR_USER_NOT_LOGGED_IN".to_string())
}

impl ModuleSession for MemorySession {
    type Object = u64;

    fn login(&self, pin: &AuthPin) -> Result<(), ModuleError> {
        let mut state = self.lock();
        if state.logged_in {
            return Err(ModuleError::AlreadyLoggedIn);
        }
        if pin.expose_secret() != &state.pin {
            return Err(ModuleError::PinIncorrect);
        }
        state.logged_in = true;
        state.stats.logins += 1;
        Ok(())
    }

    fn logout(&self) -> Result<(), ModuleError> {
        let mut state = self.lock();
        if state.faults.fail_logout {
            return Err(ModuleError::Other("CKR_DEVICE_ERROR".to_string()));
        }
        if !state.logged_in {
            return Err(not_logged_in());
        }
        state.logged_in = false;
        state.stats.logouts += 1;
        Ok(())
    }

    fn close(self) -> Result<(), ModuleError> {
        let mut state = self.lock();
        state.open_sessions.remove(&self.handle);
        state.stats.sessions_closed += 1;
        // Closing the last session logs the user out.
        if state.open_sessions.is_empty() {
            state.logged_in = false;
        }
        if state.faults.fail_close {
            return Err(ModuleError::Other("CKR_DEVICE_ERROR".to_string()));
        }
        Ok(())
    }

    fn find_objects(&self, query: &ObjectQuery) -> Result<Vec<u64>, ModuleError> {
        let mut state = self.lock();
        state.take_invalidation()?;
        let logged_in = state.logged_in;
        Ok(state
            .objects
            .iter()
            .filter(|(_, o)| o.class == query.class)
            .filter(|(_, o)| o.class == KeyClass::PublicKey || logged_in)
            .filter(|(_, o)| match &query.id {
                Some(id) => o.id.as_ref() == Some(id),
                None => true,
            })
            .map(|(handle, _)| *handle)
            .collect())
    }

    fn read_attributes(
        &self,
        object: u64,
        attributes: &[KeyAttribute],
    ) -> Result<KeyAttributes, ModuleError> {
        let mut state = self.lock();
        state.take_invalidation()?;
        let stored = state
            .objects
            .get(&object)
            .ok_or_else(|| ModuleError::Other("CKR_OBJECT_HANDLE_INVALID".to_string()))?;
        if let Some(id) = &stored.id
            && state.faults.unreadable_ids.contains(id)
        {
            return Err(ModuleError::Other("CKR_ATTRIBUTE_SENSITIVE".to_string()));
        }

        let mut values = KeyAttributes::default();
        for attr in attributes {
            match attr {
                KeyAttribute::Id => values.id = stored.id.clone(),
                KeyAttribute::Label => values.label = stored.label.clone(),
                KeyAttribute::EcPoint => values.ec_point = stored.ec_point.clone(),
            }
        }
        Ok(values)
    }

    fn generate_key_pair(&self, template: &KeyPairTemplate) -> Result<(u64, u64), ModuleError> {
        self.require_write()?;
        let mut state = self.lock();
        state.take_invalidation()?;
        if !state.logged_in {
            return Err(not_logged_in());
        }
        if template.ec_params != P256_EC_PARAMS {
            return Err(ModuleError::Other("CKR_CURVE_NOT_SUPPORTED".to_string()));
        }

        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        let point = signing_key.verifying_key().to_encoded_point(false);
        // SoftHSM reports CKA_EC_POINT wrapped in an OCTET STRING.
        let mut ec_point = vec![0x04, point.len() as u8];
        ec_point.extend_from_slice(point.as_bytes());

        let public = state.insert(StoredObject {
            class: KeyClass::PublicKey,
            id: Some(template.id.clone()),
            label: Some(template.label.clone()),
            ec_point: Some(ec_point),
            signing_key: None,
        });
        let private = state.insert(StoredObject {
            class: KeyClass::PrivateKey,
            id: Some(template.id.clone()),
            label: Some(template.label.clone()),
            ec_point: None,
            signing_key: Some(signing_key),
        });
        Ok((public, private))
    }

    fn sign(&self, key: u64, digest: &[u8]) -> Result<Vec<u8>, ModuleError> {
        let mut state = self.lock();
        state.take_invalidation()?;
        if !state.logged_in {
            return Err(not_logged_in());
        }
        let signing_key = state
            .objects
            .get(&key)
            .and_then(|o| o.signing_key.clone())
            .ok_or_else(|| ModuleError::Other("CKR_KEY_HANDLE_INVALID".to_string()))?;
        state.stats.signatures += 1;

        if let Some(bytes) = &state.faults.signature_override {
            return Ok(bytes.clone());
        }

        let signature: Signature = signing_key
            .sign_prehash(digest)
            .map_err(|e| ModuleError::Other(format!("CKR_FUNCTION_FAILED: {}", e)))?;
        Ok(match state.signature_output {
            SignatureOutput::Raw => signature.to_bytes().to_vec(),
            SignatureOutput::Der => signature.to_der().as_bytes().to_vec(),
        })
    }

    fn destroy_object(&self, object: u64) -> Result<(), ModuleError> {
        self.require_write()?;
        let mut state = self.lock();
        state.take_invalidation()?;
        if state.faults.fail_destroy {
            return Err(ModuleError::Other("CKR_ACTION_PROHIBITED".to_string()));
        }
        state
            .objects
            .remove(&object)
            .map(|_| ())
            .ok_or_else(|| ModuleError::Other("CKR_OBJECT_HANDLE_INVALID".to_string()))
    }
}
