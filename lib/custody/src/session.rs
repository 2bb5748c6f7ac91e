//! Session manager
//!
//! Owns the loaded PKCS#11 module and the selected slot, and runs operations
//! inside scoped sessions:
//!
//! 1. open a read-only or read-write session
//! 2. optionally log in as the user
//! 3. run the operation
//! 4. log out (best effort) and close (best effort)
//!
//! Step 4 runs on every exit path. An operation that fails because its session
//! was invalidated is re-run once from step 1.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::config::{SlotSelection, TokenConfig};
use crate::error::CustodyError;
use crate::module::{Module, ModuleError, ModuleSession};
use crate::pkcs11::CryptokiModule;

/// Extra attempts after a session is invalidated.
pub const MAX_SESSION_RETRIES: u32 = 1;

/// Access requested for a scoped session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionAccess {
    pub read_write: bool,
    pub authenticate: bool,
}

impl SessionAccess {
    pub const PUBLIC: Self = Self {
        read_write: false,
        authenticate: false,
    };
    pub const USER: Self = Self {
        read_write: false,
        authenticate: true,
    };
    pub const USER_READ_WRITE: Self = Self {
        read_write: true,
        authenticate: true,
    };
}

type Loader<M> = Box<dyn Fn(&Path) -> Result<M, ModuleError> + Send + Sync>;

/// A loaded module bound to its selected slot. The module is finalized when
/// the last holder drops the token.
struct Token<M: Module> {
    module: Option<M>,
    slot: M::Slot,
    label: String,
}

impl<M: Module> Token<M> {
    fn module(&self) -> Result<&M, CustodyError> {
        self.module.as_ref().ok_or_else(|| {
            CustodyError::Configuration("PKCS#11 module has been finalized".to_string())
        })
    }
}

impl<M: Module> Drop for Token<M> {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            module.finalize();
            info!(token_label = %self.label, "PKCS#11 module finalized");
        }
    }
}

enum ManagerState<M: Module> {
    Unloaded,
    Ready(Arc<Token<M>>),
    Finalized,
}

/// Process-wide owner of the PKCS#11 module.
///
/// Construct one at startup, share it behind an `Arc`, and call
/// [`SessionManager::shutdown`] when the process stops.
pub struct SessionManager<M: Module> {
    config: TokenConfig,
    loader: Loader<M>,
    state: Mutex<ManagerState<M>>,
    /// Number of scopes currently relying on the user login. The token's login
    /// state is shared by all sessions, so only the last scope logs out.
    logins: Mutex<usize>,
    /// Held for a whole scoped operation when calls are serialized.
    call_gate: Mutex<()>,
}

impl SessionManager<CryptokiModule> {
    /// Manager that loads a real PKCS#11 library through cryptoki.
    pub fn pkcs11(config: TokenConfig) -> Self {
        Self::new(config, CryptokiModule::load)
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<M: Module> SessionManager<M> {
    pub fn new(
        config: TokenConfig,
        loader: impl Fn(&Path) -> Result<M, ModuleError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            loader: Box::new(loader),
            state: Mutex::new(ManagerState::Unloaded),
            logins: Mutex::new(0),
            call_gate: Mutex::new(()),
        }
    }

    /// Load the module and select the slot. Does nothing if already initialized.
    pub fn initialize(&self) -> Result<(), CustodyError> {
        self.token().map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        matches!(&*lock_ignoring_poison(&self.state), ManagerState::Ready(_))
    }

    /// Label of the selected token, once initialized.
    pub fn token_label(&self) -> Option<String> {
        match &*lock_ignoring_poison(&self.state) {
            ManagerState::Ready(token) => Some(token.label.clone()),
            _ => None,
        }
    }

    fn token(&self) -> Result<Arc<Token<M>>, CustodyError> {
        let mut state = lock_ignoring_poison(&self.state);
        match &*state {
            ManagerState::Ready(token) => return Ok(token.clone()),
            ManagerState::Finalized => {
                return Err(CustodyError::Configuration(
                    "PKCS#11 module has been finalized".to_string(),
                ));
            }
            ManagerState::Unloaded => {}
        }

        let token = Arc::new(self.load()?);
        *state = ManagerState::Ready(token.clone());
        Ok(token)
    }

    fn load(&self) -> Result<Token<M>, CustodyError> {
        if self.config.token_label.trim().is_empty() {
            return Err(CustodyError::Configuration(
                "Token label is required".to_string(),
            ));
        }
        if self.config.pin.expose_secret().is_empty() {
            return Err(CustodyError::Configuration("PIN is required".to_string()));
        }

        let path = self.config.resolve_module_path()?;
        let module = (self.loader)(&path).map_err(|e| {
            CustodyError::Configuration(format!(
                "Failed to initialize PKCS#11 module {}: {}",
                path.display(),
                e
            ))
        })?;

        let (slot, label) =
            match select_slot(&module, &self.config.token_label, self.config.slot_selection) {
                Ok(selected) => selected,
                Err(e) => {
                    module.finalize();
                    return Err(e);
                }
            };

        info!(
            module_path = %path.display(),
            slot = ?slot,
            token_label = %label,
            "PKCS#11 initialized"
        );

        Ok(Token {
            module: Some(module),
            slot,
            label,
        })
    }

    /// Finalize the module. Later operations fail with a configuration error.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(
            &mut *lock_ignoring_poison(&self.state),
            ManagerState::Finalized,
        );

        if let ManagerState::Ready(token) = previous
            && Arc::strong_count(&token) > 1
        {
            info!("PKCS#11 operations still running, module finalizes when they complete");
        }
    }

    /// Run `operation` inside a scoped session.
    ///
    /// The session is closed before this returns, whatever the outcome. If
    /// the attempt fails with [`CustodyError::SessionInvalidated`] it is
    /// repeated, at most [`MAX_SESSION_RETRIES`] times.
    pub fn with_session<T, F>(
        &self,
        access: SessionAccess,
        mut operation: F,
    ) -> Result<T, CustodyError>
    where
        F: FnMut(&M::Session) -> Result<T, CustodyError>,
    {
        let token = self.token()?;
        let _gate = self
            .config
            .serialize_calls
            .then(|| lock_ignoring_poison(&self.call_gate));

        let mut retries = 0;
        loop {
            match self.attempt(&token, access, &mut operation) {
                Err(CustodyError::SessionInvalidated) if retries < MAX_SESSION_RETRIES => {
                    retries += 1;
                    warn!(retries, "PKCS#11 session invalidated, retrying operation");
                }
                result => return result,
            }
        }
    }

    fn attempt<T, F>(
        &self,
        token: &Token<M>,
        access: SessionAccess,
        operation: &mut F,
    ) -> Result<T, CustodyError>
    where
        F: FnMut(&M::Session) -> Result<T, CustodyError>,
    {
        let session = token.module()?.open_session(token.slot, access.read_write)?;
        debug!(read_write = access.read_write, "Opened PKCS#11 session");

        let mut scope = SessionScope {
            session: Some(session),
            logins: None,
        };

        if access.authenticate {
            let mut logins = lock_ignoring_poison(&self.logins);
            match scope.session().login(&self.config.pin) {
                Ok(()) => debug!("Logged in to token"),
                Err(ModuleError::AlreadyLoggedIn) => debug!("User already logged in"),
                Err(ModuleError::PinIncorrect) => {
                    return Err(CustodyError::Unauthorized("PIN incorrect".to_string()));
                }
                Err(e) => return Err(e.into()),
            }
            *logins += 1;
            scope.logins = Some(&self.logins);
        }

        operation(scope.session())
    }
}

/// Releases a session on drop: logout when this was the last login holder,
/// then close. Release failures are logged, never raised.
struct SessionScope<'a, S: ModuleSession> {
    session: Option<S>,
    logins: Option<&'a Mutex<usize>>,
}

impl<S: ModuleSession> SessionScope<'_, S> {
    fn session(&self) -> &S {
        // Only emptied in drop.
        match &self.session {
            Some(session) => session,
            None => unreachable!("session scope used after release"),
        }
    }
}

impl<S: ModuleSession> Drop for SessionScope<'_, S> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        if let Some(logins) = self.logins.take() {
            let mut holders = lock_ignoring_poison(logins);
            *holders = holders.saturating_sub(1);
            if *holders == 0
                && let Err(e) = session.logout()
            {
                warn!(error = %e, "Failed to log out of PKCS#11 session");
            }
        }

        match session.close() {
            Ok(()) => debug!("Closed PKCS#11 session"),
            Err(e) => warn!(error = %e, "Failed to close PKCS#11 session"),
        }
    }
}

/// Pick the slot whose token label matches `wanted`, ignoring trailing padding.
fn select_slot<M: Module>(
    module: &M,
    wanted: &str,
    selection: SlotSelection,
) -> Result<(M::Slot, String), CustodyError> {
    let slots = module.slots_with_token().map_err(|e| {
        CustodyError::Configuration(format!("Failed to list PKCS#11 slots: {}", e))
    })?;

    let wanted = wanted.trim_end();
    let mut first = None;
    for slot in slots {
        let label = module.token_label(slot).map_err(|e| {
            CustodyError::Configuration(format!("Failed to read token info: {}", e))
        })?;
        let label = label.trim_end().to_string();
        if label == wanted {
            return Ok((slot, label));
        }
        if first.is_none() {
            first = Some((slot, label));
        }
    }

    match (first, selection) {
        (None, _) => Err(CustodyError::Configuration(
            "No PKCS#11 slot with a token available".to_string(),
        )),
        (Some((_, found)), SlotSelection::Strict) => Err(CustodyError::Configuration(format!(
            "No token labelled '{}' (first token is '{}')",
            wanted, found
        ))),
        (Some((slot, found)), SlotSelection::FallbackToFirst) => {
            warn!(
                wanted_label = %wanted,
                using_label = %found,
                "Token label mismatch, using first slot"
            );
            Ok((slot, found))
        }
    }
}
