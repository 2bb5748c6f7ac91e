//! Token configuration and module path discovery

use std::path::{Path, PathBuf};

use cryptoki::types::AuthPin;
use tracing::debug;

use crate::error::CustodyError;

/// Fallback library locations, tried after the override and discovered paths.
pub const STATIC_MODULE_PATHS: &[&str] = &[
    "/opt/homebrew/lib/softhsm/libsofthsm2.so",
    "/opt/homebrew/lib/softhsm/libsofthsm2.dylib",
    "/usr/lib/softhsm/libsofthsm2.so",
    "/usr/lib/x86_64-linux-gnu/softhsm/libsofthsm2.so",
    "/usr/local/lib/softhsm/libsofthsm2.so",
];

const HOMEBREW_CELLAR: &str = "/opt/homebrew/Cellar/softhsm";

/// What to do when no token carries the configured label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotSelection {
    /// Use the first slot holding a token and log a warning.
    #[default]
    FallbackToFirst,
    /// Refuse to start.
    Strict,
}

/// Token access configuration
pub struct TokenConfig {
    /// Explicit library path, tried before any discovered location
    pub module_path: Option<PathBuf>,
    /// Label of the token to operate on
    pub token_label: String,
    /// User PIN
    pub pin: AuthPin,
    pub slot_selection: SlotSelection,
    /// Hold a process-wide lock around every scoped operation, for libraries
    /// that are not safe to call from several threads.
    pub serialize_calls: bool,
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("module_path", &self.module_path)
            .field("token_label", &self.token_label)
            .field("slot_selection", &self.slot_selection)
            .field("serialize_calls", &self.serialize_calls)
            .finish_non_exhaustive()
    }
}

impl TokenConfig {
    pub fn new(token_label: impl Into<String>, pin: impl Into<String>) -> Self {
        Self {
            module_path: None,
            token_label: token_label.into(),
            pin: AuthPin::new(pin.into()),
            slot_selection: SlotSelection::default(),
            serialize_calls: false,
        }
    }

    pub fn with_module_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.module_path = Some(path.into());
        self
    }

    pub fn with_slot_selection(mut self, selection: SlotSelection) -> Self {
        self.slot_selection = selection;
        self
    }

    pub fn with_serialized_calls(mut self, serialize: bool) -> Self {
        self.serialize_calls = serialize;
        self
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, CustodyError> {
        let token_label = required_env("PKCS11_TOKEN_LABEL")?;
        let pin = required_env("PKCS11_PIN")?;

        let module_path = std::env::var("PKCS11_MODULE_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        let slot_selection = if env_flag("PKCS11_STRICT_TOKEN_LABEL")? {
            SlotSelection::Strict
        } else {
            SlotSelection::FallbackToFirst
        };

        Ok(Self {
            module_path,
            token_label,
            pin: AuthPin::new(pin),
            slot_selection,
            serialize_calls: env_flag("PKCS11_SERIALIZE_CALLS")?,
        })
    }

    /// Candidate library paths in the order they are tried, without duplicates.
    pub fn module_candidates(&self) -> Vec<PathBuf> {
        let ordered = self
            .module_path
            .iter()
            .cloned()
            .chain(discover_homebrew_paths(Path::new(HOMEBREW_CELLAR)))
            .chain(STATIC_MODULE_PATHS.iter().map(PathBuf::from));

        let mut candidates: Vec<PathBuf> = Vec::new();
        for path in ordered {
            if !candidates.contains(&path) {
                candidates.push(path);
            }
        }
        candidates
    }

    /// First accessible candidate, or a configuration error naming every path tried.
    pub fn resolve_module_path(&self) -> Result<PathBuf, CustodyError> {
        resolve_first_accessible(self.module_candidates())
    }
}

fn required_env(name: &str) -> Result<String, CustodyError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CustodyError::Configuration(format!("{} is required", name)))
}

fn env_flag(name: &str) -> Result<bool, CustodyError> {
    match std::env::var(name) {
        Err(_) => Ok(false),
        Ok(value) => parse_flag(&value)
            .ok_or_else(|| CustodyError::Configuration(format!("{} must be a boolean", name))),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "off" => Some(false),
        "1" | "true" | "yes" | "on" => Some(true),
        _ => None,
    }
}

pub(crate) fn resolve_first_accessible(
    candidates: Vec<PathBuf>,
) -> Result<PathBuf, CustodyError> {
    let mut tried = Vec::with_capacity(candidates.len());
    for path in candidates {
        match std::fs::metadata(&path) {
            Ok(_) => {
                debug!("PKCS#11 module candidate accessible: {}", path.display());
                return Ok(path);
            }
            Err(e) => {
                debug!("PKCS#11 module candidate {} rejected: {}", path.display(), e);
                tried.push(path.display().to_string());
            }
        }
    }

    Err(CustodyError::Configuration(format!(
        "PKCS#11 module not found. Tried: {}. Set PKCS11_MODULE_PATH to the library location",
        tried.join(", ")
    )))
}

/// `libsofthsm2.{so,dylib}` under every installed version in a Homebrew cellar.
fn discover_homebrew_paths(cellar: &Path) -> Vec<PathBuf> {
    let Ok(versions) = std::fs::read_dir(cellar) else {
        return Vec::new();
    };

    let mut paths = Vec::new();
    for version in versions.flatten() {
        let lib_dir = version.path().join("lib").join("softhsm");
        let Ok(entries) = std::fs::read_dir(&lib_dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            let is_library = name.ends_with(".so") || name.ends_with(".dylib");
            if name.starts_with("libsofthsm2.") && is_library {
                paths.push(lib_dir.join(&file_name));
            }
        }
    }
    paths.sort();
    paths
}
