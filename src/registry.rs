//! Display names for installed extensions
//!
//! The host's extension manager knows each extension by its binary path and
//! a human-readable name. Snapshots look names up here by the module's
//! canonical path and fall back to the module's short name.

use crate::attribution::DisplayNames;
use crate::module::ModuleId;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// An installed extension as the host's manager lists it
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExtensionInfo {
    pub display_name: String,
    pub binary_path: PathBuf,
}

/// Display names for extensions, keyed by binary path
///
/// Modules with no entry fall back to their own short name.
///
/// # Example TOML
/// ```toml
/// [[extension]]
/// display_name = "Better Weather"
/// binary_path = "/opt/game/mods/weather/weather.so"
/// ```
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    by_path: RwLock<HashMap<PathBuf, String>>,
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read extension registry: {}", path.as_ref().display())
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct RegistryFile {
            #[serde(default)]
            extension: Vec<ExtensionInfo>,
        }

        let file: RegistryFile =
            toml::from_str(content).context("Failed to parse extension registry TOML")?;

        let registry = Self::new();
        for info in file.extension {
            registry.register(info);
        }
        Ok(registry)
    }

    /// Add or replace an entry; safe while snapshots are being taken
    pub fn register(&self, info: ExtensionInfo) {
        self.by_path
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(canonical(&info.binary_path), info.display_name);
    }

    pub fn len(&self) -> usize {
        self.by_path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered name for `module`, if any
    pub fn lookup(&self, module: &ModuleId) -> Option<String> {
        self.by_path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module.path())
            .cloned()
    }
}

impl DisplayNames for ExtensionRegistry {
    fn display_name(&self, module: &ModuleId) -> String {
        self.lookup(module)
            .unwrap_or_else(|| module.short_name().to_string())
    }
}
