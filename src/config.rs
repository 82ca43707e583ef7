//! Monitor configuration
//!
//! Every field has a default, so an empty TOML document (or
//! `MonitorConfig::default()`) is a working configuration.
//!
//! # Example TOML
//! ```toml
//! window_secs = 10
//! top_n = 20
//! extension_base_types = ["ModBehaviour"]
//! framework_markers = ["Harmony", "Intercept"]
//! hook_install_symbols = ["Harmony::Patch", "HookTable::install"]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Name part of every session tag; hooks are removed by tag
    pub instrumentation_id: String,

    /// Sliding window length in seconds
    pub window_secs: u64,

    /// Rows kept in a snapshot
    pub top_n: usize,

    /// Reporter cadence in milliseconds
    pub flush_interval_ms: u64,

    /// Append the synthetic "unattributed" row to snapshots
    pub include_unattributed: bool,

    /// A module is an extension only if one of its types has one of these bases
    pub extension_base_types: Vec<String>,

    /// Attribute-name fragments identifying interception-framework code
    pub framework_markers: Vec<String>,

    /// Attribute that opts a method out of instrumentation
    pub no_instrument_marker: String,

    /// Fully-qualified `Type::method` names never to instrument
    pub never_instrument: Vec<String>,

    /// Symbols whose callers must never be hooked
    pub hook_install_symbols: Vec<String>,

    /// Bodies shorter than this many bytes are too trivial to time
    pub min_body_bytes: u64,

    /// How deep the inspector follows local helper calls
    pub max_helper_depth: usize,

    /// The only methods of the monitor's own module that get timed
    pub self_entry_points: Vec<String>,

    /// Binary of the monitor's own module; unset means no module is treated
    /// as the monitor unless one is named through the controller builder
    pub self_module_path: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            instrumentation_id: "modperf.monitor".to_string(),
            window_secs: 10,
            top_n: 20,
            flush_interval_ms: 1000,
            include_unattributed: true,
            extension_base_types: vec!["ModBehaviour".to_string()],
            framework_markers: vec!["Harmony".to_string(), "Intercept".to_string()],
            no_instrument_marker: "NoInstrument".to_string(),
            never_instrument: Vec::new(),
            hook_install_symbols: vec![
                "Harmony::Patch".to_string(),
                "HookTable::install".to_string(),
            ],
            min_body_bytes: 8,
            max_helper_depth: 4,
            self_entry_points: vec!["update".to_string(), "report".to_string()],
            self_module_path: None,
        }
    }
}

impl MonitorConfig {
    /// Load configuration from a TOML file
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read monitor config: {}", path.as_ref().display())
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).context("Failed to parse monitor config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_secs == 0 {
            bail!("window_secs must be > 0");
        }
        if self.top_n == 0 {
            bail!("top_n must be > 0");
        }
        if self.flush_interval_ms == 0 {
            bail!("flush_interval_ms must be > 0");
        }
        if self.instrumentation_id.trim().is_empty() {
            bail!("instrumentation_id must not be empty");
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}
