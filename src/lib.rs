//! modperf - per-extension CPU time attribution for plugin hosts
//!
//! This library measures how much time a host spends inside each loaded
//! extension module. Eligible extension methods are selected from the host's
//! type metadata, checked against their on-disk binaries, and timed through
//! explicit call-site hooks. Completed outer calls feed a per-module sliding
//! window that the attribution reader turns into ranked percentages.

pub mod attribution;
pub mod cli;
pub mod clock;
pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod hooks;
pub mod inspector;
pub mod module;
pub mod registry;
pub mod reporter;
pub mod selector;
pub mod synth;
pub mod timing;
pub mod window;

pub use attribution::{AttributionReader, AttributionRow, DisplayNames, Snapshot};
pub use config::MonitorConfig;
pub use controller::{CallGuard, InterceptionController, LifecycleState};
pub use diagnostics::DiagnosticsSnapshot;
pub use module::{CallSite, ModuleDescriptor, ModuleId};
pub use window::SlidingWindowAggregator;
