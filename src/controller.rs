//! Interception controller: session lifecycle and hook bodies
//!
//! ```text
//!            initialize            cleanup
//! Uninitialized ────────▶ Active ────────▶ TornDown
//!                          ▲  │ initialize      │
//!                          └──┘ (cleanup first) │
//!                          ▲────────────────────┘ initialize
//! ```
//!
//! `initialize` walks every loaded module through the selector and the
//! inspector and installs one hook per survivor, tagged with a fresh
//! [`SessionTag`]. Modules loaded later go through `on_module_activated`.
//! `cleanup` removes only this session's hooks and drops all timing state.
//!
//! Hosts route extension calls through [`InterceptionController::enter`] or
//! [`InterceptionController::call`]. Whether anything is measured is decided
//! per call by the hook table; un-hooked sites cost one atomic load and one
//! map lookup.
//!
//! # Example
//! ```
//! use modperf::{InterceptionController, MonitorConfig};
//! use modperf::module::{ModuleDescriptor, TypeDescriptor};
//!
//! let modules = vec![ModuleDescriptor::in_memory("Weather").with_type(
//!     TypeDescriptor::new("WeatherMod").extends("ModBehaviour").with_methods(["update"]),
//! )];
//!
//! let controller = InterceptionController::new(MonitorConfig::default());
//! controller.initialize(&modules);
//! controller.call(&modules[0].call_site("WeatherMod", "update"), || {
//!     // extension code runs here
//! });
//! controller.cleanup();
//! ```

use crate::attribution::{AttributionReader, DisplayNames, ShortNames};
use crate::clock::{Clock, MonotonicClock};
use crate::config::MonitorConfig;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot, FailureKind};
use crate::hooks::{HookError, HookTable, SessionTag};
use crate::inspector::EligibilityInspector;
use crate::module::{CallSite, ModuleHost, ModuleId, ModuleSource};
use crate::selector::CandidateSelector;
use crate::timing::{StopOutcome, TimingSessionStore};
use crate::window::SlidingWindowAggregator;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Where a controller is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Active,
    TornDown,
}

#[derive(Debug)]
enum Lifecycle {
    Uninitialized,
    Active(SessionTag),
    /// Remembers the last session so a repeated cleanup can retry removal
    TornDown(SessionTag),
}

pub struct InterceptionController {
    config: MonitorConfig,
    hooks: Arc<HookTable>,
    selector: CandidateSelector,
    inspector: EligibilityInspector,
    timings: TimingSessionStore,
    window: Arc<SlidingWindowAggregator>,
    clock: Arc<dyn Clock>,
    diagnostics: Arc<Diagnostics>,
    lifecycle: Mutex<Lifecycle>,
    /// Serial of the active session; 0 when not active
    active_serial: AtomicU64,
}

impl InterceptionController {
    /// Controller on the process-wide hook table and a monotonic clock
    pub fn new(config: MonitorConfig) -> Self {
        let window = Arc::new(SlidingWindowAggregator::new(config.window()));
        Self {
            hooks: HookTable::global(),
            selector: CandidateSelector::new(&config),
            inspector: EligibilityInspector::new(&config),
            timings: TimingSessionStore::new(),
            window,
            clock: Arc::new(MonotonicClock::new()),
            diagnostics: Arc::new(Diagnostics::new()),
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            active_serial: AtomicU64::new(0),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a private hook table instead of the global one
    pub fn with_hook_table(mut self, hooks: Arc<HookTable>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Identify the monitor's own module so only its entry points get hooked
    pub fn with_self_module(mut self, module: ModuleId) -> Self {
        self.selector = self.selector.clone().with_self_module(module);
        self
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LifecycleState {
        match *self.lock_lifecycle() {
            Lifecycle::Uninitialized => LifecycleState::Uninitialized,
            Lifecycle::Active(_) => LifecycleState::Active,
            Lifecycle::TornDown(_) => LifecycleState::TornDown,
        }
    }

    /// Tag of the active session, if any
    pub fn session(&self) -> Option<SessionTag> {
        match &*self.lock_lifecycle() {
            Lifecycle::Active(tag) => Some(tag.clone()),
            _ => None,
        }
    }

    /// Start a fresh session covering every module the host has loaded
    ///
    /// An active session is torn down first. Returns the number of hooks
    /// installed. Never fails: modules and candidates that can't be
    /// processed are skipped and counted in [`diagnostics`](Self::diagnostics).
    pub fn initialize<H: ModuleHost + ?Sized>(&self, host: &H) -> usize {
        let mut lifecycle = self.lock_lifecycle();
        if matches!(*lifecycle, Lifecycle::Active(_)) {
            self.teardown(&mut lifecycle);
        }

        let tag = SessionTag::new(&self.config.instrumentation_id);
        self.window.clear();
        self.timings.reset();

        let modules = match panic::catch_unwind(AssertUnwindSafe(|| host.loaded_modules())) {
            Ok(modules) => modules,
            Err(_) => {
                tracing::warn!("Host panicked while listing loaded modules");
                self.diagnostics.record_failure(FailureKind::Introspection);
                Vec::new()
            }
        };

        let installed: usize = modules
            .iter()
            .map(|module| self.instrument_module(*module, &tag))
            .sum();
        self.inspector.clear_cache();

        tracing::info!(
            "Session {} active: {} hooks across {} modules",
            tag,
            installed,
            modules.len()
        );
        self.active_serial.store(tag.serial(), Ordering::Release);
        *lifecycle = Lifecycle::Active(tag);
        installed
    }

    /// Hook a module that was loaded after `initialize`
    ///
    /// Ignored unless a session is active. Timing state is kept.
    pub fn on_module_activated(&self, module: &dyn ModuleSource) -> usize {
        let lifecycle = self.lock_lifecycle();
        let Lifecycle::Active(tag) = &*lifecycle else {
            tracing::debug!("Ignoring activation of {}: no active session", module.id());
            return 0;
        };

        let installed = self.instrument_module(module, tag);
        self.inspector.clear_cache();
        if installed > 0 {
            tracing::debug!("Activated {}: {} hooks", module.id(), installed);
        }
        installed
    }

    /// Remove this session's hooks and drop all timing state
    ///
    /// Safe to call in any state.
    pub fn cleanup(&self) {
        let mut lifecycle = self.lock_lifecycle();
        self.teardown(&mut lifecycle);
    }

    fn teardown(&self, lifecycle: &mut Lifecycle) {
        self.active_serial.store(0, Ordering::Release);

        let tag = match &*lifecycle {
            Lifecycle::Active(tag) | Lifecycle::TornDown(tag) => Some(tag.clone()),
            Lifecycle::Uninitialized => None,
        };

        if let Some(tag) = tag {
            match self.hooks.remove_all(&tag) {
                Ok(removed) => tracing::debug!("Removed {} hooks of session {}", removed, tag),
                Err(e) => {
                    tracing::warn!("Failed to remove hooks of session {}: {}", tag, e);
                    self.diagnostics.record_failure(FailureKind::Teardown);
                }
            }
            *lifecycle = Lifecycle::TornDown(tag);
        }

        self.window.clear();
        self.timings.reset();
    }

    /// Select, inspect and hook one module; panics are contained here
    fn instrument_module(&self, module: &dyn ModuleSource, tag: &SessionTag) -> usize {
        match panic::catch_unwind(AssertUnwindSafe(|| self.try_instrument(module, tag))) {
            Ok(installed) => installed,
            Err(_) => {
                tracing::debug!("Skipping module {}: introspection panicked", module.id());
                self.diagnostics.record_failure(FailureKind::Introspection);
                0
            }
        }
    }

    fn try_instrument(&self, module: &dyn ModuleSource, tag: &SessionTag) -> usize {
        let candidates = match self.selector.try_select(module) {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::debug!("Skipping module {}: {:#}", module.id(), e);
                self.diagnostics.record_failure(FailureKind::Introspection);
                return 0;
            }
        };

        let location = module.location();
        let mut installed = 0;
        for candidate in candidates {
            if let Err(e) = self.inspector.inspect(location, &candidate) {
                if e.is_policy() {
                    self.diagnostics.record_ineligible();
                } else {
                    self.diagnostics.record_failure(FailureKind::Introspection);
                }
                tracing::debug!("Skipping {}: {}", candidate.call_site(), e);
                continue;
            }

            match self.hooks.install(candidate.call_site(), tag) {
                Ok(()) => {
                    self.diagnostics.record_installed();
                    installed += 1;
                }
                Err(HookError::AlreadyInstalled { site, .. }) => {
                    tracing::trace!("{} already hooked", site);
                }
                Err(e) => {
                    tracing::debug!("Failed to hook {}: {}", candidate.call_site(), e);
                    self.diagnostics.record_failure(FailureKind::Installation);
                }
            }
        }
        installed
    }

    /// Whether calls through `site` are currently measured
    pub fn is_hooked(&self, site: &CallSite) -> bool {
        let serial = self.active_serial.load(Ordering::Acquire);
        serial != 0 && self.hooks.is_installed(site, serial)
    }

    /// Pre-call hook body
    pub fn on_pre_call(&self, site: &CallSite) {
        let Some(module) = site.module() else {
            return;
        };
        self.timings.start(module, self.clock.now());
    }

    /// Post-call hook body
    pub fn on_post_call(&self, site: &CallSite) {
        let Some(module) = site.module() else {
            return;
        };
        let now = self.clock.now();
        match self.timings.stop(module, now) {
            StopOutcome::Completed(elapsed) => self.window.record(module, now, elapsed),
            StopOutcome::Nested => {}
            StopOutcome::Mismatch => {
                tracing::trace!("Dropped unmatched post-call for {}", site);
                self.diagnostics.record_failure(FailureKind::TimingMismatch);
            }
        }
    }

    /// Enter `site`; the returned guard runs the post-call when dropped
    pub fn enter<'a>(&'a self, site: &'a CallSite) -> CallGuard<'a> {
        let armed = self.is_hooked(site);
        if armed {
            self.on_pre_call(site);
        }
        CallGuard {
            controller: self,
            site: armed.then_some(site),
            _not_send: PhantomData,
        }
    }

    /// Run `f` as a call through `site`
    pub fn call<R>(&self, site: &CallSite, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter(site);
        f()
    }

    pub fn window(&self) -> Arc<SlidingWindowAggregator> {
        Arc::clone(&self.window)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Reader naming modules by their short name
    pub fn reader(&self) -> AttributionReader {
        self.reader_with_names(Arc::new(ShortNames))
    }

    pub fn reader_with_names(&self, names: Arc<dyn DisplayNames>) -> AttributionReader {
        AttributionReader::new(self.window(), self.clock(), names, &self.config)
    }
}

impl Drop for InterceptionController {
    fn drop(&mut self) {
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Lifecycle::Active(tag) = lifecycle {
            if let Err(e) = self.hooks.remove_all(tag) {
                tracing::warn!("Failed to remove hooks of session {} on drop: {}", tag, e);
            }
        }
    }
}

/// An in-flight call through a call site
///
/// Bound to the entering thread: timing sessions are thread-local, so the
/// guard must be dropped where it was created.
#[must_use = "the call is measured until the guard is dropped"]
pub struct CallGuard<'a> {
    controller: &'a InterceptionController,
    /// Set when the pre-call ran
    site: Option<&'a CallSite>,
    _not_send: PhantomData<*const ()>,
}

impl CallGuard<'_> {
    /// Whether this call is being measured
    pub fn is_measured(&self) -> bool {
        self.site.is_some()
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if let Some(site) = self.site {
            self.controller.on_post_call(site);
        }
    }
}
