//! The interception facility
//!
//! Extension entry points are wrapped in explicit call sites (see
//! [`crate::controller::InterceptionController::enter`]). Whether a call site
//! is actually intercepted is decided here: a hook is a table entry mapping a
//! [`CallSite`] to the session tags that installed it. Several instrumentation
//! systems can share one table; each removes only what its own tag
//! installed.

use crate::module::CallSite;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use thiserror::Error;

static NEXT_SESSION_SERIAL: AtomicU64 = AtomicU64::new(1);
static GLOBAL_TABLE: OnceLock<Arc<HookTable>> = OnceLock::new();

/// Identity of one instrumentation session
///
/// The name is the configured instrumentation id; the serial is unique per
/// process, so two sessions of the same monitor never share a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionTag {
    id: Arc<str>,
    serial: u64,
}

impl SessionTag {
    pub fn new(id: &str) -> Self {
        Self {
            id: Arc::from(id),
            serial: NEXT_SESSION_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Never zero
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl fmt::Display for SessionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.serial)
    }
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("{site} is already hooked by {owner}")]
    AlreadyInstalled { site: CallSite, owner: SessionTag },

    #[error("{0} cannot be intercepted")]
    Sealed(CallSite),

    #[error("hook table lock poisoned")]
    Poisoned,
}

/// Process-wide table of intercepted call sites
#[derive(Debug, Default)]
pub struct HookTable {
    sites: RwLock<HashMap<CallSite, Vec<SessionTag>>>,
    sealed: RwLock<HashSet<CallSite>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table shared by every controller that doesn't bring its own
    pub fn global() -> Arc<HookTable> {
        Arc::clone(GLOBAL_TABLE.get_or_init(|| Arc::new(HookTable::new())))
    }

    /// Mark a call site as impossible to intercept
    pub fn seal(&self, site: CallSite) {
        self.sealed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(site);
    }

    /// Attach pre/post interception for `owner` to `site`
    pub fn install(&self, site: CallSite, owner: &SessionTag) -> Result<(), HookError> {
        if self
            .sealed
            .read()
            .map_err(|_| HookError::Poisoned)?
            .contains(&site)
        {
            return Err(HookError::Sealed(site));
        }

        let mut sites = self.sites.write().map_err(|_| HookError::Poisoned)?;
        if sites.get(&site).is_some_and(|owners| owners.contains(owner)) {
            return Err(HookError::AlreadyInstalled {
                site,
                owner: owner.clone(),
            });
        }
        sites.entry(site).or_default().push(owner.clone());
        Ok(())
    }

    /// Detach every hook installed by `owner`; returns how many were removed
    pub fn remove_all(&self, owner: &SessionTag) -> Result<usize, HookError> {
        let mut sites = self.sites.write().map_err(|_| HookError::Poisoned)?;
        let mut removed = 0;
        sites.retain(|_, owners| {
            let before = owners.len();
            owners.retain(|tag| tag != owner);
            removed += before - owners.len();
            !owners.is_empty()
        });
        Ok(removed)
    }

    /// Whether the session with `serial` has hooked `site`
    pub fn is_installed(&self, site: &CallSite, serial: u64) -> bool {
        self.sites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(site)
            .is_some_and(|owners| owners.iter().any(|tag| tag.serial == serial))
    }

    /// Number of hooks `owner` currently has installed
    pub fn installed_by(&self, owner: &SessionTag) -> usize {
        self.sites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|owners| owners.contains(owner))
            .count()
    }

    /// Sessions that hooked `site`
    pub fn owners(&self, site: &CallSite) -> Vec<SessionTag> {
        self.sites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(site)
            .cloned()
            .unwrap_or_default()
    }
}
