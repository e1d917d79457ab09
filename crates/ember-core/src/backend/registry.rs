//! Registry of compiled-in backends.

use super::{BackendOps, BackendSettings};
use crate::capability::{self, Capability, OpClass};
use crate::error::{EmberError, Result};
use crate::kernels;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Maximum number of registered backends.
pub const MAX_BACKENDS: usize = 16;

/// Builds an ops table.
pub type BackendFactory = fn(&BackendSettings) -> Arc<dyn BackendOps>;

/// A registered backend.
#[derive(Clone, Copy)]
pub struct BackendEntry {
    /// Unique name.
    pub name: &'static str,
    /// Capability the backend needs.
    pub capability: Capability,
    /// Constructor.
    pub factory: BackendFactory,
}

impl fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEntry")
            .field("name", &self.name)
            .field("capability", &self.capability)
            .finish()
    }
}

/// Fixed-capacity list of backends.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    entries: Vec<BackendEntry>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(MAX_BACKENDS),
        }
    }

    /// A registry holding every backend compiled into this build.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for entry in kernels::builtin_backends() {
            if let Err(e) = registry.register(entry) {
                warn!(backend = entry.name, error = %e, "built-in backend not registered");
            }
        }
        registry
    }

    /// Add a backend. Fails when full or when the name is taken.
    pub fn register(&mut self, entry: BackendEntry) -> Result<()> {
        if self.entries.len() >= MAX_BACKENDS {
            return Err(EmberError::Backend(format!(
                "registry full ({} backends)",
                MAX_BACKENDS
            )));
        }
        if self.entries.iter().any(|e| e.name == entry.name) {
            return Err(EmberError::Backend(format!(
                "backend {} already registered",
                entry.name
            )));
        }
        debug!(backend = entry.name, capability = %entry.capability, "backend registered");
        self.entries.push(entry);
        Ok(())
    }

    /// Every registered backend, usable on this host or not.
    pub fn entries(&self) -> &[BackendEntry] {
        &self.entries
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Backend for `cap`, if registered and usable on this host.
    pub fn find(&self, cap: Capability) -> Option<&BackendEntry> {
        self.usable().find(|e| e.capability == cap)
    }

    /// Backend named `name`, if registered and usable on this host.
    pub fn find_by_name(&self, name: &str) -> Option<&BackendEntry> {
        self.usable().find(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Highest-priority usable backend for `class`.
    pub fn find_best(&self, class: OpClass) -> Option<&BackendEntry> {
        self.usable().max_by_key(|e| e.capability.rank(class))
    }

    pub(crate) fn best_or_scalar(&self, class: OpClass) -> &BackendEntry {
        self.find_best(class).unwrap_or(&kernels::scalar::ENTRY)
    }

    fn usable(&self) -> impl Iterator<Item = &BackendEntry> {
        let caps = capability::detect();
        self.entries
            .iter()
            .filter(move |e| caps.is_available(e.capability))
    }
}

static REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

/// The process-wide registry of built-in backends.
pub fn registry() -> &'static BackendRegistry {
    REGISTRY.get_or_init(BackendRegistry::with_builtins)
}
