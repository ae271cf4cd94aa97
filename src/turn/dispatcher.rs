//! Routing of assistant function calls to host handlers

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value};

use crate::Result;

/// Handler invoked with the parsed call arguments
pub type FunctionHandler = Arc<dyn Fn(&Map<String, Value>) -> Result<()> + Send + Sync>;

/// Name-keyed registry of function call handlers
///
/// Cloning shares the registry, so the host can register handlers on one
/// clone while the controller dispatches on another.
#[derive(Clone, Default)]
pub struct FunctionCallDispatcher {
    handlers: Arc<RwLock<HashMap<String, FunctionHandler>>>,
}

impl FunctionCallDispatcher {
    /// Create an empty dispatcher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `name`, replacing any previous one
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Map<String, Value>) -> Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(function = %name, "function handler registered");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(handler));
    }

    /// Remove the handler for `name`, returning whether one existed
    pub fn unregister(&self, name: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Whether a handler is registered for `name`
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered function names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Invoke the handler for `name`
    ///
    /// Returns `true` if a handler ran successfully. Missing handlers and
    /// handler errors are logged, never propagated.
    pub fn dispatch(&self, name: &str, args: &Map<String, Value>) -> bool {
        // Clone out so a handler may register or unregister without deadlocking
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();

        let Some(handler) = handler else {
            tracing::warn!(function = %name, "no handler registered for function call");
            return false;
        };

        match handler(args) {
            Ok(()) => {
                tracing::debug!(function = %name, "function call handled");
                true
            }
            Err(e) => {
                tracing::warn!(function = %name, error = %e, "function handler failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for FunctionCallDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionCallDispatcher")
            .field("functions", &self.names())
            .finish()
    }
}
