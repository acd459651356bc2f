//! Named request handlers.
//!
//! Applications register synchronous callbacks by name; the server invokes
//! them with the request payload and the current user. Optional connect and
//! disconnect hooks bracket every call (for example to check out and return
//! a per-site database connection).

use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, trace};

/// A named handler: `(data, current_user_id) -> response`.
pub type Handler = Arc<dyn Fn(&str, Option<u64>) -> Value + Send + Sync>;

/// A hook run around every call, given the site id.
pub type Hook = Arc<dyn Fn(Option<&str>) + Send + Sync>;

/// Handler errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// No handler registered under this name.
    #[error("Unknown handler: {0}")]
    UnknownHandler(String),
}

/// Registry of named handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Handler>,
    on_connect: RwLock<Option<Hook>>,
    on_disconnect: RwLock<Option<Hook>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn handle<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&str, Option<u64>) -> Value + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(handler = %name, "Registered handler");
        self.handlers.insert(name, Arc::new(handler));
    }

    /// Set the hook run before every call.
    pub fn on_connect<F>(&self, hook: F)
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        *self.on_connect.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Set the hook run after every call, including failed ones.
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        *self.on_disconnect.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Whether a handler is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Get the registered handler names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Invoke a handler.
    ///
    /// # Errors
    ///
    /// Returns an error if no handler is registered under `name`.
    pub fn call(
        &self,
        site_id: Option<&str>,
        name: &str,
        data: &str,
        user_id: Option<u64>,
    ) -> Result<Value, HandlerError> {
        // Clone out so no map guard is held while user code runs.
        let handler = self.handlers.get(name).map(|h| h.value().clone());

        run_hook(&self.on_connect, site_id);
        let result = match handler {
            Some(handler) => {
                trace!(handler = %name, site = ?site_id, user = ?user_id, "Calling handler");
                Ok(handler(data, user_id))
            }
            None => Err(HandlerError::UnknownHandler(name.to_string())),
        };
        run_hook(&self.on_disconnect, site_id);

        result
    }
}

fn run_hook(slot: &RwLock<Option<Hook>>, site_id: Option<&str>) {
    let hook = slot.read().unwrap_or_else(PoisonError::into_inner).clone();
    if let Some(hook) = hook {
        hook(site_id);
    }
}
