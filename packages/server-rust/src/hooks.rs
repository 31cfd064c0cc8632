//! Process-wide hook bus.
//!
//! Handlers are registered at startup and run synchronously, in registration
//! order, on the thread that performs the triggering mutation. Nothing here
//! runs on a timer.

use std::sync::Arc;

use axum::Router;
use parking_lot::RwLock;
use rulebase_core::{Admin, Collection};

use crate::network::AppState;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Step<T> = Arc<dyn Fn(T) -> T + Send + Sync>;

/// A typed hook point fanning out to every registered handler.
pub struct Hook<T> {
    handlers: RwLock<Vec<Handler<T>>>,
}

impl<T> Hook<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Registers a handler.
    pub fn add(&self, handler: impl Fn(&T) + Send + Sync + 'static) {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Runs every handler with `event`.
    ///
    /// The handler list is snapshotted first, so handlers may register
    /// further handlers without deadlocking.
    pub fn trigger(&self, event: &T) {
        let handlers = self.handlers.read().clone();
        for handler in &handlers {
            handler(event);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Hook<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A hook point whose handlers take the value and hand back a replacement,
/// each seeing what the previous one returned.
pub struct Transform<T> {
    steps: RwLock<Vec<Step<T>>>,
}

impl<T> Transform<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            steps: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, step: impl Fn(T) -> T + Send + Sync + 'static) {
        self.steps.write().push(Arc::new(step));
    }

    /// Threads `value` through every registered step.
    pub fn apply(&self, value: T) -> T {
        let steps = self.steps.read().clone();
        steps.iter().fold(value, |value, step| step(value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Transform<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A collection definition was saved or removed.
#[derive(Debug, Clone)]
pub enum CollectionChange {
    Saved(Arc<Collection>),
    Deleted(String),
}

impl CollectionChange {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Saved(collection) => &collection.name,
            Self::Deleted(name) => name,
        }
    }
}

/// An admin account was created or removed.
#[derive(Debug, Clone)]
pub enum AdminChange {
    Created(Admin),
    Deleted(Admin),
}

/// All hook points of the application.
#[derive(Default)]
pub struct AppHooks {
    pub collection_changed: Hook<CollectionChange>,
    pub admin_changed: Hook<AdminChange>,
    /// Runs while the router is assembled, before middleware is applied,
    /// so routes added here get the same layers as the built-in ones.
    pub before_serve: Transform<Router<AppState>>,
}

impl AppHooks {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}
