//! Terminable resources.
//!
//! A [`Terminable`] is anything that can be released exactly once and asked
//! whether it already was. Registries collect terminables and release them
//! in reverse order when their owner shuts down.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use helm_core::terminable::{FnTerminable, Terminable, TerminableRegistry};
//!
//! let registry = TerminableRegistry::new();
//! let cleanup = registry
//!     .bind(Arc::new(FnTerminable::new(|| Ok(()))))
//!     .unwrap();
//!
//! assert!(registry.terminate());
//! assert!(cleanup.has_terminated());
//! ```

pub mod composite;
pub mod registry;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

pub use composite::{CompositeModule, CompositeTerminable, WeakCompositeTerminable};
pub use registry::TerminableRegistry;

/// A resource that can be released.
///
/// Implementations must make a second `terminate` call a no-op.
pub trait Terminable: Send + Sync {
    /// Release the resource.
    fn terminate(&self) -> Result<()>;

    /// Whether the resource has already been released.
    ///
    /// Registries use this to drop resources that released themselves.
    fn has_terminated(&self) -> bool {
        false
    }
}

/// A unit of setup that binds its resources into a registry.
pub trait TerminableModule: Send + Sync {
    /// Bind whatever this module owns into `consumer`.
    fn setup(&self, consumer: &TerminableRegistry) -> Result<()>;
}

/// A terminable that runs a closure the first time it is terminated.
pub struct FnTerminable {
    action: Mutex<Option<Box<dyn FnOnce() -> Result<()> + Send>>>,
}

impl FnTerminable {
    /// Wrap `action`.
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }
}

impl Terminable for FnTerminable {
    fn terminate(&self) -> Result<()> {
        // take() before running so a panicking action is not retried
        let action = self.action.lock().take();
        match action {
            Some(action) => action(),
            None => Ok(()),
        }
    }

    fn has_terminated(&self) -> bool {
        self.action.lock().is_none()
    }
}

/// A terminable with nothing to release.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyTerminable;

impl Terminable for EmptyTerminable {
    fn terminate(&self) -> Result<()> {
        Ok(())
    }

    fn has_terminated(&self) -> bool {
        true
    }
}

/// A shared terminable that releases nothing.
pub fn empty() -> Arc<dyn Terminable> {
    Arc::new(EmptyTerminable)
}

/// Combine several terminables into one.
///
/// No input yields [`empty`], a single input is returned as-is, otherwise the
/// inputs are bound into a fresh registry in the given order.
pub fn combine(terminables: Vec<Arc<dyn Terminable>>) -> Arc<dyn Terminable> {
    let mut terminables = terminables;
    match terminables.len() {
        0 => empty(),
        1 => terminables.remove(0),
        _ => {
            let registry = TerminableRegistry::new();
            for terminable in terminables {
                // a fresh registry cannot have been terminated yet
                let _ = registry.bind_dyn(terminable);
            }
            Arc::new(registry)
        }
    }
}
