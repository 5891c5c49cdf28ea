//! Terminable registry.
//!
//! Collects terminables in bind order and releases them last-bound first,
//! so dependents go before the things they depend on. Teardown is
//! total-effort: a resource that fails or panics is logged and skipped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, error, trace};
use parking_lot::Mutex;

use super::{CompositeModule, FnTerminable, Terminable, TerminableModule};
use crate::error::{LifecycleError, Result};
use crate::types::PanicError;

/// Shared state of a registry
struct RegistryState {
    /// Bound terminables, in bind order
    terminables: Vec<Arc<dyn Terminable>>,

    /// Set once the first termination pass starts
    terminated: bool,
}

/// An ordered, thread-safe collection of terminables.
pub struct TerminableRegistry {
    state: Mutex<RegistryState>,
}

impl TerminableRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                terminables: Vec::new(),
                terminated: false,
            }),
        }
    }

    /// Bind `terminable` and hand it back.
    ///
    /// Fails with [`LifecycleError::AlreadyTerminated`] once the registry has
    /// been torn down.
    pub fn bind<T>(&self, terminable: Arc<T>) -> Result<Arc<T>>
    where
        T: Terminable + 'static,
    {
        self.bind_dyn(terminable.clone())?;
        Ok(terminable)
    }

    /// Bind an already type-erased terminable.
    pub fn bind_dyn(&self, terminable: Arc<dyn Terminable>) -> Result<()> {
        let mut state = self.state.lock();
        if state.terminated {
            return Err(LifecycleError::AlreadyTerminated.into());
        }
        state.terminables.push(terminable);
        trace!("Bound terminable (now {})", state.terminables.len());
        Ok(())
    }

    /// Bind a closure to run when the registry is terminated.
    pub fn bind_fn<F>(&self, action: F) -> Result<Arc<FnTerminable>>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.bind(Arc::new(FnTerminable::new(action)))
    }

    /// Let `module` bind its own resources into this registry.
    ///
    /// The module itself is not tracked.
    pub fn bind_module<M>(&self, module: &M) -> Result<()>
    where
        M: TerminableModule + ?Sized,
    {
        if self.has_terminated() {
            return Err(LifecycleError::AlreadyTerminated.into());
        }
        module.setup(self)
    }

    /// Run `module`'s setup with this registry as its parent, then bind the
    /// module itself so its private registry is torn down with this one.
    pub fn bind_composite<M>(&self, module: Arc<M>) -> Result<Arc<M>>
    where
        M: CompositeModule + 'static,
    {
        if self.has_terminated() {
            return Err(LifecycleError::AlreadyTerminated.into());
        }
        module.setup(self)?;
        self.bind(module)
    }

    /// Terminate every bound resource in reverse bind order.
    ///
    /// Returns `false` if the registry was already terminated. Only the first
    /// caller performs the pass.
    pub fn terminate(&self) -> bool {
        let terminables = {
            let mut state = self.state.lock();
            if state.terminated {
                return false;
            }
            state.terminated = true;
            std::mem::take(&mut state.terminables)
        };

        debug!("Terminating {} resources", terminables.len());

        for (index, terminable) in terminables.iter().enumerate().rev() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| terminable.terminate()));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Failed to terminate resource #{}: {}", index, e);
                }
                Err(payload) => {
                    error!(
                        "Resource #{} panicked during termination: {}",
                        index,
                        PanicError::from_payload(payload)
                    );
                }
            }
        }

        true
    }

    /// Drop resources that have already released themselves.
    ///
    /// Returns how many were removed. Live resources are left untouched.
    pub fn cleanup(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.terminables.len();
        state.terminables.retain(|t| !t.has_terminated());
        let removed = before - state.terminables.len();
        if removed > 0 {
            trace!("Cleaned up {} terminated resources", removed);
        }
        removed
    }

    /// Number of resources currently bound.
    pub fn len(&self) -> usize {
        self.state.lock().terminables.len()
    }

    /// Whether no resources are bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TerminableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminable for TerminableRegistry {
    fn terminate(&self) -> Result<()> {
        TerminableRegistry::terminate(self);
        Ok(())
    }

    fn has_terminated(&self) -> bool {
        self.state.lock().terminated
    }
}
