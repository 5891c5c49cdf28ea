//! Composite terminables.
//!
//! A composite owns a private set of terminables and releases them together.
//! [`CompositeTerminable`] holds strong references through its own
//! [`TerminableRegistry`]; [`WeakCompositeTerminable`] only holds weak ones and
//! skips whatever has already been dropped.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;

use super::{Terminable, TerminableRegistry};
use crate::error::{Error, LifecycleError, Result};
use crate::types::PanicError;

/// A terminable that owns a private registry.
///
/// Binding a module into a parent with
/// [`TerminableRegistry::bind_composite`] first calls [`setup`](Self::setup)
/// with the parent, then tracks the module so the parent's teardown reaches
/// the module's own registry.
pub trait CompositeModule: Terminable {
    /// Hook run when the module is bound into `parent`.
    fn setup(&self, _parent: &TerminableRegistry) -> Result<()> {
        Ok(())
    }
}

/// A group of terminables released together, in reverse bind order.
#[derive(Default)]
pub struct CompositeTerminable {
    registry: TerminableRegistry,
}

impl CompositeTerminable {
    /// Create an empty composite.
    pub fn new() -> Self {
        Self {
            registry: TerminableRegistry::new(),
        }
    }

    /// Bind `terminable` and hand it back.
    pub fn bind<T>(&self, terminable: Arc<T>) -> Result<Arc<T>>
    where
        T: Terminable + 'static,
    {
        self.registry.bind(terminable)
    }

    /// Bind `terminable`, returning `self` for chaining.
    pub fn with(&self, terminable: Arc<dyn Terminable>) -> Result<&Self> {
        self.registry.bind_dyn(terminable)?;
        Ok(self)
    }

    /// Bind every terminable in `terminables`, in order.
    pub fn with_all<I>(&self, terminables: I) -> Result<&Self>
    where
        I: IntoIterator<Item = Arc<dyn Terminable>>,
    {
        for terminable in terminables {
            self.registry.bind_dyn(terminable)?;
        }
        Ok(self)
    }

    /// Drop members that have already released themselves.
    pub fn cleanup(&self) -> usize {
        self.registry.cleanup()
    }

    /// The private registry owned by this composite.
    pub fn registry(&self) -> &TerminableRegistry {
        &self.registry
    }
}

impl Terminable for CompositeTerminable {
    fn terminate(&self) -> Result<()> {
        self.registry.terminate();
        Ok(())
    }

    fn has_terminated(&self) -> bool {
        Terminable::has_terminated(&self.registry)
    }
}

impl CompositeModule for CompositeTerminable {}

/// A composite that holds its members weakly.
///
/// Members are closed most-recently-bound first. Unlike the registry, every
/// failure is collected and returned as
/// [`LifecycleError::CompositeClosing`] once all members were attempted.
#[derive(Default)]
pub struct WeakCompositeTerminable {
    members: Mutex<VecDeque<Weak<dyn Terminable>>>,
    closed: AtomicBool,
}

impl WeakCompositeTerminable {
    /// Create an empty weak composite.
    pub fn new() -> Self {
        Self {
            members: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Track `terminable` without keeping it alive.
    pub fn with(&self, terminable: &Arc<dyn Terminable>) -> &Self {
        self.members.lock().push_front(Arc::downgrade(terminable));
        self
    }

    /// Close every live member, collecting failures.
    pub fn close(&self) -> Result<()> {
        let mut caught: Vec<Error> = Vec::new();

        loop {
            // pop under the lock, close outside it
            let next = self.members.lock().pop_front();
            let Some(weak) = next else { break };
            let Some(member) = weak.upgrade() else {
                continue;
            };

            match panic::catch_unwind(AssertUnwindSafe(|| member.terminate())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => caught.push(e),
                Err(payload) => caught.push(Error::custom(PanicError::from_payload(payload))),
            }
        }

        self.closed.store(true, Ordering::SeqCst);

        if caught.is_empty() {
            Ok(())
        } else {
            debug!("{} members failed to close", caught.len());
            Err(LifecycleError::CompositeClosing(caught).into())
        }
    }

    /// Close, returning the aggregated failure instead of propagating it.
    pub fn close_silently(&self) -> Option<Error> {
        self.close().err()
    }

    /// Forget members that were dropped or already released.
    pub fn cleanup(&self) -> usize {
        let mut members = self.members.lock();
        let before = members.len();
        members.retain(|weak| match weak.upgrade() {
            Some(member) => !member.has_terminated(),
            None => false,
        });
        before - members.len()
    }

    /// Number of tracked members, including dropped ones not yet cleaned.
    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Terminable for WeakCompositeTerminable {
    fn terminate(&self) -> Result<()> {
        self.close()
    }

    fn has_terminated(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminable::FnTerminable;

    fn recording(
        label: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn Terminable> {
        let log = log.clone();
        Arc::new(FnTerminable::new(move || {
            log.lock().push(label);
            Ok(())
        }))
    }

    #[test]
    fn test_composite_delegates_to_registry() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = CompositeTerminable::new();
        composite
            .with(recording("first", &log))
            .unwrap()
            .with(recording("second", &log))
            .unwrap();

        composite.terminate().unwrap();
        assert!(composite.has_terminated());
        assert_eq!(*log.lock(), vec!["second", "first"]);

        // members cannot be added once closed
        assert!(composite.with(recording("late", &log)).is_err());
    }

    #[test]
    fn test_composite_bound_into_parent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let parent = TerminableRegistry::new();

        parent.bind_dyn(recording("parent-first", &log)).unwrap();
        let child = parent
            .bind_composite(Arc::new(CompositeTerminable::new()))
            .unwrap();
        child
            .with_all(vec![recording("child-a", &log), recording("child-b", &log)])
            .unwrap();
        parent.bind_dyn(recording("parent-last", &log)).unwrap();

        parent.terminate();
        assert_eq!(
            *log.lock(),
            vec!["parent-last", "child-b", "child-a", "parent-first"]
        );
        assert!(child.has_terminated());
    }

    #[test]
    fn test_weak_composite_skips_dropped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let composite = WeakCompositeTerminable::new();

        let kept = recording("kept", &log);
        let dropped = recording("dropped", &log);
        composite.with(&kept).with(&dropped);
        drop(dropped);

        composite.close().unwrap();
        assert_eq!(*log.lock(), vec!["kept"]);
        assert!(composite.has_terminated());
        assert!(composite.is_empty());
    }

    #[test]
    fn test_weak_composite_aggregates_failures() {
        let composite = WeakCompositeTerminable::new();
        let failing: Arc<dyn Terminable> =
            Arc::new(FnTerminable::new(|| Err(Error::runtime("nope"))));
        let panicking: Arc<dyn Terminable> =
            Arc::new(FnTerminable::new(|| panic!("closing went wrong")));
        let fine: Arc<dyn Terminable> = Arc::new(FnTerminable::new(|| Ok(())));

        composite.with(&fine).with(&failing).with(&panicking);

        match composite.close_silently() {
            Some(Error::Lifecycle(LifecycleError::CompositeClosing(errors))) => {
                assert_eq!(errors.len(), 2);
            }
            other => panic!("expected aggregated failure, got {:?}", other),
        }
        assert!(fine.has_terminated());
    }

    #[test]
    fn test_weak_composite_cleanup() {
        let composite = WeakCompositeTerminable::new();
        let live: Arc<dyn Terminable> = Arc::new(FnTerminable::new(|| Ok(())));
        let released: Arc<dyn Terminable> = Arc::new(FnTerminable::new(|| Ok(())));
        let gone: Arc<dyn Terminable> = Arc::new(FnTerminable::new(|| Ok(())));

        composite.with(&live).with(&released).with(&gone);
        released.terminate().unwrap();
        drop(gone);

        assert_eq!(composite.cleanup(), 2);
        assert_eq!(composite.len(), 1);
    }
}
