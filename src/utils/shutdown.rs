use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// A cooperative shutdown flag.
///
/// The accept loops check the flag between two iterations. Since every
/// iteration is bounded by a timeout, a loop stops at most one timeout after
/// the flag has been raised.
#[derive(Clone, Debug, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. All the clones of this flag observe it.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
