use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Raises a shared flag when dropped. Blocking work on another thread polls
/// the flag to notice that the future awaiting it is gone (timeout or run
/// cancellation).
pub(crate) struct StopOnDrop(Arc<AtomicBool>);

impl StopOnDrop {
    pub(crate) fn new() -> (Self, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (Self(Arc::clone(&flag)), flag)
    }
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}
