use std::{any::Any, sync::Arc};

use parking_lot::{Condvar, Mutex};

/// Render a caught panic payload as text.
// to make errors Sync, construct a String instead of keeping Box<dyn Any + Send>
pub fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        format!("{panic:?}")
    }
}

/// Counts outstanding work handed to other threads.
#[derive(Clone, Default)]
pub(crate) struct Latch {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

/// One unit of work counted by a [`Latch`], released on drop.
pub(crate) struct LatchToken(Latch);

impl Latch {
    pub(crate) fn token(&self) -> LatchToken {
        *self.inner.0.lock() += 1;
        LatchToken(self.clone())
    }

    /// Block until every token has been dropped.
    pub(crate) fn wait(&self) {
        let (count, released) = &*self.inner;
        let mut count = count.lock();
        while *count > 0 {
            released.wait(&mut count);
        }
    }
}

impl Drop for LatchToken {
    fn drop(&mut self) {
        let (count, released) = &*self.0.inner;
        let mut count = count.lock();
        *count -= 1;
        if *count == 0 {
            released.notify_all();
        }
    }
}
