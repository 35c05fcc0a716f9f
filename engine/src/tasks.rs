//! Recurring background tasks with an explicit stop signal.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A periodic background job bound to its owner's lifetime.
///
/// The job runs every `period` until [`PeriodicTask::stop`] is called or the
/// task is dropped. Stopping interrupts a pending wait instead of sleeping it
/// out.
pub(crate) struct PeriodicTask {
    signal: Arc<StopSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct StopSignal {
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

impl PeriodicTask {
    pub(crate) fn spawn<F>(name: &str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    {
                        let mut stopped = thread_signal.stopped.lock();
                        if *stopped {
                            return;
                        }
                        let _ = thread_signal.wakeup.wait_for(&mut stopped, period);
                        if *stopped {
                            return;
                        }
                    }
                    job();
                }
            })
            .expect("failed to spawn background thread");
        Self {
            signal,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signal the task to stop and wait for its thread to exit.
    pub(crate) fn stop(&self) {
        *self.signal.stopped.lock() = true;
        self.signal.wakeup.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
