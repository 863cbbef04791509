//! Cooperative shutdown
//!
//! A [`ShutdownSignal`] is shared by every worker. Triggering it wakes any
//! thread blocked in [`ShutdownSignal::wait_timeout`], which is how a poll in
//! progress gets interrupted.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::info;

#[derive(Default)]
struct Inner {
    triggered: AtomicBool,
    lock: Mutex<()>,
    cvar: Condvar,
}

/// Cloneable stop flag with wakeup
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<Inner>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake all waiters. Idempotent.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock();
        self.inner.cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`; returns true if shutdown was requested
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.inner.lock.lock();
        if self.is_triggered() {
            return true;
        }
        self.inner.cvar.wait_for(&mut guard, timeout);
        self.is_triggered()
    }
}

static SIGNALLED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_terminate(_: libc::c_int) {
    // Only async-signal-safe work here
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Register SIGINT/SIGTERM handlers
#[cfg(unix)]
pub fn register_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGINT,
            on_terminate as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            on_terminate as *const () as libc::sighandler_t,
        );
    }
}

#[cfg(not(unix))]
pub fn register_signal_handlers() {}

/// Forward process signals to `signal` from a watcher thread
///
/// The thread exits once the signal fires, whatever triggered it.
pub fn watch_process_signals(signal: ShutdownSignal) -> std::io::Result<JoinHandle<()>> {
    register_signal_handlers();
    thread::Builder::new()
        .name("affinity-signals".to_string())
        .spawn(move || loop {
            if SIGNALLED.load(Ordering::SeqCst) {
                info!("Termination signal received, shutting down");
                signal.trigger();
                return;
            }
            if signal.wait_timeout(Duration::from_millis(100)) {
                return;
            }
        })
}
