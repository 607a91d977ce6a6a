//! Remote session boundary.
//!
//! The dispatcher only talks to [`Connector`] and [`Session`]; the SSH
//! implementation lives in `ssh`, tests plug in their own.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::inventory::Target;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("authentication failed for user '{user}': {detail}")]
    Auth { user: String, detail: String },

    #[error("session error: {0}")]
    Session(String),

    #[error("command exited with status {status}: {}", .output.trim_end())]
    NonZeroExit { status: i32, output: String },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout(_))
    }
}

/// Opens authenticated sessions. Shared by every worker thread.
pub trait Connector: Send + Sync {
    /// Connect and authenticate, giving up once `scope` expires.
    ///
    /// Implementations that block on sockets should register a hook with
    /// [`CancelScope::on_cancel`] that unblocks them.
    fn connect(
        &self,
        target: &Target,
        scope: &CancelScope,
    ) -> Result<Box<dyn Session>, SessionError>;
}

pub trait Session: Send {
    /// Run one command and return its combined stdout/stderr.
    fn run(&mut self, command: &str) -> Result<String, SessionError>;

    /// Copy a local file or directory tree to `remote_root`, creating remote
    /// directories as needed and carrying over permission bits.
    fn copy_tree(&mut self, local_root: &Path, remote_root: &str) -> Result<(), SessionError>;

    fn close(&mut self);
}

type CancelHook = Box<dyn FnOnce() + Send>;

struct CancelInner {
    cancelled: AtomicBool,
    hooks: Mutex<Vec<CancelHook>>,
}

/// Deadline-bounded cancellation scope owned by a single task.
///
/// Cancelling fires every registered hook exactly once. Hooks registered
/// after cancellation run immediately.
///
/// A timeout too large to land on the clock leaves the scope without a
/// deadline; it then only ends by [`CancelScope::cancel`].
#[derive(Clone)]
pub struct CancelScope {
    timeout: Duration,
    deadline: Option<Instant>,
    inner: Arc<CancelInner>,
}

impl CancelScope {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Instant::now().checked_add(timeout),
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `Duration::MAX` when there is none.
    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// True once the scope was cancelled or its deadline passed.
    pub fn is_expired(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// `Err(Timeout)` once the scope has expired.
    pub fn check(&self) -> Result<(), SessionError> {
        if self.is_expired() {
            Err(SessionError::Timeout(self.timeout))
        } else {
            Ok(())
        }
    }

    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.hooks();
        if self.is_cancelled() {
            drop(hooks);
            hook();
            return;
        }
        hooks.push(Box::new(hook));
    }

    pub fn cancel(&self) {
        let hooks = {
            let mut hooks = self.hooks();
            if self.inner.cancelled.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook();
        }
    }

    fn hooks(&self) -> MutexGuard<'_, Vec<CancelHook>> {
        match self.inner.hooks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelScope")
            .field("timeout", &self.timeout)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_fires_hooks_once() {
        let scope = CancelScope::new(Duration::from_secs(5));
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            scope.on_cancel(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        scope.cancel();
        scope.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(scope.is_cancelled());
        assert!(scope.check().unwrap_err().is_timeout());
    }

    #[test]
    fn hook_registered_after_cancel_runs_immediately() {
        let scope = CancelScope::new(Duration::from_secs(5));
        scope.cancel();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        scope.on_cancel(move || flag.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn scope_expires_at_deadline_without_cancel() {
        let scope = CancelScope::new(Duration::from_millis(10));
        assert!(scope.check().is_ok());
        std::thread::sleep(Duration::from_millis(30));
        assert!(scope.is_expired());
        assert!(!scope.is_cancelled());
        assert_eq!(scope.remaining(), Duration::ZERO);
    }

    #[test]
    fn huge_timeout_means_no_deadline() {
        let scope = CancelScope::new(Duration::from_secs_f64(1e19));
        assert_eq!(scope.deadline(), None);
        assert_eq!(scope.remaining(), Duration::MAX);
        assert!(scope.check().is_ok());

        scope.cancel();
        assert!(scope.is_expired());
    }
}
