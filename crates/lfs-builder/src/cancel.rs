use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

static SIGINT_SEEN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    SIGINT_SEEN.store(true, Ordering::SeqCst);
}

/// Shared interrupt flag, checked at every retry boundary and between
/// download chunks.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flags: Vec<Arc<AtomicBool>>,
    watch_sigint: bool,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flags: vec![Arc::new(AtomicBool::new(false))],
            watch_sigint: false,
        }
    }

    /// A token that also trips on SIGINT. The process-wide handler stays
    /// installed until the returned guard is dropped, after which SIGINT
    /// terminates the process again.
    pub fn with_sigint() -> (Self, SigintGuard) {
        SIGINT_SEEN.store(false, Ordering::SeqCst);
        #[cfg(unix)]
        unsafe {
            libc::signal(
                libc::SIGINT,
                on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t,
            );
        }
        let token = Self {
            watch_sigint: true,
            ..Self::new()
        };
        (token, SigintGuard { _priv: () })
    }

    /// A token cancelled by this one or by its own [`CancelToken::cancel`],
    /// without cancelling the parent.
    pub fn child(&self) -> Self {
        let mut flags = self.flags.clone();
        flags.push(Arc::new(AtomicBool::new(false)));
        Self {
            flags,
            watch_sigint: self.watch_sigint,
        }
    }

    pub fn cancel(&self) {
        if let Some(own) = self.flags.last() {
            own.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        (self.watch_sigint && SIGINT_SEEN.load(Ordering::SeqCst))
            || self.flags.iter().any(|f| f.load(Ordering::SeqCst))
    }
}

/// Restores the default SIGINT disposition on drop.
#[derive(Debug)]
pub struct SigintGuard {
    _priv: (),
}

impl Drop for SigintGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::signal(libc::SIGINT, libc::SIG_DFL);
        }
    }
}
