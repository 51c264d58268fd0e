use crate::core::Core;
use crate::{info, warn};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// What an interrupt did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// First interrupt, core shutdown was requested
    Shutdown,
    /// Shutdown is already underway, the interrupt was ignored
    Ignored,
}

/// Binds SIGINT/SIGTERM to the shutdown of a [`Core`].
///
/// Only the first interrupt has an effect. Later ones are logged and ignored: forcing
/// the process down mid-shutdown could leave storage half-written.
pub struct Signals {
    core: Arc<Core>,
    iterations: AtomicU64,
}

impl Signals {
    pub fn new(core: &Arc<Core>) -> Signals {
        Signals { core: core.clone(), iterations: AtomicU64::new(0) }
    }

    pub fn init(self: &Arc<Signals>) -> Result<(), ctrlc::Error> {
        let signals = self.clone();
        ctrlc::set_handler(move || {
            signals.interrupt();
        })
    }

    pub fn interrupt(&self) -> InterruptOutcome {
        let seen = self.iterations.fetch_add(1, Ordering::SeqCst);
        if seen > 0 {
            warn!("^SIGNAL - shutdown already in progress, please wait (interrupt #{})", seen + 1);
            return InterruptOutcome::Ignored;
        }
        info!("^SIGNAL - shutting down...");
        self.core.shutdown();
        InterruptOutcome::Shutdown
    }

    pub fn interrupts(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }
}
