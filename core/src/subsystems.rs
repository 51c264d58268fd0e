use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// Number of subsystems still holding resources.
///
/// Shared by every subsystem of a node. Process exit waits for it to drain to zero.
#[derive(Debug, Default)]
pub struct ActiveSubsystems {
    count: AtomicUsize,
}

impl ActiveSubsystems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one more active subsystem and returns the new count
    pub fn enter(&self) -> usize {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Unregisters one active subsystem and returns the new count. Never goes below zero.
    pub fn exit(&self) -> usize {
        match self.count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1)) {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_quiescent(&self) -> bool {
        self.count() == 0
    }

    /// Enters and returns a guard which exits on drop
    pub fn guard(self: &Arc<Self>) -> SubsystemGuard {
        self.enter();
        SubsystemGuard { subsystems: self.clone() }
    }
}

/// Keeps one subsystem counted as active for as long as it lives
#[derive(Debug)]
pub struct SubsystemGuard {
    subsystems: Arc<ActiveSubsystems>,
}

impl Drop for SubsystemGuard {
    fn drop(&mut self) {
        self.subsystems.exit();
    }
}
