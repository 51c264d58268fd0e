use std::{sync::Arc, time::Duration};
use tokio::select;
use triggered::{Listener, Trigger, trigger};

use super::service::{AsyncService, AsyncServiceFuture};

const TICK: &str = "tick";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickReason {
    Wakeup,
    Shutdown,
}

/// Shared sleeping primitive for periodic tasks, interrupted on shutdown
pub struct TickService {
    shutdown_trigger: Trigger,
    shutdown_listener: Listener,
}

impl TickService {
    pub fn new() -> Self {
        let (shutdown, monitor) = trigger();
        Self { shutdown_trigger: shutdown, shutdown_listener: monitor }
    }

    /// Waits until `duration` has elapsed when the service is started.
    ///
    /// Returns immediately when the service is stopped.
    pub async fn tick(&self, duration: Duration) -> TickReason {
        if self.shutdown_listener.is_triggered() {
            return TickReason::Shutdown;
        }
        let shutdown_listener = self.shutdown_listener.clone();
        select! {
            biased;
            _ = shutdown_listener => { TickReason::Shutdown }
            _ = tokio::time::sleep(duration) => { TickReason::Wakeup }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown_trigger.trigger();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_listener.is_triggered()
    }
}

impl Default for TickService {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncService for TickService {
    fn ident(self: Arc<Self>) -> &'static str {
        TICK
    }

    fn start(self: Arc<Self>) -> AsyncServiceFuture {
        Box::pin(async move { Ok(()) })
    }

    fn signal_exit(self: Arc<Self>) {
        self.shutdown();
    }

    fn stop(self: Arc<Self>) -> AsyncServiceFuture {
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_tick_wakes_then_shuts_down() {
        let tick = Arc::new(TickService::new());
        assert_eq!(tick.tick(Duration::from_millis(5)).await, TickReason::Wakeup);

        let waiter = tick.clone();
        let handle = tokio::spawn(async move { waiter.tick(Duration::from_secs(60)).await });
        tick.clone().signal_exit();
        let start = Instant::now();
        assert_eq!(handle.await.unwrap(), TickReason::Shutdown);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(tick.tick(Duration::from_secs(60)).await, TickReason::Shutdown);
    }
}
