use crate::service::Service;
use crate::{trace, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Owner of the process-level services.
///
/// Services are started in bind order and stopped in reverse bind order.
/// Shutdown happens at most once per `Core`.
pub struct Core {
    pub keep_running: AtomicBool,
    services: Mutex<Vec<Arc<dyn Service>>>,
}

impl Core {
    pub fn new() -> Core {
        Core { keep_running: AtomicBool::new(true), services: Mutex::new(Vec::new()) }
    }

    /// Signals every bound service to stop.
    ///
    /// Returns `false` if a shutdown was already requested, in which case
    /// nothing is signaled again.
    pub fn shutdown(self: &Arc<Core>) -> bool {
        if self.keep_running.compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            trace!("core shutdown already in progress");
            return false;
        }

        trace!("signaling core shutdown...");
        let services = self.services.lock().clone();
        for service in services.into_iter().rev() {
            let ident = service.clone().ident();
            trace!("shutting down: {}", ident);
            service.stop();
        }

        trace!("core is shutting down...");
        true
    }

    pub fn bind<T>(&self, service: Arc<T>)
    where
        T: Service + 'static,
    {
        self.services.lock().push(service);
    }

    pub fn is_running(&self) -> bool {
        self.keep_running.load(Ordering::SeqCst)
    }

    /// Starts every bound service and blocks until all their workers exit.
    pub fn run(self: &Arc<Core>) {
        let services = self.services.lock().clone();
        let mut workers = Vec::new();
        for service in services {
            workers.append(&mut service.start(self.clone()));
        }
        trace!("core is starting {} workers", workers.len());

        for worker in workers {
            let name = worker.thread().name().unwrap_or("<unnamed>").to_string();
            if let Err(err) = worker.join() {
                warn!("thread {} join failure: {:?}", name, err);
            }
        }

        trace!("... core is shut down");
    }
}

impl Default for Core {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::{self, JoinHandle};

    struct RecordingService {
        ident: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Service for RecordingService {
        fn ident(self: Arc<Self>) -> &'static str {
            self.ident
        }

        fn start(self: Arc<Self>, _core: Arc<Core>) -> Vec<JoinHandle<()>> {
            self.log.lock().push(format!("start {}", self.ident));
            vec![thread::spawn(|| {})]
        }

        fn stop(self: Arc<Self>) {
            self.log.lock().push(format!("stop {}", self.ident));
        }
    }

    #[test]
    fn test_services_stop_in_reverse_bind_order_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let core = Arc::new(Core::new());
        core.bind(Arc::new(RecordingService { ident: "first", log: log.clone() }));
        core.bind(Arc::new(RecordingService { ident: "second", log: log.clone() }));

        core.run();
        assert!(core.shutdown());
        assert!(!core.shutdown());
        assert!(!core.is_running());

        assert_eq!(*log.lock(), vec!["start first", "start second", "stop second", "stop first"]);
    }
}
