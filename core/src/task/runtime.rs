use super::service::{AsyncService, AsyncServiceResult};
use crate::{trace, warn};
use parking_lot::Mutex;
use std::{io, mem, sync::Arc};
use tokio::{
    runtime::{Builder, Handle, Runtime},
    task::JoinHandle,
};

const ASYNC_RUNTIME: &str = "async-runtime";

/// AsyncRuntime owns the tokio runtime of the node and the top-level async services running on it.
///
/// Services are started one by one with [`AsyncRuntime::start_service`] so callers control
/// the start order, and are all stopped together in reverse start order.
pub struct AsyncRuntime {
    runtime: Runtime,
    services: Mutex<Vec<Arc<dyn AsyncService>>>,
    workers: Mutex<Vec<(&'static str, JoinHandle<AsyncServiceResult<()>>)>>,
}

impl AsyncRuntime {
    pub fn new(threads: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread().worker_threads(threads.max(1)).thread_name(ASYNC_RUNTIME).enable_all().build()?;
        Ok(Self { runtime, services: Mutex::new(Vec::new()), workers: Mutex::new(Vec::new()) })
    }

    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    /// Spawns the `start` future of `service` and keeps the service for [`AsyncRuntime::stop_services`]
    pub fn start_service(&self, service: Arc<dyn AsyncService>) {
        let ident = service.clone().ident();
        trace!("[{}] starting {}", ASYNC_RUNTIME, ident);
        let worker = self.runtime.spawn(service.clone().start());
        self.services.lock().push(service);
        self.workers.lock().push((ident, worker));
    }

    pub fn service_count(&self) -> usize {
        self.services.lock().len()
    }

    /// Signals every started service to exit, waits for their `start` futures and then runs
    /// their `stop` futures, all in reverse start order.
    pub fn stop_services(&self) {
        let services = mem::take(&mut *self.services.lock());
        let workers = mem::take(&mut *self.workers.lock());
        for service in services.iter().rev() {
            service.clone().signal_exit();
        }

        self.runtime.block_on(async move {
            for (ident, worker) in workers.into_iter().rev() {
                match worker.await {
                    Ok(Ok(())) => trace!("[{}] {} exited", ASYNC_RUNTIME, ident),
                    Ok(Err(err)) => warn!("[{}] {} exited with error: {}", ASYNC_RUNTIME, ident, err),
                    Err(err) => warn!("[{}] {} task failure: {}", ASYNC_RUNTIME, ident, err),
                }
            }
            for service in services.into_iter().rev() {
                let ident = service.clone().ident();
                if let Err(err) = service.stop().await {
                    warn!("[{}] error while stopping {}: {}", ASYNC_RUNTIME, ident, err);
                }
                trace!("[{}] {} stopped", ASYNC_RUNTIME, ident);
            }
        });
    }
}
