use crate::rpc::DynRpc;
use futures_util::future::join_all;
use helm_core::{
    debug,
    task::{
        service::{AsyncService, AsyncServiceFuture},
        tick::{TickReason, TickService},
    },
    trace,
};
use parking_lot::Mutex;
use std::{mem, sync::Arc, time::Duration};
use tokio::select;
use triggered::{Listener, Trigger, trigger};

const SCHEDULER: &str = "scheduler";
const MINER_COUNT_REFRESHER: &str = "miner-count-refresher";

/// Period of the miner count refresh
pub const MINER_REFRESH_PERIOD: Duration = Duration::from_secs(1);

pub type JobFn = Box<dyn Fn() + Send + Sync>;

struct ScheduledJob {
    name: &'static str,
    period: Duration,
    job: JobFn,
}

/// Runs named maintenance jobs at fixed periods until signaled to exit.
///
/// Jobs must be registered before the service is started. A job runs for the first
/// time one period after start.
pub struct Scheduler {
    tick_service: Arc<TickService>,
    jobs: Mutex<Vec<ScheduledJob>>,
    shutdown: (Trigger, Listener),
}

impl Scheduler {
    pub fn new(tick_service: Arc<TickService>) -> Self {
        Self { tick_service, jobs: Mutex::new(Vec::new()), shutdown: trigger() }
    }

    pub fn register(&self, name: &'static str, period: Duration, job: JobFn) {
        debug!("[{}] registering job {} every {:?}", SCHEDULER, name, period);
        self.jobs.lock().push(ScheduledJob { name, period, job });
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    async fn run_job(self: Arc<Self>, scheduled: ScheduledJob) {
        let shutdown = self.shutdown.1.clone();
        loop {
            let reason = select! {
                biased;
                _ = shutdown.clone() => TickReason::Shutdown,
                reason = self.tick_service.tick(scheduled.period) => reason,
            };
            if reason == TickReason::Shutdown {
                break;
            }
            trace!("[{}] running {}", SCHEDULER, scheduled.name);
            (scheduled.job)();
        }
        trace!("[{}] job {} exited", SCHEDULER, scheduled.name);
    }
}

impl AsyncService for Scheduler {
    fn ident(self: Arc<Self>) -> &'static str {
        SCHEDULER
    }

    fn start(self: Arc<Self>) -> AsyncServiceFuture {
        Box::pin(async move {
            let jobs = mem::take(&mut *self.jobs.lock());
            join_all(jobs.into_iter().map(|job| self.clone().run_job(job))).await;
            Ok(())
        })
    }

    fn signal_exit(self: Arc<Self>) {
        trace!("sending an exit signal to {}", SCHEDULER);
        self.shutdown.0.trigger();
    }

    fn stop(self: Arc<Self>) -> AsyncServiceFuture {
        Box::pin(async move {
            trace!("{} stopped", SCHEDULER);
            Ok(())
        })
    }
}

/// Keeps the getwork miner count fresh. It is the only writer of that count.
pub struct MinerCountRefresher {
    rpc: DynRpc,
    tick_service: Arc<TickService>,
    period: Duration,
    shutdown: (Trigger, Listener),
}

impl MinerCountRefresher {
    pub fn new(rpc: DynRpc, tick_service: Arc<TickService>) -> Self {
        Self::with_period(rpc, tick_service, MINER_REFRESH_PERIOD)
    }

    pub fn with_period(rpc: DynRpc, tick_service: Arc<TickService>, period: Duration) -> Self {
        Self { rpc, tick_service, period, shutdown: trigger() }
    }
}

impl AsyncService for MinerCountRefresher {
    fn ident(self: Arc<Self>) -> &'static str {
        MINER_COUNT_REFRESHER
    }

    fn start(self: Arc<Self>) -> AsyncServiceFuture {
        Box::pin(async move {
            let shutdown = self.shutdown.1.clone();
            loop {
                select! {
                    biased;
                    _ = shutdown.clone() => break,
                    reason = self.tick_service.tick(self.period) => {
                        if reason == TickReason::Shutdown {
                            break;
                        }
                        self.rpc.refresh_miner_count();
                    }
                }
            }
            Ok(())
        })
    }

    fn signal_exit(self: Arc<Self>) {
        trace!("sending an exit signal to {}", MINER_COUNT_REFRESHER);
        self.shutdown.0.trigger();
    }

    fn stop(self: Arc<Self>) -> AsyncServiceFuture {
        Box::pin(async move {
            trace!("{} stopped", MINER_COUNT_REFRESHER);
            Ok(())
        })
    }
}
