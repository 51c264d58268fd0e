use crate::{
    config::{ConfigError, EffectiveConfig},
    p2p::{DynP2p, P2pConfig, P2pError, P2pNode, P2pRelayer},
    rpc::{DynRpc, DynRpcHandle, RpcConfig, RpcError, RpcServer},
    scheduler::{MinerCountRefresher, Scheduler},
};
use helm_chain::{
    ChainError, ChainFactory, DynChain,
    memory::MemoryChainFactory,
    repair::{RepairError, RepairReport, repair_topo_index},
};
use helm_core::{
    core::Core,
    debug, error, info,
    lifecycle::{Lifecycle, LifecycleError, SubsystemState},
    log::{LogResult, init_logger, verbosity_to_level},
    panic::FATAL_EXIT_CODE,
    service::Service,
    subsystems::ActiveSubsystems,
    task::{runtime::AsyncRuntime, tick::TickService},
    trace, warn,
};
use log::LevelFilter;
use parking_lot::Mutex;
use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use triggered::{Listener, Trigger, trigger};

const DAEMON: &str = "helmd-daemon";

/// Interval between two reads of the active subsystem counter while shutting down
pub const QUIESCENCE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Period of the node status log line
pub const STATUS_PERIOD: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("chain engine failed to start: {0}")]
    EngineStart(#[source] ChainError),

    #[error("topological index repair failed, refusing to serve: {0}")]
    RepairFatal(#[from] RepairError),

    #[error("history pruning failed: {0}")]
    Prune(#[source] ChainError),

    #[error("p2p failed to start: {0}")]
    P2pStart(#[from] P2pError),

    #[error("rpc failed to start: {0}")]
    RpcStart(#[from] RpcError),

    #[error("async runtime error: {0}")]
    Runtime(#[from] io::Error),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl DaemonError {
    /// Startup errors terminate the process with a failure status
    pub fn is_process_fatal(&self) -> bool {
        match self {
            DaemonError::Config(_)
            | DaemonError::EngineStart(_)
            | DaemonError::RepairFatal(_)
            | DaemonError::Prune(_)
            | DaemonError::P2pStart(_)
            | DaemonError::RpcStart(_)
            | DaemonError::Runtime(_)
            | DaemonError::Lifecycle(_) => true,
        }
    }
}

pub type DaemonResult<T> = std::result::Result<T, DaemonError>;

/// Everything the subsystems of one node share. Built once, passed explicitly.
#[derive(Clone)]
pub struct NodeContext {
    pub config: Arc<EffectiveConfig>,
    pub subsystems: Arc<ActiveSubsystems>,
    pub runtime: Arc<AsyncRuntime>,
    pub tick_service: Arc<TickService>,
}

impl NodeContext {
    pub fn new(config: EffectiveConfig) -> DaemonResult<Self> {
        let runtime = Arc::new(AsyncRuntime::new(config.async_threads)?);
        Ok(Self {
            config: Arc::new(config),
            subsystems: Arc::new(ActiveSubsystems::new()),
            runtime,
            tick_service: Arc::new(TickService::new()),
        })
    }
}

/// Node orchestrator.
///
/// Brings the node up in a fixed order (prune, chain engine, index repair, p2p, rpc,
/// async services) and tears it down in reverse, then waits until every subsystem
/// reports it has released its resources.
pub struct Daemon {
    context: NodeContext,
    factory: Arc<dyn ChainFactory>,
    p2p: DynP2p,
    rpc: DynRpc,

    chain_lifecycle: Lifecycle,
    p2p_lifecycle: Lifecycle,
    rpc_lifecycle: Lifecycle,
    scheduler_lifecycle: Lifecycle,

    chain: Mutex<Option<DynChain>>,
    rpc_handle: Mutex<Option<DynRpcHandle>>,
    error: Mutex<Option<DaemonError>>,
    shutdown: (Trigger, Listener),
    quiescence_poll: Duration,
}

impl Daemon {
    pub fn new(context: NodeContext, factory: Arc<dyn ChainFactory>, p2p: DynP2p, rpc: DynRpc) -> Self {
        Self {
            context,
            factory,
            p2p,
            rpc,
            chain_lifecycle: Lifecycle::new("chain"),
            p2p_lifecycle: Lifecycle::new("p2p"),
            rpc_lifecycle: Lifecycle::new("rpc"),
            scheduler_lifecycle: Lifecycle::new("scheduler"),
            chain: Mutex::new(None),
            rpc_handle: Mutex::new(None),
            error: Mutex::new(None),
            shutdown: trigger(),
            quiescence_poll: QUIESCENCE_POLL_INTERVAL,
        }
    }

    pub fn with_quiescence_poll(mut self, quiescence_poll: Duration) -> Self {
        self.quiescence_poll = quiescence_poll;
        self
    }

    pub fn context(&self) -> &NodeContext {
        &self.context
    }

    pub fn chain(&self) -> Option<DynChain> {
        self.chain.lock().clone()
    }

    pub fn state(&self, ident: &str) -> Option<SubsystemState> {
        [&self.chain_lifecycle, &self.p2p_lifecycle, &self.rpc_lifecycle, &self.scheduler_lifecycle]
            .into_iter()
            .find(|lifecycle| lifecycle.ident() == ident)
            .map(Lifecycle::state)
    }

    /// Runs the one-time history prune when `--prune-history` is set
    pub fn prune_if_requested(&self) -> DaemonResult<()> {
        let Some(topoheight) = self.context.config.prune_history else {
            return Ok(());
        };
        info!("Pruning block history below topoheight {}", topoheight);
        self.factory.prune(&self.context.config.chain_params(), topoheight).map_err(DaemonError::Prune)?;
        info!("History pruned, continuing startup");
        Ok(())
    }

    /// Starts the chain engine and wires its relay hook to the p2p subsystem.
    ///
    /// On failure nothing else is touched and the engine error is returned as is.
    pub fn start_engine(&self) -> DaemonResult<DynChain> {
        self.chain_lifecycle.advance(SubsystemState::Starting)?;
        let chain = self
            .factory
            .start(&self.context.config.chain_params(), self.context.subsystems.clone())
            .map_err(DaemonError::EngineStart)?;
        chain.register_relayer(Arc::new(P2pRelayer::new(self.p2p.clone())));
        self.chain.lock().replace(chain.clone());
        self.chain_lifecycle.advance(SubsystemState::Running)?;
        Ok(chain)
    }

    /// Heals the topological index. Any error is fatal to the process.
    pub fn repair(&self, chain: &DynChain) -> DaemonResult<RepairReport> {
        let window = self.context.config.repair_window;
        debug!("Checking topological index from {} down to {}", window.anchor, window.floor);
        Ok(repair_topo_index(chain.as_ref(), window)?)
    }

    /// Starts p2p, then rpc, then the async services. P2p must be live first since
    /// blocks submitted over rpc are broadcast right away.
    pub fn start_serving(&self, chain: &DynChain) -> DaemonResult<()> {
        self.p2p_lifecycle.advance(SubsystemState::Starting)?;
        self.p2p.start(chain.clone())?;
        self.p2p_lifecycle.advance(SubsystemState::Running)?;

        self.rpc_lifecycle.advance(SubsystemState::Starting)?;
        let handle = self.rpc.start(chain.clone())?;
        self.rpc_handle.lock().replace(handle);
        self.rpc_lifecycle.advance(SubsystemState::Running)?;

        self.scheduler_lifecycle.advance(SubsystemState::Starting)?;
        let runtime = &self.context.runtime;
        let tick_service = self.context.tick_service.clone();
        runtime.start_service(tick_service.clone());
        if let Some(getwork) = self.rpc.getwork() {
            runtime.start_service(getwork);
        }
        runtime.start_service(Arc::new(MinerCountRefresher::new(self.rpc.clone(), tick_service.clone())));

        let scheduler = Arc::new(Scheduler::new(tick_service));
        let (status_chain, p2p, rpc) = (chain.clone(), self.p2p.clone(), self.rpc.clone());
        scheduler.register(
            "status",
            STATUS_PERIOD,
            Box::new(move || match status_chain.topo_height() {
                Ok(topoheight) => {
                    info!("Topoheight {}, {} peers, {} miners", topoheight, p2p.peer_count(), rpc.miner_count())
                }
                Err(err) => warn!("Cannot read topoheight: {}", err),
            }),
        );
        runtime.start_service(scheduler);
        self.scheduler_lifecycle.advance(SubsystemState::Running)?;
        info!("Node is serving");
        Ok(())
    }

    /// Full bring-up sequence
    pub fn bring_up(&self) -> DaemonResult<()> {
        self.prune_if_requested()?;
        let chain = self.start_engine()?;
        let report = self.repair(&chain)?;
        if !report.is_clean() {
            warn!("Topological index repaired: {} entries rewritten", report.corrections.len());
        }
        self.start_serving(&chain)
    }

    /// Issues the stop calls in reverse start order: async services, rpc, p2p, chain
    /// engine. Each stop is best effort and only issued to a running subsystem.
    pub fn stop_subsystems(&self) {
        if self.begin_stop(&self.scheduler_lifecycle) {
            self.context.runtime.stop_services();
            self.end_stop(&self.scheduler_lifecycle);
        }

        if self.begin_stop(&self.rpc_lifecycle) {
            if let Some(handle) = self.rpc_handle.lock().take() {
                if let Err(err) = handle.stop() {
                    warn!("Error while stopping rpc: {}", err);
                }
            }
            self.end_stop(&self.rpc_lifecycle);
        }

        if self.begin_stop(&self.p2p_lifecycle) {
            if let Err(err) = self.p2p.shutdown() {
                warn!("Error while stopping p2p: {}", err);
            }
            self.end_stop(&self.p2p_lifecycle);
        }

        if self.begin_stop(&self.chain_lifecycle) {
            let chain = self.chain.lock().take();
            if let Some(chain) = chain {
                if let Err(err) = chain.shutdown() {
                    warn!("Error while stopping the chain engine: {}", err);
                }
            }
            self.end_stop(&self.chain_lifecycle);
        }
    }

    fn begin_stop(&self, lifecycle: &Lifecycle) -> bool {
        if !lifecycle.is(SubsystemState::Running) {
            trace!("[{}] {} is {}, nothing to stop", DAEMON, lifecycle.ident(), lifecycle.state());
            return false;
        }
        debug!("Stopping {}", lifecycle.ident());
        self.advance_logged(lifecycle, SubsystemState::Stopping)
    }

    fn end_stop(&self, lifecycle: &Lifecycle) {
        self.advance_logged(lifecycle, SubsystemState::Stopped);
    }

    fn advance_logged(&self, lifecycle: &Lifecycle, to: SubsystemState) -> bool {
        match lifecycle.advance(to) {
            Ok(()) => true,
            Err(err) => {
                warn!("{}", err);
                false
            }
        }
    }

    /// Blocks until no subsystem is active. There is no timeout. Returns the number of polls.
    pub fn wait_for_quiescence(&self) -> u64 {
        let subsystems = &self.context.subsystems;
        let mut polls = 0;
        loop {
            let active = subsystems.count();
            if active == 0 {
                break;
            }
            info!("Waiting for {} active subsystem(s) to exit", active);
            polls += 1;
            thread::sleep(self.quiescence_poll);
        }
        info!("All subsystems exited");
        polls
    }

    /// Takes the error which terminated the daemon, if any
    pub fn take_error(&self) -> Option<DaemonError> {
        self.error.lock().take()
    }

    pub fn exit_code(&self) -> i32 {
        match self.error.lock().as_ref() {
            Some(err) if err.is_process_fatal() => FATAL_EXIT_CODE,
            _ => 0,
        }
    }

    fn worker(self: &Arc<Self>, core: Arc<Core>) {
        match self.bring_up() {
            Ok(()) => {
                self.shutdown.1.wait();
                info!("Shutting down the node");
            }
            Err(err @ DaemonError::RepairFatal(_)) => {
                // No stop call and no quiescence wait: the index may be divergent
                error!("{}", err);
                self.error.lock().replace(err);
                core.shutdown();
                return;
            }
            Err(err) => {
                error!("{}", err);
                self.error.lock().replace(err);
                core.shutdown();
            }
        }
        self.stop_subsystems();
        self.wait_for_quiescence();
        trace!("[{}] worker exiting", DAEMON);
    }
}

impl Service for Daemon {
    fn ident(self: Arc<Self>) -> &'static str {
        DAEMON
    }

    fn start(self: Arc<Self>, core: Arc<Core>) -> Vec<JoinHandle<()>> {
        let daemon = self.clone();
        match thread::Builder::new().name(DAEMON.to_string()).spawn(move || daemon.worker(core)) {
            Ok(worker) => vec![worker],
            Err(err) => {
                error!("[{}] failed spawning the worker thread: {}", DAEMON, err);
                self.error.lock().replace(DaemonError::Runtime(err));
                vec![]
            }
        }
    }

    fn stop(self: Arc<Self>) {
        trace!("sending an exit signal to {}", DAEMON);
        self.shutdown.0.trigger();
    }
}

/// Creates the node [`Core`] and the daemon bound to it
pub fn create_daemon(config: EffectiveConfig) -> DaemonResult<(Arc<Core>, Arc<Daemon>)> {
    let context = NodeContext::new(config)?;
    let handle = context.runtime.handle();
    let p2p: DynP2p = Arc::new(P2pNode::new(P2pConfig::from(context.config.as_ref()), handle.clone(), context.subsystems.clone()));
    let rpc: DynRpc = Arc::new(RpcServer::new(
        RpcConfig::from(context.config.as_ref()),
        handle,
        context.subsystems.clone(),
        p2p.clone(),
        context.tick_service.clone(),
    ));
    let daemon = Arc::new(Daemon::new(context, Arc::new(MemoryChainFactory), p2p, rpc));

    let core = Arc::new(Core::new());
    core.bind(daemon.clone());
    Ok((core, daemon))
}

/// Installs the process logger as configured
pub fn init_logging(config: &EffectiveConfig) -> LogResult<()> {
    let mut console_level = verbosity_to_level(config.clog_level);
    if config.debug {
        console_level = console_level.max(LevelFilter::Debug);
    }
    let log_dir = config.log_dir.as_ref().map(|dir| dir.to_string_lossy().into_owned());
    init_logger(log_dir.as_deref(), &format!("helmd-{}", config.network), console_level, verbosity_to_level(config.flog_level))
}

pub fn log_banner(config: &EffectiveConfig) {
    info!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("OS: {}, arch: {}, async threads: {}", std::env::consts::OS, std::env::consts::ARCH, config.async_threads);
    info!("Network: {}", config.network);
    info!("Data directory: {}", config.data_dir().display());
    match config.log_dir.as_ref() {
        Some(dir) => info!("Logs directory: {}", dir.display()),
        None => info!("Logs to console only"),
    }
    debug!("Effective configuration: {:?}", config);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigOverrides, resolve_from};

    fn config(args: &[&str]) -> EffectiveConfig {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_string_lossy().into_owned();
        let mut argv = vec!["helmd".to_string(), format!("--data-dir={}", data_dir), "--nologfiles".to_string()];
        argv.extend(args.iter().map(|arg| arg.to_string()));
        resolve_from(&ConfigOverrides::new(), argv).unwrap()
    }

    #[test]
    fn test_errors_are_fatal() {
        let err = DaemonError::Prune(ChainError::PruneBeyondTip { requested: 10, tip: 2 });
        assert!(err.is_process_fatal());
        assert!(err.to_string().contains("pruning"));
    }

    #[test]
    fn test_create_daemon_binds_one_service() {
        let (core, daemon) = create_daemon(config(&["--async-threads=1"])).unwrap();
        assert!(core.is_running());
        assert_eq!(daemon.state("chain"), Some(SubsystemState::NotStarted));
        assert_eq!(daemon.state("mempool"), None);
        assert_eq!(daemon.exit_code(), 0);
        assert!(daemon.context().subsystems.is_quiescent());
    }
}
