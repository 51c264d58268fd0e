use helm_chain::{
    Block, BlockId, BlockLinkage, ChainApi, ChainError, ChainFactory, ChainParams, ChainResult, DynChain, MiniBlock, PeerId,
    TopoEntry, memory::MemoryChain, relay::DynBlockRelayer,
};
use helm_core::{
    core::Core,
    lifecycle::SubsystemState,
    signals::{InterruptOutcome, Signals},
    subsystems::{ActiveSubsystems, SubsystemGuard},
    task::service::AsyncService,
};
use helmd_lib::{
    config::{ConfigOverrides, EffectiveConfig, resolve_from},
    daemon::{Daemon, DaemonError, NodeContext},
    p2p::{P2pApi, P2pResult},
    rpc::{DynRpcHandle, RpcApi, RpcError, RpcHandle, RpcResult},
};
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

type CallLog = Arc<Mutex<Vec<String>>>;

fn record(log: &CallLog, call: impl Into<String>) {
    log.lock().push(call.into());
}

/// Wraps a [`MemoryChain`], records shutdown and counts itself as active until then
struct RecordingChain {
    inner: MemoryChain,
    log: CallLog,
    broken_linkage: bool,
    guard: Mutex<Option<SubsystemGuard>>,
}

impl ChainApi for RecordingChain {
    fn read_topo(&self, topoheight: u64) -> ChainResult<TopoEntry> {
        self.inner.read_topo(topoheight)
    }

    fn write_topo(&self, topoheight: u64, entry: TopoEntry) -> ChainResult<()> {
        self.inner.write_topo(topoheight, entry)
    }

    fn topo_height(&self) -> ChainResult<u64> {
        self.inner.topo_height()
    }

    fn height_of(&self, id: &BlockId) -> ChainResult<u64> {
        self.inner.height_of(id)
    }

    fn snapshot_version(&self, id: &BlockId) -> ChainResult<u64> {
        self.inner.snapshot_version(id)
    }

    fn linkage(&self, id: &BlockId) -> ChainResult<BlockLinkage> {
        if self.broken_linkage {
            return Err(ChainError::DataInconsistency("linkage store is unreadable".to_string()));
        }
        self.inner.linkage(id)
    }

    fn accept_block(&self, block: Block, origin: PeerId) -> ChainResult<TopoEntry> {
        self.inner.accept_block(block, origin)
    }

    fn accept_mini_block(&self, mini_block: MiniBlock, origin: PeerId) -> ChainResult<()> {
        self.inner.accept_mini_block(mini_block, origin)
    }

    fn register_relayer(&self, relayer: DynBlockRelayer) {
        self.inner.register_relayer(relayer)
    }

    fn shutdown(&self) -> ChainResult<()> {
        record(&self.log, "chain.shutdown");
        self.guard.lock().take();
        self.inner.shutdown()
    }
}

#[derive(Default)]
struct FakeFactory {
    log: CallLog,
    fail_start: bool,
    broken_linkage: bool,
    started: Mutex<Option<Arc<RecordingChain>>>,
}

impl ChainFactory for FakeFactory {
    fn start(&self, _params: &ChainParams, subsystems: Arc<ActiveSubsystems>) -> ChainResult<DynChain> {
        record(&self.log, "chain.start");
        if self.fail_start {
            return Err(ChainError::Io(std::io::Error::other("database is locked")));
        }
        let chain = Arc::new(RecordingChain {
            inner: MemoryChain::with_genesis(1.into()),
            log: self.log.clone(),
            broken_linkage: self.broken_linkage,
            guard: Mutex::new(Some(subsystems.guard())),
        });
        self.started.lock().replace(chain.clone());
        Ok(chain)
    }

    fn prune(&self, _params: &ChainParams, topoheight: u64) -> ChainResult<()> {
        record(&self.log, format!("chain.prune {}", topoheight));
        Ok(())
    }
}

struct FakeP2p {
    log: CallLog,
}

impl P2pApi for FakeP2p {
    fn start(&self, _chain: DynChain) -> P2pResult<()> {
        record(&self.log, "p2p.start");
        Ok(())
    }

    fn shutdown(&self) -> P2pResult<()> {
        record(&self.log, "p2p.shutdown");
        Ok(())
    }

    fn broadcast_block(&self, block: &Block, exclude: PeerId) {
        record(&self.log, format!("p2p.broadcast_block {} !{}", block.height(), exclude));
    }

    fn broadcast_mini_block(&self, mini_block: &MiniBlock, exclude: PeerId) {
        record(&self.log, format!("p2p.broadcast_mini_block {} !{}", mini_block.height, exclude));
    }

    fn peer_count(&self) -> usize {
        0
    }
}

struct FakeRpcHandle {
    log: CallLog,
}

impl RpcHandle for FakeRpcHandle {
    fn stop(&self) -> RpcResult<()> {
        record(&self.log, "rpc.stop");
        Ok(())
    }
}

struct FakeRpc {
    log: CallLog,
    fail_start: bool,
    refreshes: AtomicUsize,
}

impl RpcApi for FakeRpc {
    fn start(&self, _chain: DynChain) -> RpcResult<DynRpcHandle> {
        record(&self.log, "rpc.start");
        if self.fail_start {
            return Err(RpcError::AlreadyStarted);
        }
        Ok(Arc::new(FakeRpcHandle { log: self.log.clone() }))
    }

    fn getwork(&self) -> Option<Arc<dyn AsyncService>> {
        None
    }

    fn refresh_miner_count(&self) -> usize {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn miner_count(&self) -> usize {
        0
    }
}

fn config(overrides: ConfigOverrides) -> EffectiveConfig {
    let dir = tempfile::tempdir().unwrap();
    let overrides = overrides
        .with("data-dir", dir.path().to_string_lossy().into_owned())
        .with("nologfiles", true)
        .with("async-threads", 1i64)
        .with("repair-anchor", 0i64);
    resolve_from(&overrides, ["helmd"]).unwrap()
}

struct Fixture {
    log: CallLog,
    factory: Arc<FakeFactory>,
    daemon: Arc<Daemon>,
}

impl Fixture {
    fn new(factory: FakeFactory) -> Self {
        Self::with_config(factory, config(ConfigOverrides::new()))
    }

    fn with_config(factory: FakeFactory, config: EffectiveConfig) -> Self {
        Self::build(factory, config, false)
    }

    fn with_failing_rpc(factory: FakeFactory) -> Self {
        Self::build(factory, config(ConfigOverrides::new()), true)
    }

    fn build(factory: FakeFactory, config: EffectiveConfig, fail_rpc: bool) -> Self {
        let log = factory.log.clone();
        let factory = Arc::new(factory);
        let context = NodeContext::new(config).unwrap();
        let p2p = Arc::new(FakeP2p { log: log.clone() });
        let rpc = Arc::new(FakeRpc { log: log.clone(), fail_start: fail_rpc, refreshes: AtomicUsize::new(0) });
        let daemon = Daemon::new(context, factory.clone(), p2p, rpc).with_quiescence_poll(Duration::from_millis(10));
        Self { log, factory, daemon: Arc::new(daemon) }
    }

    fn calls(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn stop_calls(&self) -> Vec<String> {
        self.calls().into_iter().filter(|call| call.ends_with("stop") || call.ends_with("shutdown")).collect()
    }
}

#[test]
fn test_start_and_stop_order() {
    let fixture = Fixture::new(FakeFactory::default());
    fixture.daemon.bring_up().unwrap();
    assert_eq!(fixture.calls(), vec!["chain.start", "p2p.start", "rpc.start"]);
    for ident in ["chain", "p2p", "rpc", "scheduler"] {
        assert_eq!(fixture.daemon.state(ident), Some(SubsystemState::Running), "{}", ident);
    }

    fixture.daemon.stop_subsystems();
    assert_eq!(fixture.stop_calls(), vec!["rpc.stop", "p2p.shutdown", "chain.shutdown"]);
    assert_eq!(fixture.daemon.wait_for_quiescence(), 0);

    // Stopped subsystems get no second stop call
    fixture.daemon.stop_subsystems();
    assert_eq!(fixture.stop_calls().len(), 3);
    assert_eq!(fixture.daemon.state("chain"), Some(SubsystemState::Stopped));
}

#[test]
fn test_quiescence_wait_polls_until_counter_drains() {
    let fixture = Fixture::new(FakeFactory::default());
    let subsystems = fixture.daemon.context().subsystems.clone();
    let guards = (0..3).map(|_| subsystems.guard()).collect::<Vec<_>>();
    assert_eq!(subsystems.count(), 3);

    let released = Arc::new(AtomicUsize::new(0));
    let releaser = {
        let released = released.clone();
        thread::spawn(move || {
            for guard in guards {
                thread::sleep(Duration::from_millis(30));
                released.fetch_add(1, Ordering::SeqCst);
                drop(guard);
            }
        })
    };

    let polls = fixture.daemon.wait_for_quiescence();
    assert_eq!(released.load(Ordering::SeqCst), 3);
    assert!(subsystems.is_quiescent());
    // At least 90ms of waiting at a 10ms interval, far from a busy spin
    assert!((3..1000).contains(&polls), "{}", polls);
    releaser.join().unwrap();
}

#[test]
fn test_engine_start_failure_touches_nothing_else() {
    let fixture = Fixture::new(FakeFactory { fail_start: true, ..Default::default() });
    let err = fixture.daemon.bring_up().unwrap_err();
    assert!(matches!(err, DaemonError::EngineStart(ChainError::Io(_))), "{}", err);
    assert_eq!(fixture.calls(), vec!["chain.start"]);

    fixture.daemon.stop_subsystems();
    assert_eq!(fixture.calls(), vec!["chain.start"]);
    assert_eq!(fixture.daemon.state("p2p"), Some(SubsystemState::NotStarted));
    assert!(fixture.daemon.context().subsystems.is_quiescent());
}

#[test]
fn test_prune_runs_before_engine_start() {
    let fixture = Fixture::with_config(FakeFactory::default(), config(ConfigOverrides::new().with("prune-history", 50i64)));
    fixture.daemon.bring_up().unwrap();
    assert_eq!(fixture.calls()[..2], ["chain.prune 50".to_string(), "chain.start".to_string()]);
    fixture.daemon.stop_subsystems();
    fixture.daemon.wait_for_quiescence();
}

#[test]
fn test_repair_failure_aborts_without_stopping() {
    let fixture = Fixture::new(FakeFactory { broken_linkage: true, ..Default::default() });
    let core = Arc::new(Core::new());
    core.bind(fixture.daemon.clone());
    core.run();

    assert_eq!(fixture.daemon.exit_code(), 1);
    assert!(matches!(fixture.daemon.take_error(), Some(DaemonError::RepairFatal(_))));
    assert!(!core.is_running());
    // Neither serving nor a stop sequence happened
    assert_eq!(fixture.calls(), vec!["chain.start"]);
    assert_eq!(fixture.daemon.state("chain"), Some(SubsystemState::Running));
    assert_eq!(fixture.daemon.context().subsystems.count(), 1);
}

#[test]
fn test_serving_failure_stops_started_subsystems() {
    let fixture = Fixture::with_failing_rpc(FakeFactory::default());
    let core = Arc::new(Core::new());
    core.bind(fixture.daemon.clone());
    core.run();

    assert_eq!(fixture.daemon.exit_code(), 1);
    assert!(matches!(fixture.daemon.take_error(), Some(DaemonError::RpcStart(RpcError::AlreadyStarted))));
    assert!(!core.is_running());
    // rpc never reached running, so only p2p and the engine are stopped
    assert_eq!(fixture.calls(), vec!["chain.start", "p2p.start", "rpc.start", "p2p.shutdown", "chain.shutdown"]);
    assert_eq!(fixture.daemon.state("p2p"), Some(SubsystemState::Stopped));
    assert_eq!(fixture.daemon.state("chain"), Some(SubsystemState::Stopped));
    assert_eq!(fixture.daemon.state("scheduler"), Some(SubsystemState::NotStarted));
    assert!(fixture.daemon.context().subsystems.is_quiescent());
}

#[test]
fn test_relay_hook_forwards_to_p2p() {
    let fixture = Fixture::new(FakeFactory::default());
    let chain = fixture.daemon.start_engine().unwrap();

    chain.accept_block(Block::new(BlockLinkage::new(2.into(), 1, vec![1.into()]), 0, vec![7]), 4).unwrap();
    let mini_block = MiniBlock { id: 3.into(), height: 2, past: vec![2.into()], timestamp: 0 };
    chain.accept_mini_block(mini_block, 9).unwrap();
    assert_eq!(fixture.calls()[1..], ["p2p.broadcast_block 1 !4".to_string(), "p2p.broadcast_mini_block 2 !9".to_string()]);
    assert!(fixture.factory.started.lock().is_some());

    fixture.daemon.stop_subsystems();
    assert_eq!(fixture.stop_calls(), vec!["chain.shutdown"]);
}

#[test]
fn test_interrupt_runs_the_stop_sequence_once() {
    let fixture = Fixture::new(FakeFactory::default());
    let core = Arc::new(Core::new());
    core.bind(fixture.daemon.clone());
    let runner = {
        let core = core.clone();
        thread::spawn(move || core.run())
    };

    while fixture.daemon.state("scheduler") != Some(SubsystemState::Running) {
        thread::sleep(Duration::from_millis(5));
    }
    let signals = Signals::new(&core);
    assert_eq!(signals.interrupt(), InterruptOutcome::Shutdown);
    assert_eq!(signals.interrupt(), InterruptOutcome::Ignored);
    runner.join().unwrap();

    assert_eq!(fixture.stop_calls(), vec!["rpc.stop", "p2p.shutdown", "chain.shutdown"]);
    assert_eq!(fixture.daemon.exit_code(), 0);
    assert!(fixture.daemon.context().subsystems.is_quiescent());
}
