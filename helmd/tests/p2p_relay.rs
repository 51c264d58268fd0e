use helm_chain::{Block, BlockLinkage, ChainApi, Network, block::LOCAL_PEER, memory::MemoryChain};
use helm_core::subsystems::ActiveSubsystems;
use helmd_lib::p2p::{P2pApi, P2pConfig, P2pNode, P2pRelayer};
use std::{
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tokio::runtime::Runtime;

/// Port 0 disables a listener, so reserve a concrete free port up front
fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

struct Peer {
    node: Arc<P2pNode>,
    chain: Arc<MemoryChain>,
}

impl Peer {
    fn start(runtime: &Runtime, subsystems: &Arc<ActiveSubsystems>, bind: SocketAddr, priority_nodes: Vec<String>) -> Self {
        let config = P2pConfig {
            network: Network::Testnet,
            bind,
            exclusive_nodes: vec![],
            priority_nodes,
            min_peers: 1,
            node_tag: None,
            socks_proxy: None,
        };
        let node = Arc::new(P2pNode::new(config, runtime.handle().clone(), subsystems.clone()));
        let chain = Arc::new(MemoryChain::with_genesis(1.into()));
        chain.register_relayer(Arc::new(P2pRelayer::new(node.clone())));
        node.start(chain.clone()).unwrap();
        Self { node, chain }
    }
}

#[test]
fn test_blocks_propagate_across_peers() {
    let runtime = Runtime::new().unwrap();
    let subsystems = Arc::new(ActiveSubsystems::new());

    // a <- b <- c
    let (a_addr, b_addr) = (free_addr(), free_addr());
    let a = Peer::start(&runtime, &subsystems, a_addr, vec![]);
    let b = Peer::start(&runtime, &subsystems, b_addr, vec![a_addr.to_string()]);
    let c = Peer::start(&runtime, &subsystems, "0.0.0.0:0".parse().unwrap(), vec![b_addr.to_string()]);
    wait_until("peers to connect", || a.node.peer_count() == 1 && b.node.peer_count() == 2 && c.node.peer_count() == 1);
    assert_eq!(a.node.dropped_peers() + b.node.dropped_peers() + c.node.dropped_peers(), 0);

    let block = Block::new(BlockLinkage::new(2.into(), 1, vec![1.into()]), 1_700_000_000, vec![1, 2, 3]);
    a.chain.accept_block(block, LOCAL_PEER).unwrap();
    wait_until("block to reach b", || b.chain.topo_height().unwrap() == 1);
    wait_until("block to reach c", || c.chain.topo_height().unwrap() == 1);
    assert_eq!(c.chain.read_topo(1).unwrap().block_id, 2.into());
    assert_eq!(a.chain.topo_height().unwrap(), 1);

    for peer in [&a, &b, &c] {
        peer.node.shutdown().unwrap();
    }
    wait_until("p2p tasks to exit", || subsystems.is_quiescent());
}

#[test]
fn test_peers_on_another_network_are_dropped() {
    let runtime = Runtime::new().unwrap();
    let subsystems = Arc::new(ActiveSubsystems::new());
    let addr = free_addr();
    let testnet = Peer::start(&runtime, &subsystems, addr, vec![]);

    let config = P2pConfig {
        network: Network::Mainnet,
        bind: "0.0.0.0:0".parse().unwrap(),
        exclusive_nodes: vec![addr.to_string()],
        priority_nodes: vec![],
        min_peers: 1,
        node_tag: Some("mainnet-node".to_string()),
        socks_proxy: None,
    };
    let mainnet = P2pNode::new(config, runtime.handle().clone(), subsystems.clone());
    mainnet.start(Arc::new(MemoryChain::with_genesis(1.into()))).unwrap();

    // Whichever side reads the foreign hello first hangs up, the other may only see the close
    wait_until("the mismatched peer to be dropped", || testnet.node.dropped_peers() + mainnet.dropped_peers() >= 1);
    wait_until("the sessions to close", || testnet.node.peer_count() == 0 && mainnet.peer_count() == 0);
    mainnet.shutdown().unwrap();
    testnet.node.shutdown().unwrap();
    wait_until("p2p tasks to exit", || subsystems.is_quiescent());
}
