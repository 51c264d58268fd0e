use helm_chain::{
    BlockId, BlockLinkage, ChainApi, TopoEntry,
    memory::MemoryChain,
    repair::{RepairWindow, repair_topo_index},
};

const ANCHOR: u64 = 17_600;
const FLOOR: u64 = 17_500;

/// Linear chain up to the anchor plus a few blocks above it. Block ids are derived from
/// heights, xor-ed with a salt so they differ from topoheights.
fn build_chain() -> MemoryChain {
    let id = |height: u64| BlockId::from(height ^ 0xa5a5_0000);
    let chain = MemoryChain::with_genesis(id(0));
    for height in 1..=ANCHOR + 5 {
        chain.insert_linkage(BlockLinkage::new(id(height), height, vec![id(height - 1)]), height * 3).unwrap();
    }
    chain
}

fn walk_back(chain: &MemoryChain, from: BlockId, steps: u64) -> BlockId {
    let mut current = from;
    for _ in 0..steps {
        current = chain.linkage(&current).unwrap().primary_parent().unwrap();
    }
    current
}

#[test]
fn test_repair_heals_stale_entry_below_anchor() {
    helm_core::log::try_init_logger("info");
    let chain = build_chain();
    let stale = BlockId::from(0xdead_beef);
    chain.write_topo(17_550, TopoEntry::new(stale, 1, 17_550)).unwrap();
    let below_floor = TopoEntry::new(BlockId::from(0xbad), 2, 17_400);
    chain.write_topo(17_400, below_floor).unwrap();
    let above_anchor = chain.read_topo(ANCHOR + 3).unwrap();

    let report = repair_topo_index(&chain, RepairWindow::new(ANCHOR, FLOOR)).unwrap();
    assert_eq!(report.corrections.len(), 1);
    assert_eq!(report.corrections[0].stale, Some(stale));
    assert_eq!(report.visited, ANCHOR - FLOOR + 1);

    let anchor_id = chain.read_topo(ANCHOR).unwrap().block_id;
    let expected = walk_back(&chain, anchor_id, 50);
    let repaired = chain.read_topo(17_550).unwrap();
    assert_eq!(repaired.block_id, expected);
    assert_eq!(repaired.state_version, chain.snapshot_version(&expected).unwrap());
    assert_eq!(repaired.height, 17_550);

    assert_eq!(chain.read_topo(17_400).unwrap(), below_floor);
    assert_eq!(chain.read_topo(ANCHOR + 3).unwrap(), above_anchor);

    let entries = chain.topo_entries();
    assert!(repair_topo_index(&chain, RepairWindow::new(ANCHOR, FLOOR)).unwrap().is_clean());
    assert_eq!(chain.topo_entries(), entries);
}

#[test]
fn test_default_window_matches_scenario() {
    assert_eq!(RepairWindow::default(), RepairWindow::new(ANCHOR, FLOOR));
}
