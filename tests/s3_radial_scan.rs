//! RADIAL: an outward-propagating scan seeded at `(1,1)` over a 3x3 block grid eventually
//! dispatches every block, driven purely by `self_jobs` neighbor propagation (no task
//! outside the scan seeds anything but the origin).

mod common;

use std::sync::Arc;

use blockjit::config::Config;
use blockjit::ir::{Access, Coord, DataType, LocalOp, MemOrder, Meta, NodeKind, NumDim};
use blockjit::runtime::Runtime;

use common::{CountingDevice, NullCodeGen, NullFileStore};

fn meta(block: i32) -> Meta {
    Meta { data_size: 0, data_type: DataType::F32, mem_order: MemOrder::RowMajor, block_size: Coord::new(&[block, block]), num_dim: NumDim::D2 }
}

#[test]
fn radial_scan_reaches_every_block_from_a_single_seed() {
    let conf = Config { block_size: 1, cache_entry_count: 32, num_devices: 1, ..Config::default() };
    let mut rt = Runtime::new(conf).unwrap();

    let a = rt.add_node(NodeKind::Input, meta(1), vec![]).unwrap();
    // A plain `Local` read fused onto a `Radial` start would break the singleton-seed
    // fusion rule, so the scan node reads `a` directly.
    let scan = rt.add_node(NodeKind::Radial { start: Coord::new(&[1, 1]) }, meta(1), vec![(a, Access::Read)]).unwrap();
    rt.retain_node(scan);

    let device = Arc::new(CountingDevice::new());
    rt.setup_devices(vec![device.clone()], Arc::new(NullFileStore), Arc::new(NullCodeGen)).unwrap();

    rt.evaluate(&[scan], &Coord::new(&[3, 3]), DataType::F32).unwrap();

    // Only the origin is seeded directly (`Task::initial_jobs` for `Radial` returns a
    // single job); every other one of the 9 blocks must be reached transitively through
    // `notify_successors`' `self_jobs` propagation.
    assert_eq!(device.dispatches.load(std::sync::atomic::Ordering::SeqCst), 9);
}

#[test]
fn local_chain_downstream_of_a_radial_scan_still_runs() {
    // A `Local` node consuming the scan's output lives in its own task (RADIAL clusters
    // are singleton-seeded), so it must still be reached via the cross-task consumer map
    // once the scan's every coordinate has notified it.
    let conf = Config { block_size: 1, cache_entry_count: 32, num_devices: 1, ..Config::default() };
    let mut rt = Runtime::new(conf).unwrap();

    let a = rt.add_node(NodeKind::Input, meta(1), vec![]).unwrap();
    let scan = rt.add_node(NodeKind::Radial { start: Coord::new(&[0, 0]) }, meta(1), vec![(a, Access::Read)]).unwrap();
    let doubled = rt.add_node(NodeKind::Local(LocalOp::Neg), meta(1), vec![(scan, Access::Read)]).unwrap();
    rt.retain_node(doubled);

    let device = Arc::new(CountingDevice::new());
    rt.setup_devices(vec![device.clone()], Arc::new(NullFileStore), Arc::new(NullCodeGen)).unwrap();

    rt.evaluate(&[doubled], &Coord::new(&[2, 2]), DataType::F32).unwrap();

    // 4 scan dispatches (one per 2x2 block) plus 4 downstream `Local` dispatches.
    assert_eq!(device.dispatches.load(std::sync::atomic::Ordering::SeqCst), 8);
}
