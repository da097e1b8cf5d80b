//! Page-table walker integration tests.
//!
//! A walker is wired above a real L1D and memory controller and driven one
//! translation at a time:
//! - cold walks fault and allocate the table path on first touch,
//! - a fully populated path is read level by level with the starting depth
//!   chosen by the paging-structure caches,
//! - the walk result equals the virtual-memory mapping.

use oxsim_core::common::{BLOCK_SHIFT, FILL_L1, PAGE_SHIFT};
use oxsim_core::config::{CacheLevelConfig, DramConfig, PtwConfig};
use oxsim_core::mem::cache::Cache;
use oxsim_core::mem::dram::MemoryController;
use oxsim_core::mem::hierarchy::{Node, Uncore};
use oxsim_core::mem::packet::{BusKind, Packet, RequestKind, Sink};
use oxsim_core::ptw::PageTableWalker;
use oxsim_core::vmem::VirtualMemory;

struct Rig {
    uncore: Uncore,
    vmem: VirtualMemory,
}

impl Rig {
    fn new() -> Self {
        let mut vmem = VirtualMemory::new(99);
        let ptw = PageTableWalker::new("PTW", &PtwConfig::default(), 0, 0, 1, &mut vmem);
        let l1d = Cache::new("L1D", &CacheLevelConfig::default(), BLOCK_SHIFT, FILL_L1, 1, 2, 1);
        let dram = MemoryController::new(&DramConfig::default());
        Self {
            uncore: Uncore::new(vec![Node::Ptw(ptw), Node::Cache(l1d), Node::Dram(dram)]),
            vmem,
        }
    }

    fn ptw(&self) -> &PageTableWalker {
        match &self.uncore.nodes[0] {
            Node::Ptw(p) => p,
            _ => unreachable!(),
        }
    }

    fn submit(&mut self, vaddr: u64) {
        let packet = Packet {
            address: vaddr,
            v_address: vaddr,
            kind: RequestKind::Load,
            to_return: vec![Sink::CoreBus(0, BusKind::Dtlb)],
            ..Packet::default()
        };
        assert!(self.uncore.add_rq(0, packet) > -2);
    }

    /// Steps all nodes until a CPU-side completion appears.
    fn run_until_return(&mut self, max_cycles: usize) -> Packet {
        let warmup = vec![true];
        for _ in 0..max_cycles {
            for i in 0..self.uncore.nodes.len() {
                self.uncore.operate_node(i, &mut self.vmem, &warmup);
                for (sink, pkt) in self.uncore.take_returns() {
                    match sink {
                        Sink::Node(id) => self.uncore.deliver(id, &pkt),
                        Sink::CoreBus(..) => return pkt,
                    }
                }
            }
        }
        panic!("no translation completed within {max_cycles} cycles");
    }

    fn l1d_translation_accesses(&self) -> u64 {
        let stats = &self.uncore.cache(1).stats;
        let t = RequestKind::Translation as usize;
        stats.sim_hit[0][t] + stats.sim_miss[0][t]
    }
}

#[test]
fn test_first_touch_faults_and_maps_the_data_page() {
    let mut rig = Rig::new();
    let vaddr = 0x0112_2334_4556_7008u64;

    rig.submit(vaddr);
    let done = rig.run_until_return(10_000);

    assert_eq!(done.address, vaddr);
    assert_eq!(done.data, rig.vmem.va_to_pa(0, vaddr) >> PAGE_SHIFT);
    assert!(rig.ptw().mshr_entries().is_empty());
    // The fault completed the walk after the first table read.
    assert_eq!(rig.l1d_translation_accesses(), 1);
    // Every intermediate level was memoized for a cold start (init depth 5).
    assert!(rig.ptw().pscl5.check_hit(vaddr).is_some());
    assert!(rig.ptw().pscl4.check_hit(vaddr).is_some());
    assert!(rig.ptw().pscl3.check_hit(vaddr).is_some());
    assert!(rig.ptw().pscl2.check_hit(vaddr).is_some());
}

#[test]
fn test_populated_path_walks_all_five_levels() {
    let mut rig = Rig::new();
    let vaddr = 0x0112_2334_4556_7008u64;

    // Populate the table path for vaddr.
    rig.submit(vaddr);
    rig.run_until_return(10_000);

    // Thrash every PSCL set the address maps to so the walk below cannot
    // shortcut. Distinct level-5 indices keep the table paths disjoint.
    for i in 1..=16u64 {
        let thrash = vaddr ^ (i << 48);
        rig.submit(thrash);
        rig.run_until_return(10_000);
    }
    assert!(rig.ptw().pscl5.check_hit(vaddr).is_none());
    assert!(rig.ptw().pscl4.check_hit(vaddr).is_none());
    assert!(rig.ptw().pscl3.check_hit(vaddr).is_none());
    assert!(rig.ptw().pscl2.check_hit(vaddr).is_none());

    // The path exists and the PSCLs are cold: a full five-level read
    // sequence, one request per level, no faults.
    let before = rig.l1d_translation_accesses();
    rig.submit(vaddr);
    let done = rig.run_until_return(10_000);
    assert_eq!(rig.l1d_translation_accesses() - before, 5);
    assert_eq!(done.data, rig.vmem.va_to_pa(0, vaddr) >> PAGE_SHIFT);
    // The walk re-filled every level it passed through.
    assert!(rig.ptw().pscl5.check_hit(vaddr).is_some());
    assert!(rig.ptw().pscl2.check_hit(vaddr).is_some());
}

#[test]
fn test_pscl_hit_starts_the_walk_below_the_root() {
    let mut rig = Rig::new();
    let vaddr = 0x0112_2334_4556_7008u64;

    // Populate the path, then translate a neighbor that shares levels 5..3
    // but uses a different level-2 slot: PSCL3 hits, PSCL2 misses.
    rig.submit(vaddr);
    rig.run_until_return(10_000);
    let neighbor = vaddr ^ (1 << 21);
    assert!(rig.ptw().pscl3.check_hit(neighbor).is_some());
    assert!(rig.ptw().pscl2.check_hit(neighbor).is_none());

    rig.submit(neighbor);
    // After the first walker cycle the walk is parked in the MSHR with its
    // starting depth recorded.
    let warmup = vec![true];
    let mut observed_init = None;
    for _ in 0..20 {
        for i in 0..rig.uncore.nodes.len() {
            rig.uncore.operate_node(i, &mut rig.vmem, &warmup);
            let pending: Vec<_> = rig.uncore.take_returns();
            for (sink, pkt) in pending {
                if let Sink::Node(id) = sink {
                    rig.uncore.deliver(id, &pkt);
                }
            }
        }
        if let Some(entry) = rig.ptw().mshr_entries().first() {
            observed_init = Some((entry.init_translation_level, entry.translation_level));
            break;
        }
    }
    assert_eq!(observed_init, Some((2, 2)));

    let done = rig.run_until_return(10_000);
    assert_eq!(done.data, rig.vmem.va_to_pa(0, neighbor) >> PAGE_SHIFT);
    // Only the level the walk actually crossed was newly memoized.
    assert!(rig.ptw().pscl2.check_hit(neighbor).is_some());
}
