//! Hardware page-table walker.
//!
//! The walker serializes five-level page walks on behalf of the second-level
//! TLB. It provides:
//! 1. **Paging-structure caches:** one [`PagingStructureCache`] per
//!    intermediate level (PSCL5..PSCL2) memoizes partial translations so a
//!    walk can start below the root.
//! 2. **Walk state:** each outstanding walk lives in an MSHR entry whose
//!    `translation_level` counts down from its starting depth to zero; while
//!    a lower-level read is in flight the entry's event cycle is parked at
//!    `u64::MAX`.
//! 3. **Functional page table:** a five-level radix tree of
//!    [`PageTablePage`] nodes. A missing child is a page fault, handled by
//!    allocating table pages on demand and mapping the data page through
//!    [`VirtualMemory`].
//!
//! The walker's lower level is the L1D: page-table reads are ordinary
//! `Translation` packets into its read queue.

use crate::common::{PAGE_SHIFT, PT_ENTRIES, PT_REGION_BASE, QUEUE_REFUSED, VA_BITS, bitmask};
use crate::config::{PsclConfig, PtwConfig};
use crate::mem::hierarchy::{Downstream, NodeId};
use crate::mem::packet::{Packet, QueueKind, RequestKind, Sink};
use crate::mem::queue::DelayQueue;
use crate::vmem::VirtualMemory;

/// Extracts the 9-bit table index for `level` from a virtual address.
///
/// Level 1 indexes the leaf table (shift 12), level 5 the root (shift 48).
/// Only the low 57 bits of the address participate.
fn page_offset(vaddr: u64, level: u8) -> u64 {
    debug_assert!((1..=5).contains(&level));
    let shift = PAGE_SHIFT + 9 * (level as u32 - 1);
    ((vaddr & bitmask(VA_BITS)) >> shift) & 0x1ff
}

/// One node of the functional page table: 512 children and 512 next-level
/// base frames (`u64::MAX` marks an unmapped entry).
pub struct PageTablePage {
    children: Vec<Option<Box<PageTablePage>>>,
    next_base: Vec<u64>,
}

impl PageTablePage {
    fn new() -> Self {
        Self {
            children: (0..PT_ENTRIES).map(|_| None).collect(),
            next_base: vec![u64::MAX; PT_ENTRIES],
        }
    }
}

struct PsclWay {
    valid: bool,
    tag: u64,
    data: u64,
    lru: u32,
}

/// Set-associative cache of partial translations for one paging level.
///
/// The tag is the virtual-address prefix above this level's table index;
/// the data is the physical base frame of the next-level table.
pub struct PagingStructureCache {
    /// Paging level this cache serves (2..=5).
    pub level: u8,
    sets: usize,
    ways: usize,
    blocks: Vec<PsclWay>,
}

impl PagingStructureCache {
    fn new(level: u8, cfg: &PsclConfig) -> Self {
        let blocks = (0..cfg.sets * cfg.ways)
            .map(|_| PsclWay {
                valid: false,
                tag: 0,
                data: 0,
                lru: 0,
            })
            .collect();
        Self {
            level,
            sets: cfg.sets,
            ways: cfg.ways,
            blocks,
        }
    }

    /// Virtual-address prefix used as this level's tag.
    fn index_of(&self, vaddr: u64) -> u64 {
        let shift = PAGE_SHIFT + 9 * (self.level as u32 - 1);
        (vaddr & bitmask(VA_BITS)) >> shift
    }

    fn set_of(&self, index: u64) -> usize {
        ((index >> PAGE_SHIFT) as usize) & (self.sets - 1)
    }

    /// Returns the memoized next-level base frame, if present.
    pub fn check_hit(&self, vaddr: u64) -> Option<u64> {
        let index = self.index_of(vaddr);
        let set = self.set_of(index);
        (0..self.ways)
            .map(|w| &self.blocks[set * self.ways + w])
            .find(|b| b.valid && b.tag == index)
            .map(|b| b.data)
    }

    /// Installs a translation, evicting the max-LRU way of the set. The
    /// victim's age is inherited before the filled way is promoted to MRU.
    pub fn fill(&mut self, next_level_base: u64, vaddr: u64) {
        let index = self.index_of(vaddr);
        let set = self.set_of(index);
        let base = set * self.ways;
        let victim = (0..self.ways)
            .max_by_key(|&w| self.blocks[base + w].lru)
            .unwrap();

        let old_lru = self.blocks[base + victim].lru;
        self.blocks[base + victim] = PsclWay {
            valid: true,
            tag: index,
            data: next_level_base,
            lru: old_lru,
        };

        let hit_lru = self.blocks[base + victim].lru;
        for w in 0..self.ways {
            if self.blocks[base + w].lru <= hit_lru {
                self.blocks[base + w].lru = self.blocks[base + w].lru.wrapping_add(1);
            }
        }
        self.blocks[base + victim].lru = 0;
    }
}

/// Walk-traffic counters.
#[derive(Default)]
pub struct PtwStats {
    /// Requests offered to the walker.
    pub rq_access: u64,
    /// Requests accepted into the read queue.
    pub rq_to_cache: u64,
    /// Refused insertions plus stalled walk steps (lower level full).
    pub rq_full: u64,
    /// Summed walk latency over post-warmup completions.
    pub total_miss_latency: u64,
}

/// The page-table walker node.
pub struct PageTableWalker {
    /// Display name ("cpu0_PTW").
    pub name: String,
    /// Owning CPU.
    pub cpu: usize,
    id: NodeId,
    lower: NodeId,
    /// Physical frame of the root (level-5) table.
    pub cr3_addr: u64,
    root: Box<PageTablePage>,
    next_translation_virtual_address: u64,
    /// Level-5 paging-structure cache.
    pub pscl5: PagingStructureCache,
    /// Level-4 paging-structure cache.
    pub pscl4: PagingStructureCache,
    /// Level-3 paging-structure cache.
    pub pscl3: PagingStructureCache,
    /// Level-2 paging-structure cache.
    pub pscl2: PagingStructureCache,
    rq: DelayQueue<Packet>,
    mshr: Vec<Packet>,
    mshr_size: usize,
    max_read: usize,
    max_fill: usize,
    /// Local cycle count.
    pub current_cycle: u64,
    /// Walk-traffic statistics.
    pub stats: PtwStats,
}

impl PageTableWalker {
    /// Builds a walker for `cpu`. The root table's frame is reserved from
    /// the same allocation cursor that backs all other table pages.
    pub fn new(
        name: impl Into<String>,
        cfg: &PtwConfig,
        cpu: usize,
        id: NodeId,
        lower: NodeId,
        vmem: &mut VirtualMemory,
    ) -> Self {
        let mut next_translation_virtual_address = PT_REGION_BASE;
        let cr3_addr = Self::map_translation_page(
            &mut next_translation_virtual_address,
            vmem,
            cpu,
        );
        Self {
            name: name.into(),
            cpu,
            id,
            lower,
            cr3_addr,
            root: Box::new(PageTablePage::new()),
            next_translation_virtual_address,
            pscl5: PagingStructureCache::new(5, &cfg.pscl5),
            pscl4: PagingStructureCache::new(4, &cfg.pscl4),
            pscl3: PagingStructureCache::new(3, &cfg.pscl3),
            pscl2: PagingStructureCache::new(2, &cfg.pscl2),
            rq: DelayQueue::new(cfg.rq_size, 0),
            mshr: Vec::with_capacity(cfg.mshr_size),
            mshr_size: cfg.mshr_size,
            max_read: cfg.max_read,
            max_fill: cfg.max_fill,
            current_cycle: 0,
            stats: PtwStats::default(),
        }
    }

    /// Reserves a physical frame for a page-table page and advances the
    /// allocation cursor to the next page of the reserved region.
    fn map_translation_page(cursor: &mut u64, vmem: &mut VirtualMemory, cpu: usize) -> u64 {
        let physical_address = vmem.va_to_pa(cpu, *cursor);
        *cursor = ((*cursor >> PAGE_SHIFT) + 1) << PAGE_SHIFT;
        physical_address >> PAGE_SHIFT
    }

    /// One walker cycle: advance outstanding walks, then start new ones.
    pub fn operate(&mut self, down: &mut Downstream<'_>, vmem: &mut VirtualMemory, warmup_done: &[bool]) {
        self.current_cycle += 1;
        self.handle_fill(down, vmem, warmup_done);
        self.handle_read(down);
    }

    /// Starts up to `max_read` walks: probe the PSCLs deepest-first to pick
    /// the starting level, send the first table read to the L1D, and park
    /// the walk in the MSHR.
    fn handle_read(&mut self, down: &mut Downstream<'_>) {
        for _ in 0..self.max_read {
            let mshr_full = self.mshr.len() >= self.mshr_size;
            let lower_full = down.get_occupancy(self.lower, QueueKind::Rq)
                >= down.get_size(self.lower, QueueKind::Rq);
            if !self.rq.has_ready(self.current_cycle) || mshr_full || lower_full {
                break;
            }

            let handle = self.rq.front().unwrap().clone();
            assert!(
                handle.address >> 32 != PT_REGION_BASE >> 32,
                "translation requested for the page-table region itself"
            );
            assert!(handle.v_address != 0);

            let (base, level) = if let Some(base) = self.pscl2.check_hit(handle.address) {
                (base, 1)
            } else if let Some(base) = self.pscl3.check_hit(handle.address) {
                (base, 2)
            } else if let Some(base) = self.pscl4.check_hit(handle.address) {
                (base, 3)
            } else if let Some(base) = self.pscl5.check_hit(handle.address) {
                (base, 4)
            } else {
                (self.cr3_addr, 5)
            };
            let next_address =
                base << PAGE_SHIFT | (page_offset(handle.address, level) << 3);

            let mut packet = handle.clone();
            packet.fill_level = down.fill_level(self.lower);
            packet.kind = RequestKind::Translation;
            packet.v_address = handle.address;
            packet.translation_level = level;
            packet.init_translation_level = level;
            packet.address = next_address;
            packet.to_return = vec![Sink::Node(self.id)];

            let rq_index = down.add_rq(self.lower, packet.clone());
            assert!(rq_index > QUEUE_REFUSED);

            // The MSHR keeps the requester's own return path and type.
            let mut entry = packet;
            entry.to_return = handle.to_return.clone();
            entry.kind = handle.kind;
            entry.cycle_enqueued = self.current_cycle;
            entry.event_cycle = u64::MAX;
            self.mshr.push(entry);

            self.rq.pop_front().unwrap();
        }
    }

    /// Advances up to `max_fill` walks whose last table read has returned.
    fn handle_fill(
        &mut self,
        down: &mut Downstream<'_>,
        vmem: &mut VirtualMemory,
        warmup_done: &[bool],
    ) {
        for _ in 0..self.max_fill {
            if self.mshr.first().is_none_or(|m| m.event_cycle > self.current_cycle) {
                break;
            }
            assert!(self.cr3_addr != u64::MAX);

            let v_address = self.mshr[0].v_address;
            let mut level = self.mshr[0].translation_level;

            // Walk down to the current depth. A missing entry is a page
            // fault: the remaining table pages are allocated right here and
            // the walk is complete.
            let cpu = self.cpu;
            let cursor = &mut self.next_translation_virtual_address;
            let mut page: &mut PageTablePage = &mut self.root;
            let mut last_base = u64::MAX;
            let mut faulted = false;
            let mut depth = 5u8;
            while depth > level {
                let offset = page_offset(v_address, depth) as usize;
                if page.next_base[offset] == u64::MAX {
                    Self::handle_page_fault(page, v_address, depth, cursor, vmem, cpu);
                    faulted = true;
                    level = 0;
                    break;
                }
                last_base = page.next_base[offset];
                if depth > 1 {
                    page = page.children[offset].as_mut().expect("interior table page");
                }
                depth -= 1;
            }
            self.mshr[0].translation_level = level;

            if level == 0 {
                // Re-walk read-only, memoizing each level passed through
                // from the starting depth on.
                let init = self.mshr[0].init_translation_level;
                let mut page: &PageTablePage = &self.root;
                for i in (2..=5u8).rev() {
                    let offset = page_offset(v_address, i) as usize;
                    let next_base = page.next_base[offset];
                    assert!(next_base != u64::MAX);
                    if init >= i {
                        match i {
                            5 => self.pscl5.fill(next_base, v_address),
                            4 => self.pscl4.fill(next_base, v_address),
                            3 => self.pscl3.fill(next_base, v_address),
                            _ => self.pscl2.fill(next_base, v_address),
                        }
                    }
                    page = page.children[offset].as_ref().expect("interior table page");
                }
                let leaf = page.next_base[page_offset(v_address, 1) as usize];
                assert!(leaf != u64::MAX);

                let mut entry = self.mshr.remove(0);
                entry.data = leaf;
                entry.address = entry.v_address;
                if warmup_done[entry.cpu] {
                    self.stats.total_miss_latency +=
                        self.current_cycle.saturating_sub(entry.cycle_enqueued);
                }
                for sink in entry.to_return.clone() {
                    down.push_return(sink, entry.clone());
                }
            } else {
                assert!(!faulted);
                let lower_has_room = down.get_occupancy(self.lower, QueueKind::Rq)
                    < down.get_size(self.lower, QueueKind::Rq);
                if lower_has_room {
                    let mut packet = self.mshr[0].clone();
                    packet.kind = RequestKind::Translation;
                    packet.address =
                        last_base << PAGE_SHIFT | (page_offset(v_address, level) << 3);
                    packet.to_return = vec![Sink::Node(self.id)];

                    self.mshr[0].event_cycle = u64::MAX;
                    let rq_index = down.add_rq(self.lower, packet.clone());
                    assert!(rq_index > QUEUE_REFUSED);
                    self.mshr[0].address = packet.address;

                    // Round-robin: completed steps go to the back so other
                    // walks get a turn.
                    let entry = self.mshr.remove(0);
                    self.mshr.push(entry);
                } else {
                    self.stats.rq_full += 1;
                }
            }
        }
    }

    /// Allocates the missing portion of the table below `page` and maps the
    /// data page at the leaf.
    fn handle_page_fault(
        page: &mut PageTablePage,
        v_address: u64,
        pt_level: u8,
        cursor: &mut u64,
        vmem: &mut VirtualMemory,
        cpu: usize,
    ) {
        assert!(pt_level <= 5);
        let mut page = page;
        let mut pt_level = pt_level;
        while pt_level > 1 {
            let offset = page_offset(v_address, pt_level) as usize;
            assert!(page.children[offset].is_none());
            page.children[offset] = Some(Box::new(PageTablePage::new()));
            page.next_base[offset] = Self::map_translation_page(cursor, vmem, cpu);
            page = page.children[offset].as_mut().unwrap();
            pt_level -= 1;
        }
        let offset = page_offset(v_address, 1) as usize;
        assert!(page.next_base[offset] == u64::MAX);
        page.next_base[offset] = vmem.va_to_pa(cpu, v_address) >> PAGE_SHIFT;
    }

    /// Records a completed lower-level read against every matching walk.
    pub fn return_data(&mut self, packet: &Packet) {
        for entry in &mut self.mshr {
            if entry.address == packet.address
                && entry.translation_level == packet.translation_level
            {
                assert!(entry.translation_level > 0);
                entry.translation_level -= 1;
                entry.event_cycle = self.current_cycle;
            }
        }
        self.mshr.sort_by_key(|m| m.event_cycle);
    }

    /// Enqueues a translation request. A second request for a page already
    /// in the queue is an upstream merging bug, not a runtime condition.
    pub fn add_rq(&mut self, packet: Packet) -> i32 {
        assert!(packet.address != 0);
        let duplicate = self
            .rq
            .iter()
            .any(|p| (p.address >> PAGE_SHIFT) == (packet.address >> PAGE_SHIFT));
        assert!(!duplicate, "duplicate translation request");

        if self.rq.is_full() {
            self.stats.rq_full += 1;
            return QUEUE_REFUSED;
        }
        self.stats.rq_access += 1;
        self.stats.rq_to_cache += 1;
        self.rq.push(self.current_cycle, packet);
        -1
    }

    /// Occupancy of the selected queue (the walker has no WQ or PQ).
    pub fn get_occupancy(&self, queue: QueueKind) -> usize {
        match queue {
            QueueKind::Mshr => self.mshr.len(),
            QueueKind::Rq => self.rq.occupancy(),
            _ => 0,
        }
    }

    /// Capacity of the selected queue.
    pub fn get_size(&self, queue: QueueKind) -> usize {
        match queue {
            QueueKind::Mshr => self.mshr_size,
            QueueKind::Rq => self.rq.capacity(),
            _ => 0,
        }
    }

    /// Outstanding walks, for tests and diagnostics.
    pub fn mshr_entries(&self) -> &[Packet] {
        &self.mshr
    }

    /// Zeroes walk statistics at a phase boundary.
    pub fn reset_stats(&mut self) {
        self.stats = PtwStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_offset_extraction() {
        // 9-bit fields starting at bit 12.
        let v = 0x1122_3344_5567_8000u64;
        assert_eq!(page_offset(v, 1), (v >> 12) & 0x1ff);
        assert_eq!(page_offset(v, 5), (v & bitmask(57)) >> 48 & 0x1ff);
    }

    #[test]
    fn test_pscl_hit_after_fill() {
        let mut pscl = PagingStructureCache::new(2, &PsclConfig { sets: 4, ways: 8 });
        let v = 0x0000_7f12_3456_7000u64;
        assert_eq!(pscl.check_hit(v), None);
        pscl.fill(0xbeef, v);
        assert_eq!(pscl.check_hit(v), Some(0xbeef));
        // Same level-2 region, different page offset bits below the index.
        assert_eq!(pscl.check_hit(v | 0x1fff), Some(0xbeef));
    }

    #[test]
    fn test_pscl_levels_use_distinct_prefixes() {
        let mut p5 = PagingStructureCache::new(5, &PsclConfig { sets: 1, ways: 2 });
        let a = 0x0000_8000_0000_0000u64 | (1 << 48);
        let b = a | (1 << 39); // differs only below the level-5 index
        p5.fill(0x1, a);
        assert_eq!(p5.check_hit(b), Some(0x1));

        let mut p4 = PagingStructureCache::new(4, &PsclConfig { sets: 1, ways: 2 });
        p4.fill(0x2, a);
        assert_eq!(p4.check_hit(b), None);
    }
}
