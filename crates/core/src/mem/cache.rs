//! Generic set-associative cache.
//!
//! One `Cache` type serves every level of the hierarchy: configured at page
//! granularity it is a TLB (ITLB/DTLB/STLB, carrying translated page numbers
//! in the packet `data` field), at block granularity an ordinary cache
//! (L1I/L1D/L2C/LLC). It provides:
//! 1. **Bounded queues:** RQ/WQ/PQ with hit-latency gating and back-pressure
//!    (`-2` refusal; the producer retries without losing its request).
//! 2. **MSHR:** misses coalesce by line; a single request goes downstream
//!    and all waiters are released on fill.
//! 3. **Plug-ins:** replacement policy and prefetcher chosen at
//!    construction.
//! 4. **Statistics:** per-CPU per-type hit/miss counters with ROI snapshots,
//!    prefetch counters, and accumulated miss latency.
//!
//! Writes allocate on hit only; a missing write is forwarded to the next
//! level's write queue unchanged, and dirty victims leave as writebacks.

use crate::common::{NUM_REQUEST_TYPES, QUEUE_REFUSED};
use crate::config::{CacheLevelConfig, PrefetcherKind};
use crate::mem::hierarchy::{Downstream, NodeId};
use crate::mem::packet::{Packet, QueueKind, RequestKind, Sink};
use crate::mem::prefetch::{CachePrefetcher, NextLinePrefetcher, NoPrefetcher};
use crate::mem::queue::DelayQueue;
use crate::mem::replacement::{LruPolicy, ReplacementPolicy};

/// One cache line's bookkeeping (no data contents; the model is timing-only).
#[derive(Clone, Debug, Default)]
struct Block {
    valid: bool,
    dirty: bool,
    prefetch: bool,
    tag: u64,
    /// Payload forwarded on hits; meaningful for TLB levels.
    data: u64,
    /// CPU that filled the line, for victim writeback accounting.
    cpu: usize,
}

/// Hit/miss, prefetch, and latency counters for one cache.
pub struct CacheStats {
    /// Hits since the last stats reset, per CPU per request type.
    pub sim_hit: Vec<[u64; NUM_REQUEST_TYPES]>,
    /// Misses since the last stats reset, per CPU per request type.
    pub sim_miss: Vec<[u64; NUM_REQUEST_TYPES]>,
    /// Region-of-interest snapshot of `sim_hit`.
    pub roi_hit: Vec<[u64; NUM_REQUEST_TYPES]>,
    /// Region-of-interest snapshot of `sim_miss`.
    pub roi_miss: Vec<[u64; NUM_REQUEST_TYPES]>,
    /// Prefetch addresses proposed by the prefetcher.
    pub pf_requested: u64,
    /// Prefetches sent downstream.
    pub pf_issued: u64,
    /// Prefetched lines filled into the array.
    pub pf_fill: u64,
    /// Prefetched lines later touched by demand.
    pub pf_useful: u64,
    /// Prefetched lines evicted untouched.
    pub pf_useless: u64,
    /// ROI snapshots of the prefetch counters.
    pub roi_pf_requested: u64,
    pub roi_pf_issued: u64,
    pub roi_pf_fill: u64,
    pub roi_pf_useful: u64,
    pub roi_pf_useless: u64,
    /// Summed (fill cycle - enqueue cycle) over post-warmup misses.
    pub total_miss_latency: u64,
    /// Read-queue traffic counters.
    pub rq_access: u64,
    pub rq_merged: u64,
    pub rq_full: u64,
    /// Write-queue traffic counters.
    pub wq_access: u64,
    pub wq_merged: u64,
    pub wq_full: u64,
    /// Prefetch-queue traffic counters.
    pub pq_access: u64,
    pub pq_full: u64,
}

impl CacheStats {
    fn new(num_cpus: usize) -> Self {
        Self {
            sim_hit: vec![[0; NUM_REQUEST_TYPES]; num_cpus],
            sim_miss: vec![[0; NUM_REQUEST_TYPES]; num_cpus],
            roi_hit: vec![[0; NUM_REQUEST_TYPES]; num_cpus],
            roi_miss: vec![[0; NUM_REQUEST_TYPES]; num_cpus],
            pf_requested: 0,
            pf_issued: 0,
            pf_fill: 0,
            pf_useful: 0,
            pf_useless: 0,
            roi_pf_requested: 0,
            roi_pf_issued: 0,
            roi_pf_fill: 0,
            roi_pf_useful: 0,
            roi_pf_useless: 0,
            total_miss_latency: 0,
            rq_access: 0,
            rq_merged: 0,
            rq_full: 0,
            wq_access: 0,
            wq_merged: 0,
            wq_full: 0,
            pq_access: 0,
            pq_full: 0,
        }
    }

    /// Zeroes every simulation counter (phase boundary).
    pub fn reset(&mut self) {
        let cpus = self.sim_hit.len();
        self.sim_hit = vec![[0; NUM_REQUEST_TYPES]; cpus];
        self.sim_miss = vec![[0; NUM_REQUEST_TYPES]; cpus];
        self.pf_requested = 0;
        self.pf_issued = 0;
        self.pf_fill = 0;
        self.pf_useful = 0;
        self.pf_useless = 0;
        self.total_miss_latency = 0;
    }

    /// Snapshots `cpu`'s counters (and the shared prefetch counters) into
    /// the ROI copies.
    pub fn record_roi(&mut self, cpu: usize) {
        self.roi_hit[cpu] = self.sim_hit[cpu];
        self.roi_miss[cpu] = self.sim_miss[cpu];
        self.roi_pf_requested = self.pf_requested;
        self.roi_pf_issued = self.pf_issued;
        self.roi_pf_fill = self.pf_fill;
        self.roi_pf_useful = self.pf_useful;
        self.roi_pf_useless = self.pf_useless;
    }
}

/// A set-associative cache or TLB level.
pub struct Cache {
    /// Display name ("cpu0_L1D", "LLC", ...).
    pub name: String,
    /// This cache's position in the node arena.
    pub id: NodeId,
    /// Fill-level tag stamped on requests this level originates.
    pub fill_level: u32,
    /// Address bits below the line/page granularity.
    pub offset_bits: u32,
    sets: usize,
    ways: usize,
    blocks: Vec<Block>,
    rq: DelayQueue<Packet>,
    wq: DelayQueue<Packet>,
    pq: DelayQueue<Packet>,
    mshr: Vec<Packet>,
    mshr_size: usize,
    /// Read-queue entries serviced per cycle; also bounds how fast the CPU
    /// side drains this cache's bus.
    pub max_read: usize,
    max_fill: usize,
    lower: NodeId,
    repl: Box<dyn ReplacementPolicy>,
    pref: Box<dyn CachePrefetcher>,
    /// This cache's local cycle count.
    pub current_cycle: u64,
    /// Traffic statistics.
    pub stats: CacheStats,
}

impl Cache {
    /// Builds a cache level.
    ///
    /// `offset_bits` selects the tag granularity: `PAGE_SHIFT` for TLBs,
    /// `BLOCK_SHIFT` for caches. `lower` is the node misses are forwarded to.
    pub fn new(
        name: impl Into<String>,
        cfg: &CacheLevelConfig,
        offset_bits: u32,
        fill_level: u32,
        id: NodeId,
        lower: NodeId,
        num_cpus: usize,
    ) -> Self {
        let mut repl: Box<dyn ReplacementPolicy> = Box::new(LruPolicy::new(cfg.sets, cfg.ways));
        repl.initialize();
        let mut pref: Box<dyn CachePrefetcher> = match cfg.prefetcher {
            PrefetcherKind::None => Box::new(NoPrefetcher),
            PrefetcherKind::NextLine => Box::new(NextLinePrefetcher::new(1 << offset_bits)),
        };
        pref.initialize();
        Self {
            name: name.into(),
            id,
            fill_level,
            offset_bits,
            sets: cfg.sets,
            ways: cfg.ways,
            blocks: vec![Block::default(); cfg.sets * cfg.ways],
            rq: DelayQueue::new(cfg.rq_size, cfg.latency),
            wq: DelayQueue::new(cfg.wq_size, cfg.latency),
            pq: DelayQueue::new(cfg.pq_size, cfg.latency),
            mshr: Vec::with_capacity(cfg.mshr_size),
            mshr_size: cfg.mshr_size,
            max_read: cfg.max_read,
            max_fill: cfg.max_fill,
            lower,
            repl,
            pref,
            current_cycle: 0,
            stats: CacheStats::new(num_cpus),
        }
    }

    #[inline]
    fn line(&self, address: u64) -> u64 {
        address >> self.offset_bits
    }

    #[inline]
    fn set_of(&self, line: u64) -> usize {
        (line as usize) & (self.sets - 1)
    }

    fn find_way(&self, set: usize, line: u64) -> Option<usize> {
        (0..self.ways).find(|&w| {
            let b = &self.blocks[set * self.ways + w];
            b.valid && b.tag == line
        })
    }

    /// Whether `incoming` may coalesce with `existing`.
    ///
    /// Ordinary traffic coalesces by line. Page-walk reads must not: the
    /// walker matches completions by exact address, and two walks may read
    /// different table entries within one line.
    fn can_merge(existing: &Packet, incoming: &Packet, offset_bits: u32) -> bool {
        if existing.kind == RequestKind::Translation
            || incoming.kind == RequestKind::Translation
        {
            existing.address == incoming.address
        } else {
            (existing.address >> offset_bits) == (incoming.address >> offset_bits)
        }
    }

    /// One cycle of cache work, fills first so freed MSHRs can be reused by
    /// reads in the same cycle.
    pub fn operate(&mut self, down: &mut Downstream<'_>, warmup_done: &[bool]) {
        self.current_cycle += 1;
        self.handle_fill(down, warmup_done);
        self.handle_writeback(down);
        self.handle_read(down);
        self.handle_prefetch(down);
    }

    fn handle_fill(&mut self, down: &mut Downstream<'_>, warmup_done: &[bool]) {
        for _ in 0..self.max_fill {
            if self.mshr.first().is_none_or(|m| m.event_cycle > self.current_cycle) {
                break;
            }
            let line = self.line(self.mshr[0].address);
            let set = self.set_of(line);
            let way = (0..self.ways)
                .find(|&w| !self.blocks[set * self.ways + w].valid)
                .unwrap_or_else(|| self.repl.victim(set));

            let victim = self.blocks[set * self.ways + way].clone();
            if victim.valid && victim.dirty {
                let wb = Packet {
                    address: victim.tag << self.offset_bits,
                    v_address: victim.tag << self.offset_bits,
                    kind: RequestKind::Writeback,
                    fill_level: self.fill_level,
                    cpu: victim.cpu,
                    ..Packet::default()
                };
                if down.add_wq(self.lower, wb) == QUEUE_REFUSED {
                    break;
                }
            }
            if victim.valid && victim.prefetch {
                self.stats.pf_useless += 1;
            }

            let entry = self.mshr.remove(0);
            self.blocks[set * self.ways + way] = Block {
                valid: true,
                dirty: false,
                prefetch: entry.kind == RequestKind::Prefetch,
                tag: line,
                data: entry.data,
                cpu: entry.cpu,
            };
            self.repl.update(set, way);
            if entry.kind == RequestKind::Prefetch {
                self.stats.pf_fill += 1;
            }
            self.pref.fill(entry.address, entry.kind == RequestKind::Prefetch);
            if warmup_done[entry.cpu] {
                self.stats.total_miss_latency +=
                    self.current_cycle.saturating_sub(entry.cycle_enqueued);
            }
            for sink in entry.to_return.clone() {
                down.push_return(sink, entry.clone());
            }
        }
    }

    fn handle_writeback(&mut self, down: &mut Downstream<'_>) {
        for _ in 0..self.max_read {
            if !self.wq.has_ready(self.current_cycle) {
                break;
            }
            let pkt_addr = self.wq.front().unwrap().address;
            let line = self.line(pkt_addr);
            let set = self.set_of(line);
            if let Some(way) = self.find_way(set, line) {
                let pkt = self.wq.pop_front().unwrap();
                let block = &mut self.blocks[set * self.ways + way];
                block.dirty = true;
                if block.prefetch {
                    self.stats.pf_useful += 1;
                    block.prefetch = false;
                }
                self.repl.update(set, way);
                self.stats.sim_hit[pkt.cpu][pkt.kind as usize] += 1;
            } else {
                // No allocation on a write miss; pass it down unchanged.
                let mut fwd = self.wq.front().unwrap().clone();
                fwd.to_return.clear();
                if down.add_wq(self.lower, fwd) == QUEUE_REFUSED {
                    break;
                }
                let pkt = self.wq.pop_front().unwrap();
                self.stats.sim_miss[pkt.cpu][pkt.kind as usize] += 1;
            }
        }
    }

    fn handle_read(&mut self, down: &mut Downstream<'_>) {
        for _ in 0..self.max_read {
            if !self.rq.has_ready(self.current_cycle) {
                break;
            }
            let pkt_addr = self.rq.front().unwrap().address;
            let line = self.line(pkt_addr);
            let set = self.set_of(line);

            if let Some(way) = self.find_way(set, line) {
                let mut pkt = self.rq.pop_front().unwrap();
                let block = &mut self.blocks[set * self.ways + way];
                pkt.data = block.data;
                if block.prefetch {
                    self.stats.pf_useful += 1;
                    block.prefetch = false;
                }
                self.repl.update(set, way);
                self.stats.sim_hit[pkt.cpu][pkt.kind as usize] += 1;
                let proposed = self.pref.operate(pkt.address, pkt.ip, true, pkt.kind);
                self.queue_prefetches(proposed, &pkt);
                for sink in pkt.to_return.clone() {
                    down.push_return(sink, pkt.clone());
                }
                continue;
            }

            // Merge into an outstanding miss for the same line.
            let ob = self.offset_bits;
            let front = self.rq.front().unwrap();
            if self.mshr.iter().any(|m| Self::can_merge(m, front, ob)) {
                let pkt = self.rq.pop_front().unwrap();
                self.stats.sim_miss[pkt.cpu][pkt.kind as usize] += 1;
                let entry = self
                    .mshr
                    .iter_mut()
                    .find(|m| Self::can_merge(m, &pkt, ob))
                    .unwrap();
                entry.absorb(pkt);
                continue;
            }

            if self.mshr.len() >= self.mshr_size {
                break;
            }
            let mut fwd = self.rq.front().unwrap().clone();
            fwd.to_return = vec![Sink::Node(self.id)];
            fwd.instr_depend_on_me.clear();
            fwd.lq_depend_on_me.clear();
            fwd.sq_depend_on_me.clear();
            if down.add_rq(self.lower, fwd) == QUEUE_REFUSED {
                break;
            }
            let mut entry = self.rq.pop_front().unwrap();
            self.stats.sim_miss[entry.cpu][entry.kind as usize] += 1;
            let proposed = self.pref.operate(entry.address, entry.ip, false, entry.kind);
            self.queue_prefetches(proposed, &entry);
            entry.cycle_enqueued = self.current_cycle;
            entry.event_cycle = u64::MAX;
            self.mshr.push(entry);
        }
    }

    fn handle_prefetch(&mut self, down: &mut Downstream<'_>) {
        for _ in 0..self.max_read {
            if !self.pq.has_ready(self.current_cycle) {
                break;
            }
            let pkt_addr = self.pq.front().unwrap().address;
            let line = self.line(pkt_addr);
            let set = self.set_of(line);
            if self.find_way(set, line).is_some() {
                self.pq.pop_front().unwrap();
                continue;
            }
            let ob = self.offset_bits;
            let front = self.pq.front().unwrap();
            if self.mshr.iter().any(|m| Self::can_merge(m, front, ob)) {
                let pkt = self.pq.pop_front().unwrap();
                let entry = self
                    .mshr
                    .iter_mut()
                    .find(|m| Self::can_merge(m, &pkt, ob))
                    .unwrap();
                entry.absorb(pkt);
                continue;
            }
            if self.mshr.len() >= self.mshr_size {
                break;
            }
            let mut fwd = self.pq.front().unwrap().clone();
            fwd.kind = RequestKind::Prefetch;
            fwd.to_return = vec![Sink::Node(self.id)];
            if down.add_rq(self.lower, fwd) == QUEUE_REFUSED {
                break;
            }
            let mut entry = self.pq.pop_front().unwrap();
            self.stats.sim_miss[entry.cpu][RequestKind::Prefetch as usize] += 1;
            self.stats.pf_issued += 1;
            entry.cycle_enqueued = self.current_cycle;
            entry.event_cycle = u64::MAX;
            self.mshr.push(entry);
        }
    }

    /// Pushes prefetcher-proposed addresses into the local prefetch queue.
    fn queue_prefetches(&mut self, addresses: Vec<u64>, trigger: &Packet) {
        for address in addresses {
            self.stats.pf_requested += 1;
            let pkt = Packet {
                address,
                v_address: address,
                kind: RequestKind::Prefetch,
                fill_level: self.fill_level,
                cpu: trigger.cpu,
                ip: trigger.ip,
                ..Packet::default()
            };
            if !self.pq.push(self.current_cycle, pkt) {
                self.stats.pq_full += 1;
            }
        }
    }

    /// Accepts a completion from the level below: releases every MSHR entry
    /// waiting on the returned line, then reorders completions first.
    ///
    /// Matching follows the same rule as coalescing: ordinary traffic by
    /// line, page-walk reads by exact address. Same-line translation
    /// entries have their own downstream requests in flight; completing
    /// them here would hand the walker another entry's data.
    pub fn return_data(&mut self, packet: &Packet) {
        let ob = self.offset_bits;
        for entry in self
            .mshr
            .iter_mut()
            .filter(|m| Self::can_merge(m, packet, ob))
        {
            entry.data = packet.data;
            entry.event_cycle = self.current_cycle;
        }
        self.mshr.sort_by_key(|m| m.event_cycle);
    }

    /// Enqueues a demand read. Coalesces with an in-queue request to the
    /// same line; refuses with `-2` when full.
    pub fn add_rq(&mut self, packet: Packet) -> i32 {
        self.stats.rq_access += 1;
        let ob = self.offset_bits;
        if let Some(entry) = self
            .rq
            .iter_mut()
            .find(|p| Self::can_merge(p, &packet, ob))
        {
            entry.absorb(packet);
            self.stats.rq_merged += 1;
            return 0;
        }
        if self.rq.is_full() {
            self.stats.rq_full += 1;
            return QUEUE_REFUSED;
        }
        let index = self.rq.occupancy() as i32;
        self.rq.push(self.current_cycle, packet);
        index
    }

    /// Enqueues a write. Same coalescing and refusal rules as `add_rq`.
    pub fn add_wq(&mut self, packet: Packet) -> i32 {
        self.stats.wq_access += 1;
        let ob = self.offset_bits;
        let line = packet.address >> ob;
        if let Some(entry) = self.wq.iter_mut().find(|p| (p.address >> ob) == line) {
            entry.absorb(packet);
            self.stats.wq_merged += 1;
            return 0;
        }
        if self.wq.is_full() {
            self.stats.wq_full += 1;
            return QUEUE_REFUSED;
        }
        let index = self.wq.occupancy() as i32;
        self.wq.push(self.current_cycle, packet);
        index
    }

    /// Enqueues an externally-generated prefetch (the front end's code
    /// prefetches arrive here).
    pub fn add_pq(&mut self, packet: Packet) -> i32 {
        self.stats.pq_access += 1;
        self.stats.pf_requested += 1;
        if self.pq.is_full() {
            self.stats.pq_full += 1;
            return QUEUE_REFUSED;
        }
        let index = self.pq.occupancy() as i32;
        self.pq.push(self.current_cycle, packet);
        index
    }

    /// Occupancy of the selected queue.
    pub fn get_occupancy(&self, queue: QueueKind) -> usize {
        match queue {
            QueueKind::Mshr => self.mshr.len(),
            QueueKind::Rq => self.rq.occupancy(),
            QueueKind::Wq => self.wq.occupancy(),
            QueueKind::Pq => self.pq.occupancy(),
        }
    }

    /// Capacity of the selected queue.
    pub fn get_size(&self, queue: QueueKind) -> usize {
        match queue {
            QueueKind::Mshr => self.mshr_size,
            QueueKind::Rq => self.rq.capacity(),
            QueueKind::Wq => self.wq.capacity(),
            QueueKind::Pq => self.pq.capacity(),
        }
    }

    /// Lets the front end feed branch outcomes to a code prefetcher.
    /// Returns the addresses the prefetcher wants fetched; the caller
    /// injects them through `add_pq`.
    pub fn prefetcher_branch_operate(
        &mut self,
        ip: u64,
        kind: crate::instr::BranchKind,
        predicted_target: u64,
    ) -> Vec<u64> {
        self.pref.branch_operate(ip, kind, predicted_target)
    }

    /// Zeroes simulation counters at a phase boundary.
    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// MSHR contents, for the deadlock diagnostic dump.
    pub fn mshr_entries(&self) -> &[Packet] {
        &self.mshr
    }

    /// Prints the plug-in hooks' final statistics.
    pub fn final_stats(&self) {
        self.pref.final_stats(&self.name);
        self.repl.final_stats(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BLOCK_SHIFT, FILL_L1};

    fn test_cache() -> Cache {
        Cache::new(
            "L1D",
            &CacheLevelConfig::default(),
            BLOCK_SHIFT,
            FILL_L1,
            0,
            1,
            1,
        )
    }

    fn translation_packet(address: u64) -> Packet {
        Packet {
            address,
            v_address: address,
            kind: RequestKind::Translation,
            translation_level: 2,
            event_cycle: u64::MAX,
            ..Packet::default()
        }
    }

    #[test]
    fn test_translation_return_completes_exact_address_only() {
        let mut cache = test_cache();
        // Two walks read different table entries within one cache line;
        // each has its own downstream request outstanding.
        cache.mshr.push(translation_packet(0x1000));
        cache.mshr.push(translation_packet(0x1008));
        cache.current_cycle = 10;

        cache.return_data(&translation_packet(0x1000));

        let completed: Vec<u64> = cache
            .mshr
            .iter()
            .filter(|m| m.event_cycle <= 10)
            .map(|m| m.address)
            .collect();
        assert_eq!(completed, vec![0x1000]);
        let waiting = cache.mshr.iter().find(|m| m.address == 0x1008).unwrap();
        assert_eq!(waiting.event_cycle, u64::MAX);
    }

    #[test]
    fn test_demand_return_completes_by_line() {
        let mut cache = test_cache();
        let mut load = Packet {
            address: 0x2000,
            kind: RequestKind::Load,
            event_cycle: u64::MAX,
            ..Packet::default()
        };
        load.cycle_enqueued = 1;
        cache.mshr.push(load);
        cache.current_cycle = 10;

        // The lower level answers with the first requester's byte address;
        // any waiter on the same line is released.
        cache.return_data(&Packet {
            address: 0x2010,
            kind: RequestKind::Load,
            ..Packet::default()
        });
        assert_eq!(cache.mshr[0].event_cycle, 10);
    }

    #[test]
    fn test_external_prefetch_enters_the_prefetch_queue() {
        let mut cache = test_cache();
        let packet = Packet {
            address: 0x3000,
            v_address: 0x3000,
            kind: RequestKind::Prefetch,
            fill_level: FILL_L1,
            ..Packet::default()
        };
        assert!(cache.add_pq(packet) > QUEUE_REFUSED);
        assert_eq!(cache.get_occupancy(QueueKind::Pq), 1);
        assert_eq!(cache.stats.pf_requested, 1);
    }
}
