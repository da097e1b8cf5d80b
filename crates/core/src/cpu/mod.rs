//! The out-of-order core.
//!
//! Each simulated CPU is a [`Core`]: buffered front-end stages (fetch,
//! decode, dispatch), a reorder buffer, load/store queues with
//! store-to-load forwarding, and branch-prediction bookkeeping. A cycle
//! runs the stages in reverse dataflow order — retire first, fetch last —
//! so data moves at most one stage per cycle:
//!
//! retire → complete → execute → schedule → memory-return → LSQ →
//! memory-schedule → dispatch → decode → promote → fetch → translate →
//! DIB check.
//!
//! The core talks to its private ITLB/DTLB/L1I/L1D through bounded queues
//! and polls one [`CacheBus`] per cache for completions. All references to
//! ROB and LSQ entries held by packets are `(slot, id)` handles validated on
//! return; stale completions are dropped silently.

/// Decoded instruction buffer.
pub mod dib;
/// Load/store queue slot pools.
pub mod lsq;
/// Reorder buffer ring.
pub mod rob;

use std::collections::VecDeque;

use crate::bpred::{self, BranchPredictor, Btb};
use crate::common::{
    BLOCK_SHIFT, DEADLOCK_CYCLE, FILL_L1, NUM_BRANCH_KINDS, PAGE_SHIFT, QUEUE_REFUSED, splice_bits,
};
use crate::config::CoreConfig;
use crate::cpu::dib::Dib;
use crate::cpu::lsq::{Lsq, LsqEntry, LsqRef};
use crate::cpu::rob::Rob;
use crate::instr::{
    BranchKind, Instruction, Progress, REG_FLAGS, REG_INSTRUCTION_POINTER, REG_STACK_POINTER,
    RobRef,
};
use crate::mem::hierarchy::{NodeId, Uncore};
use crate::mem::packet::{BusKind, CacheBus, Packet, RequestKind, Sink};
use crate::mem::queue::DelayQueue;

/// Store destinations per instruction; bounds the STA FIFO.
const MAX_INSTR_DESTINATIONS: usize = 4;

/// Node ids of the caches a core talks to directly.
#[derive(Clone, Copy)]
pub struct CoreNodes {
    /// Instruction TLB.
    pub itlb: NodeId,
    /// Data TLB.
    pub dtlb: NodeId,
    /// L1 instruction cache.
    pub l1i: NodeId,
    /// L1 data cache.
    pub l1d: NodeId,
}

/// Per-core branch bookkeeping.
#[derive(Default)]
pub struct CoreStats {
    /// Branches seen at trace intake.
    pub num_branch: u64,
    /// Branches whose predicted target disagreed with the trace.
    pub branch_mispredictions: u64,
    /// Summed ROB occupancy sampled at each misprediction.
    pub total_rob_occupancy_at_branch_mispredict: u64,
    /// Instructions per branch kind.
    pub total_branch_types: [u64; NUM_BRANCH_KINDS],
    /// Mispredictions per branch kind.
    pub branch_type_misses: [u64; NUM_BRANCH_KINDS],
}

/// One out-of-order CPU.
pub struct Core {
    /// This core's index.
    pub cpu: usize,
    /// Local cycle count.
    pub current_cycle: u64,
    cfg: CoreConfig,
    nodes: CoreNodes,

    /// Instructions read from the trace, awaiting translation and fetch.
    pub ifetch_buffer: VecDeque<Instruction>,
    decode_buffer: DelayQueue<Instruction>,
    dispatch_buffer: DelayQueue<Instruction>,
    /// Reorder buffer.
    pub rob: Rob,
    /// Load queue.
    pub lq: Lsq,
    /// Store queue.
    pub sq: Lsq,
    /// Store-address FIFO enforcing program-order SQ allocation.
    pub sta: VecDeque<u64>,

    rtl0: VecDeque<LsqRef>,
    rtl1: VecDeque<LsqRef>,
    rts0: VecDeque<LsqRef>,
    rts1: VecDeque<LsqRef>,
    ready_to_execute: VecDeque<RobRef>,

    /// Decoded instruction buffer.
    pub dib: Dib,
    predictor: Box<dyn BranchPredictor>,
    btb: Box<dyn Btb>,

    /// ITLB return conduit.
    pub itlb_bus: CacheBus,
    /// L1I return conduit.
    pub l1i_bus: CacheBus,
    /// DTLB return conduit.
    pub dtlb_bus: CacheBus,
    /// L1D return conduit.
    pub l1d_bus: CacheBus,

    /// Fetch is stalled on an unresolved misprediction.
    pub fetch_stall: bool,
    /// Cycle at which a stalled fetch resumes (zero = not armed).
    pub fetch_resume_cycle: u64,
    /// Trace-intake budget remaining this cycle.
    pub instrs_to_read_this_cycle: u64,

    next_instr_id: u64,
    /// Instructions retired so far.
    pub num_retired: u64,
    /// Retire count at the start of the current phase.
    pub begin_phase_instr: u64,
    /// Cycle count at the start of the current phase.
    pub begin_phase_cycle: u64,
    /// Retire count when this core finished the current phase.
    pub finish_phase_instr: u64,
    /// Cycle count when this core finished the current phase.
    pub finish_phase_cycle: u64,

    /// Branch statistics.
    pub stats: CoreStats,
}

impl Core {
    /// Builds a core wired to its private caches.
    pub fn new(cpu: usize, cfg: &CoreConfig, nodes: CoreNodes) -> Self {
        Self {
            cpu,
            current_cycle: 0,
            cfg: cfg.clone(),
            nodes,
            ifetch_buffer: VecDeque::with_capacity(cfg.ifetch_buffer_size),
            decode_buffer: DelayQueue::new(cfg.decode_buffer_size, cfg.decode_latency),
            dispatch_buffer: DelayQueue::new(cfg.dispatch_buffer_size, cfg.dispatch_latency),
            rob: Rob::new(cfg.rob_size),
            lq: Lsq::new(cfg.lq_size),
            sq: Lsq::new(cfg.sq_size),
            sta: VecDeque::new(),
            rtl0: VecDeque::new(),
            rtl1: VecDeque::new(),
            rts0: VecDeque::new(),
            rts1: VecDeque::new(),
            ready_to_execute: VecDeque::new(),
            dib: Dib::new(cfg.dib_window, cfg.dib_sets, cfg.dib_ways),
            predictor: bpred::build_predictor(cfg),
            btb: bpred::build_btb(cfg),
            itlb_bus: CacheBus::default(),
            l1i_bus: CacheBus::default(),
            dtlb_bus: CacheBus::default(),
            l1d_bus: CacheBus::default(),
            fetch_stall: false,
            fetch_resume_cycle: 0,
            instrs_to_read_this_cycle: 0,
            next_instr_id: 0,
            num_retired: 0,
            begin_phase_instr: 0,
            begin_phase_cycle: 0,
            finish_phase_instr: 0,
            finish_phase_cycle: 0,
            stats: CoreStats::default(),
        }
    }

    /// The return bus for `kind`.
    pub fn bus_mut(&mut self, kind: BusKind) -> &mut CacheBus {
        match kind {
            BusKind::Itlb => &mut self.itlb_bus,
            BusKind::L1i => &mut self.l1i_bus,
            BusKind::Dtlb => &mut self.dtlb_bus,
            BusKind::L1d => &mut self.l1d_bus,
        }
    }

    /// One core cycle, stages in reverse dataflow order. Returns true when
    /// the deadlock watchdog trips.
    pub fn operate(&mut self, uncore: &mut Uncore, warmup_done: bool) -> bool {
        self.current_cycle += 1;
        self.instrs_to_read_this_cycle = if self.fetch_stall {
            0
        } else {
            self.cfg
                .fetch_width
                .min(self.cfg.ifetch_buffer_size - self.ifetch_buffer.len())
                as u64
        };

        self.retire_rob(uncore);
        self.complete_inflight_instructions();
        self.execute_instructions(warmup_done);
        self.schedule_instructions(warmup_done);
        self.handle_memory_return(uncore);
        self.operate_lsq(uncore);
        self.schedule_memory_instructions();
        self.dispatch_instructions();
        self.decode_instructions(warmup_done);
        self.promote_to_decode(warmup_done);
        self.fetch_instructions(uncore);
        self.translate_fetch(uncore);
        self.check_dib();

        self.rob
            .front()
            .is_some_and(|f| f.ip != 0 && f.event_cycle + DEADLOCK_CYCLE <= self.current_cycle)
    }

    // ------------------------------------------------------------------
    // Trace intake
    // ------------------------------------------------------------------

    /// Accepts one architectural instruction from the trace: classifies its
    /// branch behavior, folds static stack-pointer writes, consults the
    /// predictors, and appends it to the fetch buffer.
    pub fn init_instruction(
        &mut self,
        mut instr: Instruction,
        warmup_done: bool,
        uncore: &mut Uncore,
    ) {
        self.instrs_to_read_this_cycle = self.instrs_to_read_this_cycle.saturating_sub(1);
        instr.id = self.next_instr_id;

        let writes_sp = instr.destination_registers.contains(&REG_STACK_POINTER);
        let writes_ip = instr
            .destination_registers
            .contains(&REG_INSTRUCTION_POINTER);
        let reads_sp = instr.source_registers.contains(&REG_STACK_POINTER);
        let reads_flags = instr.source_registers.contains(&REG_FLAGS);
        let reads_ip = instr.source_registers.contains(&REG_INSTRUCTION_POINTER);
        let reads_other = instr.source_registers.iter().any(|&r| {
            r != REG_STACK_POINTER && r != REG_FLAGS && r != REG_INSTRUCTION_POINTER
        });

        for _ in 0..instr.destination_memory.len() {
            self.sta.push_back(instr.id);
        }
        assert!(self.sta.len() <= self.rob.capacity() * MAX_INSTR_DESTINATIONS);

        instr.num_reg_ops =
            (instr.source_registers.len() + instr.destination_registers.len()) as u32;
        instr.num_mem_ops =
            (instr.source_memory.len() + instr.destination_memory.len()) as u32;
        if instr.num_mem_ops > 0 {
            instr.is_memory = true;
        }

        // Classify the branch; the first matching pattern wins.
        if !reads_sp && !reads_flags && writes_ip && !reads_other {
            instr.is_branch = true;
            instr.branch_taken = true;
            instr.branch_kind = BranchKind::DirectJump;
        } else if !reads_sp && !reads_flags && writes_ip && reads_other {
            instr.is_branch = true;
            instr.branch_taken = true;
            instr.branch_kind = BranchKind::Indirect;
        } else if !reads_sp && reads_ip && !writes_sp && writes_ip && reads_flags && !reads_other {
            instr.is_branch = true;
            // taken comes from the trace
            instr.branch_kind = BranchKind::Conditional;
        } else if reads_sp && reads_ip && writes_sp && writes_ip && !reads_flags && !reads_other {
            instr.is_branch = true;
            instr.branch_taken = true;
            instr.branch_kind = BranchKind::DirectCall;
        } else if reads_sp && reads_ip && writes_sp && writes_ip && !reads_flags && reads_other {
            instr.is_branch = true;
            instr.branch_taken = true;
            instr.branch_kind = BranchKind::IndirectCall;
        } else if reads_sp && !reads_ip && writes_sp && writes_ip {
            instr.is_branch = true;
            instr.branch_taken = true;
            instr.branch_kind = BranchKind::Return;
        } else if writes_ip {
            instr.is_branch = true;
            // taken comes from the trace
            instr.branch_kind = BranchKind::Other;
        }

        self.stats.total_branch_types[instr.branch_kind as usize] += 1;

        if !instr.is_branch || !instr.branch_taken {
            instr.branch_target = 0;
        }

        // Stack-pointer folding: the new stack pointer of a call, return,
        // push, or pop is known at decode, so the write does not join the
        // register dependence graph. A variable-sized adjustment
        // (reads_other) cannot be folded.
        if writes_sp && (instr.is_branch || instr.num_mem_ops > 0 || !reads_other) {
            if let Some(pos) = instr
                .destination_registers
                .iter()
                .position(|&r| r == REG_STACK_POINTER)
            {
                instr.destination_registers.remove(pos);
                instr.num_reg_ops -= 1;
            }
        }

        if instr.is_branch {
            self.stats.num_branch += 1;

            let (mut predicted_target, always_taken) =
                self.btb.prediction(instr.ip, instr.branch_kind);
            let predicted_taken = self.predictor.predict(
                instr.ip,
                predicted_target,
                always_taken,
                instr.branch_kind,
            );
            if !predicted_taken && !always_taken {
                predicted_target = 0;
            }

            let code_prefetches = uncore.cache_mut(self.nodes.l1i).prefetcher_branch_operate(
                instr.ip,
                instr.branch_kind,
                predicted_target,
            );
            for pf_v_addr in code_prefetches {
                self.prefetch_code_line(uncore, pf_v_addr);
            }

            if predicted_target != instr.branch_target {
                self.stats.branch_mispredictions += 1;
                self.stats.total_rob_occupancy_at_branch_mispredict +=
                    self.rob.occupancy() as u64;
                self.stats.branch_type_misses[instr.branch_kind as usize] += 1;
                if warmup_done {
                    self.fetch_stall = true;
                    self.instrs_to_read_this_cycle = 0;
                    instr.branch_mispredicted = true;
                }
            } else if instr.branch_taken {
                // Correctly predicted taken still ends the fetch block.
                self.instrs_to_read_this_cycle = 0;
            }

            self.btb.update(
                instr.ip,
                instr.branch_target,
                instr.branch_taken,
                instr.branch_kind,
            );
            self.predictor.last_result(
                instr.ip,
                instr.branch_target,
                instr.branch_taken,
                instr.branch_kind,
            );
        }

        instr.event_cycle = self.current_cycle;

        // Fast warmup: register dependences are disabled while predictors,
        // caches, and prefetchers keep training.
        if !warmup_done {
            instr.source_registers.clear();
            instr.destination_registers.clear();
            instr.num_reg_ops = 0;
        }

        debug_assert!(self.ifetch_buffer.len() < self.cfg.ifetch_buffer_size);
        self.ifetch_buffer.push_back(instr);
        self.next_instr_id += 1;
    }

    /// Injects one code prefetch into the L1I prefetch queue. A refused
    /// insertion drops the prefetch; it is a hint, not a demand.
    fn prefetch_code_line(&mut self, uncore: &mut Uncore, pf_v_addr: u64) {
        let packet = Packet {
            fill_level: FILL_L1,
            cpu: self.cpu,
            address: pf_v_addr,
            v_address: pf_v_addr,
            ip: pf_v_addr,
            kind: RequestKind::Prefetch,
            ..Packet::default()
        };
        uncore.add_pq(self.nodes.l1i, packet);
    }

    // ------------------------------------------------------------------
    // Fetch path
    // ------------------------------------------------------------------

    /// Probes the DIB for the fetch-buffer head window.
    fn check_dib(&mut self) {
        let limit = self.cfg.fetch_width.min(self.ifetch_buffer.len());
        for idx in 0..limit {
            let ip = self.ifetch_buffer[idx].ip;
            if self.dib.check(ip) {
                let instr = &mut self.ifetch_buffer[idx];
                instr.translated = Progress::Completed;
                instr.fetched = Progress::Completed;
                instr.decoded = Progress::Completed;
                instr.event_cycle = self.current_cycle;
            }
        }
    }

    /// Issues one ITLB read for the first untranslated page run.
    ///
    /// All fetch-buffer entries on the run's page coalesce onto the single
    /// request. The run is only issued when it is bounded inside the buffer
    /// or starts at the head.
    fn translate_fetch(&mut self, uncore: &mut Uncore) {
        if self.ifetch_buffer.is_empty() {
            return;
        }
        let Some(begin) = self
            .ifetch_buffer
            .iter()
            .position(|x| x.translated == Progress::Pending)
        else {
            return;
        };
        let page = self.ifetch_buffer[begin].ip >> PAGE_SHIFT;
        let end = (begin..self.ifetch_buffer.len())
            .find(|&i| self.ifetch_buffer[i].ip >> PAGE_SHIFT != page)
            .unwrap_or(self.ifetch_buffer.len());
        if end == self.ifetch_buffer.len() && begin != 0 {
            return;
        }

        let first = &self.ifetch_buffer[begin];
        let mut packet = Packet {
            fill_level: uncore.cache(self.nodes.itlb).fill_level,
            cpu: self.cpu,
            address: first.ip,
            v_address: first.ip,
            instr_id: first.id,
            ip: first.ip,
            kind: RequestKind::Load,
            to_return: vec![Sink::CoreBus(self.cpu, BusKind::Itlb)],
            ..Packet::default()
        };
        for i in begin..end {
            packet
                .instr_depend_on_me
                .push_back(self.ifetch_buffer[i].id);
        }

        if uncore.add_rq(self.nodes.itlb, packet) != QUEUE_REFUSED {
            for i in begin..end {
                let instr = &mut self.ifetch_buffer[i];
                if instr.translated == Progress::Pending {
                    instr.translated = Progress::Inflight;
                }
            }
        }
    }

    /// Clears an expired fetch stall, then issues one L1I read for the
    /// first translated-but-unfetched cache-block run.
    fn fetch_instructions(&mut self, uncore: &mut Uncore) {
        if self.fetch_stall && self.fetch_resume_cycle != 0
            && self.current_cycle >= self.fetch_resume_cycle
        {
            self.fetch_stall = false;
            self.fetch_resume_cycle = 0;
        }

        if self.ifetch_buffer.is_empty() {
            return;
        }
        let Some(begin) = self.ifetch_buffer.iter().position(|x| {
            x.translated == Progress::Completed && x.fetched == Progress::Pending
        }) else {
            return;
        };
        let block = self.ifetch_buffer[begin].instruction_pa >> BLOCK_SHIFT;
        let end = (begin..self.ifetch_buffer.len())
            .find(|&i| self.ifetch_buffer[i].instruction_pa >> BLOCK_SHIFT != block)
            .unwrap_or(self.ifetch_buffer.len());
        if end == self.ifetch_buffer.len() && begin != 0 {
            return;
        }

        let first = &self.ifetch_buffer[begin];
        let mut packet = Packet {
            fill_level: uncore.cache(self.nodes.l1i).fill_level,
            cpu: self.cpu,
            address: first.instruction_pa,
            data: first.instruction_pa,
            v_address: first.ip,
            instr_id: first.id,
            ip: first.ip,
            kind: RequestKind::Load,
            to_return: vec![Sink::CoreBus(self.cpu, BusKind::L1i)],
            ..Packet::default()
        };
        for i in begin..end {
            packet
                .instr_depend_on_me
                .push_back(self.ifetch_buffer[i].id);
        }

        if uncore.add_rq(self.nodes.l1i, packet) != QUEUE_REFUSED {
            for i in begin..end {
                let instr = &mut self.ifetch_buffer[i];
                if instr.fetched == Progress::Pending {
                    instr.fetched = Progress::Inflight;
                }
            }
        }
    }

    /// Moves fully fetched heads into the decode buffer.
    fn promote_to_decode(&mut self, warmup_done: bool) {
        let mut bandwidth = self.cfg.fetch_width;
        while bandwidth > 0
            && !self.decode_buffer.is_full()
            && self.ifetch_buffer.front().is_some_and(|f| {
                f.translated == Progress::Completed && f.fetched == Progress::Completed
            })
        {
            let instr = self.ifetch_buffer.pop_front().unwrap();
            if !warmup_done || instr.decoded.started() {
                self.decode_buffer.push_ready(self.current_cycle, instr);
            } else {
                self.decode_buffer.push(self.current_cycle, instr);
            }
            bandwidth -= 1;
        }
    }

    /// Decodes ready instructions into the dispatch buffer, updating the
    /// DIB and resuming fetch for decode-detected mispredictions.
    fn decode_instructions(&mut self, warmup_done: bool) {
        let mut bandwidth = self.cfg.decode_width;
        while bandwidth > 0
            && self.decode_buffer.has_ready(self.current_cycle)
            && !self.dispatch_buffer.is_full()
        {
            let mut instr = self.decode_buffer.pop_ready(self.current_cycle).unwrap();
            self.dib.update(instr.ip);

            // Direct jumps and calls have their target known here, so the
            // misprediction is repaired at decode instead of execute.
            if instr.branch_mispredicted
                && matches!(
                    instr.branch_kind,
                    BranchKind::DirectJump | BranchKind::DirectCall
                )
            {
                instr.branch_mispredicted = false;
                self.fetch_resume_cycle =
                    self.current_cycle + self.cfg.branch_mispredict_penalty;
            }

            if warmup_done {
                self.dispatch_buffer.push(self.current_cycle, instr);
            } else {
                self.dispatch_buffer.push_ready(self.current_cycle, instr);
            }
            bandwidth -= 1;
        }
    }

    /// Moves ready dispatch-buffer heads into the ROB.
    fn dispatch_instructions(&mut self) {
        let mut bandwidth = self.cfg.dispatch_width;
        while bandwidth > 0
            && self.dispatch_buffer.has_ready(self.current_cycle)
            && !self.rob.is_full()
        {
            let instr = self.dispatch_buffer.pop_ready(self.current_cycle).unwrap();
            self.rob.push_back(instr).unwrap();
            bandwidth -= 1;
        }
    }

    // ------------------------------------------------------------------
    // Scheduling and execution
    // ------------------------------------------------------------------

    /// Resolves register dependences for unscheduled ROB entries, oldest
    /// first. Bandwidth is counted against not-yet-executed entries.
    fn schedule_instructions(&mut self, warmup_done: bool) {
        let mut search_bandwidth = self.cfg.scheduler_size;
        for slot in self.rob.slots() {
            if search_bandwidth == 0 {
                break;
            }
            let entry = self.rob.get(slot).unwrap();
            let executed_pending = entry.executed == Progress::Pending;
            if entry.scheduled == Progress::Pending {
                self.do_scheduling(slot, warmup_done);

                let entry = self.rob.get(slot).unwrap();
                if entry.scheduled == Progress::Completed && entry.num_reg_dependent == 0 {
                    assert!(self.ready_to_execute.len() < self.rob.capacity());
                    self.ready_to_execute.push_back(RobRef {
                        slot,
                        id: entry.id,
                    });
                }
            }
            if executed_pending {
                search_bandwidth -= 1;
            }
        }
    }

    /// Links this entry to the most recent uncompleted producer of each of
    /// its source registers.
    fn do_scheduling(&mut self, slot: usize, warmup_done: bool) {
        let me = RobRef {
            slot,
            id: self.rob.get(slot).unwrap().id,
        };
        let source_registers = self.rob.get(slot).unwrap().source_registers.clone();
        for reg in source_registers {
            let prior = self.rob.slots_before(slot).find(|&s| {
                let e = self.rob.get(s).unwrap();
                e.executed != Progress::Completed && e.destination_registers.contains(&reg)
            });
            if let Some(producer_slot) = prior {
                let producer = self.rob.get_mut(producer_slot).unwrap();
                if producer.reg_dependents.last() != Some(&me) {
                    producer.reg_dependents.push(me);
                    self.rob.get_mut(slot).unwrap().num_reg_dependent += 1;
                }
            }
        }

        let entry = self.rob.get_mut(slot).unwrap();
        if entry.is_memory {
            entry.scheduled = Progress::Inflight;
        } else {
            entry.scheduled = Progress::Completed;
            entry.event_cycle = self.current_cycle
                + if warmup_done {
                    self.cfg.scheduling_latency
                } else {
                    0
                };
        }
    }

    /// Issues ready non-memory instructions to the execution units.
    fn execute_instructions(&mut self, warmup_done: bool) {
        for _ in 0..self.cfg.exec_width {
            let Some(r) = self.ready_to_execute.pop_front() else {
                break;
            };
            if let Some(entry) = self.rob.resolve_mut(r) {
                entry.executed = Progress::Inflight;
                entry.event_cycle = self.current_cycle
                    + if warmup_done { self.cfg.exec_latency } else { 0 };
            }
        }
    }

    /// Walks register-ready memory instructions through LSQ allocation and
    /// store-to-load forwarding.
    fn schedule_memory_instructions(&mut self) {
        let mut search_bandwidth = self.cfg.scheduler_size;
        for slot in self.rob.slots() {
            if search_bandwidth == 0 {
                break;
            }
            let entry = self.rob.get(slot).unwrap();
            let executed_pending = entry.executed == Progress::Pending;
            if entry.is_memory
                && entry.num_reg_dependent == 0
                && entry.scheduled == Progress::Inflight
            {
                self.do_memory_scheduling(slot);
            }
            if executed_pending {
                search_bandwidth -= 1;
            }
        }
    }

    fn do_memory_scheduling(&mut self, slot: usize) {
        let me = RobRef {
            slot,
            id: self.rob.get(slot).unwrap().id,
        };

        // Loads: each source operand is satisfied from the SQ, deferred to
        // an in-flight producer store, or given a load-queue slot.
        let num_sources = self.rob.get(slot).unwrap().source_memory.len();
        for i in 0..num_sources {
            let op = &self.rob.get(slot).unwrap().source_memory[i];
            let (address, added, will_forward) = (op.address, op.added, op.will_forward);
            if added || will_forward {
                continue;
            }

            let forwarded = self
                .sq
                .entries()
                .iter()
                .any(|s| s.fetched == Progress::Completed && s.virtual_address == address);
            if forwarded {
                let entry = self.rob.get_mut(slot).unwrap();
                assert!(entry.num_mem_ops > 0);
                entry.num_mem_ops -= 1;
                entry.event_cycle = self.current_cycle;
                entry.source_memory[i].added = true;
                continue;
            }

            // The producer may not be in the SQ yet; record the RAW in the
            // ROB so the store forwards when it executes.
            let prior = self.rob.slots_before(slot).find(|&s| {
                self.rob
                    .get(s)
                    .unwrap()
                    .destination_memory
                    .iter()
                    .any(|d| d.address == address)
            });
            if let Some(producer_slot) = prior {
                self.rob
                    .get_mut(producer_slot)
                    .unwrap()
                    .mem_dependents
                    .push(me);
                self.rob.get_mut(slot).unwrap().source_memory[i].will_forward = true;
                continue;
            }

            if let Some(lq_slot) = self.lq.find_free() {
                let entry = self.rob.get(slot).unwrap();
                let (id, ip, asid) = (entry.id, entry.ip, entry.asid);
                *self.lq.at_mut(lq_slot) = LsqEntry {
                    instr_id: id,
                    virtual_address: address,
                    physical_address: 0,
                    ip,
                    asid,
                    rob: Some(me),
                    translated: Progress::Pending,
                    fetched: Progress::Pending,
                    event_cycle: self.current_cycle + self.cfg.scheduling_latency,
                };
                let lq_ref = LsqRef { slot: lq_slot, id };
                let entry = self.rob.get_mut(slot).unwrap();
                entry.source_memory[i].lsq = Some(lq_ref);
                entry.source_memory[i].added = true;
                self.rtl0.push_back(lq_ref);
            }
        }

        // Stores: the SQ fills strictly in program order, so an operand
        // waits until its id reaches the head of the store-address FIFO.
        let num_dests = self.rob.get(slot).unwrap().destination_memory.len();
        for i in 0..num_dests {
            if self.rob.get(slot).unwrap().destination_memory[i].added {
                continue;
            }
            if self.sq.find_free().is_some()
                && self.sta.front() == Some(&self.rob.get(slot).unwrap().id)
            {
                self.add_store_queue(slot, i);
            }
        }

        let entry = self.rob.get(slot).unwrap();
        if entry.all_mem_ops_added() {
            let entry = self.rob.get_mut(slot).unwrap();
            entry.scheduled = Progress::Completed;
            // Store-to-load forwarding may already have finished execution.
            if entry.executed == Progress::Pending {
                entry.executed = Progress::Inflight;
            }
        }
    }

    fn add_store_queue(&mut self, slot: usize, dest_index: usize) {
        let sq_slot = self.sq.find_free().expect("checked by caller");
        assert_eq!(self.sq.at(sq_slot).virtual_address, 0);

        let entry = self.rob.get(slot).unwrap();
        let (id, ip, asid) = (entry.id, entry.ip, entry.asid);
        let address = entry.destination_memory[dest_index].address;
        *self.sq.at_mut(sq_slot) = LsqEntry {
            instr_id: id,
            virtual_address: address,
            physical_address: 0,
            ip,
            asid,
            rob: Some(RobRef { slot, id }),
            translated: Progress::Pending,
            fetched: Progress::Pending,
            event_cycle: self.current_cycle + self.cfg.scheduling_latency,
        };

        let sq_ref = LsqRef { slot: sq_slot, id };
        let entry = self.rob.get_mut(slot).unwrap();
        entry.destination_memory[dest_index].lsq = Some(sq_ref);
        entry.destination_memory[dest_index].added = true;

        let popped = self.sta.pop_front();
        assert_eq!(popped, Some(id), "store-address FIFO out of order");

        self.rts0.push_back(sq_ref);
    }

    // ------------------------------------------------------------------
    // LSQ issue
    // ------------------------------------------------------------------

    /// Issues stores and loads from the ready queues, bounded per cycle.
    /// A refused translation or access leaves its queue head intact.
    fn operate_lsq(&mut self, uncore: &mut Uncore) {
        let mut store_issued = 0;
        while store_issued < self.cfg.sq_width && !self.rts0.is_empty() {
            let r = *self.rts0.front().unwrap();
            if self.do_translate_store(uncore, r) == QUEUE_REFUSED {
                break;
            }
            self.rts0.pop_front().unwrap();
            store_issued += 1;
        }
        while store_issued < self.cfg.sq_width && !self.rts1.is_empty() {
            let r = self.rts1.pop_front().unwrap();
            self.execute_store(r);
            store_issued += 1;
        }

        let mut load_issued = 0;
        while load_issued < self.cfg.lq_width && !self.rtl0.is_empty() {
            let r = *self.rtl0.front().unwrap();
            if self.do_translate_load(uncore, r) == QUEUE_REFUSED {
                break;
            }
            self.rtl0.pop_front().unwrap();
            load_issued += 1;
        }
        while load_issued < self.cfg.lq_width && !self.rtl1.is_empty() {
            let r = *self.rtl1.front().unwrap();
            if self.execute_load(uncore, r) == QUEUE_REFUSED {
                break;
            }
            self.rtl1.pop_front().unwrap();
            load_issued += 1;
        }
    }

    fn do_translate_store(&mut self, uncore: &mut Uncore, r: LsqRef) -> i32 {
        let Some(entry) = self.sq.resolve(r) else {
            return -1;
        };
        let packet = Packet {
            fill_level: uncore.cache(self.nodes.dtlb).fill_level,
            cpu: self.cpu,
            address: entry.virtual_address,
            v_address: entry.virtual_address,
            instr_id: entry.instr_id,
            ip: entry.ip,
            kind: RequestKind::Rfo,
            asid: entry.asid,
            to_return: vec![Sink::CoreBus(self.cpu, BusKind::Dtlb)],
            sq_depend_on_me: vec![r],
            ..Packet::default()
        };
        let rq_index = uncore.add_rq(self.nodes.dtlb, packet);
        if rq_index != QUEUE_REFUSED {
            self.sq.resolve_mut(r).unwrap().translated = Progress::Inflight;
        }
        rq_index
    }

    /// Marks a translated store complete and forwards to every waiting
    /// source operand of each dependent load that matches its address.
    fn execute_store(&mut self, r: LsqRef) {
        let now = self.current_cycle;
        let Some(entry) = self.sq.resolve_mut(r) else {
            return;
        };
        entry.fetched = Progress::Completed;
        entry.event_cycle = now;
        let address = entry.virtual_address;
        let owner = entry.rob;

        let Some(owner) = owner else { return };
        let Some(owner_entry) = self.rob.resolve_mut(owner) else {
            return;
        };
        assert!(owner_entry.num_mem_ops > 0);
        owner_entry.num_mem_ops -= 1;
        owner_entry.event_cycle = now;
        let dependents = owner_entry.mem_dependents.clone();

        for dep in dependents {
            let Some(load) = self.rob.resolve_mut(dep) else {
                continue;
            };
            for i in 0..load.source_memory.len() {
                if load.source_memory[i].address == address && !load.source_memory[i].added {
                    assert!(load.num_mem_ops > 0);
                    load.num_mem_ops -= 1;
                    load.event_cycle = now;
                    load.source_memory[i].added = true;
                }
            }
        }
    }

    fn do_translate_load(&mut self, uncore: &mut Uncore, r: LsqRef) -> i32 {
        let Some(entry) = self.lq.resolve(r) else {
            return -1;
        };
        let packet = Packet {
            fill_level: uncore.cache(self.nodes.dtlb).fill_level,
            cpu: self.cpu,
            address: entry.virtual_address,
            v_address: entry.virtual_address,
            instr_id: entry.instr_id,
            ip: entry.ip,
            kind: RequestKind::Load,
            asid: entry.asid,
            to_return: vec![Sink::CoreBus(self.cpu, BusKind::Dtlb)],
            lq_depend_on_me: vec![r],
            ..Packet::default()
        };
        let rq_index = uncore.add_rq(self.nodes.dtlb, packet);
        if rq_index != QUEUE_REFUSED {
            self.lq.resolve_mut(r).unwrap().translated = Progress::Inflight;
        }
        rq_index
    }

    fn execute_load(&mut self, uncore: &mut Uncore, r: LsqRef) -> i32 {
        let Some(entry) = self.lq.resolve(r) else {
            return -1;
        };
        let packet = Packet {
            fill_level: uncore.cache(self.nodes.l1d).fill_level,
            cpu: self.cpu,
            address: entry.physical_address,
            v_address: entry.virtual_address,
            instr_id: entry.instr_id,
            ip: entry.ip,
            kind: RequestKind::Load,
            asid: entry.asid,
            to_return: vec![Sink::CoreBus(self.cpu, BusKind::L1d)],
            lq_depend_on_me: vec![r],
            ..Packet::default()
        };
        let rq_index = uncore.add_rq(self.nodes.l1d, packet);
        if rq_index != QUEUE_REFUSED {
            self.lq.resolve_mut(r).unwrap().fetched = Progress::Inflight;
        }
        rq_index
    }

    // ------------------------------------------------------------------
    // Memory returns
    // ------------------------------------------------------------------

    /// Drains the four cache buses, bounded by fetch width on the
    /// instruction side and by each bus's `max_read`.
    fn handle_memory_return(&mut self, uncore: &Uncore) {
        let now = self.current_cycle;

        // Instruction translation returns.
        let mut available = self.cfg.fetch_width;
        let mut to_read = uncore.cache(self.nodes.itlb).max_read;
        while available > 0 && to_read > 0 && !self.itlb_bus.processed.is_empty() {
            let entry = self.itlb_bus.processed.front_mut().unwrap();
            let page = entry.address >> PAGE_SHIFT;
            let data = entry.data;
            while available > 0 && !entry.instr_depend_on_me.is_empty() {
                let id = *entry.instr_depend_on_me.front().unwrap();
                if let Ok(pos) = self.ifetch_buffer.binary_search_by_key(&id, |x| x.id) {
                    let instr = &mut self.ifetch_buffer[pos];
                    if instr.ip >> PAGE_SHIFT == page && instr.translated.started() {
                        instr.translated = Progress::Completed;
                        instr.instruction_pa =
                            splice_bits(data << PAGE_SHIFT, instr.ip, PAGE_SHIFT);
                        available -= 1;
                    }
                }
                entry.instr_depend_on_me.pop_front().unwrap();
            }
            let drained = entry.instr_depend_on_me.is_empty();
            if drained {
                self.itlb_bus.processed.pop_front().unwrap();
            }
            to_read -= 1;
        }

        // Instruction fetch returns.
        let mut available = self.cfg.fetch_width;
        let mut to_read = uncore.cache(self.nodes.l1i).max_read;
        while available > 0 && to_read > 0 && !self.l1i_bus.processed.is_empty() {
            let entry = self.l1i_bus.processed.front_mut().unwrap();
            let block = entry.address >> BLOCK_SHIFT;
            while available > 0 && !entry.instr_depend_on_me.is_empty() {
                let id = *entry.instr_depend_on_me.front().unwrap();
                if let Ok(pos) = self.ifetch_buffer.binary_search_by_key(&id, |x| x.id) {
                    let instr = &mut self.ifetch_buffer[pos];
                    if instr.instruction_pa >> BLOCK_SHIFT == block
                        && instr.fetched.started()
                        && instr.translated == Progress::Completed
                    {
                        instr.fetched = Progress::Completed;
                        available -= 1;
                    }
                }
                entry.instr_depend_on_me.pop_front().unwrap();
            }
            let drained = entry.instr_depend_on_me.is_empty();
            if drained {
                self.l1i_bus.processed.pop_front().unwrap();
            }
            to_read -= 1;
        }

        // Data translation returns.
        let mut to_read = uncore.cache(self.nodes.dtlb).max_read;
        while to_read > 0 && !self.dtlb_bus.processed.is_empty() {
            let entry = self.dtlb_bus.processed.pop_front().unwrap();
            for r in &entry.sq_depend_on_me {
                if let Some(sq_entry) = self.sq.resolve_mut(*r) {
                    sq_entry.physical_address = splice_bits(
                        entry.data << PAGE_SHIFT,
                        sq_entry.virtual_address,
                        PAGE_SHIFT,
                    );
                    sq_entry.translated = Progress::Completed;
                    sq_entry.event_cycle = now;
                    self.rts1.push_back(*r);
                }
            }
            for r in &entry.lq_depend_on_me {
                if let Some(lq_entry) = self.lq.resolve_mut(*r) {
                    lq_entry.physical_address = splice_bits(
                        entry.data << PAGE_SHIFT,
                        lq_entry.virtual_address,
                        PAGE_SHIFT,
                    );
                    lq_entry.translated = Progress::Completed;
                    lq_entry.event_cycle = now;
                    self.rtl1.push_back(*r);
                }
            }
            to_read -= 1;
        }

        // Data access returns: the load is done and its slot is freed.
        let mut to_read = uncore.cache(self.nodes.l1d).max_read;
        while to_read > 0 && !self.l1d_bus.processed.is_empty() {
            let entry = self.l1d_bus.processed.pop_front().unwrap();
            for r in &entry.lq_depend_on_me {
                let Some(lq_entry) = self.lq.resolve_mut(*r) else {
                    continue;
                };
                lq_entry.fetched = Progress::Completed;
                lq_entry.event_cycle = now;
                let owner = lq_entry.rob;
                self.lq.at_mut(r.slot).reset();
                if let Some(owner_entry) = owner.and_then(|o| self.rob.resolve_mut(o)) {
                    assert!(owner_entry.num_mem_ops > 0);
                    owner_entry.num_mem_ops -= 1;
                    owner_entry.event_cycle = now;
                }
            }
            to_read -= 1;
        }
    }

    // ------------------------------------------------------------------
    // Completion and retire
    // ------------------------------------------------------------------

    /// Finalizes in-flight executions whose latency has elapsed and whose
    /// memory operands are all satisfied, then wakes dependents.
    fn complete_inflight_instructions(&mut self) {
        let mut bandwidth = self.cfg.exec_width;
        let now = self.current_cycle;
        for slot in self.rob.slots() {
            if bandwidth == 0 {
                break;
            }
            let entry = self.rob.get(slot).unwrap();
            let ready = entry.executed == Progress::Inflight
                && entry.event_cycle <= now
                && entry.num_mem_ops == 0;
            if !ready {
                continue;
            }
            self.do_complete_execution(slot);
            bandwidth -= 1;

            let dependents = self.rob.get(slot).unwrap().reg_dependents.clone();
            for dep in dependents {
                let wake = self
                    .rob
                    .resolve(dep)
                    .is_some_and(|d| d.scheduled == Progress::Completed && d.num_reg_dependent == 0);
                if wake {
                    assert!(self.ready_to_execute.len() < self.rob.capacity());
                    self.ready_to_execute.push_back(dep);
                }
            }
        }
    }

    fn do_complete_execution(&mut self, slot: usize) {
        self.rob.get_mut(slot).unwrap().executed = Progress::Completed;
        let dependents = self.rob.get(slot).unwrap().reg_dependents.clone();
        for dep in dependents {
            if let Some(d) = self.rob.resolve_mut(dep) {
                assert!(d.num_reg_dependent > 0);
                d.num_reg_dependent -= 1;
                if d.num_reg_dependent == 0 {
                    d.scheduled = if d.is_memory {
                        Progress::Inflight
                    } else {
                        Progress::Completed
                    };
                }
            }
        }

        // Mispredictions carried this far (indirect, conditional, return)
        // are detected at execute.
        if self.rob.get(slot).unwrap().branch_mispredicted {
            self.fetch_resume_cycle = self.current_cycle + self.cfg.branch_mispredict_penalty;
        }
    }

    /// Retires completed heads in order, draining destination stores to the
    /// L1D write queue at block granularity. A refused write keeps the head
    /// in place and ends retirement for the cycle.
    fn retire_rob(&mut self, uncore: &mut Uncore) {
        let mut bandwidth = self.cfg.retire_width;
        while bandwidth > 0 {
            let Some(front) = self.rob.front() else { break };
            if front.executed != Progress::Completed {
                break;
            }
            let head_slot = self.rob.head_slot();
            let num_dests = front.destination_memory.len();

            for i in 0..num_dests {
                let op = &self.rob.front().unwrap().destination_memory[i];
                let (address, lsq) = (op.address, op.lsq);
                if address == 0 {
                    continue;
                }
                let Some(sq_ref) = lsq else { continue };
                let sq_entry = self.sq.at(sq_ref.slot);
                let packet = Packet {
                    fill_level: FILL_L1,
                    cpu: self.cpu,
                    address: sq_entry.physical_address >> BLOCK_SHIFT,
                    v_address: sq_entry.virtual_address >> BLOCK_SHIFT,
                    instr_id: sq_entry.instr_id,
                    ip: sq_entry.ip,
                    kind: RequestKind::Rfo,
                    asid: sq_entry.asid,
                    ..Packet::default()
                };
                if uncore.add_wq(self.nodes.l1d, packet) == QUEUE_REFUSED {
                    return;
                }
                self.rob.get_mut(head_slot).unwrap().destination_memory[i].address = 0;
                self.sq.at_mut(sq_ref.slot).reset();
            }

            self.rob.pop_front().unwrap();
            self.num_retired += 1;
            bandwidth -= 1;
        }
    }

    // ------------------------------------------------------------------
    // Supervision
    // ------------------------------------------------------------------

    /// Dumps ROB head, LQ, SQ, and L1D MSHR state when the watchdog trips.
    pub fn print_deadlock(&self, uncore: &Uncore) {
        let head = self.rob.front().expect("watchdog fired on empty ROB");
        println!(
            "DEADLOCK! CPU {} instr_id: {} translated: {:?} fetched: {:?} scheduled: {:?} \
             executed: {:?} is_memory: {} num_reg_dependent: {} event: {} current: {}",
            self.cpu,
            head.id,
            head.translated,
            head.fetched,
            head.scheduled,
            head.executed,
            head.is_memory as u8,
            head.num_reg_dependent,
            head.event_cycle,
            self.current_cycle
        );

        println!("\nLoad Queue Entry");
        for (j, entry) in self.lq.entries().iter().enumerate() {
            println!(
                "[LQ] entry: {} instr_id: {} address: {:x} translated: {:?} fetched: {:?}",
                j, entry.instr_id, entry.physical_address, entry.translated, entry.fetched
            );
        }

        println!("\nStore Queue Entry");
        for (j, entry) in self.sq.entries().iter().enumerate() {
            println!(
                "[SQ] entry: {} instr_id: {} address: {:x} translated: {:?} fetched: {:?}",
                j, entry.instr_id, entry.physical_address, entry.translated, entry.fetched
            );
        }

        println!("\nL1D MSHR Entry");
        for (j, entry) in uncore.cache(self.nodes.l1d).mshr_entries().iter().enumerate() {
            println!(
                "[L1D MSHR] entry: {} instr_id: {} address: {:x} full_addr: {:x} type: {:?} \
                 fill_level: {} event_cycle: {}",
                j,
                entry.instr_id,
                entry.address >> BLOCK_SHIFT,
                entry.address,
                entry.kind,
                entry.fill_level,
                entry.event_cycle
            );
        }
    }

    /// Zeroes branch statistics at a phase boundary.
    pub fn reset_stats(&mut self) {
        self.stats = CoreStats::default();
    }
}
