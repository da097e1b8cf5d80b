//! Top-level simulation context.
//!
//! A [`Simulation`] owns every mutable piece of the machine — the cores, the
//! memory-hierarchy arena, the virtual-memory map, and the trace readers —
//! and drives them cooperatively:
//! 1. **Cycle stepping:** every operable runs once per cycle in an order
//!    re-sorted by next-operate time; completions are delivered between
//!    operates.
//! 2. **Phase control:** a warmup phase and a measured phase run
//!    back-to-back, with per-phase statistics resets and per-CPU ROI
//!    snapshots.
//! 3. **Supervision:** the per-core deadlock watchdog, and heartbeat
//!    progress lines.
//!
//! There is no global mutable state; everything threads through this struct.

use std::time::Instant;

use crate::common::{BLOCK_SHIFT, FILL_L1, FILL_L2, FILL_LLC, HEARTBEAT_PERIOD, PAGE_SHIFT};
use crate::config::SimConfig;
use crate::cpu::{Core, CoreNodes};
use crate::error::{ConfigError, TraceError};
use crate::mem::cache::Cache;
use crate::mem::dram::MemoryController;
use crate::mem::hierarchy::{Node, NodeId, Uncore};
use crate::mem::packet::Sink;
use crate::ptw::PageTableWalker;
use crate::trace::TraceReader;
use crate::vmem::VirtualMemory;

/// Private-slice node offsets; see [`Simulation::new`] for the layout.
const NODES_PER_CPU: usize = 7;

#[derive(Clone, Copy)]
enum OperableId {
    Core(usize),
    Node(usize),
}

/// The whole machine plus its drivers.
pub struct Simulation {
    /// The CPU cores.
    pub cores: Vec<Core>,
    /// The memory hierarchy.
    pub uncore: Uncore,
    /// The virtual-memory map.
    pub vmem: VirtualMemory,
    /// Per-CPU warmup completion, updated every cycle during a run.
    pub warmup_complete: Vec<bool>,
    traces: Vec<TraceReader>,
    operables: Vec<OperableId>,
    warmup_instructions: u64,
    show_heartbeat: bool,
    next_heartbeat_instr: Vec<u64>,
    last_heartbeat_instr: Vec<u64>,
    last_heartbeat_cycle: Vec<u64>,
    start_time: Instant,
}

impl Simulation {
    /// Builds the machine.
    ///
    /// Each CPU gets a private slice of seven nodes — ITLB, DTLB, STLB,
    /// PTW, L1I, L1D, L2C — followed by the shared LLC and the memory
    /// controller, ordered so every request edge points to a higher index.
    pub fn new(cfg: &SimConfig, seed: u64) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let num_cpus = cfg.num_cpus;
        let mut vmem = VirtualMemory::new(seed);

        let llc_id: NodeId = num_cpus * NODES_PER_CPU;
        let dram_id: NodeId = llc_id + 1;

        let mut nodes = Vec::with_capacity(dram_id + 1);
        let mut cores = Vec::with_capacity(num_cpus);
        for cpu in 0..num_cpus {
            let base = cpu * NODES_PER_CPU;
            let ids = CoreNodes {
                itlb: base,
                dtlb: base + 1,
                l1i: base + 4,
                l1d: base + 5,
            };
            let stlb = base + 2;
            let ptw = base + 3;
            let l2c = base + 6;

            nodes.push(Node::Cache(Cache::new(
                format!("cpu{cpu}_ITLB"),
                &cfg.itlb,
                PAGE_SHIFT,
                FILL_L1,
                ids.itlb,
                stlb,
                num_cpus,
            )));
            nodes.push(Node::Cache(Cache::new(
                format!("cpu{cpu}_DTLB"),
                &cfg.dtlb,
                PAGE_SHIFT,
                FILL_L1,
                ids.dtlb,
                stlb,
                num_cpus,
            )));
            nodes.push(Node::Cache(Cache::new(
                format!("cpu{cpu}_STLB"),
                &cfg.stlb,
                PAGE_SHIFT,
                FILL_L2,
                stlb,
                ptw,
                num_cpus,
            )));
            nodes.push(Node::Ptw(PageTableWalker::new(
                format!("cpu{cpu}_PTW"),
                &cfg.ptw,
                cpu,
                ptw,
                ids.l1d,
                &mut vmem,
            )));
            nodes.push(Node::Cache(Cache::new(
                format!("cpu{cpu}_L1I"),
                &cfg.l1i,
                BLOCK_SHIFT,
                FILL_L1,
                ids.l1i,
                l2c,
                num_cpus,
            )));
            nodes.push(Node::Cache(Cache::new(
                format!("cpu{cpu}_L1D"),
                &cfg.l1d,
                BLOCK_SHIFT,
                FILL_L1,
                ids.l1d,
                l2c,
                num_cpus,
            )));
            nodes.push(Node::Cache(Cache::new(
                format!("cpu{cpu}_L2C"),
                &cfg.l2c,
                BLOCK_SHIFT,
                FILL_L2,
                l2c,
                llc_id,
                num_cpus,
            )));

            cores.push(Core::new(cpu, &cfg.core, ids));
        }

        let mut llc_cfg = cfg.llc.clone();
        llc_cfg.sets = (llc_cfg.sets * num_cpus).next_power_of_two();
        nodes.push(Node::Cache(Cache::new(
            "LLC",
            &llc_cfg,
            BLOCK_SHIFT,
            FILL_LLC,
            llc_id,
            dram_id,
            num_cpus,
        )));
        nodes.push(Node::Dram(MemoryController::new(&cfg.dram)));

        let operables = (0..num_cpus)
            .map(OperableId::Core)
            .chain((0..nodes.len()).map(OperableId::Node))
            .collect();

        Ok(Self {
            cores,
            uncore: Uncore::new(nodes),
            vmem,
            warmup_complete: vec![false; num_cpus],
            traces: Vec::new(),
            operables,
            warmup_instructions: 0,
            show_heartbeat: true,
            next_heartbeat_instr: vec![HEARTBEAT_PERIOD; num_cpus],
            last_heartbeat_instr: vec![0; num_cpus],
            last_heartbeat_cycle: vec![0; num_cpus],
            start_time: Instant::now(),
        })
    }

    /// Attaches one trace reader per CPU; a mismatch is fatal.
    pub fn set_traces(&mut self, traces: Vec<TraceReader>) -> Result<(), ConfigError> {
        if traces.len() != self.cores.len() {
            return Err(ConfigError::TraceCountMismatch {
                given: traces.len(),
                cpus: self.cores.len(),
            });
        }
        self.traces = traces;
        Ok(())
    }

    /// Suppresses heartbeat lines.
    pub fn set_show_heartbeat(&mut self, show: bool) {
        self.show_heartbeat = show;
    }

    /// Delivers queued completions to their sinks.
    fn drain_returns(&mut self) {
        for (sink, packet) in self.uncore.take_returns() {
            match sink {
                Sink::Node(id) => self.uncore.deliver(id, &packet),
                Sink::CoreBus(cpu, kind) => self.cores[cpu].bus_mut(kind).return_data(packet),
            }
        }
    }

    /// Advances the machine one cycle: operate everything, deliver
    /// completions, re-sort the operable order, and feed the trace fronts.
    ///
    /// Panics (after dumping diagnostic state) when a core's deadlock
    /// watchdog fires.
    pub fn step(&mut self) -> Result<(), TraceError> {
        let order = self.operables.clone();
        for op in order {
            match op {
                OperableId::Core(cpu) => {
                    let warm = self.warmup_complete[cpu];
                    let deadlocked = self.cores[cpu].operate(&mut self.uncore, warm);
                    if deadlocked {
                        self.cores[cpu].print_deadlock(&self.uncore);
                        panic!("deadlock detected on cpu {cpu}");
                    }
                }
                OperableId::Node(index) => {
                    self.uncore
                        .operate_node(index, &mut self.vmem, &self.warmup_complete);
                }
            }
            self.drain_returns();
        }

        let mut order = std::mem::take(&mut self.operables);
        order.sort_by_key(|op| match op {
            OperableId::Core(cpu) => self.cores[*cpu].current_cycle,
            OperableId::Node(index) => self.uncore.nodes[*index].current_cycle(),
        });
        self.operables = order;

        if !self.traces.is_empty() {
            for cpu in 0..self.cores.len() {
                while self.cores[cpu].instrs_to_read_this_cycle > 0 {
                    let instr = self.traces[cpu].next_instruction()?;
                    let warm = self.warmup_complete[cpu];
                    self.cores[cpu].init_instruction(instr, warm, &mut self.uncore);
                }
            }
        }
        Ok(())
    }

    /// Hours/minutes/seconds of host time since construction.
    pub fn elapsed_hms(&self) -> (u64, u64, u64) {
        let secs = self.start_time.elapsed().as_secs();
        (secs / 3600, (secs % 3600) / 60, secs % 60)
    }

    /// Runs the warmup phase and then the measured phase to completion.
    pub fn run(
        &mut self,
        warmup_instructions: u64,
        simulation_instructions: u64,
    ) -> Result<(), TraceError> {
        assert!(
            !self.traces.is_empty(),
            "attach traces before running the simulation"
        );
        self.warmup_instructions = warmup_instructions;
        let num_cpus = self.cores.len();

        for phase_duration in [warmup_instructions, simulation_instructions] {
            let mut phase_complete = vec![false; num_cpus];

            for node in &mut self.uncore.nodes {
                node.reset_stats();
            }
            for core in &mut self.cores {
                core.reset_stats();
                core.begin_phase_instr = core.num_retired;
                core.begin_phase_cycle = core.current_cycle;
            }

            while !phase_complete.iter().all(|&done| done) {
                self.step()?;

                for cpu in 0..num_cpus {
                    self.warmup_complete[cpu] =
                        self.cores[cpu].num_retired > self.warmup_instructions;
                }

                if self.show_heartbeat {
                    self.print_heartbeats();
                }

                for cpu in 0..num_cpus {
                    let core = &mut self.cores[cpu];
                    if !phase_complete[cpu]
                        && core.num_retired >= core.begin_phase_instr + phase_duration
                    {
                        phase_complete[cpu] = true;
                        core.finish_phase_instr = core.num_retired;
                        core.finish_phase_cycle = core.current_cycle;

                        let ipc = (core.finish_phase_instr - core.begin_phase_instr) as f64
                            / (core.finish_phase_cycle - core.begin_phase_cycle).max(1) as f64;
                        let (instructions, cycles) = (core.num_retired, core.current_cycle);
                        let (h, m, s) = self.elapsed_hms();
                        println!(
                            "Phase finished CPU {cpu} instructions: {instructions} cycles: \
                             {cycles} cumulative IPC: {ipc:.4} (Simulation time: {h} hr {m} min \
                             {s} sec)"
                        );

                        for node in &mut self.uncore.nodes {
                            if let Node::Cache(cache) = node {
                                cache.stats.record_roi(cpu);
                            }
                        }
                    }
                }
            }

            println!();
            for cpu in 0..num_cpus {
                let core = &self.cores[cpu];
                let (h, m, s) = self.elapsed_hms();
                println!(
                    "Phase complete CPU {cpu} instructions: {} cycles: {} (Simulation time: \
                     {h} hr {m} min {s} sec)",
                    core.num_retired, core.current_cycle
                );
            }
            println!();
        }
        Ok(())
    }

    fn print_heartbeats(&mut self) {
        for cpu in 0..self.cores.len() {
            let core = &self.cores[cpu];
            if core.num_retired < self.next_heartbeat_instr[cpu] {
                continue;
            }
            let heartbeat_ipc = (core.num_retired - self.last_heartbeat_instr[cpu]) as f64
                / (core.current_cycle - self.last_heartbeat_cycle[cpu]).max(1) as f64;
            let cumulative_ipc = (core.num_retired - core.begin_phase_instr) as f64
                / (core.current_cycle - core.begin_phase_cycle).max(1) as f64;
            let (h, m, s) = self.elapsed_hms();
            println!(
                "Heartbeat CPU {cpu} instructions: {} cycles: {} heartbeat IPC: \
                 {heartbeat_ipc:.4} cumulative IPC: {cumulative_ipc:.4} (Simulation time: {h} hr \
                 {m} min {s} sec)",
                core.num_retired, core.current_cycle
            );
            self.last_heartbeat_instr[cpu] = core.num_retired;
            self.last_heartbeat_cycle[cpu] = core.current_cycle;
            self.next_heartbeat_instr[cpu] = core.num_retired + HEARTBEAT_PERIOD;
        }
    }
}
