//! End-of-run report printing.
//!
//! All output is textual on stdout, in the order the front end expects:
//! per-CPU cumulative IPC, per-cache ROI (and, for multicore runs, whole-run)
//! hit/miss tables, plug-in final statistics, DRAM channel statistics, and
//! branch-prediction accuracy with per-type MPKI.

use crate::common::NUM_REQUEST_TYPES;
use crate::instr::BranchKind;
use crate::mem::cache::Cache;
use crate::mem::hierarchy::Node;
use crate::sim::Simulation;

const TYPE_NAMES: [&str; NUM_REQUEST_TYPES] =
    ["LOAD", "RFO", "PREFETCH", "WRITEBACK", "TRANSLATION"];

fn print_cache_table(cache: &Cache, roi: bool) {
    let label = if roi { "ROI" } else { "SIM" };
    let num_cpus = cache.stats.sim_hit.len();
    let (hits, misses) = if roi {
        (&cache.stats.roi_hit, &cache.stats.roi_miss)
    } else {
        (&cache.stats.sim_hit, &cache.stats.sim_miss)
    };

    let mut active_cpus = Vec::new();
    let mut total_miss = 0u64;
    for cpu in 0..num_cpus {
        let cpu_hit: u64 = hits[cpu].iter().sum();
        let cpu_miss: u64 = misses[cpu].iter().sum();
        total_miss += cpu_miss;
        if cpu_hit == 0 && cpu_miss == 0 {
            continue;
        }
        active_cpus.push(cpu);

        println!(
            "CPU{cpu} {} {label} TOTAL         ACCESS: {:>10}  HIT: {:>10}  MISS: {:>10}",
            cache.name,
            cpu_hit + cpu_miss,
            cpu_hit,
            cpu_miss
        );
        for (t, name) in TYPE_NAMES.iter().enumerate() {
            println!(
                "CPU{cpu} {} {label} {:<12}  ACCESS: {:>10}  HIT: {:>10}  MISS: {:>10}",
                cache.name,
                name,
                hits[cpu][t] + misses[cpu][t],
                hits[cpu][t],
                misses[cpu][t]
            );
        }
    }

    let prefix = if active_cpus.len() == 1 {
        format!("CPU{} ", active_cpus[0])
    } else {
        String::new()
    };
    let s = &cache.stats;
    let (pf_req, pf_issued, pf_fill, pf_useful, pf_useless) = if roi {
        (
            s.roi_pf_requested,
            s.roi_pf_issued,
            s.roi_pf_fill,
            s.roi_pf_useful,
            s.roi_pf_useless,
        )
    } else {
        (s.pf_requested, s.pf_issued, s.pf_fill, s.pf_useful, s.pf_useless)
    };
    println!(
        "{prefix}{} {label} PREFETCH   REQUESTED: {:>10}  ISSUED: {:>10}  FILLED: {:>10}  \
         USEFUL: {:>10}  USELESS: {:>10}",
        cache.name, pf_req, pf_issued, pf_fill, pf_useful, pf_useless
    );
    if total_miss > 0 {
        println!(
            "{prefix}{} AVERAGE MISS LATENCY: {:.4} cycles",
            cache.name,
            s.total_miss_latency as f64 / total_miss as f64
        );
    } else {
        println!("{prefix}{} AVERAGE MISS LATENCY: - cycles", cache.name);
    }
}

/// Prints per-CPU ROI IPC lines and the ROI table of every cache.
pub fn print_roi_stats(sim: &Simulation) {
    println!("Region of Interest Statistics");
    println!();
    for core in &sim.cores {
        let instructions = core.finish_phase_instr - core.begin_phase_instr;
        let cycles = (core.finish_phase_cycle - core.begin_phase_cycle).max(1);
        println!(
            "CPU{} ROI cumulative IPC: {:.4} instructions: {instructions} cycles: {cycles}",
            core.cpu,
            instructions as f64 / cycles as f64
        );
    }
    for node in sim.uncore.nodes.iter().rev() {
        if let Node::Cache(cache) = node {
            print_cache_table(cache, true);
        }
    }
}

/// Prints whole-simulation statistics; only meaningful for multicore runs,
/// where finish times differ per CPU.
pub fn print_sim_stats(sim: &Simulation) {
    println!("Total Simulation Statistics (not including warmup)");
    println!();
    for core in &sim.cores {
        let instructions = core.num_retired - core.begin_phase_instr;
        let cycles = (core.current_cycle - core.begin_phase_cycle).max(1);
        println!(
            "CPU{} SIM cumulative IPC: {:.4} instructions: {instructions} cycles: {cycles}",
            core.cpu,
            instructions as f64 / cycles as f64
        );
    }
    for node in sim.uncore.nodes.iter().rev() {
        if let Node::Cache(cache) = node {
            print_cache_table(cache, false);
        }
    }
}

/// Prints branch accuracy, MPKI, average ROB occupancy at mispredict, and
/// per-type MPKI for every CPU.
pub fn print_branch_stats(sim: &Simulation) {
    for core in &sim.cores {
        let s = &core.stats;
        let roi_instructions = (core.num_retired - core.begin_phase_instr).max(1);
        let accuracy = if s.num_branch > 0 {
            100.0 * (s.num_branch - s.branch_mispredictions) as f64 / s.num_branch as f64
        } else {
            100.0
        };
        let mpki = 1000.0 * s.branch_mispredictions as f64 / roi_instructions as f64;
        let occupancy = if s.branch_mispredictions > 0 {
            s.total_rob_occupancy_at_branch_mispredict as f64 / s.branch_mispredictions as f64
        } else {
            0.0
        };
        println!();
        println!(
            "CPU {} Branch Prediction Accuracy: {accuracy:.4}% MPKI: {mpki:.4} Average ROB \
             Occupancy at Mispredict: {occupancy:.4}",
            core.cpu
        );

        println!("Branch type MPKI");
        for kind in [
            BranchKind::DirectJump,
            BranchKind::Indirect,
            BranchKind::Conditional,
            BranchKind::DirectCall,
            BranchKind::IndirectCall,
            BranchKind::Return,
        ] {
            println!(
                "BRANCH_{:?}: {:.4}",
                kind,
                1000.0 * s.branch_type_misses[kind as usize] as f64 / roi_instructions as f64
            );
        }
        println!();
    }
}

/// Prints per-channel DRAM row-buffer and bus-congestion statistics.
pub fn print_dram_stats(sim: &Simulation) {
    let Some(dram) = sim.uncore.nodes.iter().find_map(|n| match n {
        Node::Dram(d) => Some(d),
        _ => None,
    }) else {
        return;
    };

    let channels = dram.channel_stats();
    let total_congested_cycles: u64 = channels.iter().map(|c| c.dbus_cycle_congested).sum();
    let total_congested_count: u64 = channels.iter().map(|c| c.dbus_count_congested).sum();

    println!();
    println!("DRAM Statistics");
    for (i, ch) in channels.iter().enumerate() {
        println!(" CHANNEL {i}");
        println!(
            " RQ ROW_BUFFER_HIT: {:>10}  ROW_BUFFER_MISS: {:>10}",
            ch.rq_row_buffer_hit, ch.rq_row_buffer_miss
        );
        println!(" DBUS_CONGESTED: {:>10}", total_congested_count);
        println!(
            " WQ ROW_BUFFER_HIT: {:>10}  ROW_BUFFER_MISS: {:>10}  FULL: {:>10}",
            ch.wq_row_buffer_hit, ch.wq_row_buffer_miss, ch.wq_full
        );
        println!();
    }
    if total_congested_count > 0 {
        println!(
            " AVG_CONGESTED_CYCLE: {:.4}",
            total_congested_cycles as f64 / total_congested_count as f64
        );
    } else {
        println!(" AVG_CONGESTED_CYCLE: -");
    }
}

/// Invokes the prefetcher and replacement final-stats hooks on every cache.
pub fn print_plugin_final_stats(sim: &Simulation) {
    for node in sim.uncore.nodes.iter().rev() {
        if let Node::Cache(cache) = node {
            cache.final_stats();
        }
    }
}
