//! End-to-end pipeline tests.
//!
//! These drive a single-core machine either by handing instructions
//! directly to the trace-intake stage or by running a small synthetic trace
//! file through the full phase loop, and check the branch bookkeeping,
//! stack-pointer folding, store-to-load forwarding, and pipeline invariants.

use std::io::Write;

use oxsim_core::cpu::lsq::LsqEntry;
use oxsim_core::instr::{
    BranchKind, Instruction, MemOperand, Progress, REG_FLAGS, REG_INSTRUCTION_POINTER,
    REG_STACK_POINTER,
};
use oxsim_core::{SimConfig, Simulation, TraceFormat, TraceReader};

fn single_core() -> Simulation {
    let cfg = SimConfig::default();
    let mut sim = Simulation::new(&cfg, 7).unwrap();
    sim.set_show_heartbeat(false);
    sim
}

fn direct_jump(ip: u64, target: u64) -> Instruction {
    Instruction {
        ip,
        destination_registers: vec![REG_INSTRUCTION_POINTER],
        branch_taken: true,
        branch_target: target,
        ..Instruction::default()
    }
}

fn conditional(ip: u64, target: u64, taken: bool) -> Instruction {
    Instruction {
        ip,
        source_registers: vec![REG_FLAGS, REG_INSTRUCTION_POINTER],
        destination_registers: vec![REG_INSTRUCTION_POINTER],
        branch_taken: taken,
        branch_target: if taken { target } else { 0 },
        ..Instruction::default()
    }
}

#[test]
fn test_correctly_predicted_direct_jump_ends_the_fetch_block() {
    let mut sim = single_core();

    // First sighting trains the BTB (and counts one miss); still in warmup,
    // so it does not stall fetch.
    sim.cores[0].operate(&mut sim.uncore, false);
    sim.cores[0].init_instruction(direct_jump(0x1000, 0x2000), false, &mut sim.uncore);
    assert_eq!(sim.cores[0].stats.branch_mispredictions, 1);
    assert!(!sim.cores[0].fetch_stall);

    // Second sighting, after warmup: the BTB supplies the target and marks
    // it always-taken, so the prediction agrees with the trace.
    sim.warmup_complete[0] = true;
    sim.cores[0].operate(&mut sim.uncore, true);
    let before = sim.cores[0].instrs_to_read_this_cycle;
    assert!(before > 0);
    sim.cores[0].init_instruction(direct_jump(0x1000, 0x2000), true, &mut sim.uncore);

    let instr = sim.cores[0].ifetch_buffer.back().unwrap();
    assert!(instr.is_branch);
    assert_eq!(instr.branch_kind, BranchKind::DirectJump);
    assert!(instr.branch_taken);
    assert!(!instr.branch_mispredicted);
    assert_eq!(sim.cores[0].stats.branch_mispredictions, 1);
    // Correctly predicted taken still cuts fetch for the cycle.
    assert_eq!(sim.cores[0].instrs_to_read_this_cycle, 0);
}

#[test]
fn test_mispredicted_conditional_stalls_fetch() {
    let mut sim = single_core();
    sim.warmup_complete[0] = true;

    sim.cores[0].operate(&mut sim.uncore, true);
    sim.cores[0].init_instruction(conditional(0x1000, 0x3000, true), true, &mut sim.uncore);

    let core = &sim.cores[0];
    assert_eq!(core.stats.branch_mispredictions, 1);
    assert!(core.fetch_stall);
    assert_eq!(core.instrs_to_read_this_cycle, 0);
    let instr = core.ifetch_buffer.back().unwrap();
    assert_eq!(instr.branch_kind, BranchKind::Conditional);
    assert!(instr.branch_mispredicted);
}

#[test]
fn test_mispredictions_during_warmup_do_not_stall() {
    let mut sim = single_core();

    sim.cores[0].operate(&mut sim.uncore, false);
    sim.cores[0].init_instruction(conditional(0x1000, 0x3000, true), false, &mut sim.uncore);

    let core = &sim.cores[0];
    // Counted for statistics, but fetch keeps running.
    assert_eq!(core.stats.branch_mispredictions, 1);
    assert!(!core.fetch_stall);
    assert!(!core.ifetch_buffer.back().unwrap().branch_mispredicted);
}

#[test]
fn test_stack_pointer_folding_drops_the_sp_destination() {
    let mut sim = single_core();
    sim.warmup_complete[0] = true;

    // A direct call: reads SP and IP, writes SP and IP.
    let call = Instruction {
        ip: 0x1000,
        source_registers: vec![REG_STACK_POINTER, REG_INSTRUCTION_POINTER],
        destination_registers: vec![REG_STACK_POINTER, REG_INSTRUCTION_POINTER],
        branch_taken: true,
        branch_target: 0x4000,
        ..Instruction::default()
    };
    sim.cores[0].operate(&mut sim.uncore, true);
    sim.cores[0].init_instruction(call, true, &mut sim.uncore);

    let instr = sim.cores[0].ifetch_buffer.back().unwrap();
    assert_eq!(instr.branch_kind, BranchKind::DirectCall);
    // SP left the destination set; IP destination plus both sources remain.
    assert_eq!(instr.destination_registers, vec![REG_INSTRUCTION_POINTER]);
    assert_eq!(instr.num_reg_ops, 3);
}

#[test]
fn test_store_to_load_forwarding_consumes_no_load_queue_slot() {
    let mut sim = single_core();
    sim.warmup_complete[0] = true;

    // A completed store to the address already sits in the SQ.
    let store_va = 0xABCD00u64;
    *sim.cores[0].sq.at_mut(0) = LsqEntry {
        instr_id: 900,
        virtual_address: store_va,
        physical_address: 0,
        ip: 0x900,
        asid: [0, 0],
        rob: None,
        translated: Progress::Completed,
        fetched: Progress::Completed,
        event_cycle: 0,
    };

    let load = Instruction {
        ip: 0x1000,
        source_memory: vec![MemOperand::new(store_va)],
        ..Instruction::default()
    };
    sim.cores[0].operate(&mut sim.uncore, true);
    sim.cores[0].init_instruction(load, true, &mut sim.uncore);
    let load_id = sim.cores[0].ifetch_buffer.back().unwrap().id;

    // Walk the load through fetch, decode, dispatch, and memory scheduling.
    for _ in 0..5000 {
        sim.step().unwrap();
        let core = &sim.cores[0];
        let found = core
            .rob
            .slots()
            .map(|s| core.rob.get(s).unwrap())
            .find(|e| e.id == load_id);
        if let Some(entry) = found {
            if entry.source_memory[0].added {
                assert_eq!(entry.num_mem_ops, 0, "forwarding satisfies the operand");
                assert!(entry.source_memory[0].lsq.is_none(), "no LQ slot consumed");
                assert_eq!(sim.cores[0].lq.occupancy(), 0);
                return;
            }
        }
    }
    panic!("load never reached memory scheduling");
}

#[test]
fn test_rob_ids_stay_monotone_under_load() {
    let mut sim = single_core();

    for n in 0..40u64 {
        sim.cores[0].operate(&mut sim.uncore, false);
        let instr = Instruction {
            ip: 0x1000 + n * 4,
            destination_registers: vec![3],
            source_registers: vec![3],
            ..Instruction::default()
        };
        sim.cores[0].init_instruction(instr, false, &mut sim.uncore);
    }

    for _ in 0..2000 {
        sim.step().unwrap();
        let core = &sim.cores[0];
        let ids: Vec<u64> = core.rob.slots().map(|s| core.rob.get(s).unwrap().id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "ROB out of order: {ids:?}");
        if core.num_retired == 40 {
            return;
        }
    }
    panic!("pipeline did not retire the window");
}

// ----------------------------------------------------------------------
// Full phase loop over a synthetic trace file
// ----------------------------------------------------------------------

/// Serializes one standard-format trace record.
fn record(
    ip: u64,
    branch: Option<bool>,
    dregs: [u8; 2],
    sregs: [u8; 2],
    dmem: [u64; 2],
    smem: [u64; 2],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(46);
    out.extend_from_slice(&ip.to_le_bytes());
    out.push(branch.is_some() as u8);
    out.push(branch.unwrap_or(false) as u8);
    out.extend_from_slice(&dregs);
    out.extend_from_slice(&sregs);
    for a in dmem {
        out.extend_from_slice(&a.to_le_bytes());
    }
    for a in smem {
        out.extend_from_slice(&a.to_le_bytes());
    }
    out
}

#[test]
fn test_full_run_over_synthetic_loop_trace() {
    // A small loop: ALU chain, one store, one load from the same address,
    // and a taken conditional branch back to the top.
    let mut records = Vec::new();
    for i in 0..6u64 {
        records.push(record(
            0x1000 + i * 4,
            None,
            [3, 0],
            [3, 0],
            [0, 0],
            [0, 0],
        ));
    }
    records.push(record(0x1018, None, [0, 0], [4, 0], [0x5000, 0], [0, 0]));
    records.push(record(0x101c, None, [5, 0], [0, 0], [0, 0], [0x5000, 0]));
    records.push(record(
        0x1020,
        Some(true),
        [REG_INSTRUCTION_POINTER, 0],
        [REG_FLAGS, REG_INSTRUCTION_POINTER],
        [0, 0],
        [0, 0],
    ));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    for r in &records {
        file.write_all(r).unwrap();
    }
    file.flush().unwrap();

    let mut sim = single_core();
    let reader =
        TraceReader::open(file.path().to_str().unwrap(), 0, TraceFormat::Standard).unwrap();
    sim.set_traces(vec![reader]).unwrap();
    sim.run(200, 500).unwrap();

    let core = &sim.cores[0];
    assert!(core.num_retired >= 700);
    assert!(core.current_cycle > 0);
    assert!(core.stats.num_branch > 0);
    // The measured region retired at least the requested instruction count.
    assert!(core.finish_phase_instr - core.begin_phase_instr >= 500);
    assert!(core.finish_phase_cycle > core.begin_phase_cycle);

    // Every valid LSQ slot still references a live ROB entry.
    for entry in core.lq.entries().iter().chain(core.sq.entries()) {
        if entry.is_valid() {
            let owner = entry.rob.expect("valid slot carries its owner");
            assert!(
                core.rob.resolve(owner).is_some(),
                "LSQ slot outlived its ROB entry"
            );
        }
    }
}
