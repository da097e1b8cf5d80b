//! Trace-driven simulator CLI.
//!
//! Parses the run knobs, opens one trace per configured CPU, runs the
//! warmup and measured phases, and prints the final reports. Exit codes:
//! 0 on success, 1 when a signal is caught, nonzero on startup errors or
//! internal assertion failures.

use clap::Parser;
use std::process;

use oxsim_core::stats;
use oxsim_core::{SimConfig, Simulation, TraceFormat, TraceReader};

#[derive(Parser, Debug)]
#[command(
    name = "oxsim",
    about = "Multicore out-of-order processor simulator",
    long_about = "Trace-driven, cycle-level simulation of an out-of-order multicore with a \
                  configurable memory hierarchy.\n\nExamples:\n  oxsim --warmup_instructions \
                  1000000 --simulation_instructions 10000000 --traces app.trace\n  oxsim \
                  --cloudsuite --traces web0.trace web1.trace"
)]
struct Cli {
    /// Instructions used to warm caches and predictors before measurement.
    #[arg(long = "warmup_instructions", default_value_t = 1_000_000)]
    warmup_instructions: u64,

    /// Instructions in the measured region of interest.
    #[arg(long = "simulation_instructions", default_value_t = 10_000_000)]
    simulation_instructions: u64,

    /// Suppress the periodic heartbeat lines.
    #[arg(long = "hide_heartbeat")]
    hide_heartbeat: bool,

    /// Read cloudsuite-format traces (four register and memory operands
    /// per direction, with address-space ids).
    #[arg(long)]
    cloudsuite: bool,

    /// Hardware configuration as a JSON file; defaults apply when omitted.
    #[arg(long)]
    config: Option<String>,

    /// Per-CPU trace files; the count must match the configured core count.
    #[arg(long, num_args = 1.., value_name = "TRACE", required = true)]
    traces: Vec<String>,
}

/// Derives the randomization seed from the trace names, so identical
/// invocations map pages identically.
fn seed_from_traces(paths: &[String]) -> u64 {
    paths
        .iter()
        .flat_map(|p| p.bytes())
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
}

fn main() {
    ctrlc::set_handler(|| {
        println!("Caught signal: SIGINT");
        process::exit(1);
    })
    .expect("installing the SIGINT handler");

    let cli = Cli::parse();

    println!();
    println!("*** Multicore Out-of-Order Simulator ***");
    println!();

    let config: SimConfig = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).unwrap_or_else(|e| {
                eprintln!("cannot read config {path}: {e}");
                process::exit(2);
            });
            serde_json::from_str(&text).unwrap_or_else(|e| {
                eprintln!("cannot parse config {path}: {e}");
                process::exit(2);
            })
        }
        None => SimConfig::default(),
    };

    println!("Warmup Instructions: {}", cli.warmup_instructions);
    println!("Simulation Instructions: {}", cli.simulation_instructions);
    println!("Number of CPUs: {}", config.num_cpus);
    println!();

    let format = if cli.cloudsuite {
        TraceFormat::Cloudsuite
    } else {
        TraceFormat::Standard
    };
    if cli.traces.len() != config.num_cpus {
        eprintln!(
            "*** {} trace(s) given for {} configured core(s) ***",
            cli.traces.len(),
            config.num_cpus
        );
        process::exit(2);
    }

    let seed = seed_from_traces(&cli.traces);
    let mut sim = Simulation::new(&config, seed).unwrap_or_else(|e| {
        eprintln!("configuration error: {e}");
        process::exit(2);
    });
    sim.set_show_heartbeat(!cli.hide_heartbeat);

    let mut readers = Vec::with_capacity(cli.traces.len());
    for (cpu, path) in cli.traces.iter().enumerate() {
        println!("CPU {cpu} runs {path}");
        match TraceReader::open(path, cpu, format) {
            Ok(reader) => readers.push(reader),
            Err(e) => {
                eprintln!("{e}");
                process::exit(2);
            }
        }
    }
    println!();
    sim.set_traces(readers).expect("trace count checked above");

    if let Err(e) = sim.run(cli.warmup_instructions, cli.simulation_instructions) {
        eprintln!("{e}");
        process::exit(2);
    }

    println!();
    println!("Simulation complete for all CPUs");
    println!();

    if config.num_cpus > 1 {
        stats::print_sim_stats(&sim);
        println!();
    }
    stats::print_roi_stats(&sim);
    stats::print_plugin_final_stats(&sim);
    stats::print_dram_stats(&sim);
    stats::print_branch_stats(&sim);
}
