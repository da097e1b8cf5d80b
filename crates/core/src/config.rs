//! Configuration system for the simulator.
//!
//! This module defines all configuration structures and enums used to
//! parameterize the model. It provides:
//! 1. **Defaults:** Baseline hardware constants (pipeline widths, buffer and
//!    queue sizes, latencies, cache and TLB geometry, DRAM timing).
//! 2. **Structures:** Hierarchical config for the core, each cache level, the
//!    page-table walker, and the memory controller.
//! 3. **Enums:** Branch predictor, BTB, and prefetcher selection.
//!
//! Configuration is supplied as JSON (see the CLI's `--config` option) or via
//! `SimConfig::default()`.

use serde::Deserialize;

use crate::error::ConfigError;

/// Default configuration constants.
///
/// These values define the baseline hardware configuration when not
/// explicitly overridden in a configuration file.
mod defaults {
    /// Number of simulated CPU cores.
    pub const NUM_CPUS: usize = 1;

    /// Instructions brought into the front end per cycle.
    pub const FETCH_WIDTH: usize = 6;

    /// Instructions moved from decode to dispatch per cycle.
    pub const DECODE_WIDTH: usize = 6;

    /// Instructions moved from dispatch into the ROB per cycle.
    pub const DISPATCH_WIDTH: usize = 6;

    /// Non-memory instructions issued to execution per cycle.
    pub const EXEC_WIDTH: usize = 4;

    /// Loads the LSQ may issue per cycle.
    pub const LQ_WIDTH: usize = 2;

    /// Stores the LSQ may issue per cycle.
    pub const SQ_WIDTH: usize = 2;

    /// Instructions retired from the ROB head per cycle.
    pub const RETIRE_WIDTH: usize = 5;

    /// ROB entries examined by the scheduling stages per cycle.
    pub const SCHEDULER_SIZE: usize = 128;

    /// Capacity of the instruction fetch buffer.
    pub const IFETCH_BUFFER_SIZE: usize = 64;

    /// Capacity of the decode buffer.
    pub const DECODE_BUFFER_SIZE: usize = 32;

    /// Capacity of the dispatch buffer.
    pub const DISPATCH_BUFFER_SIZE: usize = 32;

    /// Reorder buffer capacity.
    pub const ROB_SIZE: usize = 256;

    /// Load queue slots.
    pub const LQ_SIZE: usize = 72;

    /// Store queue slots.
    pub const SQ_SIZE: usize = 56;

    /// Cycles an instruction spends in the decode buffer after warmup.
    pub const DECODE_LATENCY: u64 = 2;

    /// Cycles an instruction spends in the dispatch buffer after warmup.
    pub const DISPATCH_LATENCY: u64 = 2;

    /// Cycles between scheduling and readiness after warmup.
    pub const SCHEDULING_LATENCY: u64 = 2;

    /// Execution latency for non-memory instructions after warmup.
    pub const EXEC_LATENCY: u64 = 1;

    /// Fetch-stall cycles paid on a branch misprediction.
    pub const BRANCH_MISPREDICT_PENALTY: u64 = 20;

    /// Byte window covered by one decoded-instruction-buffer entry.
    pub const DIB_WINDOW: u64 = 16;

    /// Decoded-instruction-buffer sets.
    pub const DIB_SETS: usize = 32;

    /// Decoded-instruction-buffer ways.
    pub const DIB_WAYS: usize = 8;

    /// Branch predictor pattern table entries (bimodal and gshare).
    pub const BPRED_TABLE_SIZE: usize = 16384;

    /// Gshare global history length in bits.
    pub const GSHARE_HISTORY: usize = 14;

    /// Branch target buffer entries.
    pub const BTB_SIZE: usize = 1024;

    /// Return address stack depth.
    pub const RAS_SIZE: usize = 64;
}

/// Branch direction predictor selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PredictorKind {
    /// Per-ip two-bit saturating counters.
    #[default]
    Bimodal,
    /// Global-history-xor-ip indexed two-bit counters.
    GShare,
}

/// Hardware prefetcher selection for a cache level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PrefetcherKind {
    /// No prefetching.
    #[default]
    None,
    /// Prefetch the next sequential line on every access.
    NextLine,
}

/// Pipeline widths, buffer capacities, and stage latencies for one core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Instructions read from the trace per cycle.
    pub fetch_width: usize,
    /// Decode bandwidth per cycle.
    pub decode_width: usize,
    /// Dispatch bandwidth per cycle.
    pub dispatch_width: usize,
    /// Non-memory execute bandwidth per cycle.
    pub exec_width: usize,
    /// Load-issue bandwidth per cycle.
    pub lq_width: usize,
    /// Store-issue bandwidth per cycle.
    pub sq_width: usize,
    /// Retire bandwidth per cycle.
    pub retire_width: usize,
    /// Scheduler search window, in not-yet-executed ROB entries.
    pub scheduler_size: usize,
    /// Instruction fetch buffer capacity.
    pub ifetch_buffer_size: usize,
    /// Decode buffer capacity.
    pub decode_buffer_size: usize,
    /// Dispatch buffer capacity.
    pub dispatch_buffer_size: usize,
    /// Reorder buffer capacity.
    pub rob_size: usize,
    /// Load queue slots.
    pub lq_size: usize,
    /// Store queue slots.
    pub sq_size: usize,
    /// Decode-buffer residency after warmup, in cycles.
    pub decode_latency: u64,
    /// Dispatch-buffer residency after warmup, in cycles.
    pub dispatch_latency: u64,
    /// Scheduling latency after warmup, in cycles.
    pub scheduling_latency: u64,
    /// Non-memory execution latency after warmup, in cycles.
    pub exec_latency: u64,
    /// Fetch-resume delay after a detected misprediction, in cycles.
    pub branch_mispredict_penalty: u64,
    /// DIB window size in bytes (power of two).
    pub dib_window: u64,
    /// DIB sets.
    pub dib_sets: usize,
    /// DIB ways.
    pub dib_ways: usize,
    /// Branch direction predictor.
    pub predictor: PredictorKind,
    /// Predictor pattern table entries.
    pub bpred_table_size: usize,
    /// Gshare history length in bits.
    pub gshare_history: usize,
    /// BTB entries.
    pub btb_size: usize,
    /// Return address stack depth.
    pub ras_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            fetch_width: defaults::FETCH_WIDTH,
            decode_width: defaults::DECODE_WIDTH,
            dispatch_width: defaults::DISPATCH_WIDTH,
            exec_width: defaults::EXEC_WIDTH,
            lq_width: defaults::LQ_WIDTH,
            sq_width: defaults::SQ_WIDTH,
            retire_width: defaults::RETIRE_WIDTH,
            scheduler_size: defaults::SCHEDULER_SIZE,
            ifetch_buffer_size: defaults::IFETCH_BUFFER_SIZE,
            decode_buffer_size: defaults::DECODE_BUFFER_SIZE,
            dispatch_buffer_size: defaults::DISPATCH_BUFFER_SIZE,
            rob_size: defaults::ROB_SIZE,
            lq_size: defaults::LQ_SIZE,
            sq_size: defaults::SQ_SIZE,
            decode_latency: defaults::DECODE_LATENCY,
            dispatch_latency: defaults::DISPATCH_LATENCY,
            scheduling_latency: defaults::SCHEDULING_LATENCY,
            exec_latency: defaults::EXEC_LATENCY,
            branch_mispredict_penalty: defaults::BRANCH_MISPREDICT_PENALTY,
            dib_window: defaults::DIB_WINDOW,
            dib_sets: defaults::DIB_SETS,
            dib_ways: defaults::DIB_WAYS,
            predictor: PredictorKind::default(),
            bpred_table_size: defaults::BPRED_TABLE_SIZE,
            gshare_history: defaults::GSHARE_HISTORY,
            btb_size: defaults::BTB_SIZE,
            ras_size: defaults::RAS_SIZE,
        }
    }
}

/// Geometry and queue sizing for one cache or TLB level.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheLevelConfig {
    /// Number of sets (power of two).
    pub sets: usize,
    /// Associativity.
    pub ways: usize,
    /// Read queue capacity.
    pub rq_size: usize,
    /// Write queue capacity.
    pub wq_size: usize,
    /// Prefetch queue capacity.
    pub pq_size: usize,
    /// Miss status holding registers.
    pub mshr_size: usize,
    /// Queue residency before a request is eligible for service, in cycles.
    pub latency: u64,
    /// Read-queue entries serviced per cycle.
    pub max_read: usize,
    /// MSHR fills performed per cycle.
    pub max_fill: usize,
    /// Hardware prefetcher.
    pub prefetcher: PrefetcherKind,
}

impl Default for CacheLevelConfig {
    fn default() -> Self {
        Self {
            sets: 64,
            ways: 8,
            rq_size: 32,
            wq_size: 32,
            pq_size: 16,
            mshr_size: 16,
            latency: 4,
            max_read: 1,
            max_fill: 1,
            prefetcher: PrefetcherKind::None,
        }
    }
}

impl CacheLevelConfig {
    fn sized(
        sets: usize,
        ways: usize,
        rq: usize,
        wq: usize,
        pq: usize,
        mshr: usize,
        latency: u64,
        max_read: usize,
    ) -> Self {
        Self {
            sets,
            ways,
            rq_size: rq,
            wq_size: wq,
            pq_size: pq,
            mshr_size: mshr,
            latency,
            max_read,
            max_fill: 1,
            prefetcher: PrefetcherKind::None,
        }
    }
}

/// Paging-structure cache geometry for one level.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PsclConfig {
    /// Number of sets.
    pub sets: usize,
    /// Associativity.
    pub ways: usize,
}

impl Default for PsclConfig {
    fn default() -> Self {
        Self { sets: 1, ways: 2 }
    }
}

/// Page-table walker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PtwConfig {
    /// PSCL for level-5 translations.
    pub pscl5: PsclConfig,
    /// PSCL for level-4 translations.
    pub pscl4: PsclConfig,
    /// PSCL for level-3 translations.
    pub pscl3: PsclConfig,
    /// PSCL for level-2 translations.
    pub pscl2: PsclConfig,
    /// Read queue capacity.
    pub rq_size: usize,
    /// Concurrent walks.
    pub mshr_size: usize,
    /// Walk initiations per cycle.
    pub max_read: usize,
    /// Walk steps advanced per cycle.
    pub max_fill: usize,
}

impl Default for PtwConfig {
    fn default() -> Self {
        Self {
            pscl5: PsclConfig { sets: 1, ways: 2 },
            pscl4: PsclConfig { sets: 1, ways: 4 },
            pscl3: PsclConfig { sets: 2, ways: 4 },
            pscl2: PsclConfig { sets: 4, ways: 8 },
            rq_size: 16,
            mshr_size: 8,
            max_read: 2,
            max_fill: 2,
        }
    }
}

/// Off-chip memory controller configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DramConfig {
    /// Independent channels.
    pub channels: usize,
    /// Row-buffer span in bytes.
    pub row_size: u64,
    /// Column access latency in cycles (open-row hit).
    pub t_cas: u64,
    /// Row activation latency in cycles.
    pub t_ras: u64,
    /// Precharge latency in cycles.
    pub t_pre: u64,
    /// Data-bus occupancy per transfer, in cycles.
    pub dbus_turnaround: u64,
    /// Read queue capacity per channel.
    pub rq_size: usize,
    /// Write queue capacity per channel.
    pub wq_size: usize,
}

impl Default for DramConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            row_size: 8192,
            t_cas: 14,
            t_ras: 14,
            t_pre: 14,
            dbus_turnaround: 4,
            rq_size: 64,
            wq_size: 64,
        }
    }
}

/// Root configuration for an entire simulation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Number of CPU cores (each gets a private cache/TLB slice).
    pub num_cpus: usize,
    /// Per-core pipeline configuration.
    pub core: CoreConfig,
    /// Instruction TLB.
    pub itlb: CacheLevelConfig,
    /// Data TLB.
    pub dtlb: CacheLevelConfig,
    /// Second-level TLB.
    pub stlb: CacheLevelConfig,
    /// Level-1 instruction cache.
    pub l1i: CacheLevelConfig,
    /// Level-1 data cache.
    pub l1d: CacheLevelConfig,
    /// Private level-2 cache.
    pub l2c: CacheLevelConfig,
    /// Shared last-level cache (sets are per core and scaled at build time).
    pub llc: CacheLevelConfig,
    /// Page-table walker.
    pub ptw: PtwConfig,
    /// Memory controller.
    pub dram: DramConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            num_cpus: defaults::NUM_CPUS,
            core: CoreConfig::default(),
            itlb: CacheLevelConfig::sized(16, 4, 16, 16, 8, 8, 1, 2),
            dtlb: CacheLevelConfig::sized(16, 4, 16, 16, 8, 8, 1, 2),
            stlb: CacheLevelConfig::sized(128, 12, 32, 32, 8, 16, 8, 1),
            l1i: CacheLevelConfig::sized(64, 8, 64, 64, 32, 8, 4, 2),
            l1d: CacheLevelConfig::sized(64, 12, 64, 64, 8, 16, 5, 2),
            l2c: CacheLevelConfig::sized(1024, 8, 32, 32, 16, 32, 10, 1),
            llc: CacheLevelConfig::sized(2048, 16, 32, 32, 32, 64, 20, 1),
            ptw: PtwConfig::default(),
            dram: DramConfig::default(),
        }
    }
}

impl SimConfig {
    /// Checks structural requirements that the model depends on.
    ///
    /// Set counts must be powers of two (indexing uses masks), and every
    /// per-cycle width must be nonzero or the pipeline would never move.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_cpus == 0 {
            return Err(ConfigError::Invalid("num_cpus must be at least 1"));
        }
        let widths = [
            self.core.fetch_width,
            self.core.decode_width,
            self.core.dispatch_width,
            self.core.exec_width,
            self.core.lq_width,
            self.core.sq_width,
            self.core.retire_width,
        ];
        if widths.contains(&0) {
            return Err(ConfigError::Invalid("pipeline widths must be nonzero"));
        }
        if !self.core.dib_window.is_power_of_two() {
            return Err(ConfigError::Invalid("dib_window must be a power of two"));
        }
        for (name, sets) in [
            ("itlb", self.itlb.sets),
            ("dtlb", self.dtlb.sets),
            ("stlb", self.stlb.sets),
            ("l1i", self.l1i.sets),
            ("l1d", self.l1d.sets),
            ("l2c", self.l2c.sets),
            ("llc", self.llc.sets),
        ] {
            if !sets.is_power_of_two() {
                return Err(ConfigError::InvalidSets(name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(SimConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_cpus() {
        let mut cfg = SimConfig::default();
        cfg.num_cpus = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_non_pow2_sets() {
        let mut cfg = SimConfig::default();
        cfg.l1d.sets = 48;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_deserializes_partial_json() {
        let json = r#"{
            "num_cpus": 2,
            "core": { "fetch_width": 4, "rob_size": 128 },
            "l1d": { "sets": 32, "ways": 8 }
        }"#;
        let cfg: SimConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.num_cpus, 2);
        assert_eq!(cfg.core.fetch_width, 4);
        assert_eq!(cfg.core.rob_size, 128);
        assert_eq!(cfg.l1d.sets, 32);
        // untouched fields keep their defaults
        assert_eq!(cfg.core.decode_width, 6);
        assert!(cfg.validate().is_ok());
    }
}
