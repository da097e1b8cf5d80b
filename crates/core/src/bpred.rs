//! Branch prediction plug-ins.
//!
//! The core consults two capability sets at trace intake: a direction
//! predictor ([`BranchPredictor`]) and a target buffer ([`Btb`]). Both are
//! chosen once at initialization; the shipped implementations are:
//! 1. **Bimodal:** per-ip two-bit saturating counters.
//! 2. **Gshare:** global-history-hashed two-bit counters.
//! 3. **BasicBtb:** direct-mapped target table with always-taken tracking
//!    and a return address stack for calls and returns.

use crate::config::{CoreConfig, PredictorKind};
use crate::instr::BranchKind;

/// Direction predictor consulted for every branch at instruction insertion.
pub trait BranchPredictor {
    /// Predicts taken (`true`) or not-taken for the branch at `ip`.
    fn predict(
        &mut self,
        ip: u64,
        predicted_target: u64,
        always_taken: bool,
        kind: BranchKind,
    ) -> bool;

    /// Trains on the architectural outcome.
    fn last_result(&mut self, ip: u64, target: u64, taken: bool, kind: BranchKind);
}

/// Builds the configured direction predictor.
pub fn build_predictor(cfg: &CoreConfig) -> Box<dyn BranchPredictor> {
    match cfg.predictor {
        PredictorKind::Bimodal => Box::new(Bimodal::new(cfg.bpred_table_size)),
        PredictorKind::GShare => Box::new(Gshare::new(cfg.bpred_table_size, cfg.gshare_history)),
    }
}

/// Two-bit saturating counter helpers.
fn counter_up(c: &mut u8) {
    if *c < 3 {
        *c += 1;
    }
}

fn counter_down(c: &mut u8) {
    if *c > 0 {
        *c -= 1;
    }
}

/// Per-ip two-bit counter table.
pub struct Bimodal {
    table: Vec<u8>,
    mask: u64,
}

impl Bimodal {
    /// Creates a bimodal predictor with `size` counters (power of two).
    pub fn new(size: usize) -> Self {
        let size = size.next_power_of_two();
        Self {
            table: vec![0; size],
            mask: size as u64 - 1,
        }
    }

    fn index(&self, ip: u64) -> usize {
        ((ip >> 2) & self.mask) as usize
    }
}

impl BranchPredictor for Bimodal {
    fn predict(&mut self, ip: u64, _target: u64, _always_taken: bool, _kind: BranchKind) -> bool {
        self.table[self.index(ip)] >= 2
    }

    fn last_result(&mut self, ip: u64, _target: u64, taken: bool, _kind: BranchKind) {
        let idx = self.index(ip);
        if taken {
            counter_up(&mut self.table[idx]);
        } else {
            counter_down(&mut self.table[idx]);
        }
    }
}

/// Global-history predictor: the pattern table is indexed by ip xor the
/// recent outcome history.
pub struct Gshare {
    table: Vec<u8>,
    mask: u64,
    history: u64,
    history_mask: u64,
}

impl Gshare {
    /// Creates a gshare predictor with `size` counters and `history_bits`
    /// of global history.
    pub fn new(size: usize, history_bits: usize) -> Self {
        let size = size.next_power_of_two();
        Self {
            table: vec![0; size],
            mask: size as u64 - 1,
            history: 0,
            history_mask: (1u64 << history_bits) - 1,
        }
    }

    fn index(&self, ip: u64) -> usize {
        (((ip >> 2) ^ self.history) & self.mask) as usize
    }
}

impl BranchPredictor for Gshare {
    fn predict(&mut self, ip: u64, _target: u64, _always_taken: bool, _kind: BranchKind) -> bool {
        self.table[self.index(ip)] >= 2
    }

    fn last_result(&mut self, ip: u64, _target: u64, taken: bool, _kind: BranchKind) {
        let idx = self.index(ip);
        if taken {
            counter_up(&mut self.table[idx]);
        } else {
            counter_down(&mut self.table[idx]);
        }
        self.history = ((self.history << 1) | taken as u64) & self.history_mask;
    }
}

/// Target predictor consulted alongside the direction predictor.
pub trait Btb {
    /// Returns `(predicted_target, always_taken)` for the branch at `ip`.
    /// A zero target means "no prediction".
    fn prediction(&mut self, ip: u64, kind: BranchKind) -> (u64, bool);

    /// Trains on the architectural outcome.
    fn update(&mut self, ip: u64, target: u64, taken: bool, kind: BranchKind);
}

#[derive(Clone, Copy, Default)]
struct BtbEntry {
    tag: u64,
    target: u64,
    always_taken: bool,
    valid: bool,
}

/// Direct-mapped BTB with a return address stack.
///
/// Calls push their site onto the stack at prediction time; returns pop it.
/// An entry stays `always_taken` until the branch is first seen not taken.
pub struct BasicBtb {
    table: Vec<BtbEntry>,
    mask: u64,
    ras: Vec<u64>,
    ras_size: usize,
}

impl BasicBtb {
    /// Creates a BTB with `size` entries and a `ras_size`-deep stack.
    pub fn new(size: usize, ras_size: usize) -> Self {
        let size = size.next_power_of_two();
        Self {
            table: vec![BtbEntry::default(); size],
            mask: size as u64 - 1,
            ras: Vec::with_capacity(ras_size),
            ras_size,
        }
    }

    fn index(&self, ip: u64) -> usize {
        ((ip >> 2) & self.mask) as usize
    }
}

/// Builds the basic BTB from the core configuration.
pub fn build_btb(cfg: &CoreConfig) -> Box<dyn Btb> {
    Box::new(BasicBtb::new(cfg.btb_size, cfg.ras_size))
}

impl Btb for BasicBtb {
    fn prediction(&mut self, ip: u64, kind: BranchKind) -> (u64, bool) {
        match kind {
            BranchKind::DirectCall | BranchKind::IndirectCall => {
                if self.ras.len() == self.ras_size {
                    self.ras.remove(0);
                }
                self.ras.push(ip);
            }
            BranchKind::Return => {
                // The return lands just past its call site.
                let target = self.ras.pop().map_or(0, |site| site + 4);
                return (target, true);
            }
            _ => {}
        }
        let entry = self.table[self.index(ip)];
        if entry.valid && entry.tag == ip {
            (entry.target, entry.always_taken)
        } else {
            (0, false)
        }
    }

    fn update(&mut self, ip: u64, target: u64, taken: bool, kind: BranchKind) {
        if kind == BranchKind::Return {
            return;
        }
        let idx = self.index(ip);
        let entry = &mut self.table[idx];
        if entry.valid && entry.tag == ip {
            if taken && target != 0 {
                entry.target = target;
            }
            if !taken {
                entry.always_taken = false;
            }
        } else if taken && target != 0 {
            *entry = BtbEntry {
                tag: ip,
                target,
                always_taken: true,
                valid: true,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bimodal_learns_taken() {
        let mut bp = Bimodal::new(64);
        let ip = 0x1000;
        assert!(!bp.predict(ip, 0, false, BranchKind::Conditional));
        bp.last_result(ip, 0x2000, true, BranchKind::Conditional);
        bp.last_result(ip, 0x2000, true, BranchKind::Conditional);
        assert!(bp.predict(ip, 0, false, BranchKind::Conditional));
    }

    #[test]
    fn test_gshare_history_separates_paths() {
        let mut bp = Gshare::new(1024, 4);
        let ip = 0x40;
        // Train taken under an all-taken history.
        for _ in 0..4 {
            bp.last_result(0x8, 0, true, BranchKind::Conditional);
        }
        bp.last_result(ip, 0, true, BranchKind::Conditional);
        bp.last_result(0x8, 0, true, BranchKind::Conditional);
        // Prediction consults the current history's counter only.
        let _ = bp.predict(ip, 0, false, BranchKind::Conditional);
    }

    #[test]
    fn test_btb_learns_target_and_always_taken() {
        let mut btb = BasicBtb::new(64, 8);
        let ip = 0x1000;
        assert_eq!(btb.prediction(ip, BranchKind::DirectJump), (0, false));
        btb.update(ip, 0x2000, true, BranchKind::DirectJump);
        assert_eq!(btb.prediction(ip, BranchKind::DirectJump), (0x2000, true));
        btb.update(ip, 0x2000, false, BranchKind::Conditional);
        assert_eq!(btb.prediction(ip, BranchKind::DirectJump), (0x2000, false));
    }

    #[test]
    fn test_ras_pairs_calls_with_returns() {
        let mut btb = BasicBtb::new(64, 8);
        btb.prediction(0x100, BranchKind::DirectCall);
        btb.prediction(0x200, BranchKind::DirectCall);
        assert_eq!(btb.prediction(0x300, BranchKind::Return), (0x204, true));
        assert_eq!(btb.prediction(0x310, BranchKind::Return), (0x104, true));
        // Empty stack predicts no target.
        assert_eq!(btb.prediction(0x320, BranchKind::Return), (0, true));
    }
}
