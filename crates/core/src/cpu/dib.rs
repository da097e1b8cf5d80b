//! Decoded instruction buffer.
//!
//! A small set-associative memory of recently fetched-and-decoded code
//! windows. A hit at fetch time short-circuits translation, fetch, and
//! decode for the whole window.

use crate::common::lg2;

struct DibWay {
    valid: bool,
    /// ip truncated to the window granularity.
    address: u64,
    lru: u32,
}

/// The DIB array.
pub struct Dib {
    window_shift: u32,
    sets: usize,
    ways: usize,
    blocks: Vec<DibWay>,
}

impl Dib {
    /// Creates a DIB covering `window`-byte regions in `sets` x `ways`.
    pub fn new(window: u64, sets: usize, ways: usize) -> Self {
        let blocks = (0..sets * ways)
            .map(|_| DibWay {
                valid: false,
                address: 0,
                lru: 0,
            })
            .collect();
        Self {
            window_shift: lg2(window),
            sets,
            ways,
            blocks,
        }
    }

    fn set_of(&self, ip: u64) -> usize {
        ((ip >> self.window_shift) as usize) % self.sets
    }

    fn matches(&self, way: &DibWay, ip: u64) -> bool {
        way.valid && (way.address >> self.window_shift) == (ip >> self.window_shift)
    }

    /// Probes for `ip`'s window; promotes the way on a hit.
    pub fn check(&mut self, ip: u64) -> bool {
        let set = self.set_of(ip);
        let base = set * self.ways;
        match (0..self.ways).find(|&w| self.matches(&self.blocks[base + w], ip)) {
            Some(way) => {
                self.promote(base, way);
                true
            }
            None => false,
        }
    }

    /// Records `ip`'s window as decoded, inserting over the max-LRU victim
    /// if it is not already present, then promotes it.
    pub fn update(&mut self, ip: u64) {
        let set = self.set_of(ip);
        let base = set * self.ways;
        let way = (0..self.ways)
            .find(|&w| self.matches(&self.blocks[base + w], ip))
            .unwrap_or_else(|| {
                let victim = (0..self.ways)
                    .max_by_key(|&w| self.blocks[base + w].lru)
                    .unwrap();
                self.blocks[base + victim].valid = true;
                self.blocks[base + victim].address = ip;
                victim
            });
        self.promote(base, way);
    }

    /// Ages every way at or below the touched way's recency, then marks the
    /// touched way most recent.
    fn promote(&mut self, base: usize, way: usize) {
        let hit_lru = self.blocks[base + way].lru;
        for w in 0..self.ways {
            if self.blocks[base + w].lru <= hit_lru {
                self.blocks[base + w].lru = self.blocks[base + w].lru.wrapping_add(1);
            }
        }
        self.blocks[base + way].lru = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_miss_then_hit_within_window() {
        let mut dib = Dib::new(16, 4, 2);
        assert!(!dib.check(0x1000));
        dib.update(0x1004);
        // Any ip in the same 16-byte window hits.
        assert!(dib.check(0x1000));
        assert!(dib.check(0x100f));
        assert!(!dib.check(0x1010));
    }

    #[test]
    fn test_eviction_prefers_oldest() {
        let mut dib = Dib::new(16, 1, 2);
        dib.update(0x000);
        dib.update(0x010);
        // Touch the first window so the second becomes the victim.
        assert!(dib.check(0x000));
        dib.update(0x020);
        assert!(dib.check(0x000));
        assert!(!dib.check(0x010));
        assert!(dib.check(0x020));
    }
}
