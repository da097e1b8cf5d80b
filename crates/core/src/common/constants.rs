//! Global system constants.
//!
//! This module defines system-wide constants used across the simulator:
//! 1. **Memory geometry:** Page and cache-block sizes, shifts, and masks.
//! 2. **Paging:** Page-table depth, entries per table node, and the reserved
//!    virtual region used to back page-table pages.
//! 3. **Protocol:** The back-pressure return code shared by every bounded
//!    queue, and the request-type count used to size statistics tables.
//! 4. **Supervision:** Deadlock threshold and heartbeat period.

/// Number of bits in the page offset (4 KiB pages).
pub const PAGE_SHIFT: u32 = 12;

/// Page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Number of bits in the cache-block offset (64-byte lines).
pub const BLOCK_SHIFT: u32 = 6;

/// Cache block size in bytes.
pub const BLOCK_SIZE: u64 = 1 << BLOCK_SHIFT;

/// Number of virtual-address bits that participate in translation.
pub const VA_BITS: u32 = 57;

/// Depth of the simulated page table (five radix levels).
pub const PT_LEVELS: u8 = 5;

/// Entries per page-table node (9 index bits per level).
pub const PT_ENTRIES: usize = 512;

/// Virtual region from which page-table pages themselves are allocated.
/// Ordinary translation requests must never target this region.
pub const PT_REGION_BASE: u64 = 0xf000_000f << 32;

/// Return code for a refused queue insertion. The producer must retry next
/// cycle without consuming its source slot.
pub const QUEUE_REFUSED: i32 = -2;

/// Number of request types, used to size per-type statistics arrays.
pub const NUM_REQUEST_TYPES: usize = 5;

/// Number of branch categories (including "not a branch").
pub const NUM_BRANCH_KINDS: usize = 8;

/// Cycles a ROB head may sit unmoved before the watchdog declares deadlock.
pub const DEADLOCK_CYCLE: u64 = 1_000_000;

/// Retired-instruction interval between heartbeat report lines.
pub const HEARTBEAT_PERIOD: u64 = 10_000_000;

/// Fill-level tag: a returned line populates the level-1 cache.
pub const FILL_L1: u32 = 1;
/// Fill-level tag for the level-2 cache.
pub const FILL_L2: u32 = 2;
/// Fill-level tag for the last-level cache.
pub const FILL_LLC: u32 = 4;
/// Fill-level tag for off-chip memory.
pub const FILL_DRAM: u32 = 8;
