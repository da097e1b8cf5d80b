//! Memory-side components: packets, queues, caches, DRAM, and the wiring
//! that connects them.

/// Generic set-associative cache / TLB level.
pub mod cache;
/// Off-chip DRAM controller.
pub mod dram;
/// Node arena, downstream views, and completion routing.
pub mod hierarchy;
/// Request packets, sinks, and the CPU-side return bus.
pub mod packet;
/// Prefetcher plug-ins.
pub mod prefetch;
/// Latency-gated bounded FIFO.
pub mod queue;
/// Replacement policy plug-ins.
pub mod replacement;
