//! In-flight memory request representation.
//!
//! A [`Packet`] travels down through the hierarchy via the bounded request
//! queues and back up through `return_data`. It carries logical
//! back-references (instruction ids and LSQ slot handles, never pointers)
//! so that stale completions can be detected and discarded after a ring
//! buffer wraps.

use std::collections::VecDeque;

use crate::cpu::lsq::LsqRef;

/// Request classification, used for routing and statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RequestKind {
    /// Demand read.
    #[default]
    Load = 0,
    /// Read-for-ownership (store side).
    Rfo = 1,
    /// Prefetch.
    Prefetch = 2,
    /// Writeback of an evicted dirty line.
    Writeback = 3,
    /// Page-walk read issued by the PTW.
    Translation = 4,
}

/// Queue selector for occupancy queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    /// Miss status holding registers.
    Mshr = 0,
    /// Read queue.
    Rq = 1,
    /// Write queue.
    Wq = 2,
    /// Prefetch queue.
    Pq = 3,
}

/// The CPU-side return queues a completion can land in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusKind {
    /// Instruction TLB bus.
    Itlb,
    /// L1 instruction cache bus.
    L1i,
    /// Data TLB bus.
    Dtlb,
    /// L1 data cache bus.
    L1d,
}

/// Where a completed request is delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sink {
    /// A node in the memory hierarchy (cache or PTW MSHR fill).
    Node(usize),
    /// A CPU-side cache bus `(cpu, bus)`.
    CoreBus(usize, BusKind),
}

/// An in-flight memory request.
#[derive(Clone, Debug, Default)]
pub struct Packet {
    /// Request address at this level (byte-granular except where a contract
    /// says otherwise).
    pub address: u64,
    /// Original virtual address.
    pub v_address: u64,
    /// Payload. For translations, the resolved physical page number.
    pub data: u64,
    /// Id of the instruction that caused the request.
    pub instr_id: u64,
    /// Instruction pointer of the requester.
    pub ip: u64,
    /// Request classification.
    pub kind: RequestKind,
    /// Cache level the returned data should populate.
    pub fill_level: u32,
    /// Remaining page-walk depth (PTW requests only).
    pub translation_level: u8,
    /// Page-walk depth at which the walk started.
    pub init_translation_level: u8,
    /// Originating CPU.
    pub cpu: usize,
    /// Address-space ids.
    pub asid: [u8; 2],
    /// Sinks to notify on completion.
    pub to_return: Vec<Sink>,
    /// Fetch-buffer instructions coalesced onto this request.
    pub instr_depend_on_me: VecDeque<u64>,
    /// Load-queue slots waiting on this request.
    pub lq_depend_on_me: Vec<LsqRef>,
    /// Store-queue slots waiting on this request.
    pub sq_depend_on_me: Vec<LsqRef>,
    /// Cycle the request entered the MSHR (miss latency accounting).
    pub cycle_enqueued: u64,
    /// Cycle at which the current processing step completes.
    pub event_cycle: u64,
}

impl Packet {
    /// Merges another request's waiters into this one.
    ///
    /// Used when a later request to the same line coalesces into an existing
    /// queue or MSHR entry.
    pub fn absorb(&mut self, other: Packet) {
        self.instr_depend_on_me.extend(other.instr_depend_on_me);
        self.lq_depend_on_me.extend(other.lq_depend_on_me);
        self.sq_depend_on_me.extend(other.sq_depend_on_me);
        for sink in other.to_return {
            if !self.to_return.contains(&sink) {
                self.to_return.push(sink);
            }
        }
    }
}

/// CPU-side return conduit.
///
/// The pipeline polls `processed`; prefetch completions are of no interest to
/// it and are filtered out at the door.
#[derive(Default)]
pub struct CacheBus {
    /// Completed requests awaiting pipeline pickup.
    pub processed: VecDeque<Packet>,
}

impl CacheBus {
    /// Records a completion unless it is a prefetch.
    pub fn return_data(&mut self, packet: Packet) {
        if packet.kind != RequestKind::Prefetch {
            self.processed.push_back(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_filters_prefetch_returns() {
        let mut bus = CacheBus::default();
        bus.return_data(Packet {
            kind: RequestKind::Prefetch,
            ..Packet::default()
        });
        assert!(bus.processed.is_empty());
        bus.return_data(Packet {
            kind: RequestKind::Load,
            ..Packet::default()
        });
        assert_eq!(bus.processed.len(), 1);
    }

    #[test]
    fn test_absorb_dedups_sinks() {
        let mut a = Packet {
            to_return: vec![Sink::Node(3)],
            ..Packet::default()
        };
        let b = Packet {
            to_return: vec![Sink::Node(3), Sink::CoreBus(0, BusKind::Itlb)],
            instr_depend_on_me: VecDeque::from([7, 8]),
            ..Packet::default()
        };
        a.absorb(b);
        assert_eq!(a.to_return.len(), 2);
        assert_eq!(a.instr_depend_on_me.len(), 2);
    }
}
