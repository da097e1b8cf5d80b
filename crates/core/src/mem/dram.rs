//! Off-chip DRAM controller.
//!
//! Models per-channel read/write queues, an open-row policy (row hit pays
//! CAS only; a row change pays precharge + activate + CAS), and data-bus
//! occupancy. One request is in flight per channel at a time; reads return
//! to their recorded sinks, writes complete silently.

use std::collections::VecDeque;

use crate::common::{BLOCK_SHIFT, QUEUE_REFUSED};
use crate::config::DramConfig;
use crate::mem::hierarchy::Downstream;
use crate::mem::packet::{Packet, QueueKind};

/// Per-channel counters surfaced in the final DRAM report.
#[derive(Clone, Default)]
pub struct DramChannelStats {
    /// Read requests that hit the open row.
    pub rq_row_buffer_hit: u64,
    /// Read requests that required a row change.
    pub rq_row_buffer_miss: u64,
    /// Write requests that hit the open row.
    pub wq_row_buffer_hit: u64,
    /// Write requests that required a row change.
    pub wq_row_buffer_miss: u64,
    /// Refused write-queue insertions.
    pub wq_full: u64,
    /// Cycles requests sat waiting for the data bus.
    pub dbus_cycle_congested: u64,
    /// Requests that waited for the data bus at all.
    pub dbus_count_congested: u64,
}

struct Channel {
    rq: VecDeque<Packet>,
    wq: VecDeque<Packet>,
    open_row: Option<u64>,
    dbus_free_cycle: u64,
    inflight: Option<Packet>,
    inflight_is_write: bool,
    stats: DramChannelStats,
}

/// The memory controller node at the bottom of the hierarchy.
pub struct MemoryController {
    /// Display name.
    pub name: String,
    cfg: DramConfig,
    channels: Vec<Channel>,
    /// Local cycle count.
    pub current_cycle: u64,
}

impl MemoryController {
    /// Builds the controller from its timing configuration.
    pub fn new(cfg: &DramConfig) -> Self {
        let channels = (0..cfg.channels)
            .map(|_| Channel {
                rq: VecDeque::new(),
                wq: VecDeque::new(),
                open_row: None,
                dbus_free_cycle: 0,
                inflight: None,
                inflight_is_write: false,
                stats: DramChannelStats::default(),
            })
            .collect();
        Self {
            name: "DRAM".to_string(),
            cfg: cfg.clone(),
            channels,
            current_cycle: 0,
        }
    }

    fn channel_of(&self, address: u64) -> usize {
        ((address >> BLOCK_SHIFT) as usize) % self.cfg.channels
    }

    /// One controller cycle: complete finished transfers, then dispatch the
    /// next request per channel.
    pub fn operate(&mut self, down: &mut Downstream<'_>) {
        self.current_cycle += 1;
        let now = self.current_cycle;
        for ch in &mut self.channels {
            let finished = ch
                .inflight
                .as_ref()
                .is_some_and(|p| p.event_cycle <= now);
            if finished {
                let pkt = ch.inflight.take().unwrap();
                if !ch.inflight_is_write {
                    for sink in pkt.to_return.clone() {
                        down.push_return(sink, pkt.clone());
                    }
                }
            }
            if ch.inflight.is_some() {
                continue;
            }

            // Drain writes when reads are absent or the write queue is
            // nearly full, otherwise serve reads first.
            let write_drain = ch.rq.is_empty()
                || ch.wq.len() * 4 >= self.cfg.wq_size * 3;
            let (pkt, is_write) = if write_drain && !ch.wq.is_empty() {
                (ch.wq.pop_front().unwrap(), true)
            } else if let Some(pkt) = ch.rq.pop_front() {
                (pkt, false)
            } else {
                continue;
            };

            let row = pkt.address / self.cfg.row_size;
            let row_hit = ch.open_row == Some(row);
            let access = if row_hit {
                self.cfg.t_cas
            } else if ch.open_row.is_none() {
                self.cfg.t_ras + self.cfg.t_cas
            } else {
                self.cfg.t_pre + self.cfg.t_ras + self.cfg.t_cas
            };
            ch.open_row = Some(row);
            match (is_write, row_hit) {
                (false, true) => ch.stats.rq_row_buffer_hit += 1,
                (false, false) => ch.stats.rq_row_buffer_miss += 1,
                (true, true) => ch.stats.wq_row_buffer_hit += 1,
                (true, false) => ch.stats.wq_row_buffer_miss += 1,
            }

            let start = if ch.dbus_free_cycle > now {
                ch.stats.dbus_cycle_congested += ch.dbus_free_cycle - now;
                ch.stats.dbus_count_congested += 1;
                ch.dbus_free_cycle
            } else {
                now
            };
            let done = start + access;
            ch.dbus_free_cycle = done + self.cfg.dbus_turnaround;

            let mut pkt = pkt;
            pkt.event_cycle = done;
            ch.inflight = Some(pkt);
            ch.inflight_is_write = is_write;
        }
    }

    /// Enqueues a read. Refuses with `-2` when the channel queue is full.
    pub fn add_rq(&mut self, packet: Packet) -> i32 {
        let ch = self.channel_of(packet.address);
        if self.channels[ch].rq.len() >= self.cfg.rq_size {
            return QUEUE_REFUSED;
        }
        let index = self.channels[ch].rq.len() as i32;
        self.channels[ch].rq.push_back(packet);
        index
    }

    /// Enqueues a write. Refuses with `-2` when the channel queue is full.
    pub fn add_wq(&mut self, packet: Packet) -> i32 {
        let ch = self.channel_of(packet.address);
        if self.channels[ch].wq.len() >= self.cfg.wq_size {
            self.channels[ch].stats.wq_full += 1;
            return QUEUE_REFUSED;
        }
        let index = self.channels[ch].wq.len() as i32;
        self.channels[ch].wq.push_back(packet);
        index
    }

    /// Occupancy across channels for the selected queue.
    pub fn get_occupancy(&self, queue: QueueKind) -> usize {
        match queue {
            QueueKind::Rq => self.channels.iter().map(|c| c.rq.len()).sum(),
            QueueKind::Wq => self.channels.iter().map(|c| c.wq.len()).sum(),
            _ => 0,
        }
    }

    /// Capacity across channels for the selected queue.
    pub fn get_size(&self, queue: QueueKind) -> usize {
        match queue {
            QueueKind::Rq => self.cfg.rq_size * self.cfg.channels,
            QueueKind::Wq => self.cfg.wq_size * self.cfg.channels,
            _ => 0,
        }
    }

    /// Per-channel statistics for the final report.
    pub fn channel_stats(&self) -> Vec<DramChannelStats> {
        self.channels.iter().map(|c| c.stats.clone()).collect()
    }

    /// Zeroes per-channel statistics at a phase boundary.
    pub fn reset_stats(&mut self) {
        for ch in &mut self.channels {
            ch.stats = DramChannelStats::default();
        }
    }
}
