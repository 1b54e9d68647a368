use crate::link::{IfaceId, LinkId, NodeId};
use crate::scheduler::{EventHandle, SimTime};
use crate::sim::{Delivery, Event, Simulation};
use ether_lab_abstract::{MacAddr, Packet};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use tracing::debug;

// CSMA/CD constants, in bit times. Divide by the link bandwidth for seconds.
pub const INITIAL_BACKOFF: u32 = 1;
pub const SLOT_TIME: u32 = 512;
pub const BACKOFF_LIMIT: u32 = 1024;
pub const ATTEMPT_LIMIT: u32 = 16;
pub const JAM_TIME: u32 = 32;
pub const INTER_FRAME_GAP: u32 = 96;

/// Layer number the MAC reports to the trace fabric.
pub const MAC_LAYER: u8 = 2;

/// Self-timers an interface may have outstanding, at most one per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacTimer {
    Retransmit,
    ChanAcq,
    Receive,
}

impl MacTimer {
    pub(crate) const COUNT: usize = 3;

    pub(crate) fn index(self) -> usize {
        match self {
            MacTimer::Retransmit => 0,
            MacTimer::ChanAcq => 1,
            MacTimer::Receive => 2,
        }
    }
}

/// Locally-observed time the medium goes idle. `Unknown` means at least one
/// remote sender is on the wire and its end cannot be predicted yet; it
/// compares below every finite time, so carrier sense reads it as idle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BusyEnd {
    At(SimTime),
    Unknown,
}

/// The MAC endpoint one node owns on one bus.
#[derive(Debug)]
pub struct Interface {
    pub(crate) id: IfaceId,
    pub(crate) node: NodeId,
    pub(crate) link: LinkId,
    /// Position of this tap in the link's attach order.
    pub(crate) slot: usize,
    pub(crate) mac: MacAddr,
    pub(crate) ipaddr: Ipv4Addr,
    pub(crate) bandwidth: f64,

    pub(crate) busy_end_time: BusyEnd,
    /// Remote transmitters currently heard. Rests at one after a
    /// collision-clear cycle (see `Simulation::clear`).
    pub(crate) busy_count: i32,
    /// When our own current transmission ends; in the past when idle.
    pub(crate) tx_finish_time: SimTime,
    /// Earliest time we may attempt to transmit again.
    pub(crate) hold_time: SimTime,
    /// Delay used the last time a retransmit self-timer was armed.
    pub(crate) rx_time: SimTime,
    /// Current contention-window ceiling, in slot units.
    pub(crate) max_back_off: u32,
    /// Last computed backoff delay, seconds.
    pub(crate) back_off_timer: SimTime,
    /// Upper bound on one-way propagation across the bus.
    pub(crate) max_wait_time: SimTime,
    pub(crate) last_packet_sent: Option<Packet>,
    pub(crate) bcast: bool,
    /// True between detecting a collision and completing its backoff.
    pub(crate) collision: bool,

    seed: u64,
    rng: StdRng,
    pub(crate) queue: VecDeque<Packet>,
    queue_limit: usize,
    /// Scripted slot draws consumed before the RNG; lets contention tests
    /// pin the backoff outcome.
    pub(crate) forced_slots: VecDeque<u32>,
    pub(crate) timers: [Option<EventHandle>; MacTimer::COUNT],
}

impl Interface {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: IfaceId,
        node: NodeId,
        link: LinkId,
        slot: usize,
        mac: MacAddr,
        ipaddr: Ipv4Addr,
        bandwidth: f64,
        seed: u64,
        queue_limit: usize,
    ) -> Self {
        Self {
            id,
            node,
            link,
            slot,
            mac,
            ipaddr,
            bandwidth,
            busy_end_time: BusyEnd::At(0.0),
            busy_count: 0,
            tx_finish_time: 0.0,
            hold_time: 0.0,
            rx_time: 0.0,
            max_back_off: INITIAL_BACKOFF,
            back_off_timer: 0.0,
            max_wait_time: 0.0,
            last_packet_sent: None,
            bcast: false,
            collision: false,
            seed,
            rng: StdRng::seed_from_u64(seed),
            queue: VecDeque::new(),
            queue_limit,
            forced_slots: VecDeque::new(),
            timers: [None; MacTimer::COUNT],
        }
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn ipaddr(&self) -> Ipv4Addr {
        self.ipaddr
    }

    pub fn max_back_off(&self) -> u32 {
        self.max_back_off
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn in_collision(&self) -> bool {
        self.collision
    }

    /// Local carrier sense at `now`. True means the medium is free for a new
    /// transmission; false means wait, with `rx_time` holding the delay after
    /// which it is worth trying again.
    pub(crate) fn sense_channel(&mut self, now: SimTime) -> bool {
        if now < self.tx_finish_time || now < self.hold_time {
            // our own frame is on the wire, or its hold/IFG has not elapsed
            self.rx_time = self.tx_finish_time.max(self.hold_time) - now;
            return false;
        }
        if let BusyEnd::At(end) = self.busy_end_time
            && now < end
        {
            self.rx_time = end - now;
            return false;
        }
        self.collision = false;
        true
    }

    /// The medium already carries a sender whose end we are tracking.
    fn medium_busy(&self, now: SimTime) -> bool {
        match self.busy_end_time {
            BusyEnd::Unknown => true,
            BusyEnd::At(end) => now < end,
        }
    }

    /// Randomized wait before the next attempt, in seconds: a whole number
    /// of slot times drawn over the current contention window.
    fn draw_backoff(&mut self) -> SimTime {
        let slots = match self.forced_slots.pop_front() {
            Some(s) => s as f64,
            None => {
                let u: f64 = self.rng.random();
                (u * self.max_back_off as f64).ceil()
            }
        };
        slots * SLOT_TIME as f64 / self.bandwidth
    }

    fn enqueue(&mut self, packet: Packet) -> Result<(), Packet> {
        if self.queue.len() >= self.queue_limit {
            return Err(packet);
        }
        self.queue.push_back(packet);
        Ok(())
    }

    /// Back to the state right after attach. Topology-derived fields
    /// (`max_wait_time`, addresses) survive; everything dynamic does not.
    pub(crate) fn reset(&mut self) {
        self.busy_end_time = BusyEnd::At(0.0);
        self.busy_count = 0;
        self.tx_finish_time = 0.0;
        self.hold_time = 0.0;
        self.rx_time = 0.0;
        self.max_back_off = INITIAL_BACKOFF;
        self.back_off_timer = 0.0;
        self.last_packet_sent = None;
        self.bcast = false;
        self.collision = false;
        self.rng = StdRng::seed_from_u64(self.seed);
        self.queue.clear();
        self.forced_slots.clear();
        self.timers = [None; MacTimer::COUNT];
    }
}

impl Simulation {
    pub(crate) fn handle_mac_timer(&mut self, id: IfaceId, timer: MacTimer) {
        // the handle is spent; drop it before running the transition so a
        // cancel from inside the transition is a no-op
        self.ifaces[id.0].timers[timer.index()] = None;
        match timer {
            MacTimer::Retransmit => self.retransmit(id, None),
            MacTimer::ChanAcq => self.chan_acq(id),
            MacTimer::Receive => self.tx_complete(id),
        }
    }

    /// One transmit attempt for `packet`, or for the head of the queue.
    pub(crate) fn retransmit(&mut self, id: IfaceId, packet: Option<Packet>) {
        let now = self.scheduler.now();
        let Some(mut p) = packet.or_else(|| self.ifaces[id.0].queue.pop_front()) else {
            return;
        };

        p.retx_count += 1;
        if p.retx_count > ATTEMPT_LIMIT {
            debug!("attempt limit reached, dropping frame uid={}", p.uid);
            self.trace_mac(id, "drop", Some(&p), "L2-QD");
            if !self.ifaces[id.0].queue.is_empty() {
                self.retransmit(id, None);
            }
            return;
        }
        let attempt = format!("L2-RA {}", p.retx_count);
        self.trace_mac(id, "snd", Some(&p), &attempt);

        if self.ifaces[id.0].sense_channel(now) {
            // idle: the frame goes on the wire, leading edge first
            for &(peer, delay) in &self.peers_of(id) {
                self.scheduler.schedule(
                    delay,
                    Event::FirstBit {
                        iface: peer,
                        size: p.size,
                    },
                );
            }
            let bandwidth = self.ifaces[id.0].bandwidth;
            let link = self.ifaces[id.0].link;
            let tx_time = self.links[link.0].bit_time(p.size as f64 * 8.0);
            let bcast = p.is_broadcast();
            let (rx_time, max_wait, more_queued) = {
                let iface = &mut self.ifaces[id.0];
                iface.tx_finish_time = now + tx_time;
                iface.hold_time = iface.tx_finish_time + INTER_FRAME_GAP as f64 / bandwidth;
                iface.rx_time = iface.hold_time - now;
                iface.bcast = bcast;
                iface.last_packet_sent = Some(p);
                (iface.rx_time, iface.max_wait_time, !iface.queue.is_empty())
            };
            if more_queued && !self.timer_pending(id, MacTimer::Retransmit) {
                self.arm_timer(id, MacTimer::Retransmit, rx_time);
            }
            // the wire owns the frame now; its uncollided end is the receive
            // event that fans copies out to the peers
            if !self.timer_pending(id, MacTimer::Receive) {
                self.arm_timer(id, MacTimer::Receive, tx_time);
            }
            if !self.timer_pending(id, MacTimer::ChanAcq) {
                self.arm_timer(id, MacTimer::ChanAcq, 2.0 * max_wait);
            }
        } else {
            let rx_time = self.ifaces[id.0].rx_time;
            if !self.timer_pending(id, MacTimer::Retransmit) {
                self.arm_timer(id, MacTimer::Retransmit, rx_time);
            }
            self.trace_mac(id, "bo", Some(&p), "L2-B");
            // back on the tail; the attempt never went on the wire, so the
            // attempt count is refunded after the frame is requeued
            match self.ifaces[id.0].enqueue(p) {
                Ok(()) => {
                    if let Some(last) = self.ifaces[id.0].queue.back_mut() {
                        last.retx_count -= 1;
                    }
                }
                Err(p) => {
                    debug!("transmit queue full, dropping frame uid={}", p.uid);
                    self.trace_mac(id, "drop", Some(&p), "L2-QD");
                }
            }
        }
    }

    /// The leading edge of a remote frame reached this tap.
    pub(crate) fn first_bit(&mut self, id: IfaceId, size: u32) {
        let now = self.scheduler.now();
        if now < self.ifaces[id.0].tx_finish_time {
            // a foreign bit while our own frame is on the wire
            if self.ifaces[id.0].collision {
                return; // another peer's edge from the same collision
            }
            self.cancel_timer(id, MacTimer::Receive);
            self.trace_mac(id, "col", None, "L2-C");
            self.cancel_timer(id, MacTimer::ChanAcq);
            for &(peer, delay) in &self.peers_of(id) {
                self.scheduler.schedule(delay, Event::Clear { iface: peer });
            }
            let (hold_delay, truncated) = {
                let iface = &mut self.ifaces[id.0];
                iface.collision = true;
                iface.tx_finish_time = now; // truncate our own transmission
                iface.max_back_off = (iface.max_back_off * 2).min(BACKOFF_LIMIT);
                let backoff = iface.draw_backoff();
                iface.back_off_timer = backoff;
                iface.hold_time =
                    iface.tx_finish_time + backoff + JAM_TIME as f64 / iface.bandwidth;
                (iface.hold_time - now, iface.last_packet_sent.take())
            };
            debug!("collision on iface {}, window now {}", id.0, self.ifaces[id.0].max_back_off);
            if let Some(p) = truncated
                && let Err(p) = self.ifaces[id.0].enqueue(p)
            {
                debug!("transmit queue full, dropping frame uid={}", p.uid);
                self.trace_mac(id, "drop", Some(&p), "L2-QD");
            }
            self.cancel_timer(id, MacTimer::Retransmit);
            self.arm_timer(id, MacTimer::Retransmit, hold_delay);
        } else if self.ifaces[id.0].medium_busy(now) {
            // a second sender joined an already-busy medium; nobody can say
            // when it clears until the senders sort themselves out
            let iface = &mut self.ifaces[id.0];
            iface.busy_count += 1;
            iface.busy_end_time = BusyEnd::Unknown;
        } else {
            // normal passing traffic: project its end from the frame size
            let link = self.ifaces[id.0].link;
            let tx_time = self.links[link.0].bit_time(size as f64 * 8.0);
            let (hold_delay, want_timer) = {
                let iface = &mut self.ifaces[id.0];
                iface.busy_end_time = BusyEnd::At(now + tx_time);
                iface.hold_time = now + tx_time + INTER_FRAME_GAP as f64 / iface.bandwidth;
                (iface.hold_time - now, !iface.queue.is_empty())
            };
            if want_timer && !self.timer_pending(id, MacTimer::Retransmit) {
                self.arm_timer(id, MacTimer::Retransmit, hold_delay);
            }
        }
    }

    /// A colliding sender finished; the medium may be clearing.
    pub(crate) fn clear(&mut self, id: IfaceId) {
        let now = self.scheduler.now();
        let hold_delay = {
            let iface = &mut self.ifaces[id.0];
            iface.busy_count -= 1;
            if iface.busy_count <= 0 {
                iface.busy_count = 1; // historical floor; the counter rests at one
                iface.busy_end_time = BusyEnd::At(now);
            }
            if !iface.collision {
                let base = match iface.busy_end_time {
                    BusyEnd::At(end) => end,
                    BusyEnd::Unknown => now,
                };
                iface.hold_time = base + JAM_TIME as f64 / iface.bandwidth;
            }
            (iface.hold_time - now).max(0.0)
        };
        self.cancel_timer(id, MacTimer::Retransmit);
        self.arm_timer(id, MacTimer::Retransmit, hold_delay);
    }

    /// Our frame survived its collision window; the contention window resets.
    pub(crate) fn chan_acq(&mut self, id: IfaceId) {
        self.ifaces[id.0].max_back_off = INITIAL_BACKOFF;
    }

    /// Uncollided end of our own transmission: every peer tap gets a copy of
    /// the frame after its propagation delay, and a broadcast sender hears
    /// itself when configured to.
    pub(crate) fn tx_complete(&mut self, id: IfaceId) {
        let Some(p) = self.ifaces[id.0].last_packet_sent.take() else {
            return;
        };
        let bcast = self.ifaces[id.0].bcast;
        for &(peer, delay) in &self.peers_of(id) {
            self.scheduler.schedule(
                delay,
                Event::Deliver {
                    iface: peer,
                    packet: p.clone(),
                },
            );
        }
        if bcast && self.config.rx_own_broadcast {
            self.scheduler.schedule(
                0.0,
                Event::Deliver {
                    iface: id,
                    packet: p,
                },
            );
        }
    }

    /// A full frame arrived at this tap. Only the addressed interface (or
    /// everyone, for broadcast) hands it up; other copies die here.
    pub(crate) fn deliver(&mut self, id: IfaceId, packet: Packet) {
        let now = self.scheduler.now();
        let iface = &self.ifaces[id.0];
        let mine = packet
            .eth_header()
            .is_some_and(|h| h.dst == iface.mac || h.dst.is_broadcast());
        if !mine {
            return;
        }
        let node = self.nodes[iface.node.0].uid;
        self.trace_mac(id, "rcv", Some(&packet), "");
        debug!("N{node} received frame uid={} at {now}", packet.uid);
        self.deliveries.push(Delivery {
            time: now,
            node,
            iface: id,
            packet,
        });
    }

    fn arm_timer(&mut self, id: IfaceId, kind: MacTimer, delay: SimTime) {
        let handle = self.scheduler.schedule(
            delay,
            Event::MacTimer {
                iface: id,
                timer: kind,
            },
        );
        self.ifaces[id.0].timers[kind.index()] = Some(handle);
    }

    /// Idempotent; removes the entry from the table and the queue.
    pub(crate) fn cancel_timer(&mut self, id: IfaceId, kind: MacTimer) -> bool {
        match self.ifaces[id.0].timers[kind.index()].take() {
            Some(handle) => self.scheduler.cancel(handle),
            None => false,
        }
    }

    fn timer_pending(&self, id: IfaceId, kind: MacTimer) -> bool {
        self.ifaces[id.0].timers[kind.index()].is_some()
    }

    /// (peer interface, propagation delay) pairs in attach order.
    fn peers_of(&self, id: IfaceId) -> Vec<(IfaceId, SimTime)> {
        let iface = &self.ifaces[id.0];
        let link = &self.links[iface.link.0];
        link.ifaces
            .iter()
            .enumerate()
            .filter(|&(slot, _)| slot != iface.slot)
            .map(|(slot, &peer)| (peer, link.propagation_delay(iface.slot, slot)))
            .collect()
    }

    pub(crate) fn trace_mac(&mut self, id: IfaceId, action: &str, packet: Option<&Packet>, text: &str) {
        let now = self.scheduler.now();
        let node = self.nodes[self.ifaces[id.0].node.0].uid;
        self.trace
            .write_trace(now, node, id.0 as u32, MAC_LAYER, "eth", action, packet, text);
    }
}
