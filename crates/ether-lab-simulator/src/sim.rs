use crate::link::{IfaceId, Link, LinkId, Medium, NodeId};
use crate::mac::{Interface, MacTimer};
use crate::node::{IpAllocator, Node};
use crate::scheduler::{Scheduler, SimTime};
use crate::trace::{TraceDetail, TraceEntity, TraceStatus, TraceStream};
use ether_lab_abstract::{LinkDetail, MacAddr, Packet, SimConfig, build_pdu};
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("node N{node} is already attached to this bus")]
    AlreadyAttached { node: u32 },
    #[error("unknown interface index {0}")]
    UnknownInterface(usize),
    #[error("unknown node index {0}")]
    UnknownNode(usize),
}

/// Everything that can sit in the event queue. Cross-interface effects all
/// travel as events, so each handler mutates exactly one interface.
#[derive(Debug)]
pub enum Event {
    /// One of an interface's self-timers expired.
    MacTimer { iface: IfaceId, timer: MacTimer },
    /// The leading edge of a remote frame of `size` bytes reached a tap.
    FirstBit { iface: IfaceId, size: u32 },
    /// A colliding sender finished; the medium may be clearing.
    Clear { iface: IfaceId },
    /// A full frame arrived at a tap.
    Deliver { iface: IfaceId, packet: Packet },
    /// A higher layer hands a frame to an interface.
    AppSend {
        iface: IfaceId,
        packet: Packet,
        dst: MacAddr,
    },
}

/// A frame handed up to a node's higher layer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub time: SimTime,
    pub node: u32,
    pub iface: IfaceId,
    pub packet: Packet,
}

/// One self-contained simulation: clock, topology, MAC state, trace stream.
/// Independent simulations never share state, so tests can run them side by
/// side.
pub struct Simulation {
    pub(crate) scheduler: Scheduler<Event>,
    pub(crate) config: SimConfig,
    pub(crate) nodes: Vec<Node>,
    pub(crate) links: Vec<Link>,
    pub(crate) ifaces: Vec<Interface>,
    pub(crate) trace: TraceStream,
    ip_alloc: IpAllocator,
    packet_uid: u64,
    stopped: bool,
    pub(crate) deliveries: Vec<Delivery>,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Self {
        Self::with_trace(config, TraceStream::closed())
    }

    pub fn with_trace(config: SimConfig, trace: TraceStream) -> Self {
        Self {
            scheduler: Scheduler::new(),
            config,
            nodes: Vec::new(),
            links: Vec::new(),
            ifaces: Vec::new(),
            trace,
            ip_alloc: IpAllocator::default(),
            packet_uid: 0,
            stopped: false,
            deliveries: Vec::new(),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn now(&self) -> SimTime {
        self.scheduler.now()
    }

    /// Live events still queued.
    pub fn pending_events(&self) -> usize {
        self.scheduler.len()
    }

    pub fn add_node(&mut self, location: Option<(f64, f64)>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(id.0 as u32, location));
        id
    }

    pub fn set_node_up(&mut self, node: NodeId, up: bool) {
        self.nodes[node.0].up = up;
    }

    pub fn add_link(&mut self, bandwidth: f64, detail: LinkDetail) -> LinkId {
        let id = LinkId(self.links.len());
        self.links.push(Link::new(bandwidth, detail));
        id
    }

    /// Attach `node` to `link` with a fresh interface. A node gets at most
    /// one interface per bus. On full-detail links the tap position is the
    /// node's location, or `(0, attach_index)` when it has none.
    pub fn attach(&mut self, node: NodeId, link: LinkId) -> Result<IfaceId, SimError> {
        if node.0 >= self.nodes.len() {
            return Err(SimError::UnknownNode(node.0));
        }
        let already = self.links[link.0]
            .ifaces
            .iter()
            .any(|&i| self.ifaces[i.0].node == node);
        if already {
            return Err(SimError::AlreadyAttached {
                node: self.nodes[node.0].uid,
            });
        }
        let id = IfaceId(self.ifaces.len());
        let slot = self.links[link.0].ifaces.len();
        let location = self.nodes[node.0].location.unwrap_or((0.0, slot as f64));
        if let Medium::Full { positions } = &mut self.links[link.0].medium {
            positions.push(location);
        }
        let bandwidth = self.links[link.0].bandwidth;
        let seed = self.config.seed.wrapping_add(id.0 as u64);
        let queue_limit = self.config.queue_limit.unwrap_or(usize::MAX);
        let iface = Interface::new(
            id,
            node,
            link,
            slot,
            MacAddr::local(id.0 as u32),
            self.ip_alloc.next_ipaddr(),
            bandwidth,
            seed,
            queue_limit,
        );
        self.links[link.0].ifaces.push(id);
        self.nodes[node.0].ifaces.push(id);
        self.ifaces.push(iface);

        // the propagation bound may have grown for everyone on the bus
        let max_wait = self.links[link.0].max_wait_time();
        let members = self.links[link.0].ifaces.clone();
        for member in members {
            self.ifaces[member.0].max_wait_time = max_wait;
        }
        Ok(id)
    }

    pub fn interface(&self, id: IfaceId) -> &Interface {
        &self.ifaces[id.0]
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// The first interface attached to `node`, if any.
    pub fn iface_of(&self, node: NodeId) -> Option<IfaceId> {
        self.nodes[node.0].ifaces.first().copied()
    }

    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }

    /// Netmask shared by every allocated interface address.
    pub fn ipmask(&self) -> Ipv4Addr {
        self.ip_alloc.ipmask()
    }

    pub fn trace(&self) -> &TraceStream {
        &self.trace
    }

    pub fn trace_mut(&mut self) -> &mut TraceStream {
        &mut self.trace
    }

    pub fn trace_status(&mut self, entity: TraceEntity, status: TraceStatus) {
        self.trace.set_status(entity, status);
    }

    pub fn trace_detail(&mut self, entity: TraceEntity, detail: TraceDetail) {
        self.trace.set_detail(entity, detail);
    }

    pub fn trace_default(&mut self, enabled: bool) {
        self.trace.set_default_enabled(enabled);
    }

    /// Queue scripted backoff slot draws for an interface; contention tests
    /// use this to pin who wins.
    pub fn force_backoff_slots(&mut self, iface: IfaceId, slots: &[u32]) {
        self.ifaces[iface.0].forced_slots.extend(slots.iter().copied());
    }

    /// Hand `packet` to an interface for transmission to `dst`, right now.
    /// A frame sent through a down node is dropped with an `L2-ID` trace.
    pub fn send(&mut self, iface: IfaceId, packet: Packet, dst: MacAddr) -> Result<(), SimError> {
        let Some(entry) = self.ifaces.get(iface.0) else {
            return Err(SimError::UnknownInterface(iface.0));
        };
        let node = entry.node;
        let src = entry.mac;
        if !self.nodes[node.0].up {
            debug!("N{} is down, dropping frame uid={}", self.nodes[node.0].uid, packet.uid);
            self.trace_mac(iface, "drop", Some(&packet), "L2-ID");
            return Ok(());
        }
        let mut packet = packet;
        packet.retx_count = 0; // fresh higher-layer send
        let pdu = build_pdu(src, dst, packet, None);
        self.cancel_timer(iface, MacTimer::Retransmit);
        self.retransmit(iface, Some(pdu));
        Ok(())
    }

    /// Schedule a zero-filled frame of `size` bytes to be sent at `time`.
    pub fn schedule_send(&mut self, time: SimTime, iface: IfaceId, dst: MacAddr, size: u32) {
        let uid = self.packet_uid;
        self.packet_uid += 1;
        let packet = Packet::with_size(uid, size);
        let delay = time - self.scheduler.now();
        self.scheduler.schedule(delay, Event::AppSend { iface, packet, dst });
    }

    /// Process the next event. Returns false when the queue is empty.
    pub fn step(&mut self) -> bool {
        let Some((time, event)) = self.scheduler.pop() else {
            return false;
        };
        debug!("processing event at {time}: {event:?}");
        match event {
            Event::MacTimer { iface, timer } => self.handle_mac_timer(iface, timer),
            Event::FirstBit { iface, size } => self.first_bit(iface, size),
            Event::Clear { iface } => self.clear(iface),
            Event::Deliver { iface, packet } => self.deliver(iface, packet),
            Event::AppSend { iface, packet, dst } => {
                if let Err(err) = self.send(iface, packet, dst) {
                    debug!("scheduled send failed: {err}");
                }
            }
        }
        true
    }

    /// Run until the queue drains, `stop` is called, or the clock would pass
    /// `until`.
    pub fn run(&mut self, until: Option<SimTime>) {
        self.stopped = false;
        while !self.stopped {
            if let Some(limit) = until
                && self.scheduler.peek_time().is_some_and(|t| t >= limit)
            {
                break;
            }
            if !self.step() {
                break;
            }
        }
    }

    /// Halt `run` after the current event.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Back to the state right after construction: empty queue, clock at
    /// zero, address allocator rewound, every interface re-seeded, trace
    /// cursor re-based. Interfaces reset in attach order, the trace stream
    /// last.
    pub fn reset(&mut self) {
        self.scheduler.reset();
        self.stopped = false;
        self.packet_uid = 0;
        self.deliveries.clear();
        for node in &mut self.nodes {
            node.up = true;
        }
        self.ip_alloc.reset();
        for iface in &mut self.ifaces {
            iface.reset();
        }
        self.trace.reset(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::SPEED_OF_LIGHT;
    use crate::trace::MemorySink;
    use ether_lab_abstract::SimConfig;

    const MBPS_10: f64 = 10_000_000.0;

    /// A bus of `n` nodes with an open, default-enabled trace stream.
    fn bus(
        n: usize,
        detail: LinkDetail,
        config: SimConfig,
    ) -> (Simulation, Vec<IfaceId>, MemorySink) {
        let (mut trace, sink) = TraceStream::to_memory();
        trace.set_default_enabled(true);
        let mut sim = Simulation::with_trace(config, trace);
        let link = sim.add_link(MBPS_10, detail);
        let mut ifaces = Vec::new();
        for _ in 0..n {
            let node = sim.add_node(None);
            ifaces.push(sim.attach(node, link).unwrap());
        }
        (sim, ifaces, sink)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn lone_sender_delivers_without_contention() {
        let (mut sim, ifaces, sink) = bus(2, LinkDetail::Partial, SimConfig::default());
        let dst = sim.interface(ifaces[1]).mac();
        sim.schedule_send(0.0, ifaces[0], dst, 1000);
        sim.run(None);
        sim.trace_mut().flush_line();

        // 1000 bytes at 10 Mb/s is 800 us on the wire, zero propagation
        assert_eq!(sim.deliveries().len(), 1);
        assert_eq!(sim.deliveries()[0].node, 1);
        assert!(approx(sim.deliveries()[0].time, 800.0e-6));
        assert_eq!(sink.count("L2-RA 1"), 1);
        assert_eq!(sink.count("L2-C"), 0);
        assert_eq!(sink.count("L2-B"), 0);
        assert_eq!(sim.interface(ifaces[0]).max_back_off(), 1);
    }

    #[test]
    fn simultaneous_senders_collide_then_back_off() {
        let (mut sim, ifaces, sink) = bus(2, LinkDetail::Partial, SimConfig::default());
        // pin the contention outcome: one slot against two
        sim.force_backoff_slots(ifaces[0], &[1]);
        sim.force_backoff_slots(ifaces[1], &[2]);
        let mac0 = sim.interface(ifaces[0]).mac();
        let mac1 = sim.interface(ifaces[1]).mac();
        sim.schedule_send(0.0, ifaces[0], mac1, 1000);
        sim.schedule_send(0.0, ifaces[1], mac0, 1000);
        sim.run(None);
        sim.trace_mut().flush_line();

        // one collision episode, seen once per contender
        assert_eq!(sink.count("L2-C"), 2);
        assert_eq!(sink.count("L2-QD"), 0);
        assert_eq!(sim.deliveries().len(), 2);
        // winner retransmits after backoff + jam: 512 + 32 bit times
        let winner_done = (512.0 + 32.0) / MBPS_10 + 800.0e-6;
        assert!(approx(sim.deliveries()[0].time, winner_done));
        // loser defers to the busy wire once, then sends after the hold
        assert_eq!(sink.count("L2-B"), 1);
        let loser_done = winner_done + 96.0 / MBPS_10 + 800.0e-6;
        assert!(approx(sim.deliveries()[1].time, loser_done));
        // both contention windows reset after their clean transmissions
        assert_eq!(sim.interface(ifaces[0]).max_back_off(), 1);
        assert_eq!(sim.interface(ifaces[1]).max_back_off(), 1);
    }

    #[test]
    fn deferred_sender_waits_out_busy_wire() {
        let (mut sim, ifaces, sink) = bus(2, LinkDetail::Partial, SimConfig::default());
        let mac0 = sim.interface(ifaces[0]).mac();
        let mac1 = sim.interface(ifaces[1]).mac();
        sim.schedule_send(0.0, ifaces[0], mac1, 1000);
        // mid-transmission of the first frame, so carrier sense defers
        sim.schedule_send(100.0e-6, ifaces[1], mac0, 1000);
        sim.run(None);
        sim.trace_mut().flush_line();

        assert_eq!(sink.count("L2-C"), 0);
        assert_eq!(sink.count("L2-B"), 1);
        assert_eq!(sim.deliveries().len(), 2);
        assert!(approx(sim.deliveries()[0].time, 800.0e-6));
        // second frame starts after busy end plus the inter-frame gap
        let second = 800.0e-6 + 96.0 / MBPS_10 + 800.0e-6;
        assert!(approx(sim.deliveries()[1].time, second));
    }

    #[test]
    fn full_detail_taps_collide_inside_the_propagation_window() {
        let (mut trace, sink) = TraceStream::to_memory();
        trace.set_default_enabled(true);
        let mut sim = Simulation::with_trace(SimConfig::default(), trace);
        let link = sim.add_link(MBPS_10, LinkDetail::Full);
        let n0 = sim.add_node(Some((0.0, 0.0)));
        let n1 = sim.add_node(Some((0.0, 300.0)));
        let if0 = sim.attach(n0, link).unwrap();
        let if1 = sim.attach(n1, link).unwrap();
        sim.force_backoff_slots(if0, &[1]);
        sim.force_backoff_slots(if1, &[2]);
        let mac0 = sim.interface(if0).mac();
        let mac1 = sim.interface(if1).mac();

        let prop = 300.0 / SPEED_OF_LIGHT; // just over a microsecond
        sim.schedule_send(0.0, if0, mac1, 1000);
        // starts before the first sender's leading edge arrives
        sim.schedule_send(0.5e-6, if1, mac0, 1000);
        sim.run(None);
        sim.trace_mut().flush_line();

        assert_eq!(sink.count("L2-C"), 2);
        assert_eq!(sim.deliveries().len(), 2);
        // the first sender re-acquires the wire after its backoff and jam;
        // its frame lands one propagation later
        let winner_done = 0.5e-6 + prop + (512.0 + 32.0) / MBPS_10 + 800.0e-6 + prop;
        assert!(approx(sim.deliveries()[0].time, winner_done));
        assert_eq!(sim.interface(if0).max_back_off(), 1);
        assert_eq!(sim.interface(if1).max_back_off(), 1);
    }

    #[test]
    fn full_detail_sender_outside_the_window_defers_instead() {
        let (mut trace, sink) = TraceStream::to_memory();
        trace.set_default_enabled(true);
        let mut sim = Simulation::with_trace(SimConfig::default(), trace);
        let link = sim.add_link(MBPS_10, LinkDetail::Full);
        let n0 = sim.add_node(Some((0.0, 0.0)));
        let n1 = sim.add_node(Some((0.0, 300.0)));
        let if0 = sim.attach(n0, link).unwrap();
        let if1 = sim.attach(n1, link).unwrap();
        let mac0 = sim.interface(if0).mac();
        let mac1 = sim.interface(if1).mac();

        sim.schedule_send(0.0, if0, mac1, 1000);
        // the leading edge has already arrived by 1.5 us, so this defers
        sim.schedule_send(1.5e-6, if1, mac0, 1000);
        sim.run(None);
        sim.trace_mut().flush_line();

        assert_eq!(sink.count("L2-C"), 0);
        assert_eq!(sink.count("L2-B"), 1);
        assert_eq!(sim.deliveries().len(), 2);
    }

    #[test]
    fn broadcast_reaches_every_tap_and_optionally_the_sender() {
        let config = SimConfig {
            rx_own_broadcast: true,
            ..Default::default()
        };
        let (mut sim, ifaces, _sink) = bus(3, LinkDetail::Partial, config);
        sim.schedule_send(0.0, ifaces[0], MacAddr::BROADCAST, 500);
        sim.run(None);
        let mut nodes: Vec<u32> = sim.deliveries().iter().map(|d| d.node).collect();
        nodes.sort_unstable();
        assert_eq!(nodes, vec![0, 1, 2]);
    }

    #[test]
    fn broadcast_sender_stays_deaf_by_default() {
        let (mut sim, ifaces, _sink) = bus(3, LinkDetail::Partial, SimConfig::default());
        sim.schedule_send(0.0, ifaces[0], MacAddr::BROADCAST, 500);
        sim.run(None);
        let mut nodes: Vec<u32> = sim.deliveries().iter().map(|d| d.node).collect();
        nodes.sort_unstable();
        assert_eq!(nodes, vec![1, 2]);
    }

    #[test]
    fn down_node_drops_with_a_trace() {
        let (mut sim, ifaces, sink) = bus(2, LinkDetail::Partial, SimConfig::default());
        let dst = sim.interface(ifaces[1]).mac();
        sim.set_node_up(NodeId(0), false);
        sim.schedule_send(0.0, ifaces[0], dst, 1000);
        sim.run(None);
        sim.trace_mut().flush_line();

        assert_eq!(sink.count("L2-ID"), 1);
        assert!(sim.deliveries().is_empty());
    }

    #[test]
    fn bounded_queue_overflow_drops_with_a_trace() {
        let config = SimConfig {
            queue_limit: Some(1),
            ..Default::default()
        };
        let (mut sim, ifaces, sink) = bus(2, LinkDetail::Partial, config);
        let dst = sim.interface(ifaces[1]).mac();
        // one on the wire, one queued, one over the limit
        sim.schedule_send(0.0, ifaces[0], dst, 1000);
        sim.schedule_send(0.0, ifaces[0], dst, 1000);
        sim.schedule_send(0.0, ifaces[0], dst, 1000);
        sim.run(None);
        sim.trace_mut().flush_line();

        assert_eq!(sink.count("L2-QD"), 1);
        assert_eq!(sim.deliveries().len(), 2);
    }

    #[test]
    fn double_attach_is_rejected() {
        let mut sim = Simulation::new(SimConfig::default());
        let link = sim.add_link(MBPS_10, LinkDetail::Partial);
        let node = sim.add_node(None);
        sim.attach(node, link).unwrap();
        assert!(matches!(
            sim.attach(node, link),
            Err(SimError::AlreadyAttached { node: 0 })
        ));
    }

    #[test]
    fn fixed_seed_contention_is_reproducible() {
        fn contention_run() -> String {
            let config = SimConfig {
                seed: 7,
                ..Default::default()
            };
            let (mut sim, ifaces, sink) = bus(2, LinkDetail::Partial, config);
            let mac0 = sim.interface(ifaces[0]).mac();
            let mac1 = sim.interface(ifaces[1]).mac();
            sim.schedule_send(0.0, ifaces[0], mac1, 1000);
            sim.schedule_send(0.0, ifaces[1], mac0, 1000);
            sim.run(None);
            sim.trace_mut().flush_line();
            sink.contents()
        }
        let first = contention_run();
        assert!(first.contains("L2-C"));
        assert_eq!(first, contention_run());
    }

    #[test]
    fn reset_then_rerun_reproduces_the_trace() {
        let (mut sim, ifaces, sink) = bus(2, LinkDetail::Partial, SimConfig::default());
        let mac0 = sim.interface(ifaces[0]).mac();
        let mac1 = sim.interface(ifaces[1]).mac();

        sim.schedule_send(0.0, ifaces[0], mac1, 1000);
        sim.schedule_send(2.0e-3, ifaces[1], mac0, 1000);
        sim.run(None);
        sim.trace_mut().flush_line();
        let first = sink.contents();
        assert!(!first.is_empty());

        sim.reset();
        assert_eq!(sim.now(), 0.0);
        assert_eq!(sim.pending_events(), 0);
        assert!(sim.deliveries().is_empty());

        sim.schedule_send(0.0, ifaces[0], mac1, 1000);
        sim.schedule_send(2.0e-3, ifaces[1], mac0, 1000);
        sim.run(None);
        sim.trace_mut().flush_line();
        let both = sink.contents();
        assert_eq!(&both[first.len()..], first);
    }

    #[test]
    fn reset_is_idempotent() {
        let (mut sim, ifaces, _sink) = bus(2, LinkDetail::Partial, SimConfig::default());
        let dst = sim.interface(ifaces[1]).mac();
        sim.schedule_send(0.0, ifaces[0], dst, 1000);
        sim.run(None);
        sim.reset();
        sim.reset();
        assert_eq!(sim.now(), 0.0);
        assert_eq!(sim.pending_events(), 0);
        assert_eq!(sim.interface(ifaces[0]).max_back_off(), 1);
        assert_eq!(sim.interface(ifaces[0]).queue_len(), 0);
    }
}
