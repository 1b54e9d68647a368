use crate::scheduler::SimTime;
use ether_lab_abstract::LinkDetail;

/// Signal propagation speed on the wire, metres per second.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IfaceId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// Physical-layer fidelity of a bus. `Full` carries one tap position per
/// attached interface, indexed by attach order; the other variants share the
/// zero-delay path.
#[derive(Debug, Clone)]
pub enum Medium {
    None,
    Partial,
    Full { positions: Vec<(f64, f64)> },
}

/// A shared collision domain. Interfaces appear in `ifaces` in attach order,
/// which is also the tie-break order for same-time fan-out.
#[derive(Debug)]
pub struct Link {
    pub bandwidth: f64,
    pub medium: Medium,
    pub ifaces: Vec<IfaceId>,
}

impl Link {
    pub fn new(bandwidth: f64, detail: LinkDetail) -> Self {
        let medium = match detail {
            LinkDetail::None => Medium::None,
            LinkDetail::Partial => Medium::Partial,
            LinkDetail::Full => Medium::Full {
                positions: Vec::new(),
            },
        };
        Self {
            bandwidth,
            medium,
            ifaces: Vec::new(),
        }
    }

    /// Seconds for the leading edge of a signal to travel between two taps,
    /// identified by their attach index.
    pub fn propagation_delay(&self, a: usize, b: usize) -> SimTime {
        match &self.medium {
            Medium::Full { positions } => distance(positions[a], positions[b]) / SPEED_OF_LIGHT,
            _ => 0.0,
        }
    }

    /// Upper bound on one-way propagation across the bus.
    pub fn max_wait_time(&self) -> SimTime {
        match &self.medium {
            Medium::Full { positions } => {
                let mut max = 0.0f64;
                for i in 0..positions.len() {
                    for j in (i + 1)..positions.len() {
                        max = max.max(distance(positions[i], positions[j]));
                    }
                }
                max / SPEED_OF_LIGHT
            }
            _ => 0.0,
        }
    }

    /// Seconds to clock `bits` onto the wire.
    pub fn bit_time(&self, bits: f64) -> SimTime {
        bits / self.bandwidth
    }
}

fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}
