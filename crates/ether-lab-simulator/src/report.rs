use crate::scheduler::SimTime;
use crate::sim::{Delivery, Simulation};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    pub time: SimTime,
    pub node: u32,
    pub uid: u64,
    pub size: u32,
    pub src: String,
    pub dst: String,
}

impl From<&Delivery> for DeliveryRecord {
    fn from(d: &Delivery) -> Self {
        let (src, dst) = d
            .packet
            .eth_header()
            .map(|h| (h.src.to_string(), h.dst.to_string()))
            .unwrap_or_default();
        Self {
            time: d.time,
            node: d.node,
            uid: d.packet.uid,
            size: d.packet.size,
            src,
            dst,
        }
    }
}

/// One attached interface's addressing, in attach order.
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceRecord {
    pub node: u32,
    pub mac: String,
    pub ipaddr: String,
}

/// A serializable snapshot of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub scenario: String,
    pub duration_secs: SimTime,
    /// Netmask shared by every interface address below.
    pub ipmask: String,
    pub interfaces: Vec<InterfaceRecord>,
    pub deliveries: Vec<DeliveryRecord>,
    /// The captured protocol trace, one record per line.
    pub trace: String,
}

impl Simulation {
    pub fn export_report(&self, scenario: &str, trace: String) -> SimulationReport {
        SimulationReport {
            scenario: scenario.to_string(),
            duration_secs: self.now(),
            ipmask: self.ipmask().to_string(),
            interfaces: self
                .ifaces
                .iter()
                .map(|iface| InterfaceRecord {
                    node: self.nodes[iface.node.0].uid,
                    mac: iface.mac().to_string(),
                    ipaddr: iface.ipaddr().to_string(),
                })
                .collect(),
            deliveries: self.deliveries().iter().map(DeliveryRecord::from).collect(),
            trace,
        }
    }
}
