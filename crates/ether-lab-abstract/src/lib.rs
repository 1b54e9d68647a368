pub mod config;
pub mod packet;
pub mod scenario;

pub use config::{LinkDetail, SimConfig};
pub use packet::{EthHeader, MacAddr, Packet, PduTag, build_pdu};
pub use scenario::{BusSpec, SimConfigOverride, TestAction, TestAssertion, TestScenario};
