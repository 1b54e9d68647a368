pub mod link;
pub mod mac;
pub mod node;
pub mod report;
pub mod scenario_runner;
pub mod scheduler;
pub mod sim;
pub mod trace;

pub use link::{IfaceId, Link, LinkId, Medium, NodeId, SPEED_OF_LIGHT};
pub use mac::{
    ATTEMPT_LIMIT, BACKOFF_LIMIT, INITIAL_BACKOFF, INTER_FRAME_GAP, Interface, JAM_TIME,
    MAC_LAYER, MacTimer, SLOT_TIME,
};
pub use node::{IpAllocator, Node};
pub use report::{DeliveryRecord, InterfaceRecord, SimulationReport};
pub use scheduler::{EventHandle, Scheduler, SimTime};
pub use sim::{Delivery, Event, SimError, Simulation};
pub use trace::{MemorySink, TraceDetail, TraceEntity, TraceStatus, TraceStream};
