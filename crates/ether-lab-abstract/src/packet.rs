use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// EtherType carried when the caller does not supply an LLC/SNAP protocol id.
pub const ETHERTYPE_IP: u16 = 0x0800;

/// A 48-bit IEEE 802 MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    /// Locally-administered unicast address derived from a small integer id.
    pub fn local(id: u32) -> Self {
        let b = id.to_be_bytes();
        MacAddr([0x02, 0x00, b[0], b[1], b[2], b[3]])
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Ethernet frame header attached by the MAC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthHeader {
    pub src: MacAddr,
    pub dst: MacAddr,
    pub ethertype: u16,
}

/// One encapsulation layer on a packet's tag stack. The MAC only ever pushes
/// and inspects `Eth`; everything else is opaque to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PduTag {
    Eth(EthHeader),
    LlcSnap { ethertype: u16 },
    /// Opaque upper-layer marker (protocol number, port, ...).
    Upper(u16),
}

/// A simulated frame. `size` is the on-the-wire length in bytes and drives
/// every timing computation; the payload itself is never inspected.
#[derive(Debug, Clone)]
pub struct Packet {
    pub uid: u64,
    /// On-the-wire frame length in bytes.
    pub size: u32,
    /// Transmit attempts made for this packet by the owning interface.
    pub retx_count: u32,
    pub tags: Vec<PduTag>,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(uid: u64, size: u32, payload: Bytes) -> Self {
        Self {
            uid,
            size,
            retx_count: 0,
            tags: Vec::new(),
            payload,
        }
    }

    /// A packet of `size` zero bytes, for traffic that only needs timing.
    pub fn with_size(uid: u64, size: u32) -> Self {
        Self::new(uid, size, Bytes::from(vec![0u8; size as usize]))
    }

    /// The outermost Ethernet header, if the packet has been through `build_pdu`.
    pub fn eth_header(&self) -> Option<&EthHeader> {
        self.tags.iter().rev().find_map(|t| match t {
            PduTag::Eth(h) => Some(h),
            _ => None,
        })
    }

    pub fn is_broadcast(&self) -> bool {
        self.eth_header().is_some_and(|h| h.dst.is_broadcast())
    }
}

/// Encapsulate `packet` as a layer-2 PDU. An LLC/SNAP shim is inserted below
/// the Ethernet header when a protocol id is supplied.
pub fn build_pdu(src: MacAddr, dst: MacAddr, mut packet: Packet, llc_snap_type: Option<u16>) -> Packet {
    let ethertype = match llc_snap_type {
        Some(t) => {
            packet.tags.push(PduTag::LlcSnap { ethertype: t });
            t
        }
        None => ETHERTYPE_IP,
    };
    packet.tags.push(PduTag::Eth(EthHeader { src, dst, ethertype }));
    packet
}
