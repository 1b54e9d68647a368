use crate::scheduler::SimTime;
use ether_lab_abstract::Packet;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Tri-state enable flag for one trace entity. `Default` defers to the next
/// entity in the resolution chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceStatus {
    Enabled,
    Disabled,
    #[default]
    Default,
}

/// Which packet-summary fields a stream prints. Tags are field names:
/// `size`, `flow`, `uid`, `retx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceDetail {
    All,
    Tags(Vec<String>),
}

/// Anything whose trace output can be toggled independently. Status for a
/// protocol instance resolves node first, then the instance, then its layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceEntity {
    Node(u32),
    Protocol(u32),
    Layer(u8),
}

/// A structured event sink. Records are rendered one field at a time through
/// a column cursor: the `"<time> N<uid> "` prefix appears lazily at column 0,
/// and a newline is forced whenever the simulation time, the node cursor, or
/// the current packet changes. Records sharing all three therefore share one
/// physical line.
pub struct TraceStream {
    sink: Option<Box<dyn Write + Send>>,
    status: HashMap<TraceEntity, TraceStatus>,
    detail: HashMap<TraceEntity, TraceDetail>,
    default_enabled: bool,
    col_index: usize,
    last_time: SimTime,
    node: Option<u32>,
    last_packet: Option<u64>,
    time_width: usize,
    time_prec: usize,
}

impl TraceStream {
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Some(sink),
            status: HashMap::new(),
            detail: HashMap::new(),
            default_enabled: false,
            col_index: 0,
            last_time: 0.0,
            node: None,
            last_packet: None,
            time_width: 7,
            time_prec: 3,
        }
    }

    /// A stream with no downstream sink. Reports disabled and swallows
    /// every write.
    pub fn closed() -> Self {
        let mut stream = Self::new(Box::new(io::sink()));
        stream.sink = None;
        stream
    }

    /// A stream capturing into a clone-able in-memory buffer.
    pub fn to_memory() -> (Self, MemorySink) {
        let sink = MemorySink::new();
        (Self::new(Box::new(sink.clone())), sink)
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    /// Drop the downstream sink; subsequent writes are silently discarded.
    pub fn close(&mut self) {
        if let Some(sink) = &mut self.sink {
            let _ = sink.flush();
        }
        self.sink = None;
    }

    pub fn set_status(&mut self, entity: TraceEntity, status: TraceStatus) {
        self.status.insert(entity, status);
    }

    pub fn set_detail(&mut self, entity: TraceEntity, detail: TraceDetail) {
        self.detail.insert(entity, detail);
    }

    /// Stream-wide fallback applied when every entity in the chain is
    /// `Default`.
    pub fn set_default_enabled(&mut self, enabled: bool) {
        self.default_enabled = enabled;
    }

    /// Fixed-point time prefix format; defaults to width 7, precision 3.
    pub fn set_time_format(&mut self, width: usize, prec: usize) {
        self.time_width = width;
        self.time_prec = prec;
    }

    /// Effective enable state for a protocol instance: the first
    /// non-default of node, instance, layer, else the stream default.
    /// A closed stream is never enabled.
    pub fn enabled_for(&self, node: u32, protocol: u32, layer: u8) -> bool {
        if self.sink.is_none() {
            return false;
        }
        let chain = [
            TraceEntity::Node(node),
            TraceEntity::Protocol(protocol),
            TraceEntity::Layer(layer),
        ];
        for entity in chain {
            match self.status.get(&entity).copied().unwrap_or_default() {
                TraceStatus::Enabled => return true,
                TraceStatus::Disabled => return false,
                TraceStatus::Default => {}
            }
        }
        self.default_enabled
    }

    /// Emit one record. Embedded newlines in `text` become spaces so a
    /// record can never span lines on its own.
    #[allow(clippy::too_many_arguments)]
    pub fn write_trace(
        &mut self,
        now: SimTime,
        node: u32,
        protocol: u32,
        layer: u8,
        proto_tag: &str,
        action: &str,
        packet: Option<&Packet>,
        text: &str,
    ) {
        if !self.enabled_for(node, protocol, layer) {
            return;
        }
        if self.col_index > 0 && now != self.last_time {
            self.newline();
        }
        self.last_time = now;
        if self.node != Some(node) {
            if self.col_index > 0 {
                self.newline();
            }
            self.node = Some(node);
        }
        if let Some(p) = packet {
            if self.col_index > 0 && self.last_packet.is_some_and(|uid| uid != p.uid) {
                self.newline();
            }
            self.last_packet = Some(p.uid);
        }

        let mut body = String::new();
        if self.col_index > 0 {
            body.push(' ');
        }
        body.push('[');
        body.push_str(proto_tag);
        body.push_str("] [");
        body.push_str(action);
        body.push(']');
        if let Some(p) = packet {
            let summary = self.packet_summary(node, protocol, layer, p);
            if !summary.is_empty() {
                body.push(' ');
                body.push_str(&summary);
            }
        }
        if !text.is_empty() {
            body.push(' ');
            for ch in text.chars() {
                body.push(if ch == '\n' { ' ' } else { ch });
            }
        }
        for ch in body.chars() {
            self.put_char(now, ch);
        }
    }

    /// Terminate the current line if one is in progress.
    pub fn flush_line(&mut self) {
        if self.col_index > 0 {
            self.newline();
        }
    }

    /// Flush the sink and re-base the cursor state at `now`.
    pub fn reset(&mut self, now: SimTime) {
        if let Some(sink) = &mut self.sink {
            let _ = sink.flush();
        }
        self.col_index = 0;
        self.last_time = now;
        self.node = None;
        self.last_packet = None;
    }

    fn resolve_detail(&self, node: u32, protocol: u32, layer: u8) -> TraceDetail {
        let chain = [
            TraceEntity::Protocol(protocol),
            TraceEntity::Node(node),
            TraceEntity::Layer(layer),
        ];
        for entity in chain {
            if let Some(detail) = self.detail.get(&entity) {
                return detail.clone();
            }
        }
        TraceDetail::All
    }

    fn packet_summary(&self, node: u32, protocol: u32, layer: u8, p: &Packet) -> String {
        let detail = self.resolve_detail(node, protocol, layer);
        let include = |tag: &str| match &detail {
            TraceDetail::All => true,
            TraceDetail::Tags(tags) => tags.iter().any(|t| t == tag),
        };
        let mut parts = Vec::new();
        if include("size") {
            parts.push(format!("{}b", p.size));
        }
        if include("flow")
            && let Some(hdr) = p.eth_header()
        {
            parts.push(format!("{}>{}", hdr.src, hdr.dst));
        }
        if include("uid") {
            parts.push(format!("uid={}", p.uid));
        }
        if include("retx") && p.retx_count > 0 {
            parts.push(format!("retx={}", p.retx_count));
        }
        parts.join(" ")
    }

    fn put_char(&mut self, now: SimTime, ch: char) {
        if ch == '\n' {
            self.newline();
            return;
        }
        if self.col_index == 0 {
            let uid = self.node.map(|n| n as i64).unwrap_or(-1);
            let prefix = format!(
                "{:w$.p$} N{} ",
                now,
                uid,
                w = self.time_width,
                p = self.time_prec
            );
            self.col_index = prefix.chars().count();
            self.raw(prefix.as_bytes());
        }
        let mut buf = [0u8; 4];
        self.raw(ch.encode_utf8(&mut buf).as_bytes());
        self.col_index += 1;
    }

    fn newline(&mut self) {
        self.raw(b"\n");
        if let Some(sink) = &mut self.sink {
            let _ = sink.flush();
        }
        self.col_index = 0;
    }

    // Sink failures degrade silently; a dead pipe must not kill the run.
    fn raw(&mut self, bytes: &[u8]) {
        if let Some(sink) = &mut self.sink {
            let _ = sink.write_all(bytes);
        }
    }
}

impl std::fmt::Debug for TraceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceStream")
            .field("open", &self.sink.is_some())
            .field("col_index", &self.col_index)
            .field("last_time", &self.last_time)
            .field("node", &self.node)
            .finish()
    }
}

/// Clone-able in-memory byte sink; every clone shares one buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }

    /// Occurrences of `needle` in the captured text.
    pub fn count(&self, needle: &str) -> usize {
        self.contents().matches(needle).count()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ether_lab_abstract::{MacAddr, Packet, build_pdu};

    fn open_stream() -> (TraceStream, MemorySink) {
        let (mut stream, sink) = TraceStream::to_memory();
        stream.set_default_enabled(true);
        (stream, sink)
    }

    #[test]
    fn node_status_wins_over_protocol_status() {
        let (mut stream, sink) = TraceStream::to_memory();
        stream.set_status(TraceEntity::Node(0), TraceStatus::Enabled);
        stream.set_status(TraceEntity::Protocol(5), TraceStatus::Disabled);
        stream.write_trace(0.0, 0, 5, 2, "eth", "snd", None, "L2-RA 1");
        stream.flush_line();
        assert!(sink.contents().contains("L2-RA 1"));
    }

    #[test]
    fn protocol_status_applies_when_node_is_default() {
        let (mut stream, sink) = TraceStream::to_memory();
        stream.set_status(TraceEntity::Protocol(5), TraceStatus::Disabled);
        stream.write_trace(0.0, 0, 5, 2, "eth", "snd", None, "L2-RA 1");
        stream.set_status(TraceEntity::Protocol(6), TraceStatus::Enabled);
        stream.write_trace(0.0, 0, 6, 2, "eth", "snd", None, "L2-RA 2");
        stream.flush_line();
        let out = sink.contents();
        assert!(!out.contains("L2-RA 1"));
        assert!(out.contains("L2-RA 2"));
    }

    #[test]
    fn layer_status_is_the_last_resort_before_default() {
        let (mut stream, sink) = TraceStream::to_memory();
        stream.set_status(TraceEntity::Layer(2), TraceStatus::Enabled);
        stream.write_trace(0.0, 3, 9, 2, "eth", "snd", None, "hello");
        stream.flush_line();
        assert!(sink.contents().contains("hello"));
    }

    #[test]
    fn stream_default_is_disabled() {
        let (mut stream, sink) = TraceStream::to_memory();
        stream.write_trace(0.0, 0, 0, 2, "eth", "snd", None, "quiet");
        stream.flush_line();
        assert!(sink.contents().is_empty());
    }

    #[test]
    fn records_at_same_time_and_node_share_a_line() {
        let (mut stream, sink) = open_stream();
        stream.write_trace(0.0, 0, 0, 2, "eth", "snd", None, "L2-RA 1");
        stream.write_trace(0.0, 0, 0, 2, "eth", "col", None, "L2-C");
        stream.flush_line();
        let out = sink.contents();
        assert_eq!(out.lines().count(), 1);
        assert_eq!(out.matches("N0").count(), 1);
        assert!(out.contains("L2-RA 1"));
        assert!(out.contains("L2-C"));
    }

    #[test]
    fn time_change_starts_a_new_line() {
        let (mut stream, sink) = open_stream();
        stream.write_trace(0.0, 0, 0, 2, "eth", "snd", None, "first");
        stream.write_trace(1.0, 0, 0, 2, "eth", "snd", None, "second");
        stream.flush_line();
        let out = sink.contents();
        assert_eq!(out.lines().count(), 2);
        assert!(out.lines().nth(1).unwrap().contains("  1.000 N0"));
    }

    #[test]
    fn node_change_starts_a_new_line() {
        let (mut stream, sink) = open_stream();
        stream.write_trace(0.0, 0, 0, 2, "eth", "snd", None, "a");
        stream.write_trace(0.0, 1, 1, 2, "eth", "rcv", None, "b");
        stream.flush_line();
        let out = sink.contents();
        assert_eq!(out.lines().count(), 2);
        assert!(out.lines().next().unwrap().starts_with("  0.000 N0"));
        assert!(out.lines().nth(1).unwrap().starts_with("  0.000 N1"));
    }

    #[test]
    fn packet_change_starts_a_new_line() {
        let (mut stream, sink) = open_stream();
        let p1 = build_pdu(MacAddr::local(0), MacAddr::local(1), Packet::with_size(1, 100), None);
        let p2 = build_pdu(MacAddr::local(0), MacAddr::local(1), Packet::with_size(2, 100), None);
        stream.write_trace(0.0, 0, 0, 2, "eth", "snd", Some(&p1), "");
        stream.write_trace(0.0, 0, 0, 2, "eth", "snd", Some(&p2), "");
        stream.flush_line();
        assert_eq!(sink.contents().lines().count(), 2);
    }

    #[test]
    fn embedded_newlines_become_spaces() {
        let (mut stream, sink) = open_stream();
        stream.write_trace(0.0, 0, 0, 2, "eth", "snd", None, "two\nwords");
        stream.flush_line();
        let out = sink.contents();
        assert_eq!(out.lines().count(), 1);
        assert!(out.contains("two words"));
    }

    #[test]
    fn detail_tags_filter_summary_fields() {
        let (mut stream, sink) = open_stream();
        stream.set_detail(
            TraceEntity::Protocol(0),
            TraceDetail::Tags(vec!["size".into(), "flow".into()]),
        );
        let mut p = build_pdu(MacAddr::local(0), MacAddr::local(1), Packet::with_size(9, 1000), None);
        p.retx_count = 3;
        stream.write_trace(0.0, 0, 0, 2, "eth", "snd", Some(&p), "");
        stream.flush_line();
        let out = sink.contents();
        assert!(out.contains("1000b"));
        assert!(out.contains("02:00:00:00:00:00>02:00:00:00:00:01"));
        assert!(!out.contains("uid="));
        assert!(!out.contains("retx="));
    }

    #[test]
    fn full_detail_includes_uid_and_retx() {
        let (mut stream, sink) = open_stream();
        let mut p = build_pdu(MacAddr::local(0), MacAddr::local(1), Packet::with_size(9, 1000), None);
        p.retx_count = 3;
        stream.write_trace(0.0, 0, 0, 2, "eth", "snd", Some(&p), "");
        stream.flush_line();
        let out = sink.contents();
        assert!(out.contains("uid=9"));
        assert!(out.contains("retx=3"));
    }

    #[test]
    fn closed_stream_swallows_writes() {
        let mut stream = TraceStream::closed();
        stream.set_default_enabled(true);
        assert!(!stream.is_open());
        assert!(!stream.enabled_for(0, 0, 2));
        // must not panic
        stream.write_trace(0.0, 0, 0, 2, "eth", "snd", None, "gone");
        stream.flush_line();
    }

    #[test]
    fn reset_rebases_cursor() {
        let (mut stream, sink) = open_stream();
        stream.write_trace(0.0, 0, 0, 2, "eth", "snd", None, "before");
        stream.reset(5.0);
        stream.write_trace(5.0, 0, 0, 2, "eth", "snd", None, "after");
        stream.flush_line();
        let out = sink.contents();
        // the unterminated pre-reset line runs into the post-reset prefix;
        // the record after reset starts at column zero with a fresh prefix
        assert!(out.contains("  5.000 N0 [eth] [snd] after"));
    }
}
