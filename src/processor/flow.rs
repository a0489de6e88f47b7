use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

use md5::{Digest, Md5};

use crate::capture::{NormalizedPacket, TransportProtocol};

/// Statistic columns in export order. Slot `i + 1` of a feature row holds column `i`.
pub const STAT_COLUMNS: [&str; 24] = [
    "count_dir",
    "count_back",
    "overall_dir",
    "overall_back",
    "max_itime_dir",
    "max_itime_back",
    "min_itime_dir",
    "min_itime_back",
    "avg_itime_dir",
    "avg_itime_back",
    "std_itime_dir",
    "std_itime_back",
    "var_itime_dir",
    "var_itime_back",
    "max_payload_dir",
    "max_payload_back",
    "min_payload_dir",
    "min_payload_back",
    "avg_payload_dir",
    "avg_payload_back",
    "std_payload_dir",
    "std_payload_back",
    "var_payload_dir",
    "var_payload_back",
];

/// Slot 0 (the label) plus 24 statistics plus 8 accumulators.
pub const FEATURE_ROW_LEN: usize = 33;

/// Direction-independent flow identity: an MD5 digest over both endpoints
/// (numerically smaller address first), the port sum and the protocol.
///
/// Unlike a digest of only the smaller address, the port sum and the
/// protocol, this keeps flows from one host to different peers apart when
/// their port sums collide. Ground-truth keys are built the same way, so
/// batch lookups agree.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct FlowKey([u8; 16]);

impl FlowKey {
    pub fn from_endpoints(
        addr_a: Ipv4Addr,
        addr_b: Ipv4Addr,
        port_a: u16,
        port_b: u16,
        protocol: TransportProtocol,
    ) -> Self {
        let (low, high) = if u32::from(addr_a) <= u32::from(addr_b) {
            (addr_a, addr_b)
        } else {
            (addr_b, addr_a)
        };
        let port_sum = u32::from(port_a) + u32::from(port_b);

        let mut hasher = Md5::new();
        hasher.update(format!("{low}|{high}|{port_sum}|{}", protocol.as_str()).as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn of(packet: &NormalizedPacket) -> Self {
        Self::from_endpoints(
            packet.src_addr,
            packet.dst_addr,
            packet.src_port,
            packet.dst_port,
            packet.protocol,
        )
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStage {
    Pending,
    Classified,
}

/// Running aggregates for one direction of a flow. Nothing per-packet is kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectionStats {
    pub packets: u64,
    pub bytes: u64,

    // Inter-arrival time, seconds
    pub max_itime: f64,
    pub min_itime: f64,
    pub avg_itime: f64,
    pub std_itime: f64,
    pub range_itime: f64,

    // Payload size, bytes
    pub max_payload: u64,
    pub min_payload: u64,
    pub avg_payload: f64,
    pub std_payload: f64,
    pub range_payload: u64,

    // Accumulators
    pub itime_total: f64,
    pub last_timestamp: f64,
    pub itime_sq_dev: f64,
    pub payload_sq_dev: f64,
}

impl DirectionStats {
    fn seeded(payload: u32, timestamp: f64) -> Self {
        let payload = u64::from(payload);
        Self {
            packets: 1,
            bytes: payload,
            max_payload: payload,
            min_payload: payload,
            avg_payload: payload as f64,
            last_timestamp: timestamp,
            ..Self::default()
        }
    }

    fn count(&mut self, payload: u32) {
        self.packets += 1;
        self.bytes += u64::from(payload);
    }

    /// Adds one packet and recomputes every derived statistic from the accumulators.
    ///
    /// The first packet of a direction contributes a zero inter-arrival sample; the
    /// second one resets min/max to its real delta. The deviation is that of the
    /// current sample from the updated mean only, divided by the updated count.
    fn record(&mut self, payload: u32, timestamp: f64) {
        self.count(payload);
        let n = self.packets;
        let nf = n as f64;

        let itime = if n >= 2 { timestamp - self.last_timestamp } else { 0.0 };
        self.itime_total += itime;
        if n == 2 {
            self.max_itime = itime;
            self.min_itime = itime;
        } else {
            self.max_itime = self.max_itime.max(itime);
            self.min_itime = self.min_itime.min(itime);
        }
        self.avg_itime = self.itime_total / nf;
        self.itime_sq_dev = (itime - self.avg_itime).powi(2);
        self.std_itime = (self.itime_sq_dev / nf).sqrt();
        self.range_itime = self.max_itime - self.min_itime;

        let size = u64::from(payload);
        self.max_payload = self.max_payload.max(size);
        self.min_payload = if n == 1 { size } else { self.min_payload.min(size) };
        self.avg_payload = self.bytes as f64 / nf;
        self.payload_sq_dev = (size as f64 - self.avg_payload).powi(2);
        self.std_payload = (self.payload_sq_dev / nf).sqrt();
        self.range_payload = self.max_payload - self.min_payload;

        self.last_timestamp = timestamp;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowState {
    pub label: Option<String>,
    pub stage: FlowStage,
    pub protocol: TransportProtocol,
    /// Endpoints as seen on the first packet, for reporting.
    pub descriptor: String,
    /// Source of the most recent packet; decides the next packet's direction.
    pub last_sender: Ipv4Addr,
    forward: DirectionStats,
    backward: DirectionStats,
}

impl FlowState {
    fn new(packet: &NormalizedPacket, label: Option<&str>) -> Self {
        Self {
            label: label.map(str::to_owned),
            stage: FlowStage::Pending,
            protocol: packet.protocol,
            descriptor: packet.descriptor(),
            last_sender: packet.src_addr,
            forward: DirectionStats::seeded(packet.payload_len, packet.timestamp),
            backward: DirectionStats::default(),
        }
    }

    /// Same sender as the previous packet is forward, anything else backward.
    pub fn direction_of(&self, sender: Ipv4Addr) -> FlowDirection {
        if sender == self.last_sender {
            FlowDirection::Forward
        } else {
            FlowDirection::Backward
        }
    }

    pub fn stats(&self, direction: FlowDirection) -> &DirectionStats {
        match direction {
            FlowDirection::Forward => &self.forward,
            FlowDirection::Backward => &self.backward,
        }
    }

    fn stats_mut(&mut self, direction: FlowDirection) -> &mut DirectionStats {
        match direction {
            FlowDirection::Forward => &mut self.forward,
            FlowDirection::Backward => &mut self.backward,
        }
    }

    pub fn forward(&self) -> &DirectionStats {
        &self.forward
    }

    pub fn backward(&self) -> &DirectionStats {
        &self.backward
    }

    pub fn total_packets(&self) -> u64 {
        self.forward.packets + self.backward.packets
    }

    pub fn is_classified(&self) -> bool {
        self.stage == FlowStage::Classified
    }

    fn update(&mut self, packet: &NormalizedPacket) {
        let direction = self.direction_of(packet.src_addr);
        self.stats_mut(direction).record(packet.payload_len, packet.timestamp);
        self.last_sender = packet.src_addr;
    }

    fn soft_update(&mut self, packet: &NormalizedPacket) {
        let direction = self.direction_of(packet.src_addr);
        self.stats_mut(direction).count(packet.payload_len);
        self.last_sender = packet.src_addr;
    }

    /// Pending -> Classified. Returns false if the flow was already classified.
    pub fn mark_classified(&mut self, label: String) -> bool {
        if self.is_classified() {
            return false;
        }
        self.label = Some(label);
        self.stage = FlowStage::Classified;
        true
    }

    /// The 24 statistic columns in `STAT_COLUMNS` order.
    pub fn statistics(&self) -> [StatValue; 24] {
        let (f, b) = (&self.forward, &self.backward);
        use StatValue::{Float, Int};
        [
            Int(f.packets),
            Int(b.packets),
            Int(f.bytes),
            Int(b.bytes),
            Float(f.max_itime),
            Float(b.max_itime),
            Float(f.min_itime),
            Float(b.min_itime),
            Float(f.avg_itime),
            Float(b.avg_itime),
            Float(f.std_itime),
            Float(b.std_itime),
            Float(f.range_itime),
            Float(b.range_itime),
            Int(f.max_payload),
            Int(b.max_payload),
            Int(f.min_payload),
            Int(b.min_payload),
            Float(f.avg_payload),
            Float(b.avg_payload),
            Float(f.std_payload),
            Float(b.std_payload),
            Int(f.range_payload),
            Int(b.range_payload),
        ]
    }

    /// Numeric view used for feature selection. Slot 0 stands for the label and is always 0.
    pub fn feature_row(&self) -> [f64; FEATURE_ROW_LEN] {
        let mut row = [0f64; FEATURE_ROW_LEN];
        for (slot, value) in row[1..25].iter_mut().zip(self.statistics()) {
            *slot = value.as_f64();
        }
        let (f, b) = (&self.forward, &self.backward);
        row[25] = f.itime_sq_dev;
        row[26] = b.itime_sq_dev;
        row[27] = f.payload_sq_dev;
        row[28] = b.payload_sq_dev;
        row[29] = f.last_timestamp;
        row[30] = b.last_timestamp;
        row[31] = f.itime_total;
        row[32] = b.itime_total;
        row
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatValue {
    Int(u64),
    Float(f64),
}

impl StatValue {
    pub fn as_f64(self) -> f64 {
        match self {
            StatValue::Int(v) => v as f64,
            StatValue::Float(v) => v,
        }
    }
}

/// All flows of one capture path or one input file, keyed by `FlowKey`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowTable {
    flows: HashMap<FlowKey, FlowState>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the flow from its first packet, or folds the packet into the
    /// running statistics of the direction it belongs to.
    pub fn ingest(&mut self, key: FlowKey, packet: &NormalizedPacket, label: Option<&str>) -> &FlowState {
        match self.flows.entry(key) {
            Entry::Occupied(e) => {
                let flow = e.into_mut();
                flow.update(packet);
                flow
            }
            Entry::Vacant(e) => e.insert(FlowState::new(packet, label)),
        }
    }

    /// Counters, byte totals and last sender only. Returns false for an unknown key.
    pub fn soft_update(&mut self, key: &FlowKey, packet: &NormalizedPacket) -> bool {
        match self.flows.get_mut(key) {
            Some(flow) => {
                flow.soft_update(packet);
                true
            }
            None => false,
        }
    }

    /// Forward plus backward packets; 0 for an unknown key.
    pub fn total_packets(&self, key: &FlowKey) -> u64 {
        self.flows.get(key).map_or(0, FlowState::total_packets)
    }

    pub fn mark_classified(&mut self, key: &FlowKey, label: String) -> bool {
        self.flows
            .get_mut(key)
            .map_or(false, |flow| flow.mark_classified(label))
    }

    pub fn get(&self, key: &FlowKey) -> Option<&FlowState> {
        self.flows.get(key)
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.flows.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FlowKey, &FlowState)> {
        self.flows.iter()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn classified_count(&self) -> usize {
        self.flows.values().filter(|f| f.is_classified()).count()
    }
}
