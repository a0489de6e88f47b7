use serde::{Serialize, Deserialize};

/// Periodic snapshot of the streaming pipeline.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct NetworkStats {
    pub received_packets: u64,
    pub skipped_frames: u64,
    pub classified_flows: u64,
    pub detected_flows: u64,
    pub packets_per_second: f64,
    pub uptime_seconds: u64,
}
