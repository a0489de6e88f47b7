use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Deserialize;
use tracing::debug;

use crate::capture::TransportProtocol;
use crate::error::{MapperError, Result};
use crate::processor::FlowKey;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    pub packets: u64,
    pub bytes: u64,
    pub flows: u64,
}

/// Aggregate counters the DPI engine reports for one capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSummary {
    pub known: TrafficCounters,
    pub unknown: TrafficCounters,
}

#[derive(Debug, Clone, Default)]
pub struct GroundTruth {
    pub summary: TrafficSummary,
    pub flows: HashMap<FlowKey, String>,
}

impl GroundTruth {
    pub fn label_for(&self, key: &FlowKey) -> Option<&str> {
        self.flows.get(key).map(String::as_str)
    }
}

/// Produces application labels for every flow of a capture file.
pub trait GroundTruthOracle: Send + Sync {
    fn ground_truth(&self, capture: &Path) -> Result<GroundTruth>;
}

#[derive(Debug, Deserialize)]
struct NdpiReport {
    #[serde(rename = "detected.protos", default)]
    detected_protos: Vec<ProtoEntry>,
    #[serde(rename = "known.flows", default)]
    known_flows: Vec<FlowEntry>,
}

#[derive(Debug, Deserialize)]
struct ProtoEntry {
    name: String,
    #[serde(default)]
    packets: u64,
    #[serde(default)]
    bytes: u64,
    #[serde(default)]
    flows: u64,
}

#[derive(Debug, Deserialize)]
struct FlowEntry {
    protocol: String,
    #[serde(rename = "host_a.name")]
    host_a: String,
    #[serde(rename = "host_a.port")]
    port_a: u16,
    #[serde(rename = "host_b.name")]
    host_b: String,
    #[serde(rename = "host_b.port")]
    port_b: u16,
    #[serde(rename = "detected.protocol.name")]
    application: String,
}

/// Turns an nDPI JSON report into ground truth. Non TCP/UDP flows and hosts
/// that are not IPv4 literals are dropped; `HTTP.Google` becomes `HTTP`.
pub fn parse_report(raw: &str) -> Result<GroundTruth> {
    let report: NdpiReport = serde_json::from_str(raw)?;
    let mut truth = GroundTruth::default();

    for proto in report.detected_protos {
        let bucket = if proto.name == "Unknown" {
            &mut truth.summary.unknown
        } else {
            &mut truth.summary.known
        };
        bucket.packets += proto.packets;
        bucket.bytes += proto.bytes;
        bucket.flows += proto.flows;
    }

    for flow in report.known_flows {
        let Ok(protocol) = flow.protocol.parse::<TransportProtocol>() else { continue };
        let (Ok(a), Ok(b)) = (flow.host_a.parse::<Ipv4Addr>(), flow.host_b.parse::<Ipv4Addr>()) else {
            debug!(host_a = %flow.host_a, host_b = %flow.host_b, "skipping non IPv4 flow");
            continue;
        };
        let label = flow.application.split('.').next().unwrap_or_default().to_string();
        truth
            .flows
            .insert(FlowKey::from_endpoints(a, b, flow.port_a, flow.port_b, protocol), label);
    }

    Ok(truth)
}

/// Runs the `ndpiReader` binary once per capture.
#[derive(Debug, Clone)]
pub struct NdpiReader {
    binary: PathBuf,
}

impl NdpiReader {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }
}

impl GroundTruthOracle for NdpiReader {
    fn ground_truth(&self, capture: &Path) -> Result<GroundTruth> {
        let workdir = tempfile::tempdir()?;
        let report = workdir.path().join("ndpi.json");

        let status = Command::new(&self.binary)
            .arg("-i")
            .arg(capture)
            .args(["-v", "1", "-j"])
            .arg(&report)
            .stdout(Stdio::null())
            .status()
            .map_err(|e| MapperError::Oracle(format!("cannot run {}: {e}", self.binary.display())))?;

        if !status.success() {
            return Err(MapperError::Oracle(format!(
                "{} exited with {status} on {}",
                self.binary.display(),
                capture.display()
            )));
        }

        let raw = fs::read_to_string(&report)
            .map_err(|e| MapperError::Oracle(format!("no report for {}: {e}", capture.display())))?;
        parse_report(&raw)
    }
}
