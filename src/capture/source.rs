use std::net::IpAddr;
use std::path::Path;

use pcap::{Active, Capture, Offline, PacketHeader};
use serde::Serialize;
use tracing::info;

use crate::error::Result;

/// A raw link-layer frame with its capture time in seconds.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub timestamp: f64,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub enum SourceEvent {
    Frame(RawFrame),
    /// Nothing arrived within the read timeout; lets the caller check for cancellation.
    Idle,
    Exhausted,
}

pub trait PacketSource: Send {
    fn next_event(&mut self) -> Result<SourceEvent>;
}

#[inline]
fn header_seconds(header: &PacketHeader) -> f64 {
    header.ts.tv_sec as f64 + header.ts.tv_usec as f64 / 1_000_000.0
}

// ---------------------------------------------------------------------------
// Live interface
// ---------------------------------------------------------------------------

pub struct LiveSource {
    cap: Capture<Active>,
}

impl LiveSource {
    pub fn open(interface: &str, filter: &str) -> Result<Self> {
        let mut cap = Capture::from_device(interface)?
            .promisc(true)
            .immediate_mode(true)
            .snaplen(65535)
            .timeout(10)
            .open()?;

        cap.filter(filter, true)?;
        info!(interface, filter, "interface opened");

        Ok(Self { cap })
    }
}

impl PacketSource for LiveSource {
    fn next_event(&mut self) -> Result<SourceEvent> {
        match self.cap.next_packet() {
            Ok(packet) => Ok(SourceEvent::Frame(RawFrame {
                timestamp: header_seconds(packet.header),
                data: packet.data.to_vec(),
            })),
            Err(pcap::Error::TimeoutExpired) => Ok(SourceEvent::Idle),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Stored capture file
// ---------------------------------------------------------------------------

pub struct CaptureFile {
    cap: Capture<Offline>,
}

impl CaptureFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let cap = Capture::from_file(path.as_ref())?;
        Ok(Self { cap })
    }

    /// Next frame, or `None` at end of file.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        match self.cap.next_packet() {
            Ok(packet) => Ok(Some(RawFrame {
                timestamp: header_seconds(packet.header),
                data: packet.data.to_vec(),
            })),
            Err(pcap::Error::NoMorePackets) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl PacketSource for CaptureFile {
    fn next_event(&mut self) -> Result<SourceEvent> {
        Ok(match self.next_frame()? {
            Some(frame) => SourceEvent::Frame(frame),
            None => SourceEvent::Exhausted,
        })
    }
}

/// Counts the frames in a capture file. Blocking, reads the whole file.
pub fn count_packets(path: impl AsRef<Path>) -> Result<u64> {
    let mut cap = Capture::from_file(path.as_ref())?;
    let mut count = 0u64;
    loop {
        match cap.next_packet() {
            Ok(_) => count += 1,
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// Interfaces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub name: String,
    pub description: String,
    pub addresses: Vec<String>,
    pub is_up: bool,
}

pub fn list_interfaces() -> Result<Vec<NetworkInterface>> {
    let devices = pcap::Device::list()?;

    let interfaces = devices
        .into_iter()
        .filter(|d| !d.flags.is_loopback())
        .map(|d| {
            let addresses = d
                .addresses
                .iter()
                .filter_map(|a| match a.addr {
                    IpAddr::V4(v4) => Some(v4.to_string()),
                    IpAddr::V6(_) => None,
                })
                .collect();
            NetworkInterface {
                description: d.desc.clone().unwrap_or_else(|| "Network Interface".into()),
                is_up: d.flags.is_up(),
                name: d.name,
                addresses,
            }
        })
        .collect();
    Ok(interfaces)
}
