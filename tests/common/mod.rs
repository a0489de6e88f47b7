#![allow(dead_code)]

use std::path::Path;

use pcap::{Capture, Linktype, Packet, PacketHeader};
use pktmapper_lib::capture::frame_builders::{build_tcp_frame, build_udp_frame};

pub const CLIENT: [u8; 4] = [10, 0, 0, 1];
pub const SERVER: [u8; 4] = [10, 0, 0, 2];
pub const RESOLVER: [u8; 4] = [10, 0, 0, 53];

pub struct Frame {
    pub timestamp: f64,
    pub data: Vec<u8>,
}

/// `count` TCP packets between CLIENT:sport and SERVER:80, alternating sender, 100 byte payloads.
pub fn tcp_exchange(sport: u16, count: usize, start: f64) -> Vec<Frame> {
    let payload = [0x41u8; 100];
    (0..count)
        .map(|i| {
            let data = if i % 2 == 0 {
                build_tcp_frame(CLIENT, SERVER, sport, 80, &payload)
            } else {
                build_tcp_frame(SERVER, CLIENT, 80, sport, &payload)
            };
            Frame { timestamp: start + i as f64 * 0.1, data }
        })
        .collect()
}

pub fn dns_query(sport: u16, timestamp: f64) -> Frame {
    Frame { timestamp, data: build_udp_frame(CLIENT, RESOLVER, sport, 53, b"query") }
}

/// An Ethernet frame carrying ARP; never decodes.
pub fn arp_frame(timestamp: f64) -> Frame {
    let mut data = vec![0xffu8; 6];
    data.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
    data.extend_from_slice(&[0x08, 0x06]);
    data.extend_from_slice(&[0u8; 28]);
    Frame { timestamp, data }
}

pub fn write_pcap(path: &Path, frames: &[Frame]) {
    let dead = Capture::dead(Linktype::ETHERNET).unwrap();
    let mut savefile = dead.savefile(path).unwrap();
    for frame in frames {
        let secs = frame.timestamp.trunc();
        let micros = ((frame.timestamp - secs) * 1_000_000.0).round();
        savefile.write(&Packet {
            header: &PacketHeader {
                ts: libc::timeval {
                    tv_sec: secs as libc::time_t,
                    tv_usec: micros as libc::suseconds_t,
                },
                caplen: frame.data.len() as u32,
                len: frame.data.len() as u32,
            },
            data: &frame.data,
        });
    }
    savefile.flush().unwrap();
}
