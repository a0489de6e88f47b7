use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use etherparse::{NetHeaders, PacketHeaders, TransportHeader};

const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Udp => "udp",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportProtocol::Tcp),
            "udp" => Ok(TransportProtocol::Udp),
            other => Err(format!("unsupported transport protocol '{other}'")),
        }
    }
}

/// One decoded TCP/UDP packet. `payload_len` excludes every header.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPacket {
    pub protocol: TransportProtocol,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_len: u32,
    /// Capture time in seconds.
    pub timestamp: f64,
}

impl NormalizedPacket {
    /// `10.0.0.1:5000<->10.0.0.2:80_tcp`
    pub fn descriptor(&self) -> String {
        format!(
            "{}:{}<->{}:{}_{}",
            self.src_addr, self.src_port, self.dst_addr, self.dst_port, self.protocol
        )
    }
}

/// Decodes an Ethernet frame into a `NormalizedPacket`.
///
/// Anything that is not IPv4 carrying TCP or UDP, and any frame too short
/// for the headers it announces, yields `None`.
pub fn decode_frame(timestamp: f64, data: &[u8]) -> Option<NormalizedPacket> {
    let parsed = PacketHeaders::from_ethernet_slice(data).ok()?;

    let (src_addr, dst_addr, ip_payload_len) = match &parsed.net {
        Some(NetHeaders::Ipv4(ipv4, _)) => (
            Ipv4Addr::from(ipv4.source),
            Ipv4Addr::from(ipv4.destination),
            usize::from(ipv4.total_len).saturating_sub(ipv4.header_len() as usize),
        ),
        _ => return None,
    };

    let (protocol, src_port, dst_port, payload_len) = match &parsed.transport {
        Some(TransportHeader::Tcp(tcp)) => {
            let header_len = tcp.data_offset() as usize * 4;
            (
                TransportProtocol::Tcp,
                tcp.source_port,
                tcp.destination_port,
                ip_payload_len.saturating_sub(header_len),
            )
        }
        Some(TransportHeader::Udp(udp)) => (
            TransportProtocol::Udp,
            udp.source_port,
            udp.destination_port,
            usize::from(udp.length).saturating_sub(UDP_HEADER_LEN),
        ),
        _ => return None,
    };

    Some(NormalizedPacket {
        protocol,
        src_addr,
        dst_addr,
        src_port,
        dst_port,
        payload_len: payload_len as u32,
        timestamp,
    })
}

// ---------------------------------------------------------------------------
// Frame builders (pub for integration tests)
// ---------------------------------------------------------------------------

#[doc(hidden)]
pub mod frame_builders {
    const ETHERTYPE_IPV4: [u8; 2] = [0x08, 0x00];

    fn ethernet_ipv4(frame: &mut Vec<u8>, proto: u8, src_ip: [u8; 4], dst_ip: [u8; 4], ip_payload_len: u16) {
        frame.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        frame.extend_from_slice(&[0xca, 0xfe, 0xba, 0xbe, 0x00, 0x02]);
        frame.extend_from_slice(&ETHERTYPE_IPV4);

        let total_len = 20 + ip_payload_len;
        frame.push(0x45);
        frame.push(0x00);
        frame.extend_from_slice(&total_len.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00]);
        frame.extend_from_slice(&[0x40, 0x00]); // don't fragment
        frame.push(64);
        frame.push(proto);
        frame.extend_from_slice(&[0x00, 0x00]);
        frame.extend_from_slice(&src_ip);
        frame.extend_from_slice(&dst_ip);
    }

    pub fn build_tcp_frame(
        src_ip: [u8; 4],
        dst_ip: [u8; 4],
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut frame = Vec::new();
        ethernet_ipv4(&mut frame, 6, src_ip, dst_ip, 20 + payload.len() as u16);

        frame.extend_from_slice(&src_port.to_be_bytes());
        frame.extend_from_slice(&dst_port.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        frame.push(0x50);
        frame.push(0x18); // PSH + ACK
        frame.extend_from_slice(&[0xFF, 0xFF]);
        frame.extend_from_slice(&[0x00, 0x00]);
        frame.extend_from_slice(&[0x00, 0x00]);

        frame.extend_from_slice(payload);
        frame
    }

    pub fn build_udp_frame(
        src_ip: [u8; 4],
        dst_ip: [u8; 4],
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut frame = Vec::new();
        let udp_len = 8 + payload.len() as u16;
        ethernet_ipv4(&mut frame, 17, src_ip, dst_ip, udp_len);

        frame.extend_from_slice(&src_port.to_be_bytes());
        frame.extend_from_slice(&dst_port.to_be_bytes());
        frame.extend_from_slice(&udp_len.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00]);

        frame.extend_from_slice(payload);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::frame_builders::*;
    use super::*;

    #[test]
    fn decodes_tcp_payload_length() {
        let frame = build_tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 5000, 80, &[0xAB; 100]);
        let pkt = decode_frame(1.5, &frame).expect("tcp frame should decode");

        assert_eq!(pkt.protocol, TransportProtocol::Tcp);
        assert_eq!(pkt.src_addr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(pkt.dst_addr, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(pkt.src_port, 5000);
        assert_eq!(pkt.dst_port, 80);
        assert_eq!(pkt.payload_len, 100);
        assert_eq!(pkt.timestamp, 1.5);
    }

    #[test]
    fn decodes_udp_payload_length() {
        let frame = build_udp_frame([192, 168, 1, 7], [8, 8, 8, 8], 49152, 53, &[0x11; 32]);
        let pkt = decode_frame(0.0, &frame).expect("udp frame should decode");

        assert_eq!(pkt.protocol, TransportProtocol::Udp);
        assert_eq!(pkt.dst_port, 53);
        assert_eq!(pkt.payload_len, 32);
    }

    #[test]
    fn empty_payload_is_zero() {
        let frame = build_tcp_frame([1, 2, 3, 4], [5, 6, 7, 8], 1, 2, b"");
        assert_eq!(decode_frame(0.0, &frame).unwrap().payload_len, 0);
    }

    #[test]
    fn rejects_non_ip_frames() {
        let mut frame = vec![0u8; 60];
        frame[12] = 0x08;
        frame[13] = 0x06; // ARP
        assert!(decode_frame(0.0, &frame).is_none());
    }

    #[test]
    fn rejects_truncated_frames() {
        assert!(decode_frame(0.0, &[]).is_none());
        assert!(decode_frame(0.0, &[0u8; 10]).is_none());

        let frame = build_tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 5000, 80, b"");
        assert!(decode_frame(0.0, &frame[..30]).is_none());
    }

    #[test]
    fn rejects_other_transports() {
        let mut frame = build_udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, &[0; 8]);
        frame[14 + 9] = 1; // ICMP
        assert!(decode_frame(0.0, &frame).is_none());
    }

    #[test]
    fn protocol_parses_case_insensitively() {
        assert_eq!("TCP".parse::<TransportProtocol>(), Ok(TransportProtocol::Tcp));
        assert_eq!("udp".parse::<TransportProtocol>(), Ok(TransportProtocol::Udp));
        assert!("ICMP".parse::<TransportProtocol>().is_err());
    }

    #[test]
    fn descriptor_names_both_endpoints() {
        let frame = build_tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 5000, 80, b"x");
        let pkt = decode_frame(0.0, &frame).unwrap();
        assert_eq!(pkt.descriptor(), "10.0.0.1:5000<->10.0.0.2:80_tcp");
    }
}
