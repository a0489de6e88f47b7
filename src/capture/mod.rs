pub mod decoder;
pub mod sniffer;
pub mod source;

pub use decoder::{decode_frame, frame_builders, NormalizedPacket, TransportProtocol};
pub use sniffer::{PacketSink, PacketSniffer};
pub use source::{
    count_packets, list_interfaces, CaptureFile, LiveSource, NetworkInterface, PacketSource, RawFrame, SourceEvent,
};
