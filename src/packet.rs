// src/packet.rs - IPv4 / TCP / UDP header codec and Internet checksum
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const DEFAULT_TTL: u8 = 64;
const FLAG_DONT_FRAGMENT: u16 = 0x4000;

pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;

    pub const SYN_ACK: u8 = SYN | ACK;
    pub const FIN_ACK: u8 = FIN | ACK;
    pub const PSH_ACK: u8 = PSH | ACK;
}

/// One's-complement Internet checksum over `data[offset..offset + length]`.
///
/// `seed` is added before folding, which is how the pseudo-header sum for
/// TCP/UDP gets folded in. An odd trailing byte is padded with zero.
pub fn compute_checksum(data: &[u8], offset: usize, length: usize, seed: u32) -> u16 {
    let end = (offset + length).min(data.len());
    let bytes = &data[offset.min(end)..end];

    let mut sum = seed;
    let mut chunks = bytes.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Sum of the 12-byte pseudo-header: source, destination, zero, protocol, length.
pub fn pseudo_header_sum(source: Ipv4Addr, destination: Ipv4Addr, protocol: u8, length: u16) -> u32 {
    let src = source.octets();
    let dst = destination.octets();

    u32::from(u16::from_be_bytes([src[0], src[1]]))
        + u32::from(u16::from_be_bytes([src[2], src[3]]))
        + u32::from(u16::from_be_bytes([dst[0], dst[1]]))
        + u32::from(u16::from_be_bytes([dst[2], dst[3]]))
        + u32::from(protocol)
        + u32::from(length)
}

/// Checksum of a whole transport segment (header with a zeroed checksum field
/// plus payload) including the pseudo-header.
pub fn transport_checksum(source: Ipv4Addr, destination: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let seed = pseudo_header_sum(source, destination, protocol, segment.len() as u16);
    compute_checksum(segment, 0, segment.len(), seed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub total_len: u16,
}

/// A decoded IPv4 frame borrowing its payload from the capture buffer.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Frame<'a> {
    pub header: Ipv4Header,
    pub header_len: usize,
    pub payload: &'a [u8],
}

impl Ipv4Header {
    /// Writes a 20-byte header (no options) with a valid checksum.
    pub fn encode(&self, out: &mut BytesMut) {
        let start = out.len();
        out.put_u8(0x45);
        out.put_u8(0x00);
        out.put_u16(self.total_len);
        out.put_u16(0); // identification
        out.put_u16(FLAG_DONT_FRAGMENT);
        out.put_u8(self.ttl);
        out.put_u8(self.protocol);
        out.put_u16(0);
        out.put_slice(&self.source.octets());
        out.put_slice(&self.destination.octets());

        let checksum = compute_checksum(&out[start..], 0, IPV4_HEADER_LEN, 0);
        out[start + 10..start + 12].copy_from_slice(&checksum.to_be_bytes());
    }
}

/// Decodes an IPv4 frame. Returns `None` for anything that is not a
/// well-formed IPv4 header: other IP versions, IHL below 20 bytes, or a
/// total length that does not cover the header.
pub fn parse_ipv4(frame: &[u8]) -> Option<Ipv4Frame<'_>> {
    let ip = Ipv4Packet::new(frame)?;
    if ip.get_version() != 4 {
        return None;
    }

    let header_len = usize::from(ip.get_header_length()) * 4;
    if header_len < IPV4_HEADER_LEN || frame.len() < header_len {
        return None;
    }

    let total_len = usize::from(ip.get_total_length());
    if total_len < header_len {
        return None;
    }
    let end = total_len.min(frame.len());

    Some(Ipv4Frame {
        header: Ipv4Header {
            source: ip.get_source(),
            destination: ip.get_destination(),
            protocol: ip.get_next_level_protocol().0,
            ttl: ip.get_ttl(),
            total_len: ip.get_total_length(),
        },
        header_len,
        payload: &frame[header_len..end],
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    pub flags: u8,
    pub window: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub header: TcpHeader,
    pub header_len: usize,
    pub payload: &'a [u8],
}

impl TcpHeader {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Writes a 20-byte TCP header followed by `payload`, checksummed
    /// against the given addresses.
    pub fn encode(&self, source: Ipv4Addr, destination: Ipv4Addr, payload: &[u8], out: &mut BytesMut) {
        let start = out.len();
        out.put_u16(self.source_port);
        out.put_u16(self.destination_port);
        out.put_u32(self.sequence);
        out.put_u32(self.acknowledgement);
        out.put_u8(((TCP_HEADER_LEN / 4) as u8) << 4);
        out.put_u8(self.flags);
        out.put_u16(self.window);
        out.put_u16(0);
        out.put_u16(0); // urgent pointer
        out.put_slice(payload);

        let checksum = transport_checksum(source, destination, PROTO_TCP, &out[start..]);
        out[start + 16..start + 18].copy_from_slice(&checksum.to_be_bytes());
    }
}

pub fn parse_tcp(segment: &[u8]) -> Option<TcpSegment<'_>> {
    let tcp = TcpPacket::new(segment)?;

    let header_len = usize::from(tcp.get_data_offset()) * 4;
    if header_len < TCP_HEADER_LEN || segment.len() < header_len {
        return None;
    }

    Some(TcpSegment {
        header: TcpHeader {
            source_port: tcp.get_source(),
            destination_port: tcp.get_destination(),
            sequence: tcp.get_sequence(),
            acknowledgement: tcp.get_acknowledgement(),
            flags: (tcp.get_flags() & 0xFF) as u8,
            window: tcp.get_window(),
        },
        header_len,
        payload: &segment[header_len..],
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    pub header: UdpHeader,
    pub payload: &'a [u8],
}

impl UdpHeader {
    pub fn encode(&self, source: Ipv4Addr, destination: Ipv4Addr, payload: &[u8], out: &mut BytesMut) {
        let start = out.len();
        out.put_u16(self.source_port);
        out.put_u16(self.destination_port);
        out.put_u16((UDP_HEADER_LEN + payload.len()) as u16);
        out.put_u16(0);
        out.put_slice(payload);

        // A computed zero means "no checksum" on the wire, so send all ones instead.
        let checksum = match transport_checksum(source, destination, PROTO_UDP, &out[start..]) {
            0 => 0xFFFF,
            sum => sum,
        };
        out[start + 6..start + 8].copy_from_slice(&checksum.to_be_bytes());
    }
}

pub fn parse_udp(segment: &[u8]) -> Option<UdpDatagram<'_>> {
    let udp = UdpPacket::new(segment)?;

    let declared = usize::from(udp.get_length());
    let end = if declared >= UDP_HEADER_LEN {
        declared.min(segment.len())
    } else {
        segment.len()
    };

    Some(UdpDatagram {
        header: UdpHeader {
            source_port: udp.get_source(),
            destination_port: udp.get_destination(),
        },
        payload: &segment[UDP_HEADER_LEN..end],
    })
}

/// Fields of one synthetic TCP segment headed for the virtual interface.
#[derive(Debug, Clone, Copy)]
pub struct OutboundSegment {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub sequence: u32,
    pub acknowledgement: u32,
    pub flags: u8,
    pub window: u16,
}

pub fn build_tcp_packet(segment: &OutboundSegment, payload: &[u8]) -> Bytes {
    let total_len = IPV4_HEADER_LEN + TCP_HEADER_LEN + payload.len();
    let mut out = BytesMut::with_capacity(total_len);

    Ipv4Header {
        source: *segment.source.ip(),
        destination: *segment.destination.ip(),
        protocol: PROTO_TCP,
        ttl: DEFAULT_TTL,
        total_len: total_len as u16,
    }
    .encode(&mut out);

    TcpHeader {
        source_port: segment.source.port(),
        destination_port: segment.destination.port(),
        sequence: segment.sequence,
        acknowledgement: segment.acknowledgement,
        flags: segment.flags,
        window: segment.window,
    }
    .encode(*segment.source.ip(), *segment.destination.ip(), payload, &mut out);

    out.freeze()
}

pub fn build_udp_packet(source: SocketAddrV4, destination: SocketAddrV4, payload: &[u8]) -> Bytes {
    let total_len = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    let mut out = BytesMut::with_capacity(total_len);

    Ipv4Header {
        source: *source.ip(),
        destination: *destination.ip(),
        protocol: PROTO_UDP,
        ttl: DEFAULT_TTL,
        total_len: total_len as u16,
    }
    .encode(&mut out);

    UdpHeader {
        source_port: source.port(),
        destination_port: destination.port(),
    }
    .encode(*source.ip(), *destination.ip(), payload, &mut out);

    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr(a: [u8; 4], port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(a), port)
    }

    #[test]
    fn test_udp_zero_checksum_sent_as_all_ones() {
        let (src, dst) = (addr([10, 0, 0, 2], 5353), addr([8, 8, 8, 8], 53));
        let udp_checksum = |frame: &[u8]| u16::from_be_bytes([frame[IPV4_HEADER_LEN + 6], frame[IPV4_HEADER_LEN + 7]]);

        // A payload word equal to the checksum of the zero payload cancels it out.
        let first = build_udp_packet(src, dst, &[0, 0]);
        let payload = match udp_checksum(&first) {
            0xFFFF => [0, 0],
            sum => sum.to_be_bytes(),
        };

        let frame = build_udp_packet(src, dst, &payload);
        assert_eq!(udp_checksum(&frame), 0xFFFF);
        assert_eq!(transport_checksum(*src.ip(), *dst.ip(), PROTO_UDP, &frame[IPV4_HEADER_LEN..]), 0);
    }

    #[test]
    fn test_checksum_rfc1071_example() {
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(compute_checksum(&data, 0, data.len(), 0), !0xddf2);
    }

    #[test]
    fn test_checksum_odd_length_pads_with_zero() {
        let even = [0x12, 0x34, 0x56, 0x00];
        let odd = [0x12, 0x34, 0x56];
        assert_eq!(
            compute_checksum(&odd, 0, odd.len(), 0),
            compute_checksum(&even, 0, even.len(), 0)
        );
    }

    #[test]
    fn test_rejects_non_ipv4_and_short_headers() {
        let mut v6 = [0u8; 40];
        v6[0] = 0x60;
        assert!(parse_ipv4(&v6).is_none());

        let mut short_ihl = [0u8; 20];
        short_ihl[0] = 0x44;
        assert!(parse_ipv4(&short_ihl).is_none());

        assert!(parse_ipv4(&[0x45, 0, 0]).is_none());
    }

    #[test]
    fn test_synthetic_tcp_packet_layout() {
        let segment = OutboundSegment {
            source: addr([93, 184, 216, 34], 80),
            destination: addr([10, 0, 0, 2], 5000),
            sequence: 1000,
            acknowledgement: 42,
            flags: tcp_flags::SYN_ACK,
            window: 65535,
        };
        let packet = build_tcp_packet(&segment, b"");

        assert_eq!(packet.len(), 40);
        assert_eq!(packet[0], 0x45);
        assert_eq!(&packet[6..8], &[0x40, 0x00]);
        assert_eq!(packet[8], 64);

        let ip = parse_ipv4(&packet).expect("ipv4");
        assert_eq!(ip.header.protocol, PROTO_TCP);
        let tcp = parse_tcp(ip.payload).expect("tcp");
        assert_eq!(tcp.header.sequence, 1000);
        assert_eq!(tcp.header.acknowledgement, 42);
        assert!(tcp.header.has(tcp_flags::SYN));
        assert!(tcp.header.has(tcp_flags::ACK));
        assert!(tcp.payload.is_empty());

        let seed = pseudo_header_sum(*segment.source.ip(), *segment.destination.ip(), PROTO_TCP, ip.payload.len() as u16);
        assert_eq!(compute_checksum(ip.payload, 0, ip.payload.len(), seed), 0);
    }

    #[test]
    fn test_udp_payload_honours_length_field() {
        let packet = build_udp_packet(addr([8, 8, 8, 8], 53), addr([10, 0, 0, 2], 40000), b"answer");
        let mut padded = packet.to_vec();
        padded.extend_from_slice(&[0, 0, 0]);

        let ip = parse_ipv4(&padded).expect("ipv4");
        let udp = parse_udp(ip.payload).expect("udp");
        assert_eq!(udp.header.source_port, 53);
        assert_eq!(udp.payload, b"answer");
    }

    prop_compose! {
        fn ipv4_header()(src in any::<u32>(), dst in any::<u32>(), protocol in any::<u8>(), ttl in any::<u8>(), total in 20u16..=u16::MAX) -> Ipv4Header {
            Ipv4Header {
                source: Ipv4Addr::from(src),
                destination: Ipv4Addr::from(dst),
                protocol,
                ttl,
                total_len: total,
            }
        }
    }

    prop_compose! {
        fn tcp_header()(sp in any::<u16>(), dp in any::<u16>(), seq in any::<u32>(), ack in any::<u32>(), flags in any::<u8>(), window in any::<u16>()) -> TcpHeader {
            TcpHeader {
                source_port: sp,
                destination_port: dp,
                sequence: seq,
                acknowledgement: ack,
                flags,
                window,
            }
        }
    }

    proptest! {
        #[test]
        fn ipv4_header_decodes_to_what_was_encoded(header in ipv4_header()) {
            let mut out = BytesMut::new();
            header.encode(&mut out);
            // Pad so the declared total length is backed by bytes.
            out.resize(usize::from(header.total_len), 0);

            let frame = parse_ipv4(&out).expect("decodes");
            prop_assert_eq!(frame.header, header);
            prop_assert_eq!(frame.header_len, IPV4_HEADER_LEN);
            prop_assert_eq!(compute_checksum(&out, 0, IPV4_HEADER_LEN, 0), 0);
        }

        #[test]
        fn tcp_header_checksum_validates(
            header in tcp_header(),
            src in any::<u32>(),
            dst in any::<u32>(),
            payload in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let (src, dst) = (Ipv4Addr::from(src), Ipv4Addr::from(dst));
            let mut out = BytesMut::new();
            header.encode(src, dst, &payload, &mut out);

            let segment = parse_tcp(&out).expect("decodes");
            prop_assert_eq!(segment.header, header);
            prop_assert_eq!(segment.payload, &payload[..]);
            prop_assert_eq!(transport_checksum(src, dst, PROTO_TCP, &out), 0);
        }

        #[test]
        fn udp_packet_checksum_validates(
            src in any::<u32>(),
            dst in any::<u32>(),
            sp in any::<u16>(),
            dp in any::<u16>(),
            payload in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let (source, destination) = (SocketAddrV4::new(Ipv4Addr::from(src), sp), SocketAddrV4::new(Ipv4Addr::from(dst), dp));
            let frame = build_udp_packet(source, destination, &payload);

            let ip = parse_ipv4(&frame).expect("decodes");
            prop_assert_eq!(ip.header.protocol, PROTO_UDP);
            let datagram = parse_udp(ip.payload).expect("decodes");
            prop_assert_eq!(datagram.header.source_port, sp);
            prop_assert_eq!(datagram.header.destination_port, dp);
            prop_assert_eq!(datagram.payload, &payload[..]);
            prop_assert_ne!(&ip.payload[6..8], &[0u8, 0][..]);
            prop_assert_eq!(transport_checksum(*source.ip(), *destination.ip(), PROTO_UDP, ip.payload), 0);
        }
    }
}
