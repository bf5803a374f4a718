//! UDP encapsulations of Chaosnet packets.
//!
//! Both variants share the Chaosnet header (all fields big-endian 16-bit
//! words after the opcode byte):
//!
//! ```text
//! +--------+----------+-------------+-----------+------------+
//! | opcode | reserved | length (12) | dest host | dest index |
//! +--------+----------+-------------+-----------+------------+
//! | source host | source index | packet number | ack number  |
//! +-------------+--------------+---------------+-------------+
//! ```
//!
//! UDP-direct follows the header with the payload in byte-swapped 16-bit
//! words, a trailer repeating dest and source host, and a ones'-complement
//! checksum over header, payload and trailer.
//!
//! CHUDP prepends the envelope `{1, 1, 0, 0}` and carries the payload
//! unswapped, with no trailer and no checksum.

use crate::error::ProtocolError;
use crate::packet::{Address, Opcode, Packet};
use crate::MAX_DATA;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the Chaosnet header in bytes.
pub const CHAOS_HEADER_SIZE: usize = 16;

/// Size of the CHUDP envelope in bytes.
pub const CHUDP_ENVELOPE_SIZE: usize = 4;

/// Size of the UDP-direct trailer (dest host, source host, checksum).
pub const TRAILER_SIZE: usize = 6;

/// CHUDP envelope version.
pub const CHUDP_VERSION: u8 = 1;

/// CHUDP packet type for a Chaosnet packet.
pub const CHUDP_PKT_CHAOS: u8 = 1;

/// Length field mask: the header keeps 12 bits of length.
const LENGTH_MASK: u16 = 0x0FFF;

/// Which UDP wire shape a socket speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encapsulation {
    /// Header, word-swapped payload, trailer and checksum.
    #[default]
    Direct,
    /// Envelope, header and raw payload.
    Chudp,
}

impl Encapsulation {
    pub fn encode(&self, packet: &Packet) -> Result<BytesMut, ProtocolError> {
        match self {
            Encapsulation::Direct => encode_udp_packet(packet),
            Encapsulation::Chudp => encode_chudp_packet(packet),
        }
    }

    pub fn decode(&self, datagram: &[u8]) -> Result<Packet, ProtocolError> {
        match self {
            Encapsulation::Direct => decode_udp_packet(datagram),
            Encapsulation::Chudp => decode_chudp_packet(datagram),
        }
    }
}

/// Computes the legacy Chaosnet checksum.
///
/// The bytes are summed as big-endian 16-bit words; a trailing odd byte is
/// added as is. Carries above bit 15 are folded back in until none remain,
/// and the ones' complement of the result is returned.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [odd] = words.remainder() {
        sum += u32::from(*odd);
    }

    while sum & !0xFFFF != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

fn put_header(buf: &mut BytesMut, packet: &Packet) {
    buf.put_u8(packet.opcode.code());
    buf.put_u8(0);
    // Only 12 bits of length survive; packets never exceed MAX_DATA.
    buf.put_u16(packet.data.len() as u16 & LENGTH_MASK);
    buf.put_u16(packet.dest.host);
    buf.put_u16(packet.dest.index);
    buf.put_u16(packet.source.host);
    buf.put_u16(packet.source.index);
    buf.put_u16(packet.packet_number);
    buf.put_u16(packet.ack_number);
}

fn word(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

/// Parses a header, returning the packet without data and the payload length.
fn parse_header(data: &[u8]) -> Result<(Packet, usize), ProtocolError> {
    if data.len() < CHAOS_HEADER_SIZE {
        return Err(ProtocolError::Truncated {
            needed: CHAOS_HEADER_SIZE,
            got: data.len(),
        });
    }

    let length = (word(data, 2) & LENGTH_MASK) as usize;
    if length > MAX_DATA {
        return Err(ProtocolError::PacketTooLarge {
            size: length,
            max: MAX_DATA,
        });
    }

    let packet = Packet {
        opcode: Opcode::new(data[0]),
        data: Bytes::new(),
        dest: Address::new(word(data, 4), word(data, 6)),
        source: Address::new(word(data, 8), word(data, 10)),
        packet_number: word(data, 12),
        ack_number: word(data, 14),
    };
    Ok((packet, length))
}

/// Rounds a payload length up to whole 16-bit words.
fn padded(length: usize) -> usize {
    length + (length & 1)
}

/// Encodes a packet in the UDP-direct shape.
pub fn encode_udp_packet(packet: &Packet) -> Result<BytesMut, ProtocolError> {
    packet.check_size()?;

    let payload_len = padded(packet.data.len());
    let mut buf = BytesMut::with_capacity(CHAOS_HEADER_SIZE + payload_len + TRAILER_SIZE);
    put_header(&mut buf, packet);

    for pair in packet.data.chunks(2) {
        match *pair {
            [even, odd] => {
                buf.put_u8(odd);
                buf.put_u8(even);
            }
            [even] => {
                buf.put_u8(0);
                buf.put_u8(even);
            }
            _ => unreachable!("chunks(2) yields one or two bytes"),
        }
    }

    buf.put_u16(packet.dest.host);
    buf.put_u16(packet.source.host);
    let sum = checksum(&buf);
    buf.put_u16(sum);

    Ok(buf)
}

/// Decodes a UDP-direct datagram, verifying its checksum.
pub fn decode_udp_packet(datagram: &[u8]) -> Result<Packet, ProtocolError> {
    let (mut packet, length) = parse_header(datagram)?;

    let covered = CHAOS_HEADER_SIZE + padded(length) + TRAILER_SIZE - 2;
    if datagram.len() < covered + 2 {
        return Err(ProtocolError::Truncated {
            needed: covered + 2,
            got: datagram.len(),
        });
    }

    let expected = word(datagram, covered);
    let actual = checksum(&datagram[..covered]);
    if expected != actual {
        return Err(ProtocolError::ChecksumMismatch { expected, actual });
    }

    let swapped = &datagram[CHAOS_HEADER_SIZE..CHAOS_HEADER_SIZE + padded(length)];
    let mut data = BytesMut::with_capacity(swapped.len());
    for pair in swapped.chunks_exact(2) {
        data.put_u8(pair[1]);
        data.put_u8(pair[0]);
    }
    data.truncate(length);
    packet.data = data.freeze();

    Ok(packet)
}

/// Encodes a packet in the CHUDP shape.
pub fn encode_chudp_packet(packet: &Packet) -> Result<BytesMut, ProtocolError> {
    packet.check_size()?;

    let mut buf =
        BytesMut::with_capacity(CHUDP_ENVELOPE_SIZE + CHAOS_HEADER_SIZE + packet.data.len());
    buf.put_slice(&[CHUDP_VERSION, CHUDP_PKT_CHAOS, 0, 0]);
    put_header(&mut buf, packet);
    buf.put_slice(&packet.data);
    Ok(buf)
}

/// Decodes a CHUDP datagram.
pub fn decode_chudp_packet(datagram: &[u8]) -> Result<Packet, ProtocolError> {
    if datagram.len() < CHUDP_ENVELOPE_SIZE {
        return Err(ProtocolError::Truncated {
            needed: CHUDP_ENVELOPE_SIZE,
            got: datagram.len(),
        });
    }
    if datagram[0] != CHUDP_VERSION || datagram[1] != CHUDP_PKT_CHAOS {
        return Err(ProtocolError::BadEnvelope {
            version: datagram[0],
            kind: datagram[1],
        });
    }

    let body = &datagram[CHUDP_ENVELOPE_SIZE..];
    let (mut packet, length) = parse_header(body)?;
    if body.len() < CHAOS_HEADER_SIZE + length {
        return Err(ProtocolError::Truncated {
            needed: CHUDP_ENVELOPE_SIZE + CHAOS_HEADER_SIZE + length,
            got: datagram.len(),
        });
    }
    packet.data = Bytes::copy_from_slice(&body[CHAOS_HEADER_SIZE..CHAOS_HEADER_SIZE + length]);

    Ok(packet)
}
