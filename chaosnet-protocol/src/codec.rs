//! Framing for the local NCP packet channel.
//!
//! Packet layout (4 bytes header + payload):
//!
//! ```text
//! +--------+----------+-----------+-----------+------------------+
//! | opcode | reserved | length_lo | length_hi | payload          |
//! | 1 byte |  1 byte  |  1 byte   |  1 byte   | length bytes     |
//! +--------+----------+-----------+-----------+------------------+
//! ```
//!
//! Only the opcode and data travel on this channel; the NCP fills in
//! addresses and sequence numbers itself.

use crate::error::ProtocolError;
use crate::packet::{Opcode, Packet};
use crate::MAX_DATA;
use bytes::{Buf, BufMut, BytesMut};

/// Size of the local packet header in bytes.
pub const LOCAL_HEADER_SIZE: usize = 4;

/// Encodes a packet for the local packet channel.
pub fn encode_local_packet(opcode: Opcode, payload: &[u8]) -> Result<BytesMut, ProtocolError> {
    if payload.len() > MAX_DATA {
        return Err(ProtocolError::PacketTooLarge {
            size: payload.len(),
            max: MAX_DATA,
        });
    }

    let mut buf = BytesMut::with_capacity(LOCAL_HEADER_SIZE + payload.len());
    buf.put_u8(opcode.code());
    buf.put_u8(0);
    buf.put_u16_le(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf)
}

/// Incremental decoder for the local packet channel.
///
/// Bytes are appended as they arrive; a packet is produced only once its
/// header and the whole payload are buffered.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(2 * (LOCAL_HEADER_SIZE + MAX_DATA)),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Gives mutable access to the buffer so readers can fill it in place.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Returns how many more bytes are needed before the next packet can
    /// be decoded.
    pub fn needed(&self) -> usize {
        if self.buffer.len() < LOCAL_HEADER_SIZE {
            return LOCAL_HEADER_SIZE - self.buffer.len();
        }
        let length = u16::from_le_bytes([self.buffer[2], self.buffer[3]]) as usize;
        (LOCAL_HEADER_SIZE + length).saturating_sub(self.buffer.len())
    }

    /// Attempts to decode the next packet from the buffer.
    ///
    /// Returns `Ok(None)` if more data is needed.
    pub fn decode_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        if self.buffer.len() < LOCAL_HEADER_SIZE {
            return Ok(None);
        }

        let length = u16::from_le_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if length > MAX_DATA {
            return Err(ProtocolError::PacketTooLarge {
                size: length,
                max: MAX_DATA,
            });
        }
        if self.buffer.len() < LOCAL_HEADER_SIZE + length {
            return Ok(None);
        }

        let opcode = Opcode::new(self.buffer[0]);
        self.buffer.advance(LOCAL_HEADER_SIZE);
        let data = self.buffer.split_to(length).freeze();

        Ok(Some(Packet::new(opcode, data)))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_local_header_layout() {
        let payload = vec![0xAA; 300];
        let encoded = encode_local_packet(Opcode::DAT, &payload).unwrap();
        assert_eq!(&encoded[..4], &[0o200, 0, 44, 1]);
        assert_eq!(encoded.len(), 304);
    }

    #[test]
    fn test_control_packet_without_payload() {
        let encoded = encode_local_packet(Opcode::OPN, &[]).unwrap();
        assert_eq!(&encoded[..], &[2, 0, 0, 0]);

        let mut decoder = Decoder::new();
        decoder.extend(&encoded);
        let packet = decoder.decode_packet().unwrap().unwrap();
        assert_eq!(packet.opcode, Opcode::OPN);
        assert!(packet.is_empty());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_packet_decoding() {
        let encoded = encode_local_packet(Opcode::RFC, b"RTAPE").unwrap();
        let mut decoder = Decoder::new();

        decoder.extend(&encoded[..2]);
        assert_eq!(decoder.needed(), 2);
        assert!(decoder.decode_packet().unwrap().is_none());

        decoder.extend(&encoded[2..6]);
        assert_eq!(decoder.needed(), 3);
        assert!(decoder.decode_packet().unwrap().is_none());

        decoder.extend(&encoded[6..]);
        assert_eq!(decoder.needed(), 0);
        let packet = decoder.decode_packet().unwrap().unwrap();
        assert_eq!(packet.opcode, Opcode::RFC);
        assert_eq!(&packet.data[..], b"RTAPE");
    }

    #[test]
    fn test_multiple_packets_in_buffer() {
        let mut decoder = Decoder::new();
        decoder.extend(&encode_local_packet(Opcode::RFC, b"host").unwrap());
        decoder.extend(&encode_local_packet(Opcode::DAT, b"data").unwrap());

        assert_eq!(decoder.decode_packet().unwrap().unwrap().opcode, Opcode::RFC);
        assert_eq!(decoder.decode_packet().unwrap().unwrap().opcode, Opcode::DAT);
        assert!(decoder.decode_packet().unwrap().is_none());
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let result = encode_local_packet(Opcode::DAT, &vec![0u8; MAX_DATA + 1]);
        assert!(matches!(result, Err(ProtocolError::PacketTooLarge { .. })));

        let mut decoder = Decoder::new();
        decoder.extend(&[0o200, 0, 0xFF, 0x01]);
        assert!(matches!(
            decoder.decode_packet(),
            Err(ProtocolError::PacketTooLarge { size: 511, .. })
        ));
    }

    #[test]
    fn test_decoder_default() {
        let mut decoder = Decoder::default();
        assert_eq!(decoder.buffered(), 0);
        decoder.extend(b"xy");
        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }

    proptest! {
        #[test]
        fn prop_local_packet_roundtrip(
            opcode in any::<u8>(),
            data in proptest::collection::vec(any::<u8>(), 0..=MAX_DATA),
        ) {
            let encoded = encode_local_packet(Opcode::new(opcode), &data).unwrap();
            let mut decoder = Decoder::new();
            decoder.extend(&encoded);
            let packet = decoder.decode_packet().unwrap().unwrap();
            prop_assert_eq!(packet, Packet::new(Opcode::new(opcode), data));
        }
    }
}
