//! The in-memory Chaosnet packet.
//!
//! A [`Packet`] is the value every wire encoding decodes into. The local
//! NCP channel only carries the opcode and data; the UDP encodings also
//! carry the addressing and sequencing fields.

use crate::error::ProtocolError;
use crate::MAX_DATA;
use bytes::Bytes;
use std::fmt;

/// Chaosnet packet opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Opcode(u8);

impl Opcode {
    /// Request for connection.
    pub const RFC: Opcode = Opcode(1);
    /// Connection open.
    pub const OPN: Opcode = Opcode(2);
    /// Close.
    pub const CLS: Opcode = Opcode(3);
    /// Forward a connection request.
    pub const FWD: Opcode = Opcode(4);
    /// Simple answer.
    pub const ANS: Opcode = Opcode(5);
    /// Sense status.
    pub const SNS: Opcode = Opcode(6);
    /// Status (receipt and window).
    pub const STS: Opcode = Opcode(7);
    /// Routing information.
    pub const RUT: Opcode = Opcode(8);
    /// Loss of connection.
    pub const LOS: Opcode = Opcode(9);
    /// Listen (NCP channel only).
    pub const LSN: Opcode = Opcode(10);
    /// Maintenance.
    pub const MNT: Opcode = Opcode(11);
    /// End of file.
    pub const EOF: Opcode = Opcode(12);
    /// Uncontrolled data.
    pub const UNC: Opcode = Opcode(13);
    /// Broadcast request.
    pub const BRD: Opcode = Opcode(14);
    /// Acknowledgement (NCP channel only).
    pub const ACK: Opcode = Opcode(0o177);
    /// Byte data.
    pub const DAT: Opcode = Opcode(0o200);
    /// Word data.
    pub const DWD: Opcode = Opcode(0o300);

    pub const fn new(code: u8) -> Self {
        Self(code)
    }

    pub const fn code(&self) -> u8 {
        self.0
    }

    /// Returns the mnemonic for known opcodes.
    pub fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Opcode::RFC => "RFC",
            Opcode::OPN => "OPN",
            Opcode::CLS => "CLS",
            Opcode::FWD => "FWD",
            Opcode::ANS => "ANS",
            Opcode::SNS => "SNS",
            Opcode::STS => "STS",
            Opcode::RUT => "RUT",
            Opcode::LOS => "LOS",
            Opcode::LSN => "LSN",
            Opcode::MNT => "MNT",
            Opcode::EOF => "EOF",
            Opcode::UNC => "UNC",
            Opcode::BRD => "BRD",
            Opcode::ACK => "ACK",
            Opcode::DAT => "DAT",
            Opcode::DWD => "DWD",
            _ => return None,
        };
        Some(name)
    }

    /// Returns whether packets with this opcode carry data rather than
    /// control text.
    pub fn is_data(&self) -> bool {
        self.0 >= Opcode::DAT.0
    }
}

impl From<u8> for Opcode {
    fn from(code: u8) -> Self {
        Self(code)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "[{:03o}]", self.0),
        }
    }
}

/// A Chaosnet host address and connection index pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address {
    pub host: u16,
    pub index: u16,
}

impl Address {
    pub const fn new(host: u16, index: u16) -> Self {
        Self { host, index }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06o}/{:06o}", self.host, self.index)
    }
}

/// A Chaosnet packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub opcode: Opcode,
    pub data: Bytes,
    pub dest: Address,
    pub source: Address,
    pub packet_number: u16,
    pub ack_number: u16,
}

impl Packet {
    /// Creates a packet with the given opcode and data and zeroed
    /// addressing fields.
    pub fn new(opcode: Opcode, data: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            data: data.into(),
            ..Default::default()
        }
    }

    /// Creates a packet with no data.
    pub fn control(opcode: Opcode) -> Self {
        Self::new(opcode, Bytes::new())
    }

    pub fn with_addresses(mut self, dest: Address, source: Address) -> Self {
        self.dest = dest;
        self.source = source;
        self
    }

    pub fn with_numbers(mut self, packet_number: u16, ack_number: u16) -> Self {
        self.packet_number = packet_number;
        self.ack_number = ack_number;
        self
    }

    /// Returns the data length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the data as text, for control packets such as RFC, LOS and CLS
    /// whose payload is an ASCII string.
    pub fn text(&self) -> String {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.data.len());
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }

    /// Fails if the data does not fit the legacy MTU.
    pub fn check_size(&self) -> Result<(), ProtocolError> {
        if self.data.len() > MAX_DATA {
            return Err(ProtocolError::PacketTooLarge {
                size: self.data.len(),
                max: MAX_DATA,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        if !self.data.is_empty() {
            if self.opcode.is_data() {
                write!(f, " L{:03o}", self.data.len())?;
            } else {
                write!(f, ": {}", self.text())?;
            }
        }
        write!(
            f,
            " #{:06o} A{:06o} {}->{}",
            self.packet_number, self.ack_number, self.source, self.dest
        )
    }
}
