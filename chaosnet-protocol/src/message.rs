//! RTAPE record-stream messages.
//!
//! Commands and replies share one framing inside the byte stream carried
//! by DAT packets:
//!
//! ```text
//! +--------+-----------+-----------+---------------------+
//! | opcode | length_hi | length_lo | payload             |
//! | 1 byte |  1 byte   |  1 byte   | length bytes        |
//! +--------+-----------+-----------+---------------------+
//! ```

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Version line both ends exchange before any command, terminated by 0215.
pub const RECORD_STREAM_VERSION: &[u8] = b"RECORD STREAM VERSION 1\x8d";

/// Terminator of the version line.
pub const VERSION_TERMINATOR: u8 = 0o215;

/// Status block format version.
pub const STATUS_VERSION: u8 = 1;

/// Size of the fixed part of a status block.
pub const STATUS_HEADER_SIZE: usize = 36;

/// Longest drive name recorded in a status block.
pub const MAX_DRIVE_LEN: usize = 16;

/// Most payload bytes a reply puts in one DAT packet.
pub const REPLY_CHUNK: usize = 450;

/// Size of the reply header.
pub const REPLY_HEADER_SIZE: usize = 3;

/// Largest reply that fits a single packet: MAX_PACKET minus the reply header.
pub const MAX_STATUS_SIZE: usize = crate::MAX_PACKET - REPLY_HEADER_SIZE;

// Status block field offsets.
const ST_VERSION: usize = 0;
const ST_ID: usize = 1;
const ST_DRIVE_LEN: usize = 17;
const ST_DRIVE: usize = 18;
const ST_FLAGS: usize = 34;

/// Commands sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandOp {
    Login = 1,
    Mount = 2,
    Probe = 3,
    Read = 4,
    Write = 5,
    Rewind = 6,
    RewindSync = 7,
    Unload = 8,
    SpaceFile = 9,
    SpaceRecord = 10,
    WriteMark = 12,
    Close = 13,
}

impl CommandOp {
    /// Returns the protocol mnemonic.
    pub fn name(&self) -> &'static str {
        match self {
            CommandOp::Login => "LGI",
            CommandOp::Mount => "MNT",
            CommandOp::Probe => "PRB",
            CommandOp::Read => "RD",
            CommandOp::Write => "WRT",
            CommandOp::Rewind => "RWD",
            CommandOp::RewindSync => "SYN",
            CommandOp::Unload => "UNL",
            CommandOp::SpaceFile => "SPF",
            CommandOp::SpaceRecord => "SPR",
            CommandOp::WriteMark => "WFM",
            CommandOp::Close => "CLS",
        }
    }
}

impl TryFrom<u8> for CommandOp {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        let op = match code {
            1 => CommandOp::Login,
            2 => CommandOp::Mount,
            3 => CommandOp::Probe,
            4 => CommandOp::Read,
            5 => CommandOp::Write,
            6 => CommandOp::Rewind,
            7 => CommandOp::RewindSync,
            8 => CommandOp::Unload,
            9 => CommandOp::SpaceFile,
            10 => CommandOp::SpaceRecord,
            12 => CommandOp::WriteMark,
            13 => CommandOp::Close,
            other => return Err(ProtocolError::UnknownCommand(other)),
        };
        Ok(op)
    }
}

impl fmt::Display for CommandOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Replies sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyOp {
    /// Login response.
    LoginResponse = 33,
    /// Record data.
    Data = 34,
    /// File mark read.
    FileMark = 35,
    /// Status block.
    Status = 36,
}

/// A complete command reassembled by the deframer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub op: CommandOp,
    pub payload: Bytes,
}

impl Command {
    pub fn new(op: CommandOp, payload: impl Into<Bytes>) -> Self {
        Self {
            op,
            payload: payload.into(),
        }
    }

    /// Returns the payload as text up to the first NUL.
    pub fn text(&self) -> String {
        let end = self
            .payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }

    /// Encodes the command in record-stream framing.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(REPLY_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.op as u8);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf
    }
}

/// Splits a reply into DAT packet payloads.
///
/// The first packet carries the 3-byte header and up to [`REPLY_CHUNK`]
/// payload bytes; continuation packets carry up to [`REPLY_CHUNK`] bytes.
/// The length field is 16 bits, so callers keep payloads to `u16::MAX`.
pub fn encode_reply(op: ReplyOp, payload: &[u8]) -> Vec<Bytes> {
    let first = payload.len().min(REPLY_CHUNK);

    let mut head = BytesMut::with_capacity(REPLY_HEADER_SIZE + first);
    head.put_u8(op as u8);
    head.put_u16(payload.len() as u16);
    head.put_slice(&payload[..first]);

    let mut packets = vec![head.freeze()];
    packets.extend(
        payload[first..]
            .chunks(REPLY_CHUNK)
            .map(Bytes::copy_from_slice),
    );
    packets
}

/// Parses a count argument the way C `atoi` reads the first token: optional
/// sign, then leading digits; anything else yields 0.
pub fn parse_count(data: &[u8]) -> i32 {
    let mut bytes = data
        .iter()
        .copied()
        .skip_while(|b| b.is_ascii_whitespace())
        .peekable();

    let negative = match bytes.peek() {
        Some(b'-') => {
            bytes.next();
            true
        }
        Some(b'+') => {
            bytes.next();
            false
        }
        _ => false,
    };

    let mut value: i64 = 0;
    for b in bytes.take_while(|b| b.is_ascii_digit()) {
        value = (value * 10 + i64::from(b - b'0')).min(i64::from(i32::MAX) + 1);
    }
    if negative {
        value = -value;
    }
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Status flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags(u32);

impl StatusFlags {
    /// Solicited (reply to a probe).
    pub const SOL: u32 = 0o1;
    /// Beginning of tape.
    pub const BOT: u32 = 0o2;
    /// End of tape.
    pub const EOT: u32 = 0o4;
    /// End of file seen by the last read.
    pub const EOF: u32 = 0o10;
    /// Not logged in.
    pub const NLI: u32 = 0o20;
    /// Mounted.
    pub const MNT: u32 = 0o40;
    /// Explanatory string follows the status.
    pub const STRG: u32 = 0o100;
    /// Hard error.
    pub const HER: u32 = 0o200;
    /// Soft error.
    pub const SER: u32 = 0o400;
    /// Offline.
    pub const OFFL: u32 = 0o1000;
    /// Non-record-oriented device.
    pub const NREC: u32 = 0o2000;
    /// Don't rewind on close. Never transmitted.
    pub const NOREW: u32 = 0o200000;
    /// Mounted for writing. Never transmitted.
    pub const WRITE: u32 = 0o400000;

    /// Flags a read, write or space operation resets before it starts.
    pub const POSITION: u32 = Self::BOT | Self::EOT | Self::EOF | Self::HER | Self::SER;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn intersects(&self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    pub fn insert(&mut self, bits: u32) {
        self.0 |= bits;
    }

    pub fn remove(&mut self, bits: u32) {
        self.0 &= !bits;
    }

    /// Returns the 16 bits that go on the wire.
    pub fn wire_bits(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

/// A status reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusBlock {
    /// Probe id echoed back to the client.
    pub id: u16,
    /// Drive name, reported only while mounted.
    pub drive: Option<String>,
    pub flags: StatusFlags,
    pub message: Option<String>,
}

impl StatusBlock {
    /// Encodes the 36-byte block plus the optional message.
    ///
    /// STRG is added to the transmitted flags when a message follows; the
    /// message is cut to what fits a single packet.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::zeroed(STATUS_HEADER_SIZE);
        buf[ST_VERSION] = STATUS_VERSION;
        buf[ST_ID..ST_ID + 2].copy_from_slice(&self.id.to_le_bytes());

        if let Some(drive) = &self.drive {
            let name = &drive.as_bytes()[..drive.len().min(MAX_DRIVE_LEN)];
            buf[ST_DRIVE_LEN] = name.len() as u8;
            buf[ST_DRIVE..ST_DRIVE + name.len()].copy_from_slice(name);
        }

        let mut flags = self.flags;
        let message = self.message.as_deref().filter(|m| !m.is_empty());
        if message.is_some() {
            flags.insert(StatusFlags::STRG);
        }
        buf[ST_FLAGS..ST_FLAGS + 2].copy_from_slice(&flags.wire_bits().to_le_bytes());

        if let Some(message) = message {
            let n = message.len().min(MAX_STATUS_SIZE - STATUS_HEADER_SIZE);
            buf.put_slice(&message.as_bytes()[..n]);
        }
        buf
    }

    /// Decodes a status block, as a client would.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < STATUS_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                needed: STATUS_HEADER_SIZE,
                got: data.len(),
            });
        }

        let id = u16::from_le_bytes([data[ST_ID], data[ST_ID + 1]]);
        let flags = StatusFlags::from_bits(u32::from(u16::from_le_bytes([
            data[ST_FLAGS],
            data[ST_FLAGS + 1],
        ])));
        let drive_len = (data[ST_DRIVE_LEN] as usize).min(MAX_DRIVE_LEN);
        let drive = if flags.contains(StatusFlags::MNT) {
            Some(String::from_utf8_lossy(&data[ST_DRIVE..ST_DRIVE + drive_len]).into_owned())
        } else {
            None
        };
        let message = if flags.contains(StatusFlags::STRG) {
            Some(String::from_utf8_lossy(&data[STATUS_HEADER_SIZE..]).into_owned())
        } else {
            None
        };

        Ok(Self {
            id,
            drive,
            flags,
            message,
        })
    }
}

/// How a tape is to be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    Read,
    Write,
    Both,
}

impl MountMode {
    pub fn is_writable(&self) -> bool {
        !matches!(self, MountMode::Read)
    }
}

/// A parsed mount argument line:
/// `TYPE REEL DRIVE SIZE DENSITY [NOREWIND]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub mode: MountMode,
    pub reel: String,
    pub drive: String,
    pub size: String,
    pub density: String,
    pub no_rewind: bool,
}

impl MountRequest {
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        let line = String::from_utf8_lossy(&data[..end]);
        let mut tokens = line.split(|c: char| c <= ' ').filter(|t| !t.is_empty());

        let mode = match tokens.next() {
            Some("READ") => MountMode::Read,
            Some("WRITE") => MountMode::Write,
            Some("BOTH") => MountMode::Both,
            Some(other) => {
                return Err(ProtocolError::BadMount(format!("unknown mount type {other}")))
            }
            None => return Err(ProtocolError::BadMount("empty mount request".to_string())),
        };
        let mut field = || tokens.next().unwrap_or_default().to_string();
        let reel = field();
        let drive = field();
        let size = field();
        let density = field();
        let no_rewind = tokens.any(|option| option.eq_ignore_ascii_case("NOREWIND"));

        if drive.is_empty() {
            return Err(ProtocolError::BadMount("missing drive name".to_string()));
        }

        Ok(Self {
            mode,
            reel,
            drive,
            size,
            density,
            no_rewind,
        })
    }
}
