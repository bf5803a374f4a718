//! Reassembly of the RTAPE record stream.
//!
//! DAT packets carry an unstructured byte stream. The deframer consumes it
//! chunk by chunk and yields the version line followed by complete
//! commands; a command's header and payload may be split across packets in
//! any way, and one packet may hold many commands.

use crate::error::ProtocolError;
use crate::message::{Command, CommandOp, RECORD_STREAM_VERSION, VERSION_TERMINATOR};
use bytes::{Buf, BytesMut};

/// Position of the deframer within the record stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeframerState {
    AwaitingVersion,
    AwaitingOpcode,
    AwaitingLengthHi,
    AwaitingLengthLo,
    AwaitingData,
}

/// Something the deframer recognised in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deframed {
    /// The peer sent a valid version line.
    Version,
    /// A complete command.
    Command(Command),
}

/// Incremental record-stream decoder.
#[derive(Debug)]
pub struct Deframer {
    state: DeframerState,
    input: BytesMut,
    version: Vec<u8>,
    opcode: u8,
    length: usize,
    payload: BytesMut,
}

impl Deframer {
    pub fn new() -> Self {
        Self {
            state: DeframerState::AwaitingVersion,
            input: BytesMut::new(),
            version: Vec::with_capacity(RECORD_STREAM_VERSION.len()),
            opcode: 0,
            length: 0,
            payload: BytesMut::new(),
        }
    }

    pub fn state(&self) -> DeframerState {
        self.state
    }

    /// Appends an inbound chunk.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.input.extend_from_slice(chunk);
    }

    /// Returns the number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.input.len()
    }

    /// Advances through buffered input until something is recognised.
    ///
    /// Returns `Ok(None)` once the buffered input is exhausted. After an
    /// error the stream cannot be resynchronised and the session must end.
    pub fn next_event(&mut self) -> Result<Option<Deframed>, ProtocolError> {
        loop {
            match self.state {
                DeframerState::AwaitingVersion => {
                    if let Some(event) = self.take_version()? {
                        return Ok(Some(event));
                    }
                    return Ok(None);
                }
                DeframerState::AwaitingOpcode => {
                    if !self.input.has_remaining() {
                        return Ok(None);
                    }
                    self.opcode = self.input.get_u8();
                    self.state = DeframerState::AwaitingLengthHi;
                }
                DeframerState::AwaitingLengthHi => {
                    if !self.input.has_remaining() {
                        return Ok(None);
                    }
                    self.length = (self.input.get_u8() as usize) << 8;
                    self.state = DeframerState::AwaitingLengthLo;
                }
                DeframerState::AwaitingLengthLo => {
                    if !self.input.has_remaining() {
                        return Ok(None);
                    }
                    self.length |= self.input.get_u8() as usize;
                    self.payload = BytesMut::with_capacity(self.length);
                    self.state = DeframerState::AwaitingData;
                }
                DeframerState::AwaitingData => {
                    let wanted = self.length - self.payload.len();
                    let take = wanted.min(self.input.len());
                    self.payload.extend_from_slice(&self.input[..take]);
                    self.input.advance(take);

                    if self.payload.len() < self.length {
                        return Ok(None);
                    }

                    self.state = DeframerState::AwaitingOpcode;
                    let op = CommandOp::try_from(self.opcode)?;
                    let payload = std::mem::take(&mut self.payload).freeze();
                    return Ok(Some(Deframed::Command(Command::new(op, payload))));
                }
            }
        }
    }

    fn take_version(&mut self) -> Result<Option<Deframed>, ProtocolError> {
        while self.version.len() < RECORD_STREAM_VERSION.len() {
            if !self.input.has_remaining() {
                return Ok(None);
            }
            let byte = self.input.get_u8();
            self.version.push(byte);
            if byte == VERSION_TERMINATOR {
                break;
            }
        }

        let line = std::mem::take(&mut self.version);
        if !line.eq_ignore_ascii_case(RECORD_STREAM_VERSION) {
            let end = line.len() - usize::from(line.last() == Some(&VERSION_TERMINATOR));
            return Err(ProtocolError::BadVersion(
                String::from_utf8_lossy(&line[..end]).into_owned(),
            ));
        }

        self.state = DeframerState::AwaitingOpcode;
        Ok(Some(Deframed::Version))
    }
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new()
    }
}
