//! Session management.
//!
//! One session per accepted connection. The worker that owns the
//! connection owns its session, so nothing here is shared.

use chaosnet_protocol::message::MAX_DRIVE_LEN;
use chaosnet_protocol::{Deframer, DeframerState, StatusBlock, StatusFlags};
use chaosnet_tape::TapeImage;

/// Longest hard-error message kept for repeating in later status replies.
pub const MAX_REMEMBERED_MESSAGE: usize = 100;

/// A client session.
pub struct Session {
    /// Contact string the peer sent with its RFC.
    peer: String,

    /// Status flags of the most recent operation.
    flags: StatusFlags,

    /// Drive name of the mounted tape.
    mounted_drive: Option<String>,

    /// The mounted tape.
    tape: Option<TapeImage>,

    /// User name from the last login.
    login: Option<String>,

    /// Message repeated while a hard error stays flagged.
    last_message: String,

    /// Record-stream decoder.
    deframer: Deframer,
}

impl Session {
    /// Creates a new session.
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            flags: StatusFlags::new(),
            mounted_drive: None,
            tape: None,
            login: None,
            last_message: String::new(),
            deframer: Deframer::new(),
        }
    }

    /// Returns the peer contact string.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn flags(&self) -> StatusFlags {
        self.flags
    }

    pub fn flags_mut(&mut self) -> &mut StatusFlags {
        &mut self.flags
    }

    pub fn login(&self) -> Option<&str> {
        self.login.as_deref()
    }

    pub fn set_login(&mut self, user: impl Into<String>) {
        self.login = Some(user.into());
    }

    pub fn is_mounted(&self) -> bool {
        self.tape.is_some()
    }

    pub fn mounted_drive(&self) -> Option<&str> {
        self.mounted_drive.as_deref()
    }

    /// Runs `op` on the mounted tape, or returns `None` if there is none.
    pub fn with_tape<T>(&mut self, op: impl FnOnce(&mut TapeImage) -> T) -> Option<T> {
        self.tape.as_mut().map(op)
    }

    /// Records a successful mount. Flags restart from the mount.
    pub fn mount(&mut self, drive: &str, tape: TapeImage, no_rewind: bool) {
        let mut flags = StatusFlags::new();
        if tape.is_writable() {
            flags.insert(StatusFlags::WRITE);
        }
        if no_rewind {
            flags.insert(StatusFlags::NOREW);
        }
        flags.insert(StatusFlags::MNT | StatusFlags::BOT);

        self.flags = flags;
        self.mounted_drive = Some(truncate(drive, MAX_DRIVE_LEN).to_string());
        self.tape = Some(tape);
    }

    /// Releases the tape.
    pub fn unmount(&mut self) -> Option<TapeImage> {
        self.flags
            .remove(StatusFlags::MNT | StatusFlags::WRITE | StatusFlags::NOREW | StatusFlags::BOT);
        self.mounted_drive = None;
        self.tape.take()
    }

    /// Builds a status reply, updating the remembered message.
    ///
    /// An explicit message is remembered. Without one, the remembered message
    /// is repeated while HER is set and forgotten otherwise.
    pub fn status(&mut self, id: u16, message: Option<&str>) -> StatusBlock {
        let message = match message.filter(|m| !m.is_empty()) {
            Some(message) => {
                self.last_message = truncate(message, MAX_REMEMBERED_MESSAGE).to_string();
                Some(message.to_string())
            }
            None if self.flags.contains(StatusFlags::HER) => {
                Some(self.last_message.clone()).filter(|m| !m.is_empty())
            }
            None => {
                self.last_message.clear();
                None
            }
        };
        self.block(id, message)
    }

    /// Builds a status reply carrying a message that is not remembered.
    pub fn transient_status(&self, id: u16, message: &str) -> StatusBlock {
        self.block(id, Some(message.to_string()))
    }

    fn block(&self, id: u16, message: Option<String>) -> StatusBlock {
        let drive = if self.flags.contains(StatusFlags::MNT) {
            self.mounted_drive.clone()
        } else {
            None
        };
        StatusBlock {
            id,
            drive,
            flags: self.flags,
            message,
        }
    }

    pub fn deframer_mut(&mut self) -> &mut Deframer {
        &mut self.deframer
    }

    /// Returns whether the peer has yet to send its version line.
    pub fn awaiting_version(&self) -> bool {
        self.deframer.state() == DeframerState::AwaitingVersion
    }
}

/// Cuts `s` to at most `max` bytes on a character boundary.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
