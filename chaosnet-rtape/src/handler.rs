//! RTAPE command handlers.
//!
//! Turns DAT payloads into commands through the session's deframer and
//! carries each command out against the mounted tape. Tape faults are
//! reported to the client as hard or soft errors in a status reply; only
//! failures that end the session come back as [`ServerError`].

use crate::config::RtapeConfig;
use crate::error::ServerError;
use crate::session::Session;
use bytes::Bytes;
use chaosnet_client::PacketLink;
use chaosnet_protocol::{
    encode_reply, parse_count, Command, CommandOp, Deframed, MountMode, MountRequest, Opcode,
    Packet, ProtocolError, ReplyOp, StatusBlock, StatusFlags, RECORD_STREAM_VERSION,
};
use chaosnet_tape::{Record, TapeError, TapeImage};
use std::sync::Arc;
use tracing::{debug, info, warn};

const NOT_MOUNTED: &str = "Tape not mounted";
const ALREADY_MOUNTED: &str = "Tape already mounted";
const READ_ONLY_MOUNT: &str = "Mount read-only, write not allowed";

/// What the worker should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    /// The session is over; a CLS has been sent.
    Close,
}

/// Command handler.
pub struct CommandHandler {
    config: Arc<RtapeConfig>,
}

impl CommandHandler {
    /// Creates a new command handler.
    pub fn new(config: Arc<RtapeConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RtapeConfig {
        &self.config
    }

    /// Feeds one DAT payload through the deframer and runs every command
    /// it completes.
    pub async fn handle_data<L>(
        &self,
        session: &mut Session,
        link: &mut L,
        chunk: &[u8],
    ) -> Result<Outcome, ServerError>
    where
        L: PacketLink + ?Sized,
    {
        session.deframer_mut().extend(chunk);

        loop {
            let event = match session.deframer_mut().next_event() {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(Outcome::Continue),
                Err(ProtocolError::BadVersion(line)) => {
                    info!("[{}] Bad record version: {:?}", session.peer(), line);
                    link.send_packet(&Packet::control(Opcode::CLS)).await?;
                    return Err(ProtocolError::BadVersion(line).into());
                }
                Err(ProtocolError::UnknownCommand(code)) => {
                    return Err(ServerError::ProtocolViolation(format!(
                        "unknown operation {}",
                        code
                    )));
                }
                Err(e) => return Err(e.into()),
            };

            match event {
                Deframed::Version => {
                    debug!("[{}] Record stream version ok", session.peer());
                    let echo = Packet::new(Opcode::DAT, Bytes::from_static(RECORD_STREAM_VERSION));
                    link.send_packet(&echo).await?;
                }
                Deframed::Command(command) => {
                    if self.handle(session, link, &command).await? == Outcome::Close {
                        return Ok(Outcome::Close);
                    }
                }
            }
        }
    }

    /// Handles one command.
    pub async fn handle<L>(
        &self,
        session: &mut Session,
        link: &mut L,
        command: &Command,
    ) -> Result<Outcome, ServerError>
    where
        L: PacketLink + ?Sized,
    {
        debug!(
            "[{}] Command {} ({} bytes)",
            session.peer(),
            command.op,
            command.payload.len()
        );

        match command.op {
            CommandOp::Login => self.handle_login(session, link, command).await?,
            CommandOp::Mount => self.handle_mount(session, link, command).await?,
            CommandOp::Probe => self.handle_probe(session, link, command).await?,
            CommandOp::Read => self.handle_read(session, link, command).await?,
            CommandOp::Write => self.handle_write(session, link, command).await?,
            CommandOp::Rewind | CommandOp::RewindSync => self.handle_rewind(session, link).await?,
            CommandOp::Unload => self.handle_unload(session, link).await?,
            CommandOp::SpaceFile => self.handle_space_file(session, link, command).await?,
            CommandOp::SpaceRecord => self.handle_space_record(session, link, command).await?,
            CommandOp::WriteMark => self.handle_write_mark(session, link).await?,
            CommandOp::Close => return self.handle_close(session, link, command).await,
        }

        Ok(Outcome::Continue)
    }

    async fn handle_login<L: PacketLink + ?Sized>(
        &self,
        session: &mut Session,
        link: &mut L,
        command: &Command,
    ) -> Result<(), ServerError> {
        let user = command.text();
        info!("[{}] Received login: {}", session.peer(), user);
        session.set_login(user);
        self.send_reply(link, ReplyOp::LoginResponse, &[0]).await
    }

    async fn handle_mount<L: PacketLink + ?Sized>(
        &self,
        session: &mut Session,
        link: &mut L,
        command: &Command,
    ) -> Result<(), ServerError> {
        let request = match MountRequest::parse(&command.payload) {
            Ok(request) => request,
            Err(e) => return self.hard_error(session, link, &e.to_string()).await,
        };

        info!(
            "[{}] Mount: type={:?}, reel={}, drive={}, size={}, density={}",
            session.peer(),
            request.mode,
            request.reel,
            request.drive,
            request.size,
            request.density
        );

        if session.is_mounted() {
            return self.hard_error(session, link, ALREADY_MOUNTED).await;
        }
        if !self.config.allow_slash && request.drive.contains('/') {
            return self
                .hard_error(session, link, "Slash not allowed in drive name")
                .await;
        }
        if self.config.read_only && request.mode.is_writable() {
            return self
                .hard_error(session, link, "Only read-only mounts allowed")
                .await;
        }

        let path = self.config.tape_path(&request.drive);
        let opened = match request.mode {
            MountMode::Read => TapeImage::open_read(&path),
            MountMode::Write => TapeImage::open_write(&path),
            MountMode::Both => TapeImage::open_both(&path),
        };

        match opened {
            Ok(tape) => {
                session.mount(&request.drive, tape, request.no_rewind);
                debug!("[{}] Mounted {}", session.peer(), path.display());
                Ok(())
            }
            Err(e) => {
                *session.flags_mut() = StatusFlags::new();
                let message = match e {
                    TapeError::Io(io) => format!("Error mounting drive: {}", io),
                    other => format!("Error mounting drive: {}", other),
                };
                self.hard_error(session, link, &message).await
            }
        }
    }

    async fn handle_probe<L: PacketLink + ?Sized>(
        &self,
        session: &mut Session,
        link: &mut L,
        command: &Command,
    ) -> Result<(), ServerError> {
        let byte = |i: usize| command.payload.get(i).copied().unwrap_or(0);
        let id = u16::from_le_bytes([byte(0), byte(1)]);
        debug!("[{}] Probe status (id {})", session.peer(), id);

        session.flags_mut().insert(StatusFlags::SOL);
        let status = session.status(id, None);
        session.flags_mut().remove(StatusFlags::SOL);
        self.send_status(session, link, &status).await
    }

    /// Reads records and sends each one to the client.
    ///
    /// An empty or non-positive count reads until the client sends
    /// something. Any read stops at a file mark, the end of the medium or
    /// an error, and yields to pending client input before every record.
    async fn handle_read<L: PacketLink + ?Sized>(
        &self,
        session: &mut Session,
        link: &mut L,
        command: &Command,
    ) -> Result<(), ServerError> {
        if !session.is_mounted() {
            return self.hard_error(session, link, NOT_MOUNTED).await;
        }

        let mut was_mark = if session.flags().contains(StatusFlags::EOF) {
            StatusFlags::EOT
        } else {
            0
        };

        let count = parse_count(&command.payload);
        let mut remaining = if command.payload.is_empty() || count <= 0 {
            debug!("[{}] Read continuous records", session.peer());
            None
        } else {
            debug!("[{}] Read {} records", session.peer(), count);
            Some(count)
        };

        session.flags_mut().remove(StatusFlags::POSITION);
        let delay = self.config.record_delay();

        loop {
            if let Some(n) = remaining.as_mut() {
                if *n == 0 {
                    return Ok(());
                }
                *n -= 1;
            }

            if link.input_pending() {
                debug!("[{}] Read interrupted by client input", session.peer());
                return Ok(());
            }

            let record = match session.with_tape(|tape| tape.read_record()) {
                Some(record) => record,
                None => return self.hard_error(session, link, NOT_MOUNTED).await,
            };

            match record {
                Ok(Record::Data(data)) => {
                    debug!("[{}] Read record: {} octets", session.peer(), data.len());
                    was_mark = 0;
                    self.send_reply(link, ReplyOp::Data, &data).await?;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Ok(Record::Mark) => {
                    debug!("[{}] Read mark", session.peer());
                    session.flags_mut().insert(StatusFlags::EOF | was_mark);
                    return self.send_reply(link, ReplyOp::FileMark, &[]).await;
                }
                Ok(Record::EndOfMedium) => {
                    debug!("[{}] Read end of tape medium", session.peer());
                    session.flags_mut().insert(StatusFlags::EOT);
                    return self.hard_error(session, link, "End of tape medium").await;
                }
                Err(e) => {
                    warn!("[{}] {}", session.peer(), e);
                    return self.hard_error(session, link, "Tape read error").await;
                }
            }
        }
    }

    async fn handle_write<L: PacketLink + ?Sized>(
        &self,
        session: &mut Session,
        link: &mut L,
        command: &Command,
    ) -> Result<(), ServerError> {
        if !session.is_mounted() {
            return self.hard_error(session, link, NOT_MOUNTED).await;
        }
        if !session.flags().contains(StatusFlags::WRITE) {
            return self.soft_error(session, link, READ_ONLY_MOUNT).await;
        }

        debug!(
            "[{}] Write record: {} octets",
            session.peer(),
            command.payload.len()
        );
        session.flags_mut().remove(StatusFlags::POSITION);

        match session.with_tape(|tape| tape.write_record(&command.payload)) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                warn!("[{}] {}", session.peer(), e);
                self.hard_error(session, link, "Tape write error").await
            }
            None => self.hard_error(session, link, NOT_MOUNTED).await,
        }
    }

    async fn handle_rewind<L: PacketLink + ?Sized>(
        &self,
        session: &mut Session,
        link: &mut L,
    ) -> Result<(), ServerError> {
        debug!("[{}] Rewind", session.peer());

        match session.with_tape(rewind_tape) {
            Some(Ok(())) => {
                let flags = session.flags_mut();
                flags.insert(StatusFlags::BOT);
                flags.remove(StatusFlags::EOT | StatusFlags::EOF | StatusFlags::HER | StatusFlags::SER);
                Ok(())
            }
            Some(Err(e)) => {
                warn!("[{}] {}", session.peer(), e);
                self.hard_error(session, link, "Rewind failed").await
            }
            None => self.hard_error(session, link, NOT_MOUNTED).await,
        }
    }

    async fn handle_unload<L: PacketLink + ?Sized>(
        &self,
        session: &mut Session,
        link: &mut L,
    ) -> Result<(), ServerError> {
        self.handle_rewind(session, link).await?;
        if let Some(tape) = session.unmount() {
            info!("[{}] Unloaded {}", session.peer(), tape.path().display());
        }
        Ok(())
    }

    async fn handle_space_file<L: PacketLink + ?Sized>(
        &self,
        session: &mut Session,
        link: &mut L,
        command: &Command,
    ) -> Result<(), ServerError> {
        if !session.is_mounted() {
            return self.hard_error(session, link, NOT_MOUNTED).await;
        }

        let count = parse_count(&command.payload);
        session.flags_mut().remove(StatusFlags::POSITION);
        debug!("[{}] Space file: {}", session.peer(), count);

        if count == 0 {
            return Ok(());
        }
        if count < 0 {
            return self
                .hard_error(session, link, "Space file reverse not implemented")
                .await;
        }

        let stop = session.with_tape(|tape| {
            let mut stop = skip_file(tape);
            for _ in 1..count {
                if stop != StatusFlags::EOF {
                    break;
                }
                stop = skip_file(tape);
            }
            stop
        });
        if let Some(stop) = stop {
            session.flags_mut().insert(stop);
        }
        Ok(())
    }

    async fn handle_space_record<L: PacketLink + ?Sized>(
        &self,
        session: &mut Session,
        link: &mut L,
        command: &Command,
    ) -> Result<(), ServerError> {
        if !session.is_mounted() {
            return self.hard_error(session, link, NOT_MOUNTED).await;
        }

        let count = parse_count(&command.payload);
        session.flags_mut().remove(StatusFlags::POSITION);
        debug!("[{}] Space record: {}", session.peer(), count);

        if count == 0 {
            return Ok(());
        }
        if count < 0 {
            return self
                .hard_error(session, link, "Space record reverse not implemented")
                .await;
        }

        if let Some(Some(stop)) = session.with_tape(|tape| skip_records(tape, count)) {
            session.flags_mut().insert(stop);
        }
        Ok(())
    }

    async fn handle_write_mark<L: PacketLink + ?Sized>(
        &self,
        session: &mut Session,
        link: &mut L,
    ) -> Result<(), ServerError> {
        if !session.is_mounted() {
            return self.hard_error(session, link, NOT_MOUNTED).await;
        }
        if !session.flags().contains(StatusFlags::WRITE) {
            return self.soft_error(session, link, READ_ONLY_MOUNT).await;
        }

        debug!("[{}] Write mark", session.peer());
        let written = session.with_tape(|tape| {
            tape.write_mark()?;
            tape.write_mark()?;
            tape.back_over_mark()
        });

        match written {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                warn!("[{}] {}", session.peer(), e);
                self.hard_error(session, link, "Write mark failed").await
            }
            None => self.hard_error(session, link, NOT_MOUNTED).await,
        }
    }

    async fn handle_close<L: PacketLink + ?Sized>(
        &self,
        session: &mut Session,
        link: &mut L,
        command: &Command,
    ) -> Result<Outcome, ServerError> {
        info!("[{}] Close: {}", session.peer(), command.text());
        link.send_packet(&Packet::control(Opcode::CLS)).await?;
        Ok(Outcome::Close)
    }

    /// Flags a hard error and reports it. The message is repeated by later
    /// status replies while HER stays set.
    async fn hard_error<L: PacketLink + ?Sized>(
        &self,
        session: &mut Session,
        link: &mut L,
        message: &str,
    ) -> Result<(), ServerError> {
        info!("[{}] Hard error: {}", session.peer(), message);
        session.flags_mut().insert(StatusFlags::HER);
        let status = session.status(0, Some(message));
        self.send_status(session, link, &status).await
    }

    async fn soft_error<L: PacketLink + ?Sized>(
        &self,
        session: &mut Session,
        link: &mut L,
        message: &str,
    ) -> Result<(), ServerError> {
        info!("[{}] Soft error: {}", session.peer(), message);
        session.flags_mut().insert(StatusFlags::SER);
        let status = session.transient_status(0, message);
        self.send_status(session, link, &status).await
    }

    async fn send_status<L: PacketLink + ?Sized>(
        &self,
        session: &Session,
        link: &mut L,
        status: &StatusBlock,
    ) -> Result<(), ServerError> {
        if let Some(message) = &status.message {
            debug!("[{}] Send status: {}", session.peer(), message);
        }
        self.send_reply(link, ReplyOp::Status, &status.encode()).await
    }

    async fn send_reply<L: PacketLink + ?Sized>(
        &self,
        link: &mut L,
        op: ReplyOp,
        payload: &[u8],
    ) -> Result<(), ServerError> {
        for chunk in encode_reply(op, payload) {
            link.send_packet(&Packet::new(Opcode::DAT, chunk)).await?;
        }
        Ok(())
    }
}

/// Ends the medium if the tape was written, then rewinds.
fn rewind_tape(tape: &mut TapeImage) -> Result<(), TapeError> {
    if tape.is_writable() {
        tape.write_eot()?;
    }
    tape.rewind()
}

/// Reads past the next file mark. Returns the flag for where it stopped.
fn skip_file(tape: &mut TapeImage) -> u32 {
    loop {
        match tape.read_record() {
            Ok(Record::Data(_)) => continue,
            Ok(Record::Mark) => return StatusFlags::EOF,
            Ok(Record::EndOfMedium) => return StatusFlags::EOT,
            Err(e) => {
                debug!("Space stopped: {}", e);
                return StatusFlags::HER;
            }
        }
    }
}

/// Reads past up to `count` data records, stopping early on anything else.
fn skip_records(tape: &mut TapeImage, count: i32) -> Option<u32> {
    for _ in 0..count {
        match tape.read_record() {
            Ok(Record::Data(_)) => {}
            Ok(Record::Mark) => return Some(StatusFlags::EOF),
            Ok(Record::EndOfMedium) => return Some(StatusFlags::EOT),
            Err(e) => {
                debug!("Space stopped: {}", e);
                return Some(StatusFlags::HER);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chaosnet_client::TransportError;
    use std::path::Path;
    use tempfile::TempDir;

    /// Records sent packets. Reports pending input once `pending_after`
    /// packets have gone out.
    #[derive(Default)]
    struct MockLink {
        sent: Vec<Packet>,
        pending_after: Option<usize>,
    }

    #[async_trait]
    impl PacketLink for MockLink {
        async fn send_packet(&mut self, packet: &Packet) -> Result<(), TransportError> {
            self.sent.push(packet.clone());
            Ok(())
        }

        async fn recv_packet(&mut self) -> Result<Packet, TransportError> {
            Err(TransportError::PeerClosed)
        }

        fn input_pending(&mut self) -> bool {
            self.pending_after.is_some_and(|n| self.sent.len() >= n)
        }
    }

    impl MockLink {
        /// Parses every reply out of the DAT stream sent so far.
        fn replies(&self) -> Vec<(u8, Vec<u8>)> {
            let stream: Vec<u8> = self
                .sent
                .iter()
                .filter(|p| p.opcode == Opcode::DAT)
                .flat_map(|p| p.data.iter().copied())
                .collect();

            let mut replies = Vec::new();
            let mut rest = &stream[..];
            while rest.len() >= 3 {
                let len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
                replies.push((rest[0], rest[3..3 + len].to_vec()));
                rest = &rest[3 + len..];
            }
            replies
        }

        fn last_status(&self) -> StatusBlock {
            let (_, payload) = self
                .replies()
                .into_iter()
                .rev()
                .find(|(op, _)| *op == ReplyOp::Status as u8)
                .expect("no status reply");
            StatusBlock::decode(&payload).unwrap()
        }

        fn clear(&mut self) {
            self.sent.clear();
        }
    }

    fn test_handler() -> (TempDir, CommandHandler, Session, MockLink) {
        let dir = TempDir::new().unwrap();
        let config = RtapeConfig {
            tape_dir: dir.path().to_path_buf(),
            record_delay_ms: 0,
            ..Default::default()
        };
        let handler = CommandHandler::new(Arc::new(config));
        (dir, handler, Session::new("test-peer"), MockLink::default())
    }

    enum Item<'a> {
        Data(&'a [u8]),
        Mark,
    }

    fn write_image(dir: &Path, name: &str, items: &[Item<'_>]) {
        let mut tape = TapeImage::open_write(dir.join(name)).unwrap();
        for item in items {
            match item {
                Item::Data(data) => tape.write_record(data).unwrap(),
                Item::Mark => tape.write_mark().unwrap(),
            }
        }
        tape.write_eot().unwrap();
    }

    fn cmd(op: CommandOp, text: &str) -> Command {
        Command::new(op, text.as_bytes().to_vec())
    }

    async fn run(
        handler: &CommandHandler,
        session: &mut Session,
        link: &mut MockLink,
        op: CommandOp,
        text: &str,
    ) -> Outcome {
        handler.handle(session, link, &cmd(op, text)).await.unwrap()
    }

    #[tokio::test]
    async fn test_login() {
        let (_dir, handler, mut session, mut link) = test_handler();
        run(&handler, &mut session, &mut link, CommandOp::Login, "LISPM").await;

        assert_eq!(session.login(), Some("LISPM"));
        assert_eq!(link.replies(), vec![(ReplyOp::LoginResponse as u8, vec![0])]);
    }

    #[tokio::test]
    async fn test_probe_sets_sol_for_reply_only() {
        let (_dir, handler, mut session, mut link) = test_handler();
        let probe = Command::new(CommandOp::Probe, vec![0x02u8, 0x01]);
        handler.handle(&mut session, &mut link, &probe).await.unwrap();

        let status = link.last_status();
        assert_eq!(status.id, 0x0102);
        assert!(status.flags.contains(StatusFlags::SOL));
        assert_eq!(status.message, None);
        assert!(!session.flags().contains(StatusFlags::SOL));
    }

    #[tokio::test]
    async fn test_mount_read_sends_nothing() {
        let (dir, handler, mut session, mut link) = test_handler();
        write_image(dir.path(), "tape0", &[Item::Data(b"abc")]);

        run(&handler, &mut session, &mut link, CommandOp::Mount, "READ reel1 tape0 2400 1600").await;
        assert!(link.sent.is_empty());
        assert!(session.flags().contains(StatusFlags::MNT | StatusFlags::BOT));
        assert!(!session.flags().contains(StatusFlags::WRITE));

        run(&handler, &mut session, &mut link, CommandOp::Probe, "").await;
        let status = link.last_status();
        assert_eq!(status.drive.as_deref(), Some("tape0"));
        assert!(status.flags.contains(StatusFlags::MNT));
    }

    #[tokio::test]
    async fn test_mount_missing_image() {
        let (_dir, handler, mut session, mut link) = test_handler();
        run(&handler, &mut session, &mut link, CommandOp::Mount, "READ reel1 nosuch 2400 1600").await;

        let status = link.last_status();
        assert!(status.flags.contains(StatusFlags::HER));
        assert!(!status.flags.contains(StatusFlags::MNT));
        assert!(status
            .message
            .unwrap()
            .starts_with("Error mounting drive: "));
        assert!(!session.is_mounted());
    }

    #[tokio::test]
    async fn test_mount_rejects_slash() {
        let (dir, handler, mut session, mut link) = test_handler();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        write_image(&dir.path().join("sub"), "tape0", &[]);

        run(&handler, &mut session, &mut link, CommandOp::Mount, "READ r sub/tape0 0 0").await;
        assert_eq!(
            link.last_status().message.as_deref(),
            Some("Slash not allowed in drive name")
        );
        assert!(!session.is_mounted());

        let config = RtapeConfig {
            tape_dir: dir.path().to_path_buf(),
            allow_slash: true,
            ..Default::default()
        };
        let handler = CommandHandler::new(Arc::new(config));
        let mut session = Session::new("test-peer");
        link.clear();
        run(&handler, &mut session, &mut link, CommandOp::Mount, "READ r sub/tape0 0 0").await;
        assert!(session.is_mounted());
        assert!(link.sent.is_empty());
    }

    #[tokio::test]
    async fn test_mount_read_only_server() {
        let (dir, _, mut session, mut link) = test_handler();
        let config = RtapeConfig {
            tape_dir: dir.path().to_path_buf(),
            read_only: true,
            ..Default::default()
        };
        let handler = CommandHandler::new(Arc::new(config));

        for mode in ["WRITE", "BOTH"] {
            link.clear();
            let text = format!("{} reel tape0 2400 1600", mode);
            run(&handler, &mut session, &mut link, CommandOp::Mount, &text).await;
            let status = link.last_status();
            assert_eq!(status.message.as_deref(), Some("Only read-only mounts allowed"));
            assert!(!status.flags.contains(StatusFlags::MNT));
            assert!(!session.flags().contains(StatusFlags::MNT));
            assert!(!session.is_mounted());
        }
        assert!(!dir.path().join("tape0").exists());

        write_image(dir.path(), "tape0", &[]);
        link.clear();
        run(&handler, &mut session, &mut link, CommandOp::Mount, "READ reel tape0 2400 1600").await;
        assert!(link.sent.is_empty());
        assert!(session.flags().contains(StatusFlags::MNT));

        run(&handler, &mut session, &mut link, CommandOp::Write, "data").await;
        let status = link.last_status();
        assert!(status.flags.contains(StatusFlags::SER));
        assert_eq!(
            status.message.as_deref(),
            Some("Mount read-only, write not allowed")
        );
    }

    #[tokio::test]
    async fn test_mount_twice() {
        let (_dir, handler, mut session, mut link) = test_handler();
        run(&handler, &mut session, &mut link, CommandOp::Mount, "WRITE r tape0 0 0 norewind").await;
        assert!(session.flags().contains(StatusFlags::WRITE | StatusFlags::NOREW));

        run(&handler, &mut session, &mut link, CommandOp::Mount, "WRITE r tape1 0 0").await;
        assert_eq!(link.last_status().message.as_deref(), Some(ALREADY_MOUNTED));
        assert_eq!(session.mounted_drive(), Some("tape0"));
    }

    #[tokio::test]
    async fn test_bad_mount_request() {
        let (_dir, handler, mut session, mut link) = test_handler();
        run(&handler, &mut session, &mut link, CommandOp::Mount, "APPEND r tape0 0 0").await;
        let status = link.last_status();
        assert!(status.flags.contains(StatusFlags::HER));
        assert!(status.message.unwrap().contains("APPEND"));
    }

    #[tokio::test]
    async fn test_read_records_and_marks() {
        let (dir, handler, mut session, mut link) = test_handler();
        write_image(
            dir.path(),
            "tape0",
            &[Item::Data(b"abc"), Item::Data(b"defg"), Item::Mark, Item::Mark],
        );
        run(&handler, &mut session, &mut link, CommandOp::Mount, "READ r tape0 0 0").await;

        run(&handler, &mut session, &mut link, CommandOp::Read, "2").await;
        assert_eq!(
            link.replies(),
            vec![
                (ReplyOp::Data as u8, b"abc".to_vec()),
                (ReplyOp::Data as u8, b"defg".to_vec()),
            ]
        );
        assert!(!session.flags().contains(StatusFlags::BOT));

        link.clear();
        run(&handler, &mut session, &mut link, CommandOp::Read, "1").await;
        assert_eq!(link.replies(), vec![(ReplyOp::FileMark as u8, vec![])]);
        assert!(session.flags().contains(StatusFlags::EOF));
        assert!(!session.flags().contains(StatusFlags::EOT));

        link.clear();
        run(&handler, &mut session, &mut link, CommandOp::Read, "1").await;
        assert_eq!(link.replies(), vec![(ReplyOp::FileMark as u8, vec![])]);
        assert!(session.flags().contains(StatusFlags::EOF | StatusFlags::EOT));
    }

    #[tokio::test]
    async fn test_read_continuous_yields_to_client() {
        let (dir, handler, mut session, mut link) = test_handler();
        let items: Vec<Item<'_>> = (0..5).map(|_| Item::Data(b"record")).collect();
        write_image(dir.path(), "tape0", &items);
        run(&handler, &mut session, &mut link, CommandOp::Mount, "READ r tape0 0 0").await;

        link.pending_after = Some(2);
        run(&handler, &mut session, &mut link, CommandOp::Read, "").await;
        assert_eq!(link.replies().len(), 2);

        link.pending_after = None;
        link.clear();
        run(&handler, &mut session, &mut link, CommandOp::Read, "0").await;
        let replies = link.replies();
        assert_eq!(replies.len(), 4);
        assert_eq!(replies[2].0, ReplyOp::Data as u8);
        assert_eq!(replies[3].0, ReplyOp::Status as u8);
        assert!(session.flags().contains(StatusFlags::EOT | StatusFlags::HER));
    }

    #[tokio::test]
    async fn test_read_end_of_medium_message_is_repeated() {
        let (dir, handler, mut session, mut link) = test_handler();
        write_image(dir.path(), "tape0", &[]);
        run(&handler, &mut session, &mut link, CommandOp::Mount, "READ r tape0 0 0").await;

        run(&handler, &mut session, &mut link, CommandOp::Read, "").await;
        let status = link.last_status();
        assert!(status.flags.contains(StatusFlags::EOT | StatusFlags::HER | StatusFlags::STRG));
        assert_eq!(status.message.as_deref(), Some("End of tape medium"));

        link.clear();
        run(&handler, &mut session, &mut link, CommandOp::Probe, "").await;
        assert_eq!(link.last_status().message.as_deref(), Some("End of tape medium"));
    }

    #[tokio::test]
    async fn test_read_corrupt_record() {
        let (dir, handler, mut session, mut link) = test_handler();
        std::fs::write(dir.path().join("tape0"), 0x8000_0004u32.to_le_bytes()).unwrap();
        run(&handler, &mut session, &mut link, CommandOp::Mount, "READ r tape0 0 0").await;

        run(&handler, &mut session, &mut link, CommandOp::Read, "1").await;
        assert_eq!(link.last_status().message.as_deref(), Some("Tape read error"));
    }

    #[tokio::test]
    async fn test_read_largest_record() {
        let (dir, handler, mut session, mut link) = test_handler();
        let big = vec![0x5Au8; chaosnet_tape::MAX_RECORD];
        write_image(dir.path(), "tape0", &[Item::Data(&big)]);
        run(&handler, &mut session, &mut link, CommandOp::Mount, "READ r tape0 0 0").await;

        run(&handler, &mut session, &mut link, CommandOp::Read, "1").await;
        let head = &link.sent[0].data;
        assert_eq!(head[0], ReplyOp::Data as u8);
        assert_eq!(u16::from_be_bytes([head[1], head[2]]), u16::MAX);
        assert_eq!(link.replies(), vec![(ReplyOp::Data as u8, big)]);
    }

    #[tokio::test]
    async fn test_read_oversize_record_is_read_error() {
        let (dir, handler, mut session, mut link) = test_handler();
        let length = (chaosnet_tape::MAX_RECORD as u32 + 1).to_le_bytes();
        let mut raw = length.to_vec();
        raw.extend_from_slice(&vec![0u8; chaosnet_tape::MAX_RECORD + 1]);
        raw.extend_from_slice(&length);
        std::fs::write(dir.path().join("tape0"), raw).unwrap();
        run(&handler, &mut session, &mut link, CommandOp::Mount, "READ r tape0 0 0").await;

        run(&handler, &mut session, &mut link, CommandOp::Read, "1").await;
        let replies = link.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, ReplyOp::Status as u8);
        let status = link.last_status();
        assert!(status.flags.contains(StatusFlags::HER));
        assert_eq!(status.message.as_deref(), Some("Tape read error"));
    }

    #[tokio::test]
    async fn test_unmounted_commands() {
        let (_dir, handler, mut session, mut link) = test_handler();
        for op in [
            CommandOp::Read,
            CommandOp::Write,
            CommandOp::Rewind,
            CommandOp::SpaceFile,
            CommandOp::WriteMark,
        ] {
            link.clear();
            run(&handler, &mut session, &mut link, op, "1").await;
            assert_eq!(link.last_status().message.as_deref(), Some(NOT_MOUNTED));
        }
    }

    #[tokio::test]
    async fn test_write_on_read_only_mount() {
        let (dir, handler, mut session, mut link) = test_handler();
        write_image(dir.path(), "tape0", &[]);
        run(&handler, &mut session, &mut link, CommandOp::Mount, "READ r tape0 0 0").await;

        run(&handler, &mut session, &mut link, CommandOp::Write, "data").await;
        let status = link.last_status();
        assert!(status.flags.contains(StatusFlags::SER));
        assert_eq!(status.message.as_deref(), Some(READ_ONLY_MOUNT));

        link.clear();
        run(&handler, &mut session, &mut link, CommandOp::WriteMark, "").await;
        assert_eq!(link.last_status().message.as_deref(), Some(READ_ONLY_MOUNT));

        link.clear();
        run(&handler, &mut session, &mut link, CommandOp::Probe, "").await;
        assert_eq!(link.last_status().message, None);
    }

    #[tokio::test]
    async fn test_write_mark_rewind_read_back() {
        let (dir, handler, mut session, mut link) = test_handler();
        run(&handler, &mut session, &mut link, CommandOp::Mount, "WRITE r tape0 0 0").await;

        run(&handler, &mut session, &mut link, CommandOp::Write, "hello").await;
        run(&handler, &mut session, &mut link, CommandOp::WriteMark, "").await;
        run(&handler, &mut session, &mut link, CommandOp::Write, "world").await;
        run(&handler, &mut session, &mut link, CommandOp::WriteMark, "").await;
        run(&handler, &mut session, &mut link, CommandOp::Rewind, "").await;
        assert!(link.sent.is_empty());
        assert!(session.flags().contains(StatusFlags::BOT));

        run(&handler, &mut session, &mut link, CommandOp::Read, "").await;
        assert_eq!(
            link.replies(),
            vec![
                (ReplyOp::Data as u8, b"hello".to_vec()),
                (ReplyOp::FileMark as u8, vec![]),
            ]
        );

        link.clear();
        run(&handler, &mut session, &mut link, CommandOp::SpaceFile, "1").await;
        assert!(session.flags().contains(StatusFlags::EOF));
        run(&handler, &mut session, &mut link, CommandOp::Read, "1").await;
        assert_eq!(link.replies(), vec![(ReplyOp::FileMark as u8, vec![])]);
        assert!(session.flags().contains(StatusFlags::EOF | StatusFlags::EOT));

        let mut reader = TapeImage::open_read(dir.path().join("tape0")).unwrap();
        let mut records = Vec::new();
        loop {
            match reader.read_record().unwrap() {
                Record::EndOfMedium => break,
                record => records.push(record),
            }
        }
        assert_eq!(
            records,
            vec![
                Record::Data(Bytes::from_static(b"hello")),
                Record::Mark,
                Record::Data(Bytes::from_static(b"world")),
                Record::Mark,
                Record::Mark,
            ]
        );
    }

    #[tokio::test]
    async fn test_space_file_and_record() {
        let (dir, handler, mut session, mut link) = test_handler();
        write_image(
            dir.path(),
            "tape0",
            &[
                Item::Data(b"a1"),
                Item::Data(b"a2"),
                Item::Mark,
                Item::Data(b"b1"),
                Item::Mark,
                Item::Data(b"c1"),
                Item::Data(b"c2"),
                Item::Data(b"c3"),
            ],
        );
        run(&handler, &mut session, &mut link, CommandOp::Mount, "READ r tape0 0 0").await;

        run(&handler, &mut session, &mut link, CommandOp::SpaceFile, "0").await;
        assert!(!session.flags().contains(StatusFlags::BOT));

        run(&handler, &mut session, &mut link, CommandOp::SpaceFile, "2").await;
        assert!(session.flags().contains(StatusFlags::EOF));

        run(&handler, &mut session, &mut link, CommandOp::SpaceRecord, "2").await;
        assert!(!session.flags().intersects(StatusFlags::EOF | StatusFlags::EOT));

        run(&handler, &mut session, &mut link, CommandOp::Read, "1").await;
        assert_eq!(link.replies(), vec![(ReplyOp::Data as u8, b"c3".to_vec())]);

        run(&handler, &mut session, &mut link, CommandOp::SpaceRecord, "5").await;
        assert!(session.flags().contains(StatusFlags::EOT));

        run(&handler, &mut session, &mut link, CommandOp::SpaceFile, "3").await;
        assert!(session.flags().contains(StatusFlags::EOT));
        assert_eq!(link.replies().len(), 1);
    }

    #[tokio::test]
    async fn test_hard_error_message_held_until_cleared() {
        let (dir, handler, mut session, mut link) = test_handler();
        write_image(dir.path(), "tape0", &[Item::Data(b"x")]);
        run(&handler, &mut session, &mut link, CommandOp::Mount, "READ r tape0 0 0").await;

        run(&handler, &mut session, &mut link, CommandOp::SpaceFile, "-1").await;
        link.clear();
        run(&handler, &mut session, &mut link, CommandOp::Probe, "").await;
        run(&handler, &mut session, &mut link, CommandOp::Probe, "").await;

        let replies = link.replies();
        assert_eq!(replies.len(), 2);
        for (op, payload) in replies {
            assert_eq!(op, ReplyOp::Status as u8);
            let status = StatusBlock::decode(&payload).unwrap();
            assert!(status.flags.contains(StatusFlags::HER));
            assert_eq!(
                status.message.as_deref(),
                Some("Space file reverse not implemented")
            );
        }

        link.clear();
        run(&handler, &mut session, &mut link, CommandOp::Rewind, "").await;
        assert!(link.sent.is_empty());

        run(&handler, &mut session, &mut link, CommandOp::Probe, "").await;
        let status = link.last_status();
        assert!(!status.flags.contains(StatusFlags::HER));
        assert!(!status.flags.contains(StatusFlags::STRG));
        assert_eq!(status.message, None);
        assert!(status.flags.contains(StatusFlags::BOT));
    }

    #[tokio::test]
    async fn test_space_reverse() {
        let (dir, handler, mut session, mut link) = test_handler();
        write_image(dir.path(), "tape0", &[Item::Data(b"x")]);
        run(&handler, &mut session, &mut link, CommandOp::Mount, "READ r tape0 0 0").await;

        run(&handler, &mut session, &mut link, CommandOp::SpaceFile, "-1").await;
        assert_eq!(
            link.last_status().message.as_deref(),
            Some("Space file reverse not implemented")
        );
        run(&handler, &mut session, &mut link, CommandOp::SpaceRecord, "-2").await;
        assert_eq!(
            link.last_status().message.as_deref(),
            Some("Space record reverse not implemented")
        );
    }

    #[tokio::test]
    async fn test_unload() {
        let (_dir, handler, mut session, mut link) = test_handler();
        run(&handler, &mut session, &mut link, CommandOp::Mount, "BOTH r tape0 0 0").await;
        run(&handler, &mut session, &mut link, CommandOp::Write, "data").await;
        run(&handler, &mut session, &mut link, CommandOp::Unload, "").await;

        assert!(!session.is_mounted());
        assert!(!session.flags().contains(StatusFlags::MNT));
        run(&handler, &mut session, &mut link, CommandOp::Probe, "").await;
        assert_eq!(link.last_status().drive, None);

        run(&handler, &mut session, &mut link, CommandOp::Mount, "READ r tape0 0 0").await;
        run(&handler, &mut session, &mut link, CommandOp::Read, "1").await;
        assert_eq!(link.replies().last().unwrap().1, b"data".to_vec());
    }

    #[tokio::test]
    async fn test_close() {
        let (_dir, handler, mut session, mut link) = test_handler();
        let outcome = run(&handler, &mut session, &mut link, CommandOp::Close, "done").await;
        assert_eq!(outcome, Outcome::Close);
        assert_eq!(link.sent.len(), 1);
        assert_eq!(link.sent[0].opcode, Opcode::CLS);
    }

    #[tokio::test]
    async fn test_handle_data_version_and_commands() {
        let (_dir, handler, mut session, mut link) = test_handler();

        let mut stream = RECORD_STREAM_VERSION.to_vec();
        stream.extend_from_slice(&cmd(CommandOp::Login, "USER").encode());
        stream.extend_from_slice(&cmd(CommandOp::Probe, "").encode());

        let (first, second) = stream.split_at(30);
        assert_eq!(
            handler.handle_data(&mut session, &mut link, first).await.unwrap(),
            Outcome::Continue
        );
        assert_eq!(&link.sent[0].data[..], RECORD_STREAM_VERSION);
        assert!(!session.awaiting_version());

        handler.handle_data(&mut session, &mut link, second).await.unwrap();
        assert_eq!(session.login(), Some("USER"));
        assert_eq!(link.sent.len(), 3);
        assert_eq!(link.sent[2].data[0], ReplyOp::Status as u8);
    }

    #[tokio::test]
    async fn test_handle_data_bad_version() {
        let (_dir, handler, mut session, mut link) = test_handler();
        let result = handler
            .handle_data(&mut session, &mut link, b"RECORD STREAM VERSION 2\x8d")
            .await;

        assert!(matches!(
            result,
            Err(ServerError::Framing(ProtocolError::BadVersion(_)))
        ));
        assert_eq!(link.sent.len(), 1);
        assert_eq!(link.sent[0].opcode, Opcode::CLS);
    }

    #[tokio::test]
    async fn test_handle_data_unknown_command() {
        let (_dir, handler, mut session, mut link) = test_handler();
        let mut stream = RECORD_STREAM_VERSION.to_vec();
        stream.extend_from_slice(&[11, 0, 0]);

        let result = handler.handle_data(&mut session, &mut link, &stream).await;
        assert!(matches!(result, Err(ServerError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_handle_data_stops_at_close() {
        let (_dir, handler, mut session, mut link) = test_handler();
        let mut stream = RECORD_STREAM_VERSION.to_vec();
        stream.extend_from_slice(&cmd(CommandOp::Close, "bye").encode());
        stream.extend_from_slice(&cmd(CommandOp::Login, "late").encode());

        let outcome = handler.handle_data(&mut session, &mut link, &stream).await.unwrap();
        assert_eq!(outcome, Outcome::Close);
        assert_eq!(session.login(), None);
    }
}
