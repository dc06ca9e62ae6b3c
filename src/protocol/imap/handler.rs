use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::net::stream::ImapStream;
use crate::protocol::imap::auth::{self, Mechanism, SaslResponse};
use crate::protocol::imap::codec::Flag;
use crate::protocol::imap::command::state::{
    FetchItem, ImapCommand, SearchKey, SequenceSet, StatusItem, StoreMode, UidCommand,
};
use crate::protocol::imap::command::{parse_command, CommandDecoder, FrameResult};
use crate::protocol::imap::fetch::build_fetch_items;
use crate::protocol::imap::response::{FetchData, Response, ResponseCode, Status};
use crate::protocol::imap::selected::SelectedView;
use crate::protocol::imap::state::ImapState;
use crate::storage::{
    Authenticator, DeliverFilter, FilterVerdict, MailboxSession, SearchContext, StoreError,
};

/// Session-wide settings extracted from the config once at startup.
pub struct SessionParams {
    pub hostname: String,
    pub max_literal: usize,
    /// Inactivity limit between commands (RFC 3501 minimum 30 minutes).
    pub command_timeout: Duration,
    /// Inactivity limit inside IDLE (RFC 2177 recommends 29 minutes).
    pub idle_timeout: Duration,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            max_literal: 40 * 1024 * 1024,
            command_timeout: Duration::from_secs(30 * 60),
            idle_timeout: Duration::from_secs(29 * 60),
        }
    }
}

/// Shared pieces a connection needs from the server runtime.
pub struct ConnectionContext {
    pub store: Arc<dyn Authenticator>,
    pub filter: Arc<dyn DeliverFilter>,
    pub params: Arc<SessionParams>,
    pub tls: Option<TlsAcceptor>,
    pub shutdown: watch::Receiver<bool>,
}

enum Serve {
    Close,
    Upgrade(Upgrade),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upgrade {
    Tls,
    Deflate,
}

enum ReadOutcome {
    Command(Vec<u8>),
    Closed,
    Bye(&'static str),
}

enum IdleOutcome {
    Continue,
    Close,
}

struct CommandOutput {
    untagged: Vec<Response>,
    tagged: Response,
    /// Whether queued view updates may be flushed before the tagged
    /// response. Sequence-number commands keep their view frozen.
    flush: bool,
}

impl CommandOutput {
    fn tagged(tagged: Response) -> Self {
        Self { untagged: Vec::new(), tagged, flush: true }
    }

    fn frozen(untagged: Vec<Response>, tagged: Response) -> Self {
        Self { untagged, tagged, flush: false }
    }

    fn with_untagged(untagged: Vec<Response>, tagged: Response) -> Self {
        Self { untagged, tagged, flush: true }
    }
}

/// Per-connection protocol state machine: parses command lines,
/// authenticates, coordinates the selected view, and emits responses.
pub struct ImapHandler {
    ctx: ConnectionContext,
    session_id: u64,
    peer: String,
    localhost: bool,
    secure: bool,
    compressed: bool,
    state: ImapState,
    session: Option<Box<dyn MailboxSession>>,
    selected: Option<SelectedView>,
    greeted: bool,
}

impl ImapHandler {
    pub fn new(ctx: ConnectionContext, session_id: u64, peer: String, localhost: bool) -> Self {
        Self {
            ctx,
            session_id,
            peer,
            localhost,
            secure: false,
            compressed: false,
            state: ImapState::NotAuthenticated,
            session: None,
            selected: None,
            greeted: false,
        }
    }

    /// Drive the connection to completion, rebuilding the transport on
    /// STARTTLS and COMPRESS upgrades.
    pub async fn run(mut self, mut stream: ImapStream) -> Result<()> {
        self.secure = stream.is_tls() || matches!(stream, ImapStream::Unix(_));
        loop {
            let (read_half, write_half) = tokio::io::split(stream);
            let mut reader = BufReader::new(read_half);
            let mut writer = BufWriter::new(write_half);

            let control = self.serve(&mut reader, &mut writer).await?;
            let upgrade = match control {
                Serve::Close => {
                    self.state = ImapState::Closed;
                    return Ok(());
                }
                Serve::Upgrade(upgrade) => upgrade,
            };

            // RFC 3501 §6.2.1: bytes pipelined behind the upgrade command
            // are a protocol violation; the tagged OK is already out.
            if !reader.buffer().is_empty() {
                warn!("{} pipelined data after {:?} upgrade, closing", self.peer, upgrade);
                self.state = ImapState::Closed;
                return Ok(());
            }

            let plain = reader.into_inner().unsplit(writer.into_inner());
            stream = match upgrade {
                Upgrade::Tls => {
                    let acceptor = match self.ctx.tls.clone() {
                        Some(acceptor) => acceptor,
                        None => return Err(anyhow::anyhow!("TLS acceptor missing")),
                    };
                    let tcp = match plain {
                        ImapStream::Plain(tcp) => tcp,
                        _ => return Err(anyhow::anyhow!("STARTTLS on non-plain stream")),
                    };
                    let tls = acceptor.accept(tcp).await?;
                    self.secure = true;
                    info!("{} TLS established", self.peer);
                    ImapStream::Tls(tls)
                }
                Upgrade::Deflate => {
                    self.compressed = true;
                    debug!("{} compression active", self.peer);
                    plain.into_deflate()
                }
            };
        }
    }

    async fn serve<R, W>(
        &mut self,
        reader: &mut BufReader<R>,
        writer: &mut BufWriter<W>,
    ) -> Result<Serve>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut shutdown = self.ctx.shutdown.clone();
        let mut decoder = CommandDecoder::new(self.ctx.params.max_literal);

        if !self.greeted {
            self.greeted = true;
            let greeting = Response::untagged_ok(
                Some(ResponseCode::Capability(self.capabilities())),
                format!("{} IMAP4rev1 server ready", self.ctx.params.hostname),
            );
            write_responses(writer, std::slice::from_ref(&greeting)).await?;
        }

        loop {
            let buf = match self.read_command(reader, writer, &mut decoder, &mut shutdown).await? {
                ReadOutcome::Command(buf) => buf,
                ReadOutcome::Closed => return Ok(Serve::Close),
                ReadOutcome::Bye(reason) => {
                    let bye = Response::Bye { code: None, text: reason.to_string() };
                    write_responses(writer, &[bye]).await?;
                    return Ok(Serve::Close);
                }
            };

            let (tag, command) = match parse_command(&buf) {
                Ok(parsed) => parsed,
                Err(err) => {
                    let response = match err.tag {
                        Some(tag) => Response::bad(tag, err.message),
                        None => {
                            Response::Untagged { status: Status::Bad, code: None, text: err.message }
                        }
                    };
                    write_responses(writer, &[response]).await?;
                    continue;
                }
            };

            if !self.state.allows(&command) {
                let response = Response::bad(tag, "Command not allowed in this state");
                write_responses(writer, &[response]).await?;
                continue;
            }

            match command {
                ImapCommand::Logout => {
                    self.state = ImapState::Logout;
                    info!("{} logout", self.peer);
                    let responses = [
                        Response::Bye { code: None, text: "Logging out".to_string() },
                        Response::ok(tag, "LOGOUT completed"),
                    ];
                    write_responses(writer, &responses).await?;
                    return Ok(Serve::Close);
                }
                ImapCommand::StartTls => {
                    if self.secure || self.ctx.tls.is_none() {
                        let response = Response::no(tag, "STARTTLS not available");
                        write_responses(writer, &[response]).await?;
                        continue;
                    }
                    let response = Response::ok(tag, "Begin TLS negotiation now");
                    write_responses(writer, &[response]).await?;
                    return Ok(Serve::Upgrade(Upgrade::Tls));
                }
                ImapCommand::Compress { algorithm } => {
                    if algorithm != "DEFLATE" {
                        let response = Response::bad(
                            tag,
                            format!("Unknown compression algorithm {}", algorithm),
                        );
                        write_responses(writer, &[response]).await?;
                        continue;
                    }
                    if self.compressed {
                        let response = Response::no_code(
                            tag,
                            ResponseCode::CompressionActive,
                            "DEFLATE already active",
                        );
                        write_responses(writer, &[response]).await?;
                        continue;
                    }
                    // The OK goes out uncompressed; both directions wrap
                    // before the next byte in either direction.
                    let response = Response::ok(tag, "DEFLATE active");
                    write_responses(writer, &[response]).await?;
                    return Ok(Serve::Upgrade(Upgrade::Deflate));
                }
                ImapCommand::Authenticate { mechanism, initial_response } => {
                    self.handle_authenticate(tag, &mechanism, initial_response, reader, writer)
                        .await?;
                }
                ImapCommand::Idle => {
                    match self.handle_idle(tag, reader, writer, &mut shutdown).await? {
                        IdleOutcome::Continue => {}
                        IdleOutcome::Close => return Ok(Serve::Close),
                    }
                }
                other => {
                    let output = self.dispatch(tag, other).await;
                    let mut responses = output.untagged;
                    if output.flush {
                        if let Err(reason) = self.flush_updates(&mut responses).await {
                            responses.push(Response::Bye { code: None, text: reason });
                            write_responses(writer, &responses).await?;
                            return Ok(Serve::Close);
                        }
                    }
                    responses.push(output.tagged);
                    write_responses(writer, &responses).await?;
                }
            }

            if *shutdown.borrow() {
                let bye = Response::Bye { code: None, text: "Server shutting down".to_string() };
                write_responses(writer, &[bye]).await?;
                return Ok(Serve::Close);
            }
        }
    }

    /// Absorb and emit queued updates from the selected view.
    async fn flush_updates(&mut self, responses: &mut Vec<Response>) -> Result<(), String> {
        let (Some(view), Some(session)) = (self.selected.as_mut(), self.session.as_deref()) else {
            return Ok(());
        };
        match view.pump(session).await {
            Ok(()) => {
                view.flush(responses);
                Ok(())
            }
            Err(err) => Err(format!("Update stream failed: {}", err)),
        }
    }

    async fn read_command<R, W>(
        &mut self,
        reader: &mut BufReader<R>,
        writer: &mut BufWriter<W>,
        decoder: &mut CommandDecoder,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ReadOutcome>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line: Vec<u8> = Vec::new();
        loop {
            line.clear();
            let n = tokio::select! {
                result = tokio::time::timeout(
                    self.ctx.params.command_timeout,
                    reader.read_until(b'\n', &mut line),
                ) => match result {
                    Ok(read) => read?,
                    Err(_) => return Ok(ReadOutcome::Bye("Autologout; connection idle too long")),
                },
                _ = shutdown.changed() => return Ok(ReadOutcome::Bye("Server shutting down")),
            };
            if n == 0 {
                return Ok(ReadOutcome::Closed);
            }
            let trimmed = trim_crlf(&line);

            match decoder.feed_line(trimmed) {
                FrameResult::Complete => return Ok(ReadOutcome::Command(decoder.take())),
                FrameResult::NeedLiteral { count, sync } => {
                    if sync {
                        // The continuation goes out only when we are
                        // ready to consume the payload.
                        write_responses(
                            writer,
                            &[Response::Continuation("Ready for literal data".to_string())],
                        )
                        .await?;
                    }
                    let mut payload = vec![0u8; count];
                    match tokio::time::timeout(
                        self.ctx.params.command_timeout,
                        reader.read_exact(&mut payload),
                    )
                    .await
                    {
                        Ok(read) => {
                            read?;
                        }
                        Err(_) => {
                            return Ok(ReadOutcome::Bye("Autologout; connection idle too long"))
                        }
                    }
                    decoder.feed_literal(&payload);
                }
                FrameResult::TooLarge { count, sync } => {
                    let buf = decoder.take();
                    let tag = tag_of(&buf);
                    warn!("{} rejected literal of {} bytes", self.peer, count);
                    let response = Response::bad(tag, "Literal size exceeds server limit");
                    write_responses(writer, &[response]).await?;
                    if !sync {
                        // Non-synchronizing: the payload is already in
                        // flight, so byte framing is lost.
                        return Ok(ReadOutcome::Bye("Cannot recover command framing"));
                    }
                }
            }
        }
    }

    async fn handle_authenticate<R, W>(
        &mut self,
        tag: String,
        mechanism: &str,
        initial_response: Option<String>,
        reader: &mut BufReader<R>,
        writer: &mut BufWriter<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let Some(mechanism) = Mechanism::from_name(mechanism) else {
            let response = Response::no(tag, "Unsupported authentication mechanism");
            write_responses(writer, &[response]).await?;
            return Ok(());
        };

        if !self.login_allowed() {
            let response = Response::no(tag, "Authentication requires TLS; use STARTTLS first");
            write_responses(writer, &[response]).await?;
            return Ok(());
        }

        // SASL-IR shortcuts the first continuation round-trip.
        let response_line = match initial_response {
            Some(ir) => ir,
            None => {
                write_responses(writer, &[Response::Continuation(auth::encode_challenge(b""))])
                    .await?;
                let mut line = Vec::new();
                let n = tokio::time::timeout(
                    self.ctx.params.command_timeout,
                    reader.read_until(b'\n', &mut line),
                )
                .await
                .map_err(|_| anyhow::anyhow!("authentication timed out"))??;
                if n == 0 {
                    return Err(anyhow::anyhow!("connection closed during authentication"));
                }
                String::from_utf8_lossy(trim_crlf(&line)).to_string()
            }
        };

        let data = match auth::decode_response(&response_line) {
            SaslResponse::Aborted => {
                let response = Response::bad(tag, "AUTHENTICATE aborted by client");
                write_responses(writer, &[response]).await?;
                return Ok(());
            }
            SaslResponse::Invalid => {
                let response = Response::bad(tag, "Invalid base64 in authentication response");
                write_responses(writer, &[response]).await?;
                return Ok(());
            }
            SaslResponse::Data(data) => data,
        };

        let login = match mechanism {
            Mechanism::Plain => match auth::decode_plain(&data) {
                Some(creds) => {
                    self.ctx.store.login(&creds.authcid, &creds.password, self.session_id).await
                }
                None => {
                    let response = Response::bad(tag, "Malformed PLAIN response");
                    write_responses(writer, &[response]).await?;
                    return Ok(());
                }
            },
            Mechanism::External => {
                let identity = String::from_utf8_lossy(&data).to_string();
                self.ctx.store.login_external(&identity, self.session_id).await
            }
        };

        let response = self.finish_login(tag, login);
        write_responses(writer, &[response]).await?;
        Ok(())
    }

    fn finish_login(
        &mut self,
        tag: String,
        login: Result<Box<dyn MailboxSession>, StoreError>,
    ) -> Response {
        match login {
            Ok(session) => {
                self.session = Some(session);
                self.state = ImapState::Authenticated;
                info!("{} authenticated", self.peer);
                Response::ok_code(
                    tag,
                    ResponseCode::Capability(self.capabilities()),
                    "Authentication successful",
                )
            }
            Err(StoreError::InvalidCredentials) => {
                info!("{} authentication failed", self.peer);
                Response::no_code(tag, ResponseCode::AuthenticationFailed, "Invalid credentials")
            }
            Err(err) => map_store_error(tag, err, false),
        }
    }

    async fn handle_idle<R, W>(
        &mut self,
        tag: String,
        reader: &mut BufReader<R>,
        writer: &mut BufWriter<W>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<IdleOutcome>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        write_responses(writer, &[Response::Continuation("idling".to_string())]).await?;

        // Deliver anything queued before going to sleep.
        let mut responses = Vec::new();
        if let Err(reason) = self.flush_updates(&mut responses).await {
            responses.push(Response::Bye { code: None, text: reason });
            write_responses(writer, &responses).await?;
            return Ok(IdleOutcome::Close);
        }
        write_responses(writer, &responses).await?;

        let idle_timeout = self.ctx.params.idle_timeout;
        let view = self.selected.as_mut().expect("IDLE is Selected-only");
        let session = self.session.as_deref().expect("IDLE is Selected-only");

        let mut line: Vec<u8> = Vec::new();
        loop {
            tokio::select! {
                result = reader.read_until(b'\n', &mut line) => {
                    let n = result?;
                    if n == 0 {
                        return Ok(IdleOutcome::Close);
                    }
                    let done = trim_crlf(&line).eq_ignore_ascii_case(b"DONE");
                    line.clear();
                    let response = if done {
                        Response::ok(tag, "IDLE terminated")
                    } else {
                        Response::bad(tag, "Expected DONE to end IDLE")
                    };
                    write_responses(writer, &[response]).await?;
                    return Ok(IdleOutcome::Continue);
                }
                result = view.wait_and_pump(session) => {
                    match result {
                        Ok(_) => {
                            let mut responses = Vec::new();
                            view.flush(&mut responses);
                            write_responses(writer, &responses).await?;
                        }
                        Err(err) => {
                            let bye = Response::Bye {
                                code: None,
                                text: format!("Update stream failed: {}", err),
                            };
                            write_responses(writer, &[bye]).await?;
                            return Ok(IdleOutcome::Close);
                        }
                    }
                }
                _ = tokio::time::sleep(idle_timeout) => {
                    let bye = Response::Bye { code: None, text: "Autologout".to_string() };
                    write_responses(writer, &[bye]).await?;
                    return Ok(IdleOutcome::Close);
                }
                _ = shutdown.changed() => {
                    let bye = Response::Bye {
                        code: None,
                        text: "Server shutting down".to_string(),
                    };
                    write_responses(writer, &[bye]).await?;
                    return Ok(IdleOutcome::Close);
                }
            }
        }
    }

    async fn dispatch(&mut self, tag: String, command: ImapCommand) -> CommandOutput {
        match command {
            ImapCommand::Capability => CommandOutput::with_untagged(
                vec![Response::Capability(self.capabilities())],
                Response::ok(tag, "CAPABILITY completed"),
            ),
            ImapCommand::Noop => CommandOutput::tagged(Response::ok(tag, "NOOP completed")),
            ImapCommand::Check => CommandOutput::tagged(Response::ok(tag, "CHECK completed")),
            ImapCommand::Id { params } => self.handle_id(tag, params),
            ImapCommand::Enable { capabilities } => {
                // Nothing is enable-gated today; report the empty subset.
                debug!("{} ENABLE requested for {:?}", self.peer, capabilities);
                CommandOutput::with_untagged(
                    vec![Response::Enabled(Vec::new())],
                    Response::ok(tag, "ENABLE completed"),
                )
            }
            ImapCommand::Namespace => CommandOutput::with_untagged(
                vec![Response::Namespace {
                    delimiter: self.session.as_deref().map(|s| s.delimiter()).unwrap_or('/'),
                }],
                Response::ok(tag, "NAMESPACE completed"),
            ),
            ImapCommand::Login { username, password } => {
                self.handle_login(tag, username, password).await
            }
            ImapCommand::Select { mailbox } => self.handle_select(tag, mailbox, false).await,
            ImapCommand::Examine { mailbox } => self.handle_select(tag, mailbox, true).await,
            ImapCommand::Create { mailbox } => self.handle_create(tag, mailbox).await,
            ImapCommand::Delete { mailbox } => self.handle_delete(tag, mailbox).await,
            ImapCommand::Rename { from, to } => self.handle_rename(tag, from, to).await,
            ImapCommand::Subscribe { mailbox } => self.handle_subscribe(tag, mailbox, true).await,
            ImapCommand::Unsubscribe { mailbox } => {
                self.handle_subscribe(tag, mailbox, false).await
            }
            ImapCommand::List { reference, pattern } => {
                self.handle_list(tag, reference, pattern, false).await
            }
            ImapCommand::Lsub { reference, pattern } => {
                self.handle_list(tag, reference, pattern, true).await
            }
            ImapCommand::Status { mailbox, items } => self.handle_status(tag, mailbox, items).await,
            ImapCommand::Append { mailbox, flags, date_time, message, literal8 } => {
                self.handle_append(tag, mailbox, flags, date_time, message, literal8).await
            }
            ImapCommand::Close => self.handle_close(tag).await,
            ImapCommand::Unselect => {
                self.selected = None;
                self.state = ImapState::Authenticated;
                CommandOutput::tagged(Response::ok(tag, "UNSELECT completed"))
            }
            ImapCommand::Expunge => self.handle_expunge(tag, None).await,
            ImapCommand::Search { charset, criteria } => {
                self.handle_search(tag, charset, criteria, false).await
            }
            ImapCommand::Fetch { sequence_set, items } => {
                self.handle_fetch(tag, sequence_set, items, false).await
            }
            ImapCommand::Store { sequence_set, mode, silent, flags } => {
                self.handle_store(tag, sequence_set, mode, silent, flags, false).await
            }
            ImapCommand::Copy { sequence_set, mailbox } => {
                self.handle_copy(tag, sequence_set, mailbox, false, false).await
            }
            ImapCommand::Move { sequence_set, mailbox } => {
                self.handle_copy(tag, sequence_set, mailbox, false, true).await
            }
            ImapCommand::Uid { command } => match *command {
                UidCommand::Fetch { sequence_set, items } => {
                    self.handle_fetch(tag, sequence_set, items, true).await
                }
                UidCommand::Search { charset, criteria } => {
                    self.handle_search(tag, charset, criteria, true).await
                }
                UidCommand::Store { sequence_set, mode, silent, flags } => {
                    self.handle_store(tag, sequence_set, mode, silent, flags, true).await
                }
                UidCommand::Copy { sequence_set, mailbox } => {
                    self.handle_copy(tag, sequence_set, mailbox, true, false).await
                }
                UidCommand::Move { sequence_set, mailbox } => {
                    self.handle_copy(tag, sequence_set, mailbox, true, true).await
                }
                UidCommand::Expunge { sequence_set } => {
                    self.handle_expunge(tag, Some(sequence_set)).await
                }
            },
            ImapCommand::Unknown { command } => {
                CommandOutput::tagged(Response::bad(tag, format!("Unknown command {}", command)))
            }
            // Handled before dispatch.
            ImapCommand::Logout
            | ImapCommand::StartTls
            | ImapCommand::Authenticate { .. }
            | ImapCommand::Idle
            | ImapCommand::Compress { .. } => {
                CommandOutput::tagged(Response::bad(tag, "Command not dispatchable"))
            }
        }
    }

    fn login_allowed(&self) -> bool {
        self.secure || self.localhost
    }

    fn capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = [
            "IMAP4rev1",
            "LITERAL+",
            "SASL-IR",
            "ID",
            "ENABLE",
            "IDLE",
            "UIDPLUS",
            "MOVE",
            "NAMESPACE",
            "UNSELECT",
            "CHILDREN",
            "BINARY",
            "COMPRESS=DEFLATE",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if self.state == ImapState::NotAuthenticated {
            if !self.secure && self.ctx.tls.is_some() {
                caps.push("STARTTLS".to_string());
            }
            if self.login_allowed() {
                caps.push("AUTH=PLAIN".to_string());
                if self.secure {
                    caps.push("AUTH=EXTERNAL".to_string());
                }
            } else {
                caps.push("LOGINDISABLED".to_string());
            }
        }
        caps
    }

    async fn handle_login(
        &mut self,
        tag: String,
        username: String,
        password: String,
    ) -> CommandOutput {
        if !self.login_allowed() {
            return CommandOutput::tagged(Response::no(tag, "LOGIN is disabled until STARTTLS"));
        }
        let login = self.ctx.store.login(&username, &password, self.session_id).await;
        CommandOutput::tagged(self.finish_login(tag, login))
    }

    async fn handle_select(
        &mut self,
        tag: String,
        mailbox: String,
        read_only: bool,
    ) -> CommandOutput {
        // Re-selecting first releases the current view, with no implicit
        // expunge.
        self.selected = None;
        self.state = ImapState::Authenticated;
        let session = self.session.as_deref().expect("state checked");

        let info = match session.select(&mailbox, read_only).await {
            Ok(info) => info,
            Err(err) => return CommandOutput::tagged(map_store_error(tag, err, false)),
        };

        let flags = info.flags.clone();
        let permanent_flags = info.permanent_flags.clone();
        let allow_keywords = info.allow_new_keywords;
        let uid_next = info.uid_next;
        let uid_validity = info.uid_validity;
        let first_unseen = info.first_unseen_uid;
        let verb = if read_only { "EXAMINE" } else { "SELECT" };

        let view = SelectedView::new(info, self.session_id);
        let mut untagged = vec![
            Response::Flags(flags),
            Response::Exists(view.exists()),
            Response::Recent(view.recent_count()),
        ];
        if let Some(seq) = first_unseen.and_then(|uid| view.seq_of(uid)) {
            untagged.push(Response::untagged_ok(
                Some(ResponseCode::Unseen(seq)),
                "First unseen message",
            ));
        }
        untagged.push(Response::untagged_ok(
            Some(ResponseCode::PermanentFlags { flags: permanent_flags, allow_keywords }),
            "Flags permitted",
        ));
        untagged.push(Response::untagged_ok(
            Some(ResponseCode::UidNext(uid_next)),
            "Predicted next UID",
        ));
        untagged
            .push(Response::untagged_ok(Some(ResponseCode::UidValidity(uid_validity)), "UIDs valid"));

        let code = if read_only { ResponseCode::ReadOnly } else { ResponseCode::ReadWrite };
        self.selected = Some(view);
        self.state = ImapState::Selected;
        CommandOutput::with_untagged(
            untagged,
            Response::ok_code(tag, code, format!("{} completed", verb)),
        )
    }

    async fn handle_create(&mut self, tag: String, mailbox: String) -> CommandOutput {
        if mailbox == "INBOX" {
            return CommandOutput::tagged(Response::no(tag, "Cannot create INBOX"));
        }
        let session = self.session.as_deref().expect("state checked");
        match session.create(&mailbox).await {
            Ok(()) => CommandOutput::tagged(Response::ok(tag, "CREATE completed")),
            Err(err) => CommandOutput::tagged(map_store_error(tag, err, false)),
        }
    }

    async fn handle_delete(&mut self, tag: String, mailbox: String) -> CommandOutput {
        if mailbox == "INBOX" {
            return CommandOutput::tagged(Response::no(tag, "Cannot delete INBOX"));
        }
        let session = self.session.as_deref().expect("state checked");
        match session.delete(&mailbox).await {
            Ok(()) => CommandOutput::tagged(Response::ok(tag, "DELETE completed")),
            Err(err) => CommandOutput::tagged(map_store_error(tag, err, false)),
        }
    }

    async fn handle_rename(&mut self, tag: String, from: String, to: String) -> CommandOutput {
        if to == "INBOX" {
            return CommandOutput::tagged(Response::no(tag, "Cannot rename to INBOX"));
        }
        let session = self.session.as_deref().expect("state checked");
        match session.rename(&from, &to).await {
            Ok(()) => CommandOutput::tagged(Response::ok(tag, "RENAME completed")),
            Err(err) => CommandOutput::tagged(map_store_error(tag, err, false)),
        }
    }

    async fn handle_subscribe(
        &mut self,
        tag: String,
        mailbox: String,
        subscribed: bool,
    ) -> CommandOutput {
        let session = self.session.as_deref().expect("state checked");
        let verb = if subscribed { "SUBSCRIBE" } else { "UNSUBSCRIBE" };
        match session.subscribe(&mailbox, subscribed).await {
            Ok(()) => CommandOutput::tagged(Response::ok(tag, format!("{} completed", verb))),
            Err(err) => CommandOutput::tagged(map_store_error(tag, err, false)),
        }
    }

    async fn handle_list(
        &mut self,
        tag: String,
        reference: String,
        pattern: String,
        lsub: bool,
    ) -> CommandOutput {
        let session = self.session.as_deref().expect("state checked");
        let verb = if lsub { "LSUB" } else { "LIST" };
        match session.list(&reference, &pattern, lsub).await {
            Ok(rows) => {
                let untagged = rows
                    .into_iter()
                    .map(|row| Response::List {
                        lsub,
                        attrs: row.attrs,
                        delimiter: row.delimiter,
                        mailbox: row.name,
                    })
                    .collect();
                CommandOutput::with_untagged(untagged, Response::ok(tag, format!("{} completed", verb)))
            }
            Err(err) => CommandOutput::tagged(map_store_error(tag, err, false)),
        }
    }

    async fn handle_status(
        &mut self,
        tag: String,
        mailbox: String,
        items: Vec<StatusItem>,
    ) -> CommandOutput {
        let session = self.session.as_deref().expect("state checked");
        match session.status(&mailbox).await {
            Ok(status) => {
                let values = items
                    .iter()
                    .map(|item| {
                        let value = match item {
                            StatusItem::Messages => status.messages,
                            StatusItem::Recent => status.recent,
                            StatusItem::UidNext => status.uid_next,
                            StatusItem::UidValidity => status.uid_validity,
                            StatusItem::Unseen => status.unseen,
                        };
                        (*item, value)
                    })
                    .collect();
                CommandOutput::with_untagged(
                    vec![Response::StatusRow { mailbox, items: values }],
                    Response::ok(tag, "STATUS completed"),
                )
            }
            Err(err) => CommandOutput::tagged(map_store_error(tag, err, false)),
        }
    }

    async fn handle_append(
        &mut self,
        tag: String,
        mailbox: String,
        flags: Vec<Flag>,
        date_time: Option<chrono::DateTime<chrono::FixedOffset>>,
        message: Vec<u8>,
        literal8: bool,
    ) -> CommandOutput {
        if message.is_empty() {
            return CommandOutput::tagged(Response::bad(tag, "Message has no content"));
        }
        // Strict rejection of binary content outside literal8 framing.
        if !literal8 && message.contains(&0) {
            return CommandOutput::tagged(Response::bad(tag, "Binary content requires a literal8"));
        }

        let destination = match self.ctx.filter.apply(&mailbox, &message, &flags) {
            FilterVerdict::Accept => mailbox,
            FilterVerdict::Redirect(target) => {
                debug!("{} deliver filter redirected append to {}", self.peer, target);
                target
            }
            FilterVerdict::Discard => {
                debug!("{} deliver filter discarded append", self.peer);
                return CommandOutput::tagged(Response::ok(tag, "APPEND completed"));
            }
        };

        let session = self.session.as_deref().expect("state checked");
        match session.append(&destination, &flags, date_time, message).await {
            Ok(result) => CommandOutput::tagged(Response::ok_code(
                tag,
                ResponseCode::AppendUid { uid_validity: result.uid_validity, uid: result.uid },
                "APPEND completed",
            )),
            Err(err) => CommandOutput::tagged(map_store_error(tag, err, true)),
        }
    }

    async fn handle_close(&mut self, tag: String) -> CommandOutput {
        let view = self.selected.take().expect("state checked");
        self.state = ImapState::Authenticated;
        if !view.read_only {
            let session = self.session.as_deref().expect("state checked");
            // CLOSE expunges silently; failures do not block the close.
            if let Err(err) = session.expunge(view.mailbox_id, None).await {
                warn!("{} expunge-on-close failed: {}", self.peer, err);
            }
        }
        CommandOutput::tagged(Response::ok(tag, "CLOSE completed"))
    }

    async fn handle_expunge(&mut self, tag: String, uid_set: Option<SequenceSet>) -> CommandOutput {
        let view = self.selected.as_mut().expect("state checked");
        let session = self.session.as_deref().expect("state checked");
        if view.read_only {
            return CommandOutput::tagged(Response::no_code(
                tag,
                ResponseCode::ReadOnly,
                "Mailbox is read-only",
            ));
        }
        let restrict = uid_set.map(|set| view.resolve(&set, true));
        match session.expunge(view.mailbox_id, restrict.as_deref()).await {
            Ok(expunged) => {
                let mut untagged = Vec::new();
                view.expunge_now(&expunged, &mut untagged);
                CommandOutput::with_untagged(untagged, Response::ok(tag, "EXPUNGE completed"))
            }
            Err(err) => CommandOutput::tagged(map_store_error(tag, err, false)),
        }
    }

    async fn handle_fetch(
        &mut self,
        tag: String,
        sequence_set: SequenceSet,
        items: Vec<FetchItem>,
        uid_mode: bool,
    ) -> CommandOutput {
        let view = self.selected.as_mut().expect("state checked");
        let session = self.session.as_deref().expect("state checked");

        let uids = view.resolve(&sequence_set, uid_mode);
        let rows = match session.fetch(view.mailbox_id, &uids).await {
            Ok(rows) => rows,
            Err(err) => return CommandOutput::frozen(Vec::new(), map_store_error(tag, err, false)),
        };

        // Non-peek body fetches set \Seen implicitly.
        let mut updated: HashMap<u32, Vec<Flag>> = HashMap::new();
        if !view.read_only && items.iter().any(FetchItem::sets_seen) {
            let need: Vec<u32> = rows
                .iter()
                .filter(|row| !row.flags.contains(&Flag::Seen))
                .map(|row| row.uid)
                .collect();
            if !need.is_empty() {
                match session.store(view.mailbox_id, &need, StoreMode::Add, &[Flag::Seen]).await {
                    Ok(results) => updated.extend(results),
                    Err(err) => {
                        return CommandOutput::frozen(Vec::new(), map_store_error(tag, err, false))
                    }
                }
            }
        }

        let mut untagged = Vec::new();
        for row in rows {
            let Some(seq) = view.seq_of(row.uid) else {
                continue;
            };
            let stored = updated.get(&row.uid).unwrap_or(&row.flags);
            let flags = view.flags_for(row.uid, stored);
            untagged.push(Response::Fetch {
                seq,
                items: build_fetch_items(&items, &row, flags, uid_mode),
            });
        }

        let verb = if uid_mode { "UID FETCH" } else { "FETCH" };
        let tagged = Response::ok(tag, format!("{} completed", verb));
        if uid_mode {
            CommandOutput::with_untagged(untagged, tagged)
        } else {
            CommandOutput::frozen(untagged, tagged)
        }
    }

    async fn handle_store(
        &mut self,
        tag: String,
        sequence_set: SequenceSet,
        mode: StoreMode,
        silent: bool,
        flags: Vec<Flag>,
        uid_mode: bool,
    ) -> CommandOutput {
        let view = self.selected.as_mut().expect("state checked");
        let session = self.session.as_deref().expect("state checked");
        let verb = if uid_mode { "UID STORE" } else { "STORE" };

        if view.read_only {
            return CommandOutput::frozen(
                Vec::new(),
                Response::no_code(tag, ResponseCode::ReadOnly, "Mailbox is read-only"),
            );
        }

        let uids = view.resolve(&sequence_set, uid_mode);
        match session.store(view.mailbox_id, &uids, mode, &flags).await {
            Ok(results) => {
                let mut untagged = Vec::new();
                if !silent {
                    for (uid, new_flags) in results {
                        let Some(seq) = view.seq_of(uid) else { continue };
                        let mut items = vec![FetchData::Flags(view.flags_for(uid, &new_flags))];
                        if uid_mode {
                            items.push(FetchData::Uid(uid));
                        }
                        untagged.push(Response::Fetch { seq, items });
                    }
                }
                let tagged = Response::ok(tag, format!("{} completed", verb));
                if uid_mode {
                    CommandOutput::with_untagged(untagged, tagged)
                } else {
                    CommandOutput::frozen(untagged, tagged)
                }
            }
            Err(err) => CommandOutput::frozen(Vec::new(), map_store_error(tag, err, false)),
        }
    }

    async fn handle_search(
        &mut self,
        tag: String,
        charset: Option<String>,
        criteria: SearchKey,
        uid_mode: bool,
    ) -> CommandOutput {
        let view = self.selected.as_ref().expect("state checked");
        let session = self.session.as_deref().expect("state checked");
        let verb = if uid_mode { "UID SEARCH" } else { "SEARCH" };

        if let Some(charset) = &charset {
            if charset != "UTF-8" && charset != "US-ASCII" {
                return CommandOutput::frozen(
                    Vec::new(),
                    Response::no_code(
                        tag,
                        ResponseCode::BadCharset,
                        format!("Charset {} not supported", charset),
                    ),
                );
            }
        }

        let recent = view.recent_uids();
        let ctx = SearchContext { view_uids: view.uids(), recent_uids: &recent };
        match session.search(view.mailbox_id, &criteria, ctx).await {
            Ok(uids) => {
                let ids: Vec<u32> = if uid_mode {
                    uids
                } else {
                    uids.iter().filter_map(|&uid| view.seq_of(uid)).collect()
                };
                let tagged = Response::ok(tag, format!("{} completed", verb));
                let untagged = vec![Response::Search(ids)];
                if uid_mode {
                    CommandOutput::with_untagged(untagged, tagged)
                } else {
                    CommandOutput::frozen(untagged, tagged)
                }
            }
            Err(err) => CommandOutput::frozen(Vec::new(), map_store_error(tag, err, false)),
        }
    }

    async fn handle_copy(
        &mut self,
        tag: String,
        sequence_set: SequenceSet,
        destination: String,
        uid_mode: bool,
        is_move: bool,
    ) -> CommandOutput {
        let view = self.selected.as_mut().expect("state checked");
        let session = self.session.as_deref().expect("state checked");
        let verb = match (uid_mode, is_move) {
            (false, false) => "COPY",
            (false, true) => "MOVE",
            (true, false) => "UID COPY",
            (true, true) => "UID MOVE",
        };

        let uids = view.resolve(&sequence_set, uid_mode);
        if uids.is_empty() {
            return CommandOutput::tagged(Response::ok(tag, format!("{} completed", verb)));
        }

        let result = if is_move {
            session.move_messages(view.mailbox_id, &uids, &destination).await
        } else {
            session.copy(view.mailbox_id, &uids, &destination).await
        };

        match result {
            Ok(copied) => {
                let code = ResponseCode::CopyUid {
                    uid_validity: copied.uid_validity,
                    src: copied.src_uids.clone(),
                    dst: copied.dst_uids.clone(),
                };
                if is_move {
                    // RFC 6851: COPYUID rides an untagged OK, then the
                    // source expunges are echoed.
                    let mut untagged = vec![Response::untagged_ok(Some(code), "Moved")];
                    view.expunge_now(&copied.src_uids, &mut untagged);
                    CommandOutput::with_untagged(
                        untagged,
                        Response::ok(tag, format!("{} completed", verb)),
                    )
                } else {
                    CommandOutput::tagged(Response::ok_code(tag, code, format!("{} completed", verb)))
                }
            }
            Err(err) => CommandOutput::tagged(map_store_error(tag, err, true)),
        }
    }

    fn handle_id(
        &self,
        tag: String,
        params: Option<Vec<(String, Option<String>)>>,
    ) -> CommandOutput {
        if let Some(params) = &params {
            for (key, value) in params {
                debug!("{} client ID {}={}", self.peer, key, value.as_deref().unwrap_or("NIL"));
            }
        }
        CommandOutput::with_untagged(
            vec![Response::Id(Some(vec![
                ("name".to_string(), "ironmap".to_string()),
                ("version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ]))],
            Response::ok(tag, "ID completed"),
        )
    }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn tag_of(buf: &[u8]) -> String {
    let end = buf.iter().position(|&c| c == b' ').unwrap_or(buf.len());
    if end == 0 {
        "*".to_string()
    } else {
        String::from_utf8_lossy(&buf[..end]).to_string()
    }
}

fn map_store_error(tag: String, err: StoreError, trycreate: bool) -> Response {
    match err {
        StoreError::NotFound if trycreate => {
            Response::no_code(tag, ResponseCode::TryCreate, "Mailbox does not exist")
        }
        StoreError::NotFound => Response::no(tag, "Mailbox does not exist"),
        StoreError::AlreadyExists => Response::no(tag, "Mailbox already exists"),
        StoreError::ReadOnly => {
            Response::no_code(tag, ResponseCode::ReadOnly, "Mailbox is read-only")
        }
        StoreError::OverQuota => {
            Response::no_code(tag, ResponseCode::OverQuota, "Storage quota exceeded")
        }
        StoreError::BadName => Response::no(tag, "Invalid mailbox name"),
        StoreError::InvalidCredentials => {
            Response::no_code(tag, ResponseCode::AuthenticationFailed, "Invalid credentials")
        }
        StoreError::Closed => Response::no(tag, "Mailbox is no longer available"),
        StoreError::Transient(_) => {
            Response::no_code(tag, ResponseCode::ServerBug, "Temporary backend failure")
        }
    }
}

async fn write_responses<W>(writer: &mut BufWriter<W>, responses: &[Response]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    for response in responses {
        response.encode(&mut buf);
    }
    writer.write_all(&buf).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::storage::AcceptAll;
    use tokio::io::{duplex, DuplexStream};

    struct TestServer {
        store: Arc<MemoryStore>,
        shutdown: watch::Sender<bool>,
        next_id: u64,
    }

    impl TestServer {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new("demo", "demopass")),
                shutdown: watch::channel(false).0,
                next_id: 1,
            }
        }

        fn connect(&mut self) -> Client {
            self.connect_with_params(SessionParams::default())
        }

        fn connect_with_params(&mut self, params: SessionParams) -> Client {
            let (client_end, server_end) = duplex(256 * 1024);
            let ctx = ConnectionContext {
                store: self.store.clone(),
                filter: Arc::new(AcceptAll),
                params: Arc::new(params),
                tls: None,
                shutdown: self.shutdown.subscribe(),
            };
            let id = self.next_id;
            self.next_id += 1;
            let handler = ImapHandler::new(ctx, id, format!("test-{}", id), true);
            tokio::spawn(async move {
                let _ = handler.run(ImapStream::Duplex(server_end)).await;
            });
            Client::new(client_end)
        }
    }

    struct Client {
        reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Client {
        fn new(stream: DuplexStream) -> Self {
            let (read_half, write_half) = tokio::io::split(stream);
            Self { reader: BufReader::new(read_half), writer: write_half }
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\r\n").await.unwrap();
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
        }

        async fn line(&mut self) -> String {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await.unwrap();
            assert!(n > 0, "connection closed");
            line.trim_end_matches(['\r', '\n']).to_string()
        }

        /// Read lines through the tagged response for `tag`.
        async fn until_tagged(&mut self, tag: &str) -> Vec<String> {
            let mut lines = Vec::new();
            loop {
                let line = self.line().await;
                let done = line.starts_with(&format!("{} ", tag));
                lines.push(line);
                if done {
                    return lines;
                }
            }
        }

        async fn expect_closed(&mut self) {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await.unwrap();
            assert_eq!(n, 0, "expected EOF, got {:?}", line);
        }

        async fn login(&mut self) {
            self.send("a0 LOGIN demo demopass").await;
            let lines = self.until_tagged("a0").await;
            assert!(lines.last().unwrap().starts_with("a0 OK"), "{lines:?}");
        }

        async fn append(&mut self, tag: &str, mailbox: &str, flags: &str, body: &[u8]) {
            let flags = if flags.is_empty() { String::new() } else { format!("{} ", flags) };
            self.send(&format!("{} APPEND {} {}{{{}}}", tag, mailbox, flags, body.len())).await;
            let cont = self.line().await;
            assert!(cont.starts_with("+"), "{cont}");
            self.send_raw(body).await;
            self.send_raw(b"\r\n").await;
            let lines = self.until_tagged(tag).await;
            assert!(lines.last().unwrap().contains("OK"), "{lines:?}");
        }
    }

    const SIMPLE: &[u8] = b"Subject: m\r\n\r\nx";

    #[tokio::test]
    async fn test_greeting_includes_capabilities() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        let greeting = client.line().await;
        assert!(greeting.starts_with("* OK [CAPABILITY IMAP4rev1"), "{greeting}");
        assert!(greeting.contains("LITERAL+"));
        assert!(greeting.contains("IDLE"));
    }

    #[tokio::test]
    async fn test_login_and_select_empty_inbox() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;

        client.send("a1 LOGIN demo demopass").await;
        let lines = client.until_tagged("a1").await;
        assert!(lines.last().unwrap().starts_with("a1 OK"), "{lines:?}");

        client.send("a2 SELECT INBOX").await;
        let lines = client.until_tagged("a2").await;
        assert!(lines.contains(&"* 0 EXISTS".to_string()), "{lines:?}");
        assert!(lines.contains(&"* 0 RECENT".to_string()), "{lines:?}");
        assert!(lines.iter().any(|l| l.starts_with("* OK [UIDNEXT 1]")), "{lines:?}");
        assert!(lines.iter().any(|l| l.starts_with("* OK [UIDVALIDITY ")), "{lines:?}");
        assert!(
            lines.contains(&"* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)".to_string()),
            "{lines:?}"
        );
        assert!(
            lines.iter().any(|l| l.starts_with(
                "* OK [PERMANENTFLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft \\*)]"
            )),
            "{lines:?}"
        );
        assert!(
            lines.last().unwrap().starts_with("a2 OK [READ-WRITE] SELECT completed"),
            "{lines:?}"
        );
    }

    #[tokio::test]
    async fn test_login_failure() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.send("a1 LOGIN demo wrongpass").await;
        let lines = client.until_tagged("a1").await;
        assert!(lines.last().unwrap().starts_with("a1 NO [AUTHENTICATIONFAILED]"), "{lines:?}");
    }

    #[tokio::test]
    async fn test_wrong_state_commands() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;

        client.send("a1 SELECT INBOX").await;
        let lines = client.until_tagged("a1").await;
        assert!(lines.last().unwrap().contains("BAD Command not allowed"), "{lines:?}");

        client.login().await;
        client.send("a2 FETCH 1 (FLAGS)").await;
        let lines = client.until_tagged("a2").await;
        assert!(lines.last().unwrap().contains("BAD Command not allowed"), "{lines:?}");
    }

    #[tokio::test]
    async fn test_append_then_uid_fetch() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.login().await;

        // Synchronizing literal: wait for the continuation.
        client.send("a1 APPEND INBOX {11}").await;
        let cont = client.line().await;
        assert!(cont.starts_with("+ "), "{cont}");
        client.send_raw(b"Hello\r\n\r\nx!").await;
        client.send_raw(b"\r\n").await;
        let lines = client.until_tagged("a1").await;
        assert!(lines.last().unwrap().starts_with("a1 OK [APPENDUID "), "{lines:?}");
        assert!(lines.last().unwrap().contains(" 1] APPEND completed"), "{lines:?}");

        client.send("a2 SELECT INBOX").await;
        let lines = client.until_tagged("a2").await;
        assert!(lines.contains(&"* 1 EXISTS".to_string()), "{lines:?}");
        assert!(lines.contains(&"* 1 RECENT".to_string()), "{lines:?}");

        client.send("a3 UID FETCH 1 (FLAGS)").await;
        let lines = client.until_tagged("a3").await;
        assert!(lines.contains(&"* 1 FETCH (FLAGS (\\Recent) UID 1)".to_string()), "{lines:?}");
        assert!(lines.last().unwrap().starts_with("a3 OK"), "{lines:?}");
    }

    #[tokio::test]
    async fn test_literal_plus_login() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;

        // Non-synchronizing literals: no continuation round-trips.
        client.send_raw(b"a1 LOGIN {4+}\r\ndemo {8+}\r\ndemopass\r\n").await;
        let lines = client.until_tagged("a1").await;
        assert!(lines.last().unwrap().starts_with("a1 OK"), "{lines:?}");
    }

    #[tokio::test]
    async fn test_idle_sees_concurrent_expunge() {
        let mut server = TestServer::new();

        // Session A appends three messages and selects.
        let mut a = server.connect();
        a.line().await;
        a.login().await;
        for i in 0..3 {
            a.append(&format!("p{}", i), "INBOX", "", SIMPLE).await;
        }
        a.send("a1 SELECT INBOX").await;
        let lines = a.until_tagged("a1").await;
        assert!(lines.contains(&"* 3 EXISTS".to_string()), "{lines:?}");

        a.send("a2 IDLE").await;
        let cont = a.line().await;
        assert!(cont.starts_with("+"), "{cont}");

        // Session B deletes message 2 and expunges.
        let mut b = server.connect();
        b.line().await;
        b.login().await;
        b.send("b1 SELECT INBOX").await;
        b.until_tagged("b1").await;
        b.send("b2 UID STORE 2 +FLAGS.SILENT (\\Deleted)").await;
        b.until_tagged("b2").await;
        b.send("b3 EXPUNGE").await;
        let lines = b.until_tagged("b3").await;
        assert!(lines.contains(&"* 2 EXPUNGE".to_string()), "{lines:?}");

        // Session A, still idling, is pushed the expunge and new count.
        // A FETCH flags update for the \Deleted store may precede it.
        let mut line = a.line().await;
        while !line.ends_with("EXPUNGE") {
            assert!(line.starts_with("* "), "{line}");
            line = a.line().await;
        }
        assert_eq!(line, "* 2 EXPUNGE");
        assert_eq!(a.line().await, "* 2 EXISTS");

        a.send("DONE").await;
        let lines = a.until_tagged("a2").await;
        assert!(lines.last().unwrap().starts_with("a2 OK IDLE terminated"), "{lines:?}");
    }

    #[tokio::test]
    async fn test_sequence_set_edge_cases() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.login().await;

        // Create UIDs 1..9, then expunge down to {5, 7, 9}.
        for i in 0..9 {
            client.append(&format!("p{}", i), "INBOX", "", SIMPLE).await;
        }
        client.send("a1 SELECT INBOX").await;
        client.until_tagged("a1").await;
        client.send("a2 UID STORE 1:4,6,8 +FLAGS.SILENT (\\Deleted)").await;
        client.until_tagged("a2").await;
        client.send("a3 EXPUNGE").await;
        client.until_tagged("a3").await;

        // UID FETCH 1:6 returns only UID 5.
        client.send("a4 UID FETCH 1:6 (FLAGS)").await;
        let lines = client.until_tagged("a4").await;
        let fetches: Vec<_> =
            lines.iter().filter(|l| l.starts_with("* ") && l.contains("FETCH")).collect();
        assert_eq!(fetches.len(), 1, "{lines:?}");
        assert!(fetches[0].contains("UID 5"), "{lines:?}");

        // UID FETCH 8:* returns UID 9.
        client.send("a5 UID FETCH 8:* (FLAGS)").await;
        let lines = client.until_tagged("a5").await;
        let fetches: Vec<_> =
            lines.iter().filter(|l| l.starts_with("* ") && l.contains("FETCH")).collect();
        assert_eq!(fetches.len(), 1, "{lines:?}");
        assert!(fetches[0].contains("UID 9"), "{lines:?}");

        // FETCH 2:* returns seqs 2 and 3 (UIDs 7 and 9).
        client.send("a6 FETCH 2:* (UID)").await;
        let lines = client.until_tagged("a6").await;
        assert!(lines.contains(&"* 2 FETCH (UID 7)".to_string()), "{lines:?}");
        assert!(lines.contains(&"* 3 FETCH (UID 9)".to_string()), "{lines:?}");
    }

    #[tokio::test]
    async fn test_store_echo_and_silent() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.login().await;
        client.append("p0", "INBOX", "", SIMPLE).await;
        client.send("a1 SELECT INBOX").await;
        client.until_tagged("a1").await;

        client.send("a2 STORE 1 +FLAGS (\\Seen)").await;
        let lines = client.until_tagged("a2").await;
        assert!(
            lines.iter().any(|l| l.starts_with("* 1 FETCH (FLAGS (") && l.contains("\\Seen")),
            "{lines:?}"
        );

        client.send("a3 STORE 1 +FLAGS.SILENT (\\Flagged)").await;
        let lines = client.until_tagged("a3").await;
        assert_eq!(lines.len(), 1, "silent store must not echo: {lines:?}");
    }

    #[tokio::test]
    async fn test_uid_expunge_subset() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.login().await;
        for i in 0..3 {
            client.append(&format!("p{}", i), "INBOX", "(\\Deleted)", SIMPLE).await;
        }
        client.send("a1 SELECT INBOX").await;
        client.until_tagged("a1").await;

        client.send("a2 UID EXPUNGE 2").await;
        let lines = client.until_tagged("a2").await;
        assert!(lines.contains(&"* 2 EXPUNGE".to_string()), "{lines:?}");
        assert_eq!(lines.iter().filter(|l| l.ends_with("EXPUNGE")).count(), 1, "{lines:?}");
    }

    #[tokio::test]
    async fn test_search_and_status() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.login().await;
        client
            .append("p0", "INBOX", "", b"From: alice@example.org\r\nSubject: hi\r\n\r\nx")
            .await;

        client.send("s1 STATUS INBOX (MESSAGES UNSEEN UIDNEXT)").await;
        let lines = client.until_tagged("s1").await;
        assert!(
            lines.contains(&"* STATUS INBOX (MESSAGES 1 UNSEEN 1 UIDNEXT 2)".to_string()),
            "{lines:?}"
        );

        client.send("s2 SELECT INBOX").await;
        client.until_tagged("s2").await;
        client.send("s3 SEARCH FROM alice UNSEEN").await;
        let lines = client.until_tagged("s3").await;
        assert!(lines.contains(&"* SEARCH 1".to_string()), "{lines:?}");

        client.send("s4 SEARCH CHARSET KOI8-R ALL").await;
        let lines = client.until_tagged("s4").await;
        assert!(lines.last().unwrap().starts_with("s4 NO [BADCHARSET]"), "{lines:?}");
    }

    #[tokio::test]
    async fn test_authenticate_plain_sasl_ir() {
        use base64::engine::general_purpose::STANDARD as B64;
        use base64::Engine as _;

        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;

        let ir = B64.encode(b"\x00demo\x00demopass");
        client.send(&format!("a1 AUTHENTICATE PLAIN {}", ir)).await;
        let lines = client.until_tagged("a1").await;
        assert!(lines.last().unwrap().starts_with("a1 OK [CAPABILITY"), "{lines:?}");
    }

    #[tokio::test]
    async fn test_authenticate_abort() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;

        client.send("a1 AUTHENTICATE PLAIN").await;
        let cont = client.line().await;
        assert!(cont.starts_with("+"), "{cont}");
        client.send("*").await;
        let lines = client.until_tagged("a1").await;
        assert!(lines.last().unwrap().starts_with("a1 BAD"), "{lines:?}");
    }

    #[tokio::test]
    async fn test_compress_with_pipelined_data_closes() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.login().await;

        // Both commands in one write: the upgrade OK goes out, then the
        // pipelined bytes are treated as a protocol violation.
        client.send_raw(b"a1 COMPRESS DEFLATE\r\nb1 NOOP\r\n").await;
        let line = client.line().await;
        assert!(line.starts_with("a1 OK"), "{line}");
        client.expect_closed().await;
    }

    #[tokio::test]
    async fn test_starttls_unavailable_without_acceptor() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.send("a1 STARTTLS").await;
        let lines = client.until_tagged("a1").await;
        assert!(lines.last().unwrap().starts_with("a1 NO"), "{lines:?}");
    }

    #[tokio::test]
    async fn test_unknown_command_and_namespace() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.send("a1 FLURB").await;
        let lines = client.until_tagged("a1").await;
        assert!(lines.last().unwrap().starts_with("a1 BAD Unknown command"), "{lines:?}");

        client.login().await;
        client.send("a2 NAMESPACE").await;
        let lines = client.until_tagged("a2").await;
        assert!(lines.contains(&"* NAMESPACE ((\"\" \"/\")) NIL NIL".to_string()), "{lines:?}");
    }

    #[tokio::test]
    async fn test_logout_emits_bye() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.send("a1 LOGOUT").await;
        let bye = client.line().await;
        assert!(bye.starts_with("* BYE"), "{bye}");
        let tagged = client.line().await;
        assert!(tagged.starts_with("a1 OK"), "{tagged}");
        client.expect_closed().await;
    }

    #[tokio::test]
    async fn test_shutdown_sends_bye() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.login().await;

        server.shutdown.send(true).unwrap();
        let line = client.line().await;
        assert!(line.starts_with("* BYE"), "{line}");
        client.expect_closed().await;
    }

    #[tokio::test]
    async fn test_close_expunges_silently() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.login().await;
        client.append("p0", "INBOX", "(\\Deleted)", SIMPLE).await;

        client.send("a1 SELECT INBOX").await;
        client.until_tagged("a1").await;
        client.send("a2 CLOSE").await;
        let lines = client.until_tagged("a2").await;
        // No untagged EXPUNGE on CLOSE.
        assert_eq!(lines.len(), 1, "{lines:?}");

        client.send("a3 STATUS INBOX (MESSAGES)").await;
        let lines = client.until_tagged("a3").await;
        assert!(lines.contains(&"* STATUS INBOX (MESSAGES 0)".to_string()), "{lines:?}");
    }

    #[tokio::test]
    async fn test_move_reports_copyuid_and_expunge() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.login().await;
        client.append("p0", "INBOX", "", SIMPLE).await;
        client.send("c1 CREATE Archive").await;
        client.until_tagged("c1").await;

        client.send("a1 SELECT INBOX").await;
        client.until_tagged("a1").await;
        client.send("a2 MOVE 1 Archive").await;
        let lines = client.until_tagged("a2").await;
        assert!(lines.iter().any(|l| l.starts_with("* OK [COPYUID ")), "{lines:?}");
        assert!(lines.contains(&"* 1 EXPUNGE".to_string()), "{lines:?}");

        client.send("a3 MOVE 1 Elsewhere").await;
        let lines = client.until_tagged("a3").await;
        // Nothing left to move: resolution is empty, still OK.
        assert!(lines.last().unwrap().starts_with("a3 OK"), "{lines:?}");
    }

    #[tokio::test]
    async fn test_copy_to_missing_mailbox_trycreate() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.login().await;
        client.append("p0", "INBOX", "", SIMPLE).await;
        client.send("a1 SELECT INBOX").await;
        client.until_tagged("a1").await;

        client.send("a2 COPY 1 NoSuchBox").await;
        let lines = client.until_tagged("a2").await;
        assert!(lines.last().unwrap().starts_with("a2 NO [TRYCREATE]"), "{lines:?}");
    }

    #[tokio::test]
    async fn test_binary_append_rejected_without_literal8() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.login().await;

        client.send("a1 APPEND INBOX {4}").await;
        client.line().await;
        client.send_raw(&[b'a', 0x00, b'b', b'c']).await;
        client.send_raw(b"\r\n").await;
        let lines = client.until_tagged("a1").await;
        assert!(lines.last().unwrap().starts_with("a1 BAD"), "{lines:?}");

        client.send_raw(b"a2 APPEND INBOX ~{4+}\r\n").await;
        client.send_raw(&[b'a', 0x00, b'b', b'c']).await;
        client.send_raw(b"\r\n").await;
        let lines = client.until_tagged("a2").await;
        assert!(lines.last().unwrap().starts_with("a2 OK [APPENDUID"), "{lines:?}");
    }

    #[tokio::test]
    async fn test_oversized_sync_literal_recovers() {
        let mut server = TestServer::new();
        let mut client = server
            .connect_with_params(SessionParams { max_literal: 64, ..SessionParams::default() });
        client.line().await;
        client.login().await;

        client.send("a1 APPEND INBOX {5000}").await;
        let lines = client.until_tagged("a1").await;
        assert!(lines.last().unwrap().starts_with("a1 BAD Literal size"), "{lines:?}");

        // Session still usable afterwards.
        client.send("a2 NOOP").await;
        let lines = client.until_tagged("a2").await;
        assert!(lines.last().unwrap().starts_with("a2 OK"), "{lines:?}");
    }

    #[tokio::test]
    async fn test_examine_is_read_only() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.login().await;
        client.append("p0", "INBOX", "", SIMPLE).await;

        client.send("a1 EXAMINE INBOX").await;
        let lines = client.until_tagged("a1").await;
        assert!(lines.iter().any(|l| l.starts_with("* OK [PERMANENTFLAGS ()]")), "{lines:?}");
        assert!(lines.last().unwrap().starts_with("a1 OK [READ-ONLY]"), "{lines:?}");

        client.send("a2 STORE 1 +FLAGS (\\Seen)").await;
        let lines = client.until_tagged("a2").await;
        assert!(lines.last().unwrap().starts_with("a2 NO [READ-ONLY]"), "{lines:?}");

        client.send("a3 EXPUNGE").await;
        let lines = client.until_tagged("a3").await;
        assert!(lines.last().unwrap().starts_with("a3 NO [READ-ONLY]"), "{lines:?}");
    }

    #[tokio::test]
    async fn test_list_and_lsub() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.login().await;
        client.send("a1 CREATE Projects/rust").await;
        client.until_tagged("a1").await;
        client.send("a2 SUBSCRIBE Projects/rust").await;
        client.until_tagged("a2").await;

        client.send("a3 LIST \"\" *").await;
        let lines = client.until_tagged("a3").await;
        assert!(lines.iter().any(|l| l.contains("INBOX")), "{lines:?}");
        assert!(lines.iter().any(|l| l.contains("Projects/rust")), "{lines:?}");
        assert!(
            lines.iter().any(|l| l.contains("Projects") && l.contains("\\HasChildren")),
            "{lines:?}"
        );

        client.send("a4 LSUB \"\" *").await;
        let lines = client.until_tagged("a4").await;
        assert!(lines.iter().any(|l| l.starts_with("* LSUB") && l.contains("Projects/rust")), "{lines:?}");

        // Empty pattern returns the delimiter row only.
        client.send("a5 LIST \"\" \"\"").await;
        let lines = client.until_tagged("a5").await;
        assert!(
            lines.iter().any(|l| l.starts_with("* LIST (\\Noselect) \"/\"")),
            "{lines:?}"
        );
    }

    #[tokio::test]
    async fn test_mutf7_mailbox_round_trip() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.login().await;

        // "Entwürfe" arrives in its modified UTF-7 form and is listed
        // back the same way.
        client.send("a1 CREATE Entw&APw-rfe").await;
        let lines = client.until_tagged("a1").await;
        assert!(lines.last().unwrap().starts_with("a1 OK"), "{lines:?}");

        client.send("a2 LIST \"\" *").await;
        let lines = client.until_tagged("a2").await;
        assert!(lines.iter().any(|l| l.contains("Entw&APw-rfe")), "{lines:?}");

        client.send("a3 SELECT Entw&APw-rfe").await;
        let lines = client.until_tagged("a3").await;
        assert!(lines.last().unwrap().starts_with("a3 OK [READ-WRITE]"), "{lines:?}");
    }

    #[tokio::test]
    async fn test_fetch_body_and_envelope() {
        let mut server = TestServer::new();
        let mut client = server.connect();
        client.line().await;
        client.login().await;
        client
            .append(
                "p0",
                "INBOX",
                "",
                b"From: Alice <alice@example.org>\r\nSubject: Hello\r\nDate: Mon, 7 Feb 1994 21:52:25 -0800\r\n\r\nBody text\r\n",
            )
            .await;
        client.send("a1 SELECT INBOX").await;
        client.until_tagged("a1").await;

        client.send("a2 FETCH 1 (ENVELOPE RFC822.SIZE)").await;
        let lines = client.until_tagged("a2").await;
        let fetch = lines.iter().find(|l| l.contains("ENVELOPE")).unwrap();
        assert!(fetch.contains("\"Hello\""), "{fetch}");
        assert!(fetch.contains("RFC822.SIZE"), "{fetch}");

        // Body section arrives as a literal.
        client.send("a3 FETCH 1 BODY.PEEK[TEXT]").await;
        let header = client.line().await;
        assert!(header.contains("BODY[TEXT] {11}"), "{header}");
        let mut body = vec![0u8; 11];
        client.reader.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"Body text\r\n");
        client.until_tagged("a3").await;

        // The un-peeked fetch marked it \Seen.
        client.send("a4 FETCH 1 (FLAGS)").await;
        let lines = client.until_tagged("a4").await;
        assert!(!lines.iter().any(|l| l.contains("\\Seen") && l.contains("FETCH")), "{lines:?}");
        client.send("a5 FETCH 1 BODY[TEXT]").await;
        client.until_tagged("a5").await;
        client.send("a6 FETCH 1 (FLAGS)").await;
        let lines = client.until_tagged("a6").await;
        assert!(lines.iter().any(|l| l.contains("\\Seen")), "{lines:?}");
    }
}
