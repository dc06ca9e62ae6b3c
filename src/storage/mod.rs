pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::protocol::imap::codec::Flag;
use crate::protocol::imap::command::state::{SearchKey, StoreMode};

/// Typed backend failure. The connection handler maps each variant to
/// its IMAP response form.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mailbox does not exist")]
    NotFound,
    #[error("mailbox already exists")]
    AlreadyExists,
    #[error("mailbox is read-only")]
    ReadOnly,
    #[error("storage quota exceeded")]
    OverQuota,
    #[error("invalid mailbox name")]
    BadName,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("session closed")]
    Closed,
    #[error("transient backend failure: {0}")]
    Transient(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A change committed to a mailbox, broadcast to every subscribed
/// session in commit order. `origin` is the session id of the writer so
/// subscribers can skip changes they reported themselves.
#[derive(Debug, Clone)]
pub struct MailboxEvent {
    pub origin: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    Append { uid: u32 },
    Expunge { uid: u32 },
    FlagsChanged { uid: u32, flags: Vec<Flag> },
}

/// One LIST/LSUB result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRow {
    pub name: String,
    pub delimiter: Option<char>,
    pub attrs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInfo {
    pub messages: u32,
    pub recent: u32,
    pub uid_next: u32,
    pub uid_validity: u32,
    pub unseen: u32,
}

/// Everything SELECT/EXAMINE needs to build its untagged block and the
/// session's view, including the subscription to the change stream.
pub struct SelectInfo {
    pub mailbox_id: u64,
    pub name: String,
    pub read_only: bool,
    pub uid_validity: u32,
    pub uid_next: u32,
    pub flags: Vec<Flag>,
    pub permanent_flags: Vec<Flag>,
    pub allow_new_keywords: bool,
    /// UIDs currently in the mailbox, ascending.
    pub uids: Vec<u32>,
    /// UIDs whose `\Recent` this session claimed at select time.
    pub recent_uids: Vec<u32>,
    /// UID of the first message without `\Seen`, if any.
    pub first_unseen_uid: Option<u32>,
    pub events: broadcast::Receiver<MailboxEvent>,
}

/// Message snapshot returned by fetch: immutable content plus the
/// cached metadata the engine renders attributes from. `\Recent` is a
/// session affair and is merged in by the caller.
#[derive(Debug, Clone)]
pub struct FetchRow {
    pub uid: u32,
    pub flags: Vec<Flag>,
    pub internal_date: DateTime<FixedOffset>,
    pub body: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub uid_validity: u32,
    pub uid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResult {
    pub uid_validity: u32,
    pub src_uids: Vec<u32>,
    pub dst_uids: Vec<u32>,
}

/// Per-view context a search evaluation needs from the session: the
/// sequence ordering and which messages carry this session's `\Recent`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchContext<'a> {
    pub view_uids: &'a [u32],
    pub recent_uids: &'a [u32],
}

/// Entry point a backend exposes for establishing sessions.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify plain credentials and open a mailbox session. `origin` is
    /// the connection's session id, used to stamp change events.
    async fn login(
        &self,
        username: &str,
        password: &str,
        origin: u64,
    ) -> StoreResult<Box<dyn MailboxSession>>;

    /// Open a session for an externally-verified identity (AUTH
    /// EXTERNAL over a client-certificate or UNIX-socket peer).
    async fn login_external(
        &self,
        identity: &str,
        origin: u64,
    ) -> StoreResult<Box<dyn MailboxSession>>;
}

/// The operations the connection handler requires of any backend. Write
/// operations are serialized per mailbox by the backend; the engine
/// assumes linearizable semantics.
#[async_trait]
pub trait MailboxSession: Send + Sync {
    fn delimiter(&self) -> char;

    async fn list(
        &self,
        reference: &str,
        pattern: &str,
        subscribed_only: bool,
    ) -> StoreResult<Vec<ListRow>>;

    async fn status(&self, mailbox: &str) -> StoreResult<StatusInfo>;

    async fn create(&self, mailbox: &str) -> StoreResult<()>;

    async fn delete(&self, mailbox: &str) -> StoreResult<()>;

    async fn rename(&self, from: &str, to: &str) -> StoreResult<()>;

    async fn subscribe(&self, mailbox: &str, subscribed: bool) -> StoreResult<()>;

    async fn select(&self, mailbox: &str, read_only: bool) -> StoreResult<SelectInfo>;

    /// Snapshot the given UIDs. Missing (concurrently expunged) UIDs are
    /// silently skipped.
    async fn fetch(&self, mailbox_id: u64, uids: &[u32]) -> StoreResult<Vec<FetchRow>>;

    /// Update flags, returning `(uid, new_flags)` for each message that
    /// still exists.
    async fn store(
        &self,
        mailbox_id: u64,
        uids: &[u32],
        mode: StoreMode,
        flags: &[Flag],
    ) -> StoreResult<Vec<(u32, Vec<Flag>)>>;

    async fn copy(
        &self,
        mailbox_id: u64,
        uids: &[u32],
        destination: &str,
    ) -> StoreResult<CopyResult>;

    async fn move_messages(
        &self,
        mailbox_id: u64,
        uids: &[u32],
        destination: &str,
    ) -> StoreResult<CopyResult>;

    /// Expunge `\Deleted` messages, restricted to `uids` when given
    /// (UID EXPUNGE). Returns the expunged UIDs in ascending order.
    async fn expunge(&self, mailbox_id: u64, uids: Option<&[u32]>) -> StoreResult<Vec<u32>>;

    async fn append(
        &self,
        mailbox: &str,
        flags: &[Flag],
        internal_date: Option<DateTime<FixedOffset>>,
        body: Vec<u8>,
    ) -> StoreResult<AppendResult>;

    async fn search(
        &self,
        mailbox_id: u64,
        criteria: &SearchKey,
        ctx: SearchContext<'_>,
    ) -> StoreResult<Vec<u32>>;

    /// Claim the `\Recent` status of a newly-appended message for this
    /// session. Returns false if another session claimed it first.
    async fn claim_recent(&self, mailbox_id: u64, uid: u32) -> StoreResult<bool>;
}

/// Verdict of the deliver filter consulted before an APPEND commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    Accept,
    /// Deliver into a different mailbox than requested.
    Redirect(String),
    /// Drop the message while reporting success to the client.
    Discard,
}

/// Opaque hook applied to every appended or delivered message.
pub trait DeliverFilter: Send + Sync {
    fn apply(&self, mailbox: &str, body: &[u8], flags: &[Flag]) -> FilterVerdict;
}

/// Default filter: accept everything unchanged.
pub struct AcceptAll;

impl DeliverFilter for AcceptAll {
    fn apply(&self, _mailbox: &str, _body: &[u8], _flags: &[Flag]) -> FilterVerdict {
        FilterVerdict::Accept
    }
}
