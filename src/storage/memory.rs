use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use mail_parser::MessageParser;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;

use super::{
    AppendResult, Authenticator, CopyResult, EventKind, FetchRow, ListRow, MailboxEvent,
    MailboxSession, SearchContext, SelectInfo, StatusInfo, StoreError, StoreResult,
};
use crate::protocol::imap::codec::Flag;
use crate::protocol::imap::command::state::{SearchKey, StoreMode};
use crate::utils::generate_uidvalidity;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const DELIMITER: char = '/';

/// In-memory mailbox store. Accounts are materialized lazily at login
/// and shared between concurrent sessions for the lifetime of the
/// process; INBOX always exists.
pub struct MemoryStore {
    username: String,
    password: String,
    /// Message-count cap per mailbox; None means unlimited.
    quota: Option<u32>,
    accounts: RwLock<HashMap<String, Arc<Account>>>,
}

struct Account {
    mailboxes: Mutex<MailboxSet>,
}

struct MailboxSet {
    next_id: u64,
    last_uid_validity: u32,
    by_name: BTreeMap<String, Arc<Mailbox>>,
    subscriptions: BTreeSet<String>,
}

struct Mailbox {
    id: u64,
    state: Mutex<MailboxState>,
    events: broadcast::Sender<MailboxEvent>,
}

struct MailboxState {
    uid_validity: u32,
    uid_next: u32,
    /// Ascending by UID.
    messages: Vec<MessageData>,
    /// UIDs whose `\Recent` no session has claimed yet.
    unclaimed_recent: BTreeSet<u32>,
}

#[derive(Clone)]
struct MessageData {
    uid: u32,
    flags: BTreeSet<Flag>,
    internal_date: DateTime<FixedOffset>,
    body: Arc<Vec<u8>>,
}

impl MailboxState {
    fn position(&self, uid: u32) -> Option<usize> {
        self.messages.binary_search_by_key(&uid, |m| m.uid).ok()
    }
}

impl MailboxSet {
    fn fresh_uid_validity(&mut self) -> u32 {
        let v = generate_uidvalidity().max(self.last_uid_validity + 1);
        self.last_uid_validity = v;
        v
    }

    fn add_mailbox(&mut self, name: &str) -> Arc<Mailbox> {
        let uid_validity = self.fresh_uid_validity();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mailbox = Arc::new(Mailbox {
            id: self.next_id,
            state: Mutex::new(MailboxState {
                uid_validity,
                uid_next: 1,
                messages: Vec::new(),
                unclaimed_recent: BTreeSet::new(),
            }),
            events,
        });
        self.next_id += 1;
        self.by_name.insert(name.to_string(), mailbox.clone());
        mailbox
    }
}

impl MemoryStore {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            quota: None,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_quota(mut self, quota: Option<u32>) -> Self {
        self.quota = quota;
        self
    }

    async fn account(&self, user: &str) -> Arc<Account> {
        if let Some(account) = self.accounts.read().await.get(user) {
            return account.clone();
        }
        let mut accounts = self.accounts.write().await;
        accounts
            .entry(user.to_string())
            .or_insert_with(|| {
                debug!("materializing account for {}", user);
                let mut set = MailboxSet {
                    next_id: 1,
                    last_uid_validity: 0,
                    by_name: BTreeMap::new(),
                    subscriptions: BTreeSet::new(),
                };
                set.add_mailbox("INBOX");
                set.subscriptions.insert("INBOX".to_string());
                Arc::new(Account { mailboxes: Mutex::new(set) })
            })
            .clone()
    }

    fn open(&self, account: Arc<Account>, origin: u64) -> Box<dyn MailboxSession> {
        Box::new(MemorySession { account, origin, quota: self.quota })
    }
}

#[async_trait]
impl Authenticator for MemoryStore {
    async fn login(
        &self,
        username: &str,
        password: &str,
        origin: u64,
    ) -> StoreResult<Box<dyn MailboxSession>> {
        if username != self.username || password != self.password {
            return Err(StoreError::InvalidCredentials);
        }
        let account = self.account(username).await;
        Ok(self.open(account, origin))
    }

    async fn login_external(
        &self,
        identity: &str,
        origin: u64,
    ) -> StoreResult<Box<dyn MailboxSession>> {
        if identity != self.username {
            return Err(StoreError::InvalidCredentials);
        }
        let account = self.account(identity).await;
        Ok(self.open(account, origin))
    }
}

pub struct MemorySession {
    account: Arc<Account>,
    origin: u64,
    quota: Option<u32>,
}

impl MemorySession {
    async fn mailbox(&self, name: &str) -> StoreResult<Arc<Mailbox>> {
        let set = self.account.mailboxes.lock().await;
        set.by_name.get(name).cloned().ok_or(StoreError::NotFound)
    }

    async fn mailbox_by_id(&self, id: u64) -> StoreResult<Arc<Mailbox>> {
        let set = self.account.mailboxes.lock().await;
        set.by_name.values().find(|m| m.id == id).cloned().ok_or(StoreError::Closed)
    }

    fn emit(&self, mailbox: &Mailbox, kind: EventKind) {
        // Send only fails when no subscriber exists, which is fine.
        let _ = mailbox.events.send(MailboxEvent { origin: self.origin, kind });
    }
}

fn validate_name(name: &str) -> StoreResult<()> {
    if name.is_empty()
        || name.starts_with(DELIMITER)
        || name.ends_with(DELIMITER)
        || name.contains("//")
        || name.bytes().any(|c| c < 0x20)
    {
        return Err(StoreError::BadName);
    }
    Ok(())
}

/// Match a LIST pattern against a mailbox name: `*` matches anything,
/// `%` matches anything except the hierarchy delimiter.
fn pattern_matches(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match p.first() {
            None => n.is_empty(),
            Some(b'*') => {
                (0..=n.len()).any(|i| inner(&p[1..], &n[i..]))
            }
            Some(b'%') => {
                let limit = n
                    .iter()
                    .position(|&c| c == DELIMITER as u8)
                    .unwrap_or(n.len());
                (0..=limit).any(|i| inner(&p[1..], &n[i..]))
            }
            Some(&c) => {
                let matches_first = n
                    .first()
                    .is_some_and(|&nc| nc == c || nc.eq_ignore_ascii_case(&c) && c.is_ascii_alphabetic());
                matches_first && inner(&p[1..], &n[1..])
            }
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

/// All hierarchy nodes implied by the existing names: each mailbox plus
/// its ancestor path segments.
fn hierarchy_nodes(names: impl Iterator<Item = String>) -> BTreeSet<String> {
    let mut nodes = BTreeSet::new();
    for name in names {
        let mut prefix = String::new();
        for segment in name.split(DELIMITER) {
            if !prefix.is_empty() {
                prefix.push(DELIMITER);
            }
            prefix.push_str(segment);
            nodes.insert(prefix.clone());
        }
    }
    nodes
}

fn apply_store(flags: &mut BTreeSet<Flag>, mode: StoreMode, update: &[Flag]) {
    let update: BTreeSet<Flag> =
        update.iter().filter(|f| **f != Flag::Recent).cloned().collect();
    match mode {
        StoreMode::Replace => {
            *flags = update;
        }
        StoreMode::Add => {
            flags.extend(update);
        }
        StoreMode::Remove => {
            flags.retain(|f| !update.contains(f));
        }
    }
}

#[async_trait]
impl MailboxSession for MemorySession {
    fn delimiter(&self) -> char {
        DELIMITER
    }

    async fn list(
        &self,
        reference: &str,
        pattern: &str,
        subscribed_only: bool,
    ) -> StoreResult<Vec<ListRow>> {
        let set = self.account.mailboxes.lock().await;

        // An empty pattern asks for the hierarchy delimiter row only.
        if pattern.is_empty() {
            return Ok(vec![ListRow {
                name: String::new(),
                delimiter: Some(DELIMITER),
                attrs: vec!["\\Noselect".to_string()],
            }]);
        }

        let combined = format!("{}{}", reference, pattern);
        let selectable: BTreeSet<String> = if subscribed_only {
            set.subscriptions.iter().cloned().collect()
        } else {
            set.by_name.keys().cloned().collect()
        };
        let nodes = hierarchy_nodes(selectable.iter().cloned());

        let mut rows = Vec::new();
        for node in &nodes {
            if !pattern_matches(&combined, node) {
                continue;
            }
            let has_children = nodes
                .iter()
                .any(|other| other.starts_with(&format!("{}{}", node, DELIMITER)));
            let mut attrs = Vec::new();
            if !selectable.contains(node) {
                attrs.push("\\Noselect".to_string());
            }
            attrs.push(if has_children {
                "\\HasChildren".to_string()
            } else {
                "\\HasNoChildren".to_string()
            });
            rows.push(ListRow { name: node.clone(), delimiter: Some(DELIMITER), attrs });
        }
        Ok(rows)
    }

    async fn status(&self, mailbox: &str) -> StoreResult<StatusInfo> {
        let mailbox = self.mailbox(mailbox).await?;
        let state = mailbox.state.lock().await;
        let unseen =
            state.messages.iter().filter(|m| !m.flags.contains(&Flag::Seen)).count() as u32;
        Ok(StatusInfo {
            messages: state.messages.len() as u32,
            recent: state.unclaimed_recent.len() as u32,
            uid_next: state.uid_next,
            uid_validity: state.uid_validity,
            unseen,
        })
    }

    async fn create(&self, name: &str) -> StoreResult<()> {
        validate_name(name)?;
        let mut set = self.account.mailboxes.lock().await;
        if set.by_name.contains_key(name) {
            return Err(StoreError::AlreadyExists);
        }
        // Create intermediate hierarchy levels as real mailboxes too.
        let mut prefix = String::new();
        for segment in name.split(DELIMITER) {
            if !prefix.is_empty() {
                prefix.push(DELIMITER);
            }
            prefix.push_str(segment);
            if !set.by_name.contains_key(&prefix) {
                set.add_mailbox(&prefix);
            }
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        let mut set = self.account.mailboxes.lock().await;
        if set.by_name.remove(name).is_none() {
            return Err(StoreError::NotFound);
        }
        set.subscriptions.remove(name);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> StoreResult<()> {
        validate_name(to)?;
        let mut set = self.account.mailboxes.lock().await;
        if set.by_name.contains_key(to) {
            return Err(StoreError::AlreadyExists);
        }
        if !set.by_name.contains_key(from) {
            return Err(StoreError::NotFound);
        }
        if from == "INBOX" {
            // Renaming INBOX moves its messages and leaves it empty.
            let inbox = set.by_name.get("INBOX").cloned().unwrap();
            let target = set.add_mailbox(to);
            let mut inbox_state = inbox.state.lock().await;
            let mut target_state = target.state.lock().await;
            for message in inbox_state.messages.drain(..) {
                let uid = target_state.uid_next;
                target_state.uid_next += 1;
                target_state.messages.push(MessageData { uid, ..message });
            }
            inbox_state.unclaimed_recent.clear();
            return Ok(());
        }
        let mailbox = set.by_name.remove(from).unwrap();
        set.by_name.insert(to.to_string(), mailbox);
        if set.subscriptions.remove(from) {
            set.subscriptions.insert(to.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, name: &str, subscribed: bool) -> StoreResult<()> {
        let mut set = self.account.mailboxes.lock().await;
        if subscribed {
            if !set.by_name.contains_key(name) {
                return Err(StoreError::NotFound);
            }
            set.subscriptions.insert(name.to_string());
        } else {
            set.subscriptions.remove(name);
        }
        Ok(())
    }

    async fn select(&self, name: &str, read_only: bool) -> StoreResult<SelectInfo> {
        let mailbox = self.mailbox(name).await?;
        let mut state = mailbox.state.lock().await;

        let uids: Vec<u32> = state.messages.iter().map(|m| m.uid).collect();
        let recent_uids: Vec<u32> = if read_only {
            state.unclaimed_recent.iter().copied().collect()
        } else {
            // Claim \Recent for this session.
            std::mem::take(&mut state.unclaimed_recent).into_iter().collect()
        };
        let first_unseen_uid = state
            .messages
            .iter()
            .find(|m| !m.flags.contains(&Flag::Seen))
            .map(|m| m.uid);
        let keywords: BTreeSet<Flag> = state
            .messages
            .iter()
            .flat_map(|m| m.flags.iter())
            .filter(|f| matches!(f, Flag::Keyword(_)))
            .cloned()
            .collect();
        let mut flags: Vec<Flag> = Flag::system_flags().to_vec();
        flags.extend(keywords);

        Ok(SelectInfo {
            mailbox_id: mailbox.id,
            name: name.to_string(),
            read_only,
            uid_validity: state.uid_validity,
            uid_next: state.uid_next,
            permanent_flags: if read_only { Vec::new() } else { flags.clone() },
            flags,
            allow_new_keywords: !read_only,
            uids,
            recent_uids,
            first_unseen_uid,
            events: mailbox.events.subscribe(),
        })
    }

    async fn fetch(&self, mailbox_id: u64, uids: &[u32]) -> StoreResult<Vec<FetchRow>> {
        let mailbox = self.mailbox_by_id(mailbox_id).await?;
        let state = mailbox.state.lock().await;
        let mut rows = Vec::with_capacity(uids.len());
        for &uid in uids {
            if let Some(pos) = state.position(uid) {
                let message = &state.messages[pos];
                rows.push(FetchRow {
                    uid,
                    flags: message.flags.iter().cloned().collect(),
                    internal_date: message.internal_date,
                    body: message.body.clone(),
                });
            }
        }
        Ok(rows)
    }

    async fn store(
        &self,
        mailbox_id: u64,
        uids: &[u32],
        mode: StoreMode,
        flags: &[Flag],
    ) -> StoreResult<Vec<(u32, Vec<Flag>)>> {
        let mailbox = self.mailbox_by_id(mailbox_id).await?;
        let mut state = mailbox.state.lock().await;
        let mut results = Vec::new();
        for &uid in uids {
            let Some(pos) = state.position(uid) else {
                // Concurrently expunged; dropped silently.
                continue;
            };
            let before = state.messages[pos].flags.clone();
            apply_store(&mut state.messages[pos].flags, mode, flags);
            let after: Vec<Flag> = state.messages[pos].flags.iter().cloned().collect();
            if before != state.messages[pos].flags {
                self.emit(&mailbox, EventKind::FlagsChanged { uid, flags: after.clone() });
            }
            results.push((uid, after));
        }
        Ok(results)
    }

    async fn copy(
        &self,
        mailbox_id: u64,
        uids: &[u32],
        destination: &str,
    ) -> StoreResult<CopyResult> {
        let source = self.mailbox_by_id(mailbox_id).await?;
        let target = self.mailbox(destination).await?;
        if source.id == target.id {
            return Err(StoreError::BadName);
        }

        // Snapshot the source first; lock one mailbox at a time.
        let copies: Vec<MessageData> = {
            let state = source.state.lock().await;
            uids.iter()
                .filter_map(|&uid| state.position(uid).map(|pos| state.messages[pos].clone()))
                .collect()
        };

        let mut target_state = target.state.lock().await;
        if self.quota.is_some_and(|q| (target_state.messages.len() + copies.len()) as u32 > q) {
            return Err(StoreError::OverQuota);
        }
        let uid_validity = target_state.uid_validity;
        let mut src_uids = Vec::with_capacity(copies.len());
        let mut dst_uids = Vec::with_capacity(copies.len());
        for message in copies {
            let uid = target_state.uid_next;
            target_state.uid_next += 1;
            src_uids.push(message.uid);
            dst_uids.push(uid);
            let mut flags = message.flags.clone();
            flags.remove(&Flag::Recent);
            target_state.messages.push(MessageData {
                uid,
                flags,
                internal_date: message.internal_date,
                body: message.body,
            });
            target_state.unclaimed_recent.insert(uid);
            self.emit(&target, EventKind::Append { uid });
        }
        Ok(CopyResult { uid_validity, src_uids, dst_uids })
    }

    async fn move_messages(
        &self,
        mailbox_id: u64,
        uids: &[u32],
        destination: &str,
    ) -> StoreResult<CopyResult> {
        let result = self.copy(mailbox_id, uids, destination).await?;
        let source = self.mailbox_by_id(mailbox_id).await?;
        let mut state = source.state.lock().await;
        for &uid in &result.src_uids {
            if let Some(pos) = state.position(uid) {
                state.messages.remove(pos);
                state.unclaimed_recent.remove(&uid);
                self.emit(&source, EventKind::Expunge { uid });
            }
        }
        Ok(result)
    }

    async fn expunge(&self, mailbox_id: u64, uids: Option<&[u32]>) -> StoreResult<Vec<u32>> {
        let mailbox = self.mailbox_by_id(mailbox_id).await?;
        let mut state = mailbox.state.lock().await;
        let doomed: Vec<u32> = state
            .messages
            .iter()
            .filter(|m| m.flags.contains(&Flag::Deleted))
            .map(|m| m.uid)
            .filter(|uid| uids.is_none_or(|subset| subset.contains(uid)))
            .collect();
        for &uid in &doomed {
            if let Some(pos) = state.position(uid) {
                state.messages.remove(pos);
                state.unclaimed_recent.remove(&uid);
                self.emit(&mailbox, EventKind::Expunge { uid });
            }
        }
        Ok(doomed)
    }

    async fn append(
        &self,
        mailbox: &str,
        flags: &[Flag],
        internal_date: Option<DateTime<FixedOffset>>,
        body: Vec<u8>,
    ) -> StoreResult<AppendResult> {
        let mailbox = self.mailbox(mailbox).await?;
        let mut state = mailbox.state.lock().await;
        if self.quota.is_some_and(|q| state.messages.len() as u32 >= q) {
            return Err(StoreError::OverQuota);
        }
        let uid = state.uid_next;
        state.uid_next += 1;
        let mut flag_set: BTreeSet<Flag> = flags.iter().cloned().collect();
        flag_set.remove(&Flag::Recent);
        state.messages.push(MessageData {
            uid,
            flags: flag_set,
            internal_date: internal_date
                .unwrap_or_else(|| Utc::now().fixed_offset()),
            body: Arc::new(body),
        });
        state.unclaimed_recent.insert(uid);
        let uid_validity = state.uid_validity;
        self.emit(&mailbox, EventKind::Append { uid });
        Ok(AppendResult { uid_validity, uid })
    }

    async fn search(
        &self,
        mailbox_id: u64,
        criteria: &SearchKey,
        ctx: SearchContext<'_>,
    ) -> StoreResult<Vec<u32>> {
        let mailbox = self.mailbox_by_id(mailbox_id).await?;
        let state = mailbox.state.lock().await;
        let mut matched = Vec::new();
        for message in &state.messages {
            let Some(seq_index) = ctx.view_uids.iter().position(|&u| u == message.uid) else {
                // Not visible in the searching session's view yet.
                continue;
            };
            let eval = SearchEval { message, seq: seq_index as u32 + 1, ctx: &ctx };
            if eval.matches(criteria) {
                matched.push(message.uid);
            }
        }
        Ok(matched)
    }

    async fn claim_recent(&self, mailbox_id: u64, uid: u32) -> StoreResult<bool> {
        let mailbox = self.mailbox_by_id(mailbox_id).await?;
        let mut state = mailbox.state.lock().await;
        Ok(state.unclaimed_recent.remove(&uid))
    }
}

/// One message evaluated against a search criteria tree.
struct SearchEval<'a> {
    message: &'a MessageData,
    seq: u32,
    ctx: &'a SearchContext<'a>,
}

impl SearchEval<'_> {
    fn is_recent(&self) -> bool {
        self.ctx.recent_uids.contains(&self.message.uid)
    }

    fn has_flag(&self, flag: &Flag) -> bool {
        self.message.flags.contains(flag)
    }

    fn internal_day(&self) -> NaiveDate {
        self.message.internal_date.date_naive()
    }

    fn sent_day(&self) -> Option<NaiveDate> {
        let parsed = MessageParser::default().parse(self.message.body.as_slice())?;
        let date = parsed.date()?;
        DateTime::from_timestamp(date.to_timestamp(), 0).map(|dt| dt.date_naive())
    }

    fn header_contains(&self, name: &str, needle: &str) -> bool {
        let Some(parsed) = MessageParser::default().parse(self.message.body.as_slice()) else {
            return false;
        };
        parsed.headers().iter().any(|header| {
            header.name().eq_ignore_ascii_case(name)
                && header
                    .value()
                    .as_text()
                    .map(|text| contains_ci(text, needle))
                    .unwrap_or(needle.is_empty())
        })
    }

    fn body_contains(&self, needle: &str) -> bool {
        let body = self.message.body.as_slice();
        let start = body
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|p| p + 4)
            .unwrap_or(0);
        contains_ci(&String::from_utf8_lossy(&body[start..]), needle)
    }

    fn text_contains(&self, needle: &str) -> bool {
        contains_ci(&String::from_utf8_lossy(self.message.body.as_slice()), needle)
    }

    fn matches(&self, key: &SearchKey) -> bool {
        match key {
            SearchKey::All => true,
            SearchKey::Answered => self.has_flag(&Flag::Answered),
            SearchKey::Deleted => self.has_flag(&Flag::Deleted),
            SearchKey::Draft => self.has_flag(&Flag::Draft),
            SearchKey::Flagged => self.has_flag(&Flag::Flagged),
            SearchKey::Seen => self.has_flag(&Flag::Seen),
            SearchKey::Unanswered => !self.has_flag(&Flag::Answered),
            SearchKey::Undeleted => !self.has_flag(&Flag::Deleted),
            SearchKey::Undraft => !self.has_flag(&Flag::Draft),
            SearchKey::Unflagged => !self.has_flag(&Flag::Flagged),
            SearchKey::Unseen => !self.has_flag(&Flag::Seen),
            SearchKey::Recent => self.is_recent(),
            SearchKey::Old => !self.is_recent(),
            SearchKey::New => self.is_recent() && !self.has_flag(&Flag::Seen),
            SearchKey::Keyword(word) => self.has_flag(&Flag::Keyword(word.clone())),
            SearchKey::Unkeyword(word) => !self.has_flag(&Flag::Keyword(word.clone())),
            SearchKey::Larger(n) => self.message.body.len() as u32 > *n,
            SearchKey::Smaller(n) => (self.message.body.len() as u32) < *n,
            SearchKey::Before(date) => self.internal_day() < *date,
            SearchKey::On(date) => self.internal_day() == *date,
            SearchKey::Since(date) => self.internal_day() >= *date,
            SearchKey::SentBefore(date) => self.sent_day().is_some_and(|d| d < *date),
            SearchKey::SentOn(date) => self.sent_day().is_some_and(|d| d == *date),
            SearchKey::SentSince(date) => self.sent_day().is_some_and(|d| d >= *date),
            SearchKey::Bcc(s) => self.header_contains("Bcc", s),
            SearchKey::Cc(s) => self.header_contains("Cc", s),
            SearchKey::From(s) => self.header_contains("From", s),
            SearchKey::To(s) => self.header_contains("To", s),
            SearchKey::Subject(s) => self.header_contains("Subject", s),
            SearchKey::Header(name, pattern) => self.header_contains(name, pattern),
            SearchKey::Body(s) => self.body_contains(s),
            SearchKey::Text(s) => self.text_contains(s),
            SearchKey::Uid(set) => {
                let max = self.ctx.view_uids.last().copied().unwrap_or(0);
                set.contains(self.message.uid, max)
            }
            SearchKey::SequenceSet(set) => {
                let max = self.ctx.view_uids.len() as u32;
                set.contains(self.seq, max)
            }
            SearchKey::Not(inner) => !self.matches(inner),
            SearchKey::Or(a, b) => self.matches(a) || self.matches(b),
            SearchKey::And(keys) => keys.iter().all(|k| self.matches(k)),
        }
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
