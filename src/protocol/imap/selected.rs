use std::collections::BTreeSet;

use tokio::sync::broadcast;

use crate::protocol::imap::codec::Flag;
use crate::protocol::imap::command::state::SequenceSet;
use crate::protocol::imap::response::{FetchData, Response};
use crate::storage::{
    EventKind, MailboxEvent, MailboxSession, SelectInfo, StoreError, StoreResult,
};

/// One queued untagged update, waiting for the next flush point.
#[derive(Debug, Clone, PartialEq)]
enum PendingUpdate {
    Append(u32),
    Expunge(u32),
    Flags { uid: u32, flags: Vec<Flag> },
}

/// Per-session snapshot of the selected mailbox.
///
/// The seqnum array is frozen while a command executes; changes arrive
/// on the mailbox change stream, are absorbed into `pending` by the
/// session task itself (no other task touches the view), and mutate the
/// array only inside [`SelectedView::flush`].
pub struct SelectedView {
    pub mailbox_id: u64,
    pub name: String,
    pub read_only: bool,
    pub uid_validity: u32,
    session_id: u64,
    /// `uids[i]` is the message with sequence number `i + 1`.
    uids: Vec<u32>,
    /// UIDs carrying this session's `\Recent`.
    recent: BTreeSet<u32>,
    pending: Vec<PendingUpdate>,
    events: broadcast::Receiver<MailboxEvent>,
    /// EXISTS/RECENT values last announced to the client.
    announced_exists: u32,
    announced_recent: u32,
}

impl SelectedView {
    pub fn new(info: SelectInfo, session_id: u64) -> Self {
        let exists = info.uids.len() as u32;
        let recent: BTreeSet<u32> = info.recent_uids.iter().copied().collect();
        let announced_recent = recent.len() as u32;
        Self {
            mailbox_id: info.mailbox_id,
            name: info.name,
            read_only: info.read_only,
            uid_validity: info.uid_validity,
            session_id,
            uids: info.uids,
            recent,
            pending: Vec::new(),
            events: info.events,
            announced_exists: exists,
            announced_recent,
        }
    }

    pub fn exists(&self) -> u32 {
        self.uids.len() as u32
    }

    pub fn recent_count(&self) -> u32 {
        self.recent.len() as u32
    }

    pub fn uids(&self) -> &[u32] {
        &self.uids
    }

    pub fn recent_uids(&self) -> Vec<u32> {
        self.recent.iter().copied().collect()
    }

    pub fn is_recent(&self, uid: u32) -> bool {
        self.recent.contains(&uid)
    }

    pub fn seq_of(&self, uid: u32) -> Option<u32> {
        self.uids.binary_search(&uid).ok().map(|i| i as u32 + 1)
    }

    /// Resolve a sequence set against the frozen view. In sequence mode
    /// positions resolve through the seqnum array; in UID mode the set
    /// ranges over the UIDs themselves. Nonexistent entries drop out
    /// silently.
    pub fn resolve(&self, set: &SequenceSet, uid_mode: bool) -> Vec<u32> {
        if uid_mode {
            set.resolve(&self.uids)
        } else {
            let seqs: Vec<u32> = (1..=self.uids.len() as u32).collect();
            set.resolve(&seqs)
                .into_iter()
                .map(|seq| self.uids[seq as usize - 1])
                .collect()
        }
    }

    /// Merge this session's `\Recent` into a message's stored flags.
    pub fn flags_for(&self, uid: u32, stored: &[Flag]) -> Vec<Flag> {
        let mut flags = stored.to_vec();
        if self.is_recent(uid) && !flags.contains(&Flag::Recent) {
            flags.push(Flag::Recent);
        }
        flags
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Absorb every update already sitting on the change stream into the
    /// pending queue. Called by the session task at flush points.
    pub async fn pump(&mut self, session: &dyn MailboxSession) -> StoreResult<()> {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.absorb(event, session).await?,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(()),
                Err(broadcast::error::TryRecvError::Closed) => return Ok(()),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    return Err(StoreError::Transient(format!(
                        "mailbox update stream lagged by {} events",
                        missed
                    )));
                }
            }
        }
    }

    /// Block until at least one update arrives, then drain the rest.
    /// Returns false when the stream closed (mailbox deleted).
    pub async fn wait_and_pump(&mut self, session: &dyn MailboxSession) -> StoreResult<bool> {
        match self.events.recv().await {
            Ok(event) => self.absorb(event, session).await?,
            Err(broadcast::error::RecvError::Closed) => return Ok(false),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                return Err(StoreError::Transient(format!(
                    "mailbox update stream lagged by {} events",
                    missed
                )));
            }
        }
        self.pump(session).await?;
        Ok(true)
    }

    async fn absorb(
        &mut self,
        event: MailboxEvent,
        session: &dyn MailboxSession,
    ) -> StoreResult<()> {
        let own = event.origin == self.session_id;
        match event.kind {
            // The session already echoed its own stores and expunges.
            EventKind::Expunge { .. } | EventKind::FlagsChanged { .. } if own => {}
            EventKind::Append { uid } => {
                if session.claim_recent(self.mailbox_id, uid).await? {
                    self.recent.insert(uid);
                }
                self.pending.push(PendingUpdate::Append(uid));
            }
            EventKind::Expunge { uid } => self.pending.push(PendingUpdate::Expunge(uid)),
            EventKind::FlagsChanged { uid, flags } => {
                // At-least-once delivery: keep only the latest flags per
                // UID. Expunges are never coalesced.
                let slot = self.pending.iter().position(|update| {
                    matches!(update, PendingUpdate::Flags { uid: existing, .. } if *existing == uid)
                });
                match slot {
                    Some(i) => self.pending[i] = PendingUpdate::Flags { uid, flags },
                    None => self.pending.push(PendingUpdate::Flags { uid, flags }),
                }
            }
        }
        Ok(())
    }

    /// Emit the queued untagged responses, mutating the seqnum array in
    /// queue order. EXISTS (and RECENT, when changed) follow at the end
    /// once all inserts are applied.
    pub fn flush(&mut self, out: &mut Vec<Response>) {
        for update in std::mem::take(&mut self.pending) {
            match update {
                PendingUpdate::Expunge(uid) => {
                    if let Some(seq) = self.seq_of(uid) {
                        self.uids.remove(seq as usize - 1);
                        self.recent.remove(&uid);
                        out.push(Response::Expunge(seq));
                        if self.announced_exists > 0 {
                            self.announced_exists -= 1;
                        }
                    }
                }
                PendingUpdate::Append(uid) => {
                    if self.uids.last().is_none_or(|&last| last < uid) {
                        self.uids.push(uid);
                    }
                }
                PendingUpdate::Flags { uid, flags } => {
                    // Dropped silently if the message was expunged in the
                    // meantime.
                    if let Some(seq) = self.seq_of(uid) {
                        let flags = self.flags_for(uid, &flags);
                        out.push(Response::Fetch {
                            seq,
                            items: vec![FetchData::Flags(flags)],
                        });
                    }
                }
            }
        }

        if self.exists() != self.announced_exists {
            self.announced_exists = self.exists();
            out.push(Response::Exists(self.announced_exists));
        }
        if self.recent_count() != self.announced_recent {
            self.announced_recent = self.recent_count();
            out.push(Response::Recent(self.announced_recent));
        }
    }

    /// Echo this session's own expunges: one `* n EXPUNGE` per message
    /// with the sequence numbers shifting as the array contracts.
    pub fn expunge_now(&mut self, uids: &[u32], out: &mut Vec<Response>) {
        for &uid in uids {
            if let Some(seq) = self.seq_of(uid) {
                self.uids.remove(seq as usize - 1);
                self.recent.remove(&uid);
                out.push(Response::Expunge(seq));
                if self.announced_exists > 0 {
                    self.announced_exists -= 1;
                }
            }
        }
    }
}
