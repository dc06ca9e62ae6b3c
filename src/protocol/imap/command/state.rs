use crate::protocol::imap::codec::Flag;
use chrono::{DateTime, FixedOffset, NaiveDate};

/// IMAP command as defined in RFC 3501, plus the extensions the server
/// advertises (UIDPLUS, MOVE, IDLE, ENABLE, ID, NAMESPACE, UNSELECT,
/// COMPRESS=DEFLATE).
#[derive(Debug, Clone, PartialEq)]
pub enum ImapCommand {
    // Any state
    Capability,
    Noop,
    Logout,
    Id {
        params: Option<Vec<(String, Option<String>)>>,
    },

    // Not authenticated state
    StartTls,
    Login {
        username: String,
        password: String,
    },
    Authenticate {
        mechanism: String,
        initial_response: Option<String>,
    },

    // Authenticated state
    Select {
        mailbox: String,
    },
    Examine {
        mailbox: String,
    },
    Create {
        mailbox: String,
    },
    Delete {
        mailbox: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Subscribe {
        mailbox: String,
    },
    Unsubscribe {
        mailbox: String,
    },
    List {
        reference: String,
        pattern: String,
    },
    Lsub {
        reference: String,
        pattern: String,
    },
    Status {
        mailbox: String,
        items: Vec<StatusItem>,
    },
    Append {
        mailbox: String,
        flags: Vec<Flag>,
        date_time: Option<DateTime<FixedOffset>>,
        message: Vec<u8>,
        literal8: bool,
    },
    Enable {
        capabilities: Vec<String>,
    },
    Namespace,

    // Selected state
    Check,
    Close,
    Unselect,
    Expunge,
    Search {
        charset: Option<String>,
        criteria: SearchKey,
    },
    Fetch {
        sequence_set: SequenceSet,
        items: Vec<FetchItem>,
    },
    Store {
        sequence_set: SequenceSet,
        mode: StoreMode,
        silent: bool,
        flags: Vec<Flag>,
    },
    Copy {
        sequence_set: SequenceSet,
        mailbox: String,
    },
    Move {
        sequence_set: SequenceSet,
        mailbox: String,
    },
    Uid {
        command: Box<UidCommand>,
    },
    Idle,
    Compress {
        algorithm: String,
    },

    // Syntactically valid tag with an unknown command name
    Unknown {
        command: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum UidCommand {
    Fetch {
        sequence_set: SequenceSet,
        items: Vec<FetchItem>,
    },
    Search {
        charset: Option<String>,
        criteria: SearchKey,
    },
    Store {
        sequence_set: SequenceSet,
        mode: StoreMode,
        silent: bool,
        flags: Vec<Flag>,
    },
    Copy {
        sequence_set: SequenceSet,
        mailbox: String,
    },
    Move {
        sequence_set: SequenceSet,
        mailbox: String,
    },
    Expunge {
        sequence_set: SequenceSet,
    },
}

/// One endpoint of a sequence range: a number or `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqItem {
    Number(u32),
    Star,
}

impl SeqItem {
    fn value(self, max: u32) -> u32 {
        match self {
            SeqItem::Number(n) => n,
            SeqItem::Star => max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceRange {
    Single(SeqItem),
    Range(SeqItem, SeqItem),
}

impl SequenceRange {
    fn bounds(&self, max: u32) -> (u32, u32) {
        match *self {
            SequenceRange::Single(item) => {
                let v = item.value(max);
                (v, v)
            }
            SequenceRange::Range(a, b) => {
                let (a, b) = (a.value(max), b.value(max));
                // 4:2 means the same as 2:4
                if a <= b {
                    (a, b)
                } else {
                    (b, a)
                }
            }
        }
    }
}

/// Sequence set (e.g. `1`, `1:3`, `2,4:*`). A non-empty ordered union of
/// ranges over message positions or UIDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSet {
    pub ranges: Vec<SequenceRange>,
}

impl SequenceSet {
    /// Resolve against the ordered list of existing identifiers.
    /// `*` expands to the current maximum; entries that do not exist are
    /// filtered silently; the result is deduplicated and sorted. An empty
    /// result is legal.
    pub fn resolve(&self, existing: &[u32]) -> Vec<u32> {
        let Some(&max) = existing.last() else {
            return Vec::new();
        };
        let mut out: Vec<u32> = Vec::new();
        for range in &self.ranges {
            let (lo, hi) = range.bounds(max);
            let start = existing.partition_point(|&v| v < lo);
            for &v in &existing[start..] {
                if v > hi {
                    break;
                }
                out.push(v);
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Membership test without materializing the set, treating `*` as
    /// `max`. Used when matching UIDs against a client-supplied set.
    pub fn contains(&self, candidate: u32, max: u32) -> bool {
        self.ranges.iter().any(|range| {
            let (lo, hi) = range.bounds(max);
            lo <= candidate && candidate <= hi
        })
    }
}

/// STORE operation mode: `FLAGS`, `+FLAGS`, `-FLAGS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Replace,
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    Recent,
    UidNext,
    UidValidity,
    Unseen,
}

impl StatusItem {
    pub fn name(&self) -> &'static str {
        match self {
            StatusItem::Messages => "MESSAGES",
            StatusItem::Recent => "RECENT",
            StatusItem::UidNext => "UIDNEXT",
            StatusItem::UidValidity => "UIDVALIDITY",
            StatusItem::Unseen => "UNSEEN",
        }
    }
}

/// The part of a body section after the numeric part path, e.g.
/// `HEADER`, `HEADER.FIELDS (From To)`, `TEXT`, `MIME`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionText {
    Header,
    HeaderFields { negate: bool, fields: Vec<String> },
    Text,
    Mime,
}

/// A `BODY[...]` section: a dotted part path plus an optional text
/// specifier. An empty section (`BODY[]`) addresses the whole message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BodySection {
    pub parts: Vec<u32>,
    pub text: Option<SectionText>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchItem {
    Envelope,
    Flags,
    InternalDate,
    Rfc822,
    Rfc822Header,
    Rfc822Size,
    Rfc822Text,
    Body,
    BodyStructure,
    Uid,
    BodySection {
        section: BodySection,
        partial: Option<(u32, u32)>,
        peek: bool,
    },
    BinarySection {
        section: Vec<u32>,
        partial: Option<(u32, u32)>,
        peek: bool,
    },
    BinarySize {
        section: Vec<u32>,
    },
}

impl FetchItem {
    /// Whether fetching this attribute implicitly sets `\Seen`.
    pub fn sets_seen(&self) -> bool {
        match self {
            FetchItem::Rfc822 | FetchItem::Rfc822Text => true,
            FetchItem::BodySection { peek, .. } | FetchItem::BinarySection { peek, .. } => !peek,
            _ => false,
        }
    }
}

/// SEARCH criteria tree (RFC 3501 §6.4.4).
#[derive(Debug, Clone, PartialEq)]
pub enum SearchKey {
    All,
    Answered,
    Bcc(String),
    Before(NaiveDate),
    Body(String),
    Cc(String),
    Deleted,
    Draft,
    Flagged,
    From(String),
    Header(String, String),
    Keyword(String),
    Larger(u32),
    New,
    Not(Box<SearchKey>),
    Old,
    On(NaiveDate),
    Or(Box<SearchKey>, Box<SearchKey>),
    Recent,
    Seen,
    SentBefore(NaiveDate),
    SentOn(NaiveDate),
    SentSince(NaiveDate),
    Since(NaiveDate),
    Smaller(u32),
    Subject(String),
    Text(String),
    To(String),
    Uid(SequenceSet),
    Unanswered,
    Undeleted,
    Undraft,
    Unflagged,
    Unkeyword(String),
    Unseen,
    SequenceSet(SequenceSet),
    And(Vec<SearchKey>),
}
