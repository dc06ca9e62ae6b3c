use crate::protocol::imap::codec::{self, Flag};
use crate::protocol::imap::command::state::StatusItem;
use chrono::{DateTime, FixedOffset};

/// Condition of a tagged or untagged status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

impl Status {
    fn name(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::No => "NO",
            Status::Bad => "BAD",
        }
    }
}

/// Bracketed response codes, emitted in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseCode {
    Alert,
    AuthenticationFailed,
    BadCharset,
    Capability(Vec<String>),
    Parse,
    PermanentFlags { flags: Vec<Flag>, allow_keywords: bool },
    ReadOnly,
    ReadWrite,
    TryCreate,
    UidNext(u32),
    UidValidity(u32),
    Unseen(u32),
    AppendUid { uid_validity: u32, uid: u32 },
    CopyUid { uid_validity: u32, src: Vec<u32>, dst: Vec<u32> },
    OverQuota,
    ServerBug,
    CompressionActive,
}

impl ResponseCode {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(b'[');
        match self {
            ResponseCode::Alert => out.extend_from_slice(b"ALERT"),
            ResponseCode::AuthenticationFailed => out.extend_from_slice(b"AUTHENTICATIONFAILED"),
            ResponseCode::BadCharset => out.extend_from_slice(b"BADCHARSET"),
            ResponseCode::Capability(caps) => {
                out.extend_from_slice(b"CAPABILITY ");
                out.extend_from_slice(caps.join(" ").as_bytes());
            }
            ResponseCode::Parse => out.extend_from_slice(b"PARSE"),
            ResponseCode::PermanentFlags { flags, allow_keywords } => {
                out.extend_from_slice(b"PERMANENTFLAGS (");
                let mut parts: Vec<String> = flags.iter().map(|f| f.to_string()).collect();
                if *allow_keywords {
                    parts.push("\\*".to_string());
                }
                out.extend_from_slice(parts.join(" ").as_bytes());
                out.push(b')');
            }
            ResponseCode::ReadOnly => out.extend_from_slice(b"READ-ONLY"),
            ResponseCode::ReadWrite => out.extend_from_slice(b"READ-WRITE"),
            ResponseCode::TryCreate => out.extend_from_slice(b"TRYCREATE"),
            ResponseCode::UidNext(n) => out.extend_from_slice(format!("UIDNEXT {}", n).as_bytes()),
            ResponseCode::UidValidity(n) => {
                out.extend_from_slice(format!("UIDVALIDITY {}", n).as_bytes())
            }
            ResponseCode::Unseen(n) => out.extend_from_slice(format!("UNSEEN {}", n).as_bytes()),
            ResponseCode::AppendUid { uid_validity, uid } => {
                out.extend_from_slice(format!("APPENDUID {} {}", uid_validity, uid).as_bytes())
            }
            ResponseCode::CopyUid { uid_validity, src, dst } => out.extend_from_slice(
                format!(
                    "COPYUID {} {} {}",
                    uid_validity,
                    format_uid_set(src),
                    format_uid_set(dst)
                )
                .as_bytes(),
            ),
            ResponseCode::OverQuota => out.extend_from_slice(b"OVERQUOTA"),
            ResponseCode::ServerBug => out.extend_from_slice(b"SERVERBUG"),
            ResponseCode::CompressionActive => out.extend_from_slice(b"COMPRESSIONACTIVE"),
        }
        out.push(b']');
    }
}

/// Compress a sorted UID list into the `1:3,5` wire form used by
/// COPYUID/SEARCH-style ranges.
pub fn format_uid_set(uids: &[u32]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut i = 0;
    while i < uids.len() {
        let start = uids[i];
        let mut end = start;
        while i + 1 < uids.len() && uids[i + 1] == end + 1 {
            i += 1;
            end = uids[i];
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}:{}", start, end));
        }
        i += 1;
    }
    parts.join(",")
}

/// RFC 3501 envelope structure, encoded as the parenthesized form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub date: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub sender: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub in_reply_to: Option<String>,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Address {
    pub name: Option<String>,
    pub mailbox: Option<String>,
    pub host: Option<String>,
}

impl Envelope {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(b'(');
        codec::encode_nstring(out, self.date.as_deref().map(str::as_bytes));
        out.push(b' ');
        codec::encode_nstring(out, self.subject.as_deref().map(str::as_bytes));
        for list in [&self.from, &self.sender, &self.reply_to, &self.to, &self.cc, &self.bcc] {
            out.push(b' ');
            encode_address_list(out, list);
        }
        out.push(b' ');
        codec::encode_nstring(out, self.in_reply_to.as_deref().map(str::as_bytes));
        out.push(b' ');
        codec::encode_nstring(out, self.message_id.as_deref().map(str::as_bytes));
        out.push(b')');
    }
}

fn encode_address_list(out: &mut Vec<u8>, list: &[Address]) {
    if list.is_empty() {
        out.extend_from_slice(b"NIL");
        return;
    }
    out.push(b'(');
    for addr in list {
        out.push(b'(');
        codec::encode_nstring(out, addr.name.as_deref().map(str::as_bytes));
        out.extend_from_slice(b" NIL ");
        codec::encode_nstring(out, addr.mailbox.as_deref().map(str::as_bytes));
        out.push(b' ');
        codec::encode_nstring(out, addr.host.as_deref().map(str::as_bytes));
        out.push(b')');
    }
    out.push(b')');
}

/// One attribute inside a FETCH data list. Items are written in the
/// order they appear, which the dispatcher arranges to match the
/// requested attribute order.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchData {
    Uid(u32),
    Flags(Vec<Flag>),
    InternalDate(DateTime<FixedOffset>),
    Rfc822Size(u32),
    Envelope(Envelope),
    /// RFC822 / RFC822.HEADER / RFC822.TEXT payloads.
    Rfc822 { label: &'static str, data: Vec<u8> },
    /// `BODY[...]` with the request echo (e.g. `BODY[HEADER]<0>`).
    BodySection { spec: String, data: Option<Vec<u8>> },
    /// `BINARY[...]` payload, always a literal8 on the wire.
    Binary { spec: String, data: Option<Vec<u8>> },
    BinarySize { spec: String, size: u32 },
    /// Pre-rendered BODY/BODYSTRUCTURE parenthesized form.
    BodyStructure { label: &'static str, raw: String },
}

impl FetchData {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            FetchData::Uid(uid) => out.extend_from_slice(format!("UID {}", uid).as_bytes()),
            FetchData::Flags(flags) => {
                out.extend_from_slice(b"FLAGS ");
                out.extend_from_slice(codec::encode_flag_list(flags.iter()).as_bytes());
            }
            FetchData::InternalDate(dt) => {
                out.extend_from_slice(b"INTERNALDATE ");
                codec::encode_quoted(out, codec::format_datetime(dt).as_bytes());
            }
            FetchData::Rfc822Size(size) => {
                out.extend_from_slice(format!("RFC822.SIZE {}", size).as_bytes())
            }
            FetchData::Envelope(envelope) => {
                out.extend_from_slice(b"ENVELOPE ");
                envelope.encode(out);
            }
            FetchData::Rfc822 { label, data } => {
                out.extend_from_slice(label.as_bytes());
                out.push(b' ');
                codec::encode_literal(out, data);
            }
            FetchData::BodySection { spec, data } => {
                out.extend_from_slice(spec.as_bytes());
                out.push(b' ');
                match data {
                    Some(data) => codec::encode_literal(out, data),
                    None => out.extend_from_slice(b"NIL"),
                }
            }
            FetchData::Binary { spec, data } => {
                out.extend_from_slice(spec.as_bytes());
                out.push(b' ');
                match data {
                    Some(data) => {
                        out.push(b'~');
                        codec::encode_literal(out, data);
                    }
                    None => out.extend_from_slice(b"NIL"),
                }
            }
            FetchData::BinarySize { spec, size } => {
                out.extend_from_slice(format!("{} {}", spec, size).as_bytes())
            }
            FetchData::BodyStructure { label, raw } => {
                out.extend_from_slice(label.as_bytes());
                out.push(b' ');
                out.extend_from_slice(raw.as_bytes());
            }
        }
    }
}

/// A serializable server response: tagged, untagged, or continuation.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Tagged {
        tag: String,
        status: Status,
        code: Option<ResponseCode>,
        text: String,
    },
    Untagged {
        status: Status,
        code: Option<ResponseCode>,
        text: String,
    },
    Bye {
        code: Option<ResponseCode>,
        text: String,
    },
    PreAuth {
        code: Option<ResponseCode>,
        text: String,
    },
    Capability(Vec<String>),
    Exists(u32),
    Recent(u32),
    Expunge(u32),
    Flags(Vec<Flag>),
    List {
        lsub: bool,
        attrs: Vec<String>,
        delimiter: Option<char>,
        mailbox: String,
    },
    Search(Vec<u32>),
    StatusRow {
        mailbox: String,
        items: Vec<(StatusItem, u32)>,
    },
    Fetch {
        seq: u32,
        items: Vec<FetchData>,
    },
    Enabled(Vec<String>),
    Id(Option<Vec<(String, String)>>),
    Namespace {
        delimiter: char,
    },
    /// `+ text` continuation request; the text may be a base64 challenge.
    Continuation(String),
}

impl Response {
    pub fn ok(tag: impl Into<String>, text: impl Into<String>) -> Self {
        Response::Tagged { tag: tag.into(), status: Status::Ok, code: None, text: text.into() }
    }

    pub fn ok_code(tag: impl Into<String>, code: ResponseCode, text: impl Into<String>) -> Self {
        Response::Tagged {
            tag: tag.into(),
            status: Status::Ok,
            code: Some(code),
            text: text.into(),
        }
    }

    pub fn no(tag: impl Into<String>, text: impl Into<String>) -> Self {
        Response::Tagged { tag: tag.into(), status: Status::No, code: None, text: text.into() }
    }

    pub fn no_code(tag: impl Into<String>, code: ResponseCode, text: impl Into<String>) -> Self {
        Response::Tagged {
            tag: tag.into(),
            status: Status::No,
            code: Some(code),
            text: text.into(),
        }
    }

    pub fn bad(tag: impl Into<String>, text: impl Into<String>) -> Self {
        Response::Tagged { tag: tag.into(), status: Status::Bad, code: None, text: text.into() }
    }

    pub fn untagged_ok(code: Option<ResponseCode>, text: impl Into<String>) -> Self {
        Response::Untagged { status: Status::Ok, code, text: text.into() }
    }

    /// Serialize onto `out`, including the trailing CRLF.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Response::Tagged { tag, status, code, text } => {
                out.extend_from_slice(tag.as_bytes());
                out.push(b' ');
                Self::encode_status(out, *status, code.as_ref(), text);
            }
            Response::Untagged { status, code, text } => {
                out.extend_from_slice(b"* ");
                Self::encode_status(out, *status, code.as_ref(), text);
            }
            Response::Bye { code, text } => {
                out.extend_from_slice(b"* BYE ");
                if let Some(code) = code {
                    code.encode(out);
                    out.push(b' ');
                }
                out.extend_from_slice(text.as_bytes());
            }
            Response::PreAuth { code, text } => {
                out.extend_from_slice(b"* PREAUTH ");
                if let Some(code) = code {
                    code.encode(out);
                    out.push(b' ');
                }
                out.extend_from_slice(text.as_bytes());
            }
            Response::Capability(caps) => {
                out.extend_from_slice(b"* CAPABILITY ");
                out.extend_from_slice(caps.join(" ").as_bytes());
            }
            Response::Exists(n) => out.extend_from_slice(format!("* {} EXISTS", n).as_bytes()),
            Response::Recent(n) => out.extend_from_slice(format!("* {} RECENT", n).as_bytes()),
            Response::Expunge(n) => out.extend_from_slice(format!("* {} EXPUNGE", n).as_bytes()),
            Response::Flags(flags) => {
                out.extend_from_slice(b"* FLAGS ");
                out.extend_from_slice(codec::encode_flag_list(flags.iter()).as_bytes());
            }
            Response::List { lsub, attrs, delimiter, mailbox } => {
                out.extend_from_slice(if *lsub { b"* LSUB (" } else { b"* LIST (" });
                out.extend_from_slice(attrs.join(" ").as_bytes());
                out.extend_from_slice(b") ");
                match delimiter {
                    Some(d) => codec::encode_quoted(out, d.to_string().as_bytes()),
                    None => out.extend_from_slice(b"NIL"),
                }
                out.push(b' ');
                codec::encode_string(out, codec::encode_mailbox_name(mailbox).as_bytes());
            }
            Response::Search(ids) => {
                out.extend_from_slice(b"* SEARCH");
                for id in ids {
                    out.extend_from_slice(format!(" {}", id).as_bytes());
                }
            }
            Response::StatusRow { mailbox, items } => {
                out.extend_from_slice(b"* STATUS ");
                codec::encode_string(out, codec::encode_mailbox_name(mailbox).as_bytes());
                out.extend_from_slice(b" (");
                let parts: Vec<String> =
                    items.iter().map(|(item, n)| format!("{} {}", item.name(), n)).collect();
                out.extend_from_slice(parts.join(" ").as_bytes());
                out.push(b')');
            }
            Response::Fetch { seq, items } => {
                out.extend_from_slice(format!("* {} FETCH (", seq).as_bytes());
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(b' ');
                    }
                    item.encode(out);
                }
                out.push(b')');
            }
            Response::Enabled(caps) => {
                out.extend_from_slice(b"* ENABLED");
                for cap in caps {
                    out.extend_from_slice(format!(" {}", cap).as_bytes());
                }
            }
            Response::Id(params) => {
                out.extend_from_slice(b"* ID ");
                match params {
                    None => out.extend_from_slice(b"NIL"),
                    Some(pairs) => {
                        out.push(b'(');
                        for (i, (key, value)) in pairs.iter().enumerate() {
                            if i > 0 {
                                out.push(b' ');
                            }
                            codec::encode_quoted(out, key.as_bytes());
                            out.push(b' ');
                            codec::encode_quoted(out, value.as_bytes());
                        }
                        out.push(b')');
                    }
                }
            }
            Response::Namespace { delimiter } => {
                out.extend_from_slice(b"* NAMESPACE ((\"\" ");
                codec::encode_quoted(out, delimiter.to_string().as_bytes());
                out.extend_from_slice(b")) NIL NIL");
            }
            Response::Continuation(text) => {
                out.push(b'+');
                if !text.is_empty() {
                    out.push(b' ');
                    out.extend_from_slice(text.as_bytes());
                }
            }
        }
        out.extend_from_slice(b"\r\n");
    }

    fn encode_status(out: &mut Vec<u8>, status: Status, code: Option<&ResponseCode>, text: &str) {
        out.extend_from_slice(status.name().as_bytes());
        out.push(b' ');
        if let Some(code) = code {
            code.encode(out);
            out.push(b' ');
        }
        out.extend_from_slice(text.as_bytes());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(response: Response) -> String {
        String::from_utf8(response.to_bytes()).unwrap()
    }

    #[test]
    fn test_tagged_with_code() {
        assert_eq!(
            render(Response::ok_code("a2", ResponseCode::ReadWrite, "SELECT completed")),
            "a2 OK [READ-WRITE] SELECT completed\r\n"
        );
        assert_eq!(
            render(Response::no_code("a3", ResponseCode::TryCreate, "No such mailbox")),
            "a3 NO [TRYCREATE] No such mailbox\r\n"
        );
    }

    #[test]
    fn test_untagged_select_block() {
        assert_eq!(render(Response::Exists(0)), "* 0 EXISTS\r\n");
        assert_eq!(render(Response::Recent(0)), "* 0 RECENT\r\n");
        assert_eq!(
            render(Response::untagged_ok(Some(ResponseCode::UidNext(1)), "Predicted next UID")),
            "* OK [UIDNEXT 1] Predicted next UID\r\n"
        );
        assert_eq!(
            render(Response::Flags(Flag::system_flags().to_vec())),
            "* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\r\n"
        );
        assert_eq!(
            render(Response::untagged_ok(
                Some(ResponseCode::PermanentFlags {
                    flags: Flag::system_flags().to_vec(),
                    allow_keywords: true,
                }),
                "Flags permitted",
            )),
            "* OK [PERMANENTFLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft \\*)] Flags permitted\r\n"
        );
    }

    #[test]
    fn test_fetch_preserves_item_order() {
        let response = Response::Fetch {
            seq: 1,
            items: vec![FetchData::Uid(1), FetchData::Flags(vec![Flag::Recent])],
        };
        assert_eq!(render(response), "* 1 FETCH (UID 1 FLAGS (\\Recent))\r\n");
    }

    #[test]
    fn test_fetch_literal_payload() {
        let response = Response::Fetch {
            seq: 2,
            items: vec![FetchData::Rfc822 { label: "RFC822.HEADER", data: b"A: b\r\n\r\n".to_vec() }],
        };
        assert_eq!(render(response), "* 2 FETCH (RFC822.HEADER {8}\r\nA: b\r\n\r\n)\r\n");
    }

    #[test]
    fn test_copyuid_ranges() {
        assert_eq!(format_uid_set(&[1, 2, 3, 5]), "1:3,5");
        assert_eq!(format_uid_set(&[7]), "7");
        let mut out = Vec::new();
        ResponseCode::CopyUid { uid_validity: 9, src: vec![2, 3], dst: vec![10, 11] }
            .encode(&mut out);
        assert_eq!(out, b"[COPYUID 9 2:3 10:11]");
    }

    #[test]
    fn test_list_row() {
        let response = Response::List {
            lsub: false,
            attrs: vec!["\\HasNoChildren".into()],
            delimiter: Some('/'),
            mailbox: "Entwürfe".into(),
        };
        assert_eq!(render(response), "* LIST (\\HasNoChildren) \"/\" Entw&APw-rfe\r\n");
    }

    #[test]
    fn test_search_and_status_rows() {
        assert_eq!(render(Response::Search(vec![2, 5, 9])), "* SEARCH 2 5 9\r\n");
        assert_eq!(render(Response::Search(vec![])), "* SEARCH\r\n");
        assert_eq!(
            render(Response::StatusRow {
                mailbox: "INBOX".into(),
                items: vec![(StatusItem::Messages, 3), (StatusItem::Unseen, 1)],
            }),
            "* STATUS INBOX (MESSAGES 3 UNSEEN 1)\r\n"
        );
    }

    #[test]
    fn test_continuation() {
        assert_eq!(render(Response::Continuation(String::new())), "+\r\n");
        assert_eq!(render(Response::Continuation("Ready".into())), "+ Ready\r\n");
    }

    #[test]
    fn test_preauth_and_alert() {
        assert_eq!(
            render(Response::PreAuth { code: None, text: "Logged in as demo".into() }),
            "* PREAUTH Logged in as demo\r\n"
        );
        assert_eq!(
            render(Response::Untagged {
                status: Status::No,
                code: Some(ResponseCode::Alert),
                text: "Mailbox is almost full".into(),
            }),
            "* NO [ALERT] Mailbox is almost full\r\n"
        );
        assert_eq!(
            render(Response::Bye { code: None, text: "Autologout".into() }),
            "* BYE Autologout\r\n"
        );
    }

    #[test]
    fn test_envelope_encoding() {
        let envelope = Envelope {
            date: Some("Mon, 7 Feb 1994 21:52:25 -0800".into()),
            subject: Some("Hi".into()),
            from: vec![Address {
                name: Some("Alice".into()),
                mailbox: Some("alice".into()),
                host: Some("example.org".into()),
            }],
            ..Default::default()
        };
        let mut out = Vec::new();
        envelope.encode(&mut out);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "(\"Mon, 7 Feb 1994 21:52:25 -0800\" \"Hi\" ((\"Alice\" NIL \"alice\" \"example.org\")) NIL NIL NIL NIL NIL NIL NIL)"
        );
    }
}
