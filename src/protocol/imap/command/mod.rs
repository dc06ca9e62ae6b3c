pub mod state;

use crate::protocol::imap::codec::{self, Flag};
use chrono::NaiveDate;
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take, take_while1},
    character::complete::{char, digit1, space1},
    combinator::{eof, map, map_res, opt, value},
    multi::{separated_list0, separated_list1},
    sequence::{delimited, preceded, separated_pair, terminated},
    IResult, Parser,
};
use self::state::{
    BodySection, FetchItem, ImapCommand, SearchKey, SectionText, SeqItem, SequenceRange,
    SequenceSet, StatusItem, StoreMode, UidCommand,
};

/// Error from command parsing. When the tag was recognizable it is
/// carried so the dispatcher can echo it in the BAD response; the offset
/// points into the framed command buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub tag: Option<String>,
    pub offset: usize,
    pub message: String,
}

impl ParseError {
    fn new(tag: Option<String>, offset: usize, message: impl Into<String>) -> Self {
        Self { tag, offset, message: message.into() }
    }
}

/// Outcome of feeding one line into the framing decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameResult {
    /// A full command is buffered; call [`CommandDecoder::take`].
    Complete,
    /// The line ended in a literal count; the connection must provide
    /// exactly `count` bytes. `sync` literals require a continuation
    /// request first.
    NeedLiteral { count: usize, sync: bool },
    /// The declared literal exceeds the per-command maximum. `sync` tells
    /// the caller whether bytes may already be pipelined behind it.
    TooLarge { count: usize, sync: bool },
}

/// Accumulates lines and literal payloads until a complete command is
/// framed. A command ends at CRLF unless the line ends with a literal
/// count, in which case the payload and a follow-up line are expected.
#[derive(Debug)]
pub struct CommandDecoder {
    buf: Vec<u8>,
    max_literal: usize,
}

impl CommandDecoder {
    pub fn new(max_literal: usize) -> Self {
        Self { buf: Vec::new(), max_literal }
    }

    /// Feed a line with its CRLF already stripped.
    pub fn feed_line(&mut self, line: &[u8]) -> FrameResult {
        self.buf.extend_from_slice(line);
        match trailing_literal(line) {
            Some((count, sync)) if count > self.max_literal => {
                FrameResult::TooLarge { count, sync }
            }
            Some((count, sync)) => {
                self.buf.extend_from_slice(b"\r\n");
                FrameResult::NeedLiteral { count, sync }
            }
            None => FrameResult::Complete,
        }
    }

    /// Feed the bytes of the pending literal.
    pub fn feed_literal(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the framed command buffer, resetting the decoder.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Detect a literal count at the end of a line, honoring quoted strings
/// so `"{3}"` inside a quoted argument does not trigger framing.
/// Returns `(count, sync)`; `{n+}` (and `~{n+}`) are non-synchronizing.
fn trailing_literal(line: &[u8]) -> Option<(usize, bool)> {
    let mut in_quotes = false;
    let mut open = None;
    let mut i = 0;
    while i < line.len() {
        match line[i] {
            b'\\' if in_quotes => i += 1,
            b'"' => in_quotes = !in_quotes,
            b'{' if !in_quotes => open = Some(i),
            _ => {}
        }
        i += 1;
    }
    let open = open?;
    if in_quotes || *line.last()? != b'}' {
        return None;
    }
    let inner = line.get(open + 1..line.len() - 1)?;
    let (digits, sync) = match inner.last() {
        Some(b'+') => (&inner[..inner.len() - 1], false),
        _ => (inner, true),
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let count: usize = std::str::from_utf8(digits).ok()?.parse().ok()?;
    Some((count, sync))
}

/// Parse a framed command buffer into its tag and typed record.
///
/// Commands with an unknown name parse to [`ImapCommand::Unknown`] so
/// the tag remains echoable; argument shape errors produce a
/// [`ParseError`] that still carries the tag.
pub fn parse_command(input: &[u8]) -> Result<(String, ImapCommand), ParseError> {
    let (rest, tag) = parse_tag(input)
        .map_err(|_: nom::Err<nom::error::Error<&[u8]>>| {
            ParseError::new(None, 0, "Missing or malformed command tag")
        })?;
    let tag = String::from_utf8_lossy(tag).to_string();
    let (rest, _) = space1::<_, nom::error::Error<&[u8]>>(rest).map_err(|_| {
        ParseError::new(Some(tag.clone()), offset_of(input, rest), "Expected space after tag")
    })?;

    let (rest, name) = parse_command_name(rest).map_err(|_: nom::Err<nom::error::Error<&[u8]>>| {
        ParseError::new(Some(tag.clone()), offset_of(input, rest), "Missing command name")
    })?;
    let name = String::from_utf8_lossy(name).to_ascii_uppercase();

    let result = match name.as_str() {
        "CAPABILITY" => bare(rest, ImapCommand::Capability),
        "NOOP" => bare(rest, ImapCommand::Noop),
        "LOGOUT" => bare(rest, ImapCommand::Logout),
        "ID" => parse_id(rest),
        "STARTTLS" => bare(rest, ImapCommand::StartTls),
        "LOGIN" => parse_login(rest),
        "AUTHENTICATE" => parse_authenticate(rest),
        "SELECT" => parse_mailbox_arg(rest, |mailbox| ImapCommand::Select { mailbox }),
        "EXAMINE" => parse_mailbox_arg(rest, |mailbox| ImapCommand::Examine { mailbox }),
        "CREATE" => parse_mailbox_arg(rest, |mailbox| ImapCommand::Create { mailbox }),
        "DELETE" => parse_mailbox_arg(rest, |mailbox| ImapCommand::Delete { mailbox }),
        "RENAME" => parse_rename(rest),
        "SUBSCRIBE" => parse_mailbox_arg(rest, |mailbox| ImapCommand::Subscribe { mailbox }),
        "UNSUBSCRIBE" => parse_mailbox_arg(rest, |mailbox| ImapCommand::Unsubscribe { mailbox }),
        "LIST" => parse_list(rest, false),
        "LSUB" => parse_list(rest, true),
        "STATUS" => parse_status(rest),
        "APPEND" => parse_append(rest),
        "ENABLE" => parse_enable(rest),
        "NAMESPACE" => bare(rest, ImapCommand::Namespace),
        "CHECK" => bare(rest, ImapCommand::Check),
        "CLOSE" => bare(rest, ImapCommand::Close),
        "UNSELECT" => bare(rest, ImapCommand::Unselect),
        "EXPUNGE" => bare(rest, ImapCommand::Expunge),
        "SEARCH" => parse_search(rest)
            .map(|(r, (charset, criteria))| (r, ImapCommand::Search { charset, criteria })),
        "FETCH" => parse_fetch(rest)
            .map(|(r, (sequence_set, items))| (r, ImapCommand::Fetch { sequence_set, items })),
        "STORE" => parse_store(rest).map(|(r, (sequence_set, mode, silent, flags))| {
            (r, ImapCommand::Store { sequence_set, mode, silent, flags })
        }),
        "COPY" => parse_copy(rest)
            .map(|(r, (sequence_set, mailbox))| (r, ImapCommand::Copy { sequence_set, mailbox })),
        "MOVE" => parse_copy(rest)
            .map(|(r, (sequence_set, mailbox))| (r, ImapCommand::Move { sequence_set, mailbox })),
        "UID" => parse_uid(rest),
        "IDLE" => bare(rest, ImapCommand::Idle),
        "COMPRESS" => parse_compress(rest),
        _ => {
            return Ok((tag, ImapCommand::Unknown { command: name }));
        }
    };

    match result {
        Ok((rest, command)) => {
            if !rest.is_empty() {
                return Err(ParseError::new(
                    Some(tag),
                    offset_of(input, rest),
                    format!("Trailing data after {} arguments", name),
                ));
            }
            Ok((tag, command))
        }
        Err(err) => {
            let offset = match &err {
                nom::Err::Error(e) | nom::Err::Failure(e) => offset_of(input, e.input),
                nom::Err::Incomplete(_) => input.len(),
            };
            Err(ParseError::new(Some(tag), offset, format!("Invalid {} arguments", name)))
        }
    }
}

fn offset_of(full: &[u8], rest: &[u8]) -> usize {
    full.len() - rest.len()
}

type PResult<'a, T> = IResult<&'a [u8], T>;

fn bare(input: &[u8], command: ImapCommand) -> PResult<'_, ImapCommand> {
    let (input, _) = eof(input)?;
    Ok((input, command))
}

fn parse_tag(input: &[u8]) -> PResult<'_, &[u8]> {
    take_while1(|c: u8| codec::is_atom_char(c) && c != b'+' || c == b']').parse(input)
}

fn parse_command_name(input: &[u8]) -> PResult<'_, &[u8]> {
    take_while1(|c: u8| c.is_ascii_alphabetic()).parse(input)
}

fn number(input: &[u8]) -> PResult<'_, u32> {
    map_res(digit1, |s: &[u8]| std::str::from_utf8(s).unwrap().parse::<u32>()).parse(input)
}

fn nz_number(input: &[u8]) -> PResult<'_, u32> {
    map_res(digit1, |s: &[u8]| {
        let n: u32 = std::str::from_utf8(s).unwrap().parse().map_err(|_| ())?;
        if n == 0 {
            Err(())
        } else {
            Ok(n)
        }
    })
    .parse(input)
}

fn is_astring_char(c: u8) -> bool {
    codec::is_atom_char(c) || c == b']'
}

fn atom(input: &[u8]) -> PResult<'_, &[u8]> {
    take_while1(is_astring_char).parse(input)
}

fn quoted(input: &[u8]) -> PResult<'_, Vec<u8>> {
    let (input, _) = char('"').parse(input)?;
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'\\' => i += 2,
            b'"' => break,
            _ => i += 1,
        }
    }
    if i >= input.len() {
        return Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Char)));
    }
    let body = &input[..i];
    let decoded = codec::decode_quoted(body).map_err(|_| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Escaped))
    })?;
    Ok((&input[i + 1..], decoded))
}

/// `{n}` / `{n+}` (and `~{n}` literal8 variants) followed by CRLF and
/// exactly n bytes, all already framed into the buffer.
fn literal(input: &[u8]) -> PResult<'_, (Vec<u8>, bool)> {
    let (input, binary) = opt(char('~')).parse(input)?;
    let (input, _) = char('{').parse(input)?;
    let (input, n) =
        map_res(digit1, |s: &[u8]| std::str::from_utf8(s).unwrap().parse::<usize>()).parse(input)?;
    let (input, _) = opt(char('+')).parse(input)?;
    let (input, _) = char('}').parse(input)?;
    let (input, _) = tag("\r\n").parse(input)?;
    let (input, bytes) = take(n).parse(input)?;
    Ok((input, (bytes.to_vec(), binary.is_some())))
}

fn astring(input: &[u8]) -> PResult<'_, Vec<u8>> {
    alt((
        quoted,
        map(literal, |(bytes, _)| bytes),
        map(atom, |bytes: &[u8]| bytes.to_vec()),
    ))
    .parse(input)
}

fn astring_utf8(input: &[u8]) -> PResult<'_, String> {
    map(astring, |bytes| String::from_utf8_lossy(&bytes).to_string()).parse(input)
}

fn nstring(input: &[u8]) -> PResult<'_, Option<String>> {
    alt((
        value(None, tag_no_case("NIL")),
        map(quoted, |bytes| Some(String::from_utf8_lossy(&bytes).to_string())),
        map(literal, |(bytes, _)| Some(String::from_utf8_lossy(&bytes).to_string())),
    ))
    .parse(input)
}

/// Mailbox name: astring, then modified UTF-7 decode and INBOX folding.
fn mailbox(input: &[u8]) -> PResult<'_, String> {
    let (input, raw) = astring(input)?;
    let encoded = String::from_utf8_lossy(&raw);
    let name = codec::decode_mailbox_name(&encoded).map_err(|_| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify))
    })?;
    Ok((input, codec::normalize_mailbox_name(&name)))
}

/// LIST pattern: like a mailbox name, but the wildcards `*`/`%` are part
/// of the atom alphabet.
fn list_mailbox(input: &[u8]) -> PResult<'_, String> {
    let (input, raw) = alt((
        quoted,
        map(literal, |(bytes, _)| bytes),
        map(
            take_while1(|c: u8| is_astring_char(c) || c == b'%' || c == b'*'),
            |bytes: &[u8]| bytes.to_vec(),
        ),
    ))
    .parse(input)?;
    let encoded = String::from_utf8_lossy(&raw);
    let name = codec::decode_mailbox_name(&encoded).map_err(|_| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify))
    })?;
    Ok((input, name))
}

fn seq_item(input: &[u8]) -> PResult<'_, SeqItem> {
    alt((value(SeqItem::Star, char('*')), map(nz_number, SeqItem::Number))).parse(input)
}

fn sequence_range(input: &[u8]) -> PResult<'_, SequenceRange> {
    alt((
        map(separated_pair(seq_item, char(':'), seq_item), |(a, b)| SequenceRange::Range(a, b)),
        map(seq_item, SequenceRange::Single),
    ))
    .parse(input)
}

pub fn sequence_set(input: &[u8]) -> PResult<'_, SequenceSet> {
    map(separated_list1(char(','), sequence_range), |ranges| SequenceSet { ranges }).parse(input)
}

fn flag(input: &[u8]) -> PResult<'_, Flag> {
    let (input, token) = take_while1(|c: u8| codec::is_atom_char(c) || c == b'\\').parse(input)?;
    let token = std::str::from_utf8(token).map_err(|_| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify))
    })?;
    match Flag::parse(token) {
        Some(flag) => Ok((input, flag)),
        None => Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify))),
    }
}

fn flag_list(input: &[u8]) -> PResult<'_, Vec<Flag>> {
    delimited(char('('), separated_list0(space1, flag), char(')')).parse(input)
}

fn quoted_datetime(input: &[u8]) -> PResult<'_, chrono::DateTime<chrono::FixedOffset>> {
    let (input, raw) = quoted(input)?;
    let text = String::from_utf8_lossy(&raw);
    let dt = codec::parse_datetime(&text).map_err(|_| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify))
    })?;
    Ok((input, dt))
}

fn search_date(input: &[u8]) -> PResult<'_, NaiveDate> {
    let (input, raw) = alt((quoted, map(atom, |b: &[u8]| b.to_vec()))).parse(input)?;
    let text = String::from_utf8_lossy(&raw);
    let date = codec::parse_date(&text).map_err(|_| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify))
    })?;
    Ok((input, date))
}

// Command argument parsers

fn parse_login(input: &[u8]) -> PResult<'_, ImapCommand> {
    let (input, _) = space1(input)?;
    let (input, username) = astring_utf8(input)?;
    let (input, _) = space1(input)?;
    let (input, password) = astring_utf8(input)?;
    let (input, _) = eof(input)?;
    Ok((input, ImapCommand::Login { username, password }))
}

fn parse_authenticate(input: &[u8]) -> PResult<'_, ImapCommand> {
    let (input, _) = space1(input)?;
    let (input, mechanism) =
        take_while1(|c: u8| c.is_ascii_alphanumeric() || c == b'-' || c == b'_').parse(input)?;
    // SASL-IR: optional initial response, base64 or "="
    let (input, initial_response) = opt(preceded(
        space1,
        map(take_while1(|c: u8| c.is_ascii_graphic()), |b: &[u8]| {
            String::from_utf8_lossy(b).to_string()
        }),
    ))
    .parse(input)?;
    let (input, _) = eof(input)?;
    Ok((
        input,
        ImapCommand::Authenticate {
            mechanism: String::from_utf8_lossy(mechanism).to_ascii_uppercase(),
            initial_response,
        },
    ))
}

fn parse_mailbox_arg(
    input: &[u8],
    build: impl Fn(String) -> ImapCommand,
) -> PResult<'_, ImapCommand> {
    let (input, _) = space1(input)?;
    let (input, name) = mailbox(input)?;
    let (input, _) = eof(input)?;
    Ok((input, build(name)))
}

fn parse_rename(input: &[u8]) -> PResult<'_, ImapCommand> {
    let (input, _) = space1(input)?;
    let (input, from) = mailbox(input)?;
    let (input, _) = space1(input)?;
    let (input, to) = mailbox(input)?;
    let (input, _) = eof(input)?;
    Ok((input, ImapCommand::Rename { from, to }))
}

fn parse_list(input: &[u8], lsub: bool) -> PResult<'_, ImapCommand> {
    let (input, _) = space1(input)?;
    let (input, reference) = mailbox_or_empty(input)?;
    let (input, _) = space1(input)?;
    let (input, pattern) = list_mailbox_or_empty(input)?;
    let (input, _) = eof(input)?;
    let command = if lsub {
        ImapCommand::Lsub { reference, pattern }
    } else {
        ImapCommand::List { reference, pattern }
    };
    Ok((input, command))
}

fn mailbox_or_empty(input: &[u8]) -> PResult<'_, String> {
    alt((map(tag("\"\""), |_| String::new()), mailbox)).parse(input)
}

fn list_mailbox_or_empty(input: &[u8]) -> PResult<'_, String> {
    alt((map(tag("\"\""), |_| String::new()), list_mailbox)).parse(input)
}

fn parse_status(input: &[u8]) -> PResult<'_, ImapCommand> {
    let (input, _) = space1(input)?;
    let (input, name) = mailbox(input)?;
    let (input, _) = space1(input)?;
    let (input, items) =
        delimited(char('('), separated_list1(space1, status_item), char(')')).parse(input)?;
    let (input, _) = eof(input)?;
    Ok((input, ImapCommand::Status { mailbox: name, items }))
}

fn status_item(input: &[u8]) -> PResult<'_, StatusItem> {
    alt((
        value(StatusItem::Messages, tag_no_case("MESSAGES")),
        value(StatusItem::Recent, tag_no_case("RECENT")),
        value(StatusItem::UidNext, tag_no_case("UIDNEXT")),
        value(StatusItem::UidValidity, tag_no_case("UIDVALIDITY")),
        value(StatusItem::Unseen, tag_no_case("UNSEEN")),
    ))
    .parse(input)
}

fn parse_append(input: &[u8]) -> PResult<'_, ImapCommand> {
    let (input, _) = space1(input)?;
    let (input, name) = mailbox(input)?;
    let (input, flags) = opt(preceded(space1, flag_list)).parse(input)?;
    let (input, date_time) = opt(preceded(space1, quoted_datetime)).parse(input)?;
    let (input, _) = space1(input)?;
    let (input, (message, literal8)) = literal(input)?;
    let (input, _) = eof(input)?;
    Ok((
        input,
        ImapCommand::Append {
            mailbox: name,
            flags: flags.unwrap_or_default(),
            date_time,
            message,
            literal8,
        },
    ))
}

fn parse_enable(input: &[u8]) -> PResult<'_, ImapCommand> {
    let (input, _) = space1(input)?;
    let (input, capabilities) = separated_list1(
        space1,
        map(atom, |b: &[u8]| String::from_utf8_lossy(b).to_ascii_uppercase()),
    )
    .parse(input)?;
    let (input, _) = eof(input)?;
    Ok((input, ImapCommand::Enable { capabilities }))
}

fn parse_id(input: &[u8]) -> PResult<'_, ImapCommand> {
    let (input, _) = space1(input)?;
    let (input, params) = alt((
        value(None, tag_no_case("NIL")),
        map(
            delimited(
                char('('),
                separated_list0(space1, separated_pair(nstring, space1, nstring)),
                char(')'),
            ),
            |pairs| {
                Some(
                    pairs
                        .into_iter()
                        .map(|(k, v)| (k.unwrap_or_default(), v))
                        .collect::<Vec<_>>(),
                )
            },
        ),
    ))
    .parse(input)?;
    let (input, _) = eof(input)?;
    Ok((input, ImapCommand::Id { params }))
}

fn parse_compress(input: &[u8]) -> PResult<'_, ImapCommand> {
    let (input, _) = space1(input)?;
    let (input, algorithm) = atom(input)?;
    let (input, _) = eof(input)?;
    Ok((
        input,
        ImapCommand::Compress {
            algorithm: String::from_utf8_lossy(algorithm).to_ascii_uppercase(),
        },
    ))
}

fn parse_copy(input: &[u8]) -> PResult<'_, (SequenceSet, String)> {
    let (input, _) = space1(input)?;
    let (input, seq) = sequence_set(input)?;
    let (input, _) = space1(input)?;
    let (input, name) = mailbox(input)?;
    let (input, _) = eof(input)?;
    Ok((input, (seq, name)))
}

fn parse_store(input: &[u8]) -> PResult<'_, (SequenceSet, StoreMode, bool, Vec<Flag>)> {
    let (input, _) = space1(input)?;
    let (input, seq) = sequence_set(input)?;
    let (input, _) = space1(input)?;
    let (input, sign) = opt(alt((char('+'), char('-')))).parse(input)?;
    let mode = match sign {
        Some('+') => StoreMode::Add,
        Some('-') => StoreMode::Remove,
        _ => StoreMode::Replace,
    };
    let (input, _) = tag_no_case("FLAGS").parse(input)?;
    let (input, silent) = map(opt(tag_no_case(".SILENT")), |s| s.is_some()).parse(input)?;
    let (input, _) = space1(input)?;
    // Flags may be parenthesized or bare
    let (input, flags) = alt((flag_list, separated_list1(space1, flag))).parse(input)?;
    let (input, _) = eof(input)?;
    Ok((input, (seq, mode, silent, flags)))
}

fn parse_fetch(input: &[u8]) -> PResult<'_, (SequenceSet, Vec<FetchItem>)> {
    let (input, _) = space1(input)?;
    let (input, seq) = sequence_set(input)?;
    let (input, _) = space1(input)?;
    let (input, items) = fetch_spec(input)?;
    let (input, _) = eof(input)?;
    Ok((input, (seq, items)))
}

/// FETCH attribute list: the ALL/FAST/FULL macros, a single attribute,
/// or a parenthesized list. Macros expand here so downstream code only
/// sees concrete attributes.
fn fetch_spec(input: &[u8]) -> PResult<'_, Vec<FetchItem>> {
    alt((
        value(
            vec![
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope,
            ],
            tag_no_case("ALL"),
        ),
        value(
            vec![FetchItem::Flags, FetchItem::InternalDate, FetchItem::Rfc822Size],
            tag_no_case("FAST"),
        ),
        value(
            vec![
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope,
                FetchItem::Body,
            ],
            tag_no_case("FULL"),
        ),
        delimited(char('('), separated_list1(space1, fetch_item), char(')')),
        map(fetch_item, |item| vec![item]),
    ))
    .parse(input)
}

fn fetch_item(input: &[u8]) -> PResult<'_, FetchItem> {
    alt((
        // Longest names first so prefixes do not shadow
        value(FetchItem::Rfc822Header, tag_no_case("RFC822.HEADER")),
        value(FetchItem::Rfc822Size, tag_no_case("RFC822.SIZE")),
        value(FetchItem::Rfc822Text, tag_no_case("RFC822.TEXT")),
        value(FetchItem::Rfc822, tag_no_case("RFC822")),
        value(FetchItem::InternalDate, tag_no_case("INTERNALDATE")),
        value(FetchItem::BodyStructure, tag_no_case("BODYSTRUCTURE")),
        value(FetchItem::Envelope, tag_no_case("ENVELOPE")),
        value(FetchItem::Flags, tag_no_case("FLAGS")),
        value(FetchItem::Uid, tag_no_case("UID")),
        binary_size_item,
        binary_item,
        body_section_item,
        value(FetchItem::Body, tag_no_case("BODY")),
    ))
    .parse(input)
}

fn body_section_item(input: &[u8]) -> PResult<'_, FetchItem> {
    let (input, _) = tag_no_case("BODY").parse(input)?;
    let (input, peek) = map(opt(tag_no_case(".PEEK")), |p| p.is_some()).parse(input)?;
    let (input, section) = delimited(char('['), body_section, char(']')).parse(input)?;
    let (input, partial) = opt(partial_range).parse(input)?;
    Ok((input, FetchItem::BodySection { section, partial, peek }))
}

fn body_section(input: &[u8]) -> PResult<'_, BodySection> {
    let (input, parts) = separated_list0(char('.'), nz_number).parse(input)?;
    let (input, text) = if parts.is_empty() {
        opt(section_text).parse(input)?
    } else {
        opt(preceded(char('.'), section_msgtext)).parse(input)?
    };
    Ok((input, BodySection { parts, text }))
}

fn section_text(input: &[u8]) -> PResult<'_, SectionText> {
    alt((
        map(
            preceded(
                tag_no_case("HEADER.FIELDS"),
                (
                    map(opt(tag_no_case(".NOT")), |n| n.is_some()),
                    preceded(space1, header_field_list),
                ),
            ),
            |(negate, fields)| SectionText::HeaderFields { negate, fields },
        ),
        value(SectionText::Header, tag_no_case("HEADER")),
        value(SectionText::Text, tag_no_case("TEXT")),
    ))
    .parse(input)
}

fn section_msgtext(input: &[u8]) -> PResult<'_, SectionText> {
    alt((section_text, value(SectionText::Mime, tag_no_case("MIME")))).parse(input)
}

fn header_field_list(input: &[u8]) -> PResult<'_, Vec<String>> {
    delimited(
        char('('),
        separated_list1(space1, map(astring, |b| String::from_utf8_lossy(&b).to_string())),
        char(')'),
    )
    .parse(input)
}

fn partial_range(input: &[u8]) -> PResult<'_, (u32, u32)> {
    delimited(char('<'), separated_pair(number, char('.'), nz_number), char('>')).parse(input)
}

fn binary_item(input: &[u8]) -> PResult<'_, FetchItem> {
    let (input, _) = tag_no_case("BINARY").parse(input)?;
    let (input, peek) = map(opt(tag_no_case(".PEEK")), |p| p.is_some()).parse(input)?;
    let (input, section) =
        delimited(char('['), separated_list0(char('.'), nz_number), char(']')).parse(input)?;
    let (input, partial) = opt(partial_range).parse(input)?;
    Ok((input, FetchItem::BinarySection { section, partial, peek }))
}

fn binary_size_item(input: &[u8]) -> PResult<'_, FetchItem> {
    let (input, _) = tag_no_case("BINARY.SIZE").parse(input)?;
    let (input, section) =
        delimited(char('['), separated_list0(char('.'), nz_number), char(']')).parse(input)?;
    Ok((input, FetchItem::BinarySize { section }))
}

fn parse_search(input: &[u8]) -> PResult<'_, (Option<String>, SearchKey)> {
    let (input, _) = space1(input)?;
    let (input, charset) = opt(terminated(
        preceded(
            terminated(tag_no_case("CHARSET"), space1),
            map(astring, |b| String::from_utf8_lossy(&b).to_ascii_uppercase()),
        ),
        space1,
    ))
    .parse(input)?;
    let (input, keys) = separated_list1(space1, search_key).parse(input)?;
    let (input, _) = eof(input)?;
    let criteria =
        if keys.len() == 1 { keys.into_iter().next().unwrap() } else { SearchKey::And(keys) };
    Ok((input, (charset, criteria)))
}

fn search_key(input: &[u8]) -> PResult<'_, SearchKey> {
    alt((search_key_values, search_key_flags, search_key_compound)).parse(input)
}

fn search_key_flags(input: &[u8]) -> PResult<'_, SearchKey> {
    alt((
        value(SearchKey::All, tag_no_case("ALL")),
        value(SearchKey::Answered, tag_no_case("ANSWERED")),
        value(SearchKey::Deleted, tag_no_case("DELETED")),
        value(SearchKey::Draft, tag_no_case("DRAFT")),
        value(SearchKey::Flagged, tag_no_case("FLAGGED")),
        value(SearchKey::New, tag_no_case("NEW")),
        value(SearchKey::Old, tag_no_case("OLD")),
        value(SearchKey::Recent, tag_no_case("RECENT")),
        value(SearchKey::Seen, tag_no_case("SEEN")),
        value(SearchKey::Unanswered, tag_no_case("UNANSWERED")),
        value(SearchKey::Undeleted, tag_no_case("UNDELETED")),
        value(SearchKey::Undraft, tag_no_case("UNDRAFT")),
        value(SearchKey::Unflagged, tag_no_case("UNFLAGGED")),
        value(SearchKey::Unseen, tag_no_case("UNSEEN")),
    ))
    .parse(input)
}

fn search_key_values(input: &[u8]) -> PResult<'_, SearchKey> {
    alt((
        map(preceded(terminated(tag_no_case("BCC"), space1), astring_utf8), SearchKey::Bcc),
        map(preceded(terminated(tag_no_case("BODY"), space1), astring_utf8), SearchKey::Body),
        map(preceded(terminated(tag_no_case("CC"), space1), astring_utf8), SearchKey::Cc),
        map(preceded(terminated(tag_no_case("FROM"), space1), astring_utf8), SearchKey::From),
        map(
            preceded(terminated(tag_no_case("SUBJECT"), space1), astring_utf8),
            SearchKey::Subject,
        ),
        map(preceded(terminated(tag_no_case("TEXT"), space1), astring_utf8), SearchKey::Text),
        map(preceded(terminated(tag_no_case("TO"), space1), astring_utf8), SearchKey::To),
        map(
            preceded(
                terminated(tag_no_case("HEADER"), space1),
                separated_pair(astring_utf8, space1, astring_utf8),
            ),
            |(name, pattern)| SearchKey::Header(name, pattern),
        ),
        map(
            preceded(terminated(tag_no_case("KEYWORD"), space1), astring_utf8),
            SearchKey::Keyword,
        ),
        map(
            preceded(terminated(tag_no_case("UNKEYWORD"), space1), astring_utf8),
            SearchKey::Unkeyword,
        ),
        map(preceded(terminated(tag_no_case("LARGER"), space1), number), SearchKey::Larger),
        map(preceded(terminated(tag_no_case("SMALLER"), space1), number), SearchKey::Smaller),
        map(
            preceded(terminated(tag_no_case("SENTBEFORE"), space1), search_date),
            SearchKey::SentBefore,
        ),
        map(preceded(terminated(tag_no_case("SENTON"), space1), search_date), SearchKey::SentOn),
        map(
            preceded(terminated(tag_no_case("SENTSINCE"), space1), search_date),
            SearchKey::SentSince,
        ),
        map(preceded(terminated(tag_no_case("BEFORE"), space1), search_date), SearchKey::Before),
        map(preceded(terminated(tag_no_case("ON"), space1), search_date), SearchKey::On),
        map(preceded(terminated(tag_no_case("SINCE"), space1), search_date), SearchKey::Since),
        map(preceded(terminated(tag_no_case("UID"), space1), sequence_set), SearchKey::Uid),
    ))
    .parse(input)
}

fn search_key_compound(input: &[u8]) -> PResult<'_, SearchKey> {
    alt((
        map(preceded(terminated(tag_no_case("NOT"), space1), search_key), |key| {
            SearchKey::Not(Box::new(key))
        }),
        map(
            preceded(
                terminated(tag_no_case("OR"), space1),
                separated_pair(search_key, space1, search_key),
            ),
            |(a, b)| SearchKey::Or(Box::new(a), Box::new(b)),
        ),
        map(delimited(char('('), separated_list1(space1, search_key), char(')')), |keys| {
            if keys.len() == 1 {
                keys.into_iter().next().unwrap()
            } else {
                SearchKey::And(keys)
            }
        }),
        map(sequence_set, SearchKey::SequenceSet),
    ))
    .parse(input)
}

fn parse_uid(input: &[u8]) -> PResult<'_, ImapCommand> {
    let (input, _) = space1(input)?;
    let (input, name) = parse_command_name(input)?;
    let name = String::from_utf8_lossy(name).to_ascii_uppercase();
    let (input, command) = match name.as_str() {
        "FETCH" => {
            let (input, (sequence_set, items)) = parse_fetch(input)?;
            (input, UidCommand::Fetch { sequence_set, items })
        }
        "SEARCH" => {
            let (input, (charset, criteria)) = parse_search(input)?;
            (input, UidCommand::Search { charset, criteria })
        }
        "STORE" => {
            let (input, (sequence_set, mode, silent, flags)) = parse_store(input)?;
            (input, UidCommand::Store { sequence_set, mode, silent, flags })
        }
        "COPY" => {
            let (input, (sequence_set, mailbox)) = parse_copy(input)?;
            (input, UidCommand::Copy { sequence_set, mailbox })
        }
        "MOVE" => {
            let (input, (sequence_set, mailbox)) = parse_copy(input)?;
            (input, UidCommand::Move { sequence_set, mailbox })
        }
        "EXPUNGE" => {
            let (input, _) = space1(input)?;
            let (input, sequence_set) = sequence_set(input)?;
            let (input, _) = eof(input)?;
            (input, UidCommand::Expunge { sequence_set })
        }
        _ => {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )));
        }
    };
    Ok((input, ImapCommand::Uid { command: Box::new(command) }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(line: &str) -> (String, ImapCommand) {
        parse_command(line.as_bytes()).unwrap()
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse_ok("a1 CAPABILITY"), ("a1".into(), ImapCommand::Capability));
        assert_eq!(parse_ok("a2 noop"), ("a2".into(), ImapCommand::Noop));
        assert_eq!(parse_ok("xyz.3 LOGOUT"), ("xyz.3".into(), ImapCommand::Logout));
    }

    #[test]
    fn test_unknown_command_keeps_tag() {
        let (tag, cmd) = parse_ok("a1 FROBNICATE stuff");
        assert_eq!(tag, "a1");
        assert_eq!(cmd, ImapCommand::Unknown { command: "FROBNICATE".into() });
    }

    #[test]
    fn test_trailing_garbage_is_bad() {
        let err = parse_command(b"a1 NOOP extra").unwrap_err();
        assert_eq!(err.tag.as_deref(), Some("a1"));
    }

    #[test]
    fn test_login_quoted_and_literal() {
        let (_, cmd) = parse_ok("a1 LOGIN \"us er\" pass");
        assert_eq!(cmd, ImapCommand::Login { username: "us er".into(), password: "pass".into() });

        // LITERAL+ framed buffer: the decoder has inlined the payloads
        let buf = b"a1 LOGIN {4+}\r\nuser {4+}\r\npass";
        let (_, cmd) = parse_command(buf).unwrap();
        assert_eq!(cmd, ImapCommand::Login { username: "user".into(), password: "pass".into() });
    }

    #[test]
    fn test_select_mutf7() {
        let (_, cmd) = parse_ok("a1 SELECT Entw&APw-rfe");
        assert_eq!(cmd, ImapCommand::Select { mailbox: "Entwürfe".into() });

        let (_, cmd) = parse_ok("a2 SELECT inbox");
        assert_eq!(cmd, ImapCommand::Select { mailbox: "INBOX".into() });
    }

    #[test]
    fn test_fetch_items() {
        let (_, cmd) = parse_ok("a1 FETCH 1:5 (FLAGS UID RFC822.SIZE)");
        assert_eq!(
            cmd,
            ImapCommand::Fetch {
                sequence_set: SequenceSet {
                    ranges: vec![SequenceRange::Range(SeqItem::Number(1), SeqItem::Number(5))]
                },
                items: vec![FetchItem::Flags, FetchItem::Uid, FetchItem::Rfc822Size],
            }
        );
    }

    #[test]
    fn test_fetch_macro_and_body_section() {
        let (_, cmd) = parse_ok("a1 FETCH 1 FAST");
        assert!(matches!(cmd, ImapCommand::Fetch { ref items, .. }
            if items == &[FetchItem::Flags, FetchItem::InternalDate, FetchItem::Rfc822Size]));

        let (_, cmd) = parse_ok("a1 FETCH 1 BODY.PEEK[HEADER.FIELDS (From To)]<0.100>");
        match cmd {
            ImapCommand::Fetch { items, .. } => {
                assert_eq!(items.len(), 1);
                match &items[0] {
                    FetchItem::BodySection { section, partial, peek } => {
                        assert!(peek);
                        assert_eq!(*partial, Some((0, 100)));
                        assert_eq!(
                            section.text,
                            Some(SectionText::HeaderFields {
                                negate: false,
                                fields: vec!["From".into(), "To".into()]
                            })
                        );
                    }
                    other => panic!("unexpected item {other:?}"),
                }
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_store_silent() {
        let (_, cmd) = parse_ok("a1 STORE 2:4 +FLAGS.SILENT (\\Deleted)");
        assert_eq!(
            cmd,
            ImapCommand::Store {
                sequence_set: SequenceSet {
                    ranges: vec![SequenceRange::Range(SeqItem::Number(2), SeqItem::Number(4))]
                },
                mode: StoreMode::Add,
                silent: true,
                flags: vec![Flag::Deleted],
            }
        );
    }

    #[test]
    fn test_uid_commands() {
        let (_, cmd) = parse_ok("a1 UID FETCH 1:* (FLAGS)");
        assert!(matches!(cmd, ImapCommand::Uid { .. }));

        let (_, cmd) = parse_ok("a1 UID EXPUNGE 3:5");
        match cmd {
            ImapCommand::Uid { command } => {
                assert!(matches!(*command, UidCommand::Expunge { .. }))
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_search_keys() {
        let (_, cmd) = parse_ok("a1 SEARCH UNSEEN LARGER 1024 FROM \"alice\"");
        match cmd {
            ImapCommand::Search { charset: None, criteria: SearchKey::And(keys) } => {
                assert_eq!(keys.len(), 3);
                assert_eq!(keys[0], SearchKey::Unseen);
                assert_eq!(keys[1], SearchKey::Larger(1024));
                assert_eq!(keys[2], SearchKey::From("alice".into()));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let (_, cmd) = parse_ok("a2 SEARCH CHARSET UTF-8 OR SEEN NOT DELETED");
        match cmd {
            ImapCommand::Search { charset: Some(cs), criteria: SearchKey::Or(a, b) } => {
                assert_eq!(cs, "UTF-8");
                assert_eq!(*a, SearchKey::Seen);
                assert_eq!(*b, SearchKey::Not(Box::new(SearchKey::Deleted)));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let (_, cmd) = parse_ok("a3 SEARCH SINCE 1-Feb-1994");
        match cmd {
            ImapCommand::Search { criteria: SearchKey::Since(date), .. } => {
                assert_eq!(date, NaiveDate::from_ymd_opt(1994, 2, 1).unwrap());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_append_framed() {
        let mut decoder = CommandDecoder::new(1024);
        let result = decoder.feed_line(b"a1 APPEND INBOX (\\Seen) {11}");
        assert_eq!(result, FrameResult::NeedLiteral { count: 11, sync: true });
        decoder.feed_literal(b"Hello\r\n\r\nx!");
        assert_eq!(decoder.feed_line(b""), FrameResult::Complete);

        let buf = decoder.take();
        let (tag, cmd) = parse_command(&buf).unwrap();
        assert_eq!(tag, "a1");
        match cmd {
            ImapCommand::Append { mailbox, flags, message, literal8, .. } => {
                assert_eq!(mailbox, "INBOX");
                assert_eq!(flags, vec![Flag::Seen]);
                assert_eq!(message, b"Hello\r\n\r\nx!");
                assert!(!literal8);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_append_literal8() {
        let mut decoder = CommandDecoder::new(1024);
        assert_eq!(
            decoder.feed_line(b"a1 APPEND INBOX ~{4+}"),
            FrameResult::NeedLiteral { count: 4, sync: false }
        );
        decoder.feed_literal(&[0x00, 0x01, 0x02, 0x03]);
        assert_eq!(decoder.feed_line(b""), FrameResult::Complete);
        let buf = decoder.take();
        let (_, cmd) = parse_command(&buf).unwrap();
        assert!(matches!(cmd, ImapCommand::Append { literal8: true, .. }));
    }

    #[test]
    fn test_literal_framing_edge_cases() {
        // Quoted brace does not trigger literal framing
        assert_eq!(trailing_literal(b"a1 LOGIN \"user{3}\" pass"), None);
        assert_eq!(trailing_literal(b"a1 LOGIN {3}"), Some((3, true)));
        assert_eq!(trailing_literal(b"a1 LOGIN {3+}"), Some((3, false)));
        assert_eq!(trailing_literal(b"a1 APPEND x ~{10}"), Some((10, true)));
        assert_eq!(trailing_literal(b"a1 LOGIN {x}"), None);
    }

    #[test]
    fn test_oversized_literal() {
        let mut decoder = CommandDecoder::new(16);
        assert_eq!(
            decoder.feed_line(b"a1 APPEND INBOX {1000000}"),
            FrameResult::TooLarge { count: 1_000_000, sync: true }
        );
    }

    #[test]
    fn test_id_command() {
        let (_, cmd) = parse_ok("a1 ID NIL");
        assert_eq!(cmd, ImapCommand::Id { params: None });

        let (_, cmd) = parse_ok("a2 ID (\"name\" \"Thunderbird\" \"version\" NIL)");
        assert_eq!(
            cmd,
            ImapCommand::Id {
                params: Some(vec![
                    ("name".into(), Some("Thunderbird".into())),
                    ("version".into(), None),
                ])
            }
        );
    }

    #[test]
    fn test_status_items() {
        let (_, cmd) = parse_ok("a1 STATUS INBOX (MESSAGES UIDNEXT UNSEEN)");
        assert_eq!(
            cmd,
            ImapCommand::Status {
                mailbox: "INBOX".into(),
                items: vec![StatusItem::Messages, StatusItem::UidNext, StatusItem::Unseen],
            }
        );
    }

    #[test]
    fn test_compress() {
        let (_, cmd) = parse_ok("a1 COMPRESS DEFLATE");
        assert_eq!(cmd, ImapCommand::Compress { algorithm: "DEFLATE".into() });
    }
}
