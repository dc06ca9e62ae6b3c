use mail_parser::{Addr, Message, MessageParser, MimeHeaders, PartType};

use crate::protocol::imap::codec::Flag;
use crate::protocol::imap::command::state::{BodySection, FetchItem, SectionText};
use crate::protocol::imap::response::{Address, Envelope, FetchData};
use crate::storage::FetchRow;

/// Render the requested attributes for one message, preserving request
/// order. `flags` already carries the session's `\Recent` merge. UID is
/// appended for UID FETCH even when not requested.
pub fn build_fetch_items(
    requested: &[FetchItem],
    row: &FetchRow,
    flags: Vec<Flag>,
    force_uid: bool,
) -> Vec<FetchData> {
    let raw = row.body.as_slice();
    let parsed = MessageParser::default().parse(raw);

    let mut items = Vec::with_capacity(requested.len() + 1);
    let mut uid_present = false;

    for item in requested {
        match item {
            FetchItem::Uid => {
                uid_present = true;
                items.push(FetchData::Uid(row.uid));
            }
            FetchItem::Flags => items.push(FetchData::Flags(flags.clone())),
            FetchItem::InternalDate => items.push(FetchData::InternalDate(row.internal_date)),
            FetchItem::Rfc822Size => items.push(FetchData::Rfc822Size(raw.len() as u32)),
            FetchItem::Rfc822 => {
                items.push(FetchData::Rfc822 { label: "RFC822", data: raw.to_vec() })
            }
            FetchItem::Rfc822Header => items.push(FetchData::Rfc822 {
                label: "RFC822.HEADER",
                data: header_bytes(raw).to_vec(),
            }),
            FetchItem::Rfc822Text => items.push(FetchData::Rfc822 {
                label: "RFC822.TEXT",
                data: text_bytes(raw).to_vec(),
            }),
            FetchItem::Envelope => {
                items.push(FetchData::Envelope(build_envelope(parsed.as_ref())))
            }
            FetchItem::Body => items.push(FetchData::BodyStructure {
                label: "BODY",
                raw: body_structure(parsed.as_ref(), raw),
            }),
            FetchItem::BodyStructure => items.push(FetchData::BodyStructure {
                label: "BODYSTRUCTURE",
                raw: body_structure(parsed.as_ref(), raw),
            }),
            FetchItem::BodySection { section, partial, peek: _ } => {
                let data = extract_section(parsed.as_ref(), raw, section)
                    .map(|bytes| apply_partial(bytes, *partial));
                items.push(FetchData::BodySection {
                    spec: section_spec(section, *partial),
                    data,
                });
            }
            FetchItem::BinarySection { section, partial, peek: _ } => {
                let plain = BodySection { parts: section.clone(), text: None };
                let data = extract_section(parsed.as_ref(), raw, &plain)
                    .map(|bytes| apply_partial(bytes, *partial));
                items.push(FetchData::Binary {
                    spec: binary_spec("BINARY", section, *partial),
                    data,
                });
            }
            FetchItem::BinarySize { section } => {
                let plain = BodySection { parts: section.clone(), text: None };
                let size = extract_section(parsed.as_ref(), raw, &plain)
                    .map(|bytes| bytes.len() as u32)
                    .unwrap_or(0);
                items.push(FetchData::BinarySize {
                    spec: binary_spec("BINARY.SIZE", section, None),
                    size,
                });
            }
        }
    }

    if force_uid && !uid_present {
        items.push(FetchData::Uid(row.uid));
    }
    items
}

/// Header portion of the raw message, including the blank separator.
fn header_bytes(raw: &[u8]) -> &[u8] {
    match raw.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => &raw[..pos + 4],
        None => raw,
    }
}

fn text_bytes(raw: &[u8]) -> &[u8] {
    match raw.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => &raw[pos + 4..],
        None => &[],
    }
}

fn apply_partial(bytes: Vec<u8>, partial: Option<(u32, u32)>) -> Vec<u8> {
    match partial {
        None => bytes,
        Some((start, len)) => {
            let start = (start as usize).min(bytes.len());
            let end = (start + len as usize).min(bytes.len());
            bytes[start..end].to_vec()
        }
    }
}

/// The response echo of a BODY[...] request; the partial echoes only
/// the origin octet.
fn section_spec(section: &BodySection, partial: Option<(u32, u32)>) -> String {
    let mut inner = section.parts.iter().map(u32::to_string).collect::<Vec<_>>().join(".");
    if let Some(text) = &section.text {
        if !inner.is_empty() {
            inner.push('.');
        }
        match text {
            SectionText::Header => inner.push_str("HEADER"),
            SectionText::HeaderFields { negate, fields } => {
                inner.push_str(if *negate { "HEADER.FIELDS.NOT (" } else { "HEADER.FIELDS (" });
                inner.push_str(&fields.join(" ").to_ascii_uppercase());
                inner.push(')');
            }
            SectionText::Text => inner.push_str("TEXT"),
            SectionText::Mime => inner.push_str("MIME"),
        }
    }
    match partial {
        Some((start, _)) => format!("BODY[{}]<{}>", inner, start),
        None => format!("BODY[{}]", inner),
    }
}

fn binary_spec(label: &str, section: &[u32], partial: Option<(u32, u32)>) -> String {
    let inner = section.iter().map(u32::to_string).collect::<Vec<_>>().join(".");
    match partial {
        Some((start, _)) => format!("{}[{}]<{}>", label, inner, start),
        None => format!("{}[{}]", label, inner),
    }
}

/// Extract a BODY[...] section from the message. Part paths address the
/// MIME tree; text specifiers on nested parts beyond their decoded
/// contents are not resolved and yield NIL.
fn extract_section(parsed: Option<&Message>, raw: &[u8], section: &BodySection) -> Option<Vec<u8>> {
    if section.parts.is_empty() {
        return match &section.text {
            None => Some(raw.to_vec()),
            Some(SectionText::Header) => Some(header_bytes(raw).to_vec()),
            Some(SectionText::Text) => Some(text_bytes(raw).to_vec()),
            Some(SectionText::HeaderFields { negate, fields }) => {
                Some(filter_header_fields(header_bytes(raw), fields, *negate))
            }
            Some(SectionText::Mime) => None,
        };
    }

    let message = parsed?;
    let part_id = resolve_part(message, &section.parts)?;
    let part = message.part(part_id)?;
    match &section.text {
        None => Some(part.contents().to_vec()),
        // Nested header/text specifiers are not reconstructed from the
        // decoded part.
        _ => None,
    }
}

/// Walk a dotted part path through the MIME tree. Part number n of a
/// non-multipart message addresses the message itself when n == 1.
fn resolve_part(message: &Message, path: &[u32]) -> Option<u32> {
    let mut current: u32 = 0;
    for (depth, &index) in path.iter().enumerate() {
        let part = message.part(current)?;
        match &part.body {
            PartType::Multipart(children) => {
                current = *children.get((index - 1) as usize)?;
            }
            PartType::Message(child) => {
                current = *child;
                // Re-run this path element against the embedded message.
                let embedded = message.part(current)?;
                if let PartType::Multipart(children) = &embedded.body {
                    current = *children.get((index - 1) as usize)?;
                }
            }
            _ => {
                // Leaf: only "1" at the final depth addresses it.
                if index == 1 && depth == path.len() - 1 {
                    return Some(current);
                }
                return None;
            }
        }
    }
    Some(current)
}

/// Keep (or drop, when negated) the named header fields, preserving the
/// original raw lines including continuations.
fn filter_header_fields(header: &[u8], fields: &[String], negate: bool) -> Vec<u8> {
    let mut out = Vec::new();
    let mut keep = false;
    for line in split_header_lines(header) {
        let is_continuation = line.starts_with(b" ") || line.starts_with(b"\t");
        if !is_continuation {
            let name = line.split(|&c| c == b':').next().unwrap_or(b"");
            let name = String::from_utf8_lossy(name);
            let listed = fields.iter().any(|f| f.eq_ignore_ascii_case(name.trim()));
            keep = listed != negate;
        }
        if keep && !line.is_empty() {
            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn split_header_lines(header: &[u8]) -> impl Iterator<Item = &[u8]> {
    header.split(|&c| c == b'\n').map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

fn convert_addresses(list: Option<&mail_parser::Address>) -> Vec<Address> {
    fn convert(addr: &Addr) -> Address {
        let (mailbox, host) = match addr.address() {
            Some(email) => match email.split_once('@') {
                Some((mailbox, host)) => (Some(mailbox.to_string()), Some(host.to_string())),
                None => (Some(email.to_string()), None),
            },
            None => (None, None),
        };
        Address { name: addr.name().map(str::to_string), mailbox, host }
    }

    list.map(|address| address.iter().map(convert).collect()).unwrap_or_default()
}

fn build_envelope(parsed: Option<&Message>) -> Envelope {
    let Some(message) = parsed else {
        return Envelope::default();
    };

    let header_text = |name: &str| -> Option<String> {
        message.header_raw(name).map(|raw| raw.trim().to_string())
    };

    let from = convert_addresses(message.from());
    let sender = {
        let sender = convert_addresses(message.sender());
        if sender.is_empty() {
            from.clone()
        } else {
            sender
        }
    };
    let reply_to = {
        let reply_to = convert_addresses(message.reply_to());
        if reply_to.is_empty() {
            from.clone()
        } else {
            reply_to
        }
    };

    Envelope {
        date: header_text("Date"),
        subject: header_text("Subject"),
        from,
        sender,
        reply_to,
        to: convert_addresses(message.to()),
        cc: convert_addresses(message.cc()),
        bcc: convert_addresses(message.bcc()),
        in_reply_to: header_text("In-Reply-To"),
        message_id: header_text("Message-ID"),
    }
}

/// Render the non-extensible BODY structure form. Multiparts nest as
/// `(<part>... "subtype")`; leaves follow RFC 3501 §7.4.2 basic fields.
fn body_structure(parsed: Option<&Message>, raw: &[u8]) -> String {
    match parsed {
        Some(message) => render_part(message, 0),
        None => format!(
            "(\"text\" \"plain\" (\"charset\" \"us-ascii\") NIL NIL \"7bit\" {} {})",
            raw.len(),
            raw.iter().filter(|&&c| c == b'\n').count()
        ),
    }
}

fn render_part(message: &Message, part_id: u32) -> String {
    let Some(part) = message.part(part_id) else {
        return "NIL".to_string();
    };

    if let PartType::Multipart(children) = &part.body {
        let inner: Vec<String> = children.iter().map(|&c| render_part(message, c)).collect();
        let subtype = part
            .content_type()
            .and_then(|ct| ct.subtype())
            .unwrap_or("mixed")
            .to_ascii_lowercase();
        return format!("({} \"{}\")", inner.join(""), subtype);
    }

    let (ctype, subtype) = match part.content_type() {
        Some(ct) => (
            ct.ctype().to_ascii_lowercase(),
            ct.subtype().unwrap_or("plain").to_ascii_lowercase(),
        ),
        None => ("text".to_string(), "plain".to_string()),
    };
    let charset = part
        .content_type()
        .and_then(|ct| ct.attribute("charset"))
        .unwrap_or("us-ascii")
        .to_ascii_lowercase();
    let encoding = part.content_transfer_encoding().unwrap_or("7bit").to_ascii_lowercase();
    let contents = part.contents();
    let size = contents.len();

    if ctype == "text" {
        let lines = contents.iter().filter(|&&c| c == b'\n').count();
        format!(
            "(\"{}\" \"{}\" (\"charset\" \"{}\") NIL NIL \"{}\" {} {})",
            ctype, subtype, charset, encoding, size, lines
        )
    } else {
        format!(
            "(\"{}\" \"{}\" (\"charset\" \"{}\") NIL NIL \"{}\" {})",
            ctype, subtype, charset, encoding, size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;

    fn row(body: &[u8]) -> FetchRow {
        FetchRow {
            uid: 7,
            flags: vec![Flag::Seen],
            internal_date: Utc::now().fixed_offset(),
            body: Arc::new(body.to_vec()),
        }
    }

    const SAMPLE: &[u8] = b"From: Alice <alice@example.org>\r\nTo: bob@example.org\r\nSubject: Hello\r\nMessage-ID: <m1@example.org>\r\nDate: Mon, 7 Feb 1994 21:52:25 -0800\r\n\r\nThe body.\r\n";

    #[test]
    fn test_uid_fetch_always_includes_uid() {
        let items = build_fetch_items(&[FetchItem::Flags], &row(SAMPLE), vec![Flag::Seen], true);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], FetchData::Uid(7));

        // Explicit UID is not duplicated
        let items = build_fetch_items(
            &[FetchItem::Uid, FetchItem::Flags],
            &row(SAMPLE),
            vec![Flag::Seen],
            true,
        );
        assert_eq!(items.iter().filter(|i| matches!(i, FetchData::Uid(_))).count(), 1);
    }

    #[test]
    fn test_request_order_preserved() {
        let items = build_fetch_items(
            &[FetchItem::Rfc822Size, FetchItem::Flags, FetchItem::InternalDate],
            &row(SAMPLE),
            vec![],
            false,
        );
        assert!(matches!(items[0], FetchData::Rfc822Size(_)));
        assert!(matches!(items[1], FetchData::Flags(_)));
        assert!(matches!(items[2], FetchData::InternalDate(_)));
    }

    #[test]
    fn test_header_and_text_sections() {
        let items = build_fetch_items(
            &[
                FetchItem::BodySection {
                    section: BodySection { parts: vec![], text: Some(SectionText::Header) },
                    partial: None,
                    peek: true,
                },
                FetchItem::BodySection {
                    section: BodySection { parts: vec![], text: Some(SectionText::Text) },
                    partial: None,
                    peek: true,
                },
            ],
            &row(SAMPLE),
            vec![],
            false,
        );
        match &items[0] {
            FetchData::BodySection { spec, data } => {
                assert_eq!(spec, "BODY[HEADER]");
                assert!(data.as_ref().unwrap().ends_with(b"\r\n\r\n"));
            }
            other => panic!("unexpected item {other:?}"),
        }
        match &items[1] {
            FetchData::BodySection { spec, data } => {
                assert_eq!(spec, "BODY[TEXT]");
                assert_eq!(data.as_deref(), Some(b"The body.\r\n".as_slice()));
            }
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn test_header_fields_filter() {
        let filtered = filter_header_fields(header_bytes(SAMPLE), &["subject".into()], false);
        assert_eq!(filtered, b"Subject: Hello\r\n\r\n");

        let negated = filter_header_fields(header_bytes(SAMPLE), &["subject".into()], true);
        assert!(negated.starts_with(b"From: "));
        assert!(!negated.windows(8).any(|w| w == b"Subject:"));
    }

    #[test]
    fn test_partial_slicing() {
        assert_eq!(apply_partial(b"abcdef".to_vec(), Some((2, 3))), b"cde".to_vec());
        assert_eq!(apply_partial(b"abc".to_vec(), Some((10, 3))), b"".to_vec());
        let items = build_fetch_items(
            &[FetchItem::BodySection {
                section: BodySection::default(),
                partial: Some((0, 5)),
                peek: true,
            }],
            &row(SAMPLE),
            vec![],
            false,
        );
        match &items[0] {
            FetchData::BodySection { spec, data } => {
                assert_eq!(spec, "BODY[]<0>");
                assert_eq!(data.as_ref().unwrap().len(), 5);
            }
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn test_envelope_from_sample() {
        let items = build_fetch_items(&[FetchItem::Envelope], &row(SAMPLE), vec![], false);
        match &items[0] {
            FetchData::Envelope(envelope) => {
                assert_eq!(envelope.subject.as_deref(), Some("Hello"));
                assert_eq!(envelope.from.len(), 1);
                assert_eq!(envelope.from[0].mailbox.as_deref(), Some("alice"));
                assert_eq!(envelope.from[0].host.as_deref(), Some("example.org"));
                // sender/reply-to default to from
                assert_eq!(envelope.sender, envelope.from);
            }
            other => panic!("unexpected item {other:?}"),
        }
    }
}
