use base64::engine::general_purpose::STANDARD_NO_PAD as B64_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, FixedOffset, NaiveDate};
use std::fmt;

/// Lexical error from a primitive decoder. The offset is relative to the
/// start of the slice handed to the decoder so the command parser can
/// rebase it against the full line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecError {
    pub offset: usize,
    pub message: String,
}

impl CodecError {
    pub fn new(offset: usize, message: impl Into<String>) -> Self {
        Self { offset, message: message.into() }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.offset)
    }
}

impl std::error::Error for CodecError {}

/// A message flag: one of the RFC 3501 system flags or a client keyword.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    Answered,
    Flagged,
    Deleted,
    Seen,
    Draft,
    Recent,
    Keyword(String),
}

impl Flag {
    /// Parse a single flag token (`\Seen`, `\Answered`, `Keyword`).
    pub fn parse(token: &str) -> Option<Flag> {
        if let Some(word) = token.strip_prefix('\\') {
            match word.to_ascii_uppercase().as_str() {
                "ANSWERED" => Some(Flag::Answered),
                "FLAGGED" => Some(Flag::Flagged),
                "DELETED" => Some(Flag::Deleted),
                "SEEN" => Some(Flag::Seen),
                "DRAFT" => Some(Flag::Draft),
                "RECENT" => Some(Flag::Recent),
                _ => None,
            }
        } else if !token.is_empty() && token.bytes().all(is_atom_char) {
            Some(Flag::Keyword(token.to_string()))
        } else {
            None
        }
    }

    /// The five client-mutable system flags, in advertisement order.
    pub fn system_flags() -> [Flag; 5] {
        [Flag::Answered, Flag::Flagged, Flag::Deleted, Flag::Seen, Flag::Draft]
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Recent => write!(f, "\\Recent"),
            Flag::Keyword(word) => write!(f, "{}", word),
        }
    }
}

/// Render a flag set as a parenthesized list, system flags first.
pub fn encode_flag_list<'a>(flags: impl IntoIterator<Item = &'a Flag>) -> String {
    let mut sorted: Vec<&Flag> = flags.into_iter().collect();
    sorted.sort();
    let inner: Vec<String> = sorted.iter().map(|f| f.to_string()).collect();
    format!("({})", inner.join(" "))
}

pub fn is_atom_char(c: u8) -> bool {
    c > 0x1f
        && c < 0x7f
        && !matches!(c, b'(' | b')' | b'{' | b' ' | b'%' | b'*' | b'"' | b'\\' | b']')
}

fn is_quoted_safe(c: u8) -> bool {
    c >= 0x20 && c < 0x7f && c != b'"' && c != b'\\'
}

/// How a string must be rendered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringForm {
    Atom,
    Quoted,
    Literal,
}

pub fn classify_string(bytes: &[u8]) -> StringForm {
    if !bytes.is_empty() && bytes.iter().all(|&c| is_atom_char(c)) {
        StringForm::Atom
    } else if bytes.iter().all(|&c| c >= 0x20 && c < 0x7f) {
        StringForm::Quoted
    } else {
        StringForm::Literal
    }
}

/// Encode an astring: ATOM when possible, QUOTED for printable ASCII,
/// LITERAL otherwise. Appends to `out`, which may already hold the
/// response prefix.
pub fn encode_string(out: &mut Vec<u8>, bytes: &[u8]) {
    match classify_string(bytes) {
        StringForm::Atom => out.extend_from_slice(bytes),
        StringForm::Quoted => encode_quoted(out, bytes),
        StringForm::Literal => encode_literal(out, bytes),
    }
}

pub fn encode_quoted(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(b'"');
    for &c in bytes {
        if c == b'"' || c == b'\\' {
            out.push(b'\\');
        }
        out.push(c);
    }
    out.push(b'"');
}

/// Binary payloads always go out as a literal.
pub fn encode_literal(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(format!("{{{}}}\r\n", bytes.len()).as_bytes());
    out.extend_from_slice(bytes);
}

/// NIL or a string. nstring has no atom form, so printable values are
/// always quoted.
pub fn encode_nstring(out: &mut Vec<u8>, value: Option<&[u8]>) {
    match value {
        Some(bytes) => match classify_string(bytes) {
            StringForm::Literal => encode_literal(out, bytes),
            _ => encode_quoted(out, bytes),
        },
        None => out.extend_from_slice(b"NIL"),
    }
}

/// Decode the body of a quoted string (between the DQUOTEs), resolving
/// `\"` and `\\` escapes. Rejects bare CR/LF and stray backslashes.
pub fn decode_quoted(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                match bytes.get(i + 1) {
                    Some(&c @ (b'"' | b'\\')) => out.push(c),
                    _ => return Err(CodecError::new(i, "invalid quoted-string escape")),
                }
                i += 2;
            }
            b'\r' | b'\n' => return Err(CodecError::new(i, "CR/LF inside quoted string")),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Parse an IMAP date, `dd-Mon-yyyy`, day 1 or 2 digits.
pub fn parse_date(s: &str) -> Result<NaiveDate, CodecError> {
    let parts: Vec<&str> = s.splitn(3, '-').collect();
    if parts.len() != 3 {
        return Err(CodecError::new(0, "malformed date"));
    }
    let day: u32 = parts[0]
        .trim()
        .parse()
        .map_err(|_| CodecError::new(0, "malformed date day"))?;
    let month = MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(parts[1]))
        .ok_or_else(|| CodecError::new(0, "unknown month name"))? as u32
        + 1;
    let year: i32 = parts[2]
        .parse()
        .map_err(|_| CodecError::new(0, "malformed date year"))?;
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| CodecError::new(0, "date out of range"))
}

/// Parse an IMAP date-time, `dd-Mon-yyyy HH:MM:SS +ZZZZ` (day may be
/// space-padded, as inside the quoted form).
pub fn parse_datetime(s: &str) -> Result<DateTime<FixedOffset>, CodecError> {
    DateTime::parse_from_str(s.trim_start(), "%d-%b-%Y %H:%M:%S %z")
        .map_err(|_| CodecError::new(0, "malformed date-time"))
}

/// Format an INTERNALDATE in the canonical quoted form, with the
/// fixed-width space-padded day.
pub fn format_datetime(dt: &DateTime<FixedOffset>) -> String {
    dt.format("%e-%b-%Y %H:%M:%S %z").to_string()
}

pub fn format_date(date: &NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

/// Encode a mailbox name using modified UTF-7 (RFC 3501 §5.1.3).
///
/// Printable ASCII passes through, `&` becomes `&-`, and each maximal
/// run of other characters becomes `&<mbase64>-` where mbase64 is
/// unpadded base64 of the UTF-16BE encoding with `,` in place of `/`.
pub fn encode_mailbox_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut run = String::new();

    let mut flush_run = |out: &mut String, run: &mut String| {
        if run.is_empty() {
            return;
        }
        let mut units = Vec::with_capacity(run.len() * 2);
        for unit in run.encode_utf16() {
            units.extend_from_slice(&unit.to_be_bytes());
        }
        out.push('&');
        out.push_str(&B64_NO_PAD.encode(&units).replace('/', ","));
        out.push('-');
        run.clear();
    };

    for c in name.chars() {
        if c == '&' {
            flush_run(&mut out, &mut run);
            out.push_str("&-");
        } else if (' '..='\u{7e}').contains(&c) {
            flush_run(&mut out, &mut run);
            out.push(c);
        } else {
            run.push(c);
        }
    }
    flush_run(&mut out, &mut run);
    out
}

/// Decode a modified UTF-7 mailbox name. Fails on truncated or
/// non-canonical base64 sections.
pub fn decode_mailbox_name(encoded: &str) -> Result<String, CodecError> {
    let bytes = encoded.as_bytes();
    let mut out = String::with_capacity(encoded.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'&' {
            out.push(bytes[i] as char);
            i += 1;
            continue;
        }
        let end = encoded[i + 1..]
            .find('-')
            .map(|p| i + 1 + p)
            .ok_or_else(|| CodecError::new(i, "unterminated base64 section"))?;
        let section = &encoded[i + 1..end];
        if section.is_empty() {
            out.push('&');
        } else {
            let b64 = section.replace(',', "/");
            let raw = B64_NO_PAD
                .decode(b64.as_bytes())
                .map_err(|_| CodecError::new(i, "invalid base64 section"))?;
            if raw.len() % 2 != 0 {
                return Err(CodecError::new(i, "odd-length UTF-16 section"));
            }
            let units: Vec<u16> = raw
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            for decoded in char::decode_utf16(units.into_iter()) {
                let c = decoded.map_err(|_| CodecError::new(i, "invalid UTF-16 section"))?;
                out.push(c);
            }
        }
        i = end + 1;
    }
    Ok(out)
}

/// INBOX is case-insensitive everywhere mailbox names appear.
pub fn normalize_mailbox_name(name: &str) -> String {
    if name.eq_ignore_ascii_case("INBOX") {
        "INBOX".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_flag_parse_roundtrip() {
        for token in ["\\Seen", "\\Answered", "\\Flagged", "\\Deleted", "\\Draft", "\\Recent"] {
            let flag = Flag::parse(token).unwrap();
            assert_eq!(flag.to_string(), token);
        }
        assert_eq!(Flag::parse("$Forwarded"), Some(Flag::Keyword("$Forwarded".into())));
        assert_eq!(Flag::parse("\\Bogus"), None);
        assert_eq!(Flag::parse("has space"), None);
    }

    #[test]
    fn test_string_classification() {
        assert_eq!(classify_string(b"INBOX"), StringForm::Atom);
        assert_eq!(classify_string(b"hello world"), StringForm::Quoted);
        assert_eq!(classify_string(b""), StringForm::Quoted);
        assert_eq!(classify_string(b"line\r\nbreak"), StringForm::Literal);
        assert_eq!(classify_string(&[0xff, 0x00]), StringForm::Literal);
    }

    #[test]
    fn test_quoted_escapes() {
        let mut out = Vec::new();
        encode_quoted(&mut out, b"say \"hi\" \\ bye");
        assert_eq!(out, b"\"say \\\"hi\\\" \\\\ bye\"");

        let decoded = decode_quoted(b"say \\\"hi\\\" \\\\ bye").unwrap();
        assert_eq!(decoded, b"say \"hi\" \\ bye");
        assert!(decode_quoted(b"broken\\x").is_err());
    }

    #[test]
    fn test_literal_encode() {
        let mut out = Vec::new();
        encode_literal(&mut out, b"Hello\r\n");
        assert_eq!(out, b"{7}\r\nHello\r\n");
    }

    #[test]
    fn test_date_parsing() {
        let date = parse_date("17-Jul-1996").unwrap();
        assert_eq!(format_date(&date), "17-Jul-1996");
        assert!(parse_date("32-Jan-2020").is_err());
        assert!(parse_date("17-Foo-1996").is_err());

        let dt = parse_datetime("17-Jul-1996 02:44:25 -0700").unwrap();
        assert_eq!(dt.second(), 25);
        assert_eq!(format_datetime(&dt), "17-Jul-1996 02:44:25 -0700");

        // Space-padded day inside quoted date-time
        let dt = parse_datetime(" 1-Jan-2020 00:00:00 +0000").unwrap();
        assert_eq!(format_datetime(&dt), " 1-Jan-2020 00:00:00 +0000");
    }

    #[test]
    fn test_mutf7_umlaut() {
        assert_eq!(encode_mailbox_name("Entwürfe"), "Entw&APw-rfe");
        assert_eq!(decode_mailbox_name("Entw&APw-rfe").unwrap(), "Entwürfe");
    }

    #[test]
    fn test_mutf7_ampersand_and_ascii() {
        assert_eq!(encode_mailbox_name("Mail & More"), "Mail &- More");
        assert_eq!(decode_mailbox_name("Mail &- More").unwrap(), "Mail & More");
        assert_eq!(encode_mailbox_name("INBOX"), "INBOX");
    }

    #[test]
    fn test_mutf7_roundtrip_non_bmp() {
        for name in ["日本語", "mixed 語 text", "crab 🦀 bucket", "th\u{e9}\u{e2}tre"] {
            let encoded = encode_mailbox_name(name);
            assert!(encoded.is_ascii());
            assert_eq!(decode_mailbox_name(&encoded).unwrap(), name, "{name}");
        }
    }

    #[test]
    fn test_mutf7_decode_errors() {
        assert!(decode_mailbox_name("&unterminated").is_err());
        assert!(decode_mailbox_name("&!!!-").is_err());
    }

    #[test]
    fn test_flag_list_rendering() {
        let flags = vec![Flag::Seen, Flag::Answered, Flag::Keyword("$Label1".into())];
        assert_eq!(encode_flag_list(flags.iter()), "(\\Answered \\Seen $Label1)");
    }
}
