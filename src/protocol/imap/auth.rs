use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

/// Credentials recovered from a SASL PLAIN payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    pub authzid: String,
    pub authcid: String,
    pub password: String,
}

/// Decode the `authzid NUL authcid NUL password` PLAIN payload.
pub fn decode_plain(payload: &[u8]) -> Option<PlainCredentials> {
    let text = String::from_utf8(payload.to_vec()).ok()?;
    let mut fields = text.split('\u{0}');
    let authzid = fields.next()?.to_string();
    let authcid = fields.next()?.to_string();
    let password = fields.next()?.to_string();
    if fields.next().is_some() || authcid.is_empty() {
        return None;
    }
    Some(PlainCredentials { authzid, authcid, password })
}

/// Encode a server challenge for the continuation line.
pub fn encode_challenge(challenge: &[u8]) -> String {
    B64.encode(challenge)
}

/// Outcome of one client continuation line in a SASL exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslResponse {
    /// Decoded response bytes.
    Data(Vec<u8>),
    /// The client aborted with `*`.
    Aborted,
    /// The line was not valid base64.
    Invalid,
}

/// Decode a client response line: base64, `=` for an empty initial
/// response, or `*` to abort.
pub fn decode_response(line: &str) -> SaslResponse {
    let line = line.trim_end_matches(['\r', '\n']);
    if line == "*" {
        return SaslResponse::Aborted;
    }
    if line == "=" || line.is_empty() {
        return SaslResponse::Data(Vec::new());
    }
    match B64.decode(line.as_bytes()) {
        Ok(data) => SaslResponse::Data(data),
        Err(_) => SaslResponse::Invalid,
    }
}

/// Mechanisms the server drives; others are rejected before the
/// exchange starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    External,
}

impl Mechanism {
    pub fn from_name(name: &str) -> Option<Mechanism> {
        match name.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Mechanism::Plain),
            "EXTERNAL" => Some(Mechanism::External),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain() {
        let payload = b"\x00alice\x00sesame";
        let creds = decode_plain(payload).unwrap();
        assert_eq!(creds.authzid, "");
        assert_eq!(creds.authcid, "alice");
        assert_eq!(creds.password, "sesame");

        let payload = b"admin\x00alice\x00sesame";
        assert_eq!(decode_plain(payload).unwrap().authzid, "admin");

        assert!(decode_plain(b"no-separators").is_none());
        assert!(decode_plain(b"\x00\x00empty-user").is_none());
    }

    #[test]
    fn test_decode_response_forms() {
        assert_eq!(decode_response("*"), SaslResponse::Aborted);
        assert_eq!(decode_response("="), SaslResponse::Data(Vec::new()));
        assert_eq!(
            decode_response(&B64.encode(b"\x00alice\x00sesame")),
            SaslResponse::Data(b"\x00alice\x00sesame".to_vec())
        );
        assert_eq!(decode_response("!!!not-base64!!!"), SaslResponse::Invalid);
    }

    #[test]
    fn test_mechanism_names() {
        assert_eq!(Mechanism::from_name("plain"), Some(Mechanism::Plain));
        assert_eq!(Mechanism::from_name("EXTERNAL"), Some(Mechanism::External));
        assert_eq!(Mechanism::from_name("CRAM-MD5"), None);
    }
}
