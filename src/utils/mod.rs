pub mod config;

use chrono::Utc;

/// Generate an IMAP UIDVALIDITY value.
/// RFC 3501 compliant: non-zero, increases across mailbox recreations.
pub fn generate_uidvalidity() -> u32 {
    let secs = Utc::now().timestamp();
    // Wrap into u32 space; stays monotone until 2106.
    (secs as u64 & 0xFFFF_FFFF) as u32
}
