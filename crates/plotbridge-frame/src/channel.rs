//! Channel IDs used on the companion link.
//!
//! All channels share one ordered stream; the ID only tells the receiver how
//! to interpret a payload.

/// Handshake and the `finalize` / `exit` sentinels.
pub const CONTROL: u16 = 0;

/// Data header and payload pairs.
pub const DATA: u16 = 1;

/// Script text.
pub const SCRIPT: u16 = 2;

/// Reply name confirmations and reply payloads (reply endpoint only).
pub const REPLY: u16 = 3;

/// Returns a human-readable name for a channel ID.
pub fn channel_name(id: u16) -> &'static str {
    match id {
        CONTROL => "CONTROL",
        DATA => "DATA",
        SCRIPT => "SCRIPT",
        REPLY => "REPLY",
        _ => "UNKNOWN",
    }
}
