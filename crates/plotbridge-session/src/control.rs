use std::fmt;

/// CONTROL message closing a batch.
pub const CONTROL_FINALIZE: &str = "finalize";
/// CONTROL message ending the companion's session.
pub const CONTROL_EXIT: &str = "exit";

/// Sentinels carried on the CONTROL channel once the handshake is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Execute the accumulated script against the batch's bindings.
    Finalize,
    /// Shut down; sent exactly once per established session.
    Exit,
}

impl ControlMessage {
    pub const fn as_str(self) -> &'static str {
        match self {
            ControlMessage::Finalize => CONTROL_FINALIZE,
            ControlMessage::Exit => CONTROL_EXIT,
        }
    }

    pub fn as_bytes(self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    /// Recognize a CONTROL payload.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match payload {
            b"finalize" => Some(ControlMessage::Finalize),
            b"exit" => Some(ControlMessage::Exit),
            _ => None,
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
