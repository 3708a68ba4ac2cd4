use std::fmt;
use std::time::Duration;

use plotbridge_data::DataError;
use plotbridge_frame::FrameError;

/// Coarse classification of session failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad address, duplicate binding name, reply requested without a reply
    /// channel, or a companion that could not be started.
    Configuration,
    /// A container's shape is inconsistent, e.g. ragged rows.
    Shape,
    /// The peer broke the wire contract.
    Protocol,
    /// The link failed or timed out.
    Transport,
}

/// Step of a batch at which it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStage {
    Header { name: String },
    Payload { name: String },
    Script,
    Finalize,
    /// Waiting for the returned buffer of a `send_back` binding.
    Reply { name: String },
}

impl fmt::Display for BatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStage::Header { name } => write!(f, "header of {name:?}"),
            BatchStage::Payload { name } => write!(f, "payload of {name:?}"),
            BatchStage::Script => f.write_str("script"),
            BatchStage::Finalize => f.write_str("finalize"),
            BatchStage::Reply { name } => write!(f, "reply for {name:?}"),
        }
    }
}

/// Errors that can occur in session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] plotbridge_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// A binding could not be adapted, encoded or decoded.
    #[error("data error: {0}")]
    Data(#[from] DataError),

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer went away.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking operation timed out.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The session or a batch was configured inconsistently.
    #[error("configuration error: {0}")]
    Config(String),

    /// The peer broke the wire contract.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The companion process could not be started or stopped.
    #[error("failed to launch companion {program:?}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The session has no companion link.
    #[error("session is not established")]
    NotEstablished,

    /// A batch stopped part way through sending or receiving replies.
    ///
    /// The companion holds a partial batch, or the host is missing replies.
    /// No `send_back` buffer is modified unless every reply arrived. The
    /// session refuses further batches until it is torn down and
    /// re-established.
    #[error("batch {batch} incomplete after {sent} messages (failed at {stage}): {source}")]
    BatchIncomplete {
        batch: u64,
        stage: BatchStage,
        sent: usize,
        #[source]
        source: Box<SessionError>,
    },
}

impl SessionError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Config(_) | SessionError::NotEstablished | SessionError::Launch { .. } => {
                ErrorKind::Configuration
            }
            SessionError::Data(err) => match err {
                DataError::RaggedRows { .. }
                | DataError::ShapeMismatch { .. }
                | DataError::ByteLengthMismatch { .. } => ErrorKind::Shape,
                DataError::InvalidName { .. } => ErrorKind::Configuration,
                DataError::PayloadLengthMismatch { .. }
                | DataError::ReplyLengthMismatch { .. }
                | DataError::MalformedHeader { .. }
                | DataError::DTypeMismatch { .. }
                | DataError::InvalidText(_) => ErrorKind::Protocol,
            },
            SessionError::Protocol(_) | SessionError::HandshakeFailed(_) | SessionError::Json(_) => {
                ErrorKind::Protocol
            }
            SessionError::Frame(FrameError::InvalidMagic) => ErrorKind::Protocol,
            SessionError::Transport(_)
            | SessionError::Frame(_)
            | SessionError::Disconnected(_)
            | SessionError::Timeout(_) => ErrorKind::Transport,
            SessionError::BatchIncomplete { source, .. } => source.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
