use std::path::{Path, PathBuf};
use std::time::Duration;

use plotbridge_frame::DEFAULT_MAX_PAYLOAD;

use crate::handshake::HandshakeConfig;

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Socket path of the data endpoint.
    pub endpoint: PathBuf,
    /// Socket path of the reply endpoint. `Some` makes the session duplex.
    pub reply_endpoint: Option<PathBuf>,
    /// How long to wait for the companion to attach to each endpoint.
    pub attach_timeout: Duration,
    /// Bound on waiting for replies. `None` blocks indefinitely.
    pub reply_timeout: Option<Duration>,
    /// How long a launched companion gets to exit after `exit` before it is killed.
    pub reap_grace: Duration,
    /// Handshake settings shared by both endpoints.
    pub handshake: HandshakeConfig,
    /// Largest payload accepted or sent after the handshake.
    pub max_payload_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            reply_endpoint: None,
            attach_timeout: Duration::from_secs(10),
            reply_timeout: None,
            reap_grace: Duration::from_secs(2),
            handshake: HandshakeConfig::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// `$TMPDIR/plotbridge-<pid>.sock`.
pub fn default_endpoint() -> PathBuf {
    std::env::temp_dir().join(format!("plotbridge-{}.sock", std::process::id()))
}

/// Reply endpoint path derived from a data endpoint: `name.sock` → `name-reply.sock`.
pub fn reply_endpoint_for(endpoint: &Path) -> PathBuf {
    let stem = endpoint
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "plotbridge".to_string());
    endpoint.with_file_name(format!("{stem}-reply.sock"))
}

impl SessionConfig {
    pub fn with_endpoint(mut self, endpoint: impl Into<PathBuf>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_reply_endpoint(mut self, reply_endpoint: impl Into<PathBuf>) -> Self {
        self.reply_endpoint = Some(reply_endpoint.into());
        self
    }

    /// Enable replies on a reply endpoint next to the data endpoint.
    pub fn with_duplex(mut self) -> Self {
        self.reply_endpoint = Some(reply_endpoint_for(&self.endpoint));
        self
    }

    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_reap_grace(mut self, grace: Duration) -> Self {
        self.reap_grace = grace;
        self
    }

    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    /// Require the companion to present `token` during the handshake.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.handshake.token = Some(token.into());
        self
    }

    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    /// Whether batches may request replies.
    pub fn is_duplex(&self) -> bool {
        self.reply_endpoint.is_some()
    }
}
