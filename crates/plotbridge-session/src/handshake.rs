use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use plotbridge_frame::{FrameError, FrameReader, FrameWriter, CONTROL, DATA, REPLY, SCRIPT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SessionError};

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_SESSION_ID_LEN: usize = 128;
const MAX_TOKEN_LEN: usize = 4096;

/// Which of the session's endpoints a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRole {
    /// Host to companion: data bindings, script text and sentinels.
    Data,
    /// Companion to host: returned buffers in duplex sessions.
    Reply,
}

impl EndpointRole {
    /// Channels carried on an endpoint of this role.
    pub fn channels(self) -> &'static [u16] {
        match self {
            EndpointRole::Data => &[DATA, SCRIPT],
            EndpointRole::Reply => &[REPLY],
        }
    }
}

/// Companion handshake request sent on CONTROL channel.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Protocol name. Must be `plotbridge` by default.
    pub protocol: String,
    /// Protocol version string.
    pub version: String,
    /// Channels requested by the companion.
    pub channels: Vec<u16>,
    /// Endpoint the companion believes it is attaching to.
    pub role: EndpointRole,
    /// Session token handed to the companion at launch.
    /// Treated as opaque credential material and redacted in debug output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Host handshake response sent on CONTROL channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Protocol name. Must match request protocol.
    pub protocol: String,
    /// Negotiated protocol version.
    pub version: String,
    /// Negotiated channel set.
    pub channels: Vec<u16>,
    /// Opaque host-assigned session identifier.
    pub session_id: String,
}

/// Result of a successful handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    pub session_id: String,
    pub protocol_version: String,
    pub negotiated_channels: Vec<u16>,
    pub role: EndpointRole,
    /// Token presented by the companion, as observed by the host.
    pub client_token: Option<String>,
}

/// Configuration for handshake negotiation.
#[derive(Clone)]
pub struct HandshakeConfig {
    /// Timeout for each blocking handshake operation.
    pub timeout: Duration,
    /// Expected protocol name.
    pub protocol_name: String,
    /// Local protocol version.
    pub protocol_version: String,
    /// Maximum handshake frame payload size in bytes.
    pub max_handshake_payload: usize,
    /// Session token. The companion presents it; the host requires it when set.
    /// Sent as plaintext within local IPC and never logged.
    pub token: Option<String>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "plotbridge".to_string(),
            protocol_version: "1.0".to_string(),
            max_handshake_payload: 16 * 1024,
            token: None,
        }
    }
}

struct Redacted<'a>(&'a Option<String>);

impl fmt::Debug for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(token) => write!(f, "Some(<redacted:{} bytes>)", token.len()),
            None => f.write_str("None"),
        }
    }
}

impl fmt::Debug for HandshakeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeRequest")
            .field("protocol", &self.protocol)
            .field("version", &self.version)
            .field("channels", &self.channels)
            .field("role", &self.role)
            .field("token", &Redacted(&self.token))
            .finish()
    }
}

impl fmt::Debug for HandshakeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeResult")
            .field("session_id", &self.session_id)
            .field("protocol_version", &self.protocol_version)
            .field("negotiated_channels", &self.negotiated_channels)
            .field("role", &self.role)
            .field("client_token", &Redacted(&self.client_token))
            .finish()
    }
}

impl fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeConfig")
            .field("timeout", &self.timeout)
            .field("protocol_name", &self.protocol_name)
            .field("protocol_version", &self.protocol_version)
            .field("max_handshake_payload", &self.max_handshake_payload)
            .field("token", &Redacted(&self.token))
            .finish()
    }
}

/// Perform the companion side of the handshake.
pub fn handshake_client<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    role: EndpointRole,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    check_config(config)?;
    if let Some(token) = &config.token {
        check_len("token", token, MAX_TOKEN_LEN)?;
    }

    let req = HandshakeRequest {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        channels: role.channels().to_vec(),
        role,
        token: config.token.clone(),
    };
    send_control_json(writer, &req)?;

    let resp: HandshakeResponse = recv_control_json(reader, config)?;
    check_len("session_id", &resp.session_id, MAX_SESSION_ID_LEN)?;
    // The companion is the newer side when versions differ by minor.
    check_peer(&resp.protocol, &config.protocol_version, &resp.version, config)?;
    if resp.channels != role.channels() {
        return Err(SessionError::HandshakeFailed(format!(
            "host assigned channels {:?} to the {:?} endpoint",
            resp.channels, role
        )));
    }

    debug!(session_id = %resp.session_id, ?role, "handshake complete");

    Ok(HandshakeResult {
        session_id: resp.session_id,
        protocol_version: resp.version,
        negotiated_channels: resp.channels,
        role,
        client_token: None,
    })
}

/// Perform the host side of the handshake for an endpoint of `role`.
pub fn handshake_server<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    role: EndpointRole,
    session_id: &str,
    config: &HandshakeConfig,
) -> Result<HandshakeResult> {
    check_config(config)?;
    check_len("session_id", session_id, MAX_SESSION_ID_LEN)?;

    let req: HandshakeRequest = recv_control_json(reader, config)?;
    if let Some(token) = &req.token {
        check_len("token", token, MAX_TOKEN_LEN)?;
    }
    check_peer(&req.protocol, &req.version, &config.protocol_version, config)?;

    if req.role != role {
        return Err(SessionError::HandshakeFailed(format!(
            "companion attached as {:?} to the {:?} endpoint",
            req.role, role
        )));
    }
    if req.channels != role.channels() {
        return Err(SessionError::HandshakeFailed(format!(
            "{:?} endpoint carries channels {:?}, companion asked for {:?}",
            role,
            role.channels(),
            req.channels
        )));
    }
    if let Some(expected) = &config.token {
        if req.token.as_deref() != Some(expected.as_str()) {
            return Err(SessionError::HandshakeFailed(
                "session token mismatch".to_string(),
            ));
        }
    }

    let resp = HandshakeResponse {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        channels: role.channels().to_vec(),
        session_id: session_id.to_string(),
    };
    send_control_json(writer, &resp)?;

    debug!(session_id, ?role, "companion handshake accepted");

    Ok(HandshakeResult {
        session_id: session_id.to_string(),
        protocol_version: config.protocol_version.clone(),
        negotiated_channels: resp.channels,
        role,
        client_token: req.token,
    })
}

fn check_config(config: &HandshakeConfig) -> Result<()> {
    check_len("protocol name", &config.protocol_name, MAX_PROTOCOL_LEN)?;
    check_len("protocol version", &config.protocol_version, MAX_VERSION_LEN)?;
    parse_version(&config.protocol_version)?;
    Ok(())
}

/// Protocol must match exactly; `newer` may be ahead of `older` by minor only.
fn check_peer(protocol: &str, newer: &str, older: &str, config: &HandshakeConfig) -> Result<()> {
    check_len("protocol name", protocol, MAX_PROTOCOL_LEN)?;
    if protocol != config.protocol_name {
        return Err(SessionError::HandshakeFailed(format!(
            "unknown protocol '{protocol}' (expected '{}')",
            config.protocol_name
        )));
    }

    let (newer_major, newer_minor) = parse_version(newer)?;
    let (older_major, older_minor) = parse_version(older)?;
    if newer_major != older_major || newer_minor < older_minor {
        return Err(SessionError::HandshakeFailed(format!(
            "incompatible versions: companion '{newer}', host '{older}'"
        )));
    }
    Ok(())
}

fn check_len(field: &str, value: &str, max: usize) -> Result<()> {
    if value.is_empty() || value.len() > max {
        return Err(SessionError::HandshakeFailed(format!(
            "invalid {field} length: {} (max {max})",
            value.len()
        )));
    }
    Ok(())
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let invalid =
        || SessionError::HandshakeFailed(format!("invalid version '{version}': expected MAJOR.MINOR"));

    if version.len() > MAX_VERSION_LEN {
        return Err(invalid());
    }
    let (major, minor) = version.split_once('.').ok_or_else(invalid)?;
    let major = major.parse::<u16>().map_err(|_| invalid())?;
    let minor = minor.parse::<u16>().map_err(|_| invalid())?;
    Ok((major, minor))
}

fn send_control_json<T: Serialize, W: Write>(writer: &mut FrameWriter<W>, value: &T) -> Result<()> {
    writer.send(CONTROL, &serde_json::to_vec(value)?)?;
    Ok(())
}

/// Wait for the first frame, which must be a bounded JSON document on CONTROL.
fn recv_control_json<T: DeserializeOwned, R: Read>(
    reader: &mut FrameReader<R>,
    config: &HandshakeConfig,
) -> Result<T> {
    let deadline = Instant::now() + config.timeout;
    let frame = loop {
        if Instant::now() >= deadline {
            return Err(SessionError::Timeout(config.timeout));
        }
        match reader.read_frame() {
            Ok(frame) => break frame,
            Err(FrameError::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(FrameError::ConnectionClosed) => {
                return Err(SessionError::Disconnected(
                    "peer closed the connection during handshake".to_string(),
                ));
            }
            Err(FrameError::PayloadTooLarge { size, max }) => {
                return Err(SessionError::HandshakeFailed(format!(
                    "handshake payload of {size} bytes exceeds {max}"
                )));
            }
            Err(err) => return Err(err.into()),
        }
    };

    if frame.channel != CONTROL {
        return Err(SessionError::HandshakeFailed(format!(
            "first frame arrived on channel {}, expected CONTROL",
            frame.channel
        )));
    }
    if frame.payload.len() > config.max_handshake_payload {
        return Err(SessionError::HandshakeFailed(format!(
            "handshake payload of {} bytes exceeds {}",
            frame.payload.len(),
            config.max_handshake_payload
        )));
    }
    Ok(serde_json::from_slice(&frame.payload)?)
}
