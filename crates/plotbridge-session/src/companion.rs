//! The companion side of a session.
//!
//! [`CompanionClient`] attaches to the endpoints a host session bound,
//! reassembles batches from the frame stream and sends replies back.

use std::collections::HashSet;
use std::path::Path;

use bytes::Bytes;
use plotbridge_data::{decode_text, decode_values, DataHeader, Element};
use plotbridge_frame::{
    FrameConfig, FrameError, FrameReader, FrameWriter, CONTROL, DATA, DEFAULT_MAX_PAYLOAD, REPLY,
    SCRIPT,
};
use plotbridge_transport::{Endpoint, IpcStream};
use tracing::{debug, warn};

use crate::control::ControlMessage;
use crate::error::{Result, SessionError};
use crate::handshake::{handshake_client, EndpointRole, HandshakeConfig, HandshakeResult};

/// One named argument of a received batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedBinding {
    pub header: DataHeader,
    pub payload: Bytes,
}

impl ReceivedBinding {
    pub fn name(&self) -> &str {
        &self.header.name
    }

    /// Decode the payload as values of `T`.
    pub fn values<T: Element>(&self) -> Result<Vec<T>> {
        Ok(decode_values(&self.header, &self.payload)?)
    }

    /// Decode a character payload.
    pub fn text(&self) -> Result<&str> {
        Ok(decode_text(&self.header, &self.payload)?)
    }
}

/// Everything the host sent between two `finalize` sentinels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivedBatch {
    /// Bindings in declaration order.
    pub bindings: Vec<ReceivedBinding>,
    pub script: String,
}

impl ReceivedBatch {
    pub fn get(&self, name: &str) -> Option<&ReceivedBinding> {
        self.bindings.iter().find(|binding| binding.name() == name)
    }

    /// Bindings the host expects back, in the order it expects them.
    pub fn reply_requests(&self) -> impl Iterator<Item = &ReceivedBinding> {
        self.bindings
            .iter()
            .filter(|binding| binding.header.wants_reply())
    }
}

/// What the host asked for next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompanionEvent {
    /// A finalized batch: run the script against the bindings.
    Batch(ReceivedBatch),
    /// The host is shutting the session down.
    Exit,
}

/// Companion-side connection to a host session.
pub struct CompanionClient {
    reader: FrameReader<IpcStream>,
    reply: Option<FrameWriter<IpcStream>>,
    handshake: HandshakeResult,
    batches: u64,
}

impl CompanionClient {
    /// Attach to the data endpoint and, for duplex sessions, the reply endpoint.
    pub fn connect(
        endpoint: impl AsRef<Path>,
        reply_endpoint: Option<&Path>,
        config: &HandshakeConfig,
    ) -> Result<Self> {
        let (reader, _writer, handshake) = attach(endpoint.as_ref(), EndpointRole::Data, config)?;

        let reply = match reply_endpoint {
            Some(path) => {
                let (_reader, writer, reply_handshake) = attach(path, EndpointRole::Reply, config)?;
                if reply_handshake.session_id != handshake.session_id {
                    return Err(SessionError::HandshakeFailed(format!(
                        "reply endpoint belongs to session {:?}, data endpoint to {:?}",
                        reply_handshake.session_id, handshake.session_id
                    )));
                }
                Some(writer)
            }
            None => None,
        };

        debug!(session_id = %handshake.session_id, duplex = reply.is_some(), "attached to host");

        Ok(Self {
            reader,
            reply,
            handshake,
            batches: 0,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.handshake.session_id
    }

    /// Whether replies can be sent.
    pub fn is_duplex(&self) -> bool {
        self.reply.is_some()
    }

    /// Number of batches received so far.
    pub fn batches_received(&self) -> u64 {
        self.batches
    }

    /// Block until the next finalized batch or the exit sentinel.
    pub fn next_event(&mut self) -> Result<CompanionEvent> {
        let mut bindings: Vec<ReceivedBinding> = Vec::new();
        let mut names = HashSet::new();
        let mut pending: Option<DataHeader> = None;
        let mut script: Option<String> = None;

        loop {
            let frame = match self.reader.read_frame() {
                Ok(frame) => frame,
                Err(FrameError::ConnectionClosed) => {
                    return Err(SessionError::Disconnected(
                        "host closed the data endpoint".to_string(),
                    ));
                }
                Err(err) => return Err(err.into()),
            };

            match frame.channel {
                DATA => match pending.take() {
                    Some(header) => {
                        header.check_payload(&frame.payload)?;
                        bindings.push(ReceivedBinding {
                            header,
                            payload: frame.payload,
                        });
                    }
                    None => {
                        if script.is_some() {
                            return Err(SessionError::Protocol(
                                "data header after the batch's script".to_string(),
                            ));
                        }
                        let text = frame.text().ok_or_else(|| {
                            SessionError::Protocol("data header is not UTF-8".to_string())
                        })?;
                        let header = DataHeader::parse(text)?;
                        if header.wants_reply() && self.reply.is_none() {
                            return Err(SessionError::Protocol(format!(
                                "{:?} requests a reply but no reply endpoint is attached",
                                header.name
                            )));
                        }
                        if !names.insert(header.name.clone()) {
                            return Err(SessionError::Protocol(format!(
                                "binding {:?} appears twice in one batch",
                                header.name
                            )));
                        }
                        pending = Some(header);
                    }
                },
                SCRIPT => {
                    if let Some(header) = &pending {
                        return Err(SessionError::Protocol(format!(
                            "script arrived before the payload of {:?}",
                            header.name
                        )));
                    }
                    if script.is_some() {
                        return Err(SessionError::Protocol(
                            "second script message in one batch".to_string(),
                        ));
                    }
                    let text = frame.text().ok_or_else(|| {
                        SessionError::Protocol("script text is not UTF-8".to_string())
                    })?;
                    script = Some(text.to_string());
                }
                CONTROL => match ControlMessage::parse(&frame.payload) {
                    Some(ControlMessage::Finalize) => {
                        if let Some(header) = &pending {
                            return Err(SessionError::Protocol(format!(
                                "finalize arrived before the payload of {:?}",
                                header.name
                            )));
                        }
                        self.batches += 1;
                        debug!(
                            batch = self.batches,
                            bindings = bindings.len(),
                            "batch finalized"
                        );
                        return Ok(CompanionEvent::Batch(ReceivedBatch {
                            bindings,
                            script: script.unwrap_or_default(),
                        }));
                    }
                    Some(ControlMessage::Exit) => {
                        if !bindings.is_empty() || pending.is_some() || script.is_some() {
                            warn!("exit arrived inside an unfinished batch; discarding it");
                        }
                        debug!("exit received");
                        return Ok(CompanionEvent::Exit);
                    }
                    None => {
                        return Err(SessionError::Protocol(format!(
                            "unknown control message {:?}",
                            String::from_utf8_lossy(&frame.payload)
                        )));
                    }
                },
                other => {
                    return Err(SessionError::Protocol(format!(
                        "unexpected channel {other} on the data endpoint"
                    )));
                }
            }
        }
    }

    /// Return a buffer: the binding name, then exactly its bytes.
    pub fn send_reply(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let writer = self.reply.as_mut().ok_or_else(|| {
            SessionError::Config("session has no reply endpoint".to_string())
        })?;
        writer.send(REPLY, name.as_bytes())?;
        writer.send(REPLY, bytes)?;
        debug!(name, len = bytes.len(), "reply sent");
        Ok(())
    }
}

impl std::fmt::Debug for CompanionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompanionClient")
            .field("session_id", &self.handshake.session_id)
            .field("duplex", &self.reply.is_some())
            .field("batches", &self.batches)
            .finish()
    }
}

fn attach(
    path: &Path,
    role: EndpointRole,
    config: &HandshakeConfig,
) -> Result<(
    FrameReader<IpcStream>,
    FrameWriter<IpcStream>,
    HandshakeResult,
)> {
    let stream = Endpoint::connect(path)?;
    let reader_stream = stream.try_clone()?;

    let frame_config = FrameConfig {
        max_payload_size: config.max_handshake_payload,
        read_timeout: Some(config.timeout),
        write_timeout: Some(config.timeout),
    };

    let mut reader = FrameReader::with_config_ipc(reader_stream, frame_config.clone())?;
    let mut writer = FrameWriter::with_config_ipc(stream, frame_config)?;

    let handshake = handshake_client(&mut reader, &mut writer, role, config)?;
    // Handshake uses a tighter pre-auth payload budget; restore runtime defaults after auth.
    reader.set_max_payload_size(DEFAULT_MAX_PAYLOAD);
    writer.set_max_payload_size(DEFAULT_MAX_PAYLOAD);
    reader.set_read_timeout(None)?;
    writer.set_write_timeout(None)?;

    Ok((reader, writer, handshake))
}
