//! Sessions between a host program and its companion interpreter.
//!
//! A [`Session`] binds the endpoints, launches the companion, and sends
//! batches: named bindings, the accumulated script, then `finalize`. Duplex
//! sessions also receive replies that overwrite `send_back` bindings in place.
//! [`CompanionClient`] is the other end.

pub mod companion;
pub mod config;
pub mod control;
pub mod error;
pub mod handshake;
pub mod launcher;
pub mod script;
pub mod session;

pub use companion::{CompanionClient, CompanionEvent, ReceivedBatch, ReceivedBinding};
pub use config::{default_endpoint, reply_endpoint_for, SessionConfig};
pub use control::{ControlMessage, CONTROL_EXIT, CONTROL_FINALIZE};
pub use error::{BatchStage, ErrorKind, Result, SessionError};
pub use handshake::{
    handshake_client, handshake_server, EndpointRole, HandshakeConfig, HandshakeRequest,
    HandshakeResponse, HandshakeResult,
};
pub use launcher::{CompanionCommand, LaunchRequest, Launcher, ProcessLauncher, TOKEN_ENV};
pub use script::{dedent, ScriptBuffer};
pub use session::{Arg, BatchReport, Binding, Session, SessionState};
