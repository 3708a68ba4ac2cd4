//! Ordered, channel-tagged message framing for the plotbridge companion link.
//!
//! Every message travels as one frame:
//! - A 2-byte magic number ("PB") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian channel ID
//!
//! The underlying stream keeps frames in order, so a data header followed by
//! its payload always arrives as an adjacent pair.

pub mod channel;
pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use channel::{channel_name, CONTROL, DATA, REPLY, SCRIPT};
pub use codec::{
    decode_frame, encode_frame, encode_header, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD,
    HEADER_SIZE, MAGIC,
};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
