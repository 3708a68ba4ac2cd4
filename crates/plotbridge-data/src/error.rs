use crate::dtype::DType;

/// Errors raised while adapting, encoding or decoding data bindings.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// Rows of a nested sequence differ in length.
    #[error("nested sequence row {row} has {found} elements, expected {expected}")]
    RaggedRows {
        row: usize,
        expected: usize,
        found: usize,
    },

    /// The binding name cannot be carried in a data header.
    #[error("invalid binding name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// A container reports an element count that disagrees with its shape.
    #[error("container reports {found} elements but its shape {shape} holds {expected}")]
    ShapeMismatch {
        shape: String,
        expected: usize,
        found: usize,
    },

    /// A container produced a byte view that disagrees with its shape.
    #[error("container byte length {found} does not match shape ({expected} bytes)")]
    ByteLengthMismatch { expected: usize, found: usize },

    /// A payload does not have the length its header declares.
    #[error("payload for {name:?} has {found} bytes, header declares {expected}")]
    PayloadLengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    /// A reply buffer cannot be written back without resizing the container.
    #[error("reply carries {found} bytes, container holds {expected}")]
    ReplyLengthMismatch { expected: usize, found: usize },

    /// A data header could not be parsed.
    #[error("malformed data header {header:?}: {reason}")]
    MalformedHeader { header: String, reason: String },

    /// A payload was decoded as the wrong element type.
    #[error("element type mismatch: header carries {found}, requested {expected}")]
    DTypeMismatch { expected: DType, found: DType },

    /// Character data is not valid UTF-8.
    #[error("character payload is not valid UTF-8: {0}")]
    InvalidText(#[from] std::str::Utf8Error),
}

pub type Result<T> = std::result::Result<T, DataError>;
