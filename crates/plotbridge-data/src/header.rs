//! The self-describing data header.
//!
//! Every bound argument travels as a header message followed by a payload
//! message. The header is pipe-delimited text with a fixed field order:
//!
//! ```text
//! data|<name>|<type code>|<element count>|<shape>[|<reply marker>]
//! ```
//!
//! e.g. `data|x|f|3|(3,)` for three `f32` values bound to `x`.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use crate::container::{parse_tuple, Container, Shape};
use crate::dtype::DType;
use crate::error::{DataError, Result};

/// Leading field of every data header.
pub const HEADER_PREFIX: &str = "data";

const FIELD_SEPARATOR: char = '|';

/// Whether the companion returns an argument's buffer after the batch runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ReplyPolicy {
    /// Fire and forget.
    #[default]
    DontSendBack,
    /// The companion sends the (possibly modified) buffer back and the host
    /// overwrites its container in place.
    SendBack,
}

impl ReplyPolicy {
    /// Marker written as the optional sixth header field.
    pub const fn marker(self) -> &'static str {
        match self {
            ReplyPolicy::DontSendBack => "dont_send_back",
            ReplyPolicy::SendBack => "send_back",
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "dont_send_back" => Some(ReplyPolicy::DontSendBack),
            "send_back" => Some(ReplyPolicy::SendBack),
            _ => None,
        }
    }
}

impl fmt::Display for ReplyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

/// Check that `name` can be carried in a header field.
pub fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.contains(FIELD_SEPARATOR) {
        "name contains the field separator '|'"
    } else if name.contains(['\n', '\r']) {
        "name contains a line break"
    } else {
        return Ok(());
    };
    Err(DataError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

/// A named, validated argument ready to be framed.
///
/// Holds the byte view produced by the container: borrowed for contiguous
/// storage, owned for linearized variants. A borrowed view lives no longer
/// than the borrow of the container it came from.
pub struct ContainerView<'a> {
    name: &'a str,
    dtype: DType,
    shape: Shape,
    bytes: Cow<'a, [u8]>,
}

impl<'a> ContainerView<'a> {
    /// Validate `name` and `container` and capture its byte view.
    pub fn new<C: Container + ?Sized>(name: &'a str, container: &'a C) -> Result<Self> {
        validate_name(name)?;

        let dtype = container.dtype();
        let shape = container.shape();
        let len = container.len();
        // An overflowing shape reports `expected` saturated at usize::MAX.
        let expected_bytes = shape
            .checked_element_count()
            .filter(|&count| count == len)
            .and_then(|count| count.checked_mul(dtype.size()))
            .ok_or_else(|| DataError::ShapeMismatch {
                shape: shape.to_string(),
                expected: shape.checked_element_count().unwrap_or(usize::MAX),
                found: len,
            })?;

        let bytes = container.bytes()?;
        if bytes.len() != expected_bytes {
            return Err(DataError::ByteLengthMismatch {
                expected: expected_bytes,
                found: bytes.len(),
            });
        }

        Ok(Self {
            name,
            dtype,
            shape,
            bytes,
        })
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.element_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload length in bytes.
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether the payload is a view of the container's own storage.
    pub fn is_borrowed(&self) -> bool {
        matches!(self.bytes, Cow::Borrowed(_))
    }

    /// Header text for this argument.
    pub fn header(&self, reply: Option<ReplyPolicy>) -> String {
        encode_header(self, reply)
    }

    /// Parsed form of the header this view encodes to.
    pub fn to_data_header(&self, reply: Option<ReplyPolicy>) -> DataHeader {
        DataHeader {
            name: self.name.to_string(),
            dtype: self.dtype,
            element_count: self.len(),
            shape: self.shape,
            reply,
        }
    }
}

impl fmt::Debug for ContainerView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerView")
            .field("name", &self.name)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("byte_len", &self.bytes.len())
            .field("borrowed", &self.is_borrowed())
            .finish()
    }
}

/// Encode the header message for `view`.
///
/// `reply` is `None` for sessions without a reply channel; duplex sessions
/// always pass an explicit policy.
pub fn encode_header(view: &ContainerView<'_>, reply: Option<ReplyPolicy>) -> String {
    write_header(view.name, view.dtype, view.len(), view.shape, reply)
}

fn write_header(
    name: &str,
    dtype: DType,
    element_count: usize,
    shape: Shape,
    reply: Option<ReplyPolicy>,
) -> String {
    let mut header = format!(
        "{HEADER_PREFIX}|{name}|{}|{element_count}|{shape}",
        dtype.code()
    );
    if let Some(reply) = reply {
        header.push(FIELD_SEPARATOR);
        header.push_str(reply.marker());
    }
    header
}

/// A parsed data header, as seen by the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHeader {
    pub name: String,
    pub dtype: DType,
    pub element_count: usize,
    pub shape: Shape,
    /// `None` when the header carries no reply marker.
    pub reply: Option<ReplyPolicy>,
}

impl DataHeader {
    /// Parse header text.
    pub fn parse(text: &str) -> Result<Self> {
        let malformed = |reason: String| DataError::MalformedHeader {
            header: text.to_string(),
            reason,
        };

        let fields: Vec<&str> = text.split(FIELD_SEPARATOR).collect();
        if !(5..=6).contains(&fields.len()) {
            return Err(malformed(format!(
                "expected 5 or 6 fields, found {}",
                fields.len()
            )));
        }
        if fields[0] != HEADER_PREFIX {
            return Err(malformed(format!(
                "expected prefix {HEADER_PREFIX:?}, found {:?}",
                fields[0]
            )));
        }

        let name = fields[1];
        validate_name(name).map_err(|err| malformed(err.to_string()))?;

        let mut code = fields[2].chars();
        let dtype = match (code.next(), code.next()) {
            (Some(c), None) => DType::from_code(c),
            _ => None,
        }
        .ok_or_else(|| malformed(format!("unknown type code {:?}", fields[2])))?;

        let element_count = fields[3]
            .parse::<usize>()
            .map_err(|_| malformed(format!("element count {:?} is not a count", fields[3])))?;
        let shape = parse_tuple(fields[4]).map_err(malformed)?;
        if shape.checked_element_count() != Some(element_count) {
            return Err(malformed(format!(
                "element count {element_count} does not match shape {shape}"
            )));
        }
        if element_count.checked_mul(dtype.size()).is_none() {
            return Err(malformed(format!(
                "payload of {element_count} {dtype} elements overflows"
            )));
        }

        let reply = match fields.get(5) {
            Some(marker) => Some(
                ReplyPolicy::from_marker(marker)
                    .ok_or_else(|| malformed(format!("unknown reply marker {marker:?}")))?,
            ),
            None => None,
        };

        Ok(Self {
            name: name.to_string(),
            dtype,
            element_count,
            shape,
            reply,
        })
    }

    /// Payload length implied by the header.
    pub fn byte_len(&self) -> usize {
        self.element_count * self.dtype.size()
    }

    /// Whether the companion is asked to return this buffer.
    pub fn wants_reply(&self) -> bool {
        self.reply == Some(ReplyPolicy::SendBack)
    }

    /// Check that `payload` has exactly the declared length.
    pub fn check_payload(&self, payload: &[u8]) -> Result<()> {
        if payload.len() != self.byte_len() {
            return Err(DataError::PayloadLengthMismatch {
                name: self.name.clone(),
                expected: self.byte_len(),
                found: payload.len(),
            });
        }
        Ok(())
    }
}

impl FromStr for DataHeader {
    type Err = DataError;

    fn from_str(text: &str) -> Result<Self> {
        Self::parse(text)
    }
}

impl fmt::Display for DataHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&write_header(
            &self.name,
            self.dtype,
            self.element_count,
            self.shape,
            self.reply,
        ))
    }
}
