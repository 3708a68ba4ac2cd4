//! Typed container adapters and the self-describing data header codec.
//!
//! A host value is bound to a name and turned into two wire messages:
//! a text header (`data|name|tag|count|shape[|marker]`) and a raw payload
//! whose length is fully determined by that header.
//!
//! - [`dtype`]: the closed table of element types and their tag codes
//! - [`container`]: size/shape/byte-view adapters, one per container variant
//! - [`header`]: [`ContainerView`] plus header encoding and parsing
//! - [`decode`]: typed decoding of received payloads

pub mod container;
pub mod decode;
pub mod dtype;
pub mod error;
pub mod header;

pub use container::{Container, ContainerMut, Shape};
pub use decode::{decode_text, decode_values};
pub use dtype::{DType, Element};
pub use error::{DataError, Result};
pub use header::{
    encode_header, validate_name, ContainerView, DataHeader, ReplyPolicy, HEADER_PREFIX,
};
