//! Typed decoding of received payloads.

use crate::dtype::{DType, Element};
use crate::error::{DataError, Result};
use crate::header::DataHeader;

/// Decode a payload into values of `T`, reproducing them bit for bit.
///
/// The header's type code must be `T`'s and the payload must have exactly the
/// declared length. Payloads need not be aligned.
pub fn decode_values<T: Element>(header: &DataHeader, payload: &[u8]) -> Result<Vec<T>> {
    if header.dtype != T::DTYPE {
        return Err(DataError::DTypeMismatch {
            expected: T::DTYPE,
            found: header.dtype,
        });
    }
    header.check_payload(payload)?;

    Ok(payload
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

/// Decode a character payload.
pub fn decode_text<'p>(header: &DataHeader, payload: &'p [u8]) -> Result<&'p str> {
    if header.dtype != DType::Char {
        return Err(DataError::DTypeMismatch {
            expected: DType::Char,
            found: header.dtype,
        });
    }
    header.check_payload(payload)?;
    Ok(std::str::from_utf8(payload)?)
}
