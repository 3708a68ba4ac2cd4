//! Local socket endpoints for the plotbridge companion link.
//!
//! The host binds an [`Endpoint`] and waits for the companion interpreter to
//! attach; the companion side connects with [`Endpoint::connect`]. Both ends
//! then talk over a blocking [`IpcStream`].
//!
//! This is the lowest layer of plotbridge. Framing, the data codec and the
//! session protocol all build on the stream provided here.

pub mod error;
pub mod stream;

#[cfg(unix)]
pub mod endpoint;

pub use error::{Result, TransportError};
pub use stream::IpcStream;

#[cfg(unix)]
pub use endpoint::Endpoint;
