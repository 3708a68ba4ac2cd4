//! Hand typed numeric data and script text to a companion interpreter.
//!
//! A host program binds named containers (scalars, vectors, nested rows,
//! dense matrices), accumulates script text, and flushes both to a companion
//! process as one batch. The companion runs the script against the bindings
//! and, in duplex sessions, can write buffers back into the host's containers.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix domain socket endpoints
//! - [`frame`]: length-prefixed, channel-tagged framing
//! - [`data`]: element types, container adapters and the data header codec
//! - [`session`]: sessions, batches, replies and the companion side
//!
//! ```no_run
//! use plotbridge::{Arg, CompanionCommand, ProcessLauncher, Session, SessionConfig};
//!
//! # fn main() -> plotbridge::session::Result<()> {
//! let launcher = ProcessLauncher::new(CompanionCommand::new("python3").arg("companion.py"));
//! let mut session = Session::with_launcher(SessionConfig::default().with_duplex(), launcher);
//! session.establish()?;
//!
//! let mut samples = vec![0.5f64, 1.5, 2.5];
//! session.raw(
//!     "
//!     samples *= 2
//!     plt.plot(samples)
//!     ",
//! );
//! session.flush(&mut [Arg::send_back("samples", &mut samples)])?;
//! # Ok(())
//! # }
//! ```

/// Re-export transport types.
pub mod transport {
    pub use plotbridge_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use plotbridge_frame::*;
}

/// Re-export data types.
pub mod data {
    pub use plotbridge_data::*;
}

/// Re-export session types.
pub mod session {
    pub use plotbridge_session::*;
}

pub use plotbridge_data::{Container, ContainerMut, DType, Element, ReplyPolicy, Shape};
pub use plotbridge_session::{
    Arg, BatchReport, CompanionClient, CompanionCommand, CompanionEvent, Launcher,
    ProcessLauncher, Session, SessionConfig, SessionError,
};
