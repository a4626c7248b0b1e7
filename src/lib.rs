//! Client library for the Network Block Device (NBD) protocol.
//!
//! A [`Handle`] represents one connection to an NBD server, reachable over
//! TCP, a Unix domain socket, `AF_VSOCK`, a spawned subprocess, a
//! pre-connected socket, or an `nbd://` URI, optionally upgraded to TLS
//! with `STARTTLS`.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>
//! for the protocol description.
//!
//! Two driving styles share one state machine:
//!
//! - **Blocking**: `connect_tcp`, `pread`, `pwrite`, ... each drive the
//!   connection until their command retires.
//! - **Asynchronous**: `aio_*` calls queue work and return a cookie; the
//!   caller plugs `aio_get_fd` / `aio_get_direction` into any event loop
//!   and feeds readiness back with `aio_notify_read` / `aio_notify_write`,
//!   collecting results via `aio_command_completed`.
//!
//! ```no_run
//! use nbd_client::Handle;
//!
//! fn main() -> nbd_client::Result<()> {
//!     let mut nbd = Handle::new();
//!     nbd.set_export_name("default")?;
//!     nbd.connect_tcp("localhost", "10809")?;
//!     let mut buf = vec![0u8; 4096];
//!     nbd.pread(&mut buf, 0, Default::default())?;
//!     nbd.shutdown()?;
//!     Ok(())
//! }
//! ```

mod cmd;
mod crypto;
mod errors;
mod flags;
mod handle;
mod opt;
mod proto;
mod states;
mod transport;
mod uri;
mod utils;

pub use cmd::{
    ChunkCallback, ChunkKind, CommandStatus, CompletionCallback, ContextCallback, ExtentCallback,
    ListCallback,
};
pub use crypto::TlsMode;
pub use errors::{get_errno, get_error, Error, Result};
pub use handle::{AllowTransport, BlockSizeKind, Handle, StrictFlags};
pub use proto::{CmdFlags, HandshakeFlags, ProtocolError, MAX_STRING};
pub use transport::AioDirection;
pub use utils::human_size;
