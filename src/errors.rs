//! Error reporting.
//!
//! Every public API sets its context (the API function name, e.g.
//! `"nbd_pread"`) on entry. Failures build an [`Error`] carrying that
//! context, an optional errno, and a message; the error is also stored in a
//! thread-local last-error slot readable through [`get_error`] /
//! [`get_errno`]. Two threads operating on their own handles never see each
//! other's errors.

use std::cell::{Cell, RefCell};
use std::error;
use std::fmt;

use nix::errno::Errno;

/// The error type used throughout this crate.
///
/// `errno` is captured verbatim for system-call failures, mapped from the
/// server's NBD error code for per-command failures, and `None` for pure
/// protocol violations.
#[derive(Debug, Clone)]
pub struct Error {
    context: &'static str,
    errno: Option<Errno>,
    msg: String,
}

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The errno associated with this error, if any.
    pub fn errno(&self) -> Option<Errno> {
        self.errno
    }

    /// Name of the API call that reported this error.
    pub fn context(&self) -> &'static str {
        self.context
    }

    /// The bare message, without context or errno rendering.
    pub fn message(&self) -> &str {
        &self.msg
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.msg)?;
        if let Some(errno) = self.errno {
            write!(f, ": {}", errno.desc())?;
        }
        Ok(())
    }
}

impl error::Error for Error {}

thread_local! {
    static LAST_ERROR: RefCell<Option<Error>> = const { RefCell::new(None) };
    static CONTEXT: Cell<&'static str> = const { Cell::new("unknown") };
}

/// Record the API function name for errors raised on this thread until the
/// next call. Called on entry to every public API.
pub(crate) fn set_context(name: &'static str) {
    CONTEXT.with(|c| c.set(name));
}

/// Build an error in the current context, store it in the thread-local
/// last-error slot, and return it for immediate propagation.
pub(crate) fn set_error<E>(errno: E, msg: impl Into<String>) -> Error
where
    E: Into<Option<Errno>>,
{
    let err = Error {
        context: CONTEXT.with(|c| c.get()),
        errno: errno.into(),
        msg: msg.into(),
    };
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(err.clone()));
    err
}

/// The rendered message of the most recent error on this thread, or `None`
/// if no API has failed yet.
pub fn get_error() -> Option<String> {
    LAST_ERROR.with(|e| e.borrow().as_ref().map(|err| err.to_string()))
}

/// The errno of the most recent error on this thread, if it had one.
pub fn get_errno() -> Option<Errno> {
    LAST_ERROR.with(|e| e.borrow().as_ref().and_then(|err| err.errno))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_prefix() {
        set_context("nbd_pread");
        let err = set_error(Errno::EINVAL, "request out of bounds");
        assert!(err.to_string().starts_with("nbd_pread: "));
        assert_eq!(err.errno(), Some(Errno::EINVAL));
        assert_eq!(err.message(), "request out of bounds");
    }

    #[test]
    fn last_error_slot() {
        set_context("nbd_connect_tcp");
        let _ = set_error(Errno::ECONNREFUSED, "connect failed");
        assert_eq!(get_errno(), Some(Errno::ECONNREFUSED));
        assert!(get_error().unwrap().contains("connect failed"));

        // protocol violations carry no errno
        set_context("nbd_aio_notify_read");
        let _ = set_error(None, "invalid reply magic");
        assert_eq!(get_errno(), None);
        assert!(get_error().unwrap().starts_with("nbd_aio_notify_read: "));
    }

    #[test]
    fn threads_do_not_collide() {
        set_context("nbd_pread");
        let _ = set_error(Errno::EIO, "boom");
        let other = std::thread::spawn(|| get_error()).join().unwrap();
        assert!(other.is_none());
        assert!(get_error().unwrap().contains("boom"));
    }
}
