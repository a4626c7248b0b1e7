//! Option-mode commands.
//!
//! With `set_opt_mode(true)` the connection stops in `NEGOTIATING` after
//! the initial handshake, and the caller steers negotiation explicitly:
//! inspect exports with `opt_list`/`opt_info`, probe meta contexts, upgrade
//! to TLS, and finally commit with `opt_go` or leave with `opt_abort`.
//! Each command exists in blocking and aio form.

use std::sync::{Arc, Mutex};

use log::debug;
use nix::errno::Errno;

use crate::errors::{set_context, set_error, Result};
use crate::handle::Handle;
use crate::proto::{HandshakeFlags, OptType};
use crate::states::Event;
use crate::{CompletionCallback, ContextCallback, ListCallback};

impl Handle {
    fn require_negotiating(&self) -> Result<()> {
        if !self.aio_is_negotiating() {
            return Err(set_error(
                Errno::EINVAL,
                "handle is not in option mode (set_opt_mode, or a failed request)",
            ));
        }
        Ok(())
    }

    fn require_fixed_newstyle(&self) -> Result<()> {
        if !self.gflags.contains(HandshakeFlags::FIXED_NEWSTYLE) {
            return Err(set_error(
                Errno::ENOTSUP,
                "server is not using the fixed newstyle protocol",
            ));
        }
        Ok(())
    }

    fn aio_opt_common(
        &mut self,
        opt: OptType,
        completion: Option<CompletionCallback>,
        list: Option<ListCallback>,
        context: Option<ContextCallback>,
    ) -> Result<()> {
        self.require_negotiating()?;
        self.opt_current = Some(opt);
        self.opt_completion = completion;
        self.opt_list_cb = list;
        self.opt_context_cb = context;
        if self.run_machine(Event::CmdIssue).is_err() {
            debug!(target: "nbd", "{}: option queued, ignoring state machine failure", self.hname);
        }
        Ok(())
    }

    /// Drive the machine until the current option finishes.
    fn wait_for_option(&mut self) -> Result<()> {
        while self.aio_is_connecting() {
            self.poll_internal(-1)?;
        }
        if self.aio_is_dead() {
            return Err(set_error(Errno::ENOTCONN, "connection is dead"));
        }
        Ok(())
    }

    // ----- GO / INFO -----

    /// Issue `NBD_OPT_GO` (or `NBD_OPT_EXPORT_NAME` as a fallback) without
    /// waiting.
    pub fn aio_opt_go(&mut self, completion: Option<CompletionCallback>) -> Result<()> {
        set_context("nbd_aio_opt_go");
        self.aio_opt_common(OptType::GO, completion, None, None)
    }

    /// Select the configured export and move to the transmission phase.
    pub fn opt_go(&mut self) -> Result<()> {
        set_context("nbd_opt_go");
        let err = shared_err();
        self.aio_opt_common(OptType::GO, Some(capture_err(&err)), None, None)?;
        self.wait_for_option()?;
        if let Some(errno) = take_err(&err) {
            return Err(set_error(errno, "server replied with error to opt_go request"));
        }
        Ok(())
    }

    /// Issue `NBD_OPT_INFO` without waiting.
    pub fn aio_opt_info(&mut self, completion: Option<CompletionCallback>) -> Result<()> {
        set_context("nbd_aio_opt_info");
        self.require_fixed_newstyle()?;
        self.aio_opt_common(OptType::INFO, completion, None, None)
    }

    /// Ask for details about the configured export without selecting it;
    /// on success `get_size` and friends are valid and the handle stays in
    /// `NEGOTIATING`.
    pub fn opt_info(&mut self) -> Result<()> {
        set_context("nbd_opt_info");
        self.require_fixed_newstyle()?;
        let err = shared_err();
        self.aio_opt_common(OptType::INFO, Some(capture_err(&err)), None, None)?;
        self.wait_for_option()?;
        if let Some(errno) = take_err(&err) {
            return Err(set_error(
                errno,
                "server replied with error to opt_info request",
            ));
        }
        Ok(())
    }

    // ----- ABORT -----

    /// Issue `NBD_OPT_ABORT` without waiting.
    pub fn aio_opt_abort(&mut self) -> Result<()> {
        set_context("nbd_aio_opt_abort");
        self.aio_opt_common(OptType::ABORT, None, None, None)
    }

    /// Leave negotiation without selecting an export; the connection ends
    /// in `CLOSED`.
    pub fn opt_abort(&mut self) -> Result<()> {
        set_context("nbd_opt_abort");
        self.aio_opt_common(OptType::ABORT, None, None, None)?;
        self.wait_for_option()
    }

    // ----- LIST -----

    /// Issue `NBD_OPT_LIST` without waiting; `list` runs once per export.
    pub fn aio_opt_list(
        &mut self,
        list: ListCallback,
        completion: Option<CompletionCallback>,
    ) -> Result<()> {
        set_context("nbd_aio_opt_list");
        self.require_fixed_newstyle()?;
        self.aio_opt_common(OptType::LIST, completion, Some(list), None)
    }

    /// List the server's exports; returns how many were reported.
    pub fn opt_list(&mut self, mut list: ListCallback) -> Result<usize> {
        set_context("nbd_opt_list");
        self.require_fixed_newstyle()?;
        let count = Arc::new(Mutex::new(0usize));
        let counter = count.clone();
        let visitor: ListCallback = Box::new(move |name, desc| {
            *counter.lock().expect("no poisoned lock") += 1;
            list(name, desc);
        });
        let err = shared_err();
        self.aio_opt_common(OptType::LIST, Some(capture_err(&err)), Some(visitor), None)?;
        self.wait_for_option()?;
        if let Some(errno) = take_err(&err) {
            return Err(set_error(errno, "server replied with error to list request"));
        }
        let count = *count.lock().expect("no poisoned lock");
        Ok(count)
    }

    // ----- meta contexts -----

    /// Issue `NBD_OPT_LIST_META_CONTEXT` without waiting; `context` runs
    /// once per context the server can serve.
    pub fn aio_opt_list_meta_context(
        &mut self,
        context: ContextCallback,
        completion: Option<CompletionCallback>,
    ) -> Result<()> {
        set_context("nbd_aio_opt_list_meta_context");
        self.require_fixed_newstyle()?;
        if !self.structured_replies {
            return Err(set_error(Errno::ENOTSUP, "server lacks structured replies"));
        }
        self.aio_opt_common(OptType::LIST_META_CONTEXT, completion, None, Some(context))
    }

    /// List the meta contexts the server can serve for the requested
    /// queries (all contexts when no queries are configured); returns how
    /// many were reported.
    pub fn opt_list_meta_context(&mut self, mut context: ContextCallback) -> Result<usize> {
        set_context("nbd_opt_list_meta_context");
        self.require_fixed_newstyle()?;
        if !self.structured_replies {
            return Err(set_error(Errno::ENOTSUP, "server lacks structured replies"));
        }
        let count = Arc::new(Mutex::new(0usize));
        let counter = count.clone();
        let visitor: ContextCallback = Box::new(move |name| {
            *counter.lock().expect("no poisoned lock") += 1;
            context(name);
        });
        let err = shared_err();
        self.aio_opt_common(
            OptType::LIST_META_CONTEXT,
            Some(capture_err(&err)),
            None,
            Some(visitor),
        )?;
        self.wait_for_option()?;
        if let Some(errno) = take_err(&err) {
            return Err(set_error(
                errno,
                "server replied with error to list meta context request",
            ));
        }
        let count = *count.lock().expect("no poisoned lock");
        Ok(count)
    }

    /// Issue `NBD_OPT_SET_META_CONTEXT` for the configured meta contexts
    /// without waiting.
    pub fn aio_opt_set_meta_context(
        &mut self,
        completion: Option<CompletionCallback>,
    ) -> Result<()> {
        set_context("nbd_aio_opt_set_meta_context");
        self.require_fixed_newstyle()?;
        if !self.structured_replies {
            return Err(set_error(Errno::ENOTSUP, "server lacks structured replies"));
        }
        self.aio_opt_common(OptType::SET_META_CONTEXT, completion, None, None)
    }

    /// Negotiate the configured meta contexts; returns how many the server
    /// accepted.
    pub fn opt_set_meta_context(&mut self) -> Result<usize> {
        set_context("nbd_opt_set_meta_context");
        self.require_fixed_newstyle()?;
        if !self.structured_replies {
            return Err(set_error(Errno::ENOTSUP, "server lacks structured replies"));
        }
        let err = shared_err();
        self.aio_opt_common(OptType::SET_META_CONTEXT, Some(capture_err(&err)), None, None)?;
        self.wait_for_option()?;
        if let Some(errno) = take_err(&err) {
            return Err(set_error(
                errno,
                "server replied with error to set meta context request",
            ));
        }
        Ok(self.meta_contexts.len())
    }

    // ----- STRUCTURED_REPLY -----

    /// Issue `NBD_OPT_STRUCTURED_REPLY` without waiting.
    pub fn aio_opt_structured_reply(
        &mut self,
        completion: Option<CompletionCallback>,
    ) -> Result<()> {
        set_context("nbd_aio_opt_structured_reply");
        self.require_fixed_newstyle()?;
        self.aio_opt_common(OptType::STRUCTURED_REPLY, completion, None, None)
    }

    /// Attempt structured reply negotiation; returns whether the server
    /// agreed.
    pub fn opt_structured_reply(&mut self) -> Result<bool> {
        set_context("nbd_opt_structured_reply");
        self.require_fixed_newstyle()?;
        self.aio_opt_common(OptType::STRUCTURED_REPLY, None, None, None)?;
        self.wait_for_option()?;
        Ok(self.structured_replies)
    }

    // ----- STARTTLS -----

    /// Issue `NBD_OPT_STARTTLS` without waiting.
    pub fn aio_opt_starttls(&mut self, completion: Option<CompletionCallback>) -> Result<()> {
        set_context("nbd_aio_opt_starttls");
        self.require_fixed_newstyle()?;
        self.aio_opt_common(OptType::STARTTLS, completion, None, None)
    }

    /// Attempt a TLS upgrade from option mode; returns whether the session
    /// is now encrypted. A refusal is fatal only when TLS is `Require`.
    pub fn opt_starttls(&mut self) -> Result<bool> {
        set_context("nbd_opt_starttls");
        self.require_fixed_newstyle()?;
        self.aio_opt_common(OptType::STARTTLS, None, None, None)?;
        self.wait_for_option()?;
        Ok(self.tls_negotiated)
    }
}

type SharedErr = Arc<Mutex<Option<Option<Errno>>>>;

fn shared_err() -> SharedErr {
    Arc::new(Mutex::new(None))
}

fn capture_err(cell: &SharedErr) -> CompletionCallback {
    let cell = cell.clone();
    Box::new(move |result| {
        *cell.lock().expect("no poisoned lock") = Some(result.err());
    })
}

fn take_err(cell: &SharedErr) -> Option<Errno> {
    cell.lock().expect("no poisoned lock").take().flatten()
}
