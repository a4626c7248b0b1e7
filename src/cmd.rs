//! The command engine: queuing, strict-mode validation and retirement.
//!
//! Commands move through three queues on the handle: to-issue (created but
//! not yet on the wire), in-flight (request sent, reply outstanding) and
//! done (reply complete, waiting for the caller to retire them). Requests
//! are sent in the order of their API calls; completions arrive in whatever
//! order the server chooses.
//!
//! Each operation comes in a blocking form (`pread`) and an asynchronous
//! form (`aio_pread`) returning a cookie; both run the same validation and
//! queuing path.

use log::debug;
use nix::errno::Errno;

use crate::errors::{set_context, set_error, Result};
use crate::handle::{Handle, StrictFlags};
use crate::proto::{Cmd, CmdFlags, TransmitFlags, MAX_REQUEST_SIZE};
use crate::states::{Event, State};

/// What a structured read chunk describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Data bytes copied into the read buffer.
    Data,
    /// A hole; the covered range has been zero-filled.
    Hole,
    /// An error chunk with an offset inside this command's range.
    Error,
}

/// Per-chunk callback for structured reads: `(payload, offset, kind)`.
/// Returning `Err` stores the command's first error.
pub type ChunkCallback =
    Box<dyn FnMut(&[u8], u64, ChunkKind) -> std::result::Result<(), Errno> + Send>;

/// Extent callback for block status: `(meta context name, offset,
/// (length, flags) pairs)`. Returning `Err` stores the command's first
/// error.
pub type ExtentCallback =
    Box<dyn FnMut(&str, u64, &[(u32, u32)]) -> std::result::Result<(), Errno> + Send>;

/// Completion callback, invoked exactly once when the command's reply
/// finishes. The command is retired immediately afterwards.
pub type CompletionCallback = Box<dyn FnMut(std::result::Result<(), Errno>) + Send>;

/// Per-export callback for `opt_list`: `(name, description)`.
pub type ListCallback = Box<dyn FnMut(&str, &str) + Send>;

/// Per-context callback for `opt_list_meta_context`.
pub type ContextCallback = Box<dyn FnMut(&str) + Send>;

/// One outstanding request.
pub(crate) struct Command {
    pub flags: CmdFlags,
    pub typ: Cmd,
    pub cookie: u64,
    pub offset: u64,
    pub count: u32,
    /// Read target or write payload; owned by the engine while the command
    /// is outstanding and handed back at retirement.
    pub data: Vec<u8>,
    pub chunk_cb: Option<ChunkCallback>,
    pub extent_cb: Option<ExtentCallback>,
    pub completion_cb: Option<CompletionCallback>,
    /// For READ, true once at least one data or payload chunk arrived.
    pub data_seen: bool,
    /// First error seen for this command; later errors do not overwrite.
    pub error: Option<Errno>,
}

impl Command {
    /// Record an error if the command does not already have one.
    pub fn set_error(&mut self, errno: Errno) {
        if self.error.is_none() {
            self.error = Some(errno);
        }
    }

    /// The error the caller should observe: a READ that produced no data at
    /// all cannot be treated as success.
    pub fn effective_error(&self) -> Option<Errno> {
        if self.error.is_none() && self.typ == Cmd::READ && !self.data_seen && self.count > 0 {
            return Some(Errno::EIO);
        }
        self.error
    }
}

/// Completion state reported by [`Handle::aio_command_completed`].
#[derive(Debug)]
pub enum CommandStatus {
    /// The command has not completed yet; keep driving the handle.
    Pending,
    /// The command completed successfully; for reads this is the filled
    /// buffer, for writes the payload handed back.
    Complete(Vec<u8>),
}

struct CommandArgs {
    flags: CmdFlags,
    typ: Cmd,
    offset: u64,
    count: u64,
    /// errno to use for a bounds failure (writes report `ENOSPC`).
    count_err: Option<Errno>,
    data: Vec<u8>,
    chunk_cb: Option<ChunkCallback>,
    extent_cb: Option<ExtentCallback>,
    completion_cb: Option<CompletionCallback>,
}

impl Handle {
    fn require_transmitting(&self) -> Result<()> {
        if !self.aio_is_ready() && !self.aio_is_processing() {
            return Err(set_error(
                Errno::EINVAL,
                "handle is not in the transmission phase",
            ));
        }
        Ok(())
    }

    fn eflag(&self, flag: TransmitFlags) -> bool {
        self.eflags.contains(flag)
    }

    /// Reject a write-class command on a read-only export, and any flag the
    /// server did not advertise support for.
    fn check_command_flags(&self, typ: Cmd, flags: CmdFlags) -> Result<()> {
        let allowed = match typ {
            Cmd::READ => CmdFlags::DF,
            Cmd::WRITE | Cmd::TRIM => CmdFlags::FUA,
            Cmd::WRITE_ZEROES => CmdFlags::FUA | CmdFlags::NO_HOLE | CmdFlags::FAST_ZERO,
            Cmd::BLOCK_STATUS => CmdFlags::REQ_ONE,
            _ => CmdFlags::empty(),
        };
        if !(flags - allowed).is_empty() {
            return Err(set_error(
                Errno::EINVAL,
                format!("invalid flags for {}", typ.name()),
            ));
        }

        let writes = matches!(typ, Cmd::WRITE | Cmd::TRIM | Cmd::WRITE_ZEROES);
        if self.strict.contains(StrictFlags::AUTO_FLAG)
            && writes
            && self.eflag(TransmitFlags::READ_ONLY)
        {
            return Err(set_error(
                Errno::EPERM,
                "server does not support write operations",
            ));
        }

        if self.strict.contains(StrictFlags::COMMANDS) {
            let advertised = match typ {
                Cmd::TRIM => self.eflag(TransmitFlags::SEND_TRIM),
                Cmd::WRITE_ZEROES => self.eflag(TransmitFlags::SEND_WRITE_ZEROES),
                Cmd::FLUSH => self.eflag(TransmitFlags::SEND_FLUSH),
                Cmd::CACHE => self.eflag(TransmitFlags::SEND_CACHE),
                _ => true,
            };
            if !advertised {
                return Err(set_error(
                    Errno::EINVAL,
                    format!("server does not support {} operations", typ.name()),
                ));
            }
            if flags.contains(CmdFlags::FUA) && !self.eflag(TransmitFlags::SEND_FUA) {
                return Err(set_error(
                    Errno::EINVAL,
                    "server does not support the FUA flag",
                ));
            }
            if flags.contains(CmdFlags::DF) && !self.eflag(TransmitFlags::SEND_DF) {
                return Err(set_error(
                    Errno::EINVAL,
                    "server does not support the DF flag",
                ));
            }
            if flags.contains(CmdFlags::FAST_ZERO) && !self.eflag(TransmitFlags::SEND_FAST_ZERO) {
                return Err(set_error(
                    Errno::EINVAL,
                    "server does not support the fast zero flag",
                ));
            }
        }
        Ok(())
    }

    /// Queue validation and submission shared by all commands. On success
    /// the command is on the to-issue queue (and the state machine has been
    /// kicked if it was idle); on failure the callbacks are dropped without
    /// being invoked.
    fn command_common(&mut self, args: CommandArgs) -> Result<u64> {
        self.require_transmitting()?;

        if self.disconnect_request {
            return Err(set_error(
                Errno::EINVAL,
                "cannot request more commands after NBD_CMD_DISC",
            ));
        }

        self.check_command_flags(args.typ, args.flags)?;

        if self.strict.contains(StrictFlags::FLAGS) && !CmdFlags::known().contains(args.flags) {
            return Err(set_error(Errno::EINVAL, "unknown command flags"));
        }

        if args.count_err.is_some() {
            if self.strict.contains(StrictFlags::ZERO_SIZE) && args.count == 0 {
                return Err(set_error(Errno::EINVAL, "count cannot be 0"));
            }

            if self.strict.contains(StrictFlags::BOUNDS)
                && (args.offset > self.exportsize || args.count > self.exportsize - args.offset)
            {
                return Err(set_error(
                    args.count_err.unwrap_or(Errno::EINVAL),
                    "request out of bounds",
                ));
            }

            if self.block_minimum != 0
                && self.strict.contains(StrictFlags::ALIGN)
                && (args.offset | args.count) & u64::from(self.block_minimum - 1) != 0
            {
                return Err(set_error(Errno::EINVAL, "request is unaligned"));
            }
        }

        match args.typ {
            // Commands which send or receive data are limited to the request
            // size cap; writes additionally to the negotiated payload
            // maximum.
            Cmd::WRITE | Cmd::READ => {
                if args.typ == Cmd::WRITE
                    && self.strict.contains(StrictFlags::PAYLOAD)
                    && args.count > u64::from(self.payload_maximum)
                {
                    return Err(set_error(
                        Errno::ERANGE,
                        format!(
                            "request too large: maximum payload size is {}",
                            self.payload_maximum
                        ),
                    ));
                }
                if args.count > u64::from(MAX_REQUEST_SIZE) {
                    return Err(set_error(
                        Errno::ERANGE,
                        format!("request too large: maximum request size is {MAX_REQUEST_SIZE}"),
                    ));
                }
            }
            // Other commands are limited by the 32-bit count field on the
            // wire.
            _ => {
                if self.strict.contains(StrictFlags::ONE_SIZE) && args.count > u64::from(u32::MAX) {
                    return Err(set_error(
                        Errno::ERANGE,
                        format!("request too large: maximum request size is {}", u32::MAX),
                    ));
                }
                if args.count > u64::from(u32::MAX) {
                    return Err(set_error(Errno::ERANGE, "request does not fit in 32 bits"));
                }
            }
        }

        let mut data = args.data;
        if args.typ == Cmd::READ && self.pread_initialize {
            // A non-compliant structured-reply server may fail to cover the
            // whole buffer; pre-zeroing means the caller still never sees
            // stale bytes.
            data.fill(0);
        }

        let cookie = self.next_cookie();
        let cmd = Command {
            flags: args.flags,
            typ: args.typ,
            cookie,
            offset: args.offset,
            count: args.count as u32,
            data,
            chunk_cb: args.chunk_cb,
            extent_cb: args.extent_cb,
            completion_cb: args.completion_cb,
            data_seen: false,
            error: None,
        };

        // Add the command to the end of the queue. Kick the state machine
        // if no other command is being processed; otherwise it is picked up
        // on a future cycle around to READY. Beyond this point we have to
        // return a cookie, even if kicking the machine detects a failure:
        // the caller will learn about a dead handle from the APIs it must
        // call anyway to collect results.
        let kick = self.cmds_to_issue.is_empty() && self.state == State::Ready;
        self.cmds_to_issue.push_back(cmd);
        if kick && self.run_machine(Event::CmdIssue).is_err() {
            debug!(target: "nbd", "{}: command queued, ignoring state machine failure", self.hname);
        }

        Ok(cookie)
    }

    fn pread_common(
        &mut self,
        buf: Vec<u8>,
        offset: u64,
        chunk: Option<ChunkCallback>,
        flags: CmdFlags,
        completion: Option<CompletionCallback>,
    ) -> Result<u64> {
        let count = buf.len() as u64;
        self.command_common(CommandArgs {
            flags,
            typ: Cmd::READ,
            offset,
            count,
            count_err: Some(Errno::EINVAL),
            data: buf,
            chunk_cb: chunk,
            extent_cb: None,
            completion_cb: completion,
        })
    }

    fn pwrite_common(
        &mut self,
        data: Vec<u8>,
        offset: u64,
        flags: CmdFlags,
        completion: Option<CompletionCallback>,
    ) -> Result<u64> {
        let count = data.len() as u64;
        self.command_common(CommandArgs {
            flags,
            typ: Cmd::WRITE,
            offset,
            count,
            count_err: Some(Errno::ENOSPC),
            data,
            chunk_cb: None,
            extent_cb: None,
            completion_cb: completion,
        })
    }

    fn simple_common(
        &mut self,
        typ: Cmd,
        count: u64,
        offset: u64,
        count_err: Option<Errno>,
        flags: CmdFlags,
        extent: Option<ExtentCallback>,
        completion: Option<CompletionCallback>,
    ) -> Result<u64> {
        self.command_common(CommandArgs {
            flags,
            typ,
            offset,
            count,
            count_err,
            data: Vec::new(),
            chunk_cb: None,
            extent_cb: extent,
            completion_cb: completion,
        })
    }

    fn block_status_checks(&self) -> Result<()> {
        if self.strict.contains(StrictFlags::COMMANDS) {
            if !self.structured_replies {
                return Err(set_error(
                    Errno::ENOTSUP,
                    "server does not support structured replies",
                ));
            }
            if !self.meta_valid || self.meta_contexts.is_empty() {
                return Err(set_error(
                    Errno::ENOTSUP,
                    "did not negotiate any metadata contexts, either you did not \
                     call nbd_add_meta_context before connecting or the server \
                     does not support it",
                ));
            }
        }
        Ok(())
    }

    // ----- aio command submission -----

    /// Queue a read of `buf.len()` bytes at `offset`. The buffer is owned
    /// by the handle until retirement hands it back.
    pub fn aio_pread(
        &mut self,
        buf: Vec<u8>,
        offset: u64,
        flags: CmdFlags,
        completion: Option<CompletionCallback>,
    ) -> Result<u64> {
        set_context("nbd_aio_pread");
        self.pread_common(buf, offset, None, flags, completion)
    }

    /// Like [`Handle::aio_pread`], with a callback invoked for every data,
    /// hole or error chunk of a structured reply.
    pub fn aio_pread_structured(
        &mut self,
        buf: Vec<u8>,
        offset: u64,
        chunk: ChunkCallback,
        flags: CmdFlags,
        completion: Option<CompletionCallback>,
    ) -> Result<u64> {
        set_context("nbd_aio_pread_structured");
        self.pread_common(buf, offset, Some(chunk), flags, completion)
    }

    /// Queue a write of `data` at `offset`. The payload is owned by the
    /// handle until retirement hands it back.
    pub fn aio_pwrite(
        &mut self,
        data: Vec<u8>,
        offset: u64,
        flags: CmdFlags,
        completion: Option<CompletionCallback>,
    ) -> Result<u64> {
        set_context("nbd_aio_pwrite");
        self.pwrite_common(data, offset, flags, completion)
    }

    /// Queue a flush.
    pub fn aio_flush(
        &mut self,
        flags: CmdFlags,
        completion: Option<CompletionCallback>,
    ) -> Result<u64> {
        set_context("nbd_aio_flush");
        self.simple_common(Cmd::FLUSH, 0, 0, None, flags, None, completion)
    }

    /// Queue a trim of `count` bytes at `offset`.
    pub fn aio_trim(
        &mut self,
        count: u64,
        offset: u64,
        flags: CmdFlags,
        completion: Option<CompletionCallback>,
    ) -> Result<u64> {
        set_context("nbd_aio_trim");
        self.simple_common(
            Cmd::TRIM,
            count,
            offset,
            Some(Errno::ENOSPC),
            flags,
            None,
            completion,
        )
    }

    /// Queue a cache (readahead) of `count` bytes at `offset`.
    pub fn aio_cache(
        &mut self,
        count: u64,
        offset: u64,
        flags: CmdFlags,
        completion: Option<CompletionCallback>,
    ) -> Result<u64> {
        set_context("nbd_aio_cache");
        self.simple_common(
            Cmd::CACHE,
            count,
            offset,
            Some(Errno::EINVAL),
            flags,
            None,
            completion,
        )
    }

    /// Queue a write-zeroes of `count` bytes at `offset`.
    pub fn aio_zero(
        &mut self,
        count: u64,
        offset: u64,
        flags: CmdFlags,
        completion: Option<CompletionCallback>,
    ) -> Result<u64> {
        set_context("nbd_aio_zero");
        self.simple_common(
            Cmd::WRITE_ZEROES,
            count,
            offset,
            Some(Errno::ENOSPC),
            flags,
            None,
            completion,
        )
    }

    /// Queue a block-status query over `count` bytes at `offset`. The
    /// extent callback is invoked once per context per structured chunk.
    pub fn aio_block_status(
        &mut self,
        count: u64,
        offset: u64,
        extent: ExtentCallback,
        flags: CmdFlags,
        completion: Option<CompletionCallback>,
    ) -> Result<u64> {
        set_context("nbd_aio_block_status");
        self.block_status_checks()?;
        self.simple_common(
            Cmd::BLOCK_STATUS,
            count,
            offset,
            Some(Errno::EINVAL),
            flags,
            Some(extent),
            completion,
        )
    }

    /// Queue an orderly disconnect. After this no further commands are
    /// accepted; drive the handle until it reaches `CLOSED`.
    pub fn aio_disconnect(&mut self) -> Result<()> {
        set_context("nbd_aio_disconnect");
        self.simple_common(Cmd::DISCONNECT, 0, 0, None, CmdFlags::empty(), None, None)?;
        self.disconnect_request = true;
        Ok(())
    }

    // ----- completion and retirement -----

    /// Ask whether the command identified by `cookie` has completed.
    ///
    /// `Ok(Pending)` while the reply is outstanding; `Ok(Complete(data))`
    /// retires a successful command and hands back its buffer; `Err` retires
    /// a failed command with its first error.
    pub fn aio_command_completed(&mut self, cookie: u64) -> Result<CommandStatus> {
        set_context("nbd_aio_command_completed");
        self.aio_command_completed_internal(cookie)
    }

    pub(crate) fn aio_command_completed_internal(&mut self, cookie: u64) -> Result<CommandStatus> {
        if cookie < 1 {
            return Err(set_error(
                Errno::EINVAL,
                format!("invalid aio cookie {cookie}"),
            ));
        }

        let idx = match self
            .cmds_done
            .iter()
            .position(|c| c.cookie == cookie && c.typ != Cmd::DISCONNECT)
        {
            Some(idx) => idx,
            None => return Ok(CommandStatus::Pending),
        };

        let cmd = self.cmds_done.remove(idx).expect("index from position");
        match cmd.effective_error() {
            None => Ok(CommandStatus::Complete(cmd.data)),
            Some(errno) => Err(set_error(
                errno,
                format!("{}: command failed", cmd.typ.name()),
            )),
        }
    }

    /// Cookie of the oldest completed-but-unretired command, without
    /// consuming it. `Ok(None)` when commands are outstanding but none has
    /// completed yet.
    pub fn aio_peek_command_completed(&mut self) -> Result<Option<u64>> {
        set_context("nbd_aio_peek_command_completed");

        // An internally generated DISC has no caller-visible cookie.
        if self
            .cmds_done
            .front()
            .is_some_and(|c| c.typ == Cmd::DISCONNECT)
        {
            self.cmds_done.pop_front();
        }

        if let Some(cmd) = self.cmds_done.front() {
            return Ok(Some(cmd.cookie));
        }

        if !self.cmds_in_flight.is_empty() || !self.cmds_to_issue.is_empty() {
            return Ok(None);
        }
        Err(set_error(Errno::EINVAL, "no commands are in flight"))
    }

    /// Number of commands issued or queued but not yet completed.
    pub fn aio_in_flight(&self) -> usize {
        self.cmds_to_issue.len() + self.cmds_in_flight.len()
    }

    // ----- blocking wrappers -----

    fn wait_for_command(&mut self, cookie: u64) -> Result<Vec<u8>> {
        loop {
            match self.aio_command_completed_internal(cookie)? {
                CommandStatus::Complete(data) => return Ok(data),
                CommandStatus::Pending => {
                    self.poll_internal(-1)?;
                }
            }
        }
    }

    /// Read `buf.len()` bytes at `offset` and wait for the reply.
    pub fn pread(&mut self, buf: &mut [u8], offset: u64, flags: CmdFlags) -> Result<()> {
        set_context("nbd_pread");
        let scratch = vec![0u8; buf.len()];
        let cookie = self.pread_common(scratch, offset, None, flags, None)?;
        let data = self.wait_for_command(cookie)?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    /// Read with a chunk callback and wait for the reply.
    pub fn pread_structured(
        &mut self,
        buf: &mut [u8],
        offset: u64,
        chunk: ChunkCallback,
        flags: CmdFlags,
    ) -> Result<()> {
        set_context("nbd_pread_structured");
        let scratch = vec![0u8; buf.len()];
        let cookie = self.pread_common(scratch, offset, Some(chunk), flags, None)?;
        let data = self.wait_for_command(cookie)?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    /// Write `data` at `offset` and wait for the reply. The data is
    /// borrowed only for the duration of this call.
    pub fn pwrite(&mut self, data: &[u8], offset: u64, flags: CmdFlags) -> Result<()> {
        set_context("nbd_pwrite");
        let cookie = self.pwrite_common(data.to_vec(), offset, flags, None)?;
        self.wait_for_command(cookie)?;
        Ok(())
    }

    /// Flush and wait for the reply.
    pub fn flush(&mut self, flags: CmdFlags) -> Result<()> {
        set_context("nbd_flush");
        let cookie = self.simple_common(Cmd::FLUSH, 0, 0, None, flags, None, None)?;
        self.wait_for_command(cookie)?;
        Ok(())
    }

    /// Trim and wait for the reply.
    pub fn trim(&mut self, count: u64, offset: u64, flags: CmdFlags) -> Result<()> {
        set_context("nbd_trim");
        let cookie = self.simple_common(
            Cmd::TRIM,
            count,
            offset,
            Some(Errno::ENOSPC),
            flags,
            None,
            None,
        )?;
        self.wait_for_command(cookie)?;
        Ok(())
    }

    /// Cache (readahead) and wait for the reply.
    pub fn cache(&mut self, count: u64, offset: u64, flags: CmdFlags) -> Result<()> {
        set_context("nbd_cache");
        let cookie = self.simple_common(
            Cmd::CACHE,
            count,
            offset,
            Some(Errno::EINVAL),
            flags,
            None,
            None,
        )?;
        self.wait_for_command(cookie)?;
        Ok(())
    }

    /// Write zeroes and wait for the reply.
    pub fn zero(&mut self, count: u64, offset: u64, flags: CmdFlags) -> Result<()> {
        set_context("nbd_zero");
        let cookie = self.simple_common(
            Cmd::WRITE_ZEROES,
            count,
            offset,
            Some(Errno::ENOSPC),
            flags,
            None,
            None,
        )?;
        self.wait_for_command(cookie)?;
        Ok(())
    }

    /// Query block status and wait for the reply; the extent callback runs
    /// from inside this call.
    pub fn block_status(
        &mut self,
        count: u64,
        offset: u64,
        extent: ExtentCallback,
        flags: CmdFlags,
    ) -> Result<()> {
        set_context("nbd_block_status");
        self.block_status_checks()?;
        let cookie = self.simple_common(
            Cmd::BLOCK_STATUS,
            count,
            offset,
            Some(Errno::EINVAL),
            flags,
            Some(extent),
            None,
        )?;
        self.wait_for_command(cookie)?;
        Ok(())
    }

    /// Orderly shutdown: queue `DISC` and drive the handle to `CLOSED`.
    pub fn shutdown(&mut self) -> Result<()> {
        set_context("nbd_shutdown");
        if !self.disconnect_request {
            self.simple_common(Cmd::DISCONNECT, 0, 0, None, CmdFlags::empty(), None, None)?;
            self.disconnect_request = true;
        }
        while !self.aio_is_closed() && !self.aio_is_dead() {
            self.poll_internal(-1)?;
        }
        Ok(())
    }
}
