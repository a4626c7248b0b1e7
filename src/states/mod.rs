//! The connection state machine.
//!
//! One finite machine drives a connection through connect, handshake,
//! optional TLS upgrade, option negotiation and the transmission phase.
//! Each state performs one bounded piece of I/O against the transport and
//! either continues to the next state or yields back to the caller, which
//! then waits for fd readiness in the direction reported by
//! [`Handle::aio_get_direction`].
//!
//! The same machine serves the blocking and non-blocking APIs: blocking
//! calls loop poll → notify → step until a target state is reached,
//! non-blocking callers step once per readiness notification.

pub(crate) mod connect;
pub(crate) mod handshake;
pub(crate) mod reply;

use std::os::fd::{BorrowedFd, RawFd};
use std::path::PathBuf;

use log::debug;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::errors::{set_context, set_error, Error, Result};
use crate::handle::Handle;
use crate::transport::{AioDirection, TransportError};

/// What the caller wants to connect to. Recorded on the handle before the
/// connect states run.
#[derive(Debug, Clone)]
pub(crate) enum ConnectSpec {
    Tcp { hostname: String, port: String },
    Unix(PathBuf),
    Vsock { cid: u32, port: u32 },
    /// A pre-connected socket handed in by the caller.
    Socket,
    Command(Vec<String>),
    SystemdSocketActivation(Vec<String>),
}

/// External events fed into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    CmdConnect,
    CmdIssue,
    NotifyRead,
    NotifyWrite,
}

/// Whether a state function finished its work or must wait for the fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Yield,
}

pub(crate) type StepResult = Result<Flow>;

/// Progress of a cursor-driven read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoProgress {
    Done,
    WouldBlock,
}

/// Connection states. Names follow the protocol phases; the `Opt*` groups
/// are the fixed-newstyle option sub-machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Created,
    // connecting
    ConnectStart,
    Connecting,
    ConnectTcpStart,
    ConnectTcpConnect,
    ConnectTcpConnecting,
    ConnectTcpNext,
    ConnectCommandStart,
    ConnectSaStart,
    // server greeting
    PrepareForMagic,
    RecvMagic,
    OldstyleRecvRemaining,
    NewstyleRecvGflags,
    NewstyleSendCflags,
    // option negotiation
    OptStarttlsStart,
    OptStarttlsSend,
    OptStarttlsRecvReply,
    OptStarttlsRecvPayload,
    TlsHandshake,
    OptStructuredReplyStart,
    OptStructuredReplySend,
    OptStructuredReplyRecvReply,
    OptStructuredReplyRecvPayload,
    OptMetaContextStart,
    OptMetaContextSend,
    OptMetaContextRecvReply,
    OptMetaContextRecvPayload,
    OptGoStart,
    OptGoSend,
    OptGoRecvReply,
    OptGoRecvPayload,
    OptExportNameStart,
    OptExportNameSend,
    OptExportNameRecvReply,
    OptListStart,
    OptListSend,
    OptListRecvReply,
    OptListRecvPayload,
    OptAbortStart,
    OptAbortSend,
    OptAbortShutWrites,
    /// Idle after the handshake under opt mode; option APIs run from here.
    Negotiating,
    /// Idle in the transmission phase.
    Ready,
    // issuing
    IssueCommandStart,
    IssueCommandSendRequest,
    IssueCommandSendWritePayload,
    // receiving
    ReplyStart,
    ReplyRecvMagic,
    ReplySimpleRecvHeader,
    ReplySimpleRecvPayload,
    ReplyChunkRecvHeader,
    ReplyChunkRecvOffsetData,
    ReplyChunkRecvData,
    ReplyChunkRecvOffsetHole,
    ReplyChunkRecvBsEntries,
    ReplyChunkRecvError,
    ReplyChunkRecvErrorMessage,
    ReplyChunkRecvErrorTail,
    ReplyChunkFinish,
    FinishCommand,
    Dead,
    Closed,
}

impl Handle {
    // ----- state group predicates -----

    /// Handle was created but connecting has not started.
    pub fn aio_is_created(&self) -> bool {
        self.state == State::Created
    }

    /// Connecting or in the middle of the handshake.
    pub fn aio_is_connecting(&self) -> bool {
        use State::*;
        matches!(
            self.state,
            ConnectStart
                | Connecting
                | ConnectTcpStart
                | ConnectTcpConnect
                | ConnectTcpConnecting
                | ConnectTcpNext
                | ConnectCommandStart
                | ConnectSaStart
                | PrepareForMagic
                | RecvMagic
                | OldstyleRecvRemaining
                | NewstyleRecvGflags
                | NewstyleSendCflags
                | OptStarttlsStart
                | OptStarttlsSend
                | OptStarttlsRecvReply
                | OptStarttlsRecvPayload
                | TlsHandshake
                | OptStructuredReplyStart
                | OptStructuredReplySend
                | OptStructuredReplyRecvReply
                | OptStructuredReplyRecvPayload
                | OptMetaContextStart
                | OptMetaContextSend
                | OptMetaContextRecvReply
                | OptMetaContextRecvPayload
                | OptGoStart
                | OptGoSend
                | OptGoRecvReply
                | OptGoRecvPayload
                | OptExportNameStart
                | OptExportNameSend
                | OptExportNameRecvReply
                | OptListStart
                | OptListSend
                | OptListRecvReply
                | OptListRecvPayload
                | OptAbortStart
                | OptAbortSend
                | OptAbortShutWrites
        )
    }

    /// Idle after the handshake, in option mode.
    pub fn aio_is_negotiating(&self) -> bool {
        self.state == State::Negotiating
    }

    /// Idle in the transmission phase.
    pub fn aio_is_ready(&self) -> bool {
        self.state == State::Ready
    }

    /// In the middle of issuing a request or receiving a reply.
    pub fn aio_is_processing(&self) -> bool {
        use State::*;
        matches!(
            self.state,
            IssueCommandStart
                | IssueCommandSendRequest
                | IssueCommandSendWritePayload
                | ReplyStart
                | ReplyRecvMagic
                | ReplySimpleRecvHeader
                | ReplySimpleRecvPayload
                | ReplyChunkRecvHeader
                | ReplyChunkRecvOffsetData
                | ReplyChunkRecvData
                | ReplyChunkRecvOffsetHole
                | ReplyChunkRecvBsEntries
                | ReplyChunkRecvError
                | ReplyChunkRecvErrorMessage
                | ReplyChunkRecvErrorTail
                | ReplyChunkFinish
                | FinishCommand
        )
    }

    /// The connection failed and cannot be used again.
    pub fn aio_is_dead(&self) -> bool {
        self.state == State::Dead
    }

    /// The connection was closed in an orderly way.
    pub fn aio_is_closed(&self) -> bool {
        self.state == State::Closed
    }

    // ----- event-loop integration -----

    /// The fd to poll for readiness.
    pub fn aio_get_fd(&self) -> Result<RawFd> {
        set_context("nbd_aio_get_fd");
        match &self.sock {
            Some(sock) => Ok(sock.poll_fd()),
            None => Err(set_error(
                Errno::EINVAL,
                "connection is not in a connected state",
            )),
        }
    }

    /// Which direction(s) the caller must wait on before the next
    /// notification. Empty when the machine is not waiting on the fd.
    pub fn aio_get_direction(&self) -> AioDirection {
        use State::*;
        match self.state {
            Ready => {
                if !self.cmds_to_issue.is_empty() || self.in_write_header || self.in_write_payload {
                    AioDirection::BOTH
                } else {
                    AioDirection::READ
                }
            }
            Connecting | ConnectTcpConnecting => AioDirection::WRITE,
            NewstyleSendCflags | OptStarttlsSend | OptStructuredReplySend | OptMetaContextSend
            | OptGoSend | OptExportNameSend | OptListSend | OptAbortSend | OptAbortShutWrites
            | IssueCommandSendRequest | IssueCommandSendWritePayload => AioDirection::WRITE,
            RecvMagic | OldstyleRecvRemaining | NewstyleRecvGflags | OptStarttlsRecvReply
            | OptStarttlsRecvPayload | OptStructuredReplyRecvReply
            | OptStructuredReplyRecvPayload | OptMetaContextRecvReply
            | OptMetaContextRecvPayload | OptGoRecvReply | OptGoRecvPayload
            | OptExportNameRecvReply | OptListRecvReply | OptListRecvPayload | ReplyStart
            | ReplyRecvMagic | ReplySimpleRecvHeader | ReplySimpleRecvPayload
            | ReplyChunkRecvHeader | ReplyChunkRecvOffsetData | ReplyChunkRecvData
            | ReplyChunkRecvOffsetHole | ReplyChunkRecvBsEntries | ReplyChunkRecvError
            | ReplyChunkRecvErrorMessage | ReplyChunkRecvErrorTail => AioDirection::READ,
            TlsHandshake => self.tls_dir,
            _ => AioDirection::empty(),
        }
    }

    /// Tell the machine the fd became readable.
    pub fn aio_notify_read(&mut self) -> Result<()> {
        set_context("nbd_aio_notify_read");
        self.run_machine(Event::NotifyRead)
    }

    /// Tell the machine the fd became writable.
    pub fn aio_notify_write(&mut self) -> Result<()> {
        set_context("nbd_aio_notify_write");
        self.run_machine(Event::NotifyWrite)
    }

    /// One round of `poll(2)` on the handle's fd, dispatching the resulting
    /// notification. A timeout of -1 waits forever; returns `Ok(false)` on
    /// timeout, `Ok(true)` if an event was dispatched.
    pub fn poll(&mut self, timeout: i32) -> Result<bool> {
        set_context("nbd_poll");
        self.do_poll(None, timeout)
    }

    /// Like [`Handle::poll`], also watching `extra_fd` for readability so
    /// callers can interrupt a blocked wait.
    pub fn poll2(&mut self, extra_fd: RawFd, timeout: i32) -> Result<bool> {
        set_context("nbd_poll2");
        self.do_poll(Some(extra_fd), timeout)
    }

    pub(crate) fn poll_internal(&mut self, timeout: i32) -> Result<bool> {
        self.do_poll(None, timeout)
    }

    fn do_poll(&mut self, extra_fd: Option<RawFd>, timeout: i32) -> Result<bool> {
        let direction = self.aio_get_direction();
        if direction.is_empty() {
            return Err(set_error(
                Errno::EINVAL,
                format!("nothing to poll for in state {:?}", self.state),
            ));
        }

        // TLS may hold decrypted bytes a poll would never report.
        if direction.contains(AioDirection::READ)
            && self.sock.as_ref().is_some_and(|s| s.pending())
        {
            self.run_machine(Event::NotifyRead)?;
            return Ok(true);
        }

        let fd = self.aio_get_fd()?;
        let mut events = PollFlags::empty();
        if direction.contains(AioDirection::READ) {
            events |= PollFlags::POLLIN;
        }
        if direction.contains(AioDirection::WRITE) {
            events |= PollFlags::POLLOUT;
        }

        let poll_timeout = if timeout < 0 {
            PollTimeout::NONE
        } else {
            PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX)
        };

        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let extra = extra_fd.map(|fd| unsafe { BorrowedFd::borrow_raw(fd) });
        let revents = loop {
            let mut fds = Vec::with_capacity(2);
            fds.push(PollFd::new(borrowed, events));
            if let Some(extra) = extra {
                fds.push(PollFd::new(extra, PollFlags::POLLIN));
            }
            match poll(&mut fds, poll_timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => break fds[0].revents().unwrap_or(PollFlags::empty()),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(set_error(errno, "poll")),
            }
        };

        // POLLIN and POLLOUT may both be set, but dispatching both
        // notifications back to back is wrong: the first may change the
        // handle state and invalidate the second. Prefer the read side,
        // since a reply is always for a command older than anything we are
        // still trying to write.
        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
            self.run_machine(Event::NotifyRead)?;
        } else if revents.contains(PollFlags::POLLOUT) {
            self.run_machine(Event::NotifyWrite)?;
        } else if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            return Err(set_error(
                Errno::ENOTCONN,
                "server closed socket unexpectedly",
            ));
        }
        Ok(true)
    }

    // ----- the driver -----

    /// Feed one external event into the machine and run states until one
    /// yields or the connection reaches a terminal state.
    pub(crate) fn run_machine(&mut self, ev: Event) -> Result<()> {
        use State::*;

        // Event-specific entry transitions; all other (state, event) pairs
        // simply re-enter the current state, which re-attempts its I/O.
        match (self.state, ev) {
            (Created, Event::CmdConnect) => {
                self.state = match self.connect_spec {
                    Some(ConnectSpec::Tcp { .. }) => ConnectTcpStart,
                    Some(ConnectSpec::Command(_)) => ConnectCommandStart,
                    Some(ConnectSpec::SystemdSocketActivation(_)) => ConnectSaStart,
                    Some(ConnectSpec::Socket) => PrepareForMagic,
                    Some(_) => ConnectStart,
                    None => {
                        return Err(set_error(Errno::EINVAL, "no connect target configured"));
                    }
                };
            }
            (Ready, Event::CmdIssue) => {
                // handled by the Ready state function below
            }
            (Ready, Event::NotifyRead) => {
                self.state = ReplyStart;
            }
            (IssueCommandSendRequest | IssueCommandSendWritePayload, Event::NotifyRead) => {
                // A reply became readable mid-send: pause the write (its
                // cursors stay put) and service the reply first.
                self.state = ReplyStart;
            }
            (Negotiating, Event::CmdIssue) => {
                use crate::proto::OptType;
                self.state = match self.opt_current {
                    Some(OptType::GO) | Some(OptType::INFO) => OptMetaContextStart,
                    Some(OptType::LIST) => OptListStart,
                    Some(OptType::LIST_META_CONTEXT) | Some(OptType::SET_META_CONTEXT) => {
                        OptMetaContextStart
                    }
                    Some(OptType::STRUCTURED_REPLY) => OptStructuredReplyStart,
                    Some(OptType::STARTTLS) => OptStarttlsStart,
                    Some(OptType::ABORT) => OptAbortStart,
                    _ => {
                        return Err(set_error(Errno::EINVAL, "no option command pending"));
                    }
                };
            }
            _ => {}
        }

        loop {
            match self.step()? {
                Flow::Continue => continue,
                Flow::Yield => return Ok(()),
            }
        }
    }

    fn step(&mut self) -> StepResult {
        use State::*;
        match self.state {
            Created | Negotiating | Dead | Closed => Ok(Flow::Yield),

            ConnectStart => self.st_connect_start(),
            Connecting => self.st_connecting(),
            ConnectTcpStart => self.st_connect_tcp_start(),
            ConnectTcpConnect => self.st_connect_tcp_connect(),
            ConnectTcpConnecting => self.st_connect_tcp_connecting(),
            ConnectTcpNext => self.st_connect_tcp_next(),
            ConnectCommandStart => self.st_connect_command_start(),
            ConnectSaStart => self.st_connect_sa_start(),

            PrepareForMagic => self.st_prepare_for_magic(),
            RecvMagic => self.st_recv_magic(),
            OldstyleRecvRemaining => self.st_oldstyle_recv_remaining(),
            NewstyleRecvGflags => self.st_newstyle_recv_gflags(),
            NewstyleSendCflags => self.st_newstyle_send_cflags(),

            OptStarttlsStart => self.st_opt_starttls_start(),
            OptStarttlsSend => self.st_opt_starttls_send(),
            OptStarttlsRecvReply => self.st_opt_starttls_recv_reply(),
            OptStarttlsRecvPayload => self.st_opt_starttls_recv_payload(),
            TlsHandshake => self.st_tls_handshake(),
            OptStructuredReplyStart => self.st_opt_structured_reply_start(),
            OptStructuredReplySend => self.st_opt_structured_reply_send(),
            OptStructuredReplyRecvReply => self.st_opt_structured_reply_recv_reply(),
            OptStructuredReplyRecvPayload => self.st_opt_structured_reply_recv_payload(),
            OptMetaContextStart => self.st_opt_meta_context_start(),
            OptMetaContextSend => self.st_opt_meta_context_send(),
            OptMetaContextRecvReply => self.st_opt_meta_context_recv_reply(),
            OptMetaContextRecvPayload => self.st_opt_meta_context_recv_payload(),
            OptGoStart => self.st_opt_go_start(),
            OptGoSend => self.st_opt_go_send(),
            OptGoRecvReply => self.st_opt_go_recv_reply(),
            OptGoRecvPayload => self.st_opt_go_recv_payload(),
            OptExportNameStart => self.st_opt_export_name_start(),
            OptExportNameSend => self.st_opt_export_name_send(),
            OptExportNameRecvReply => self.st_opt_export_name_recv_reply(),
            OptListStart => self.st_opt_list_start(),
            OptListSend => self.st_opt_list_send(),
            OptListRecvReply => self.st_opt_list_recv_reply(),
            OptListRecvPayload => self.st_opt_list_recv_payload(),
            OptAbortStart => self.st_opt_abort_start(),
            OptAbortSend => self.st_opt_abort_send(),
            OptAbortShutWrites => self.st_opt_abort_shut_writes(),

            Ready => self.st_ready(),
            IssueCommandStart => self.st_issue_command_start(),
            IssueCommandSendRequest => self.st_issue_command_send_request(),
            IssueCommandSendWritePayload => self.st_issue_command_send_write_payload(),
            ReplyStart => self.st_reply_start(),
            ReplyRecvMagic => self.st_reply_recv_magic(),
            ReplySimpleRecvHeader => self.st_reply_simple_recv_header(),
            ReplySimpleRecvPayload => self.st_reply_simple_recv_payload(),
            ReplyChunkRecvHeader => self.st_reply_chunk_recv_header(),
            ReplyChunkRecvOffsetData => self.st_reply_chunk_recv_offset_data(),
            ReplyChunkRecvData => self.st_reply_chunk_recv_data(),
            ReplyChunkRecvOffsetHole => self.st_reply_chunk_recv_offset_hole(),
            ReplyChunkRecvBsEntries => self.st_reply_chunk_recv_bs_entries(),
            ReplyChunkRecvError => self.st_reply_chunk_recv_error(),
            ReplyChunkRecvErrorMessage => self.st_reply_chunk_recv_error_message(),
            ReplyChunkRecvErrorTail => self.st_reply_chunk_recv_error_tail(),
            ReplyChunkFinish => self.st_reply_chunk_finish(),
            FinishCommand => self.st_finish_command(),
        }
    }

    // ----- shared cursor helpers -----

    /// Arm the read cursor for `want` bytes into the scratch buffer.
    pub(crate) fn begin_recv(&mut self, want: usize) {
        self.rbuf.clear();
        self.rbuf.resize(want, 0);
        self.rcursor.want = want;
        self.rcursor.got = 0;
        self.rcursor.discard = false;
    }

    /// Arm the read cursor to read and throw away `want` bytes.
    pub(crate) fn begin_recv_discard(&mut self, want: usize) {
        self.rbuf.clear();
        self.rcursor.want = want;
        self.rcursor.got = 0;
        self.rcursor.discard = true;
    }

    /// Arm the write cursor with a fully serialized frame.
    pub(crate) fn begin_send(&mut self, frame: Vec<u8>, more: bool) {
        self.wbuf = frame;
        self.woff = 0;
        self.wmore = more;
        self.stats.chunks_sent += 1;
    }

    /// Generic way to read into the scratch buffer: drive the cursor until
    /// it is satisfied or the socket runs dry. An unexpected EOF is an
    /// error here; states that can see an orderly close probe the socket
    /// themselves.
    pub(crate) fn recv_into_rbuf(&mut self) -> std::result::Result<IoProgress, Error> {
        while !self.rcursor.done() {
            let sock = self
                .sock
                .as_mut()
                .ok_or_else(|| set_error(Errno::ENOTCONN, "connection is not connected"))?;

            let n = if self.rcursor.discard {
                let mut scratch = [0u8; 8192];
                let want = (self.rcursor.want - self.rcursor.got).min(scratch.len());
                match sock.recv(&mut scratch[..want]) {
                    Ok(n) => n,
                    Err(TransportError::WouldBlock(_)) => return Ok(IoProgress::WouldBlock),
                    Err(e) => return Err(set_error(transport_errno(&e), format!("recv: {e}"))),
                }
            } else {
                let range = self.rcursor.got..self.rcursor.want;
                match sock.recv(&mut self.rbuf[range]) {
                    Ok(n) => n,
                    Err(TransportError::WouldBlock(_)) => return Ok(IoProgress::WouldBlock),
                    Err(e) => return Err(set_error(transport_errno(&e), format!("recv: {e}"))),
                }
            };

            if n == 0 {
                return Err(set_error(None, "recv: server disconnected unexpectedly"));
            }
            self.rcursor.got += n;
            self.stats.bytes_received += n as u64;
        }
        Ok(IoProgress::Done)
    }

    /// Generic way to write from the scratch buffer: drive the cursor until
    /// the frame is out or the socket is full.
    pub(crate) fn send_from_wbuf(&mut self) -> std::result::Result<IoProgress, Error> {
        while self.woff < self.wbuf.len() {
            let sock = self
                .sock
                .as_mut()
                .ok_or_else(|| set_error(Errno::ENOTCONN, "connection is not connected"))?;
            match sock.send(&self.wbuf[self.woff..], self.wmore) {
                Ok(n) => {
                    self.woff += n;
                    self.stats.bytes_sent += n as u64;
                }
                Err(TransportError::WouldBlock(_)) => return Ok(IoProgress::WouldBlock),
                Err(e) => return Err(set_error(transport_errno(&e), format!("send: {e}"))),
            }
        }
        Ok(IoProgress::Done)
    }

    // ----- terminal transitions -----

    /// Retire every outstanding command with `EIO`, invoking completion
    /// callbacks. Used when the connection dies or closes under commands.
    pub(crate) fn abort_commands(&mut self) {
        let mut cmds: Vec<_> = self.cmds_to_issue.drain(..).collect();
        cmds.append(&mut self.cmds_in_flight);
        for mut cmd in cmds {
            cmd.set_error(Errno::EIO);
            self.retire_or_queue_done(cmd);
        }
        self.reply_cmd = None;
        self.reply_resume = None;
    }

    /// Move a finished command to the done queue, or invoke its completion
    /// callback and retire it immediately.
    pub(crate) fn retire_or_queue_done(&mut self, mut cmd: crate::cmd::Command) {
        // Dropping the command drops its chunk/extent closures: the final
        // "free" of the per-command callbacks happens exactly once whether
        // or not they were ever invoked.
        if let Some(mut completion) = cmd.completion_cb.take() {
            let result = match cmd.effective_error() {
                None => Ok(()),
                Some(errno) => Err(errno),
            };
            completion(result);
            // the completion acknowledged the command; it is retired
        } else {
            self.cmds_done.push_back(cmd);
        }
    }

    /// The connection suffered an unrecoverable fault. Everything
    /// outstanding is retired with an error and the transport is closed.
    pub(crate) fn dead(&mut self, err: Error) -> StepResult {
        debug!(target: "nbd", "{}: connection is dead: {err}", self.hname);
        self.state = State::Dead;
        if let Some(sock) = self.sock.take() {
            sock.close();
        }
        self.abort_commands();
        Err(err)
    }

    /// The server closed the connection at a quiescent point.
    pub(crate) fn closed(&mut self) -> StepResult {
        debug!(target: "nbd", "{}: connection closed", self.hname);
        self.state = State::Closed;
        if let Some(sock) = self.sock.take() {
            sock.close();
        }
        self.abort_commands();
        Ok(Flow::Yield)
    }
}

pub(crate) fn transport_errno(e: &TransportError) -> Option<Errno> {
    match e {
        TransportError::Io(errno) => Some(*errno),
        _ => None,
    }
}
