//! Transmission phase: issuing requests and demultiplexing replies.
//!
//! `READY` is idle. Issuing takes the head of the to-issue queue, writes
//! the request header (and payload for writes) and moves the command to
//! in-flight. Receiving reads the 4-byte magic to tell simple from
//! structured replies, locates the in-flight command by cookie, and streams
//! payloads straight into the command's buffer.
//!
//! A partially received reply payload parks its state in `reply_resume` and
//! drops back to `READY`, so new requests can be issued while the rest of
//! the reply is in flight. A partially written request survives in the
//! write cursors and resumes after the interrupting reply is finished.

use log::debug;
use nix::errno::Errno;

use crate::cmd::ChunkKind;
use crate::errors::{set_error, Error};
use crate::handle::Handle;
use crate::proto::{
    chunk_type_is_err, errno_of_nbd_error, ChunkType, Cmd, Request, SimpleReply, StructuredReply,
    MAX_REQUEST_SIZE, SIMPLE_REPLY_LENGTH, SIMPLE_REPLY_MAGIC, STRUCTURED_REPLY_LENGTH,
    STRUCTURED_REPLY_MAGIC,
};
use crate::states::{Flow, IoProgress, State, StepResult};
use crate::transport::TransportError;

impl Handle {
    /// Idle in the transmission phase: resume a paused request write, start
    /// the next queued command, or wait for the server.
    pub(crate) fn st_ready(&mut self) -> StepResult {
        if self.in_write_header || self.in_write_payload || !self.cmds_to_issue.is_empty() {
            self.state = State::IssueCommandStart;
            return Ok(Flow::Continue);
        }
        Ok(Flow::Yield)
    }

    pub(crate) fn st_issue_command_start(&mut self) -> StepResult {
        // Resume a write interrupted by a reply.
        if self.in_write_payload {
            self.state = State::IssueCommandSendWritePayload;
            return Ok(Flow::Continue);
        }
        if self.in_write_header {
            self.state = State::IssueCommandSendRequest;
            return Ok(Flow::Continue);
        }

        let cmd = match self.cmds_to_issue.pop_front() {
            Some(cmd) => cmd,
            None => {
                self.state = State::Ready;
                return Ok(Flow::Continue);
            }
        };
        debug!(
            target: "nbd",
            "{}: issuing command {} cookie {} offset {} count {}",
            self.hname, cmd.typ.name(), cmd.cookie, cmd.offset, cmd.count
        );
        let req = Request {
            flags: cmd.flags,
            typ: cmd.typ,
            cookie: cmd.cookie,
            offset: cmd.offset,
            count: cmd.count,
        };
        let more = cmd.typ == Cmd::WRITE && !cmd.data.is_empty();
        self.issuing_cookie = Some(cmd.cookie);
        self.cmds_in_flight.push(cmd);
        self.begin_send(req.to_wire(), more);
        self.in_write_header = true;
        self.state = State::IssueCommandSendRequest;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_issue_command_send_request(&mut self) -> StepResult {
        match self.send_from_wbuf() {
            Err(e) => return self.dead(e),
            Ok(IoProgress::WouldBlock) => return Ok(Flow::Yield),
            Ok(IoProgress::Done) => {}
        }
        self.in_write_header = false;

        let cookie = self.issuing_cookie.expect("a command is being issued");
        let idx = self.find_in_flight(cookie).expect("command is in flight");
        let cmd = &self.cmds_in_flight[idx];
        if cmd.typ == Cmd::WRITE && !cmd.data.is_empty() {
            self.in_write_payload = true;
            self.wpayload_off = 0;
            self.state = State::IssueCommandSendWritePayload;
        } else {
            self.issuing_cookie = None;
            self.state = State::Ready;
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn st_issue_command_send_write_payload(&mut self) -> StepResult {
        let cookie = self.issuing_cookie.expect("a command is being issued");
        let idx = self.find_in_flight(cookie).expect("command is in flight");

        loop {
            let cmd = &self.cmds_in_flight[idx];
            if self.wpayload_off >= cmd.data.len() {
                break;
            }
            let sock = self.sock.as_mut().expect("socket installed");
            match sock.send(&cmd.data[self.wpayload_off..], false) {
                Ok(n) => {
                    self.wpayload_off += n;
                    self.stats.bytes_sent += n as u64;
                }
                Err(TransportError::WouldBlock(_)) => return Ok(Flow::Yield),
                Err(e) => {
                    let errno = crate::states::transport_errno(&e);
                    return self.dead(set_error(errno, format!("send: {e}")));
                }
            }
        }

        self.in_write_payload = false;
        self.wpayload_off = 0;
        self.issuing_cookie = None;
        self.state = State::Ready;
        Ok(Flow::Continue)
    }

    /// Park a partially received reply payload and drop back to `READY`.
    fn yield_reply(&mut self, resume: State) -> StepResult {
        self.reply_resume = Some(resume);
        self.state = State::Ready;
        Ok(Flow::Yield)
    }

    /// Entered on a read notification in `READY`. The first read doubles as
    /// a liveness probe: zero bytes from a server with nothing outstanding
    /// is an orderly shutdown, not an error.
    pub(crate) fn st_reply_start(&mut self) -> StepResult {
        if let Some(resume) = self.reply_resume.take() {
            self.state = resume;
            return Ok(Flow::Continue);
        }

        self.begin_recv(4);
        let sock = match self.sock.as_mut() {
            Some(sock) => sock,
            None => return self.closed(),
        };
        match sock.recv(&mut self.rbuf[0..4]) {
            Ok(0) => self.closed(),
            Ok(n) => {
                self.rcursor.got = n;
                self.stats.bytes_received += n as u64;
                self.state = State::ReplyRecvMagic;
                Ok(Flow::Continue)
            }
            Err(TransportError::WouldBlock(_)) => {
                self.state = State::ReplyRecvMagic;
                Ok(Flow::Yield)
            }
            Err(e) => {
                let errno = crate::states::transport_errno(&e);
                self.dead(set_error(errno, format!("recv: {e}")))
            }
        }
    }

    pub(crate) fn st_reply_recv_magic(&mut self) -> StepResult {
        match self.recv_into_rbuf() {
            Err(e) => return self.dead(e),
            Ok(IoProgress::WouldBlock) => return Ok(Flow::Yield),
            Ok(IoProgress::Done) => {}
        }
        let magic = u32::from_be_bytes(self.rbuf[0..4].try_into().expect("4 bytes"));
        match magic {
            SIMPLE_REPLY_MAGIC => {
                self.begin_recv(SIMPLE_REPLY_LENGTH);
                self.state = State::ReplySimpleRecvHeader;
                Ok(Flow::Continue)
            }
            STRUCTURED_REPLY_MAGIC => {
                self.begin_recv(STRUCTURED_REPLY_LENGTH);
                self.state = State::ReplyChunkRecvHeader;
                Ok(Flow::Continue)
            }
            // We have probably lost synchronization with the server.
            _ => self.dead(set_error(None, "invalid reply magic")),
        }
    }

    pub(crate) fn st_reply_simple_recv_header(&mut self) -> StepResult {
        match self.recv_into_rbuf() {
            Err(e) => return self.dead(e),
            Ok(IoProgress::WouldBlock) => return Ok(Flow::Yield),
            Ok(IoProgress::Done) => {}
        }
        let reply = match SimpleReply::get(&self.rbuf) {
            Ok(reply) => reply,
            Err(pe) => return self.dead(set_error(None, pe.0)),
        };
        self.stats.chunks_received += 1;

        let idx = match self.find_in_flight(reply.cookie) {
            Some(idx) => idx,
            None => {
                return self.dead(set_error(
                    None,
                    "no matching cookie found for server reply, \
                     this is probably a bug in the server",
                ));
            }
        };
        self.reply_cmd = Some(reply.cookie);

        let cmd = &mut self.cmds_in_flight[idx];
        if let Some(errno) = errno_of_nbd_error(reply.error) {
            cmd.set_error(errno);
        }

        if cmd.typ == Cmd::READ && reply.error == 0 {
            self.rcursor.want = cmd.count as usize;
            self.rcursor.got = 0;
            self.state = State::ReplySimpleRecvPayload;
        } else {
            self.state = State::FinishCommand;
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn st_reply_simple_recv_payload(&mut self) -> StepResult {
        let cookie = self.reply_cmd.expect("reply in progress");
        let idx = self.find_in_flight(cookie).expect("command is in flight");
        match self.recv_into_cmd_data(idx, 0) {
            Err(e) => return self.dead(e),
            Ok(IoProgress::WouldBlock) => {
                return self.yield_reply(State::ReplySimpleRecvPayload)
            }
            Ok(IoProgress::Done) => {}
        }
        self.cmds_in_flight[idx].data_seen = true;
        self.state = State::FinishCommand;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_reply_chunk_recv_header(&mut self) -> StepResult {
        match self.recv_into_rbuf() {
            Err(e) => return self.dead(e),
            Ok(IoProgress::WouldBlock) => return Ok(Flow::Yield),
            Ok(IoProgress::Done) => {}
        }
        if !self.structured_replies {
            return self.dead(set_error(None, "server sent unexpected structured reply"));
        }
        let hdr = match StructuredReply::get(&self.rbuf) {
            Ok(hdr) => hdr,
            Err(pe) => return self.dead(set_error(None, pe.0)),
        };
        self.stats.chunks_received += 1;

        let idx = match self.find_in_flight(hdr.cookie) {
            Some(idx) => idx,
            None => {
                return self.dead(set_error(
                    None,
                    "no matching cookie found for server reply, \
                     this is probably a bug in the server",
                ));
            }
        };
        self.reply_cmd = Some(hdr.cookie);
        self.reply_hdr = Some(hdr);

        // Reject a server replying with too much information; an oversized
        // reply would take long enough to resync that the connection is not
        // worth keeping alive.
        if hdr.length > MAX_REQUEST_SIZE + 8 {
            return self.dead(set_error(None, "invalid server reply length"));
        }

        let cmd_typ = self.cmds_in_flight[idx].typ;
        if chunk_type_is_err(hdr.typ) {
            if hdr.length < 6 {
                return self.dead(set_error(None, "too short length in structured reply error"));
            }
            self.begin_recv(6);
            self.state = State::ReplyChunkRecvError;
            return Ok(Flow::Continue);
        }
        match ChunkType::try_from(hdr.typ) {
            Ok(ChunkType::NONE) => {
                if hdr.length != 0 {
                    return self.dead(set_error(None, "invalid length in NBD_REPLY_TYPE_NONE"));
                }
                if !hdr.done() {
                    return self.dead(set_error(
                        None,
                        "NBD_REPLY_FLAG_DONE must be set in NBD_REPLY_TYPE_NONE",
                    ));
                }
                self.state = State::ReplyChunkFinish;
                Ok(Flow::Continue)
            }
            Ok(ChunkType::OFFSET_DATA) => {
                if cmd_typ != Cmd::READ {
                    return self.dead(set_error(
                        None,
                        "invalid command for receiving offset-data chunk, \
                         this is likely to be a bug in the server",
                    ));
                }
                if hdr.length < 8 {
                    return self.dead(set_error(
                        None,
                        "too short length in NBD_REPLY_TYPE_OFFSET_DATA",
                    ));
                }
                self.begin_recv(8);
                self.state = State::ReplyChunkRecvOffsetData;
                Ok(Flow::Continue)
            }
            Ok(ChunkType::OFFSET_HOLE) => {
                if cmd_typ != Cmd::READ {
                    return self.dead(set_error(
                        None,
                        "invalid command for receiving offset-hole chunk, \
                         this is likely to be a bug in the server",
                    ));
                }
                if hdr.length != 12 {
                    return self.dead(set_error(
                        None,
                        "invalid length in NBD_REPLY_TYPE_OFFSET_HOLE",
                    ));
                }
                self.begin_recv(12);
                self.state = State::ReplyChunkRecvOffsetHole;
                Ok(Flow::Continue)
            }
            Ok(ChunkType::BLOCK_STATUS) => {
                if cmd_typ != Cmd::BLOCK_STATUS {
                    return self.dead(set_error(
                        None,
                        "invalid command for receiving block-status chunk, \
                         this is likely to be a bug in the server",
                    ));
                }
                if hdr.length < 12 || (hdr.length - 4) % 8 != 0 {
                    return self.dead(set_error(
                        None,
                        "invalid length in NBD_REPLY_TYPE_BLOCK_STATUS",
                    ));
                }
                if self.cmds_in_flight[idx].extent_cb.is_none() {
                    return self.dead(set_error(
                        None,
                        "not expecting NBD_REPLY_TYPE_BLOCK_STATUS here",
                    ));
                }
                // Context ID and all the entries are collected into a single
                // buffer and dealt with at the end.
                self.bs_entries.clear();
                self.bs_entries.resize(hdr.length as usize, 0);
                self.rcursor.want = hdr.length as usize;
                self.rcursor.got = 0;
                self.state = State::ReplyChunkRecvBsEntries;
                Ok(Flow::Continue)
            }
            _ => self.dead(set_error(
                None,
                format!("unknown structured reply type ({})", hdr.typ),
            )),
        }
    }

    pub(crate) fn st_reply_chunk_recv_offset_data(&mut self) -> StepResult {
        match self.recv_into_rbuf() {
            Err(e) => return self.dead(e),
            Ok(IoProgress::WouldBlock) => {
                return self.yield_reply(State::ReplyChunkRecvOffsetData)
            }
            Ok(IoProgress::Done) => {}
        }
        let offset = u64::from_be_bytes(self.rbuf[0..8].try_into().expect("8 bytes"));
        let hdr = self.reply_hdr.expect("header parsed");
        let length = hdr.length - 8;

        let cookie = self.reply_cmd.expect("reply in progress");
        let idx = self.find_in_flight(cookie).expect("command is in flight");
        let cmd = &mut self.cmds_in_flight[idx];
        cmd.data_seen = true;

        if offset < cmd.offset || offset - cmd.offset + u64::from(length) > u64::from(cmd.count) {
            return self.dead(set_error(
                None,
                "offset/length of reply is out of bounds, \
                 this is likely to be a bug in the server",
            ));
        }
        self.chunk_offset = offset;
        self.rcursor.want = length as usize;
        self.rcursor.got = 0;
        self.state = State::ReplyChunkRecvData;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_reply_chunk_recv_data(&mut self) -> StepResult {
        let cookie = self.reply_cmd.expect("reply in progress");
        let idx = self.find_in_flight(cookie).expect("command is in flight");
        let base = (self.chunk_offset - self.cmds_in_flight[idx].offset) as usize;
        match self.recv_into_cmd_data(idx, base) {
            Err(e) => return self.dead(e),
            Ok(IoProgress::WouldBlock) => return self.yield_reply(State::ReplyChunkRecvData),
            Ok(IoProgress::Done) => {}
        }

        let length = self.rcursor.want;
        let offset = self.chunk_offset;
        let cmd = &mut self.cmds_in_flight[idx];
        if let Some(cb) = cmd.chunk_cb.as_mut() {
            let payload = &cmd.data[base..base + length];
            if let Err(errno) = cb(payload, offset, ChunkKind::Data) {
                if cmd.error.is_none() {
                    cmd.error = Some(errno);
                }
            }
        }
        self.state = State::ReplyChunkFinish;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_reply_chunk_recv_offset_hole(&mut self) -> StepResult {
        match self.recv_into_rbuf() {
            Err(e) => return self.dead(e),
            Ok(IoProgress::WouldBlock) => {
                return self.yield_reply(State::ReplyChunkRecvOffsetHole)
            }
            Ok(IoProgress::Done) => {}
        }
        let offset = u64::from_be_bytes(self.rbuf[0..8].try_into().expect("8 bytes"));
        let length = u32::from_be_bytes(self.rbuf[8..12].try_into().expect("4 bytes"));

        let cookie = self.reply_cmd.expect("reply in progress");
        let idx = self.find_in_flight(cookie).expect("command is in flight");
        let cmd = &mut self.cmds_in_flight[idx];
        cmd.data_seen = true;

        if offset < cmd.offset || offset - cmd.offset + u64::from(length) > u64::from(cmd.count) {
            return self.dead(set_error(
                None,
                "offset/length of reply is out of bounds, \
                 this is likely to be a bug in the server",
            ));
        }

        let base = (offset - cmd.offset) as usize;
        cmd.data[base..base + length as usize].fill(0);
        if let Some(cb) = cmd.chunk_cb.as_mut() {
            let payload = &cmd.data[base..base + length as usize];
            if let Err(errno) = cb(payload, offset, ChunkKind::Hole) {
                if cmd.error.is_none() {
                    cmd.error = Some(errno);
                }
            }
        }
        self.state = State::ReplyChunkFinish;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_reply_chunk_recv_bs_entries(&mut self) -> StepResult {
        match self.recv_into_bs_entries() {
            Err(e) => return self.dead(e),
            Ok(IoProgress::WouldBlock) => {
                return self.yield_reply(State::ReplyChunkRecvBsEntries)
            }
            Ok(IoProgress::Done) => {}
        }

        let context_id = u32::from_be_bytes(self.bs_entries[0..4].try_into().expect("4 bytes"));
        let entries: Vec<(u32, u32)> = self.bs_entries[4..]
            .chunks_exact(8)
            .map(|pair| {
                (
                    u32::from_be_bytes(pair[0..4].try_into().expect("4 bytes")),
                    u32::from_be_bytes(pair[4..8].try_into().expect("4 bytes")),
                )
            })
            .collect();

        let cookie = self.reply_cmd.expect("reply in progress");
        let idx = self.find_in_flight(cookie).expect("command is in flight");

        match self
            .meta_contexts
            .iter()
            .find(|mc| mc.context_id == context_id)
        {
            Some(mc) => {
                let name = mc.name.clone();
                let cmd = &mut self.cmds_in_flight[idx];
                let offset = cmd.offset;
                if let Some(cb) = cmd.extent_cb.as_mut() {
                    if let Err(errno) = cb(&name, offset, &entries) {
                        if cmd.error.is_none() {
                            cmd.error = Some(errno);
                        }
                    }
                }
            }
            None => {
                debug!(
                    target: "nbd",
                    "{}: server sent unexpected meta context ID {context_id}",
                    self.hname
                );
            }
        }
        self.state = State::ReplyChunkFinish;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_reply_chunk_recv_error(&mut self) -> StepResult {
        match self.recv_into_rbuf() {
            Err(e) => return self.dead(e),
            Ok(IoProgress::WouldBlock) => return self.yield_reply(State::ReplyChunkRecvError),
            Ok(IoProgress::Done) => {}
        }
        let error = u32::from_be_bytes(self.rbuf[0..4].try_into().expect("4 bytes"));
        let msglen = u16::from_be_bytes(self.rbuf[4..6].try_into().expect("2 bytes"));
        let hdr = self.reply_hdr.expect("header parsed");

        if u32::from(msglen) > hdr.length - 6 || usize::from(msglen) > crate::proto::MAX_STRING {
            return self.dead(set_error(None, "error message length too large"));
        }
        self.chunk_error = Some(error);
        self.begin_recv(usize::from(msglen));
        self.state = State::ReplyChunkRecvErrorMessage;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_reply_chunk_recv_error_message(&mut self) -> StepResult {
        match self.recv_into_rbuf() {
            Err(e) => return self.dead(e),
            Ok(IoProgress::WouldBlock) => {
                return self.yield_reply(State::ReplyChunkRecvErrorMessage)
            }
            Ok(IoProgress::Done) => {}
        }
        let msglen = self.rcursor.want;
        if msglen > 0 {
            debug!(
                target: "nbd",
                "{}: structured error server message: {}",
                self.hname,
                String::from_utf8_lossy(&self.rbuf[..msglen])
            );
        }
        let hdr = self.reply_hdr.expect("header parsed");
        let remaining = hdr.length as usize - 6 - msglen;

        if hdr.typ == u16::from(ChunkType::ERROR) {
            if remaining != 0 {
                return self.dead(set_error(None, "error payload length too large"));
            }
            self.begin_recv(0);
        } else {
            // NBD_REPLY_TYPE_ERROR_OFFSET
            if remaining != 8 {
                return self.dead(set_error(None, "invalid error payload length"));
            }
            self.begin_recv(8);
        }
        self.state = State::ReplyChunkRecvErrorTail;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_reply_chunk_recv_error_tail(&mut self) -> StepResult {
        match self.recv_into_rbuf() {
            Err(e) => return self.dead(e),
            Ok(IoProgress::WouldBlock) => {
                return self.yield_reply(State::ReplyChunkRecvErrorTail)
            }
            Ok(IoProgress::Done) => {}
        }
        let hdr = self.reply_hdr.expect("header parsed");
        let raw_error = self.chunk_error.take().expect("error chunk parsed");

        // The protocol requires a non-zero error here.
        let errno = match errno_of_nbd_error(raw_error) {
            Some(errno) => errno,
            None => {
                debug!(target: "nbd", "{}: server forgot to set error; using EINVAL", self.hname);
                Errno::EINVAL
            }
        };

        let cookie = self.reply_cmd.expect("reply in progress");
        let idx = self.find_in_flight(cookie).expect("command is in flight");

        if hdr.typ == u16::from(ChunkType::ERROR_OFFSET) {
            let offset = u64::from_be_bytes(self.rbuf[0..8].try_into().expect("8 bytes"));
            let cmd = &mut self.cmds_in_flight[idx];
            if offset < cmd.offset || offset >= cmd.offset + u64::from(cmd.count) {
                return self.dead(set_error(
                    None,
                    "offset of error reply is out of bounds, \
                     this is likely to be a bug in the server",
                ));
            }
            // Let a read's chunk callback see where the failure happened.
            if cmd.typ == Cmd::READ {
                if let Some(cb) = cmd.chunk_cb.as_mut() {
                    if let Err(cb_errno) = cb(&[], offset, ChunkKind::Error) {
                        if cmd.error.is_none() {
                            cmd.error = Some(cb_errno);
                        }
                    }
                }
            }
        }

        self.cmds_in_flight[idx].set_error(errno);
        self.state = State::ReplyChunkFinish;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_reply_chunk_finish(&mut self) -> StepResult {
        let hdr = self.reply_hdr.expect("header parsed");
        if hdr.done() {
            self.state = State::FinishCommand;
        } else {
            // More chunks follow for this command; other commands' replies
            // may be interleaved in between.
            self.reply_cmd = None;
            self.reply_hdr = None;
            self.state = State::Ready;
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn st_finish_command(&mut self) -> StepResult {
        let cookie = self.reply_cmd.take().expect("reply in progress");
        self.reply_hdr = None;
        let idx = self.find_in_flight(cookie).expect("command is in flight");
        let cmd = self.cmds_in_flight.remove(idx);
        debug!(
            target: "nbd",
            "{}: command {} cookie {cookie} completed{}",
            self.hname,
            cmd.typ.name(),
            match cmd.error {
                Some(errno) => format!(" with error {errno}"),
                None => String::new(),
            }
        );
        self.retire_or_queue_done(cmd);
        self.state = State::Ready;
        Ok(Flow::Continue)
    }

    // ----- payload readers targeting command-owned buffers -----

    /// Drive the cursor reading into the in-flight command's buffer at
    /// `base`.
    fn recv_into_cmd_data(
        &mut self,
        idx: usize,
        base: usize,
    ) -> std::result::Result<IoProgress, Error> {
        while self.rcursor.got < self.rcursor.want {
            let cmd = &mut self.cmds_in_flight[idx];
            let range = base + self.rcursor.got..base + self.rcursor.want;
            let sock = self
                .sock
                .as_mut()
                .ok_or_else(|| set_error(Errno::ENOTCONN, "connection is not connected"))?;
            let n = match sock.recv(&mut cmd.data[range]) {
                Ok(n) => n,
                Err(TransportError::WouldBlock(_)) => return Ok(IoProgress::WouldBlock),
                Err(e) => {
                    let errno = crate::states::transport_errno(&e);
                    return Err(set_error(errno, format!("recv: {e}")));
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

    /// Drive the cursor reading into the block-status entry buffer.
    fn recv_into_bs_entries(&mut self) -> std::result::Result<IoProgress, Error> {
        while self.rcursor.got < self.rcursor.want {
            let range = self.rcursor.got..self.rcursor.want;
            let sock = self
                .sock
                .as_mut()
                .ok_or_else(|| set_error(Errno::ENOTCONN, "connection is not connected"))?;
            let n = match sock.recv(&mut self.bs_entries[range]) {
                Ok(n) => n,
                Err(TransportError::WouldBlock(_)) => return Ok(IoProgress::WouldBlock),
                Err(e) => {
                    let errno = crate::states::transport_errno(&e);
                    return Err(set_error(errno, format!("recv: {e}")));
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
}
