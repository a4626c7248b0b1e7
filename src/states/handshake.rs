//! Handshake states: the server greeting, oldstyle negotiation, and the
//! fixed-newstyle option sub-machines including the TLS upgrade.
//!
//! Option requests are serialized whole into the write cursor and sent by a
//! single send state; replies are read header-first, then payload, then
//! interpreted. `NBD_OPT_STARTTLS` must come first and `NBD_OPT_GO` last.

use log::debug;
use nix::errno::Errno;

use crate::crypto;
use crate::errors::{set_error, Error};
use crate::handle::{Handle, MetaContext};
use crate::proto::{
    get_meta_context, get_string, go_option_payload, meta_context_payload, ExportNameReply,
    HandshakeFlags, InfoPayload, InfoType, OldstyleHandshake, Opt, OptReplyHeader, OptType,
    ReplyType, MAGIC, MAX_STRING, NEW_VERSION, OLDSTYLE_LENGTH, OLD_VERSION, OPT_REPLY_LENGTH,
};
use crate::states::{Flow, IoProgress, State, StepResult};
use crate::transport::TransportError;
use crate::TlsMode;

/// errno for an option reply error code.
pub(crate) fn errno_of_reply_error(reply: u32) -> Errno {
    match ReplyType::try_from(reply) {
        Ok(ReplyType::ERR_UNSUP) => Errno::ENOTSUP,
        Ok(ReplyType::ERR_POLICY) => Errno::EPERM,
        Ok(ReplyType::ERR_INVALID) => Errno::EINVAL,
        Ok(ReplyType::ERR_PLATFORM) => Errno::ENOTSUP,
        Ok(ReplyType::ERR_TLS_REQD) => Errno::EPERM,
        Ok(ReplyType::ERR_UNKNOWN) => Errno::ENOENT,
        Ok(ReplyType::ERR_SHUTDOWN) => Errno::ESHUTDOWN,
        Ok(ReplyType::ERR_BLOCK_SIZE_REQD) => Errno::EINVAL,
        Ok(ReplyType::ERR_TOO_BIG) => Errno::ERANGE,
        _ => Errno::EINVAL,
    }
}

impl Handle {
    /// Invoke and clear the per-option callbacks, then move to `next`.
    fn option_completed(&mut self, err: Option<Errno>, next: State) -> StepResult {
        if let Some(mut cb) = self.opt_completion.take() {
            cb(match err {
                None => Ok(()),
                Some(errno) => Err(errno),
            });
        }
        self.opt_list_cb = None;
        self.opt_context_cb = None;
        self.opt_current = None;
        self.current_opt_reply = None;
        self.state = next;
        Ok(Flow::Continue)
    }

    /// After the TLS decision is settled, continue the automatic option
    /// chain.
    fn next_opt_after_tls(&mut self) -> StepResult {
        self.state = if self.request_sr {
            State::OptStructuredReplyStart
        } else {
            State::OptMetaContextStart
        };
        Ok(Flow::Continue)
    }

    /// Step an armed receive; `Ok(None)` means yield, `Ok(Some(()))` means
    /// the cursor is complete. Fatal errors have already moved to DEAD.
    fn recv_step(&mut self) -> Result<Option<()>, Error> {
        match self.recv_into_rbuf() {
            Err(e) => Err(e),
            Ok(IoProgress::WouldBlock) => Ok(None),
            Ok(IoProgress::Done) => Ok(Some(())),
        }
    }

    fn send_step(&mut self) -> Result<Option<()>, Error> {
        match self.send_from_wbuf() {
            Err(e) => Err(e),
            Ok(IoProgress::WouldBlock) => Ok(None),
            Ok(IoProgress::Done) => Ok(Some(())),
        }
    }

    // ----- magic -----

    pub(crate) fn st_prepare_for_magic(&mut self) -> StepResult {
        self.begin_recv(16);
        self.state = State::RecvMagic;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_recv_magic(&mut self) -> StepResult {
        match self.recv_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        let magic = u64::from_be_bytes(self.rbuf[0..8].try_into().expect("8 bytes"));
        if magic != MAGIC {
            return self.dead(set_error(
                None,
                "handshake: server did not send expected NBD magic",
            ));
        }
        let version = u64::from_be_bytes(self.rbuf[8..16].try_into().expect("8 bytes"));
        match version {
            OLD_VERSION => {
                self.begin_recv(OLDSTYLE_LENGTH - 16);
                self.state = State::OldstyleRecvRemaining;
                Ok(Flow::Continue)
            }
            NEW_VERSION => {
                self.begin_recv(2);
                self.state = State::NewstyleRecvGflags;
                Ok(Flow::Continue)
            }
            _ => self.dead(set_error(
                None,
                "handshake: server is not an oldstyle or newstyle NBD server",
            )),
        }
    }

    // ----- oldstyle -----

    /// Oldstyle servers send size and flags immediately; there is no
    /// negotiation at all.
    pub(crate) fn st_oldstyle_recv_remaining(&mut self) -> StepResult {
        match self.recv_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        let hs = match OldstyleHandshake::get(&self.rbuf) {
            Ok(hs) => hs,
            Err(pe) => return self.dead(set_error(None, pe.0)),
        };
        if self.tls == TlsMode::Require {
            return self.dead(set_error(
                Errno::ENOTSUP,
                "handshake: server is oldstyle, but handle TLS setting is require",
            ));
        }
        self.protocol = "oldstyle";
        if let Err(e) = self.set_size_and_flags(hs.size, hs.flags) {
            return self.dead(e);
        }
        self.set_payload_maximum();
        debug!(target: "nbd", "{}: using oldstyle protocol", self.hname);
        self.state = State::Ready;
        Ok(Flow::Continue)
    }

    // ----- newstyle greeting -----

    pub(crate) fn st_newstyle_recv_gflags(&mut self) -> StepResult {
        match self.recv_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        let raw = u16::from_be_bytes(self.rbuf[0..2].try_into().expect("2 bytes"));
        // Reply with the flags both sides understand, restricted by the
        // caller's configured handshake flags.
        let agreed = HandshakeFlags::from_bits_truncate(raw) & self.handshake_flags;
        self.gflags = agreed;
        self.begin_send(u32::from(agreed.bits()).to_be_bytes().to_vec(), false);
        self.state = State::NewstyleSendCflags;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_newstyle_send_cflags(&mut self) -> StepResult {
        match self.send_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }

        if !self.gflags.contains(HandshakeFlags::FIXED_NEWSTYLE) {
            self.protocol = "newstyle";
            if self.tls == TlsMode::Require {
                return self.dead(set_error(
                    Errno::ENOTSUP,
                    "handshake: server is not fixed newstyle, but handle TLS setting is require",
                ));
            }
            // No options possible beyond the legacy export selection.
            self.state = State::OptExportNameStart;
            return Ok(Flow::Continue);
        }

        self.protocol = "newstyle-fixed";
        if self.opt_mode {
            self.state = State::Negotiating;
            return Ok(Flow::Continue);
        }
        // NBD_OPT_STARTTLS must be sent first, NBD_OPT_GO must be sent
        // last.
        if self.tls != TlsMode::Disable {
            self.state = State::OptStarttlsStart;
            Ok(Flow::Continue)
        } else {
            self.next_opt_after_tls()
        }
    }

    // ----- STARTTLS -----

    pub(crate) fn st_opt_starttls_start(&mut self) -> StepResult {
        if !self.gflags.contains(HandshakeFlags::FIXED_NEWSTYLE) {
            // Cannot send any option; behave as a refusal.
            return self.starttls_refused("server is not fixed newstyle");
        }
        let opt = Opt {
            typ: OptType::STARTTLS,
            data: vec![],
        };
        self.begin_send(opt.to_wire(), false);
        self.state = State::OptStarttlsSend;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_opt_starttls_send(&mut self) -> StepResult {
        match self.send_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        self.begin_recv(OPT_REPLY_LENGTH);
        self.state = State::OptStarttlsRecvReply;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_opt_starttls_recv_reply(&mut self) -> StepResult {
        match self.recv_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        let hdr = match OptReplyHeader::get(&self.rbuf) {
            Ok(hdr) => hdr,
            Err(pe) => return self.dead(set_error(None, pe.0)),
        };
        self.stats.chunks_received += 1;
        if let Err(pe) = hdr.expect_option(OptType::STARTTLS) {
            return self.dead(set_error(None, pe.0));
        }
        self.current_opt_reply = Some(hdr);
        self.begin_recv(hdr.len as usize);
        self.state = State::OptStarttlsRecvPayload;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_opt_starttls_recv_payload(&mut self) -> StepResult {
        match self.recv_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        let hdr = self.current_opt_reply.take().expect("header parsed");
        match ReplyType::try_from(hdr.reply) {
            Ok(ReplyType::ACK) => {
                if hdr.len != 0 {
                    return self.dead(set_error(
                        None,
                        "handshake: invalid option reply length for NBD_OPT_STARTTLS",
                    ));
                }
                let inner = self.sock.take().expect("socket installed");
                let server_name = self.tls_server_name();
                match crypto::create_session(&self.tls_settings, &server_name, inner) {
                    Ok(tls) => {
                        self.tls_dir = crate::transport::AioDirection::WRITE;
                        self.sock = Some(Box::new(tls));
                        self.state = State::TlsHandshake;
                        Ok(Flow::Continue)
                    }
                    Err(e) => self.dead(e),
                }
            }
            Ok(reply) if !crate::proto::reply_is_err(hdr.reply) => {
                debug!(
                    target: "nbd",
                    "{}: server is confused by NBD_OPT_STARTTLS ({reply:?}), continuing anyway",
                    self.hname
                );
                self.starttls_refused("server is confused by STARTTLS")
            }
            _ => self.starttls_refused(if hdr.reply == u32::from(ReplyType::ERR_POLICY) {
                "policy"
            } else {
                "not supported"
            }),
        }
    }

    /// Server declined the TLS upgrade. Fatal when TLS is required,
    /// otherwise the connection continues unencrypted.
    fn starttls_refused(&mut self, why: &str) -> StepResult {
        if self.tls == TlsMode::Require {
            return self.dead(set_error(
                Errno::ENOTSUP,
                "handshake: server refused TLS, but handle TLS setting is require (2)",
            ));
        }
        debug!(
            target: "nbd",
            "{}: server refused TLS ({why}), continuing with unencrypted connection",
            self.hname
        );
        if self.opt_current == Some(OptType::STARTTLS) {
            self.option_completed(Some(Errno::ENOTSUP), State::Negotiating)
        } else {
            self.next_opt_after_tls()
        }
    }

    pub(crate) fn st_tls_handshake(&mut self) -> StepResult {
        let sock = self.sock.as_mut().expect("socket installed");
        match sock.tls_handshake() {
            Ok(_) => {
                debug!(target: "nbd", "{}: connection is using TLS", self.hname);
                self.tls_negotiated = true;
                // The pre-TLS exchange is discarded wholesale.
                self.reset_negotiated_state();
                if self.opt_current == Some(OptType::STARTTLS) {
                    self.option_completed(None, State::Negotiating)
                } else {
                    self.next_opt_after_tls()
                }
            }
            Err(TransportError::WouldBlock(dir)) => {
                self.tls_dir = dir;
                Ok(Flow::Yield)
            }
            Err(e) => {
                let errno = crate::states::transport_errno(&e);
                self.dead(set_error(errno, format!("TLS handshake: {e}")))
            }
        }
    }

    // ----- STRUCTURED_REPLY -----

    pub(crate) fn st_opt_structured_reply_start(&mut self) -> StepResult {
        let opt = Opt {
            typ: OptType::STRUCTURED_REPLY,
            data: vec![],
        };
        self.begin_send(opt.to_wire(), false);
        self.state = State::OptStructuredReplySend;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_opt_structured_reply_send(&mut self) -> StepResult {
        match self.send_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        self.begin_recv(OPT_REPLY_LENGTH);
        self.state = State::OptStructuredReplyRecvReply;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_opt_structured_reply_recv_reply(&mut self) -> StepResult {
        match self.recv_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        let hdr = match OptReplyHeader::get(&self.rbuf) {
            Ok(hdr) => hdr,
            Err(pe) => return self.dead(set_error(None, pe.0)),
        };
        self.stats.chunks_received += 1;
        if let Err(pe) = hdr.expect_option(OptType::STRUCTURED_REPLY) {
            return self.dead(set_error(None, pe.0));
        }
        self.current_opt_reply = Some(hdr);
        self.begin_recv_discard(hdr.len as usize);
        self.state = State::OptStructuredReplyRecvPayload;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_opt_structured_reply_recv_payload(&mut self) -> StepResult {
        match self.recv_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        let hdr = self.current_opt_reply.take().expect("header parsed");
        if hdr.reply == u32::from(ReplyType::ACK) {
            debug!(target: "nbd", "{}: negotiated structured replies", self.hname);
            self.structured_replies = true;
        } else {
            debug!(target: "nbd", "{}: server refused structured replies", self.hname);
        }
        if self.opt_current == Some(OptType::STRUCTURED_REPLY) {
            self.option_completed(None, State::Negotiating)
        } else {
            self.state = State::OptMetaContextStart;
            Ok(Flow::Continue)
        }
    }

    // ----- SET/LIST_META_CONTEXT -----

    /// Entered from the automatic chain (conditional SET, then GO), from
    /// `opt_set_meta_context`, from `opt_list_meta_context`, and from
    /// `opt_go`/`opt_info` in option mode.
    pub(crate) fn st_opt_meta_context_start(&mut self) -> StepResult {
        let list = self.opt_current == Some(OptType::LIST_META_CONTEXT);
        let implicit = matches!(
            self.opt_current,
            None | Some(OptType::GO) | Some(OptType::INFO)
        );

        self.reset_size_and_flags();
        if !list {
            self.meta_contexts.clear();
            self.meta_valid = false;
            if implicit && (!self.structured_replies || self.request_meta_contexts.is_empty()) {
                self.state = State::OptGoStart;
                return Ok(Flow::Continue);
            }
        }
        self.querylist = self.request_meta_contexts.clone();

        let opt = if list {
            OptType::LIST_META_CONTEXT
        } else {
            OptType::SET_META_CONTEXT
        };
        let payload = meta_context_payload(&self.export_name, &self.querylist);
        self.begin_send(Opt { typ: opt, data: payload }.to_wire(), false);
        self.state = State::OptMetaContextSend;
        Ok(Flow::Continue)
    }

    fn meta_context_opt(&self) -> OptType {
        if self.opt_current == Some(OptType::LIST_META_CONTEXT) {
            OptType::LIST_META_CONTEXT
        } else {
            OptType::SET_META_CONTEXT
        }
    }

    pub(crate) fn st_opt_meta_context_send(&mut self) -> StepResult {
        match self.send_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        self.begin_recv(OPT_REPLY_LENGTH);
        self.state = State::OptMetaContextRecvReply;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_opt_meta_context_recv_reply(&mut self) -> StepResult {
        match self.recv_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        let hdr = match OptReplyHeader::get(&self.rbuf) {
            Ok(hdr) => hdr,
            Err(pe) => return self.dead(set_error(None, pe.0)),
        };
        self.stats.chunks_received += 1;
        if let Err(pe) = hdr.expect_option(self.meta_context_opt()) {
            return self.dead(set_error(None, pe.0));
        }
        self.current_opt_reply = Some(hdr);
        if hdr.len as usize > MAX_STRING + 8 {
            // skip a too-large meta context
            self.begin_recv_discard(hdr.len as usize);
        } else {
            self.begin_recv(hdr.len as usize);
        }
        self.state = State::OptMetaContextRecvPayload;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_opt_meta_context_recv_payload(&mut self) -> StepResult {
        match self.recv_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        let hdr = self.current_opt_reply.take().expect("header parsed");
        let list = self.opt_current == Some(OptType::LIST_META_CONTEXT);
        let explicit_set = self.opt_current == Some(OptType::SET_META_CONTEXT);

        match ReplyType::try_from(hdr.reply) {
            Ok(ReplyType::ACK) => {
                // end of the list of replies
                if list {
                    self.option_completed(None, State::Negotiating)
                } else {
                    self.meta_valid = true;
                    if explicit_set {
                        self.option_completed(None, State::Negotiating)
                    } else {
                        self.state = State::OptGoStart;
                        Ok(Flow::Continue)
                    }
                }
            }
            Ok(ReplyType::META_CONTEXT) => {
                if !self.rcursor.discard {
                    match get_meta_context(&self.rbuf) {
                        Ok((context_id, name)) => {
                            debug!(
                                target: "nbd",
                                "{}: negotiated {name} with context ID {context_id}",
                                self.hname
                            );
                            if list {
                                if let Some(cb) = self.opt_context_cb.as_mut() {
                                    cb(&name);
                                }
                            } else {
                                self.meta_contexts.push(MetaContext { name, context_id });
                            }
                        }
                        Err(pe) => return self.dead(set_error(None, pe.0)),
                    }
                } else {
                    debug!(target: "nbd", "{}: skipping too large meta context", self.hname);
                }
                self.begin_recv(OPT_REPLY_LENGTH);
                self.state = State::OptMetaContextRecvReply;
                Ok(Flow::Continue)
            }
            _ => {
                // Anything else is an error: ignore it for the automatic
                // SET, report it for the option-mode commands.
                let errno = errno_of_reply_error(hdr.reply);
                if list {
                    self.option_completed(Some(Errno::ENOTSUP), State::Negotiating)
                } else if explicit_set {
                    self.option_completed(Some(errno), State::Negotiating)
                } else {
                    debug!(
                        target: "nbd",
                        "{}: handshake: unexpected error from NBD_OPT_SET_META_CONTEXT ({})",
                        self.hname, hdr.reply
                    );
                    self.state = State::OptGoStart;
                    Ok(Flow::Continue)
                }
            }
        }
    }

    // ----- GO / INFO -----

    pub(crate) fn st_opt_go_start(&mut self) -> StepResult {
        let opt = if self.opt_current == Some(OptType::INFO) {
            OptType::INFO
        } else {
            OptType::GO
        };
        self.reset_size_and_flags();
        let mut infos: Vec<InfoType> = vec![];
        if self.request_block_size {
            infos.push(InfoType::BLOCK_SIZE);
        }
        if self.full_info {
            infos.push(InfoType::NAME);
            infos.push(InfoType::DESCRIPTION);
        }
        let payload = go_option_payload(&self.export_name, &infos);
        self.begin_send(Opt { typ: opt, data: payload }.to_wire(), false);
        self.state = State::OptGoSend;
        Ok(Flow::Continue)
    }

    fn go_opt(&self) -> OptType {
        if self.opt_current == Some(OptType::INFO) {
            OptType::INFO
        } else {
            OptType::GO
        }
    }

    pub(crate) fn st_opt_go_send(&mut self) -> StepResult {
        match self.send_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        self.begin_recv(OPT_REPLY_LENGTH);
        self.state = State::OptGoRecvReply;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_opt_go_recv_reply(&mut self) -> StepResult {
        match self.recv_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        let hdr = match OptReplyHeader::get(&self.rbuf) {
            Ok(hdr) => hdr,
            Err(pe) => return self.dead(set_error(None, pe.0)),
        };
        self.stats.chunks_received += 1;
        if let Err(pe) = hdr.expect_option(self.go_opt()) {
            return self.dead(set_error(None, pe.0));
        }
        self.current_opt_reply = Some(hdr);
        self.begin_recv(hdr.len as usize);
        self.state = State::OptGoRecvPayload;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_opt_go_recv_payload(&mut self) -> StepResult {
        match self.recv_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        let hdr = self.current_opt_reply.take().expect("header parsed");
        let info_only = self.opt_current == Some(OptType::INFO);

        match ReplyType::try_from(hdr.reply) {
            Ok(ReplyType::ACK) => {
                if self.eflags.is_empty() {
                    return self.dead(set_error(
                        None,
                        "handshake: server agreed to export but did not send export info",
                    ));
                }
                self.set_payload_maximum();
                if info_only {
                    return self.option_completed(None, State::Negotiating);
                }
                if self.opt_current == Some(OptType::GO) {
                    return self.option_completed(None, State::Ready);
                }
                self.state = State::Ready;
                Ok(Flow::Continue)
            }
            Ok(ReplyType::INFO) => {
                match InfoPayload::get(&self.rbuf) {
                    Ok(InfoPayload::Export { size, flags }) => {
                        if let Err(e) = self.set_size_and_flags(size, flags) {
                            return self.dead(e);
                        }
                    }
                    Ok(InfoPayload::Name(name)) => self.canonical_name = Some(name),
                    Ok(InfoPayload::Description(desc)) => self.description = Some(desc),
                    Ok(InfoPayload::BlockSize {
                        min,
                        preferred,
                        max,
                    }) => self.set_block_size(min, preferred, max),
                    Ok(InfoPayload::Unknown(typ)) => {
                        debug!(target: "nbd", "{}: ignoring unknown info type {typ}", self.hname);
                    }
                    Err(pe) => {
                        debug!(target: "nbd", "{}: ignoring malformed info payload: {pe}", self.hname);
                    }
                }
                // The server may send any number of info replies.
                self.begin_recv(OPT_REPLY_LENGTH);
                self.state = State::OptGoRecvReply;
                Ok(Flow::Continue)
            }
            Ok(ReplyType::ERR_UNSUP) if !info_only => {
                // Fall back to the legacy option; real servers rely on it.
                debug!(
                    target: "nbd",
                    "{}: server does not support NBD_OPT_GO, falling back to NBD_OPT_EXPORT_NAME",
                    self.hname
                );
                self.state = State::OptExportNameStart;
                Ok(Flow::Continue)
            }
            _ => {
                let errno = errno_of_reply_error(hdr.reply);
                self.reset_size_and_flags();
                if self.opt_current.is_some() {
                    self.option_completed(Some(errno), State::Negotiating)
                } else {
                    self.dead(set_error(
                        errno,
                        "handshake: server replied with error to NBD_OPT_GO",
                    ))
                }
            }
        }
    }

    // ----- EXPORT_NAME (legacy) -----

    pub(crate) fn st_opt_export_name_start(&mut self) -> StepResult {
        let opt = Opt {
            typ: OptType::EXPORT_NAME,
            data: self.export_name.as_bytes().to_vec(),
        };
        self.begin_send(opt.to_wire(), false);
        self.state = State::OptExportNameSend;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_opt_export_name_send(&mut self) -> StepResult {
        match self.send_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        // S: 64 bits, size of the export
        // S: 16 bits, transmission flags
        // S: 124 bytes, zeroes (unless NBD_FLAG_C_NO_ZEROES was negotiated)
        let mut want = 10;
        if !self.gflags.contains(HandshakeFlags::NO_ZEROES) {
            want += 124;
        }
        self.begin_recv(want);
        self.state = State::OptExportNameRecvReply;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_opt_export_name_recv_reply(&mut self) -> StepResult {
        match self.recv_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        let reply = match ExportNameReply::get(&self.rbuf) {
            Ok(reply) => reply,
            Err(pe) => return self.dead(set_error(None, pe.0)),
        };
        self.stats.chunks_received += 1;
        if let Err(e) = self.set_size_and_flags(reply.size, reply.flags) {
            return self.dead(e);
        }
        self.set_payload_maximum();
        if self.opt_current == Some(OptType::GO) {
            return self.option_completed(None, State::Ready);
        }
        self.state = State::Ready;
        Ok(Flow::Continue)
    }

    // ----- LIST -----

    pub(crate) fn st_opt_list_start(&mut self) -> StepResult {
        let opt = Opt {
            typ: OptType::LIST,
            data: vec![],
        };
        self.begin_send(opt.to_wire(), false);
        self.state = State::OptListSend;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_opt_list_send(&mut self) -> StepResult {
        match self.send_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        self.begin_recv(OPT_REPLY_LENGTH);
        self.state = State::OptListRecvReply;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_opt_list_recv_reply(&mut self) -> StepResult {
        match self.recv_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        let hdr = match OptReplyHeader::get(&self.rbuf) {
            Ok(hdr) => hdr,
            Err(pe) => return self.dead(set_error(None, pe.0)),
        };
        self.stats.chunks_received += 1;
        if let Err(pe) = hdr.expect_option(OptType::LIST) {
            return self.dead(set_error(None, pe.0));
        }
        self.current_opt_reply = Some(hdr);
        self.begin_recv(hdr.len as usize);
        self.state = State::OptListRecvPayload;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_opt_list_recv_payload(&mut self) -> StepResult {
        match self.recv_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        let hdr = self.current_opt_reply.take().expect("header parsed");
        match ReplyType::try_from(hdr.reply) {
            Ok(ReplyType::SERVER) => {
                // name is length-prefixed; the remainder of the payload is a
                // free-form description
                let mut cursor = std::io::Cursor::new(&self.rbuf[..]);
                let name = match get_string(&mut cursor) {
                    Ok(name) => name,
                    Err(pe) => return self.dead(set_error(None, pe.0)),
                };
                let desc =
                    String::from_utf8_lossy(&self.rbuf[cursor.position() as usize..]).into_owned();
                if let Some(cb) = self.opt_list_cb.as_mut() {
                    cb(&name, &desc);
                }
                self.begin_recv(OPT_REPLY_LENGTH);
                self.state = State::OptListRecvReply;
                Ok(Flow::Continue)
            }
            Ok(ReplyType::ACK) => self.option_completed(None, State::Negotiating),
            _ => {
                let errno = errno_of_reply_error(hdr.reply);
                self.option_completed(Some(errno), State::Negotiating)
            }
        }
    }

    // ----- ABORT -----

    pub(crate) fn st_opt_abort_start(&mut self) -> StepResult {
        let opt = Opt {
            typ: OptType::ABORT,
            data: vec![],
        };
        self.begin_send(opt.to_wire(), false);
        self.state = State::OptAbortSend;
        Ok(Flow::Continue)
    }

    pub(crate) fn st_opt_abort_send(&mut self) -> StepResult {
        match self.send_step() {
            Err(e) => return self.dead(e),
            Ok(None) => return Ok(Flow::Yield),
            Ok(Some(())) => {}
        }
        self.state = State::OptAbortShutWrites;
        Ok(Flow::Continue)
    }

    /// The server may send an ACK but is also allowed to close; half-close
    /// our side and treat the connection as finished.
    pub(crate) fn st_opt_abort_shut_writes(&mut self) -> StepResult {
        let sock = self.sock.as_mut().expect("socket installed");
        match sock.shutdown_writes() {
            Ok(true) => {
                self.option_completed(None, State::Closed)?;
                self.state = State::Closed;
                if let Some(sock) = self.sock.take() {
                    sock.close();
                }
                Ok(Flow::Yield)
            }
            Ok(false) => Ok(Flow::Yield),
            Err(TransportError::WouldBlock(_)) => Ok(Flow::Yield),
            Err(e) => {
                let errno = crate::states::transport_errno(&e);
                self.dead(set_error(errno, format!("shutdown: {e}")))
            }
        }
    }
}
