//! The NBD client handle.
//!
//! A [`Handle`] is the identity, configuration and runtime state of one NBD
//! connection. It is owned by the caller and driven either through the
//! blocking API (`connect_*`, `pread`, ...) or the `aio_*` API plus an event
//! loop of the caller's choosing.
//!
//! Public methods take `&mut self`: exclusive access per handle is the
//! locking model, and distinct handles are fully independent.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;

use crate::cmd::Command;
use crate::crypto::{TlsMode, TlsSettings};
use crate::errors::{set_context, set_error, Result};
use crate::proto::{CmdFlags, HandshakeFlags, OptReplyHeader, OptType, StructuredReply, TransmitFlags, MAX_STRING};
use crate::states::{ConnectSpec, State};
use crate::transport::{AioDirection, Transport};
use crate::{CompletionCallback, ContextCallback, ListCallback};

bitflags! {
    /// Client-side validations performed before a command touches the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StrictFlags: u32 {
        /// Reject commands the server did not advertise support for.
        const COMMANDS = 0x01;
        /// Reject unknown command flags.
        const FLAGS = 0x02;
        /// Reject offset+count past the export size.
        const BOUNDS = 0x04;
        /// Reject zero-byte data commands.
        const ZERO_SIZE = 0x08;
        /// Reject unaligned offset/count when the server advertised a
        /// minimum block size.
        const ALIGN = 0x10;
        /// Reject writes larger than the negotiated payload maximum.
        const PAYLOAD = 0x20;
        /// Reject flag/command combinations the protocol forbids outright
        /// (e.g. writes to a read-only export).
        const AUTO_FLAG = 0x40;
        /// Reject extent requests larger than 32 bits.
        const ONE_SIZE = 0x80;
    }

    /// Transports a URI may select.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllowTransport: u32 {
        const TCP = 0x01;
        const UNIX = 0x02;
        const VSOCK = 0x04;
    }
}

impl Default for StrictFlags {
    fn default() -> Self {
        StrictFlags::all()
    }
}

/// Block size constraint kinds for [`Handle::get_block_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSizeKind {
    Minimum,
    Preferred,
    Maximum,
    /// The derived maximum payload for one request.
    Payload,
}

/// A metadata context negotiated with the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MetaContext {
    pub name: String,
    pub context_id: u32,
}

/// Connection statistics.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Stats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub chunks_sent: u64,
    pub chunks_received: u64,
}

/// Read cursor for the scratch buffer: how many bytes of `Handle::rbuf`
/// are wanted and how many have arrived. `discard` drops oversized payloads
/// without storing them.
#[derive(Debug, Default)]
pub(crate) struct ReadCursor {
    pub want: usize,
    pub got: usize,
    pub discard: bool,
}

impl ReadCursor {
    pub fn done(&self) -> bool {
        self.got >= self.want
    }
}

static NEXT_HANDLE_NAME: AtomicU64 = AtomicU64::new(1);

/// One NBD connection. See the crate documentation for the two driving
/// styles.
pub struct Handle {
    /// Debug name, `nbd1`, `nbd2`, ... Only used in log output.
    pub(crate) hname: String,

    // ----- configuration -----
    pub(crate) export_name: String,
    pub(crate) tls: TlsMode,
    pub(crate) tls_settings: TlsSettings,
    pub(crate) request_sr: bool,
    pub(crate) request_meta: bool,
    pub(crate) request_block_size: bool,
    pub(crate) full_info: bool,
    pub(crate) request_meta_contexts: Vec<String>,
    pub(crate) handshake_flags: HandshakeFlags,
    pub(crate) strict: StrictFlags,
    pub(crate) opt_mode: bool,
    pub(crate) pread_initialize: bool,
    pub(crate) uri_allow_transports: AllowTransport,
    pub(crate) uri_allow_tls: TlsMode,
    pub(crate) uri_allow_local_file: bool,

    // ----- negotiated facts -----
    pub(crate) gflags: HandshakeFlags,
    /// Export size; only valid while `eflags` is non-empty, since all
    /// servers must set `HAS_FLAGS` and both fields are set together.
    pub(crate) exportsize: u64,
    pub(crate) eflags: TransmitFlags,
    pub(crate) block_minimum: u32,
    pub(crate) block_preferred: u32,
    pub(crate) block_maximum: u32,
    pub(crate) payload_maximum: u32,
    pub(crate) canonical_name: Option<String>,
    pub(crate) description: Option<String>,
    pub(crate) protocol: &'static str,
    pub(crate) tls_negotiated: bool,
    pub(crate) structured_replies: bool,
    pub(crate) meta_contexts: Vec<MetaContext>,
    pub(crate) meta_valid: bool,

    // ----- transport and I/O cursors -----
    pub(crate) sock: Option<Box<dyn Transport>>,
    pub(crate) rbuf: Vec<u8>,
    pub(crate) rcursor: ReadCursor,
    pub(crate) wbuf: Vec<u8>,
    pub(crate) woff: usize,
    pub(crate) wmore: bool,
    /// A partially sent request header is parked in `wbuf`.
    pub(crate) in_write_header: bool,
    /// A request header went out but its write payload has not completely
    /// followed yet.
    pub(crate) in_write_payload: bool,
    pub(crate) wpayload_off: usize,
    /// Cookie of the command whose request is currently being written.
    pub(crate) issuing_cookie: Option<u64>,
    /// Direction the TLS handshake is waiting on.
    pub(crate) tls_dir: AioDirection,

    // ----- connect state -----
    pub(crate) connect_spec: Option<ConnectSpec>,
    pub(crate) connect_addrs: Vec<std::net::SocketAddr>,
    pub(crate) connect_addr_index: usize,
    pub(crate) connect_errno: Option<Errno>,
    pub(crate) pid: Option<Pid>,
    pub(crate) sa_tmpdir: Option<PathBuf>,
    pub(crate) sa_sockpath: Option<PathBuf>,

    // ----- single-option machinery -----
    pub(crate) opt_current: Option<OptType>,
    pub(crate) opt_completion: Option<CompletionCallback>,
    pub(crate) opt_list_cb: Option<ListCallback>,
    pub(crate) opt_context_cb: Option<ContextCallback>,
    pub(crate) current_opt_reply: Option<OptReplyHeader>,
    pub(crate) querylist: Vec<String>,

    // ----- command queues -----
    pub(crate) cmds_to_issue: VecDeque<Command>,
    pub(crate) cmds_in_flight: Vec<Command>,
    pub(crate) cmds_done: VecDeque<Command>,
    /// Cookie of the command the current reply cycle is for.
    pub(crate) reply_cmd: Option<u64>,
    pub(crate) reply_hdr: Option<StructuredReply>,
    /// Saved state for resuming a partially received reply after a trip
    /// through `READY` (so new requests can interleave).
    pub(crate) reply_resume: Option<State>,
    /// Error number from the current structured error chunk.
    pub(crate) chunk_error: Option<u32>,
    /// Absolute offset carried by the current data/hole chunk.
    pub(crate) chunk_offset: u64,
    pub(crate) bs_entries: Vec<u8>,
    pub(crate) disconnect_request: bool,

    /// Used for generating cookie numbers.
    pub(crate) unique: u64,

    pub(crate) state: State,
    pub(crate) stats: Stats,
}

impl Handle {
    /// Create a handle in the `CREATED` state with default configuration:
    /// empty export name, TLS disabled, structured replies requested, all
    /// strict checks enabled, read buffers pre-initialized.
    pub fn new() -> Handle {
        let hname = format!("nbd{}", NEXT_HANDLE_NAME.fetch_add(1, Ordering::Relaxed));
        debug!(target: "nbd", "{hname}: creating handle");
        Handle {
            hname,
            export_name: String::new(),
            tls: TlsMode::Disable,
            tls_settings: TlsSettings {
                verify_peer: true,
                ..Default::default()
            },
            request_sr: true,
            request_meta: true,
            request_block_size: true,
            full_info: false,
            request_meta_contexts: Vec::new(),
            handshake_flags: HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES,
            strict: StrictFlags::default(),
            opt_mode: false,
            pread_initialize: true,
            uri_allow_transports: AllowTransport::all(),
            uri_allow_tls: TlsMode::Allow,
            uri_allow_local_file: false,
            gflags: HandshakeFlags::empty(),
            exportsize: 0,
            eflags: TransmitFlags::empty(),
            block_minimum: 0,
            block_preferred: 0,
            block_maximum: 0,
            payload_maximum: 0,
            canonical_name: None,
            description: None,
            protocol: "",
            tls_negotiated: false,
            structured_replies: false,
            meta_contexts: Vec::new(),
            meta_valid: false,
            sock: None,
            rbuf: Vec::new(),
            rcursor: ReadCursor::default(),
            wbuf: Vec::new(),
            woff: 0,
            wmore: false,
            in_write_header: false,
            in_write_payload: false,
            wpayload_off: 0,
            issuing_cookie: None,
            tls_dir: AioDirection::READ,
            connect_spec: None,
            connect_addrs: Vec::new(),
            connect_addr_index: 0,
            connect_errno: None,
            pid: None,
            sa_tmpdir: None,
            sa_sockpath: None,
            opt_current: None,
            opt_completion: None,
            opt_list_cb: None,
            opt_context_cb: None,
            current_opt_reply: None,
            querylist: Vec::new(),
            cmds_to_issue: VecDeque::new(),
            cmds_in_flight: Vec::new(),
            cmds_done: VecDeque::new(),
            reply_cmd: None,
            reply_hdr: None,
            reply_resume: None,
            chunk_error: None,
            chunk_offset: 0,
            bs_entries: Vec::new(),
            disconnect_request: false,
            unique: 1,
            state: State::Created,
            stats: Stats::default(),
        }
    }

    /// The handle's debug name.
    pub fn get_handle_name(&self) -> &str {
        &self.hname
    }

    // ----- configuration setters -----

    fn require_created(&self, what: &str) -> Result<()> {
        if self.state != State::Created {
            return Err(set_error(
                Errno::EINVAL,
                format!("{what} may only be changed before connecting"),
            ));
        }
        Ok(())
    }

    fn require_created_or_negotiating(&self, what: &str) -> Result<()> {
        if self.state != State::Created && self.state != State::Negotiating {
            return Err(set_error(
                Errno::EINVAL,
                format!("{what} may only be changed before option negotiation finishes"),
            ));
        }
        Ok(())
    }

    /// Set the export name to request from the server (≤ 4096 bytes).
    pub fn set_export_name(&mut self, name: &str) -> Result<()> {
        set_context("nbd_set_export_name");
        self.require_created_or_negotiating("export name")?;
        if name.len() > MAX_STRING {
            return Err(set_error(Errno::ENAMETOOLONG, "export name too long"));
        }
        self.export_name = name.to_string();
        Ok(())
    }

    /// The configured export name.
    pub fn get_export_name(&self) -> &str {
        &self.export_name
    }

    /// Set the TLS mode. `Require` fails the handshake if the server will
    /// not upgrade.
    pub fn set_tls(&mut self, tls: TlsMode) -> Result<()> {
        set_context("nbd_set_tls");
        self.require_created("TLS mode")?;
        self.tls = tls;
        Ok(())
    }

    pub fn get_tls(&self) -> TlsMode {
        self.tls
    }

    /// Directory containing `ca-cert.pem` and optionally
    /// `client-cert.pem` / `client-key.pem`.
    pub fn set_tls_certificates(&mut self, dir: impl Into<PathBuf>) -> Result<()> {
        set_context("nbd_set_tls_certificates");
        self.require_created("TLS certificates")?;
        self.tls_settings.certificates = Some(dir.into());
        Ok(())
    }

    pub fn set_tls_verify_peer(&mut self, verify: bool) -> Result<()> {
        set_context("nbd_set_tls_verify_peer");
        self.require_created("TLS verify-peer")?;
        self.tls_settings.verify_peer = verify;
        Ok(())
    }

    pub fn get_tls_verify_peer(&self) -> bool {
        self.tls_settings.verify_peer
    }

    pub fn set_tls_username(&mut self, username: &str) -> Result<()> {
        set_context("nbd_set_tls_username");
        self.require_created("TLS username")?;
        self.tls_settings.username = Some(username.to_string());
        Ok(())
    }

    /// Configure a pre-shared-key file. Accepted for configuration parity;
    /// the TLS layer reports `ENOTSUP` at STARTTLS time since rustls has no
    /// TLS-PSK.
    pub fn set_tls_psk_file(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        set_context("nbd_set_tls_psk_file");
        self.require_created("TLS PSK file")?;
        self.tls_settings.psk_file = Some(path.into());
        Ok(())
    }

    /// Restrict which handshake flags the client will offer to the server.
    pub fn set_handshake_flags(&mut self, flags: HandshakeFlags) -> Result<()> {
        set_context("nbd_set_handshake_flags");
        self.require_created("handshake flags")?;
        self.handshake_flags = flags;
        Ok(())
    }

    pub fn get_handshake_flags(&self) -> HandshakeFlags {
        self.handshake_flags
    }

    /// Whether to attempt `STRUCTURED_REPLY` negotiation.
    pub fn set_request_structured_replies(&mut self, request: bool) -> Result<()> {
        set_context("nbd_set_request_structured_replies");
        self.require_created("structured replies request")?;
        self.request_sr = request;
        Ok(())
    }

    pub fn get_request_structured_replies(&self) -> bool {
        self.request_sr
    }

    /// Whether to attempt `SET_META_CONTEXT` during connection.
    pub fn set_request_meta_context(&mut self, request: bool) -> Result<()> {
        set_context("nbd_set_request_meta_context");
        self.require_created_or_negotiating("meta context request")?;
        self.request_meta = request;
        Ok(())
    }

    pub fn get_request_meta_context(&self) -> bool {
        self.request_meta
    }

    /// Whether to ask the server for block size constraints during `GO`.
    pub fn set_request_block_size(&mut self, request: bool) -> Result<()> {
        set_context("nbd_set_request_block_size");
        self.require_created_or_negotiating("block size request")?;
        self.request_block_size = request;
        Ok(())
    }

    /// Whether `GO` also asks for the canonical name and description.
    pub fn set_full_info(&mut self, full: bool) -> Result<()> {
        set_context("nbd_set_full_info");
        self.require_created_or_negotiating("full info request")?;
        self.full_info = full;
        Ok(())
    }

    pub fn get_full_info(&self) -> bool {
        self.full_info
    }

    /// Append a metadata context to request (e.g. `base:allocation`).
    pub fn add_meta_context(&mut self, name: &str) -> Result<()> {
        set_context("nbd_add_meta_context");
        self.require_created_or_negotiating("meta contexts")?;
        if name.len() > MAX_STRING {
            return Err(set_error(Errno::ENAMETOOLONG, "meta context name too long"));
        }
        self.request_meta_contexts.push(name.to_string());
        Ok(())
    }

    /// Remove all requested meta contexts.
    pub fn clear_meta_contexts(&mut self) -> Result<()> {
        set_context("nbd_clear_meta_contexts");
        self.require_created_or_negotiating("meta contexts")?;
        self.request_meta_contexts.clear();
        Ok(())
    }

    /// Number of requested meta contexts.
    pub fn get_nr_meta_contexts(&self) -> usize {
        self.request_meta_contexts.len()
    }

    /// Enable option mode: stop in `NEGOTIATING` after the initial
    /// handshake instead of going straight to `GO`.
    pub fn set_opt_mode(&mut self, opt_mode: bool) -> Result<()> {
        set_context("nbd_set_opt_mode");
        self.require_created("option mode")?;
        self.opt_mode = opt_mode;
        Ok(())
    }

    pub fn get_opt_mode(&self) -> bool {
        self.opt_mode
    }

    /// Tune the client-side strict checks.
    pub fn set_strict_mode(&mut self, strict: StrictFlags) -> Result<()> {
        set_context("nbd_set_strict_mode");
        self.strict = strict;
        Ok(())
    }

    pub fn get_strict_mode(&self) -> StrictFlags {
        self.strict
    }

    /// Whether `pread` buffers are zeroed before issue, so a non-compliant
    /// server cannot leak previous buffer contents.
    pub fn set_pread_initialize(&mut self, init: bool) -> Result<()> {
        set_context("nbd_set_pread_initialize");
        self.pread_initialize = init;
        Ok(())
    }

    pub fn get_pread_initialize(&self) -> bool {
        self.pread_initialize
    }

    /// Which transports `connect_uri` may use.
    pub fn set_uri_allow_transports(&mut self, mask: AllowTransport) -> Result<()> {
        set_context("nbd_set_uri_allow_transports");
        self.uri_allow_transports = mask;
        Ok(())
    }

    /// Whether `connect_uri` may (or must) use TLS.
    pub fn set_uri_allow_tls(&mut self, tls: TlsMode) -> Result<()> {
        set_context("nbd_set_uri_allow_tls");
        self.uri_allow_tls = tls;
        Ok(())
    }

    /// Whether URIs may reference local files (`tls-certificates=`,
    /// `tls-psk-file=`).
    pub fn set_uri_allow_local_file(&mut self, allow: bool) -> Result<()> {
        set_context("nbd_set_uri_allow_local_file");
        self.uri_allow_local_file = allow;
        Ok(())
    }

    // ----- post-handshake introspection not tied to eflags -----

    /// Protocol tag: `"oldstyle"`, `"newstyle"` or `"newstyle-fixed"`.
    pub fn get_protocol(&self) -> Result<&'static str> {
        set_context("nbd_get_protocol");
        if self.protocol.is_empty() {
            return Err(set_error(
                Errno::EINVAL,
                "handshake has not reached the point where the protocol style is known",
            ));
        }
        Ok(self.protocol)
    }

    /// True once `STARTTLS` succeeded on this connection.
    pub fn get_tls_negotiated(&self) -> bool {
        self.tls_negotiated
    }

    /// True once `STRUCTURED_REPLY` was negotiated.
    pub fn get_structured_replies_negotiated(&self) -> bool {
        self.structured_replies
    }

    /// Canonical export name the server reported, if `full_info` was set
    /// and the server offered one.
    pub fn get_canonical_export_name(&self) -> Result<&str> {
        set_context("nbd_get_canonical_export_name");
        match &self.canonical_name {
            Some(name) => Ok(name),
            None => Err(set_error(
                Errno::EINVAL,
                "server did not send an export name",
            )),
        }
    }

    /// Export description the server reported, if any.
    pub fn get_export_description(&self) -> Result<&str> {
        set_context("nbd_get_export_description");
        match &self.description {
            Some(desc) => Ok(desc),
            None => Err(set_error(
                Errno::EINVAL,
                "server did not send an export description",
            )),
        }
    }

    // ----- statistics -----

    /// Bytes handed to the transport so far. Counted as frames are written,
    /// so during a large copy this leads what the server has committed.
    pub fn stats_bytes_sent(&self) -> u64 {
        self.stats.bytes_sent
    }

    pub fn stats_bytes_received(&self) -> u64 {
        self.stats.bytes_received
    }

    /// Wire frames sent (requests and option requests).
    pub fn stats_chunks_sent(&self) -> u64 {
        self.stats.chunks_sent
    }

    /// Wire frames received (replies, reply chunks and option replies).
    pub fn stats_chunks_received(&self) -> u64 {
        self.stats.chunks_received
    }

    // ----- internal helpers shared by the state modules -----

    /// Allocate the next command cookie.
    pub(crate) fn next_cookie(&mut self) -> u64 {
        let cookie = self.unique;
        self.unique += 1;
        cookie
    }

    /// Reset negotiated connection data. Called after swapping the export
    /// name, after a failed `GO`/`INFO`, and after a successful `STARTTLS`.
    pub(crate) fn reset_size_and_flags(&mut self) {
        self.exportsize = 0;
        self.eflags = TransmitFlags::empty();
        self.block_minimum = 0;
        self.block_preferred = 0;
        self.block_maximum = 0;
        self.payload_maximum = 0;
        self.canonical_name = None;
        self.description = None;
    }

    /// Forget everything negotiated before a TLS upgrade: the pre-TLS
    /// exchange is discarded wholesale.
    pub(crate) fn reset_negotiated_state(&mut self) {
        self.reset_size_and_flags();
        self.structured_replies = false;
        self.meta_contexts.clear();
        self.meta_valid = false;
    }

    pub(crate) fn find_in_flight(&self, cookie: u64) -> Option<usize> {
        self.cmds_in_flight.iter().position(|c| c.cookie == cookie)
    }
}

impl Default for Handle {
    fn default() -> Self {
        Handle::new()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        // Close the transport first so a subprocess server sees EOF.
        if let Some(sock) = self.sock.take() {
            sock.close();
        }
        if let Some(pid) = self.pid.take() {
            if let Ok(nix::sys::wait::WaitStatus::StillAlive) =
                waitpid(pid, Some(WaitPidFlag::WNOHANG))
            {
                let _ = kill(pid, Signal::SIGTERM);
                let _ = waitpid(pid, None);
            }
        }
        if let Some(path) = self.sa_sockpath.take() {
            let _ = std::fs::remove_file(path);
        }
        if let Some(dir) = self.sa_tmpdir.take() {
            let _ = std::fs::remove_dir(dir);
        }
    }
}

impl CmdFlags {
    /// Flags a caller is allowed to pass to data commands.
    pub(crate) fn known() -> CmdFlags {
        CmdFlags::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_names_are_unique() {
        let a = Handle::new();
        let b = Handle::new();
        assert_ne!(a.get_handle_name(), b.get_handle_name());
        assert!(a.get_handle_name().starts_with("nbd"));
    }

    #[test]
    fn setters_rejected_after_created() {
        let mut h = Handle::new();
        h.state = State::Ready;
        assert_eq!(
            h.set_tls(TlsMode::Require).unwrap_err().errno(),
            Some(Errno::EINVAL)
        );
        assert_eq!(
            h.set_opt_mode(true).unwrap_err().errno(),
            Some(Errno::EINVAL)
        );
        // strict mode and pread-initialize may be toggled at any time
        h.set_strict_mode(StrictFlags::BOUNDS).unwrap();
        h.set_pread_initialize(false).unwrap();
    }

    #[test]
    fn export_name_limits() {
        let mut h = Handle::new();
        let long = "x".repeat(MAX_STRING + 1);
        assert_eq!(
            h.set_export_name(&long).unwrap_err().errno(),
            Some(Errno::ENAMETOOLONG)
        );
        h.set_export_name("default").unwrap();
        assert_eq!(h.get_export_name(), "default");
    }

    #[test]
    fn accessors_before_handshake() {
        let h = Handle::new();
        assert!(h.get_protocol().is_err());
        assert!(h.get_canonical_export_name().is_err());
        assert!(!h.get_tls_negotiated());
        assert!(!h.get_structured_replies_negotiated());
    }

    #[test]
    fn starttls_resets_negotiated_state() {
        let mut h = Handle::new();
        h.structured_replies = true;
        h.meta_contexts.push(MetaContext {
            name: "base:allocation".into(),
            context_id: 5,
        });
        h.exportsize = 100;
        h.eflags = TransmitFlags::HAS_FLAGS;
        h.reset_negotiated_state();
        assert!(!h.structured_replies);
        assert!(h.meta_contexts.is_empty());
        assert_eq!(h.exportsize, 0);
        assert!(h.eflags.is_empty());
    }
}
