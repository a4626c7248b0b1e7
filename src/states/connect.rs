//! Connect states: TCP (with address iteration), Unix domain sockets,
//! AF_VSOCK, pre-connected sockets, subprocess servers over a socketpair,
//! and systemd socket activation.
//!
//! Sockets are created non-blocking; the asynchronous `connect(2)` result
//! is collected in a follow-up state via `SO_ERROR`. The subprocess paths
//! prepare every buffer the child needs before forking, so the child only
//! touches async-signal-safe calls between fork and exec.

use std::ffi::CString;
use std::net::ToSocketAddrs;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use nix::errno::Errno;
use nix::sys::socket::{
    self, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, SockaddrIn6, UnixAddr, VsockAddr,
};
use nix::unistd::{fork, getpid, ForkResult};

use crate::errors::{set_context, set_error, Result};
use crate::handle::Handle;
use crate::states::{ConnectSpec, Event, Flow, State, StepResult};
use crate::transport::PlainTransport;
use crate::utils::{fork_safe_itoa, fork_safe_perror};

/// This is baked into the systemd socket activation API.
const FIRST_SOCKET_ACTIVATION_FD: i32 = 3;

static SA_TMPDIR_SEQ: AtomicU64 = AtomicU64::new(0);

fn nonblocking_socket(family: AddressFamily) -> nix::Result<OwnedFd> {
    socket::socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
}

fn fd_raw(fd: &OwnedFd) -> std::os::fd::RawFd {
    fd.as_raw_fd()
}

impl Handle {
    // ----- state functions -----

    /// Create the socket and start the asynchronous connect for the
    /// single-address transports (Unix, VSOCK, socket activation).
    pub(crate) fn st_connect_start(&mut self) -> StepResult {
        enum Target {
            Unix(std::path::PathBuf),
            Vsock(u32, u32),
        }
        let target = match &self.connect_spec {
            Some(ConnectSpec::Unix(path)) => Target::Unix(path.clone()),
            Some(ConnectSpec::SystemdSocketActivation(_)) => {
                Target::Unix(self.sa_sockpath.clone().expect("socket path prepared"))
            }
            Some(ConnectSpec::Vsock { cid, port }) => Target::Vsock(*cid, *port),
            _ => unreachable!("spec checked by run_machine"),
        };

        let (fd, result) = match target {
            Target::Unix(path) => {
                let addr = match UnixAddr::new(path.as_path()) {
                    Ok(addr) => addr,
                    Err(errno) => return self.dead(set_error(errno, "unix socket path")),
                };
                let fd = match nonblocking_socket(AddressFamily::Unix) {
                    Ok(fd) => fd,
                    Err(errno) => return self.dead(set_error(errno, "socket")),
                };
                let result = socket::connect(fd_raw(&fd), &addr);
                (fd, result)
            }
            Target::Vsock(cid, port) => {
                let addr = VsockAddr::new(cid, port);
                let fd = match nonblocking_socket(AddressFamily::Vsock) {
                    Ok(fd) => fd,
                    Err(errno) => return self.dead(set_error(errno, "socket")),
                };
                let result = socket::connect(fd_raw(&fd), &addr);
                (fd, result)
            }
        };

        match result {
            Ok(()) | Err(Errno::EINPROGRESS) => {}
            Err(errno) => return self.dead(set_error(errno, "connect")),
        }
        self.sock = Some(Box::new(PlainTransport::new(fd)));
        self.state = State::Connecting;
        Ok(Flow::Yield)
    }

    /// Collect the status of the original connect call.
    pub(crate) fn st_connecting(&mut self) -> StepResult {
        let fd = self.sock.as_ref().expect("socket installed").poll_fd();
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let status = match socket::getsockopt(&borrowed, socket::sockopt::SocketError) {
            Ok(status) => status,
            Err(errno) => return self.dead(set_error(errno, "getsockopt: SO_ERROR")),
        };
        if status == 0 {
            self.state = State::PrepareForMagic;
            Ok(Flow::Continue)
        } else {
            self.dead(set_error(Errno::from_raw(status), "connect"))
        }
    }

    /// Resolve the host name. Resolution blocks, like `getaddrinfo`; there
    /// is no portable way to fold it into the event loop.
    pub(crate) fn st_connect_tcp_start(&mut self) -> StepResult {
        let (hostname, port) = match &self.connect_spec {
            Some(ConnectSpec::Tcp { hostname, port }) => (hostname.clone(), port.clone()),
            _ => unreachable!("spec checked by run_machine"),
        };

        match format!("{hostname}:{port}").to_socket_addrs() {
            Ok(addrs) => {
                self.connect_addrs = addrs.collect();
                self.connect_addr_index = 0;
                self.connect_errno = None;
                self.state = State::ConnectTcpConnect;
                Ok(Flow::Continue)
            }
            Err(e) => {
                self.state = State::Created;
                Err(set_error(
                    None,
                    format!("getaddrinfo: {hostname}:{port}: {e}"),
                ))
            }
        }
    }

    /// Try the next resolved address.
    pub(crate) fn st_connect_tcp_connect(&mut self) -> StepResult {
        assert!(self.sock.is_none());

        let addr = match self.connect_addrs.get(self.connect_addr_index) {
            Some(addr) => *addr,
            None => {
                // Every result was tried without success.
                let (hostname, port) = match &self.connect_spec {
                    Some(ConnectSpec::Tcp { hostname, port }) => (hostname.clone(), port.clone()),
                    _ => unreachable!(),
                };
                self.state = State::Created;
                return Err(set_error(
                    self.connect_errno,
                    format!("connect: {hostname}:{port}: could not connect to remote host"),
                ));
            }
        };

        let family = if addr.is_ipv4() {
            AddressFamily::Inet
        } else {
            AddressFamily::Inet6
        };
        let fd = match nonblocking_socket(family) {
            Ok(fd) => fd,
            Err(_) => {
                // could not even create a socket for this family
                self.state = State::ConnectTcpNext;
                return Ok(Flow::Continue);
            }
        };

        let result = match addr {
            std::net::SocketAddr::V4(v4) => {
                socket::connect(fd_raw(&fd), &SockaddrIn::from(v4))
            }
            std::net::SocketAddr::V6(v6) => {
                socket::connect(fd_raw(&fd), &SockaddrIn6::from(v6))
            }
        };
        match result {
            Ok(()) | Err(Errno::EINPROGRESS) => {
                self.sock = Some(Box::new(PlainTransport::new(fd)));
                self.state = State::ConnectTcpConnecting;
                Ok(Flow::Yield)
            }
            Err(errno) => {
                self.connect_errno = Some(errno);
                self.state = State::ConnectTcpNext;
                Ok(Flow::Continue)
            }
        }
    }

    pub(crate) fn st_connect_tcp_connecting(&mut self) -> StepResult {
        let fd = self.sock.as_ref().expect("socket installed").poll_fd();
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let status = match socket::getsockopt(&borrowed, socket::sockopt::SocketError) {
            Ok(status) => status,
            Err(errno) => return self.dead(set_error(errno, "getsockopt: SO_ERROR")),
        };
        if status == 0 {
            self.state = State::PrepareForMagic;
        } else {
            self.connect_errno = Some(Errno::from_raw(status));
            self.state = State::ConnectTcpNext;
        }
        Ok(Flow::Continue)
    }

    pub(crate) fn st_connect_tcp_next(&mut self) -> StepResult {
        if let Some(sock) = self.sock.take() {
            sock.close();
        }
        self.connect_addr_index += 1;
        self.state = State::ConnectTcpConnect;
        Ok(Flow::Continue)
    }

    /// Spawn the server subprocess with a connected socketpair on its
    /// stdin/stdout.
    pub(crate) fn st_connect_command_start(&mut self) -> StepResult {
        let argv = match &self.connect_spec {
            Some(ConnectSpec::Command(argv)) => argv.clone(),
            _ => unreachable!("spec checked by run_machine"),
        };

        // Everything the child needs is prepared before fork: only
        // async-signal-safe calls are allowed afterwards.
        let cargv = match to_cstring_vec(&argv) {
            Ok(v) => v,
            Err(e) => return self.dead(e),
        };
        let argv_ptrs = to_ptr_vec(&cargv);

        let (sv0, sv1) = match socket::socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        ) {
            Ok(pair) => pair,
            Err(errno) => return self.dead(set_error(errno, "socketpair")),
        };

        match unsafe { fork() } {
            Err(errno) => self.dead(set_error(errno, "fork")),
            Ok(ForkResult::Child) => {
                // child - run command with the socketpair as stdin/stdout
                unsafe {
                    libc::close(0);
                    libc::close(1);
                    libc::dup2(sv1.as_raw_fd(), 0);
                    libc::dup2(sv1.as_raw_fd(), 1);
                    libc::close(sv1.as_raw_fd());
                    libc::close(sv0.as_raw_fd());

                    // restore SIGPIPE back to SIG_DFL
                    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

                    libc::execvp(argv_ptrs[0], argv_ptrs.as_ptr());
                }
                fork_safe_perror(&argv[0], Errno::last());
                if Errno::last() == Errno::ENOENT {
                    unsafe { libc::_exit(127) }
                } else {
                    unsafe { libc::_exit(126) }
                }
            }
            Ok(ForkResult::Parent { child }) => {
                drop(sv1);
                self.pid = Some(child);
                self.sock = Some(Box::new(PlainTransport::new(sv0)));
                debug!(target: "nbd", "{}: spawned server pid {child}", self.hname);
                // The sockets are connected already; go straight to the
                // server greeting.
                self.state = State::PrepareForMagic;
                Ok(Flow::Continue)
            }
        }
    }

    /// Spawn the server subprocess with a bound listening socket passed by
    /// systemd socket activation convention (fd 3, `LISTEN_FDS`,
    /// `LISTEN_PID`).
    pub(crate) fn st_connect_sa_start(&mut self) -> StepResult {
        let argv = match &self.connect_spec {
            Some(ConnectSpec::SystemdSocketActivation(argv)) => argv.clone(),
            _ => unreachable!("spec checked by run_machine"),
        };

        // /tmp rather than TMPDIR: the path must be short enough for a
        // sockaddr_un.
        let seq = SA_TMPDIR_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmpdir = PathBuf::from(format!("/tmp/nbd-sa-{}-{seq}", getpid()));
        if let Err(e) = std::fs::DirBuilder::new().mode(0o700).create(&tmpdir) {
            let errno = Errno::from_raw(e.raw_os_error().unwrap_or(0));
            return self.dead(set_error(errno, format!("mkdir: {}", tmpdir.display())));
        }
        let sockpath = tmpdir.join("sock");
        self.sa_tmpdir = Some(tmpdir);
        self.sa_sockpath = Some(sockpath.clone());

        // The listener is created without CLOEXEC so the child inherits it.
        let listener = match socket::socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::empty(),
            None,
        ) {
            Ok(fd) => fd,
            Err(errno) => return self.dead(set_error(errno, "socket")),
        };
        let addr = match UnixAddr::new(sockpath.as_path()) {
            Ok(addr) => addr,
            Err(errno) => return self.dead(set_error(errno, "unix socket path")),
        };
        if let Err(errno) = socket::bind(listener.as_raw_fd(), &addr) {
            return self.dead(set_error(errno, format!("bind: {}", sockpath.display())));
        }
        if let Err(errno) = socket::listen(&listener, Backlog::new(1).expect("valid backlog")) {
            return self.dead(set_error(errno, "listen"));
        }

        // Prepare argv and environment before fork. env[0] is the
        // LISTEN_PID placeholder patched (in place, no allocation) by the
        // child; env[1] is LISTEN_FDS=1; the rest is our environment minus
        // any previous LISTEN_PID/LISTEN_FDS.
        let cargv = match to_cstring_vec(&argv) {
            Ok(v) => v,
            Err(e) => return self.dead(e),
        };
        let argv_ptrs = to_ptr_vec(&cargv);

        let mut listen_pid = *b"LISTEN_PID=0000000000000000\0";
        let listen_fds = CString::new("LISTEN_FDS=1").expect("no interior NUL");
        let mut cenv: Vec<CString> = Vec::new();
        for (key, value) in std::env::vars() {
            if key == "LISTEN_PID" || key == "LISTEN_FDS" {
                continue;
            }
            if let Ok(cs) = CString::new(format!("{key}={value}")) {
                cenv.push(cs);
            }
        }
        let mut env_ptrs: Vec<*const libc::c_char> = Vec::with_capacity(cenv.len() + 3);
        env_ptrs.push(listen_pid.as_ptr().cast());
        env_ptrs.push(listen_fds.as_ptr());
        env_ptrs.extend(cenv.iter().map(|c| c.as_ptr()));
        env_ptrs.push(std::ptr::null());

        match unsafe { fork() } {
            Err(errno) => self.dead(set_error(errno, "fork")),
            Ok(ForkResult::Child) => {
                unsafe {
                    let s = listener.as_raw_fd();
                    if s != FIRST_SOCKET_ACTIVATION_FD {
                        libc::dup2(s, FIRST_SOCKET_ACTIVATION_FD);
                        libc::close(s);
                    }

                    // Patch the actual child pid into the placeholder.
                    let mut scratch = [0u8; 32];
                    let digits = fork_safe_itoa(getpid().as_raw() as i64, &mut scratch);
                    let prefix = b"LISTEN_PID=".len();
                    listen_pid[prefix..prefix + digits.len()]
                        .copy_from_slice(digits.as_bytes());
                    listen_pid[prefix + digits.len()] = 0;

                    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

                    libc::execvpe(argv_ptrs[0], argv_ptrs.as_ptr(), env_ptrs.as_ptr());
                }
                fork_safe_perror(&argv[0], Errno::last());
                if Errno::last() == Errno::ENOENT {
                    unsafe { libc::_exit(127) }
                } else {
                    unsafe { libc::_exit(126) }
                }
            }
            Ok(ForkResult::Parent { child }) => {
                drop(listener);
                self.pid = Some(child);
                debug!(target: "nbd", "{}: spawned socket-activated server pid {child}", self.hname);
                self.state = State::ConnectStart;
                Ok(Flow::Continue)
            }
        }
    }

    // ----- public connect API -----

    fn aio_connect_common(&mut self, spec: ConnectSpec) -> Result<()> {
        if self.state != State::Created {
            return Err(set_error(
                Errno::EINVAL,
                "handle is connected or previously connected",
            ));
        }
        self.connect_spec = Some(spec);
        self.run_machine(Event::CmdConnect)
    }

    /// Start connecting to a TCP server. `port` may be a number or a
    /// service name; the default NBD port is 10809.
    pub fn aio_connect_tcp(&mut self, hostname: &str, port: &str) -> Result<()> {
        set_context("nbd_aio_connect_tcp");
        self.aio_connect_common(ConnectSpec::Tcp {
            hostname: hostname.to_string(),
            port: port.to_string(),
        })
    }

    /// Connect to a TCP server and finish the NBD handshake.
    pub fn connect_tcp(&mut self, hostname: &str, port: &str) -> Result<()> {
        set_context("nbd_connect_tcp");
        self.aio_connect_common(ConnectSpec::Tcp {
            hostname: hostname.to_string(),
            port: port.to_string(),
        })?;
        self.wait_until_connected()
    }

    /// Start connecting to a Unix domain socket.
    pub fn aio_connect_unix(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        set_context("nbd_aio_connect_unix");
        self.aio_connect_common(ConnectSpec::Unix(path.into()))
    }

    /// Connect to a Unix domain socket and finish the NBD handshake.
    pub fn connect_unix(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        set_context("nbd_connect_unix");
        self.aio_connect_common(ConnectSpec::Unix(path.into()))?;
        self.wait_until_connected()
    }

    /// Start connecting to an `AF_VSOCK` peer.
    pub fn aio_connect_vsock(&mut self, cid: u32, port: u32) -> Result<()> {
        set_context("nbd_aio_connect_vsock");
        self.aio_connect_common(ConnectSpec::Vsock { cid, port })
    }

    /// Connect over `AF_VSOCK` and finish the NBD handshake.
    pub fn connect_vsock(&mut self, cid: u32, port: u32) -> Result<()> {
        set_context("nbd_connect_vsock");
        self.aio_connect_common(ConnectSpec::Vsock { cid, port })?;
        self.wait_until_connected()
    }

    /// Adopt a connected socket (made non-blocking here) and start the NBD
    /// handshake on it.
    pub fn aio_connect_socket(&mut self, fd: OwnedFd) -> Result<()> {
        set_context("nbd_aio_connect_socket");
        if self.state != State::Created {
            return Err(set_error(
                Errno::EINVAL,
                "handle is connected or previously connected",
            ));
        }
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
        if flags == -1
            || unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) }
                == -1
        {
            return Err(set_error(Errno::last(), "fcntl: O_NONBLOCK"));
        }
        self.sock = Some(Box::new(PlainTransport::new(fd)));
        self.connect_spec = Some(ConnectSpec::Socket);
        self.run_machine(Event::CmdConnect)
    }

    /// Adopt a connected socket and finish the NBD handshake.
    pub fn connect_socket(&mut self, fd: OwnedFd) -> Result<()> {
        set_context("nbd_connect_socket");
        self.aio_connect_socket(fd)?;
        self.wait_until_connected()
    }

    /// Start a server subprocess connected by a socketpair on its
    /// stdin/stdout, e.g. `["nbdkit", "-s", "memory", "size=1M"]`.
    pub fn aio_connect_command(&mut self, argv: &[&str]) -> Result<()> {
        set_context("nbd_aio_connect_command");
        check_argv(argv)?;
        self.aio_connect_common(ConnectSpec::Command(
            argv.iter().map(|s| s.to_string()).collect(),
        ))
    }

    /// Run a server subprocess and finish the NBD handshake over the
    /// socketpair.
    pub fn connect_command(&mut self, argv: &[&str]) -> Result<()> {
        set_context("nbd_connect_command");
        check_argv(argv)?;
        self.aio_connect_common(ConnectSpec::Command(
            argv.iter().map(|s| s.to_string()).collect(),
        ))?;
        self.wait_until_connected()
    }

    /// Start a server subprocess using systemd socket activation.
    pub fn aio_connect_systemd_socket_activation(&mut self, argv: &[&str]) -> Result<()> {
        set_context("nbd_aio_connect_systemd_socket_activation");
        check_argv(argv)?;
        self.aio_connect_common(ConnectSpec::SystemdSocketActivation(
            argv.iter().map(|s| s.to_string()).collect(),
        ))
    }

    /// Run a socket-activated server subprocess and finish the NBD
    /// handshake.
    pub fn connect_systemd_socket_activation(&mut self, argv: &[&str]) -> Result<()> {
        set_context("nbd_connect_systemd_socket_activation");
        check_argv(argv)?;
        self.aio_connect_common(ConnectSpec::SystemdSocketActivation(
            argv.iter().map(|s| s.to_string()).collect(),
        ))?;
        self.wait_until_connected()
    }

    /// Drive the machine until the handshake finishes (or fails).
    pub(crate) fn wait_until_connected(&mut self) -> Result<()> {
        while self.aio_is_connecting() {
            self.poll_internal(-1)?;
        }
        if self.aio_is_ready() || self.aio_is_negotiating() {
            Ok(())
        } else {
            Err(set_error(Errno::ENOTCONN, "connection attempt failed"))
        }
    }

    /// Server name used for TLS certificate verification.
    pub(crate) fn tls_server_name(&self) -> String {
        match &self.connect_spec {
            Some(ConnectSpec::Tcp { hostname, .. }) => hostname.clone(),
            _ => "localhost".to_string(),
        }
    }
}

fn check_argv(argv: &[&str]) -> Result<()> {
    if argv.is_empty() {
        return Err(set_error(Errno::EINVAL, "missing command name in argv list"));
    }
    Ok(())
}

fn to_cstring_vec(argv: &[String]) -> Result<Vec<CString>> {
    argv.iter()
        .map(|s| {
            CString::new(s.as_str())
                .map_err(|_| set_error(Errno::EINVAL, "NUL byte in command argument"))
        })
        .collect()
}

fn to_ptr_vec(cstrings: &[CString]) -> Vec<*const libc::c_char> {
    let mut ptrs: Vec<*const libc::c_char> = cstrings.iter().map(|c| c.as_ptr()).collect();
    ptrs.push(std::ptr::null());
    ptrs
}
