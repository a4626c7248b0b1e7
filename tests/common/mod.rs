//! A scripted NBD server for exercising the client against canned
//! handshakes and replies, one connection per test.
#![allow(dead_code)]

use std::io::prelude::*;
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::thread::JoinHandle;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

pub const MAGIC: u64 = 0x4e42444d41474943; // b"NBDMAGIC"
pub const OLD_VERSION: u64 = 0x00420281861253;
pub const NEW_VERSION: u64 = 0x49484156454F5054; // b"IHAVEOPT"
pub const REP_MAGIC: u64 = 0x3e889045565a9;
pub const REQUEST_MAGIC: u32 = 0x25609513;
pub const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
pub const STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

pub const OPT_EXPORT_NAME: u32 = 1;
pub const OPT_ABORT: u32 = 2;
pub const OPT_LIST: u32 = 3;
pub const OPT_STARTTLS: u32 = 5;
pub const OPT_INFO: u32 = 6;
pub const OPT_GO: u32 = 7;
pub const OPT_STRUCTURED_REPLY: u32 = 8;
pub const OPT_LIST_META_CONTEXT: u32 = 9;
pub const OPT_SET_META_CONTEXT: u32 = 10;

pub const REP_ACK: u32 = 1;
pub const REP_SERVER: u32 = 2;
pub const REP_INFO: u32 = 3;
pub const REP_META_CONTEXT: u32 = 4;
pub const REP_ERR_UNSUP: u32 = (1 << 31) + 1;
pub const REP_ERR_POLICY: u32 = (1 << 31) + 2;

pub const INFO_EXPORT: u16 = 0;
pub const INFO_BLOCK_SIZE: u16 = 3;

pub const CMD_READ: u16 = 0;
pub const CMD_WRITE: u16 = 1;
pub const CMD_DISC: u16 = 2;
pub const CMD_FLUSH: u16 = 3;
pub const CMD_BLOCK_STATUS: u16 = 7;

pub const CHUNK_NONE: u16 = 0;
pub const CHUNK_OFFSET_DATA: u16 = 1;
pub const CHUNK_OFFSET_HOLE: u16 = 2;
pub const CHUNK_BLOCK_STATUS: u16 = 5;
pub const CHUNK_ERROR: u16 = (1 << 15) + 1;
pub const CHUNK_ERROR_OFFSET: u16 = (1 << 15) + 2;
pub const CHUNK_DONE: u16 = 1;

pub const FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const FLAG_SEND_FLUSH: u16 = 1 << 2;

/// Wire up test logging once; set RUST_LOG=nbd=debug to watch the state
/// machine.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Accept one connection on an ephemeral loopback port and hand it to the
/// script.
pub fn serve<F>(script: F) -> (JoinHandle<()>, u16)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let port = listener.local_addr().expect("local addr").port();
    let handle = std::thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        stream.set_nodelay(true).ok();
        script(stream);
    });
    (handle, port)
}

/// Accept one connection on a Unix domain socket and hand it to the
/// script.
pub fn serve_unix<F>(path: &Path, script: F) -> JoinHandle<()>
where
    F: FnOnce(UnixStream) + Send + 'static,
{
    let listener = UnixListener::bind(path).expect("bind unix socket");
    std::thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        script(stream);
    })
}

/// How the scripted server answers the automatic option chain.
pub struct ServerConfig {
    pub size: u64,
    pub eflags: u16,
    /// ACK structured reply negotiation.
    pub sr: bool,
    /// Contexts to accept in `SET_META_CONTEXT`: `(id, name)`.
    pub meta: Vec<(u32, String)>,
    /// Answer `GO` with `ERR_UNSUP` to force the `EXPORT_NAME` fallback.
    pub go_unsup: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            size: 1 << 20,
            eflags: FLAG_HAS_FLAGS | FLAG_SEND_FLUSH,
            sr: true,
            meta: vec![],
            go_unsup: false,
        }
    }
}

pub fn send_oldstyle_greeting<S: Read + Write>(s: &mut S, size: u64, flags: u16) {
    s.write_u64::<BE>(MAGIC).unwrap();
    s.write_u64::<BE>(OLD_VERSION).unwrap();
    s.write_u64::<BE>(size).unwrap();
    s.write_u16::<BE>(flags).unwrap();
    s.write_all(&[0u8; 124]).unwrap();
    s.flush().unwrap();
}

pub fn send_newstyle_greeting<S: Read + Write>(s: &mut S, gflags: u16) {
    s.write_u64::<BE>(MAGIC).unwrap();
    s.write_u64::<BE>(NEW_VERSION).unwrap();
    s.write_u16::<BE>(gflags).unwrap();
    s.flush().unwrap();
}

pub fn read_client_flags<S: Read + Write>(s: &mut S) -> u32 {
    s.read_u32::<BE>().unwrap()
}

/// Read one option request; returns `(option, payload)`.
pub fn read_option<S: Read + Write>(s: &mut S) -> (u32, Vec<u8>) {
    let magic = s.read_u64::<BE>().unwrap();
    assert_eq!(magic, NEW_VERSION, "bad option magic from client");
    let option = s.read_u32::<BE>().unwrap();
    let len = s.read_u32::<BE>().unwrap();
    let mut payload = vec![0u8; len as usize];
    s.read_exact(&mut payload).unwrap();
    (option, payload)
}

pub fn send_opt_reply<S: Read + Write>(s: &mut S, option: u32, reply: u32, payload: &[u8]) {
    s.write_u64::<BE>(REP_MAGIC).unwrap();
    s.write_u32::<BE>(option).unwrap();
    s.write_u32::<BE>(reply).unwrap();
    s.write_u32::<BE>(payload.len() as u32).unwrap();
    s.write_all(payload).unwrap();
    s.flush().unwrap();
}

pub fn export_info_payload(size: u64, eflags: u16) -> Vec<u8> {
    let mut payload = vec![];
    payload.write_u16::<BE>(INFO_EXPORT).unwrap();
    payload.write_u64::<BE>(size).unwrap();
    payload.write_u16::<BE>(eflags).unwrap();
    payload
}

pub fn meta_context_reply_payload(id: u32, name: &str) -> Vec<u8> {
    let mut payload = vec![];
    payload.write_u32::<BE>(id).unwrap();
    payload.extend_from_slice(name.as_bytes());
    payload
}

/// Play the server side of a fixed-newstyle handshake until the client
/// commits with `GO` (or the `EXPORT_NAME` fallback).
pub fn negotiate<S: Read + Write>(s: &mut S, cfg: &ServerConfig) {
    send_newstyle_greeting(s, 0b11);
    let cflags = read_client_flags(s);
    assert_eq!(cflags & 0b01, 0b01, "client must be fixed newstyle");

    loop {
        let (option, _payload) = read_option(s);
        match option {
            OPT_STRUCTURED_REPLY => {
                if cfg.sr {
                    send_opt_reply(s, option, REP_ACK, &[]);
                } else {
                    send_opt_reply(s, option, REP_ERR_UNSUP, &[]);
                }
            }
            OPT_SET_META_CONTEXT => {
                for (id, name) in &cfg.meta {
                    send_opt_reply(
                        s,
                        option,
                        REP_META_CONTEXT,
                        &meta_context_reply_payload(*id, name),
                    );
                }
                send_opt_reply(s, option, REP_ACK, &[]);
            }
            OPT_GO => {
                if cfg.go_unsup {
                    send_opt_reply(s, option, REP_ERR_UNSUP, &[]);
                    continue;
                }
                send_opt_reply(s, option, REP_INFO, &export_info_payload(cfg.size, cfg.eflags));
                send_opt_reply(s, option, REP_ACK, &[]);
                return;
            }
            OPT_EXPORT_NAME => {
                // NO_ZEROES was negotiated above, so no 124-byte padding.
                s.write_u64::<BE>(cfg.size).unwrap();
                s.write_u16::<BE>(cfg.eflags).unwrap();
                s.flush().unwrap();
                return;
            }
            OPT_STARTTLS => {
                send_opt_reply(s, option, REP_ERR_POLICY, &[]);
            }
            OPT_ABORT => {
                send_opt_reply(s, option, REP_ACK, &[]);
                return;
            }
            _ => {
                send_opt_reply(s, option, REP_ERR_UNSUP, &[]);
            }
        }
    }
}

/// One transmission-phase request as read off the wire.
#[derive(Debug)]
pub struct Request {
    pub flags: u16,
    pub typ: u16,
    pub cookie: u64,
    pub offset: u64,
    pub count: u32,
    pub data: Vec<u8>,
}

pub fn read_request<S: Read + Write>(s: &mut S) -> Request {
    let magic = s.read_u32::<BE>().unwrap();
    assert_eq!(magic, REQUEST_MAGIC, "bad request magic from client");
    let flags = s.read_u16::<BE>().unwrap();
    let typ = s.read_u16::<BE>().unwrap();
    let cookie = s.read_u64::<BE>().unwrap();
    let offset = s.read_u64::<BE>().unwrap();
    let count = s.read_u32::<BE>().unwrap();
    let mut data = vec![];
    if typ == CMD_WRITE {
        data.resize(count as usize, 0);
        s.read_exact(&mut data).unwrap();
    }
    Request {
        flags,
        typ,
        cookie,
        offset,
        count,
        data,
    }
}

pub fn send_simple_reply<S: Read + Write>(s: &mut S, cookie: u64, error: u32, data: &[u8]) {
    s.write_u32::<BE>(SIMPLE_REPLY_MAGIC).unwrap();
    s.write_u32::<BE>(error).unwrap();
    s.write_u64::<BE>(cookie).unwrap();
    s.write_all(data).unwrap();
    s.flush().unwrap();
}

pub fn send_chunk<S: Read + Write>(s: &mut S, flags: u16, typ: u16, cookie: u64, payload: &[u8]) {
    s.write_u32::<BE>(STRUCTURED_REPLY_MAGIC).unwrap();
    s.write_u16::<BE>(flags).unwrap();
    s.write_u16::<BE>(typ).unwrap();
    s.write_u64::<BE>(cookie).unwrap();
    s.write_u32::<BE>(payload.len() as u32).unwrap();
    s.write_all(payload).unwrap();
    s.flush().unwrap();
}

pub fn offset_data_payload(offset: u64, data: &[u8]) -> Vec<u8> {
    let mut payload = vec![];
    payload.write_u64::<BE>(offset).unwrap();
    payload.extend_from_slice(data);
    payload
}

pub fn offset_hole_payload(offset: u64, length: u32) -> Vec<u8> {
    let mut payload = vec![];
    payload.write_u64::<BE>(offset).unwrap();
    payload.write_u32::<BE>(length).unwrap();
    payload
}

pub fn block_status_payload(context_id: u32, extents: &[(u32, u32)]) -> Vec<u8> {
    let mut payload = vec![];
    payload.write_u32::<BE>(context_id).unwrap();
    for (length, flags) in extents {
        payload.write_u32::<BE>(*length).unwrap();
        payload.write_u32::<BE>(*flags).unwrap();
    }
    payload
}

pub fn error_chunk_payload(error: u32, msg: &str, offset: Option<u64>) -> Vec<u8> {
    let mut payload = vec![];
    payload.write_u32::<BE>(error).unwrap();
    payload.write_u16::<BE>(msg.len() as u16).unwrap();
    payload.extend_from_slice(msg.as_bytes());
    if let Some(offset) = offset {
        payload.write_u64::<BE>(offset).unwrap();
    }
    payload
}
