//! NBD protocol constants and wire framing.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description. Everything on the wire is big-endian; strings are
//! length-prefixed, never NUL-terminated, and capped at [`MAX_STRING`] bytes.
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]

use std::error::Error;
use std::fmt;
use std::io::{self, prelude::*};

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use nix::errno::Errno;
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub(crate) const TCP_PORT: u16 = 10809;

pub(crate) const MAGIC: u64 = 0x4e42444d41474943; // b"NBDMAGIC"
pub(crate) const OLD_VERSION: u64 = 0x00420281861253;
pub(crate) const NEW_VERSION: u64 = 0x49484156454F5054; // b"IHAVEOPT"
pub(crate) const REP_MAGIC: u64 = 0x3e889045565a9;

// transmission constants
pub(crate) const REQUEST_MAGIC: u32 = 0x25609513;
pub(crate) const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
pub(crate) const STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

/// Longest string the protocol permits (export names, meta context queries,
/// error messages).
pub const MAX_STRING: usize = 4096;

/// Largest data payload we are willing to send or receive in one command.
pub(crate) const MAX_REQUEST_SIZE: u32 = 64 * 1024 * 1024;

/// A violation of the NBD wire protocol by the peer.
#[derive(Debug, Clone)]
pub struct ProtocolError(pub(crate) String);

impl ProtocolError {
    pub(crate) fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "nbd protocol error: {}", self.0)?;
        Ok(())
    }
}

impl Error for ProtocolError {}

type Result<T> = std::result::Result<T, ProtocolError>;

bitflags! {
  /// Global flags sent by the server in the newstyle handshake.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct HandshakeFlags: u16 {
    const FIXED_NEWSTYLE = 0b01;
    const NO_ZEROES = 0b10;
  }

  /// Flags the client replies with after the newstyle greeting.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct ClientHandshakeFlags: u32 {
    const C_FIXED_NEWSTYLE = 0b01;
    const C_NO_ZEROES = 0b10;
  }

  /// Per-export transmission flags.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct TransmitFlags: u16 {
    const HAS_FLAGS = 1 << 0;
    const READ_ONLY = 1 << 1;
    const SEND_FLUSH = 1 << 2;
    const SEND_FUA = 1 << 3;
    const ROTATIONAL = 1 << 4;
    const SEND_TRIM = 1 << 5;
    const SEND_WRITE_ZEROES = 1 << 6;
    const SEND_DF = 1 << 7;
    const CAN_MULTI_CONN = 1 << 8;
    const SEND_RESIZE = 1 << 9;
    const SEND_CACHE = 1 << 10;
    const SEND_FAST_ZERO = 1 << 11;
  }

  /// Per-command flags.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct CmdFlags: u16 {
    const FUA = 1 << 0;
    const NO_HOLE = 1 << 1;
    // "don't fragment"
    const DF = 1 << 2;
    const REQ_ONE = 1 << 3;
    const FAST_ZERO = 1 << 4;
  }

  /// Structured reply flags.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct ReplyFlags: u16 {
    const DONE = 1 << 0;
  }
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum OptType {
    EXPORT_NAME = 1,
    ABORT = 2,
    LIST = 3,
    PEEK_EXPORT = 4,
    STARTTLS = 5,
    INFO = 6,
    GO = 7,
    STRUCTURED_REPLY = 8,
    LIST_META_CONTEXT = 9,
    SET_META_CONTEXT = 10,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum ReplyType {
    ACK = 1,
    SERVER = 2,
    INFO = 3,
    META_CONTEXT = 4,
    ERR_UNSUP = (1 << 31) + 1,
    ERR_POLICY = (1 << 31) + 2,
    ERR_INVALID = (1 << 31) + 3,
    ERR_PLATFORM = (1 << 31) + 4,
    ERR_TLS_REQD = (1 << 31) + 5,
    ERR_UNKNOWN = (1 << 31) + 6,
    ERR_SHUTDOWN = (1 << 31) + 7,
    ERR_BLOCK_SIZE_REQD = (1 << 31) + 8,
    ERR_TOO_BIG = (1 << 31) + 9,
}

/// Option replies with bit 31 set are errors.
pub(crate) fn reply_is_err(reply: u32) -> bool {
    reply & (1 << 31) != 0
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum InfoType {
    EXPORT = 0,
    NAME = 1,
    DESCRIPTION = 2,
    BLOCK_SIZE = 3,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum Cmd {
    READ = 0,
    WRITE = 1,
    // NBD_CMD_DISC
    DISCONNECT = 2,
    FLUSH = 3,
    TRIM = 4,
    CACHE = 5,
    WRITE_ZEROES = 6,
    BLOCK_STATUS = 7,
}

impl Cmd {
    /// Short human name, used in error messages reporting a failed command.
    pub(crate) fn name(self) -> &'static str {
        match self {
            Cmd::READ => "read",
            Cmd::WRITE => "write",
            Cmd::DISCONNECT => "disconnect",
            Cmd::FLUSH => "flush",
            Cmd::TRIM => "trim",
            Cmd::CACHE => "cache",
            Cmd::WRITE_ZEROES => "write-zeroes",
            Cmd::BLOCK_STATUS => "block-status",
        }
    }
}

/// Structured reply chunk types.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum ChunkType {
    NONE = 0,
    OFFSET_DATA = 1,
    OFFSET_HOLE = 2,
    BLOCK_STATUS = 5,
    ERROR = (1 << 15) + 1,
    ERROR_OFFSET = (1 << 15) + 2,
}

pub(crate) fn chunk_type_is_err(typ: u16) -> bool {
    typ & (1 << 15) != 0
}

/// NBD error numbers carried in simple replies and error chunks.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum NbdError {
    OK = 0,
    EPERM = 1,
    EIO = 5,
    ENOMEM = 12,
    EINVAL = 22,
    ENOSPC = 28,
    EOVERFLOW = 75,
    ENOTSUP = 95,
    ESHUTDOWN = 108,
}

/// Map an NBD error number to a local errno. Unknown values from the server
/// fall back to `EINVAL`.
pub(crate) fn errno_of_nbd_error(error: u32) -> Option<Errno> {
    match NbdError::try_from(error) {
        Ok(NbdError::OK) => None,
        Ok(NbdError::EPERM) => Some(Errno::EPERM),
        Ok(NbdError::EIO) => Some(Errno::EIO),
        Ok(NbdError::ENOMEM) => Some(Errno::ENOMEM),
        Ok(NbdError::EINVAL) => Some(Errno::EINVAL),
        Ok(NbdError::ENOSPC) => Some(Errno::ENOSPC),
        Ok(NbdError::EOVERFLOW) => Some(Errno::EOVERFLOW),
        Ok(NbdError::ENOTSUP) => Some(Errno::ENOTSUP),
        Ok(NbdError::ESHUTDOWN) => Some(Errno::ESHUTDOWN),
        Err(_) => Some(Errno::EINVAL),
    }
}

/// Oldstyle server greeting, minus the leading 16 magic bytes.
///
/// S: 64 bits, size of the export in bytes (unsigned)
/// S: 16 bits, export flags
/// S: 124 bytes, zeroes (reserved)
#[derive(Debug, Clone, Copy)]
pub(crate) struct OldstyleHandshake {
    pub size: u64,
    pub flags: u16,
}

/// Total length of the oldstyle greeting including both magic words.
pub(crate) const OLDSTYLE_LENGTH: usize = 152;

impl OldstyleHandshake {
    pub fn get(buf: &[u8]) -> Result<Self> {
        let mut r = io::Cursor::new(buf);
        let size = r.read_u64::<BE>().map_err(truncated)?;
        let flags = r.read_u16::<BE>().map_err(truncated)?;
        // the remaining 124 reserved bytes are ignored
        Ok(OldstyleHandshake { size, flags })
    }
}

/// An option request sent by the client during newstyle negotiation.
///
/// C: 64 bits, 0x49484156454F5054 (ASCII 'IHAVEOPT')
/// C: 32 bits, option
/// C: 32 bits, length of option data (unsigned)
/// C: any data needed for the chosen option, of length as specified above.
#[derive(Debug, Clone)]
pub(crate) struct Opt {
    pub typ: OptType,
    pub data: Vec<u8>,
}

impl Opt {
    pub fn put<IO: Write>(&self, mut stream: IO) -> io::Result<()> {
        stream.write_u64::<BE>(NEW_VERSION)?;
        stream.write_u32::<BE>(self.typ.into())?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        Ok(())
    }

    /// Serialize into a fresh buffer for the state machine's write cursor.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.data.len());
        self.put(&mut buf).expect("writing to a Vec cannot fail");
        buf
    }
}

/// Append a length-prefixed string to an option payload.
pub(crate) fn put_string(name: &str, out: &mut Vec<u8>) {
    out.write_u32::<BE>(name.len() as u32).unwrap();
    out.extend_from_slice(name.as_bytes());
}

/// Payload of `GO` and `INFO`: length-prefixed export name plus a 16-bit
/// count of requested info types.
pub(crate) fn go_option_payload(export_name: &str, infos: &[InfoType]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + export_name.len() + 2 + 2 * infos.len());
    put_string(export_name, &mut data);
    data.write_u16::<BE>(infos.len() as u16).unwrap();
    for typ in infos {
        data.write_u16::<BE>(u16::from(*typ)).unwrap();
    }
    data
}

/// Payload of `SET_META_CONTEXT` and `LIST_META_CONTEXT`: length-prefixed
/// export name, 32-bit query count, then length-prefixed queries.
pub(crate) fn meta_context_payload(export_name: &str, queries: &[String]) -> Vec<u8> {
    let mut data = Vec::new();
    put_string(export_name, &mut data);
    data.write_u32::<BE>(queries.len() as u32).unwrap();
    for q in queries {
        put_string(q, &mut data);
    }
    data
}

/// Reply header to any option apart from `EXPORT_NAME`.
///
/// S: 64 bits, 0x3e889045565a9 (magic number for replies)
/// S: 32 bits, the option as sent by the client to which this is a reply
/// S: 32 bits, reply type
/// S: 32 bits, length of the reply
#[derive(Debug, Clone, Copy)]
pub(crate) struct OptReplyHeader {
    pub option: u32,
    pub reply: u32,
    pub len: u32,
}

/// Wire size of [`OptReplyHeader`].
pub(crate) const OPT_REPLY_LENGTH: usize = 20;

impl OptReplyHeader {
    pub fn get(buf: &[u8]) -> Result<Self> {
        let mut r = io::Cursor::new(buf);
        let magic = r.read_u64::<BE>().map_err(truncated)?;
        if magic != REP_MAGIC {
            return Err(ProtocolError(format!(
                "unexpected option reply magic {magic:#x}"
            )));
        }
        let option = r.read_u32::<BE>().map_err(truncated)?;
        let reply = r.read_u32::<BE>().map_err(truncated)?;
        let len = r.read_u32::<BE>().map_err(truncated)?;
        // the largest legal payload is a LIST reply: length word plus an
        // export name and a description
        if len as usize > 2 * MAX_STRING + 64 {
            return Err(ProtocolError(format!(
                "option reply length {len} is too large"
            )));
        }
        Ok(OptReplyHeader { option, reply, len })
    }

    /// Check that this reply is for `expected`; anything else means we lost
    /// option synchronization with the server.
    pub fn expect_option(&self, expected: OptType) -> Result<()> {
        if self.option != u32::from(expected) {
            return Err(ProtocolError(format!(
                "option reply for {} does not match current option {expected:?}",
                self.option
            )));
        }
        Ok(())
    }
}

/// Reply to `EXPORT_NAME`: export size and flags, optionally padded with
/// 124 reserved zero bytes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExportNameReply {
    pub size: u64,
    pub flags: u16,
}

impl ExportNameReply {
    pub fn get(buf: &[u8]) -> Result<Self> {
        let mut r = io::Cursor::new(buf);
        let size = r.read_u64::<BE>().map_err(truncated)?;
        let flags = r.read_u16::<BE>().map_err(truncated)?;
        Ok(ExportNameReply { size, flags })
    }
}

/// A transmission-phase request.
///
/// C: 32 bits, 0x25609513, magic (NBD_REQUEST_MAGIC)
/// C: 16 bits, command flags
/// C: 16 bits, type
/// C: 64 bits, cookie
/// C: 64 bits, offset (unsigned)
/// C: 32 bits, length (unsigned)
/// C: (length bytes of data if the request is of type NBD_CMD_WRITE)
#[derive(Debug, Clone, Copy)]
pub(crate) struct Request {
    pub flags: CmdFlags,
    pub typ: Cmd,
    pub cookie: u64,
    pub offset: u64,
    pub count: u32,
}

impl Request {
    pub fn put<IO: Write>(&self, mut stream: IO) -> io::Result<()> {
        stream.write_u32::<BE>(REQUEST_MAGIC)?;
        stream.write_u16::<BE>(self.flags.bits())?;
        stream.write_u16::<BE>(self.typ.into())?;
        stream.write_u64::<BE>(self.cookie)?;
        stream.write_u64::<BE>(self.offset)?;
        stream.write_u32::<BE>(self.count)?;
        Ok(())
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(28);
        self.put(&mut buf).expect("writing to a Vec cannot fail");
        buf
    }
}

/// A simple (non-structured) reply, after the 32-bit magic.
///
/// S: 32 bits, 0x67446698, magic (NBD_SIMPLE_REPLY_MAGIC)
/// S: 32 bits, error (MAY be zero)
/// S: 64 bits, cookie
/// S: (length bytes of data if the request is of type NBD_CMD_READ)
#[derive(Debug, Clone, Copy)]
pub(crate) struct SimpleReply {
    pub error: u32,
    pub cookie: u64,
}

/// Bytes following the magic word in a simple reply.
pub(crate) const SIMPLE_REPLY_LENGTH: usize = 12;

impl SimpleReply {
    pub fn get(buf: &[u8]) -> Result<Self> {
        let mut r = io::Cursor::new(buf);
        let error = r.read_u32::<BE>().map_err(truncated)?;
        let cookie = r.read_u64::<BE>().map_err(truncated)?;
        Ok(SimpleReply { error, cookie })
    }
}

/// A structured reply chunk header, after the 32-bit magic.
///
/// S: 32 bits, 0x668e33ef, magic (NBD_STRUCTURED_REPLY_MAGIC)
/// S: 16 bits, flags
/// S: 16 bits, type
/// S: 64 bits, cookie
/// S: 32 bits, length of payload (unsigned)
#[derive(Debug, Clone, Copy)]
pub(crate) struct StructuredReply {
    pub flags: ReplyFlags,
    pub typ: u16,
    pub cookie: u64,
    pub length: u32,
}

/// Bytes following the magic word in a structured reply header.
pub(crate) const STRUCTURED_REPLY_LENGTH: usize = 16;

impl StructuredReply {
    pub fn get(buf: &[u8]) -> Result<Self> {
        let mut r = io::Cursor::new(buf);
        let flags = r.read_u16::<BE>().map_err(truncated)?;
        let flags = ReplyFlags::from_bits(flags).ok_or_else(|| {
            ProtocolError(format!("unexpected structured reply flags {flags:#x}"))
        })?;
        let typ = r.read_u16::<BE>().map_err(truncated)?;
        let cookie = r.read_u64::<BE>().map_err(truncated)?;
        let length = r.read_u32::<BE>().map_err(truncated)?;
        Ok(StructuredReply {
            flags,
            typ,
            cookie,
            length,
        })
    }

    pub fn done(&self) -> bool {
        self.flags.contains(ReplyFlags::DONE)
    }
}

/// Read a length-prefixed string out of an option reply payload.
pub(crate) fn get_string<IO: Read>(mut stream: IO) -> Result<String> {
    let len = stream.read_u32::<BE>().map_err(truncated)?;
    if len as usize > MAX_STRING {
        return Err(ProtocolError(format!("string length {len} is too large")));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).map_err(truncated)?;
    String::from_utf8(buf).map_err(|_| ProtocolError::new("invalid UTF-8 in string from server"))
}

/// `REP_INFO` payload: a 16-bit info type followed by type-specific fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InfoPayload {
    Export { size: u64, flags: u16 },
    Name(String),
    Description(String),
    BlockSize { min: u32, preferred: u32, max: u32 },
    /// An info type we do not understand; ignored per the fixed-newstyle rules.
    Unknown(u16),
}

impl InfoPayload {
    pub fn get(buf: &[u8]) -> Result<Self> {
        let mut r = io::Cursor::new(buf);
        let typ = r.read_u16::<BE>().map_err(truncated)?;
        match InfoType::try_from(typ) {
            Ok(InfoType::EXPORT) => {
                let size = r.read_u64::<BE>().map_err(truncated)?;
                let flags = r.read_u16::<BE>().map_err(truncated)?;
                Ok(InfoPayload::Export { size, flags })
            }
            Ok(InfoType::NAME) => {
                // the rest of the payload is the name, not length-prefixed
                let name = remaining_string(&mut r)?;
                Ok(InfoPayload::Name(name))
            }
            Ok(InfoType::DESCRIPTION) => {
                let desc = remaining_string(&mut r)?;
                Ok(InfoPayload::Description(desc))
            }
            Ok(InfoType::BLOCK_SIZE) => {
                let min = r.read_u32::<BE>().map_err(truncated)?;
                let preferred = r.read_u32::<BE>().map_err(truncated)?;
                let max = r.read_u32::<BE>().map_err(truncated)?;
                Ok(InfoPayload::BlockSize {
                    min,
                    preferred,
                    max,
                })
            }
            Err(_) => Ok(InfoPayload::Unknown(typ)),
        }
    }
}

/// `REP_META_CONTEXT` payload: a 32-bit context id followed by the
/// (not length-prefixed) context name.
pub(crate) fn get_meta_context(buf: &[u8]) -> Result<(u32, String)> {
    let mut r = io::Cursor::new(buf);
    let id = r.read_u32::<BE>().map_err(truncated)?;
    let name = remaining_string(&mut r)?;
    Ok((id, name))
}

fn remaining_string(r: &mut io::Cursor<&[u8]>) -> Result<String> {
    let pos = r.position() as usize;
    let rest = &r.get_ref()[pos..];
    if rest.len() > MAX_STRING {
        return Err(ProtocolError(format!(
            "string length {} is too large",
            rest.len()
        )));
    }
    String::from_utf8(rest.to_vec())
        .map_err(|_| ProtocolError::new("invalid UTF-8 in string from server"))
}

fn truncated(_: io::Error) -> ProtocolError {
    ProtocolError::new("truncated frame from server")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_framing() {
        let req = Request {
            flags: CmdFlags::FUA,
            typ: Cmd::WRITE,
            cookie: 0xdead_beef_0042,
            offset: 4096,
            count: 512,
        };
        let wire = req.to_wire();
        assert_eq!(wire.len(), 28);
        assert_eq!(&wire[0..4], &0x25609513u32.to_be_bytes());
        assert_eq!(&wire[4..6], &1u16.to_be_bytes()); // FUA
        assert_eq!(&wire[6..8], &1u16.to_be_bytes()); // WRITE
        assert_eq!(&wire[8..16], &0xdead_beef_0042u64.to_be_bytes());
        assert_eq!(&wire[16..24], &4096u64.to_be_bytes());
        assert_eq!(&wire[24..28], &512u32.to_be_bytes());
    }

    #[test]
    fn option_framing() {
        let opt = Opt {
            typ: OptType::GO,
            data: go_option_payload("default", &[InfoType::BLOCK_SIZE]),
        };
        let wire = opt.to_wire();
        assert_eq!(&wire[0..8], &NEW_VERSION.to_be_bytes());
        assert_eq!(&wire[8..12], &7u32.to_be_bytes());
        // payload: namelen + "default" + nrinfos + one info type
        assert_eq!(&wire[12..16], &(4u32 + 7 + 2 + 2).to_be_bytes());
        assert_eq!(&wire[16..20], &7u32.to_be_bytes());
        assert_eq!(&wire[20..27], b"default");
        assert_eq!(&wire[27..29], &1u16.to_be_bytes());
        assert_eq!(&wire[29..31], &3u16.to_be_bytes());
    }

    #[test]
    fn opt_reply_header() {
        let mut buf = vec![];
        buf.write_u64::<BE>(REP_MAGIC).unwrap();
        buf.write_u32::<BE>(7).unwrap();
        buf.write_u32::<BE>(1).unwrap();
        buf.write_u32::<BE>(0).unwrap();
        let hdr = OptReplyHeader::get(&buf).unwrap();
        assert_eq!(hdr.option, 7);
        assert_eq!(hdr.reply, u32::from(ReplyType::ACK));
        assert_eq!(hdr.len, 0);
        hdr.expect_option(OptType::GO).unwrap();
        assert!(hdr.expect_option(OptType::INFO).is_err());

        buf[0] ^= 0xff;
        assert!(OptReplyHeader::get(&buf).is_err());
    }

    #[test]
    fn reply_error_bit() {
        assert!(!reply_is_err(u32::from(ReplyType::ACK)));
        assert!(reply_is_err(u32::from(ReplyType::ERR_UNSUP)));
        assert!(reply_is_err(u32::from(ReplyType::ERR_POLICY)));
    }

    #[test]
    fn structured_reply_header() {
        let mut buf = vec![];
        buf.write_u16::<BE>(1).unwrap(); // DONE
        buf.write_u16::<BE>(ChunkType::OFFSET_DATA.into()).unwrap();
        buf.write_u64::<BE>(99).unwrap();
        buf.write_u32::<BE>(2056).unwrap();
        let hdr = StructuredReply::get(&buf).unwrap();
        assert!(hdr.done());
        assert_eq!(hdr.typ, u16::from(ChunkType::OFFSET_DATA));
        assert_eq!(hdr.cookie, 99);
        assert_eq!(hdr.length, 2056);
    }

    #[test]
    fn info_payloads() {
        let mut buf = vec![];
        buf.write_u16::<BE>(InfoType::EXPORT.into()).unwrap();
        buf.write_u64::<BE>(1 << 20).unwrap();
        buf.write_u16::<BE>(0x0001).unwrap();
        assert_eq!(
            InfoPayload::get(&buf).unwrap(),
            InfoPayload::Export {
                size: 1 << 20,
                flags: 0x0001
            }
        );

        let mut buf = vec![];
        buf.write_u16::<BE>(InfoType::NAME.into()).unwrap();
        buf.extend_from_slice(b"disk0");
        assert_eq!(
            InfoPayload::get(&buf).unwrap(),
            InfoPayload::Name("disk0".into())
        );

        let mut buf = vec![];
        buf.write_u16::<BE>(InfoType::BLOCK_SIZE.into()).unwrap();
        buf.write_u32::<BE>(512).unwrap();
        buf.write_u32::<BE>(4096).unwrap();
        buf.write_u32::<BE>(1 << 25).unwrap();
        assert_eq!(
            InfoPayload::get(&buf).unwrap(),
            InfoPayload::BlockSize {
                min: 512,
                preferred: 4096,
                max: 1 << 25
            }
        );

        // unknown info types must parse (and get ignored by the caller)
        let mut buf = vec![];
        buf.write_u16::<BE>(0x7777).unwrap();
        assert_eq!(
            InfoPayload::get(&buf).unwrap(),
            InfoPayload::Unknown(0x7777)
        );
    }

    #[test]
    fn meta_context_payload_roundtrip() {
        let payload = meta_context_payload("exp", &["base:allocation".to_string()]);
        let mut r = io::Cursor::new(&payload[..]);
        assert_eq!(get_string(&mut r).unwrap(), "exp");
        assert_eq!(r.read_u32::<BE>().unwrap(), 1);
        assert_eq!(get_string(&mut r).unwrap(), "base:allocation");
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(errno_of_nbd_error(0), None);
        assert_eq!(errno_of_nbd_error(1), Some(Errno::EPERM));
        assert_eq!(errno_of_nbd_error(5), Some(Errno::EIO));
        assert_eq!(errno_of_nbd_error(108), Some(Errno::ESHUTDOWN));
        // unknown values fall back to EINVAL
        assert_eq!(errno_of_nbd_error(9999), Some(Errno::EINVAL));
    }

    #[test]
    fn oldstyle_parse() {
        let mut buf = vec![];
        buf.write_u64::<BE>(1048576).unwrap();
        buf.write_u16::<BE>(0x0003).unwrap();
        buf.extend_from_slice(&[0u8; 124]);
        let hs = OldstyleHandshake::get(&buf).unwrap();
        assert_eq!(hs.size, 1048576);
        assert_eq!(hs.flags, 0x0003);
    }
}
