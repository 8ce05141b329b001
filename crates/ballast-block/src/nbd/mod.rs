//! NBD (Network Block Device) fixed-newstyle protocol codec
//!
//! Pure functions and frame types over byte buffers, as specified in:
//! https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! All multi-byte integers are big-endian.

mod connection;

pub use connection::{Session, SessionContext, SessionState};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{BlockError, BlockResult, NbdErrno};

/// "NBDMAGIC" handshake preface
pub const NBD_INIT_MAGIC: u64 = 0x4e42444d41474943;
/// "IHAVEOPT" option preface
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054;
/// Option reply magic
pub const NBD_REP_MAGIC: u64 = 0x0003e889045565a9;
/// Command request magic
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
/// Simple reply magic
pub const NBD_REPLY_MAGIC: u32 = 0x67446698;

/// Upper bound on option payload length
pub const MAX_OPTION_LEN: u32 = 64 * 1024;
/// Upper bound on READ/WRITE payload length
pub const MAX_IO_LEN: u32 = 32 * 1024 * 1024;

/// Handshake flags sent by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeFlags(u16);

impl HandshakeFlags {
    /// Fixed newstyle negotiation
    pub const FIXED_NEWSTYLE: u16 = 1 << 0;

    /// Flags advertised by this server
    pub fn server_default() -> Self {
        Self(Self::FIXED_NEWSTYLE)
    }

    /// Raw value
    pub fn bits(&self) -> u16 {
        self.0
    }
}

/// Client flags received after the handshake preface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientFlags(u32);

impl ClientFlags {
    /// Fixed newstyle
    pub const FIXED_NEWSTYLE: u32 = 1 << 0;

    /// Create from raw value
    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    /// Raw value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Client understands fixed newstyle; required to proceed
    pub fn has_fixed_newstyle(&self) -> bool {
        self.0 & Self::FIXED_NEWSTYLE != 0
    }
}

/// Per-export transmission flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmissionFlags(u16);

impl TransmissionFlags {
    /// Has flags (always set)
    pub const HAS_FLAGS: u16 = 1 << 0;
    /// Read-only export
    pub const READ_ONLY: u16 = 1 << 1;
    /// Client may send FLUSH
    pub const SEND_FLUSH: u16 = 1 << 2;
    /// Client may set FUA on writes
    pub const SEND_FUA: u16 = 1 << 3;

    /// Create from raw value
    pub fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Raw value
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Flags advertised for every export: writable, flush supported.
    /// FUA is deliberately not advertised.
    pub fn export_default() -> Self {
        Self(Self::HAS_FLAGS | Self::SEND_FLUSH)
    }
}

/// Option codes consumed during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdOption {
    /// Abort negotiation
    Abort = 2,
    /// Go (finish negotiation with an export name)
    Go = 7,
}

impl TryFrom<u32> for NbdOption {
    type Error = BlockError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::Abort),
            7 => Ok(Self::Go),
            _ => Err(BlockError::Protocol(format!("unknown option: {value}"))),
        }
    }
}

/// Option reply types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdReplyType {
    /// Acknowledge
    Ack = 1,
    /// Export info
    Info = 3,
    /// Error: option not supported
    ErrUnsup = (1 << 31) | 1,
    /// Error: forbidden by policy (export is leased elsewhere)
    ErrPolicy = (1 << 31) | 2,
    /// Error: unknown export
    ErrUnknown = (1 << 31) | 6,
}

/// Command types consumed in the transmission phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NbdCommand {
    /// Read
    Read = 0,
    /// Write
    Write = 1,
    /// Disconnect
    Disc = 2,
    /// Flush
    Flush = 3,
}

impl TryFrom<u16> for NbdCommand {
    type Error = BlockError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::Disc),
            3 => Ok(Self::Flush),
            _ => Err(BlockError::UnsupportedCommand(value)),
        }
    }
}

/// Encode the server handshake preface (18 bytes).
pub fn handshake_greeting() -> Bytes {
    let mut buf = BytesMut::with_capacity(18);
    buf.put_u64(NBD_INIT_MAGIC);
    buf.put_u64(NBD_OPTS_MAGIC);
    buf.put_u16(HandshakeFlags::server_default().bits());
    buf.freeze()
}

/// Header of one client option request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionHeader {
    /// Option code
    pub option: u32,
    /// Length of the option payload that follows
    pub length: u32,
}

impl OptionHeader {
    /// Option header size on the wire
    pub const SIZE: usize = 16;

    /// Parse an option header, checking the IHAVEOPT magic and payload bound.
    pub fn parse(data: &[u8]) -> BlockResult<Self> {
        if data.len() < Self::SIZE {
            return Err(BlockError::Protocol("option header too short".to_string()));
        }

        let mut buf = data;
        let magic = buf.get_u64();
        if magic != NBD_OPTS_MAGIC {
            return Err(BlockError::Protocol(format!(
                "invalid option magic: {magic:016x}"
            )));
        }

        let option = buf.get_u32();
        let length = buf.get_u32();
        if length > MAX_OPTION_LEN {
            return Err(BlockError::Protocol(format!(
                "option payload too large: {length} bytes"
            )));
        }

        Ok(Self { option, length })
    }
}

/// Decode the NBD_OPT_GO payload: `{u32 name_length, name, u16 n_info,
/// info[n_info]}`. Only the export name is consumed; information requests
/// are acknowledged implicitly.
pub fn parse_go_payload(data: &[u8]) -> BlockResult<String> {
    if data.len() < 4 {
        return Err(BlockError::Protocol("GO payload too short".to_string()));
    }

    let mut buf = data;
    let name_len = buf.get_u32() as usize;
    if buf.remaining() < name_len {
        return Err(BlockError::Protocol(format!(
            "GO payload truncated: name length {name_len}, {} bytes left",
            buf.remaining()
        )));
    }

    let name = String::from_utf8(buf[..name_len].to_vec())
        .map_err(|_| BlockError::Protocol("export name is not valid UTF-8".to_string()))?;
    Ok(name)
}

/// Encode an option reply: header plus payload.
pub fn encode_option_reply(option: u32, reply: NbdReplyType, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(20 + data.len());
    buf.put_u64(NBD_REP_MAGIC);
    buf.put_u32(option);
    buf.put_u32(reply as u32);
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    buf.freeze()
}

/// Encode the NBD_INFO_EXPORT payload carried in a REP_INFO reply.
pub fn export_info_payload(size: u64, flags: TransmissionFlags) -> Bytes {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u16(0); // NBD_INFO_EXPORT
    buf.put_u64(size);
    buf.put_u16(flags.bits());
    buf.freeze()
}

/// One transmission-phase command request
#[derive(Debug, Clone, Copy)]
pub struct NbdRequest {
    /// Command flags (unused: FUA is not advertised)
    pub flags: u16,
    /// Raw command type
    pub kind: u16,
    /// Cookie echoed in the reply
    pub handle: u64,
    /// Byte offset
    pub offset: u64,
    /// Payload length
    pub length: u32,
}

impl NbdRequest {
    /// Request size on the wire (always 28 bytes)
    pub const SIZE: usize = 28;

    /// Parse a command request header.
    pub fn parse(data: &[u8]) -> BlockResult<Self> {
        if data.len() < Self::SIZE {
            return Err(BlockError::Protocol("request too short".to_string()));
        }

        let mut buf = data;
        let magic = buf.get_u32();
        if magic != NBD_REQUEST_MAGIC {
            return Err(BlockError::Protocol(format!(
                "invalid request magic: {magic:08x}"
            )));
        }

        Ok(Self {
            flags: buf.get_u16(),
            kind: buf.get_u16(),
            handle: buf.get_u64(),
            offset: buf.get_u64(),
            length: buf.get_u32(),
        })
    }

    /// Decode the command type; unknown types answer with EINVAL.
    pub fn command(&self) -> BlockResult<NbdCommand> {
        NbdCommand::try_from(self.kind)
    }
}

/// Encode a simple reply (16 bytes). READ payloads follow separately.
pub fn encode_simple_reply(errno: NbdErrno, handle: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u32(NBD_REPLY_MAGIC);
    buf.put_u32(errno.code());
    buf.put_u64(handle);
    buf.freeze()
}
