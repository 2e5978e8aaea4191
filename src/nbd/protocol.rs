//! NBD protocol framing
//!
//! Constants and frame codecs for the fixed-newstyle handshake, option
//! negotiation and transmission phases. Based on the NBD protocol
//! specification:
//! https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Initial greeting magic.
pub const NBD_INIT_MAGIC: &[u8; 8] = b"NBDMAGIC";
/// Newstyle option magic ("IHAVEOPT").
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054;
/// Option reply magic.
pub const NBD_REP_MAGIC: u64 = 0x3e889045565a9;
/// Transmission request magic.
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
/// Transmission reply magic.
pub const NBD_RESPONSE_MAGIC: u32 = 0x67446698;

/// NBD options
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;

/// NBD option replies
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_ERR_UNSUP: u32 = (1u32 << 31) | 1;

/// Handshake flags: fixed newstyle only.
pub const NBD_HANDSHAKE_FLAGS: u16 = 1 << 0;
/// Client flag acknowledging fixed newstyle.
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;

/// NBD transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;

/// Flags advertised for every export: has flags, supports flush.
pub const NBD_EXPORT_FLAGS: u16 = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH;

/// NBD commands
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbdCommand {
    Read = 0,
    Write = 1,
    Disc = 2,
    Flush = 3,
}

impl NbdCommand {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(NbdCommand::Read),
            1 => Some(NbdCommand::Write),
            2 => Some(NbdCommand::Disc),
            3 => Some(NbdCommand::Flush),
            _ => None,
        }
    }
}

/// Transmission request frame (28 bytes).
#[derive(Debug)]
pub struct NbdRequest {
    pub command: u32,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl NbdRequest {
    /// Read a request frame; fails on bad magic.
    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let magic = reader.read_u32::<BigEndian>()?;
        if magic != NBD_REQUEST_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid request magic: 0x{:08x}", magic),
            ));
        }

        let command = reader.read_u32::<BigEndian>()?;
        let handle = reader.read_u64::<BigEndian>()?;
        let offset = reader.read_u64::<BigEndian>()?;
        let length = reader.read_u32::<BigEndian>()?;

        Ok(Self {
            command,
            handle,
            offset,
            length,
        })
    }

    pub fn command_type(&self) -> Option<NbdCommand> {
        NbdCommand::from_u32(self.command)
    }
}

/// Simple reply header (16 bytes), optionally followed by payload.
pub struct NbdReply {
    pub error: u32,
    pub handle: u64,
}

impl NbdReply {
    pub fn new(handle: u64, error: u32) -> Self {
        Self { error, handle }
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<BigEndian>(NBD_RESPONSE_MAGIC)?;
        writer.write_u32::<BigEndian>(self.error)?;
        writer.write_u64::<BigEndian>(self.handle)?;
        Ok(())
    }
}

/// Option frame as sent by the client (16-byte header plus data).
#[derive(Debug)]
pub struct NbdOption {
    pub opt: u32,
    pub data: Vec<u8>,
}

impl NbdOption {
    /// Read an option frame and its payload; fails on bad magic.
    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let magic = reader.read_u64::<BigEndian>()?;
        if magic != NBD_OPTS_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid option magic: 0x{:016x}", magic),
            ));
        }

        let opt = reader.read_u32::<BigEndian>()?;
        let length = reader.read_u32::<BigEndian>()?;
        let mut data = vec![0u8; length as usize];
        if length > 0 {
            reader.read_exact(&mut data)?;
        }

        Ok(Self { opt, data })
    }
}

/// Send the initial greeting.
pub fn write_greeting<W: Write>(writer: &mut W) -> io::Result<()> {
    writer.write_all(NBD_INIT_MAGIC)?;
    writer.write_u64::<BigEndian>(NBD_OPTS_MAGIC)?;
    writer.write_u16::<BigEndian>(NBD_HANDSHAKE_FLAGS)?;
    writer.flush()
}

/// Write one option reply frame.
pub fn write_option_reply<W: Write>(
    writer: &mut W,
    opt: u32,
    reply: u32,
    data: &[u8],
) -> io::Result<()> {
    writer.write_u64::<BigEndian>(NBD_REP_MAGIC)?;
    writer.write_u32::<BigEndian>(opt)?;
    writer.write_u32::<BigEndian>(reply)?;
    writer.write_u32::<BigEndian>(data.len() as u32)?;
    if !data.is_empty() {
        writer.write_all(data)?;
    }
    writer.flush()
}

/// Send the export details that conclude EXPORT_NAME negotiation.
pub fn write_export_details<W: Write>(writer: &mut W, size: u64, flags: u16) -> io::Result<()> {
    writer.write_u64::<BigEndian>(size)?;
    writer.write_u16::<BigEndian>(flags)?;
    writer.write_all(&[0u8; 124])?;
    writer.flush()
}
