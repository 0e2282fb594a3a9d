// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! wchswio-bin - wchswio's binary API shared server/client constants and
//! types
//!
//! The binary API lets a host drive a CH32V target through a `wchswio`
//! probe over any byte stream: TCP, USB CDC or a UART.
//!
//! A session starts with the server sending a single [`VERSION`] byte, which
//! the client echoes back.  The client then sends commands, each a
//! [`Command`] byte followed by fixed arguments and, for [`Op::WriteFlash`],
//! the data.  The server replies to each with a [`ResponseCode`] byte,
//! followed by any response data for a successful command.  All multi-byte
//! values are little-endian.
//!
//! | Command | Arguments | Response data |
//! |---------|-----------|---------------|
//! | DmRead | addr: u8 | u32 |
//! | DmWrite | addr: u8, data: u32 | - |
//! | MemRead | addr: u32 | u32 |
//! | MemWrite | addr: u32, data: u32 | - |
//! | GprRead | reg: u8 | u32 |
//! | GprWrite | reg: u8, data: u32 | - |
//! | BlockRead | addr: u32, count: u16 | count: u16, count * u32 |
//! | ChipInfo | - | flash KB: u16, uid: 3 * u32 |
//! | Reset | kind: u8 | - |
//! | Halt, Resume | - | - |
//! | IsHalted | - | u8 |
//! | Unlock, Lock, WipeChip | - | - |
//! | WipePage, WipeSector | addr: u32 | - |
//! | WriteFlash | addr: u32, count: u16, count * u32 | - |
//! | Ping | - | - |
//! | Disconnect | - | - |
//!
//! A failed operation is reported with an error response and the session
//! continues.  A malformed command gets an error response and closes the
//! session.
//!
//! This crate is `no_std` and platform agnostic.  It is used by `wchswio` to
//! implement the binary API server, and can be used by clients to send
//! commands.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use embedded_io::{Read, ReadExactError, Write};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

// Binary API version
pub const VERSION: u8 = 0x01;

/// Maximum number of words supported on a block read or flash write
pub const MAX_WORD_COUNT: u16 = 1024;

/// Binary API command types
pub const CMD_DM_READ: u8 = 0x00;
pub const CMD_DM_WRITE: u8 = 0x01;
pub const CMD_MEM_READ: u8 = 0x02;
pub const CMD_MEM_WRITE: u8 = 0x03;
pub const CMD_GPR_READ: u8 = 0x04;
pub const CMD_GPR_WRITE: u8 = 0x05;
pub const CMD_BLOCK_READ: u8 = 0x12;
pub const CMD_CHIP_INFO: u8 = 0x20;
pub const CMD_RESET: u8 = 0x21;
pub const CMD_HALT: u8 = 0x22;
pub const CMD_RESUME: u8 = 0x23;
pub const CMD_IS_HALTED: u8 = 0x24;
pub const CMD_UNLOCK: u8 = 0x30;
pub const CMD_LOCK: u8 = 0x31;
pub const CMD_WIPE_PAGE: u8 = 0x32;
pub const CMD_WIPE_SECTOR: u8 = 0x33;
pub const CMD_WIPE_CHIP: u8 = 0x34;
pub const CMD_WRITE_FLASH: u8 = 0x35;
pub const CMD_PING: u8 = 0xF0;
pub const CMD_DISCONNECT: u8 = 0xFF;

/// Binary API response codes
pub const RSP_OK: u8 = 0x00;
pub const RSP_ERR_CMD: u8 = 0x81;
pub const RSP_ERR_SWIO: u8 = 0x82;
pub const RSP_ERR_TIMEOUT: u8 = 0x83;
pub const RSP_ERR_API: u8 = 0x85;
pub const RSP_ERR_PROGRAM: u8 = 0x86;

/// Binary API single byte command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    DmRead = CMD_DM_READ,
    DmWrite = CMD_DM_WRITE,
    MemRead = CMD_MEM_READ,
    MemWrite = CMD_MEM_WRITE,
    GprRead = CMD_GPR_READ,
    GprWrite = CMD_GPR_WRITE,
    BlockRead = CMD_BLOCK_READ,
    ChipInfo = CMD_CHIP_INFO,
    Reset = CMD_RESET,
    Halt = CMD_HALT,
    Resume = CMD_RESUME,
    IsHalted = CMD_IS_HALTED,
    Unlock = CMD_UNLOCK,
    Lock = CMD_LOCK,
    WipePage = CMD_WIPE_PAGE,
    WipeSector = CMD_WIPE_SECTOR,
    WipeChip = CMD_WIPE_CHIP,
    WriteFlash = CMD_WRITE_FLASH,
    Ping = CMD_PING,
    Disconnect = CMD_DISCONNECT,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::DmRead => write!(f, "DM Read"),
            Command::DmWrite => write!(f, "DM Write"),
            Command::MemRead => write!(f, "Memory Read"),
            Command::MemWrite => write!(f, "Memory Write"),
            Command::GprRead => write!(f, "GPR Read"),
            Command::GprWrite => write!(f, "GPR Write"),
            Command::BlockRead => write!(f, "Block Read"),
            Command::ChipInfo => write!(f, "Chip Info"),
            Command::Reset => write!(f, "Reset"),
            Command::Halt => write!(f, "Halt"),
            Command::Resume => write!(f, "Resume"),
            Command::IsHalted => write!(f, "Is Halted"),
            Command::Unlock => write!(f, "Flash Unlock"),
            Command::Lock => write!(f, "Flash Lock"),
            Command::WipePage => write!(f, "Wipe Page"),
            Command::WipeSector => write!(f, "Wipe Sector"),
            Command::WipeChip => write!(f, "Wipe Chip"),
            Command::WriteFlash => write!(f, "Write Flash"),
            Command::Ping => write!(f, "Ping"),
            Command::Disconnect => write!(f, "Disconnect"),
        }
    }
}

impl Command {
    /// Converts a Command to its byte representation
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Convert a command byte to a `Command` enum variant
    ///
    /// Arguments:
    /// - `cmd`: The command byte to convert.
    ///
    /// Returns:
    /// - `Ok(Command)`: If the command byte is recognized.
    /// - `Err(ProtocolError::Command)`: If the command byte is not
    ///   recognized.
    pub fn from_byte(cmd: u8) -> Result<Self, ProtocolError> {
        match cmd {
            CMD_DM_READ => Ok(Self::DmRead),
            CMD_DM_WRITE => Ok(Self::DmWrite),
            CMD_MEM_READ => Ok(Self::MemRead),
            CMD_MEM_WRITE => Ok(Self::MemWrite),
            CMD_GPR_READ => Ok(Self::GprRead),
            CMD_GPR_WRITE => Ok(Self::GprWrite),
            CMD_BLOCK_READ => Ok(Self::BlockRead),
            CMD_CHIP_INFO => Ok(Self::ChipInfo),
            CMD_RESET => Ok(Self::Reset),
            CMD_HALT => Ok(Self::Halt),
            CMD_RESUME => Ok(Self::Resume),
            CMD_IS_HALTED => Ok(Self::IsHalted),
            CMD_UNLOCK => Ok(Self::Unlock),
            CMD_LOCK => Ok(Self::Lock),
            CMD_WIPE_PAGE => Ok(Self::WipePage),
            CMD_WIPE_SECTOR => Ok(Self::WipeSector),
            CMD_WIPE_CHIP => Ok(Self::WipeChip),
            CMD_WRITE_FLASH => Ok(Self::WriteFlash),
            CMD_PING => Ok(Self::Ping),
            CMD_DISCONNECT => Ok(Self::Disconnect),
            _ => Err(ProtocolError::Command(cmd)),
        }
    }

    /// Number of fixed argument bytes following the command byte
    pub fn remaining_bytes(&self) -> usize {
        match self {
            Self::DmRead => 1,                     // addr
            Self::DmWrite => 5,                    // addr + data
            Self::MemRead => 4,                    // addr
            Self::MemWrite => 8,                   // addr + data
            Self::GprRead => 1,                    // reg
            Self::GprWrite => 5,                   // reg + data
            Self::BlockRead => 6,                  // addr + 2 byte count
            Self::Reset => 1,                      // kind
            Self::WipePage | Self::WipeSector => 4, // addr
            Self::WriteFlash => 6,                 // addr + 2 byte count (+ N * 4 bytes)
            Self::ChipInfo
            | Self::Halt
            | Self::Resume
            | Self::IsHalted
            | Self::Unlock
            | Self::Lock
            | Self::WipeChip
            | Self::Ping
            | Self::Disconnect => 0,
        }
    }

    /// Determines how many variable bytes follow the fixed arguments
    ///
    /// Arguments:
    /// - `count`: The word count from the fixed arguments.
    ///
    /// Returns:
    /// - `Ok(usize)`: The number of bytes to read for the command.
    /// - `Err(ProtocolError::Arg)`: If the count is too large.
    pub fn var_bytes(&self, count: u16) -> Result<usize, ProtocolError> {
        match self {
            Self::WriteFlash => Self::check_count(count).map(|count| count * 4),
            _ => Ok(0),
        }
    }

    fn check_count(count: u16) -> Result<usize, ProtocolError> {
        if count == 0 || count > MAX_WORD_COUNT {
            debug!("Invalid word count: {count}");
            Err(ProtocolError::Arg)
        } else {
            Ok(count as usize)
        }
    }
}

/// Binary API single byte response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = RSP_OK,
    /// The command byte was not recognised
    Cmd = RSP_ERR_CMD,
    /// SWIO link or target failure
    Swio = RSP_ERR_SWIO,
    Timeout = RSP_ERR_TIMEOUT,
    /// The command's arguments were invalid
    Api = RSP_ERR_API,
    /// An abstract command or program failed on the target
    Program = RSP_ERR_PROGRAM,
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseCode::Ok => write!(f, "OK"),
            ResponseCode::Cmd => write!(f, "Command Error"),
            ResponseCode::Swio => write!(f, "SWIO Error"),
            ResponseCode::Timeout => write!(f, "Timeout Error"),
            ResponseCode::Api => write!(f, "API Error"),
            ResponseCode::Program => write!(f, "Program Error"),
        }
    }
}

impl ResponseCode {
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            RSP_OK => Ok(Self::Ok),
            RSP_ERR_CMD => Ok(Self::Cmd),
            RSP_ERR_SWIO => Ok(Self::Swio),
            RSP_ERR_TIMEOUT => Ok(Self::Timeout),
            RSP_ERR_API => Ok(Self::Api),
            RSP_ERR_PROGRAM => Ok(Self::Program),
            _ => Err(ProtocolError::Response(byte)),
        }
    }
}

/// Target reset type, as sent with [`Command::Reset`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResetKind {
    /// Reset and halt at the reset vector
    #[default]
    ToHalt = 0,

    /// Reset and run, checking the reset was observed
    ToRun = 1,

    /// Reset and run without checking
    ToRunNoCheck = 2,
}

impl ResetKind {
    /// Convert from a byte value to a ResetKind
    ///
    /// Returns:
    /// - `Ok(ResetKind)`: If the byte value is valid.
    /// - `Err(ProtocolError::Arg)`: If it is not.
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0 => Ok(ResetKind::ToHalt),
            1 => Ok(ResetKind::ToRun),
            2 => Ok(ResetKind::ToRunNoCheck),
            _ => {
                debug!("Invalid reset kind byte: {byte}");
                Err(ProtocolError::Arg)
            }
        }
    }
}

/// Type used to represent errors that can occur in sending or receiving
/// commands over the binary API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Invalid command byte received
    Command(u8),

    /// Invalid response byte received
    Response(u8),

    /// Invalid argument provided
    Arg,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Command(cmd) => write!(f, "invalid command 0x{cmd:02X}"),
            ProtocolError::Response(rsp) => write!(f, "invalid response 0x{rsp:02X}"),
            ProtocolError::Arg => write!(f, "invalid argument"),
        }
    }
}

/// Type used to represent errors that can occur in parsing received commands
/// over the binary API.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError<T> {
    Transport(T),
    Protocol(ProtocolError),
}

impl<T> From<ProtocolError> for ParseError<T> {
    fn from(e: ProtocolError) -> Self {
        ParseError::Protocol(e)
    }
}

impl<T> ParseError<T> {
    fn transport(e: T) -> Self {
        ParseError::Transport(e)
    }
}

/// Represents a binary API operation that can be performed on a target.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Op {
    DmRead { addr: u8 },
    DmWrite { addr: u8, data: u32 },
    MemRead { addr: u32 },
    MemWrite { addr: u32, data: u32 },
    GprRead { reg: u8 },
    GprWrite { reg: u8, data: u32 },
    BlockRead { addr: u32, count: u16 },
    ChipInfo,
    Reset { kind: ResetKind },
    Halt,
    Resume,
    IsHalted,
    Unlock,
    Lock,
    WipePage { addr: u32 },
    WipeSector { addr: u32 },
    WipeChip,
    WriteFlash { addr: u32, data: Vec<u8> },
    Ping,
    Disconnect,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            match self {
                Op::DmRead { addr } => write!(f, "DmRead(addr=0x{addr:02X})"),
                Op::DmWrite { addr, data } => {
                    write!(f, "DmWrite(addr=0x{addr:02X}, data=0x{data:08X})")
                }
                Op::MemRead { addr } => write!(f, "MemRead(addr=0x{addr:08X})"),
                Op::MemWrite { addr, data } => {
                    write!(f, "MemWrite(addr=0x{addr:08X}, data=0x{data:08X})")
                }
                Op::GprRead { reg } => write!(f, "GprRead(reg={reg})"),
                Op::GprWrite { reg, data } => write!(f, "GprWrite(reg={reg}, data=0x{data:08X})"),
                Op::BlockRead { addr, count } => {
                    write!(f, "BlockRead(addr=0x{addr:08X}, count={count})")
                }
                Op::Reset { kind } => write!(f, "Reset(kind={kind:?})"),
                Op::WipePage { addr } => write!(f, "WipePage(addr=0x{addr:08X})"),
                Op::WipeSector { addr } => write!(f, "WipeSector(addr=0x{addr:08X})"),
                Op::WriteFlash { addr, data } => {
                    write!(f, "WriteFlash(addr=0x{addr:08X}, len={})", data.len())
                }
                _ => write!(f, "{}", self.command()),
            }
        } else {
            write!(f, "{}", self.command())
        }
    }
}

// Public Op methods
impl Op {
    /// The command byte for this operation
    pub fn command(&self) -> Command {
        match self {
            Op::DmRead { .. } => Command::DmRead,
            Op::DmWrite { .. } => Command::DmWrite,
            Op::MemRead { .. } => Command::MemRead,
            Op::MemWrite { .. } => Command::MemWrite,
            Op::GprRead { .. } => Command::GprRead,
            Op::GprWrite { .. } => Command::GprWrite,
            Op::BlockRead { .. } => Command::BlockRead,
            Op::ChipInfo => Command::ChipInfo,
            Op::Reset { .. } => Command::Reset,
            Op::Halt => Command::Halt,
            Op::Resume => Command::Resume,
            Op::IsHalted => Command::IsHalted,
            Op::Unlock => Command::Unlock,
            Op::Lock => Command::Lock,
            Op::WipePage { .. } => Command::WipePage,
            Op::WipeSector { .. } => Command::WipeSector,
            Op::WipeChip => Command::WipeChip,
            Op::WriteFlash { .. } => Command::WriteFlash,
            Op::Ping => Command::Ping,
            Op::Disconnect => Command::Disconnect,
        }
    }

    /// Used by a binary API server to read the next command byte.
    pub fn recv_cmd<R: Read>(
        reader: &mut R,
    ) -> Result<Command, ParseError<ReadExactError<R::Error>>> {
        let mut cmd = [0u8; 1];
        reader.read_exact(&mut cmd).map_err(ParseError::transport)?;
        let command = Command::from_byte(cmd[0])?;
        Ok(command)
    }

    /// Used by a binary API server to receive a complete command from an
    /// API client.
    ///
    /// Called once the command byte has been read from the stream.
    ///
    /// Arguments:
    /// - `command`: The command received.
    /// - `reader`: The stream to read the rest of the command from
    ///
    /// Returns:
    /// - `Ok(Self)`: If the command was successfully parsed.
    /// - `Err(ParseError)`: If there was an error reading or parsing the
    ///   command.
    pub fn recv<R: Read>(
        command: Command,
        reader: &mut R,
    ) -> Result<Self, ParseError<ReadExactError<R::Error>>> {
        trace!("Received command: {command}");
        let bytes_needed = command.remaining_bytes();

        let mut buf = vec![0u8; bytes_needed];
        if bytes_needed > 0 {
            reader
                .read_exact(&mut buf)
                .inspect_err(|_| debug!("Failed to read static command bytes {bytes_needed}"))
                .map_err(ParseError::transport)?;
        }

        match command {
            Command::DmRead => Ok(Op::DmRead { addr: buf[0] }),
            Command::DmWrite => Ok(Op::DmWrite {
                addr: buf[0],
                data: Self::parse_word(&buf[1..5])?,
            }),
            Command::MemRead => Ok(Op::MemRead {
                addr: Self::parse_word(&buf[0..4])?,
            }),
            Command::MemWrite => Ok(Op::MemWrite {
                addr: Self::parse_word(&buf[0..4])?,
                data: Self::parse_word(&buf[4..8])?,
            }),
            Command::GprRead => Ok(Op::GprRead { reg: buf[0] }),
            Command::GprWrite => Ok(Op::GprWrite {
                reg: buf[0],
                data: Self::parse_word(&buf[1..5])?,
            }),
            Command::BlockRead => {
                let addr = Self::parse_word(&buf[0..4])?;
                let count = Self::parse_count(&buf[4..6])?;
                Command::check_count(count)?;
                Ok(Op::BlockRead { addr, count })
            }
            Command::ChipInfo => Ok(Op::ChipInfo),
            Command::Reset => Ok(Op::Reset {
                kind: ResetKind::from_byte(buf[0])?,
            }),
            Command::Halt => Ok(Op::Halt),
            Command::Resume => Ok(Op::Resume),
            Command::IsHalted => Ok(Op::IsHalted),
            Command::Unlock => Ok(Op::Unlock),
            Command::Lock => Ok(Op::Lock),
            Command::WipePage => Ok(Op::WipePage {
                addr: Self::parse_word(&buf[0..4])?,
            }),
            Command::WipeSector => Ok(Op::WipeSector {
                addr: Self::parse_word(&buf[0..4])?,
            }),
            Command::WipeChip => Ok(Op::WipeChip),
            Command::WriteFlash => {
                let addr = Self::parse_word(&buf[0..4])?;
                let count = Self::parse_count(&buf[4..6])?;

                // Read in the additional data bytes
                let data_bytes = command.var_bytes(count)?;
                let mut data = vec![0u8; data_bytes];
                reader
                    .read_exact(&mut data)
                    .inspect_err(|_| debug!("Failed to read variable command bytes {data_bytes}"))
                    .map_err(ParseError::transport)?;

                Ok(Op::WriteFlash { addr, data })
            }
            Command::Ping => Ok(Op::Ping),
            Command::Disconnect => Ok(Op::Disconnect),
        }
    }

    /// Used by a binary API client to send a command to an API server.
    ///
    /// Arguments:
    /// - `writer`: The stream to write the command to
    ///
    /// Returns:
    /// - `Ok(())`: If the command was successfully sent.
    /// - `Err(ParseError::Protocol)`: If the command cannot be encoded, for
    ///   example flash data that is not a whole number of words.
    /// - `Err(ParseError::Transport)`: If there was an error writing.
    pub fn send<W: Write>(&self, writer: &mut W) -> Result<(), ParseError<W::Error>> {
        let mut buf = Vec::with_capacity(1 + self.command().remaining_bytes());
        buf.push(self.command().to_byte());

        match self {
            Op::DmRead { addr } => buf.push(*addr),
            Op::DmWrite { addr, data } => {
                buf.push(*addr);
                buf.extend(data.to_le_bytes());
            }
            Op::MemRead { addr } | Op::WipePage { addr } | Op::WipeSector { addr } => {
                buf.extend(addr.to_le_bytes())
            }
            Op::MemWrite { addr, data } => {
                buf.extend(addr.to_le_bytes());
                buf.extend(data.to_le_bytes());
            }
            Op::GprRead { reg } => buf.push(*reg),
            Op::GprWrite { reg, data } => {
                buf.push(*reg);
                buf.extend(data.to_le_bytes());
            }
            Op::BlockRead { addr, count } => {
                Command::check_count(*count)?;
                buf.extend(addr.to_le_bytes());
                buf.extend(count.to_le_bytes());
            }
            Op::Reset { kind } => buf.push(*kind as u8),
            Op::WriteFlash { addr, data } => {
                if data.len() % 4 != 0 {
                    return Err(ParseError::Protocol(ProtocolError::Arg));
                }
                let count = u16::try_from(data.len() / 4).map_err(|_| ProtocolError::Arg)?;
                Command::check_count(count)?;
                buf.extend(addr.to_le_bytes());
                buf.extend(count.to_le_bytes());
                buf.extend_from_slice(data);
            }
            Op::ChipInfo
            | Op::Halt
            | Op::Resume
            | Op::IsHalted
            | Op::Unlock
            | Op::Lock
            | Op::WipeChip
            | Op::Ping
            | Op::Disconnect => (),
        }

        writer.write_all(&buf).map_err(ParseError::transport)
    }
}

// Internal Op methods
impl Op {
    fn parse_word(bytes: &[u8]) -> Result<u32, ProtocolError> {
        if bytes.len() != 4 {
            debug!("Invalid word bytes: {bytes:?}");
            return Err(ProtocolError::Arg);
        }
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn parse_count(bytes: &[u8]) -> Result<u16, ProtocolError> {
        if bytes.len() != 2 {
            debug!("Invalid count bytes: {bytes:?}");
            return Err(ProtocolError::Arg);
        }
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}
