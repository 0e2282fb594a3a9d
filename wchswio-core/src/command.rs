// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Abstract Commands
//!
//! QingKe V2 only implements the "access register" abstract command type.
//! It can transfer a GPR or CSR to or from DATA0, and/or execute the program
//! buffer (POSTEXEC).

use core::fmt;
use serde::Serialize;

use crate::register_data_w;

/// REGNO of GPR x0.  GPR n is `GPR_BASE | n`.
pub const GPR_BASE: u16 = 0x1000;

/// REGNO of the DPC CSR (the PC the hart resumes at)
pub const CSR_DPC: u16 = 0x07B1;

/// REGNO of the DCSR CSR
pub const CSR_DCSR: u16 = 0x07B0;

/// Access register abstract command word
///
/// ```rust
/// use wchswio_core::command::AccessRegister;
/// let cmd = AccessRegister::transfer_gpr(10, false);
/// assert_eq!(u32::from(cmd), 0x0022_100A);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessRegister(u32);
register_data_w!(AccessRegister);

impl AccessRegister {
    pub const REGNO_MASK: u32 = 0xFFFF;
    pub const WRITE: u32 = 1 << 16;
    pub const TRANSFER: u32 = 1 << 17;
    pub const POSTEXEC: u32 = 1 << 18;
    pub const AARPOSTINCREMENT: u32 = 1 << 19;
    pub const AARSIZE_SHIFT: u32 = 20;
    pub const AARSIZE_32: u32 = 2;
    pub const CMDTYPE_SHIFT: u32 = 24;

    /// An empty access register command with 32-bit transfers
    pub const fn new() -> Self {
        Self(Self::AARSIZE_32 << Self::AARSIZE_SHIFT)
    }

    /// Execute the program buffer only
    pub const fn postexec() -> Self {
        Self::new().set_postexec(true)
    }

    /// Transfer a register to (`write == false`) or from (`write == true`)
    /// DATA0
    pub const fn transfer(regno: u16, write: bool) -> Self {
        Self::new()
            .set_regno(regno)
            .set_transfer(true)
            .set_write(write)
    }

    /// Transfer GPR `index`
    pub const fn transfer_gpr(index: u8, write: bool) -> Self {
        Self::transfer(GPR_BASE | index as u16, write)
    }

    pub const fn set_regno(self, regno: u16) -> Self {
        Self((self.0 & !Self::REGNO_MASK) | regno as u32)
    }

    pub const fn set_write(self, set: bool) -> Self {
        self.with(Self::WRITE, set)
    }

    pub const fn set_transfer(self, set: bool) -> Self {
        self.with(Self::TRANSFER, set)
    }

    pub const fn set_postexec(self, set: bool) -> Self {
        self.with(Self::POSTEXEC, set)
    }

    pub const fn set_aarpostincrement(self, set: bool) -> Self {
        self.with(Self::AARPOSTINCREMENT, set)
    }

    const fn with(self, mask: u32, set: bool) -> Self {
        if set {
            Self(self.0 | mask)
        } else {
            Self(self.0 & !mask)
        }
    }

    pub const fn regno(&self) -> u16 {
        (self.0 & Self::REGNO_MASK) as u16
    }

    pub const fn write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub const fn is_transfer(&self) -> bool {
        self.0 & Self::TRANSFER != 0
    }

    pub const fn is_postexec(&self) -> bool {
        self.0 & Self::POSTEXEC != 0
    }

    pub const fn aarsize(&self) -> u8 {
        ((self.0 >> Self::AARSIZE_SHIFT) & 0x7) as u8
    }

    pub const fn cmdtype(&self) -> u8 {
        (self.0 >> Self::CMDTYPE_SHIFT) as u8
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }
}

/// Decoded ABSTRACTCS.CMDERR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CmdErr {
    /// A command was issued while another was still executing
    Busy,

    /// The command (or its register/size combination) is not supported
    NotSupported,

    /// An exception occurred while executing the command or program buffer
    Exception,

    /// The hart was not in the state required by the command - usually it
    /// was running when it needed to be halted
    HaltResume,

    /// A bus error occurred during a memory access
    Bus,

    /// Reserved CMDERR encoding
    Reserved(u8),

    /// Any other error
    Other,
}

impl CmdErr {
    /// Decode a raw CMDERR field.  Returns `None` for 0 (no error).
    pub fn from_field(value: u8) -> Option<Self> {
        match value & 0x7 {
            0 => None,
            1 => Some(CmdErr::Busy),
            2 => Some(CmdErr::NotSupported),
            3 => Some(CmdErr::Exception),
            4 => Some(CmdErr::HaltResume),
            5 => Some(CmdErr::Bus),
            7 => Some(CmdErr::Other),
            other => Some(CmdErr::Reserved(other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CmdErr::Busy => "busy",
            CmdErr::NotSupported => "not supported",
            CmdErr::Exception => "exception",
            CmdErr::HaltResume => "halt/resume",
            CmdErr::Bus => "bus error",
            CmdErr::Reserved(_) => "reserved",
            CmdErr::Other => "other",
        }
    }
}

impl fmt::Display for CmdErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmdErr::Reserved(value) => write!(f, "{} ({value})", self.as_str()),
            _ => write!(f, "{}", self.as_str()),
        }
    }
}
