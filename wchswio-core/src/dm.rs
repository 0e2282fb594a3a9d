// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! QingKe V2 Debug Module Registers
//!
//! The debug module (DM) of the WCH QingKe V2 core is a cut down RISC-V
//! External Debug Support 0.13 debug module, plus three WCH specific
//! registers (CPBR, CFGR and SHDWCFGR) which control the SWIO link itself.
//!
//! Each register has a zero-sized descriptor type, used with
//! `SwioInterface::read_dm_register()` and
//! `SwioInterface::write_dm_register()`, and a newtype holding its value
//! with bit-mask constants and accessors.

use crate::command::AccessRegister;
use crate::{dm_register, register_data_rw, register_data_w};

/// Number of program buffer words implemented by QingKe V2
pub const PROGBUF_WORDS: usize = 8;

/// Address of PROGBUF0.  PROGBUF1-7 follow consecutively.
pub const PROGBUF0_ADDRESS: u8 = 0x20;

/// Memory mapped address of DATA0, as seen by code running on the hart
pub const DATA0_MMIO: u32 = 0xE000_00F4;

/// Memory mapped address of DATA1, as seen by code running on the hart
pub const DATA1_MMIO: u32 = 0xE000_00F8;

/// Returns the SWIO address of program buffer word `index`, or `None` if
/// the index is out of range.
pub const fn progbuf_address(index: usize) -> Option<u8> {
    if index < PROGBUF_WORDS {
        Some(PROGBUF0_ADDRESS + index as u8)
    } else {
        None
    }
}

dm_register!(Data0Register, Data, 0x04, "DATA0", rw);
dm_register!(Data1Register, Data, 0x05, "DATA1", rw);
dm_register!(DmcontrolRegister, Dmcontrol, 0x10, "DMCONTROL", rw);
dm_register!(DmstatusRegister, Dmstatus, 0x11, "DMSTATUS", r);
dm_register!(HartinfoRegister, Data, 0x12, "HARTINFO", r);
dm_register!(AbstractcsRegister, Abstractcs, 0x16, "ABSTRACTCS", rw);
dm_register!(CommandRegister, AccessRegister, 0x17, "COMMAND", w);
dm_register!(AbstractautoRegister, Abstractauto, 0x18, "ABSTRACTAUTO", rw);
dm_register!(CpbrRegister, Cpbr, 0x7C, "CPBR", r);
dm_register!(CfgrRegister, Cfgr, 0x7D, "CFGR", w);
dm_register!(ShdwcfgrRegister, Cfgr, 0x7E, "SHDWCFGR", w);

/// Plain 32-bit data register value (DATA0, DATA1, PROGBUFn)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Data(pub u32);
register_data_rw!(Data);

/// DMCONTROL register value
///
/// ```rust
/// use wchswio_core::dm::Dmcontrol;
/// let value = Dmcontrol::default().set_dmactive(true).set_haltreq(true);
/// assert_eq!(u32::from(value), 0x8000_0001);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dmcontrol(pub u32);
register_data_rw!(Dmcontrol);

impl Dmcontrol {
    pub const HALTREQ: u32 = 1 << 31;
    pub const RESUMEREQ: u32 = 1 << 30;
    pub const HARTRESET: u32 = 1 << 29;
    pub const ACKHAVERESET: u32 = 1 << 28;
    pub const NDMRESET: u32 = 1 << 1;
    pub const DMACTIVE: u32 = 1 << 0;

    const fn with(self, mask: u32, set: bool) -> Self {
        if set {
            Self(self.0 | mask)
        } else {
            Self(self.0 & !mask)
        }
    }

    pub const fn set_haltreq(self, set: bool) -> Self {
        self.with(Self::HALTREQ, set)
    }

    pub const fn set_resumereq(self, set: bool) -> Self {
        self.with(Self::RESUMEREQ, set)
    }

    pub const fn set_hartreset(self, set: bool) -> Self {
        self.with(Self::HARTRESET, set)
    }

    pub const fn set_ackhavereset(self, set: bool) -> Self {
        self.with(Self::ACKHAVERESET, set)
    }

    pub const fn set_ndmreset(self, set: bool) -> Self {
        self.with(Self::NDMRESET, set)
    }

    pub const fn set_dmactive(self, set: bool) -> Self {
        self.with(Self::DMACTIVE, set)
    }

    pub fn haltreq(&self) -> bool {
        self.0 & Self::HALTREQ != 0
    }

    pub fn resumereq(&self) -> bool {
        self.0 & Self::RESUMEREQ != 0
    }

    pub fn hartreset(&self) -> bool {
        self.0 & Self::HARTRESET != 0
    }

    pub fn ackhavereset(&self) -> bool {
        self.0 & Self::ACKHAVERESET != 0
    }

    pub fn dmactive(&self) -> bool {
        self.0 & Self::DMACTIVE != 0
    }
}

/// DMSTATUS register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dmstatus(pub u32);
register_data_rw!(Dmstatus);

impl Dmstatus {
    pub const ALLHAVERESET: u32 = 1 << 19;
    pub const ANYHAVERESET: u32 = 1 << 18;
    pub const ALLRESUMEACK: u32 = 1 << 17;
    pub const ANYRESUMEACK: u32 = 1 << 16;
    pub const ALLUNAVAIL: u32 = 1 << 13;
    pub const ANYUNAVAIL: u32 = 1 << 12;
    pub const ALLRUNNING: u32 = 1 << 11;
    pub const ANYRUNNING: u32 = 1 << 10;
    pub const ALLHALTED: u32 = 1 << 9;
    pub const ANYHALTED: u32 = 1 << 8;
    pub const AUTHENTICATED: u32 = 1 << 7;
    pub const VERSION_MASK: u32 = 0xF;

    pub fn allhavereset(&self) -> bool {
        self.0 & Self::ALLHAVERESET != 0
    }

    pub fn anyhavereset(&self) -> bool {
        self.0 & Self::ANYHAVERESET != 0
    }

    pub fn allresumeack(&self) -> bool {
        self.0 & Self::ALLRESUMEACK != 0
    }

    pub fn allrunning(&self) -> bool {
        self.0 & Self::ALLRUNNING != 0
    }

    pub fn allhalted(&self) -> bool {
        self.0 & Self::ALLHALTED != 0
    }

    pub fn anyhalted(&self) -> bool {
        self.0 & Self::ANYHALTED != 0
    }

    pub fn authenticated(&self) -> bool {
        self.0 & Self::AUTHENTICATED != 0
    }

    /// Debug specification version implemented (2 = 0.13)
    pub fn version(&self) -> u8 {
        (self.0 & Self::VERSION_MASK) as u8
    }
}

/// ABSTRACTCS register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Abstractcs(pub u32);
register_data_rw!(Abstractcs);

impl Abstractcs {
    pub const PROGBUFSIZE_SHIFT: u32 = 24;
    pub const PROGBUFSIZE_MASK: u32 = 0x1F;
    pub const BUSY: u32 = 1 << 12;
    pub const CMDERR_SHIFT: u32 = 8;
    pub const CMDERR_MASK: u32 = 0x7;
    pub const DATACOUNT_MASK: u32 = 0xF;

    /// Value which, when written, clears CMDERR (write-1-to-clear)
    pub const fn clear_cmderr() -> Self {
        Self(Self::CMDERR_MASK << Self::CMDERR_SHIFT)
    }

    pub fn busy(&self) -> bool {
        self.0 & Self::BUSY != 0
    }

    /// Raw CMDERR field, 0 if the last command succeeded
    pub fn cmderr(&self) -> u8 {
        ((self.0 >> Self::CMDERR_SHIFT) & Self::CMDERR_MASK) as u8
    }

    pub fn progbufsize(&self) -> u8 {
        ((self.0 >> Self::PROGBUFSIZE_SHIFT) & Self::PROGBUFSIZE_MASK) as u8
    }

    pub fn datacount(&self) -> u8 {
        (self.0 & Self::DATACOUNT_MASK) as u8
    }
}

/// ABSTRACTAUTO register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Abstractauto(pub u32);
register_data_rw!(Abstractauto);

impl Abstractauto {
    pub const AUTOEXECDATA0: u32 = 1 << 0;
    pub const AUTOEXECDATA1: u32 = 1 << 1;

    /// Re-execute COMMAND on every DATA0 access
    pub const fn data0() -> Self {
        Self(Self::AUTOEXECDATA0)
    }

    pub const fn off() -> Self {
        Self(0)
    }

    pub fn autoexec_data0(&self) -> bool {
        self.0 & Self::AUTOEXECDATA0 != 0
    }
}

/// WCH CPBR (capability) register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cpbr(pub u32);
register_data_rw!(Cpbr);

impl Cpbr {
    pub const VERSION_SHIFT: u32 = 16;
    pub const VERSION_MASK: u32 = 0x7;
    pub const IOMODE: u32 = 1 << 10;

    /// The only SWIO protocol version this crate speaks
    pub const SUPPORTED_VERSION: u8 = 1;

    pub fn version(&self) -> u8 {
        ((self.0 >> Self::VERSION_SHIFT) & Self::VERSION_MASK) as u8
    }

    pub fn is_supported(&self) -> bool {
        self.version() == Self::SUPPORTED_VERSION
    }
}

/// WCH CFGR / SHDWCFGR register value
///
/// Writes are only accepted when the top half-word carries [`Cfgr::KEY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cfgr(pub u32);
register_data_w!(Cfgr);

impl Cfgr {
    pub const KEY: u32 = 0x5AA5 << 16;
    pub const OUTEN: u32 = 1 << 10;

    /// Value written during the SWIO initialization handshake: key plus
    /// debug output enable
    pub const fn enable_output() -> Self {
        Self(Self::KEY | Self::OUTEN)
    }
}
