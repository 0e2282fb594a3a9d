// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! wchswio-core - CH32V (QingKe V2) specific objects

use core::fmt;
use serde::Serialize;

/// CH32V flash memory base address
pub const CH32_FLASH_BASE: u32 = 0x0800_0000;

/// CH32V RAM base address
pub const CH32_RAM_BASE: u32 = 0x2000_0000;

/// Fast programming page size.  Page erase (FTER) and page programming
/// (FTPG) both operate on this many bytes.
pub const FLASH_PAGE_SIZE: u32 = 64;

/// Standard erase sector size (PER)
pub const FLASH_SECTOR_SIZE: u32 = 1024;

// FLASH register base address
const CH32_FLASH_REG_BASE: u32 = 0x4002_2000;

/// FLASH_ACTLR register (access control, latency)
pub struct FlashActlr;

impl FlashActlr {
    pub const ADDRESS: u32 = CH32_FLASH_REG_BASE;
}

/// FLASH_KEYR register
///
/// Writing [`FlashKeyr::KEY1`] then [`FlashKeyr::KEY2`] clears CTLR.LOCK.
pub struct FlashKeyr;

impl FlashKeyr {
    pub const ADDRESS: u32 = CH32_FLASH_REG_BASE + 0x04;

    pub const KEY1: u32 = 0x4567_0123;
    pub const KEY2: u32 = 0xCDEF_89AB;
}

/// FLASH_OBKEYR register (option byte unlock)
pub struct FlashObkeyr;

impl FlashObkeyr {
    pub const ADDRESS: u32 = CH32_FLASH_REG_BASE + 0x08;
}

/// FLASH_STATR register
///
/// Status of the current flash operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashStatr(pub u32);

impl FlashStatr {
    pub const ADDRESS: u32 = CH32_FLASH_REG_BASE + 0x0C;

    pub const BUSY: u32 = 1 << 0;
    pub const WRPRTERR: u32 = 1 << 4;
    pub const EOP: u32 = 1 << 5;
    pub const MODE: u32 = 1 << 14;
    pub const BOOT_LOCK: u32 = 1 << 15;

    pub fn busy(&self) -> bool {
        self.0 & Self::BUSY != 0
    }

    /// Whether the last operation targeted a write protected area
    pub fn write_protect_error(&self) -> bool {
        self.0 & Self::WRPRTERR != 0
    }

    /// Whether the last operation completed
    pub fn end_of_operation(&self) -> bool {
        self.0 & Self::EOP != 0
    }
}

impl From<u32> for FlashStatr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<FlashStatr> for u32 {
    fn from(statr: FlashStatr) -> Self {
        statr.0
    }
}

impl fmt::Display for FlashStatr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// FLASH_CTLR register
///
/// Selects and triggers erase and programming operations.
pub struct FlashCtlr;

impl FlashCtlr {
    pub const ADDRESS: u32 = CH32_FLASH_REG_BASE + 0x10;

    /// Standard programming
    pub const PG: u32 = 1 << 0;
    /// Sector (1K) erase
    pub const PER: u32 = 1 << 1;
    /// Mass erase
    pub const MER: u32 = 1 << 2;
    pub const OBG: u32 = 1 << 4;
    pub const OBER: u32 = 1 << 5;
    /// Start the selected operation
    pub const STRT: u32 = 1 << 6;
    pub const LOCK: u32 = 1 << 7;
    pub const OBWRE: u32 = 1 << 9;
    pub const ERRIE: u32 = 1 << 10;
    pub const EOPIE: u32 = 1 << 12;
    /// Fast programming mode lock
    pub const FLOCK: u32 = 1 << 15;
    /// Fast page programming
    pub const FTPG: u32 = 1 << 16;
    /// Fast page (64 byte) erase
    pub const FTER: u32 = 1 << 17;
    /// Load the staged word into the page buffer
    pub const BUFLOAD: u32 = 1 << 18;
    /// Clear the page buffer
    pub const BUFRST: u32 = 1 << 19;
}

/// FLASH_ADDR register
///
/// Target address of page/sector erase and fast page programming.
pub struct FlashAddr;

impl FlashAddr {
    pub const ADDRESS: u32 = CH32_FLASH_REG_BASE + 0x14;
}

pub struct FlashObr;

impl FlashObr {
    pub const ADDRESS: u32 = CH32_FLASH_REG_BASE + 0x1C;
}

pub struct FlashWpr;

impl FlashWpr {
    pub const ADDRESS: u32 = CH32_FLASH_REG_BASE + 0x20;
}

/// FLASH_MODEKEYR register
///
/// The same key pair written here clears CTLR.FLOCK, enabling the fast
/// page erase and programming modes.
pub struct FlashMkeyr;

impl FlashMkeyr {
    pub const ADDRESS: u32 = CH32_FLASH_REG_BASE + 0x24;
}

/// FLASH_BOOT_MODEKEYR register
pub struct FlashBkeyr;

impl FlashBkeyr {
    pub const ADDRESS: u32 = CH32_FLASH_REG_BASE + 0x28;
}

/// Electronic signature (ESIG) block
pub struct Esig;

impl Esig {
    /// Flash capacity in KB, low 16 bits
    pub const FLACAP_ADDRESS: u32 = 0x1FFF_F7E0;

    /// First of three unique ID words
    pub const UNIID1_ADDRESS: u32 = 0x1FFF_F7E8;
    pub const UNIID2_ADDRESS: u32 = 0x1FFF_F7EC;
    pub const UNIID3_ADDRESS: u32 = 0x1FFF_F7F0;

    pub const UNIID_ADDRESSES: [u32; 3] = [
        Self::UNIID1_ADDRESS,
        Self::UNIID2_ADDRESS,
        Self::UNIID3_ADDRESS,
    ];
}

/// Chip information read from the ESIG block
///
/// Only valid immediately after the target was successfully halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ChipInfo {
    /// Flash size in KB
    pub flash_size_kb: u16,

    /// Unique ID, UNIID1 first
    pub uid: [u32; 3],
}

impl ChipInfo {
    /// Build from the raw flash capacity word and unique ID words
    pub fn from_raw(flacap: u32, uid: [u32; 3]) -> Self {
        Self {
            flash_size_kb: (flacap & 0xFFFF) as u16,
            uid,
        }
    }

    pub fn flash_size_bytes(&self) -> u32 {
        self.flash_size_kb as u32 * 1024
    }
}

impl fmt::Display for ChipInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Flash Size: {} KB UID: 0x{:08X}{:08X}{:08X}",
            self.flash_size_kb, self.uid[0], self.uid[1], self.uid[2]
        )
    }
}
