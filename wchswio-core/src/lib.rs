// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! wchswio-core - Core debug module and MCU concepts for WCH CH32V
//! (QingKe V2) targets.
//!
//! Designed to be used in conjunction with the `wchswio` library, which
//! drives the single wire SWIO debug link.  This crate contains no I/O: it
//! describes the debug module registers, the abstract command word, the
//! program buffer programs the driver runs, the register cache bookkeeping
//! and the CH32V flash controller memory map.
//!
//! This library is `no_std` compatible and does not allocate.

#![cfg_attr(not(test), no_std)]

pub mod cache;
pub mod ch32;
pub mod command;
pub mod dm;
pub mod register;
pub mod rv;

use static_assertions::const_assert;

use crate::ch32::{FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE};

/// Every program must fill exactly the program buffer
const_assert!(rv::PROGRAM_HALFWORDS * 2 == dm::PROGBUF_WORDS * 4);

// The write program detects page boundaries with a 12-bit andi mask
const_assert!(FLASH_PAGE_SIZE.is_power_of_two());
const_assert!(FLASH_PAGE_SIZE <= 2048);
const_assert!(FLASH_SECTOR_SIZE % FLASH_PAGE_SIZE == 0);

/// Bytes in one 32-bit target word
pub const WORD_BYTES: u32 = 4;

/// Whether `addr` is 32-bit aligned
pub const fn is_word_aligned(addr: u32) -> bool {
    addr % WORD_BYTES == 0
}
