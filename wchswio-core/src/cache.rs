// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! General Purpose Register Cache
//!
//! Programs run by the abstract command engine overwrite GPRs.  The cache
//! keeps a host side copy of each register so that the driver knows which
//! registers hold values it has not seen, and so repeated reads of clean
//! registers do not go over the wire.
//!
//! Each register is described by two bits:
//! - *cached*: the host copy matched the device when last synchronised.
//! - *dirty*: a program that may have changed the register has run since.
//!
//! | cached | dirty | meaning                                   |
//! |--------|-------|-------------------------------------------|
//! | 0      | 0     | never read, device value untouched        |
//! | 1      | 0     | host copy is the device value             |
//! | 1      | 1     | host copy is stale, device was clobbered  |
//! | 0      | 1     | device value unknown to host (misuse)     |
//!
//! The cache is pure bookkeeping.  `wchswio::debug::DebugInterface` performs
//! the device reads it asks for.

use core::fmt;

use crate::rv::Gpr;

/// Host side shadow of the target's 32 GPR slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GprCache {
    values: [u32; Gpr::COUNT],
    cached: u32,
    dirty: u32,
    will_clobber: u32,
}

impl Default for GprCache {
    fn default() -> Self {
        Self::new()
    }
}

impl GprCache {
    pub const fn new() -> Self {
        Self {
            values: [0; Gpr::COUNT],
            cached: 0,
            dirty: 0,
            will_clobber: 0,
        }
    }

    /// Forget everything.  Called whenever the target is reset or
    /// re-initialized.
    pub fn invalidate(&mut self) {
        self.cached = 0;
        self.dirty = 0;
        self.will_clobber = 0;
    }

    /// Works out which registers must be read from the device before a
    /// program clobbering `clobber` is loaded.
    ///
    /// Returns:
    /// - `Ok(mask)` of registers to read and [`record`](Self::record).  These
    ///   are the clobbered registers that are either cached and dirty, or
    ///   neither cached nor dirty.
    /// - `Err(mask)` of clobbered registers that are dirty but not cached.
    ///   Their only copy is on the device and was produced by a program, so
    ///   loading this program is a sequencing error.
    pub fn sync_mask(&self, clobber: u32) -> Result<u32, u32> {
        let lost = clobber & self.dirty & !self.cached;
        if lost != 0 {
            return Err(lost);
        }

        let stale = self.dirty & self.cached;
        let unknown = !self.dirty & !self.cached;
        Ok(clobber & (stale | unknown))
    }

    /// Record the clobber mask of the program just loaded.
    pub fn set_will_clobber(&mut self, clobber: u32) {
        self.will_clobber = clobber;
    }

    /// The loaded program ran successfully, so its clobbered registers are
    /// now stale on the host.
    pub fn program_ran(&mut self) {
        self.dirty |= self.will_clobber;
    }

    /// Record a value that is known to match the device, either because it
    /// was just read or just written.
    pub fn record(&mut self, reg: Gpr, value: u32) {
        if !reg.is_valid() || reg.is_dpc() {
            return;
        }
        self.values[reg.index() as usize] = value;
        self.cached |= reg.mask();
        self.dirty &= !reg.mask();
    }

    /// The host copy, if it is known to be current
    pub fn get(&self, reg: Gpr) -> Option<u32> {
        if !reg.is_valid() || reg.is_dpc() {
            return None;
        }
        let mask = reg.mask();
        if self.cached & mask != 0 && self.dirty & mask == 0 {
            Some(self.values[reg.index() as usize])
        } else {
            None
        }
    }

    /// The host copy regardless of its state
    pub fn stale_value(&self, reg: Gpr) -> Option<u32> {
        if reg.is_valid() && self.cached & reg.mask() != 0 {
            Some(self.values[reg.index() as usize])
        } else {
            None
        }
    }

    /// Mark registers as changed on the device by something other than a
    /// tracked program.
    pub fn mark_dirty(&mut self, mask: u32) {
        self.dirty |= mask;
    }

    /// Drop host copies without touching the dirty state.
    pub fn forget(&mut self, mask: u32) {
        self.cached &= !mask;
    }

    pub fn cached_mask(&self) -> u32 {
        self.cached
    }

    pub fn dirty_mask(&self) -> u32 {
        self.dirty
    }

    pub fn will_clobber_mask(&self) -> u32 {
        self.will_clobber
    }

    /// Whether the cache holds no state at all
    pub fn is_empty(&self) -> bool {
        (self.cached | self.dirty | self.will_clobber) == 0
    }
}

impl fmt::Display for GprCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cached 0x{:08X} dirty 0x{:08X} will clobber 0x{:08X}",
            self.cached, self.dirty, self.will_clobber
        )
    }
}
