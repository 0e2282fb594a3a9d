// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! WCH SWIO Debug Interface
//!
//! This module provides [`DebugInterface`], the higher level driver built on
//! [`SwioInterface`].  It runs small programs from the debug module's program
//! buffer to access target memory, tracks which general purpose registers
//! those programs clobber, sequences target resets and queries chip
//! information.  Flash programming is in [`crate::flash`].

extern crate alloc;
use alloc::vec::Vec;
use embassy_time::{Duration, Instant, block_for};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use wchswio_core::cache::GprCache;
use wchswio_core::ch32::{ChipInfo, Esig};
use wchswio_core::command::{AccessRegister, CSR_DPC, CmdErr, GPR_BASE};
use wchswio_core::dm::{Abstractauto, Abstractcs, Dmcontrol, Dmstatus, PROGBUF_WORDS};
use wchswio_core::rv::{
    GET_BLOCK_ALIGNED, GET_MACHINE_ISA, GET_U32, Gpr, Program, SET_U32,
};
use wchswio_core::{WORD_BYTES, is_word_aligned};

use crate::SwioError;
use crate::interface::SwioInterface;
use crate::protocol::{ResetPin, SwioPin};

/// Run a program and check ABSTRACTCS once, without polling.
pub const NO_WAIT: Duration = Duration::from_ticks(0);

/// Default time allowed for long running programs such as flash erase and
/// page commits.
pub const DEFAULT_PROGRAM_TIMEOUT: Duration = Duration::from_millis(500);

/// Type of target reset performed by [`DebugInterface::reset()`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetKind {
    /// Reset the core and leave it halted at the reset vector
    ToHalt,

    /// Reset the core, check the reset was observed, and leave it running
    ToRun,

    /// As [`ResetKind::ToRun`], without waiting for the reset to be observed
    ToRunNoCheck,
}

impl core::fmt::Display for ResetKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ResetKind::ToHalt => write!(f, "to halt"),
            ResetKind::ToRun => write!(f, "to run"),
            ResetKind::ToRunNoCheck => write!(f, "to run (no check)"),
        }
    }
}

/// Delays used by the reset sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetTiming {
    /// How long NRST is held low
    pub nrst_low: Duration,

    /// Wait after NRST is released before the SWIO handshake
    pub nrst_settle: Duration,

    /// Wait after each DMCONTROL write
    pub dmcontrol_settle: Duration,

    /// How long to wait for DMSTATUS to report the reset
    pub poll_timeout: Duration,
}

impl Default for ResetTiming {
    fn default() -> Self {
        Self {
            nrst_low: Duration::from_millis(2),
            nrst_settle: Duration::from_millis(10),
            dmcontrol_settle: Duration::from_millis(1),
            poll_timeout: Duration::from_millis(100),
        }
    }
}

impl ResetTiming {
    /// No delays at all.  Only useful when the far end is not real hardware.
    pub const fn immediate() -> Self {
        Self {
            nrst_low: NO_WAIT,
            nrst_settle: NO_WAIT,
            dmcontrol_settle: NO_WAIT,
            poll_timeout: Duration::from_millis(10),
        }
    }
}

/// Debug Interface object
///
/// Owns a [`SwioInterface`] plus the host side state for one target:
/// - the program buffer contents last uploaded
/// - the general purpose register cache ([`GprCache`])
/// - reset and program timeouts
///
/// ```rust,ignore
/// use wchswio::{DebugInterface, SwioInterface};
/// use wchswio::debug::ResetKind;
///
/// let swio_if = SwioInterface::from_pins(swio, nrst);
/// let mut debug_if = DebugInterface::from_swio(swio_if);
///
/// let info = debug_if.get_chip_info()?;
/// esp_println::println!("{info}");
///
/// debug_if.reset(ResetKind::ToHalt)?;
/// let word = debug_if.get_mem_u32(0x0800_0000)?;
/// ```
#[derive(Debug)]
pub struct DebugInterface<P: SwioPin, R: ResetPin> {
    swio: SwioInterface<P, R>,
    progbuf: Option<[u32; PROGBUF_WORDS]>,
    command: AccessRegister,
    cache: GprCache,
    verify_programs: bool,
    decode_cmderr: bool,
    reset_timing: ResetTiming,
    program_timeout: Duration,
}

impl<P: SwioPin, R: ResetPin> DebugInterface<P, R> {
    /// Create a new `DebugInterface` from a [`SwioInterface`].
    pub fn from_swio(swio: SwioInterface<P, R>) -> Self {
        Self {
            swio,
            progbuf: None,
            command: AccessRegister::postexec(),
            cache: GprCache::new(),
            verify_programs: false,
            decode_cmderr: true,
            reset_timing: ResetTiming::default(),
            program_timeout: DEFAULT_PROGRAM_TIMEOUT,
        }
    }

    /// Create a new `DebugInterface` from the SWIO and NRST pins.
    pub fn from_pins(swio: P, reset: R) -> Self {
        Self::from_swio(SwioInterface::from_pins(swio, reset))
    }

    /// Access the underlying [`SwioInterface`], for example for raw debug
    /// module register access.  Writing DMCONTROL, COMMAND or PROGBUF
    /// directly is not tracked by this object.
    pub fn swio_if(&mut self) -> &mut SwioInterface<P, R> {
        &mut self.swio
    }

    /// Read back every program buffer word as it is uploaded.
    pub fn set_verify_programs(&mut self, verify: bool) {
        self.verify_programs = verify;
    }

    /// Report ABSTRACTCS.CMDERR in [`SwioError::ProgramRunError`].  If
    /// disabled, all command errors are reported as [`CmdErr::Other`].
    pub fn set_decode_cmderr(&mut self, decode: bool) {
        self.decode_cmderr = decode;
    }

    pub fn set_reset_timing(&mut self, timing: ResetTiming) {
        self.reset_timing = timing;
    }

    pub fn reset_timing(&self) -> ResetTiming {
        self.reset_timing
    }

    /// Sets the timeout used for flash erase and page programming.
    pub fn set_program_timeout(&mut self, timeout: Duration) {
        self.program_timeout = timeout;
    }

    pub fn program_timeout(&self) -> Duration {
        self.program_timeout
    }

    /// The register cache.
    pub fn gpr_cache(&self) -> &GprCache {
        &self.cache
    }

    /// Mutable access to the register cache.  Use after modifying registers
    /// behind this object's back, for example with raw abstract commands.
    pub fn gpr_cache_mut(&mut self) -> &mut GprCache {
        &mut self.cache
    }

    /// Runs the SWIO initialization handshake and forgets all cached
    /// target state.
    pub fn init(&mut self) -> Result<(), SwioError> {
        self.invalidate();
        self.swio.initialize().map(|_| ())
    }

    fn invalidate(&mut self) {
        self.cache.invalidate();
        self.progbuf = None;
        self.command = AccessRegister::postexec();
    }

    //
    // Abstract command engine
    //

    /// Load a program into the program buffer.
    ///
    /// Only words which differ from those last uploaded are written.  Any
    /// registers the program clobbers that the host does not hold a current
    /// copy of are read from the target first.
    ///
    /// Returns:
    /// - `Ok(())` when the program is ready to be run with
    ///   [`Self::run_prog()`].
    /// - `Err(SwioError::DirtyRegs(mask))` if the program would clobber
    ///   registers whose only copy is on the target.
    /// - `Err(SwioError::TargetInInvalidState)` if verification is enabled
    ///   and a word did not read back correctly.
    pub fn load_program(&mut self, program: &Program) -> Result<(), SwioError> {
        let sync = self.cache.sync_mask(program.clobber).map_err(|mask| {
            warn!("Error: {program} would clobber dirty registers 0x{mask:08X}");
            SwioError::DirtyRegs(mask)
        })?;

        let words = program.words();
        if self.progbuf != Some(words) {
            let previous = self.progbuf.take();
            for (ii, word) in words.iter().enumerate() {
                if previous.map(|p| p[ii]) == Some(*word) {
                    continue;
                }
                self.swio.set_progbuf(ii, *word)?;
                if self.verify_programs {
                    let readback = self.swio.progbuf(ii)?;
                    if readback != *word {
                        warn!("Error: PROGBUF{ii} 0x{readback:08X} expected 0x{word:08X}");
                        return Err(SwioError::TargetInInvalidState);
                    }
                }
            }
            self.progbuf = Some(words);
            debug!("Exec:  Loaded {program}");
        }

        for index in 0..Gpr::COUNT as u8 {
            let reg = Gpr(index);
            if sync & reg.mask() != 0 {
                let value = self.read_register(Self::regno(reg))?;
                self.cache.record(reg, value);
            }
        }

        self.cache.set_will_clobber(program.clobber);
        self.command = match program.data0_arg {
            Some(reg) => AccessRegister::transfer_gpr(reg.index(), true).set_postexec(true),
            None => AccessRegister::postexec(),
        };
        Ok(())
    }

    /// Run the loaded program.
    ///
    /// Arguments:
    /// - `timeout`: [`NO_WAIT`] to check completion once, otherwise how long
    ///   to poll for completion.
    pub fn run_prog(&mut self, timeout: Duration) -> Result<(), SwioError> {
        trace!("Exec:  COMMAND {}", self.command);
        self.swio.set_command(self.command)?;
        let result = self.await_prog(timeout);

        // Registers may have been changed even if the program failed part
        // way through.
        self.cache.program_ran();
        result
    }

    /// Wait for the current abstract command to complete, and check it
    /// succeeded.  Used directly when ABSTRACTAUTO is re-running programs.
    pub fn await_prog(&mut self, timeout: Duration) -> Result<(), SwioError> {
        let start = Instant::now();
        loop {
            let cs = self.swio.abstractcs()?;
            if !cs.busy() {
                return self.check_cmderr(cs);
            }
            if timeout == NO_WAIT {
                warn!("Error: Program not finished");
                return Err(SwioError::ProgramNotFinishedYet);
            }
            if start.elapsed() > timeout {
                warn!("Error: Program timed out after {}ms", timeout.as_millis());
                return Err(SwioError::Timeout);
            }
        }
    }

    fn check_cmderr(&mut self, cs: Abstractcs) -> Result<(), SwioError> {
        let Some(err) = CmdErr::from_field(cs.cmderr()) else {
            return Ok(());
        };
        self.swio.clear_cmderr()?;

        let err = if self.decode_cmderr { err } else { CmdErr::Other };
        warn!("Error: Abstract command failed: {err}");
        Err(SwioError::ProgramRunError(err))
    }

    fn regno(reg: Gpr) -> u16 {
        if reg.is_dpc() {
            CSR_DPC
        } else {
            GPR_BASE | reg.index() as u16
        }
    }

    fn read_register(&mut self, regno: u16) -> Result<u32, SwioError> {
        self.swio.set_command(AccessRegister::transfer(regno, false))?;
        self.await_prog(NO_WAIT)?;
        self.swio.data0()
    }

    fn write_register(&mut self, regno: u16, value: u32) -> Result<(), SwioError> {
        self.swio.set_data0(value)?;
        self.swio.set_command(AccessRegister::transfer(regno, true))?;
        self.await_prog(NO_WAIT)
    }

    /// Read a general purpose register, or the DPC with [`Gpr::DPC`].  The
    /// host copy is used if it is current.  The hart must be halted.
    pub fn get_gpr(&mut self, reg: Gpr) -> Result<u32, SwioError> {
        if !reg.is_valid() {
            return Err(SwioError::InvalidArgument);
        }
        if let Some(value) = self.cache.get(reg) {
            return Ok(value);
        }
        let value = self.read_register(Self::regno(reg))?;
        self.cache.record(reg, value);
        Ok(value)
    }

    /// Write a general purpose register, or the DPC with [`Gpr::DPC`].  The
    /// hart must be halted.
    pub fn set_gpr(&mut self, reg: Gpr, value: u32) -> Result<(), SwioError> {
        if !reg.is_valid() {
            return Err(SwioError::InvalidArgument);
        }
        self.write_register(Self::regno(reg), value)?;
        self.cache.record(reg, value);
        Ok(())
    }

    fn read_word(&mut self, addr: u32) -> Result<u32, SwioError> {
        self.load_program(&GET_U32)?;
        self.swio.set_data1(addr)?;
        self.run_prog(NO_WAIT)?;
        self.swio.data0()
    }

    fn write_word(&mut self, addr: u32, value: u32) -> Result<(), SwioError> {
        self.load_program(&SET_U32)?;
        self.swio.set_data0(value)?;
        self.swio.set_data1(addr)?;
        self.run_prog(NO_WAIT)
    }

    fn straddled(addr: u32) -> Result<(u32, u32, u32), SwioError> {
        let lo = addr & !(WORD_BYTES - 1);
        let hi = lo.checked_add(WORD_BYTES).ok_or(SwioError::InvalidArgument)?;
        Ok((lo, hi, (addr - lo) * 8))
    }

    /// Read a 32-bit value from target memory.  `addr` need not be aligned.
    pub fn get_mem_u32(&mut self, addr: u32) -> Result<u32, SwioError> {
        if is_word_aligned(addr) {
            return self.read_word(addr);
        }

        let (lo_addr, hi_addr, shift) = Self::straddled(addr)?;
        let lo = self.read_word(lo_addr)?;
        let hi = self.read_word(hi_addr)?;
        Ok((lo >> shift) | (hi << (32 - shift)))
    }

    /// Write a 32-bit value to target memory.  `addr` need not be aligned,
    /// in which case the bytes either side of the value are preserved.
    ///
    /// If an unaligned write fails on its second word, the first word is
    /// restored before the error is returned.
    pub fn set_mem_u32(&mut self, addr: u32, value: u32) -> Result<(), SwioError> {
        if is_word_aligned(addr) {
            return self.write_word(addr, value);
        }

        let (lo_addr, hi_addr, shift) = Self::straddled(addr)?;
        let lo = self.read_word(lo_addr)?;
        let hi = self.read_word(hi_addr)?;

        let new_lo = (lo & !(u32::MAX << shift)) | (value << shift);
        let new_hi = (hi & !((1u32 << shift) - 1)) | (value >> (32 - shift));

        self.write_word(lo_addr, new_lo)?;
        if let Err(e) = self.write_word(hi_addr, new_hi) {
            warn!("Error: Unaligned write to 0x{addr:08X} failed, restoring 0x{lo_addr:08X}");
            if let Err(e2) = self.write_word(lo_addr, lo) {
                warn!("Error: Restore of 0x{lo_addr:08X} failed: {e2}");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Read `size` bytes of target memory as 32-bit words, streaming them
    /// with ABSTRACTAUTO.
    ///
    /// Arguments:
    /// - `addr`: start address, 4 byte aligned
    /// - `size`: number of bytes, a multiple of 4
    pub fn get_block_aligned(&mut self, addr: u32, size: usize) -> Result<Vec<u32>, SwioError> {
        if !is_word_aligned(addr) || size % WORD_BYTES as usize != 0 {
            warn!("Error: Unaligned block read 0x{addr:08X} {size}");
            return Err(SwioError::InvalidArgument);
        }
        let count = size / WORD_BYTES as usize;
        if count > 0 && addr.checked_add((size - 1) as u32).is_none() {
            return Err(SwioError::InvalidArgument);
        }

        let mut words = Vec::new();
        words
            .try_reserve_exact(count)
            .map_err(|_| SwioError::NoFreeMemory)?;
        if count == 0 {
            return Ok(words);
        }

        self.load_program(&GET_BLOCK_ALIGNED)?;
        self.set_gpr(Gpr::S0, addr)?;
        self.run_prog(NO_WAIT)?;

        let result = self.stream_data0(&mut words, count);
        if count > 1 && result.is_err() {
            if let Err(e2) = self.swio.set_abstractauto(Abstractauto::off()) {
                warn!("Error: Failed to disable ABSTRACTAUTO: {e2}");
            }
        }
        result?;

        // Re-runs triggered by DATA0 reads report failure here
        let cs = self.swio.abstractcs()?;
        self.check_cmderr(cs)?;

        trace!("Value: Read {count} words from 0x{addr:08X}");
        Ok(words)
    }

    fn stream_data0(&mut self, words: &mut Vec<u32>, count: usize) -> Result<(), SwioError> {
        if count > 1 {
            self.swio.set_abstractauto(Abstractauto::data0())?;
        }
        for ii in 0..count {
            if count > 1 && ii == count - 1 {
                self.swio.set_abstractauto(Abstractauto::off())?;
            }
            words.push(self.swio.data0()?);
        }
        Ok(())
    }

    /// Read the hart's misa CSR.
    pub fn machine_isa(&mut self) -> Result<u32, SwioError> {
        self.load_program(&GET_MACHINE_ISA)?;
        self.run_prog(NO_WAIT)?;
        let misa = self.swio.data0()?;
        debug!("Value: misa 0x{misa:08X}");
        Ok(misa)
    }

    //
    // Reset, halt and resume
    //

    fn write_dmcontrol(&mut self, value: Dmcontrol) -> Result<(), SwioError> {
        trace!("Exec:  DMCONTROL {value}");
        self.swio.set_dmcontrol(value)?;
        block_for(self.reset_timing.dmcontrol_settle);
        Ok(())
    }

    fn wait_for<F>(&mut self, what: &str, f: F) -> Result<Dmstatus, SwioError>
    where
        F: Fn(&Dmstatus) -> bool,
    {
        let start = Instant::now();
        loop {
            let status = self.swio.dmstatus()?;
            if f(&status) {
                return Ok(status);
            }
            if start.elapsed() > self.reset_timing.poll_timeout {
                warn!("Error: Timed out waiting for {what}, DMSTATUS {status}");
                return Err(SwioError::Timeout);
            }
        }
    }

    /// Reset the target.
    ///
    /// Pulses NRST, re-runs the SWIO handshake and then resets the hart
    /// through DMCONTROL.  All cached target state is discarded.
    pub fn reset(&mut self, kind: ResetKind) -> Result<(), SwioError> {
        debug!("Exec:  Reset {kind}");
        self.invalidate();

        let timing = self.reset_timing;
        self.swio.pulse_reset(timing.nrst_low, timing.nrst_settle);
        self.swio.initialize()?;

        let active = Dmcontrol::default().set_dmactive(true);
        self.write_dmcontrol(active.set_haltreq(true))?;

        match kind {
            ResetKind::ToHalt => {
                self.write_dmcontrol(active.set_haltreq(true).set_hartreset(true))?;
                self.wait_for("reset", Dmstatus::allhavereset)?;
                self.write_dmcontrol(active.set_haltreq(true))?;
                self.write_dmcontrol(active.set_haltreq(true).set_ackhavereset(true))?;
                let status = self.swio.dmstatus()?;
                if !status.allhalted() {
                    warn!("Error: Hart not halted after reset, DMSTATUS {status}");
                    return Err(SwioError::TargetInInvalidState);
                }
                self.write_dmcontrol(active)?;
            }
            ResetKind::ToRun | ResetKind::ToRunNoCheck => {
                self.write_dmcontrol(active)?;
                self.write_dmcontrol(active.set_hartreset(true))?;
                if kind == ResetKind::ToRun {
                    self.wait_for("reset", Dmstatus::allhavereset)?;
                }
                self.write_dmcontrol(active)?;
                self.write_dmcontrol(active.set_ackhavereset(true))?;
            }
        }

        debug!("OK:    Reset {kind}");
        Ok(())
    }

    /// Halt the hart without resetting it.
    ///
    /// Returns `Err(SwioError::Timeout)` if the hart does not report halted
    /// within the reset poll timeout.  haltreq is released either way.
    pub fn halt(&mut self) -> Result<(), SwioError> {
        let active = Dmcontrol::default().set_dmactive(true);
        self.write_dmcontrol(active.set_haltreq(true))?;
        let halted = self.wait_for("halt", Dmstatus::allhalted);
        self.write_dmcontrol(active)?;

        // The hart may have changed any register while running
        self.cache.invalidate();

        halted?;
        debug!("OK:    Halted");
        Ok(())
    }

    /// Resume the hart from its DPC.
    pub fn resume(&mut self) -> Result<(), SwioError> {
        let active = Dmcontrol::default().set_dmactive(true);
        self.write_dmcontrol(active.set_resumereq(true))?;
        let status = self.swio.dmstatus()?;
        self.write_dmcontrol(active)?;
        self.cache.invalidate();

        if !status.allresumeack() && !status.allrunning() {
            warn!("Error: Hart did not resume, DMSTATUS {status}");
            return Err(SwioError::TargetInInvalidState);
        }
        debug!("OK:    Resumed");
        Ok(())
    }

    pub fn is_halted(&mut self) -> Result<bool, SwioError> {
        Ok(self.swio.dmstatus()?.allhalted())
    }

    /// Read the flash size and unique ID from the target's electronic
    /// signature.
    ///
    /// The target is reset and halted to read them, and then reset again to
    /// run.  On failure the target is left in an undefined state.
    pub fn get_chip_info(&mut self) -> Result<ChipInfo, SwioError> {
        self.reset(ResetKind::ToHalt)?;

        let flacap = self.get_mem_u32(Esig::FLACAP_ADDRESS)?;
        let mut uid = [0u32; 3];
        for (word, addr) in uid.iter_mut().zip(Esig::UNIID_ADDRESSES) {
            *word = self.get_mem_u32(addr)?;
        }

        self.reset(ResetKind::ToRunNoCheck)?;

        let info = ChipInfo::from_raw(flacap, uid);
        info!("OK:    {info}");
        Ok(info)
    }
}
