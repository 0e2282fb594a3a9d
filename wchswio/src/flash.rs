// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! CH32V flash programming
//!
//! Erase and write support for CH32V003 style flash controllers, implemented
//! on [`DebugInterface`] by running programs from the debug module's program
//! buffer.  The target must be halted before any of these operations.
//!
//! No operation rolls back on failure.  If an erase or write fails, reset the
//! target, then erase and write again.

use embassy_time::Instant;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use wchswio_core::ch32::{
    CH32_FLASH_BASE, FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE, FlashAddr, FlashCtlr, FlashKeyr,
    FlashMkeyr, FlashStatr,
};
use wchswio_core::dm::Abstractauto;
use wchswio_core::rv::{Gpr, PROGRAM_FLASH_COMMAND, WRITE_FLASH};
use wchswio_core::WORD_BYTES;

use crate::SwioError;
use crate::debug::{DebugInterface, ResetKind};
use crate::protocol::{ResetPin, SwioPin};

/// Written to the remainder of the last page when the data does not fill it
pub const FLASH_PAD: u32 = 0xDEAD_BEEF;

const PAGE_WORDS: usize = (FLASH_PAGE_SIZE / WORD_BYTES) as usize;

impl<P: SwioPin, R: ResetPin> DebugInterface<P, R> {
    fn flash_ctlr(&mut self) -> Result<u32, SwioError> {
        self.get_mem_u32(FlashCtlr::ADDRESS)
    }

    fn flash_statr(&mut self) -> Result<FlashStatr, SwioError> {
        self.get_mem_u32(FlashStatr::ADDRESS).map(FlashStatr::from)
    }

    /// Unlock the flash controller, for both standard and fast operations.
    ///
    /// Returns:
    /// - `Ok(())` if CTLR.LOCK and CTLR.FLOCK both cleared.
    /// - `Err(SwioError::TargetInInvalidState)` if either is still set.
    pub fn unlock(&mut self) -> Result<(), SwioError> {
        self.set_mem_u32(FlashKeyr::ADDRESS, FlashKeyr::KEY1)?;
        self.set_mem_u32(FlashKeyr::ADDRESS, FlashKeyr::KEY2)?;
        self.set_mem_u32(FlashMkeyr::ADDRESS, FlashKeyr::KEY1)?;
        self.set_mem_u32(FlashMkeyr::ADDRESS, FlashKeyr::KEY2)?;

        let ctlr = self.flash_ctlr()?;
        if ctlr & (FlashCtlr::LOCK | FlashCtlr::FLOCK) != 0 {
            warn!("Error: Flash still locked, CTLR 0x{ctlr:08X}");
            return Err(SwioError::TargetInInvalidState);
        }
        debug!("OK:    Flash unlocked");
        Ok(())
    }

    /// Lock the flash controller.
    pub fn lock(&mut self) -> Result<(), SwioError> {
        let locks = FlashCtlr::LOCK | FlashCtlr::FLOCK;
        let ctlr = self.flash_ctlr()?;
        self.set_mem_u32(FlashCtlr::ADDRESS, (ctlr & !FlashCtlr::STRT) | locks)?;

        let ctlr = self.flash_ctlr()?;
        if ctlr & locks != locks {
            warn!("Error: Flash did not lock, CTLR 0x{ctlr:08X}");
            return Err(SwioError::TargetInInvalidState);
        }
        debug!("OK:    Flash locked");
        Ok(())
    }

    /// Erase the 64 byte page at `addr`, which must be page aligned.
    pub fn wipe_page(&mut self, addr: u32) -> Result<(), SwioError> {
        Self::check_flash_aligned(addr, FLASH_PAGE_SIZE)?;
        self.flash_command(FlashCtlr::FTER, Some(addr))
    }

    /// Erase the 1KB sector at `addr`, which must be sector aligned.
    pub fn wipe_sector(&mut self, addr: u32) -> Result<(), SwioError> {
        Self::check_flash_aligned(addr, FLASH_SECTOR_SIZE)?;
        self.flash_command(FlashCtlr::PER, Some(addr))
    }

    /// Erase the whole of flash.
    pub fn wipe_chip(&mut self) -> Result<(), SwioError> {
        self.flash_command(FlashCtlr::MER, None)
    }

    fn check_flash_aligned(addr: u32, size: u32) -> Result<(), SwioError> {
        if addr < CH32_FLASH_BASE || addr % size != 0 {
            warn!("Error: Flash address 0x{addr:08X} not aligned to {size}");
            return Err(SwioError::InvalidArgument);
        }
        Ok(())
    }

    fn flash_command(&mut self, bits: u32, addr: Option<u32>) -> Result<(), SwioError> {
        self.unlock()?;
        if let Some(addr) = addr {
            self.set_mem_u32(FlashAddr::ADDRESS, addr)?;
        }

        debug!("Exec:  Flash command 0x{bits:08X}");
        self.load_program(&PROGRAM_FLASH_COMMAND)?;
        self.set_gpr(Gpr::A2, FlashStatr::ADDRESS)?;
        self.set_gpr(Gpr::A3, bits)?;
        self.set_gpr(Gpr::A4, bits | FlashCtlr::STRT)?;
        let timeout = self.program_timeout();
        self.run_prog(timeout)?;

        self.set_mem_u32(FlashCtlr::ADDRESS, 0)?;
        self.finish_flash_operation()
    }

    // Clears EOP and checks for a write protection error
    fn finish_flash_operation(&mut self) -> Result<(), SwioError> {
        let statr = self.flash_statr()?;
        self.set_mem_u32(FlashStatr::ADDRESS, u32::from(statr) | FlashStatr::EOP)?;
        if statr.write_protect_error() {
            warn!("Error: Flash write protected, STATR {statr}");
            return Err(SwioError::TargetInInvalidState);
        }
        Ok(())
    }

    fn wait_flash_eop(&mut self) -> Result<(), SwioError> {
        let start = Instant::now();
        let timeout = self.program_timeout();
        loop {
            let statr = self.flash_statr()?;
            if statr.end_of_operation() {
                return Ok(());
            }
            if start.elapsed() > timeout {
                warn!("Error: Timed out waiting for flash, STATR {statr}");
                return Err(SwioError::Timeout);
            }
        }
    }

    /// Write `data` to flash at `dst` using fast page programming.
    ///
    /// The destination must already be erased.  If `data` does not end on a
    /// page boundary the rest of the last page is filled with [`FLASH_PAD`].
    /// The target is reset to run the new firmware once written.
    ///
    /// Arguments:
    /// - `dst`: destination address, 64 byte page aligned
    /// - `data`: bytes to write, a non-zero multiple of 4 long
    ///
    /// Returns:
    /// - `Ok(())` on success.
    /// - `Err(SwioError::InvalidArgument)` if `dst` or `data` is misaligned.
    /// - `Err(SwioError::TargetInInvalidState)` if flash could not be unlocked
    ///   or is write protected.
    pub fn write_flash(&mut self, dst: u32, data: &[u8]) -> Result<(), SwioError> {
        if data.is_empty() || data.len() % WORD_BYTES as usize != 0 {
            warn!("Error: Flash write size {} invalid", data.len());
            return Err(SwioError::InvalidArgument);
        }
        Self::check_flash_aligned(dst, FLASH_PAGE_SIZE)?;
        let len = u32::try_from(data.len()).map_err(|_| SwioError::InvalidArgument)?;
        if dst.checked_add(len).is_none() {
            return Err(SwioError::InvalidArgument);
        }

        let pages = data.len().div_ceil(FLASH_PAGE_SIZE as usize);
        debug!("Exec:  Write {} bytes ({pages} pages) to 0x{dst:08X}", data.len());

        self.unlock()?;
        self.set_mem_u32(FlashAddr::ADDRESS, dst)?;
        self.set_mem_u32(FlashCtlr::ADDRESS, FlashCtlr::FTPG | FlashCtlr::BUFRST)?;
        self.wait_flash_eop()?;

        self.load_program(&WRITE_FLASH)?;
        self.set_gpr(Gpr::A1, dst)?;
        self.set_gpr(Gpr::A2, FlashStatr::ADDRESS)?;
        self.set_gpr(Gpr::A3, FlashCtlr::FTPG | FlashCtlr::BUFLOAD)?;
        self.set_gpr(Gpr::A4, FlashCtlr::FTPG | FlashCtlr::STRT)?;
        self.set_gpr(Gpr::A5, FlashCtlr::FTPG | FlashCtlr::BUFRST)?;

        let result = self.stream_flash_words(dst, data, pages * PAGE_WORDS);
        if result.is_err() {
            if let Err(e2) = self.swio_if().set_abstractauto(Abstractauto::off()) {
                warn!("Error: Failed to disable ABSTRACTAUTO: {e2}");
            }
        }
        result?;

        self.set_mem_u32(FlashCtlr::ADDRESS, 0)?;
        self.finish_flash_operation()?;
        info!("OK:    Wrote {} bytes to 0x{dst:08X}", data.len());

        self.reset(ResetKind::ToRunNoCheck)
    }

    // The first word is run with an explicit command, as the target ignores
    // ABSTRACTAUTO until COMMAND has been written.  Subsequent words run the
    // program by writing DATA0, except the last.
    fn stream_flash_words(&mut self, dst: u32, data: &[u8], count: usize) -> Result<(), SwioError> {
        let timeout = self.program_timeout();
        let words = data
            .chunks_exact(WORD_BYTES as usize)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .chain(core::iter::repeat(FLASH_PAD))
            .take(count);

        for (ii, word) in words.enumerate() {
            let last = ii == count - 1;
            if ii == 0 {
                self.swio_if().set_data0(word)?;
                self.run_prog(timeout)?;
                if !last {
                    self.swio_if().set_abstractauto(Abstractauto::data0())?;
                }
            } else if last {
                self.swio_if().set_abstractauto(Abstractauto::off())?;
                self.swio_if().set_data0(word)?;
                self.run_prog(timeout)?;
            } else {
                self.swio_if().set_data0(word)?;
                if (ii + 1) % PAGE_WORDS == 0 {
                    self.await_prog(timeout)?;
                }
            }

            if (ii + 1) % PAGE_WORDS == 0 {
                let page = dst + ((ii / PAGE_WORDS) as u32 * FLASH_PAGE_SIZE);
                trace!("OK:    Page 0x{page:08X} written");
            }
        }
        Ok(())
    }
}
