// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! WCH SWIO Wire Protocol Implementation
//!
//! This module implements the single wire SWIO protocol used by WCH QingKe
//! V2 debug modules.  It provides the [`SwioProtocol`] struct for individual
//! register frames, and the GPIO capability traits the protocol is driven
//! through.
//!
//! A frame is:
//!
//! ```text
//!  start | addr[6:0] | rw | data[31:0] (write only) | parity (write only)
//! ```
//!
//! all sent MSB first.  Every bit starts with the host pulling the line low.
//! A short low phase is a 1, a long low phase a 0.  On a read the host pulls
//! the line low briefly for each of the 32 data bits and the parity bit,
//! releases it, and the target either leaves it high (1) or holds it low for
//! a while (0).

use core::result::Result;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::SwioError;

#[doc(inline)]
pub use crate::debug::DebugInterface;
#[doc(inline)]
pub use crate::interface::SwioInterface;

// Header: 7 address bits and the read/write bit
const HEADER_BITS: usize = 8;

// Data bits in a frame
const DATA_BITS: usize = 32;

// Header, data and parity
const WRITE_FRAME_BITS: usize = HEADER_BITS + DATA_BITS + 1;

/// Highest valid debug module register address
pub const MAX_ADDRESS: u8 = 0x7F;

/// The GPIO operations [`SwioProtocol`] needs from the SWIO pin.
///
/// The pin must be able to switch between push-pull output and input.  The
/// target pulls SWIO high, but an external pull-up is normally fitted too.
pub trait SwioPin {
    fn set_high(&mut self);
    fn set_low(&mut self);

    /// Drive the pin.  The level last set is driven.
    fn set_output(&mut self);

    /// Stop driving the pin.
    fn set_input(&mut self);

    fn is_high(&mut self) -> bool;

    /// Busy-wait for approximately `cycles` host CPU cycles.  This must not
    /// yield: it is called inside a critical section.
    fn delay_cycles(&mut self, cycles: u32);
}

/// The target's NRST line.
pub trait ResetPin {
    /// `true` drives NRST low, `false` releases it.
    fn set_reset(&mut self, asserted: bool);
}

/// Stand-in for hardware without an NRST connection.  Resets then rely on
/// the debug module's hart reset alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResetPin;

impl ResetPin for NoResetPin {
    fn set_reset(&mut self, _asserted: bool) {}
}

/// Read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    const fn bit(&self) -> u8 {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }
}

/// SWIO bit timing, in host CPU cycles as counted by
/// [`SwioPin::delay_cycles()`].
///
/// The defaults suit a 160 MHz host talking to a 24 MHz or 48 MHz target.
/// Use [`Timing::scaled()`] for other host clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    /// Start bit low phase
    pub start_low: u32,

    /// Start bit high phase
    pub start_high: u32,

    /// Low phase of a 1 bit
    pub one_low: u32,

    /// Low phase of a 0 bit
    pub zero_low: u32,

    /// High phase after every written bit
    pub bit_high: u32,

    /// Low strobe that asks the target for the next read bit
    pub sample_low: u32,

    /// Wait between releasing the line and sampling it
    pub sample_wait: u32,

    /// How many times to poll for a 0 bit to end before concluding the
    /// target is holding the line low because it has reset
    pub release_polls: u32,
}

impl Timing {
    /// Host clock the defaults were measured at
    pub const DEFAULT_HOST_MHZ: u32 = 160;

    /// Defaults scaled for a host core running at `host_mhz`.  The poll
    /// budget is not scaled.
    pub fn scaled(host_mhz: u32) -> Self {
        let default = Self::default();
        let scale = |cycles: u32| -> u32 {
            let scaled = (cycles as u64 * host_mhz as u64) / Self::DEFAULT_HOST_MHZ as u64;
            (scaled as u32).max(1)
        };
        Self {
            start_low: scale(default.start_low),
            start_high: scale(default.start_high),
            one_low: scale(default.one_low),
            zero_low: scale(default.zero_low),
            bit_high: scale(default.bit_high),
            sample_low: scale(default.sample_low),
            sample_wait: scale(default.sample_wait),
            release_polls: default.release_polls,
        }
    }

    /// Checks the phases can be told apart: 1 shorter than 0, 0 shorter
    /// than the start bit.
    pub fn is_valid(&self) -> bool {
        self.one_low < self.zero_low && self.zero_low < self.start_low && self.release_polls > 0
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            start_low: 160,
            start_high: 40,
            one_low: 20,
            zero_low: 100,
            bit_high: 20,
            sample_low: 10,
            sample_wait: 20,
            release_polls: 1000,
        }
    }
}

/// SWIO Protocol object
///
/// This is used by [`SwioInterface`] to communicate with the target.  Most
/// applications should use [`DebugInterface`] (preferred) or
/// [`SwioInterface`] instead.
///
/// Create using `SwioProtocol::new()`, passing in something implementing
/// [`SwioPin`].  With the `esp32c3` feature, `crate::esp::EspSwioPin`
/// wraps an esp-hal GPIO.
#[derive(Debug)]
pub struct SwioProtocol<P: SwioPin> {
    pin: P,
    timing: Timing,
}

impl<P: SwioPin> SwioProtocol<P> {
    /// Create a new SWIO protocol instance, leaving the line driven high
    /// (idle).
    pub fn new(pin: P) -> Self {
        Self::with_timing(pin, Timing::default())
    }

    pub fn with_timing(mut pin: P, timing: Timing) -> Self {
        pin.set_high();
        pin.set_output();
        debug!("SWIO protocol created, line driven high");
        Self { pin, timing }
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn set_timing(&mut self, timing: Timing) {
        if !timing.is_valid() {
            warn!("Note:  SWIO timing {timing:?} may not be decodable");
        }
        self.timing = timing;
        debug!("SWIO timing set to {timing:?}");
    }

    /// Perform one complete frame.
    ///
    /// Arguments:
    /// - `address`: 7-bit debug module register address
    /// - `direction`: read or write
    /// - `data`: value to write, ignored on reads
    ///
    /// Returns:
    /// - `Ok(value)` with the value read, or `data` echoed on writes
    /// - `Err(SwioError::ParityError)` on a read parity mismatch
    /// - `Err(SwioError::ResetDetected)` if the target held the line low
    pub fn transmit(
        &mut self,
        address: u8,
        direction: Direction,
        data: u32,
    ) -> Result<u32, SwioError> {
        if address > MAX_ADDRESS {
            warn!("Error: SWIO address 0x{address:02X} out of range");
            return Err(SwioError::InvalidArgument);
        }

        let result = critical_section::with(|_| match direction {
            Direction::Write => {
                self.write_frame(address, data);
                Ok(data)
            }
            Direction::Read => self.read_frame(address),
        });

        match &result {
            Ok(value) => trace!("Value: SWIO {direction:?} 0x{address:02X} 0x{value:08X}"),
            Err(e) => debug!("Error: SWIO {direction:?} 0x{address:02X} {e}"),
        }
        result
    }

    fn write_frame(&mut self, address: u8, data: u32) {
        let header = header(address, Direction::Write);
        let parity = calculate_parity(header as u64 | ((data as u64) << HEADER_BITS));
        let frame = ((header as u64) << (DATA_BITS + 1)) | ((data as u64) << 1) | parity as u64;

        self.start_bit();
        self.write_bits(WRITE_FRAME_BITS, frame);
    }

    fn read_frame(&mut self, address: u8) -> Result<u32, SwioError> {
        let header = header(address, Direction::Read);

        self.start_bit();
        self.write_bits(HEADER_BITS, header as u64);

        let mut data = 0u32;
        for _ in 0..DATA_BITS {
            data = (data << 1) | self.read_bit()? as u32;
        }
        let parity = self.read_bit()?;

        if calculate_parity(header as u64 | ((data as u64) << HEADER_BITS)) != parity {
            debug!("SWIO read parity error: data=0x{data:08X}, parity={parity}");
            return Err(SwioError::ParityError);
        }

        Ok(data)
    }

    #[inline]
    fn start_bit(&mut self) {
        self.pin.set_output();
        self.pin.set_low();
        self.pin.delay_cycles(self.timing.start_low);
        self.pin.set_high();
        self.pin.delay_cycles(self.timing.start_high);
    }

    #[inline]
    fn write_bit(&mut self, bit: bool) {
        self.pin.set_low();
        if bit {
            self.pin.delay_cycles(self.timing.one_low);
        } else {
            self.pin.delay_cycles(self.timing.zero_low);
        }
        self.pin.set_high();
        self.pin.delay_cycles(self.timing.bit_high);
    }

    // MSB first
    #[inline]
    fn write_bits(&mut self, count: usize, data: u64) {
        for ii in (0..count).rev() {
            self.write_bit((data >> ii) & 1 == 1);
        }
    }

    #[inline]
    fn read_bit(&mut self) -> Result<bool, SwioError> {
        self.pin.set_low();
        self.pin.delay_cycles(self.timing.sample_low);
        self.pin.set_input();
        self.pin.delay_cycles(self.timing.sample_wait);

        let bit = self.pin.is_high();
        if !bit {
            // The target is signalling 0.  Wait for it to let go.
            let mut polls = 0;
            while !self.pin.is_high() {
                polls += 1;
                if polls >= self.timing.release_polls {
                    self.pin.set_high();
                    self.pin.set_output();
                    return Err(SwioError::ResetDetected);
                }
            }
        }

        self.pin.set_high();
        self.pin.set_output();
        Ok(bit)
    }

    #[cfg(test)]
    pub(crate) fn pin_mut(&mut self) -> &mut P {
        &mut self.pin
    }
}

#[inline]
const fn header(address: u8, direction: Direction) -> u8 {
    ((address & MAX_ADDRESS) << 1) | direction.bit()
}

/// Calculate SWIO parity - 1 for an odd number of bits set to 1, 0
/// otherwise.  Covers the address, the rw bit and the data.
pub(crate) fn calculate_parity<T>(value: T) -> bool
where
    T: Into<u64>,
{
    (value.into().count_ones() % 2) == 1
}
