// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! WCH SWIO Interface
//!
//! This module implements typed debug module register access over SWIO.  It
//! provides `SwioInterface` for performing individual register operations,
//! pulsing the target's NRST line and running the link initialization
//! handshake.

use embassy_time::{Duration, block_for};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use wchswio_core::command::AccessRegister;
use wchswio_core::dm::{
    Abstractauto, AbstractautoRegister, Abstractcs, AbstractcsRegister, Cfgr, CfgrRegister,
    CommandRegister, Cpbr, CpbrRegister, Data, Data0Register, Data1Register, Dmcontrol,
    DmcontrolRegister, Dmstatus, DmstatusRegister, ShdwcfgrRegister, progbuf_address,
};
use wchswio_core::register::{ReadableRegister, WritableRegister};

use crate::SwioError;
use crate::protocol::{Direction, ResetPin, SwioPin, SwioProtocol, Timing};

#[doc(inline)]
pub use crate::debug::DebugInterface;

/// SWIO Interface object
///
/// This is used by [`DebugInterface`] to perform individual debug module
/// register operations on the target.  Most applications will prefer to use
/// [`DebugInterface`], which provides the abstract command engine, resets
/// and flash programming.
///
/// Create using `SwioInterface::new()` passing in a [`SwioProtocol`]
/// instance and the NRST pin (or [`crate::protocol::NoResetPin`]).
///
/// ```rust,ignore
/// use wchswio::SwioInterface;
/// use wchswio::esp::{EspSwioPin, EspResetPin};
///
/// let peripherals = esp_hal::init(config);
/// let swio = EspSwioPin::new(peripherals.GPIO0);
/// let nrst = EspResetPin::new(peripherals.GPIO1);
/// let mut swio_if = SwioInterface::from_pins(swio, nrst);
///
/// let cpbr = swio_if.initialize()?;
/// esp_println::println!("CPBR: {cpbr}");
/// ```
#[derive(Debug)]
pub struct SwioInterface<P: SwioPin, R: ResetPin> {
    protocol: SwioProtocol<P>,
    reset: R,
    cpbr: Option<Cpbr>,
}

impl<P: SwioPin, R: ResetPin> SwioInterface<P, R> {
    /// Creates a new SWIO interface using the given [`SwioProtocol`]
    /// instance.
    ///
    /// Arguments:
    /// - `protocol`: The [`SwioProtocol`] instance to use.
    /// - `reset`: The target's NRST line.
    ///
    /// Returns:
    /// - A new [`SwioInterface`] instance, not yet initialized.
    pub fn new(protocol: SwioProtocol<P>, mut reset: R) -> Self {
        reset.set_reset(false);
        Self {
            protocol,
            reset,
            cpbr: None,
        }
    }

    /// Creates a new SWIO interface from the given pins, with default
    /// [`Timing`].
    pub fn from_pins(swio: P, reset: R) -> Self {
        Self::new(SwioProtocol::new(swio), reset)
    }

    /// Sets the bit timing.  Can be changed at any time.  For example, if
    /// [`Self::initialize()`] fails, retry with [`Timing::scaled()`] for a
    /// lower effective speed.
    pub fn set_timing(&mut self, timing: Timing) {
        self.protocol.set_timing(timing);
    }

    pub fn timing(&self) -> Timing {
        self.protocol.timing()
    }

    /// Returns whether the initialization handshake has succeeded since the
    /// last reset pulse.
    pub fn is_attached(&self) -> bool {
        self.cpbr.is_some()
    }

    /// The CPBR value read by the last successful initialization
    pub fn cpbr(&self) -> Option<Cpbr> {
        self.cpbr
    }

    /// Pulse NRST low.
    ///
    /// Arguments:
    /// - `low`: how long to hold NRST low
    /// - `settle`: how long to wait after releasing it
    pub fn pulse_reset(&mut self, low: Duration, settle: Duration) {
        debug!("Exec:  NRST pulse {}us", low.as_micros());
        self.cpbr = None;
        self.reset.set_reset(true);
        block_for(low);
        self.reset.set_reset(false);
        block_for(settle);
    }

    /// Runs the SWIO link initialization handshake.
    ///
    /// Writes the output enable key to SHDWCFGR and CFGR, then checks the
    /// protocol version in CPBR.
    ///
    /// Returns:
    /// - `Ok(Cpbr)` if the target speaks a supported protocol version.
    /// - `Err(SwioError::TargetNotKnown(cpbr))` if it does not.
    /// - `Err(SwioError)` on a transport error.
    pub fn initialize(&mut self) -> Result<Cpbr, SwioError> {
        self.cpbr = None;

        self.write_dm_register(ShdwcfgrRegister, Cfgr::enable_output())?;
        self.write_dm_register(CfgrRegister, Cfgr::enable_output())?;
        let cpbr = self.read_dm_register(CpbrRegister)?;

        if !cpbr.is_supported() {
            warn!(
                "Error: Unsupported SWIO version {} CPBR {cpbr}",
                cpbr.version()
            );
            return Err(SwioError::TargetNotKnown(cpbr.into()));
        }

        debug!("OK:    SWIO initialized, CPBR {cpbr}");
        self.cpbr = Some(cpbr);
        Ok(cpbr)
    }

    /// Read a debug module register.
    ///
    /// Arguments:
    /// - `reg`: The register to read, which must implement the
    ///   `ReadableRegister` trait.
    ///
    /// Returns:
    /// - `Ok(value)` if the register was read successfully.
    /// - `Err(SwioError)` if there was an error reading the register.
    ///
    /// ```rust,ignore
    /// use wchswio_core::dm::DmstatusRegister;
    /// let status = swio_if.read_dm_register(DmstatusRegister)?;
    /// esp_println::println!("DMSTATUS: {status}");
    /// ```
    pub fn read_dm_register<Reg>(&mut self, _reg: Reg) -> Result<Reg::Value, SwioError>
    where
        Reg: ReadableRegister,
        Reg::Value: From<u32>,
    {
        let raw = self.protocol.transmit(Reg::ADDRESS, Direction::Read, 0)?;
        trace!("Value: {} 0x{raw:08X}", Reg::NAME);
        Ok(Reg::from_raw(raw))
    }

    /// Write a debug module register.
    ///
    /// Arguments:
    /// - `reg`: The register to write, which must implement the
    ///   `WritableRegister` trait.
    /// - `value`: The value to write
    ///
    /// Returns:
    /// - `Ok(())` if the register was written successfully.
    /// - `Err(SwioError)` if there was an error writing the register.
    pub fn write_dm_register<Reg>(&mut self, _reg: Reg, value: Reg::Value) -> Result<(), SwioError>
    where
        Reg: WritableRegister,
        Reg::Value: Into<u32>,
    {
        let raw = Reg::to_raw(value);
        trace!("Exec:  {} <- 0x{raw:08X}", Reg::NAME);
        self.protocol
            .transmit(Reg::ADDRESS, Direction::Write, raw)
            .map(|_| ())
    }

    /// Read a debug module register by raw address.  Use with caution.
    pub fn read_dm_register_raw(&mut self, address: u8) -> Result<u32, SwioError> {
        self.protocol.transmit(address, Direction::Read, 0)
    }

    /// Write a debug module register by raw address.  Use with caution.
    /// Writes to DMCONTROL, COMMAND and PROGBUF bypass
    /// [`DebugInterface`]'s caches.
    pub fn write_dm_register_raw(&mut self, address: u8, value: u32) -> Result<(), SwioError> {
        self.protocol
            .transmit(address, Direction::Write, value)
            .map(|_| ())
    }

    pub fn set_dmcontrol(&mut self, value: Dmcontrol) -> Result<(), SwioError> {
        self.write_dm_register(DmcontrolRegister, value)
    }

    pub fn dmstatus(&mut self) -> Result<Dmstatus, SwioError> {
        self.read_dm_register(DmstatusRegister)
    }

    pub fn data0(&mut self) -> Result<u32, SwioError> {
        self.read_dm_register(Data0Register).map(u32::from)
    }

    pub fn set_data0(&mut self, value: u32) -> Result<(), SwioError> {
        self.write_dm_register(Data0Register, Data(value))
    }

    pub fn data1(&mut self) -> Result<u32, SwioError> {
        self.read_dm_register(Data1Register).map(u32::from)
    }

    pub fn set_data1(&mut self, value: u32) -> Result<(), SwioError> {
        self.write_dm_register(Data1Register, Data(value))
    }

    pub fn set_command(&mut self, command: AccessRegister) -> Result<(), SwioError> {
        self.write_dm_register(CommandRegister, command)
    }

    pub fn abstractcs(&mut self) -> Result<Abstractcs, SwioError> {
        self.read_dm_register(AbstractcsRegister)
    }

    /// Clear ABSTRACTCS.CMDERR
    pub fn clear_cmderr(&mut self) -> Result<(), SwioError> {
        self.write_dm_register(AbstractcsRegister, Abstractcs::clear_cmderr())
    }

    pub fn set_abstractauto(&mut self, value: Abstractauto) -> Result<(), SwioError> {
        self.write_dm_register(AbstractautoRegister, value)
    }

    /// Write program buffer word `index` (0-7)
    pub fn set_progbuf(&mut self, index: usize, value: u32) -> Result<(), SwioError> {
        let address = progbuf_address(index).ok_or(SwioError::InvalidArgument)?;
        self.write_dm_register_raw(address, value)
    }

    /// Read back program buffer word `index` (0-7)
    pub fn progbuf(&mut self, index: usize) -> Result<u32, SwioError> {
        let address = progbuf_address(index).ok_or(SwioError::InvalidArgument)?;
        self.read_dm_register_raw(address)
    }
}
