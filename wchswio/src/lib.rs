// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! wchswio library
//!
//! WCH single wire (SWIO) debug implementation for CH32V microcontrollers
//! built around the QingKe V2 RISC-V core.
//!
//! This can be used to halt, inspect, erase and program CH32V targets from
//! another microcontroller, by bit-banging the SWIO debug line from a GPIO.
//!
//! It is `no_std`, fully synchronous, and uses
//! [`embassy-time`](https://embassy.dev/) for delays and timeouts.  It
//! requires an `alloc` implementation for block reads.  With the `esp32c3`
//! feature it provides GPIO bindings for
//! [`esp-hal`](https://docs.espressif.com/projects/rust/).
//!
//! The following diagram shows the key `wchswio` concepts.
//!
//! ```text
//!   Application          |  bin::Api  ==  any embedded_io stream  == Host
//! ----------------------
//!     DebugInterface      \    programs, GPR cache, reset, flash
//! ----------------------   \
//!      SwioInterface        |--  SwioError
//! ----------------------   /
//!      SwioProtocol        /                            CH32V003 etc
//! ----------------------                            -----------------
//!      GPIO pin(s)       >======================<      QingKe V2 DM
//!                            SWIO (+ optional NRST)
//! ```
//!
//! * [`DebugInterface`] provides the abstract command engine, the reset
//!   sequencer, chip information and flash programming.
//! * [`SwioInterface`] provides typed access to individual debug module
//!   registers, plus target reset and link initialization.
//! * [`SwioProtocol`] implements the SWIO wire protocol through
//!   bit-banging.
//!
//! Also included is a server-side binary API implementation [`bin::Api`]
//! speaking the protocol defined in the `wchswio-bin` crate.
//!
//! `wchswio` is designed to be used alongside the [`wchswio_core`] library,
//! which provides the debug module, program buffer and CH32V definitions.

#![cfg_attr(not(test), no_std)]

pub mod bin;
pub mod debug;
#[cfg(feature = "esp32c3")]
pub mod esp;
pub mod flash;
pub mod interface;
pub mod protocol;

#[cfg(test)]
mod sim;

#[doc(inline)]
pub use crate::debug::DebugInterface;
#[doc(inline)]
pub use crate::interface::SwioInterface;
#[doc(inline)]
pub use crate::protocol::SwioProtocol;

extern crate alloc;
use alloc::format;
use core::fmt;
use serde::Serialize;
use wchswio_core::command::CmdErr;

/// Core error type used by all wchswio objects
///
/// No operation retries or recovers implicitly.  Methods are provided to
/// classify an error:
///
/// - [`SwioError::requires_reset()`]
/// - [`SwioError::is_misuse()`]
/// - [`SwioError::requires_other()`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwioError {
    /// An operation did not complete within its time budget.  The debug
    /// module may be left mid-sequence, so a reset is usually required
    /// before the next operation.
    Timeout,

    /// The target held SWIO low for longer than any valid bit while we were
    /// reading.  This means the target reset itself mid-transfer.
    ResetDetected,

    /// A parity error was detected while reading from the target.  The data
    /// cannot be trusted.  Many parity errors suggest the [`protocol::Timing`]
    /// is too aggressive for the wiring or target clock.
    ParityError,

    /// The target reported an SWIO protocol version this crate does not
    /// support.  The raw CPBR value is included.
    TargetNotKnown(u32),

    /// A post-condition check failed, for example flash lock bits did not
    /// clear, or the hart did not halt when asked.
    TargetInInvalidState,

    /// A program run with a zero timeout was still executing when checked.
    ProgramNotFinishedYet,

    /// The debug module reported an error executing an abstract command.
    ProgramRunError(CmdErr),

    /// A program was loaded which would clobber registers whose only copy
    /// is on the device.  The mask of those registers is included.  This is
    /// a caller sequencing bug.
    DirtyRegs(u32),

    /// An argument was out of range or misaligned.
    InvalidArgument,

    /// Allocation failed.
    NoFreeMemory,
}

impl SwioError {
    /// Returns true if the target should be reset with
    /// [`DebugInterface::reset()`] before the next operation.
    pub fn requires_reset(&self) -> bool {
        matches!(
            self,
            SwioError::Timeout
                | SwioError::ResetDetected
                | SwioError::ParityError
                | SwioError::TargetInInvalidState
                | SwioError::ProgramNotFinishedYet
                | SwioError::ProgramRunError(_)
        )
    }

    /// Returns true if the error was caused by calling the API incorrectly.
    /// Retrying the same call will fail the same way.
    pub fn is_misuse(&self) -> bool {
        matches!(self, SwioError::DirtyRegs(_) | SwioError::InvalidArgument)
    }

    /// Returns true if neither a reset nor fixing the call will help.  The
    /// target is unsupported or the host is out of resources.
    pub fn requires_other(&self) -> bool {
        !self.requires_reset() && !self.is_misuse()
    }

    /// Returns a string representation of the error.
    pub fn as_str(&self) -> &'static str {
        match self {
            SwioError::Timeout => "Timeout",
            SwioError::ResetDetected => "Reset Detected",
            SwioError::ParityError => "Parity Error",
            SwioError::TargetNotKnown(_) => "Target Not Known",
            SwioError::TargetInInvalidState => "Target In Invalid State",
            SwioError::ProgramNotFinishedYet => "Program Not Finished Yet",
            SwioError::ProgramRunError(_) => "Program Run Error",
            SwioError::DirtyRegs(_) => "Dirty Registers",
            SwioError::InvalidArgument => "Invalid Argument",
            SwioError::NoFreeMemory => "No Free Memory",
        }
    }
}

impl Serialize for SwioError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("SwioError", 2)?;

        let kind = match self {
            SwioError::Timeout => "timeout",
            SwioError::ResetDetected => "reset detected",
            SwioError::ParityError => "parity",
            SwioError::TargetNotKnown(_) => "target not known",
            SwioError::TargetInInvalidState => "target invalid state",
            SwioError::ProgramNotFinishedYet => "program not finished",
            SwioError::ProgramRunError(_) => "program run error",
            SwioError::DirtyRegs(_) => "dirty regs",
            SwioError::InvalidArgument => "invalid argument",
            SwioError::NoFreeMemory => "no free memory",
        };
        state.serialize_field("kind", kind)?;

        let detail = match self {
            SwioError::TargetNotKnown(cpbr) => format!("0x{cpbr:08X}"),
            SwioError::ProgramRunError(err) => format!("{err}"),
            SwioError::DirtyRegs(mask) => format!("0x{mask:08X}"),
            _ => alloc::string::String::new(),
        };
        state.serialize_field("detail", &detail)?;
        state.end()
    }
}

impl fmt::Display for SwioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwioError::TargetNotKnown(cpbr) => write!(f, "{}: CPBR 0x{cpbr:08X}", self.as_str()),
            SwioError::ProgramRunError(err) => write!(f, "{}: {err}", self.as_str()),
            SwioError::DirtyRegs(mask) => write!(f, "{}: 0x{mask:08X}", self.as_str()),
            _ => write!(f, "{}", self.as_str()),
        }
    }
}
