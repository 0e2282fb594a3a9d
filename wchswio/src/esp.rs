// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! ESP32-C3 pin bindings
//!
//! Implements [`SwioPin`] and [`ResetPin`] over `esp-hal` GPIOs.
//!
//! ```rust,ignore
//! use wchswio::DebugInterface;
//! use wchswio::esp::{EspResetPin, EspSwioPin};
//!
//! let peripherals = esp_hal::init(config);
//! let swio = EspSwioPin::new(peripherals.GPIO0);
//! let nrst = EspResetPin::new(peripherals.GPIO1);
//! let mut debug_if = DebugInterface::from_pins(swio, nrst);
//! debug_if.init()?;
//! ```

use esp_hal::gpio::{
    DriveMode, DriveStrength, Flex, InputConfig, InputPin, Level, Output, OutputConfig,
    OutputPin, Pull,
};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::protocol::{ResetPin, SwioPin};

/// SWIO line on a bidirectional GPIO.
///
/// The line idles as an input with the pull-up enabled, so the target sees
/// it high between frames.
#[derive(Debug)]
pub struct EspSwioPin<'a> {
    pin: Flex<'a>,
}

impl<'a> EspSwioPin<'a> {
    pub fn new(pin: impl InputPin + OutputPin + 'a) -> Self {
        let mut pin = Flex::new(pin);
        pin.apply_input_config(&InputConfig::default().with_pull(Pull::Up));
        pin.apply_output_config(
            &OutputConfig::default()
                .with_drive_strength(DriveStrength::_20mA)
                .with_drive_mode(DriveMode::PushPull)
                .with_pull(Pull::Up),
        );
        pin.set_high();
        pin.set_output_enable(false);
        pin.set_input_enable(true);

        debug!("SWIO pin created, input with pull-up");

        Self { pin }
    }
}

impl SwioPin for EspSwioPin<'_> {
    #[inline]
    fn set_high(&mut self) {
        self.pin.set_high();
    }

    #[inline]
    fn set_low(&mut self) {
        self.pin.set_low();
    }

    #[inline]
    fn set_output(&mut self) {
        self.pin.set_output_enable(true);
    }

    #[inline]
    fn set_input(&mut self) {
        self.pin.set_output_enable(false);
    }

    #[inline]
    fn is_high(&mut self) -> bool {
        self.pin.is_high()
    }

    #[inline]
    fn delay_cycles(&mut self, cycles: u32) {
        riscv::asm::delay(cycles);
    }
}

/// Target NRST on an output GPIO, released (high) when created.
#[derive(Debug)]
pub struct EspResetPin<'a> {
    pin: Output<'a>,
}

impl<'a> EspResetPin<'a> {
    pub fn new(pin: impl OutputPin + 'a) -> Self {
        let config = OutputConfig::default().with_drive_mode(DriveMode::PushPull);
        Self {
            pin: Output::new(pin, Level::High, config),
        }
    }
}

impl ResetPin for EspResetPin<'_> {
    fn set_reset(&mut self, asserted: bool) {
        if asserted {
            self.pin.set_low();
        } else {
            self.pin.set_high();
        }
    }
}
