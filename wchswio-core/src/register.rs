// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Debug Module Register Access Traits
//!
//! These are used to ensure strongly typed access to reading and writing
//! debug module registers over SWIO, using
//!
//! * `wchswio::interface::SwioInterface::read_dm_register`
//! * `wchswio::interface::SwioInterface::write_dm_register`
//!
//! Unless you are adding support for further debug module registers, it is
//! unlikely that you will need to use these traits directly.

/// Base trait for all debug module register descriptors
pub trait RegisterDescriptor {
    /// 7-bit SWIO address of the register
    const ADDRESS: u8;

    /// Short name, used in logs
    const NAME: &'static str;

    type Value;
}

/// Registers that can be read
pub trait ReadableRegister: RegisterDescriptor {
    /// Convert raw 32-bit data to register value
    fn from_raw(data: u32) -> Self::Value
    where
        Self::Value: From<u32>,
    {
        Self::Value::from(data)
    }
}

/// Registers that can be written
pub trait WritableRegister: RegisterDescriptor {
    /// Convert register value to raw 32-bit data
    fn to_raw(value: Self::Value) -> u32
    where
        Self::Value: Into<u32>,
    {
        value.into()
    }
}

/// Declare a debug module register descriptor.
///
/// ```ignore
/// dm_register!(DmcontrolRegister, Dmcontrol, 0x10, "DMCONTROL", rw);
/// ```
#[macro_export]
macro_rules! dm_register {
    ($desc:ident, $value:ty, $addr:expr, $name:literal, r) => {
        $crate::dm_register!(@desc $desc, $value, $addr, $name);
        impl $crate::register::ReadableRegister for $desc {}
    };
    ($desc:ident, $value:ty, $addr:expr, $name:literal, w) => {
        $crate::dm_register!(@desc $desc, $value, $addr, $name);
        impl $crate::register::WritableRegister for $desc {}
    };
    ($desc:ident, $value:ty, $addr:expr, $name:literal, rw) => {
        $crate::dm_register!(@desc $desc, $value, $addr, $name);
        impl $crate::register::ReadableRegister for $desc {}
        impl $crate::register::WritableRegister for $desc {}
    };
    (@desc $desc:ident, $value:ty, $addr:expr, $name:literal) => {
        #[doc = concat!("`", $name, "` register descriptor")]
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $desc;

        impl $crate::register::RegisterDescriptor for $desc {
            const ADDRESS: u8 = $addr;
            const NAME: &'static str = $name;
            type Value = $value;
        }
    };
}

/// Generate the conversions for a register value newtype that can be read
/// (and possibly written).
#[macro_export]
macro_rules! register_data_rw {
    ($name:ident) => {
        impl From<$name> for u32 {
            fn from(value: $name) -> u32 {
                value.0
            }
        }

        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                $name(value)
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "0x{:08X}", self.0)
            }
        }
    };
}

/// Generate the conversions for a write-only register value newtype
#[macro_export]
macro_rules! register_data_w {
    ($name:ident) => {
        impl From<$name> for u32 {
            fn from(value: $name) -> u32 {
                value.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "0x{:08X}", self.0)
            }
        }
    };
}
