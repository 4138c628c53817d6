// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Secure firmware loader for the radio coprocessors.
//!
//! The core is [`LoaderContext`], a resumable SB3.1 image parser: feed it an
//! image in chunks of any size and it authenticates the manifest, has each
//! block decrypted, and copies the `Load` ranges into memory until it reaches
//! an `Execute` range. Authentication and decryption are delegated to an
//! [`nboot::Nboot`] implementation, normally the boot ROM ([`romapi`]).
//!
//! [`service::FirmwareLoader`] wraps that in the flow a host CPU runs to
//! bring up a radio: pick a partition, check anti-rollback fuses, stream the
//! image from flash, and release the radio from reset.

#![cfg_attr(not(test), no_std)]

// Must come first so the logging macros are visible to every module.
#[macro_use]
mod fmt;

pub mod bsp;
mod decode;
pub mod error;
pub mod flash;
pub mod loader;
pub mod memory;
pub mod nboot;
pub mod raw;
pub mod romapi;
pub mod sb3;
pub mod service;
pub mod trust;

#[cfg(test)]
mod testutil;

pub use error::{Error, PumpStatus, StatusCode};
pub use loader::{LoaderConfig, LoaderContext};
pub use service::{FirmwareLoader, LoadTarget, ServiceConfig};

/// One of the two flash partitions a firmware may live in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotId {
    A,
    B,
}

/// Radio firmware images the loader knows how to place.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Firmware {
    Wifi,
    Ble,
    Ieee802154,
}
