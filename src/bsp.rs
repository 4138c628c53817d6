// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Board hooks for the firmware loader.
//!
//! The loader itself doesn't touch clocks, resets or power domains; it asks
//! the board through the `Bsp` trait below. To support a board, implement
//! `Bsp` for a type that owns whatever peripherals these hooks need and hand
//! it to [`crate::service::FirmwareLoader::new`].

use crate::romapi::ChipRevision;
use crate::Firmware;

/// Requirements placed upon a BSP type.
pub trait Bsp {
    /// Silicon revision, used to pick the ROM tables and root key hash.
    fn chip_revision(&self) -> ChipRevision;

    /// Offset the flash controller currently adds to XIP addresses. Zero
    /// when no remap is active, which is the default.
    fn flash_remap_offset(&self) -> u32 {
        0
    }

    /// Makes flash readable. Returns `true` if this call had to bring the
    /// controller up, in which case `flash_disable` is called when the load
    /// is over. Boards where flash is always up keep the default.
    fn flash_enable(&mut self) -> bool {
        false
    }

    fn flash_disable(&mut self) {}

    /// Clocks the crypto engine and its glitch detectors for the duration of
    /// an authenticated load. Same contract as `flash_enable`.
    fn crypto_enable(&mut self) -> bool {
        false
    }

    fn crypto_disable(&mut self) {}

    /// Powers up the CPU that will run `firmware`, held in reset.
    fn power_on(&mut self, firmware: Firmware);

    fn power_off(&mut self, firmware: Firmware);

    /// Releases the CPU running `firmware` from reset once its image is in
    /// place.
    fn reset_device(&mut self, firmware: Firmware);

    /// Whether `firmware` is up and has published its sync pattern.
    fn firmware_active(&self, firmware: Firmware) -> bool;

    fn delay_us(&mut self, us: u32);
}
