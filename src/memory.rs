// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Destination memory for `Load` ranges and raw images.

use crate::Error;

/// Where decoded payload bytes end up.
pub trait LoadMemory {
    /// Copies `data` to `address`. The loader may deliver one range in
    /// several pieces; each call covers the next contiguous span.
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error>;
}

impl<T: LoadMemory + ?Sized> LoadMemory for &mut T {
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        (**self).write(address, data)
    }
}

/// A half-open address range `[start, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MemoryRegion {
    pub start: u32,
    pub end: u32,
}

impl MemoryRegion {
    pub const fn new(start: u32, size: u32) -> Self {
        Self { start, end: start + size }
    }

    /// Whether `length` bytes at `address` lie entirely inside the region.
    pub fn contains(&self, address: u32, length: u32) -> bool {
        match address.checked_add(length) {
            Some(end) => address >= self.start && end <= self.end,
            None => false,
        }
    }
}

/// Which destinations an image may write.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MemoryMap {
    /// Any address named by an authenticated image is accepted.
    #[default]
    Unrestricted,
    /// Every write must land inside one of these regions.
    Regions(&'static [MemoryRegion]),
}

impl MemoryMap {
    pub fn check(&self, address: u32, length: u32) -> Result<(), Error> {
        match self {
            MemoryMap::Unrestricted => Ok(()),
            MemoryMap::Regions(regions) => {
                if regions.iter().any(|r| r.contains(address, length)) {
                    Ok(())
                } else {
                    error!("write of {} bytes at {:#x} outside memory map", length, address);
                    Err(Error::AddressNotAllowed { address, length })
                }
            }
        }
    }
}

/// Writes straight to the physical address space.
pub struct DirectMemory {
    _private: (),
}

impl DirectMemory {
    /// # Safety
    ///
    /// Every address an image can name (or that the configured
    /// [`MemoryMap`] lets through) must be writable and must not alias
    /// anything the running program relies on.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl LoadMemory for DirectMemory {
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        // Safety: upheld by the contract of `DirectMemory::new`.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                address as usize as *mut u8,
                data.len(),
            );
        }
        Ok(())
    }
}
