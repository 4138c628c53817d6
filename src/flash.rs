// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use embedded_storage::ReadStorage;

use crate::Error;

/// Bit 27 separates the XIP window from physical flash offsets.
const XIP_WINDOW_BIT: u32 = 1 << 27;

/// Reads flash by XIP address, honouring an active address remap.
pub struct XipFlash<'a, F> {
    storage: &'a mut F,
    remap_offset: u32,
}

impl<'a, F: ReadStorage> XipFlash<'a, F> {
    pub fn new(storage: &'a mut F, remap_offset: u32) -> Self {
        Self { storage, remap_offset }
    }

    /// Physical offset backing `address`.
    pub fn physical(&self, address: u32) -> u32 {
        address.wrapping_add(self.remap_offset) & !XIP_WINDOW_BIT
    }

    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        let offset = self.physical(address);
        self.storage.read(offset, buf).map_err(|_| {
            error!("flash read of {} bytes at {:#x} failed", buf.len(), offset);
            Error::Flash
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeFlash;

    #[test]
    fn remap_is_applied_before_masking() {
        let mut storage = FakeFlash::new(0x10_0000);
        let flash = XipFlash::new(&mut storage, 0);
        assert_eq!(flash.physical(0x0840_0000), 0x0040_0000);
        let flash = XipFlash::new(&mut storage, 0x0004_0000);
        assert_eq!(flash.physical(0x0840_0000), 0x0044_0000);
    }

    #[test]
    fn reads_go_to_the_physical_offset() {
        let mut storage = FakeFlash::new(0x1000);
        storage.place(0x100, &[1, 2, 3, 4]);
        let mut flash = XipFlash::new(&mut storage, 0);
        let mut buf = [0; 4];
        flash.read(0x0800_0100, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(flash.read(0x0800_2000, &mut buf), Err(Error::Flash));
    }
}
