// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Unsigned legacy images: a list of (destination, size) records each
//! followed by its payload, closed by a terminator record.

use core::cmp::min;
use core::mem::size_of;
use embedded_storage::ReadStorage;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes};

use crate::flash::XipFlash;
use crate::memory::{LoadMemory, MemoryMap};
use crate::Error;

/// `"bwar"` read as a little-endian word.
pub const RAW_BINARY_MAGIC: u32 = 0x7261_7762;
/// Destination of the record that ends an image.
pub const RAW_TERMINATOR: u32 = 0xffff_ffff;
/// `"lldv"`: sub-format of a VDLL record, which is a whole image by itself.
#[cfg(feature = "vdll")]
pub const RAW_VDLL_FORMAT: u32 = 0x7664_6c6c;

const STAGING_SIZE: usize = 256;

#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct RawDescriptor {
    pub format: U32<LittleEndian>,
    /// Unused by the loader.
    pub sub_format: U32<LittleEndian>,
    pub destination: U32<LittleEndian>,
    /// Payload bytes that follow; in the terminator, the total of all
    /// payloads.
    pub size: U32<LittleEndian>,
}

pub const RAW_DESCRIPTOR_SIZE: usize = size_of::<RawDescriptor>();
const_assert_eq!(RAW_DESCRIPTOR_SIZE, 16);

/// Outcome of a raw load.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RawLoad {
    /// Payload bytes copied.
    pub loaded: u32,
    /// Flash address just past the last record read.
    pub end: u32,
}

/// Copies a raw image starting at `address` into memory. The image may not
/// extend past `address + limit`.
pub fn load_raw_image<F, M>(
    flash: &mut XipFlash<'_, F>,
    memory: &mut M,
    memory_map: &MemoryMap,
    address: u32,
    limit: u32,
) -> Result<RawLoad, Error>
where
    F: ReadStorage,
    M: LoadMemory,
{
    let end = address.checked_add(limit).ok_or(Error::EofReached)?;
    let mut cursor = address;
    let mut total: u32 = 0;
    let mut staging = [0u8; STAGING_SIZE];

    loop {
        if end - cursor < RAW_DESCRIPTOR_SIZE as u32 {
            error!("raw image runs past its partition");
            return Err(Error::EofReached);
        }
        let mut descriptor = RawDescriptor::default();
        flash.read(cursor, descriptor.as_bytes_mut())?;
        cursor += RAW_DESCRIPTOR_SIZE as u32;

        if descriptor.format.get() != RAW_BINARY_MAGIC {
            error!("bad raw record format {:#x}", descriptor.format.get());
            return Err(Error::BadRawImage);
        }

        let destination = descriptor.destination.get();
        let size = descriptor.size.get();
        if destination == RAW_TERMINATOR {
            if size != total {
                error!("raw image declares {} bytes, loaded {}", size, total);
                return Err(Error::RawTotalMismatch { declared: size, loaded: total });
            }
            debug!("raw image of {} bytes loaded", total);
            return Ok(RawLoad { loaded: total, end: cursor });
        }

        if end - cursor < size {
            error!("raw record of {} bytes runs past its partition", size);
            return Err(Error::EofReached);
        }
        if destination.checked_add(size).is_none() {
            error!("raw record of {} bytes at {:#x} wraps", size, destination);
            return Err(Error::BadRawImage);
        }
        memory_map.check(destination, size)?;

        let mut copied = 0;
        while copied < size {
            let n = min(STAGING_SIZE as u32, size - copied);
            let chunk = &mut staging[..n as usize];
            flash.read(cursor + copied, chunk)?;
            memory.write(destination + copied, chunk)?;
            copied += n;
        }
        trace!("raw record: {} bytes to {:#x}", size, destination);
        cursor += size;
        total = total.wrapping_add(size);

        #[cfg(feature = "vdll")]
        let standalone = descriptor.sub_format.get() == RAW_VDLL_FORMAT;
        #[cfg(not(feature = "vdll"))]
        let standalone = false;
        if standalone {
            debug!("VDLL record of {} bytes loaded", size);
            return Ok(RawLoad { loaded: total, end: cursor });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{raw_image, FakeFlash, SparseRam};

    const BASE: u32 = 0x0800_0000;

    #[test]
    fn records_land_at_their_destinations() {
        let first: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        let image = raw_image(&[(0x2000_0000, &first[..]), (0x3000_0000, &[9u8; 3][..])], None);
        let mut storage = FakeFlash::new(0x1000);
        storage.place(0, &image);
        let mut flash = XipFlash::new(&mut storage, 0);
        let mut ram = SparseRam::default();

        let total = load_raw_image(&mut flash, &mut ram, &MemoryMap::Unrestricted, BASE, 0x1000);
        assert_eq!(total.map(|r| r.loaded), Ok(603));
        assert_eq!(ram.bytes(0x2000_0000, 600), first);
        assert_eq!(ram.bytes(0x3000_0000, 3), vec![9; 3]);
        // Staged in 256-byte pieces.
        assert_eq!(ram.writes[..3], [(0x2000_0000, 256), (0x2000_0100, 256), (0x2000_0200, 88)]);
    }

    #[test]
    fn end_is_just_past_the_terminator() {
        let image = raw_image(&[(0x2000_0000, &[1u8; 10][..])], None);
        let mut storage = FakeFlash::new(0x1000);
        storage.place(0, &image);
        let mut flash = XipFlash::new(&mut storage, 0);
        let mut ram = SparseRam::default();
        assert_eq!(
            load_raw_image(&mut flash, &mut ram, &MemoryMap::Unrestricted, BASE, 0x1000),
            Ok(RawLoad { loaded: 10, end: BASE + image.len() as u32 })
        );
    }

    #[test]
    fn destination_may_not_wrap() {
        let image = raw_image(&[(0xffff_ff80, &[0u8; 0x200][..])], None);
        let mut storage = FakeFlash::new(0x1000);
        storage.place(0, &image);
        let mut flash = XipFlash::new(&mut storage, 0);
        let mut ram = SparseRam::default();
        assert_eq!(
            load_raw_image(&mut flash, &mut ram, &MemoryMap::Unrestricted, BASE, 0x1000),
            Err(Error::BadRawImage)
        );
        assert!(ram.is_empty());
    }

    #[cfg(feature = "vdll")]
    #[test]
    fn vdll_record_stands_alone() {
        let mut image = raw_image(&[(0x2000_0000, &[4u8; 20][..])], None);
        image[4..8].copy_from_slice(&RAW_VDLL_FORMAT.to_le_bytes());
        // No terminator needed; cut it off.
        image.truncate(RAW_DESCRIPTOR_SIZE + 20);
        let mut storage = FakeFlash::new(0x1000);
        storage.place(0, &image);
        let mut flash = XipFlash::new(&mut storage, 0);
        let mut ram = SparseRam::default();
        assert_eq!(
            load_raw_image(&mut flash, &mut ram, &MemoryMap::Unrestricted, BASE, 0x1000),
            Ok(RawLoad { loaded: 20, end: BASE + 36 })
        );
        assert_eq!(ram.bytes(0x2000_0000, 20), vec![4; 20]);
    }

    #[test]
    fn terminator_must_match_total() {
        let image = raw_image(&[(0x2000_0000, &[1u8; 10][..])], Some(11));
        let mut storage = FakeFlash::new(0x1000);
        storage.place(0, &image);
        let mut flash = XipFlash::new(&mut storage, 0);
        let mut ram = SparseRam::default();
        assert_eq!(
            load_raw_image(&mut flash, &mut ram, &MemoryMap::Unrestricted, BASE, 0x1000),
            Err(Error::RawTotalMismatch { declared: 11, loaded: 10 })
        );
    }

    #[test]
    fn erased_flash_is_not_an_image() {
        let mut storage = FakeFlash::new(0x1000);
        let mut flash = XipFlash::new(&mut storage, 0);
        let mut ram = SparseRam::default();
        assert_eq!(
            load_raw_image(&mut flash, &mut ram, &MemoryMap::Unrestricted, BASE, 0x1000),
            Err(Error::BadRawImage)
        );
    }

    #[test]
    fn missing_terminator_stops_at_partition_end() {
        let mut image = raw_image(&[(0x2000_0000, &[1u8; 16][..])], None);
        image.truncate(image.len() - RAW_DESCRIPTOR_SIZE);
        let mut storage = FakeFlash::new(0x1000);
        storage.place(0, &image);
        let mut flash = XipFlash::new(&mut storage, 0);
        let mut ram = SparseRam::default();
        assert_eq!(
            load_raw_image(&mut flash, &mut ram, &MemoryMap::Unrestricted, BASE, image.len() as u32),
            Err(Error::EofReached)
        );
    }
}
