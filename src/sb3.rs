// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SB3.1 container layout.
//!
//! Every multi-byte field on the wire is little-endian. The structs here use
//! the `zerocopy` byte-order wrappers so they can be read out of arbitrary
//! (unaligned) positions of the block buffer on any host.

use core::mem::size_of;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes};

/// `"sbv3"` read as a little-endian word.
pub const SB3_MAGIC: u32 = 0x3376_6273;

/// Tag opening every data range header.
pub const DATA_RANGE_TAG: u32 = 0x55aa_aa55;

/// Payload bytes carried by one decrypted block.
pub const CHUNK_SIZE: usize = 256;

/// Data ranges are padded out to this alignment inside a block.
pub const DATA_ALIGNMENT: u32 = 16;

/// Fixed SB3.1 header at the very start of an image.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes)]
#[repr(C)]
pub struct Sb3Header {
    pub magic: U32<LittleEndian>,
    pub format_version: U32<LittleEndian>,
    pub flags: U32<LittleEndian>,
    pub block_count: U32<LittleEndian>,
    /// Size of one encrypted block as stored, including its per-block
    /// metadata.
    pub block_size: U32<LittleEndian>,
    pub timestamp: U64<LittleEndian>,
    /// Monotonic firmware version, compared against the OTP counter.
    pub firmware_version: U32<LittleEndian>,
    /// Length of the header plus the manifest (certificate block and
    /// signature) that follows it.
    pub image_total_length: U32<LittleEndian>,
    pub image_type: U32<LittleEndian>,
    pub certificate_block_offset: U32<LittleEndian>,
    pub description: [u8; 16],
}

pub const SB3_HEADER_SIZE: usize = size_of::<Sb3Header>();
const_assert_eq!(SB3_HEADER_SIZE, 60);

impl Sb3Header {
    pub fn has_magic(&self) -> bool {
        self.magic.get() == SB3_MAGIC
    }
}

#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct SectionHeader {
    pub uid: U32<LittleEndian>,
    pub section_type: U32<LittleEndian>,
    /// Bytes of range data following this header, not counting the header.
    pub length: U32<LittleEndian>,
    pub pad: U32<LittleEndian>,
}

const_assert_eq!(size_of::<SectionHeader>(), 16);

impl SectionHeader {
    pub fn kind(&self) -> Option<SectionType> {
        SectionType::from_u32(self.section_type.get())
    }
}

#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct DataRangeHeader {
    pub tag: U32<LittleEndian>,
    pub start_address: U32<LittleEndian>,
    pub length: U32<LittleEndian>,
    pub cmd: U32<LittleEndian>,
}

const_assert_eq!(size_of::<DataRangeHeader>(), 16);

impl DataRangeHeader {
    pub fn command(&self) -> Option<Command> {
        Command::from_u32(self.cmd.get())
    }
}

/// Extra descriptor that follows the range header of every `Load` range.
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct RangeExpansion {
    pub memory_id: U32<LittleEndian>,
    pub pad: [U32<LittleEndian>; 3],
}

const_assert_eq!(size_of::<RangeExpansion>(), 16);

pub const SECTION_HEADER_SIZE: usize = size_of::<SectionHeader>();
pub const RANGE_HEADER_SIZE: usize = size_of::<DataRangeHeader>();
pub const RANGE_EXPANSION_SIZE: usize = size_of::<RangeExpansion>();

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SectionType {
    /// Marks the end of the section stream.
    None = 0,
    DataRange = 1,
    DiffUpdate = 2,
    DdrConfig = 3,
    Register = 4,
}

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    Invalid = 0,
    Load = 2,
    Execute = 3,
}

impl Command {
    const fn bit(self) -> u32 {
        1 << self as u32
    }
}

/// The set of commands a loader accepts from an image.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandSet(u32);

impl CommandSet {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self(Command::Load.bit() | Command::Execute.bit());

    pub const fn with(self, command: Command) -> Self {
        Self(self.0 | command.bit())
    }

    pub fn contains(self, command: Command) -> bool {
        command != Command::Invalid && self.0 & command.bit() != 0
    }
}

impl Default for CommandSet {
    fn default() -> Self {
        Self::ALL
    }
}

/// Zero bytes inserted after a `Load` payload of `length` bytes.
pub const fn alignment_gap(length: u32) -> u32 {
    (DATA_ALIGNMENT - (length & (DATA_ALIGNMENT - 1))) & (DATA_ALIGNMENT - 1)
}
