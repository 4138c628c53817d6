// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bindings to the nboot service in the boot ROM.
//!
//! The ROM publishes a table of driver tables at a fixed address. Which table
//! layout (and address) applies depends on the silicon revision, so the tree
//! is picked once, when the [`RomNboot`] is built, rather than on every call.

use crate::nboot::{ManifestParams, Nboot, NbootStatus};

/// Silicon revision from `SOCCTRL.CHIP_INFO[3:0]`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChipRevision(pub u8);

impl ChipRevision {
    pub fn from_chip_info(chip_info: u32) -> Self {
        Self((chip_info & 0xf) as u8)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RomTree {
    V0,
    V1,
}

impl RomTree {
    pub const V0_ADDRESS: usize = 0x1302_4100;
    pub const V1_ADDRESS: usize = 0x1303_0000;

    pub fn for_revision(revision: ChipRevision) -> Self {
        match revision.0 {
            1 | 2 => RomTree::V1,
            _ => RomTree::V0,
        }
    }

    pub fn address(self) -> usize {
        match self {
            RomTree::V0 => Self::V0_ADDRESS,
            RomTree::V1 => Self::V1_ADDRESS,
        }
    }
}

#[repr(C)]
#[derive(Default, Debug)]
struct StandardVersion {
    bugfix: u8,
    minor: u8,
    major: u8,
    name: u8,
}

/// Working storage the ROM keeps between calls. We only ever read
/// `total_blocks`; the rest is opaque.
#[repr(C)]
pub struct NbootContext {
    pub total_blocks: u32,
    pub process_data: u32,
    pub timeout: u32,
    keyinfo: [u32; 23],
    work_area: [u32; 96],
    uuid: [u32; 4],
    prng_ready_flag: u32,
    multipart_mac_buffer: [u32; 256],
    oem_share_valid_flag: u32,
    oem_share: [u32; 4],
    secure_counter: [u32; 2],
    rtf: [u32; 8],
    image_hash: [u32; 12],
    auth_status: u32,
    disable_provisioning_firmware_nxp: u32,
}

static_assertions::const_assert_eq!(core::mem::size_of::<NbootContext>(), 1648);

impl NbootContext {
    pub const fn zeroed() -> Self {
        Self {
            total_blocks: 0,
            process_data: 0,
            timeout: 0,
            keyinfo: [0; 23],
            work_area: [0; 96],
            uuid: [0; 4],
            prng_ready_flag: 0,
            multipart_mac_buffer: [0; 256],
            oem_share_valid_flag: 0,
            oem_share: [0; 4],
            secure_counter: [0; 2],
            rtf: [0; 8],
            image_hash: [0; 12],
            auth_status: 0,
            disable_provisioning_firmware_nxp: 0,
        }
    }
}

#[repr(C)]
pub struct NbootDriverInterface {
    pub context_init: unsafe extern "C" fn(ctx: *mut NbootContext) -> u32,
    pub context_deinit: unsafe extern "C" fn(ctx: *mut NbootContext) -> u32,
    /// These two return their verdict in the low word of a protected 64-bit
    /// value.
    pub sb3_load_manifest: unsafe extern "C" fn(
        ctx: *mut NbootContext,
        manifest: *const u32,
        params: *const ManifestParams,
    ) -> u64,
    pub sb3_load_block: unsafe extern "C" fn(ctx: *mut NbootContext, block: *mut u32) -> u64,
}

#[repr(C)]
pub struct BootloaderTreeV0 {
    /// Function to start the bootloader executing
    bootloader_fn: unsafe extern "C" fn(*const u8),
    version: StandardVersion,
    /// Actually a C string but we don't have that in no-std
    pub copyright: u32,
    /// In-application programming API, stubbed
    iap_driver: &'static [u8; 0],
    flash_driver: &'static [u8; 0],
    otp_driver: &'static [u8; 0],
    pub nboot: &'static NbootDriverInterface,
}

#[repr(C)]
pub struct BootloaderTreeV1 {
    bootloader_fn: unsafe extern "C" fn(*const u8),
    version: StandardVersion,
    pub copyright: u32,
    reserved: u32,
    flash_driver: &'static [u8; 0],
    otp_driver: &'static [u8; 0],
    pub nboot: &'static NbootDriverInterface,
}

/// [`Nboot`] implemented by calling into the ROM.
pub struct RomNboot {
    tree: RomTree,
    context: NbootContext,
}

impl RomNboot {
    /// # Safety
    ///
    /// Only sound on a part whose ROM publishes the tree selected by
    /// `revision` at its documented address.
    pub unsafe fn new(revision: ChipRevision) -> Self {
        Self { tree: RomTree::for_revision(revision), context: NbootContext::zeroed() }
    }

    pub fn tree(&self) -> RomTree {
        self.tree
    }

    fn driver(&self) -> &'static NbootDriverInterface {
        // Safety: `new` is unsafe and its caller vouched for the tree at this
        // address, which lives in ROM for the life of the program.
        unsafe {
            match self.tree {
                RomTree::V0 => (*(RomTree::V0_ADDRESS as *const BootloaderTreeV0)).nboot,
                RomTree::V1 => (*(RomTree::V1_ADDRESS as *const BootloaderTreeV1)).nboot,
            }
        }
    }
}

impl Nboot for RomNboot {
    fn context_init(&mut self) -> NbootStatus {
        let f = self.driver().context_init;
        NbootStatus::from_raw(unsafe { f(&mut self.context) })
    }

    fn context_deinit(&mut self) -> NbootStatus {
        let f = self.driver().context_deinit;
        NbootStatus::from_raw(unsafe { f(&mut self.context) })
    }

    fn load_manifest(&mut self, manifest: &[u8], params: &ManifestParams) -> NbootStatus {
        if manifest.as_ptr() as usize % 4 != 0 {
            return NbootStatus::InvalidArgument;
        }
        let f = self.driver().sb3_load_manifest;
        // Safety: the ROM reads `image_total_length` bytes, which is the
        // slice we were given; the pointer is word aligned per the check
        // above.
        NbootStatus::from_protected(unsafe {
            f(&mut self.context, manifest.as_ptr() as *const u32, params)
        })
    }

    fn load_block(&mut self, block: &mut [u8]) -> NbootStatus {
        if block.as_ptr() as usize % 4 != 0 {
            return NbootStatus::InvalidArgument;
        }
        let f = self.driver().sb3_load_block;
        // Safety: the ROM decrypts exactly one block in place, and `block`
        // is sized to one block by the loader.
        NbootStatus::from_protected(unsafe { f(&mut self.context, block.as_mut_ptr() as *mut u32) })
    }

    fn total_blocks(&self) -> u32 {
        self.context.total_blocks
    }
}
