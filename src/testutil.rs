// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test doubles and an SB3 image builder shared by the unit tests.

use std::collections::BTreeMap;

use embedded_storage::ReadStorage;

use crate::bsp::Bsp;
use crate::memory::LoadMemory;
use crate::nboot::{ManifestParams, Nboot, NbootStatus};
use crate::raw::{RAW_BINARY_MAGIC, RAW_TERMINATOR};
use crate::romapi::ChipRevision;
use crate::sb3::{alignment_gap, Command, CHUNK_SIZE, DATA_RANGE_TAG, SB3_HEADER_SIZE, SB3_MAGIC};
use crate::trust::{FuseMap, Otp};
use crate::{Error, Firmware};

pub const TRUST: ManifestParams = ManifestParams::zeroed();

pub const FUSES: FuseMap = FuseMap {
    wifi_version: 0x10,
    ble_version: 0x20,
    ieee802154_version: 0x30,
    pck_blob: 0x40,
};

/// Stand-in for the ROM service. Blocks are plaintext, so "decrypting" them
/// leaves them as they are.
#[derive(Debug)]
pub struct FakeNboot {
    pub manifest_verdict: NbootStatus,
    pub context_init_verdict: NbootStatus,
    /// Index of a block to reject with `AuthFail`.
    pub fail_block: Option<u32>,
    pub manifest_calls: u32,
    pub last_manifest_len: usize,
    pub blocks_loaded: u32,
    pub total: u32,
    pub init_calls: u32,
    pub deinit_calls: u32,
}

impl Default for FakeNboot {
    fn default() -> Self {
        Self {
            manifest_verdict: NbootStatus::Success,
            context_init_verdict: NbootStatus::Success,
            fail_block: None,
            manifest_calls: 0,
            last_manifest_len: 0,
            blocks_loaded: 0,
            total: 0,
            init_calls: 0,
            deinit_calls: 0,
        }
    }
}

impl Nboot for FakeNboot {
    fn context_init(&mut self) -> NbootStatus {
        self.init_calls += 1;
        self.context_init_verdict
    }

    fn context_deinit(&mut self) -> NbootStatus {
        self.deinit_calls += 1;
        NbootStatus::Success
    }

    fn load_manifest(&mut self, manifest: &[u8], _params: &ManifestParams) -> NbootStatus {
        self.manifest_calls += 1;
        self.last_manifest_len = manifest.len();
        if self.manifest_verdict.is_success() {
            self.total = u32::from_le_bytes([manifest[12], manifest[13], manifest[14], manifest[15]]);
        }
        self.manifest_verdict
    }

    fn load_block(&mut self, _block: &mut [u8]) -> NbootStatus {
        if self.fail_block == Some(self.blocks_loaded) {
            return NbootStatus::AuthFail;
        }
        self.blocks_loaded += 1;
        NbootStatus::Success
    }

    fn total_blocks(&self) -> u32 {
        self.total
    }
}

/// Byte-addressed memory that records every write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SparseRam {
    pub mem: BTreeMap<u32, u8>,
    pub writes: Vec<(u32, usize)>,
}

impl SparseRam {
    /// Unwritten bytes read as zero.
    pub fn bytes(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| self.mem.get(&(address + i)).copied().unwrap_or(0))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

impl LoadMemory for SparseRam {
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Error> {
        for (i, b) in data.iter().enumerate() {
            self.mem.insert(address + i as u32, *b);
        }
        self.writes.push((address, data.len()));
        Ok(())
    }
}

#[derive(Clone, Debug)]
enum Range {
    Load { address: u32, data: Vec<u8> },
    Header { address: u32, length: u32, cmd: u32 },
}

impl Range {
    fn encoded_len(&self) -> usize {
        match self {
            Range::Load { data, .. } => 32 + data.len() + alignment_gap(data.len() as u32) as usize,
            Range::Header { .. } => 16,
        }
    }
}

/// Builds plaintext SB3.1 images for `FakeNboot`.
#[derive(Clone, Debug)]
pub struct ImageBuilder {
    sections: Vec<Vec<Range>>,
    manifest_len: u32,
    cert_offset: u32,
    declared_blocks: Option<u32>,
    version: u32,
    corruptions: Vec<(usize, u8)>,
    section_lengths: BTreeMap<usize, u32>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            sections: vec![Vec::new()],
            manifest_len: 0x1a4,
            cert_offset: 108,
            declared_blocks: None,
            version: 1,
            corruptions: Vec::new(),
            section_lengths: BTreeMap::new(),
        }
    }

    fn push(&mut self, range: Range) -> &mut Self {
        if let Some(section) = self.sections.last_mut() {
            section.push(range);
        }
        self
    }

    pub fn load(&mut self, address: u32, data: &[u8]) -> &mut Self {
        self.push(Range::Load { address, data: data.to_vec() })
    }

    pub fn execute(&mut self, address: u32) -> &mut Self {
        self.push(Range::Header { address, length: 0, cmd: Command::Execute as u32 })
    }

    /// A bare range header with any command.
    pub fn raw_range(&mut self, address: u32, length: u32, cmd: u32) -> &mut Self {
        self.push(Range::Header { address, length, cmd })
    }

    /// Starts a new section.
    pub fn section(&mut self) -> &mut Self {
        self.sections.push(Vec::new());
        self
    }

    pub fn manifest_len(&mut self, len: u32) -> &mut Self {
        self.manifest_len = len;
        self
    }

    pub fn cert_offset(&mut self, offset: u32) -> &mut Self {
        self.cert_offset = offset;
        self
    }

    /// Header block count, instead of the number of blocks actually built.
    pub fn declare_blocks(&mut self, count: u32) -> &mut Self {
        self.declared_blocks = Some(count);
        self
    }

    pub fn version(&mut self, version: u32) -> &mut Self {
        self.version = version;
        self
    }

    /// Overwrites a byte of the decoded section stream.
    pub fn corrupt_payload(&mut self, offset: usize, value: u8) -> &mut Self {
        self.corruptions.push((offset, value));
        self
    }

    /// Declared length of section `index`, instead of its real length.
    pub fn section_length_override(&mut self, index: usize, length: u32) -> &mut Self {
        self.section_lengths.insert(index, length);
        self
    }

    fn payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let sections = self.sections.iter().filter(|s| !s.is_empty());
        for (index, ranges) in sections.enumerate() {
            let real: usize = ranges.iter().map(Range::encoded_len).sum();
            let length = self.section_lengths.get(&index).copied().unwrap_or(real as u32);
            for word in [index as u32 + 1, 1, length, 0] {
                out.extend_from_slice(&word.to_le_bytes());
            }

            for range in ranges {
                match range {
                    Range::Load { address, data } => {
                        let len = data.len() as u32;
                        for word in [DATA_RANGE_TAG, *address, len, Command::Load as u32] {
                            out.extend_from_slice(&word.to_le_bytes());
                        }
                        // Expansion: memory id and padding.
                        out.extend_from_slice(&[0; 16]);
                        out.extend_from_slice(data);
                        out.resize(out.len() + alignment_gap(len) as usize, 0);
                    }
                    Range::Header { address, length, cmd } => {
                        for word in [DATA_RANGE_TAG, *address, *length, *cmd] {
                            out.extend_from_slice(&word.to_le_bytes());
                        }
                    }
                }
            }
        }
        for &(offset, value) in &self.corruptions {
            out[offset] = value;
        }
        out
    }

    pub fn build(&self) -> Vec<u8> {
        let payload = self.payload();
        let chunks: Vec<&[u8]> = payload.chunks(CHUNK_SIZE).collect();
        let prefix = (self.cert_offset as usize + 4).saturating_sub(SB3_HEADER_SIZE);
        let block_count = self.declared_blocks.unwrap_or(chunks.len() as u32);

        let mut image = Vec::new();
        for word in [
            SB3_MAGIC,
            0x0003_0001,
            0,
            block_count,
            (prefix + CHUNK_SIZE) as u32,
        ] {
            image.extend_from_slice(&word.to_le_bytes());
        }
        image.extend_from_slice(&0u64.to_le_bytes());
        for word in [self.version, self.manifest_len, 6, self.cert_offset] {
            image.extend_from_slice(&word.to_le_bytes());
        }
        image.extend_from_slice(b"test image\0\0\0\0\0\0");
        assert_eq!(image.len(), SB3_HEADER_SIZE);
        image.resize((self.manifest_len as usize).max(SB3_HEADER_SIZE), 0);

        for (n, chunk) in chunks.iter().enumerate() {
            let mut block = vec![0u8; prefix + CHUNK_SIZE];
            if prefix >= 4 {
                block[..4].copy_from_slice(&(n as u32 + 1).to_le_bytes());
            }
            block[prefix..prefix + chunk.len()].copy_from_slice(chunk);
            image.extend_from_slice(&block);
        }
        image
    }

    /// Checks every `Load` range landed where it should.
    pub fn assert_loaded(&self, ram: &SparseRam) {
        for range in self.sections.iter().flatten() {
            if let Range::Load { address, data } = range {
                assert_eq!(&ram.bytes(*address, data.len()), data, "load at {:#x}", address);
            }
        }
    }
}

/// Raw image of `records`, closed by a terminator declaring
/// `terminator_total` (or the true total).
pub fn raw_image(records: &[(u32, &[u8])], terminator_total: Option<u32>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut total = 0u32;
    for (destination, data) in records {
        for word in [RAW_BINARY_MAGIC, 0, *destination, data.len() as u32] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(data);
        total += data.len() as u32;
    }
    let declared = terminator_total.unwrap_or(total);
    for word in [RAW_BINARY_MAGIC, 0, RAW_TERMINATOR, declared] {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out
}

#[derive(Debug, Default)]
pub struct FakeOtp {
    pub fuses: BTreeMap<u32, u32>,
    pub lifecycle: u32,
    pub fail_reads: bool,
    pub already_initialized: bool,
    pub init_calls: u32,
    pub deinit_calls: u32,
}

impl FakeOtp {
    pub fn set(&mut self, index: u32, value: u32) {
        self.fuses.insert(index, value);
    }
}

impl Otp for FakeOtp {
    fn init(&mut self) -> Result<bool, Error> {
        self.init_calls += 1;
        Ok(!self.already_initialized)
    }

    fn deinit(&mut self) -> Result<(), Error> {
        self.deinit_calls += 1;
        Ok(())
    }

    fn read_fuse(&mut self, index: u32) -> Result<u32, Error> {
        if self.fail_reads {
            return Err(Error::Otp);
        }
        Ok(self.fuses.get(&index).copied().unwrap_or(0))
    }

    fn lifecycle_state(&mut self) -> Result<u32, Error> {
        if self.fail_reads {
            return Err(Error::Otp);
        }
        Ok(self.lifecycle)
    }
}

/// Flash that starts out erased.
#[derive(Debug)]
pub struct FakeFlash {
    pub data: Vec<u8>,
}

impl FakeFlash {
    pub fn new(size: usize) -> Self {
        Self { data: vec![0xff; size] }
    }

    pub fn place(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl ReadStorage for FakeFlash {
    type Error = ();

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let src = self.data.get(start..start + bytes.len()).ok_or(())?;
        bytes.copy_from_slice(src);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

/// Board double. A firmware comes up `activate_after_polls` delays after
/// its reset, or never if that is `None`.
#[derive(Debug)]
pub struct FakeBsp {
    pub revision: ChipRevision,
    pub remap: u32,
    pub active: Vec<Firmware>,
    pub activate_after_polls: Option<u32>,
    pub powered_on: Vec<Firmware>,
    pub powered_off: Vec<Firmware>,
    pub resets: Vec<Firmware>,
    pub delays: u32,
    pub crypto_needs_enable: bool,
    pub crypto_on: bool,
    pub flash_needs_enable: bool,
    pub flash_on: bool,
}

impl Default for FakeBsp {
    fn default() -> Self {
        Self {
            revision: ChipRevision(1),
            remap: 0,
            active: Vec::new(),
            activate_after_polls: None,
            powered_on: Vec::new(),
            powered_off: Vec::new(),
            resets: Vec::new(),
            delays: 0,
            crypto_needs_enable: false,
            crypto_on: false,
            flash_needs_enable: false,
            flash_on: false,
        }
    }
}

impl Bsp for FakeBsp {
    fn chip_revision(&self) -> ChipRevision {
        self.revision
    }

    fn flash_remap_offset(&self) -> u32 {
        self.remap
    }

    fn flash_enable(&mut self) -> bool {
        self.flash_on = true;
        self.flash_needs_enable
    }

    fn flash_disable(&mut self) {
        self.flash_on = false;
    }

    fn crypto_enable(&mut self) -> bool {
        self.crypto_on = true;
        self.crypto_needs_enable
    }

    fn crypto_disable(&mut self) {
        self.crypto_on = false;
    }

    fn power_on(&mut self, firmware: Firmware) {
        self.powered_on.push(firmware);
    }

    fn power_off(&mut self, firmware: Firmware) {
        self.powered_off.push(firmware);
        self.active.retain(|f| *f != firmware);
    }

    fn reset_device(&mut self, firmware: Firmware) {
        self.resets.push(firmware);
    }

    fn firmware_active(&self, firmware: Firmware) -> bool {
        if self.active.contains(&firmware) {
            return true;
        }
        self.resets.contains(&firmware)
            && self.activate_after_polls.map_or(false, |n| self.delays >= n)
    }

    fn delay_us(&mut self, _us: u32) {
        self.delays += 1;
    }
}
