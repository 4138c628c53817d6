// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resumable SB3.1 loader.
//!
//! A [`LoaderContext`] accepts an image as a series of arbitrarily sized
//! chunks. Bytes are gathered into a fixed block buffer; each time the buffer
//! reaches the size the current step needs, that step runs:
//!
//! 1. the fixed 60-byte header, which tells us how big the manifest is;
//! 2. the manifest, which is handed to the [`Nboot`] service to authenticate;
//! 3. one encrypted block at a time, which the service decrypts in place and
//!    which we then decode (see `decode.rs`).
//!
//! Decoding state lives in the context, never on the stack, so a section,
//! range or even a single range payload may straddle any number of blocks and
//! any number of `pump` calls.

use core::cmp::min;
use static_assertions::const_assert;
use zerocopy::FromBytes;

use crate::memory::{LoadMemory, MemoryMap};
use crate::nboot::{Nboot, TrustSource};
use crate::sb3::{
    Command, CommandSet, DataRangeHeader, RangeExpansion, Sb3Header, SectionHeader,
    CHUNK_SIZE, SB3_HEADER_SIZE,
};
use crate::{Error, PumpStatus};

/// Largest header plus manifest we can authenticate.
pub const MANIFEST_MAX_SIZE: usize = 808;
/// Largest encrypted block we can hold: metadata plus a full chunk.
pub const BLOCK_MAX_SIZE: usize = 308;

pub const BLOCK_BUFFER_SIZE: usize = if MANIFEST_MAX_SIZE > BLOCK_MAX_SIZE {
    MANIFEST_MAX_SIZE
} else {
    BLOCK_MAX_SIZE
};

const_assert!(SB3_HEADER_SIZE <= BLOCK_BUFFER_SIZE);
const_assert!(CHUNK_SIZE <= BLOCK_MAX_SIZE);

/// What to do with the block buffer once it is full.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    ParseHeader(HeaderStage),
    ReadNextBlock,
}

/// The header is parsed in two passes: first the fixed part, to learn the
/// manifest length, then the complete manifest.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeaderStage {
    Fixed,
    Manifest,
}

/// What to do with a range whose command this loader doesn't know.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UnknownCommandPolicy {
    /// Close the range and carry on with the next one.
    #[default]
    Skip,
    /// Fail the load with [`Error::UnknownCommand`].
    Reject,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LoaderConfig {
    /// Commands an image is allowed to use. A known command outside this set
    /// fails with [`Error::UnexpectedCommand`].
    pub commands: CommandSet,
    pub unknown_command: UnknownCommandPolicy,
    pub memory_map: MemoryMap,
}

/// The 4-byte alignment is for the ROM, which takes the buffer as words.
#[repr(C, align(4))]
pub(crate) struct BlockBuffer(pub(crate) [u8; BLOCK_BUFFER_SIZE]);

/// What `step` produced for `pump`.
pub(crate) enum Step {
    Continue,
    PendingJump,
}

pub struct LoaderContext {
    pub(crate) config: LoaderConfig,
    pub(crate) action: Action,

    pub(crate) block_buffer: BlockBuffer,
    /// Bytes the current action needs in the buffer.
    pub(crate) block_buffer_size: usize,
    /// Bytes gathered so far toward `block_buffer_size`.
    pub(crate) block_buffer_position: usize,

    pub(crate) block_size: u32,
    pub(crate) block_data_total: u32,
    /// Offset of the payload inside an assembled block.
    pub(crate) data_block_offset: usize,
    /// Payload bytes in one block.
    pub(crate) block_data_size: usize,
    pub(crate) processed_blocks: u32,
    pub(crate) total_blocks: u32,

    pub(crate) in_data_block: bool,
    pub(crate) data_block_position: usize,

    pub(crate) in_data_section: bool,
    pub(crate) data_section_handled: u32,
    pub(crate) data_section_header: SectionHeader,

    pub(crate) in_data_range: bool,
    pub(crate) data_range_gap: u32,
    pub(crate) data_range_header: DataRangeHeader,
    pub(crate) has_data_range_expansion: bool,
    pub(crate) data_range_expansion: RangeExpansion,
}

impl LoaderContext {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            action: Action::ParseHeader(HeaderStage::Fixed),
            block_buffer: BlockBuffer([0; BLOCK_BUFFER_SIZE]),
            block_buffer_size: SB3_HEADER_SIZE,
            block_buffer_position: 0,
            block_size: 0,
            block_data_total: 0,
            data_block_offset: 0,
            block_data_size: 0,
            processed_blocks: 0,
            total_blocks: 0,
            in_data_block: false,
            data_block_position: 0,
            in_data_section: false,
            data_section_handled: 0,
            data_section_header: SectionHeader::default(),
            in_data_range: false,
            data_range_gap: 0,
            data_range_header: DataRangeHeader::default(),
            has_data_range_expansion: false,
            data_range_expansion: RangeExpansion::default(),
        }
    }

    /// Forgets everything about any previous image and gets ready to receive
    /// the first byte of a new one.
    pub fn init(&mut self, config: LoaderConfig) {
        *self = Self::new(config);
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn processed_blocks(&self) -> u32 {
        self.processed_blocks
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Bytes of block payload the manifest accounts for.
    pub fn block_data_total(&self) -> u32 {
        self.block_data_total
    }

    /// Header of the range being decoded, or of the last one decoded.
    pub fn current_range(&self) -> &DataRangeHeader {
        &self.data_range_header
    }

    /// Feeds the next piece of the image.
    ///
    /// All of `data` is consumed unless the image finishes (or fails) part
    /// way through it. A chunk may be any size, including zero.
    pub fn pump<N, T, M>(
        &mut self,
        nboot: &mut N,
        trust: &mut T,
        memory: &mut M,
        data: &[u8],
    ) -> Result<PumpStatus, Error>
    where
        N: Nboot,
        T: TrustSource,
        M: LoadMemory,
    {
        let mut input = data;
        loop {
            let required = self
                .block_buffer_size
                .checked_sub(self.block_buffer_position)
                .ok_or(Error::BufferOverflow)?;

            if required == 0 {
                self.block_buffer_position = 0;
                match self.step(nboot, trust, memory)? {
                    Step::Continue => continue,
                    Step::PendingJump => return Ok(PumpStatus::PendingJump),
                }
            }

            if input.is_empty() {
                return Ok(PumpStatus::NeedMoreData);
            }

            let take = min(required, input.len());
            let start = self.block_buffer_position;
            if start + take > BLOCK_BUFFER_SIZE {
                error!("chunk of {} bytes overflows block buffer at {}", take, start);
                return Err(Error::BufferOverflow);
            }
            self.block_buffer.0[start..start + take].copy_from_slice(&input[..take]);
            self.block_buffer_position += take;
            input = &input[take..];
        }
    }

    fn step<N, T, M>(&mut self, nboot: &mut N, trust: &mut T, memory: &mut M) -> Result<Step, Error>
    where
        N: Nboot,
        T: TrustSource,
        M: LoadMemory,
    {
        match self.action {
            Action::ParseHeader(HeaderStage::Fixed) => self.parse_fixed_header(),
            Action::ParseHeader(HeaderStage::Manifest) => self.parse_manifest(nboot, trust),
            Action::ReadNextBlock => self.read_next_block(nboot, memory),
        }
    }

    fn header(&self) -> Result<Sb3Header, Error> {
        Sb3Header::read_from_prefix(&self.block_buffer.0[..]).ok_or(Error::BufferOverflow)
    }

    /// First look at the header: grow the buffer to the full manifest.
    fn parse_fixed_header(&mut self) -> Result<Step, Error> {
        let header = self.header()?;
        if !header.has_magic() {
            error!("bad SB3 magic {:#x}", header.magic.get());
            return Err(Error::BadMagic(header.magic.get()));
        }

        let total = header.image_total_length.get();
        let total_len = total as usize;
        if total_len < SB3_HEADER_SIZE || total_len > MANIFEST_MAX_SIZE {
            error!("manifest length {} out of range", total);
            return Err(Error::BadManifestLength(total));
        }

        debug!("SB3 manifest is {} bytes", total);
        self.block_buffer_size = total_len;
        // The fixed header stays in place; keep gathering after it.
        self.block_buffer_position = SB3_HEADER_SIZE;
        self.action = Action::ParseHeader(HeaderStage::Manifest);
        Ok(Step::Continue)
    }

    /// Second look: the whole manifest is here, have it authenticated.
    fn parse_manifest<N, T>(&mut self, nboot: &mut N, trust: &mut T) -> Result<Step, Error>
    where
        N: Nboot,
        T: TrustSource,
    {
        let header = self.header()?;
        if header.image_total_length.get() as usize != self.block_buffer_size {
            return Err(Error::ManifestLengthChanged);
        }

        let params = trust.manifest_params().map_err(|s| {
            error!("no manifest parameters: {:?}", s);
            Error::ManifestParams(s)
        })?;

        let manifest = &self.block_buffer.0[..self.block_buffer_size];
        nboot.load_manifest(manifest, &params).check(|s| {
            error!("manifest rejected: {:?}", s);
            Error::ManifestAuth(s)
        })?;

        // A block is the 4-byte block number, the certificate-block-relative
        // metadata, then a full chunk of payload.
        let cert_offset = header.certificate_block_offset.get();
        let offset = (cert_offset as usize)
            .checked_add(4)
            .and_then(|o| o.checked_sub(SB3_HEADER_SIZE))
            .filter(|o| o + CHUNK_SIZE <= BLOCK_MAX_SIZE)
            .ok_or_else(|| {
                error!("certificate block offset {} unusable", cert_offset);
                Error::BadCertificateOffset(cert_offset)
            })?;

        self.data_block_offset = offset;
        self.block_buffer_size = offset + CHUNK_SIZE;
        self.block_buffer_position = 0;
        self.block_size = header.block_size.get();
        self.block_data_size = CHUNK_SIZE;
        self.total_blocks = nboot.total_blocks();
        self.block_data_total = self.block_size.saturating_mul(self.total_blocks);
        self.processed_blocks = 0;
        self.in_data_section = false;
        self.data_section_handled = 0;
        self.action = Action::ReadNextBlock;

        debug!(
            "manifest accepted: {} blocks of {} bytes, payload at {}",
            self.total_blocks,
            self.block_size,
            offset
        );
        Ok(Step::Continue)
    }

    /// A complete encrypted block is in the buffer.
    fn read_next_block<N, M>(&mut self, nboot: &mut N, memory: &mut M) -> Result<Step, Error>
    where
        N: Nboot,
        M: LoadMemory,
    {
        if self.processed_blocks >= nboot.total_blocks() {
            error!("block {} beyond declared count", self.processed_blocks);
            return Err(Error::TooManyBlocks);
        }

        let block = &mut self.block_buffer.0[..self.block_buffer_size];
        nboot.load_block(block).check(|s| {
            error!("block {} rejected: {:?}", self.processed_blocks, s);
            Error::BlockAuth(s)
        })?;

        trace!("block {} decrypted", self.processed_blocks);
        self.block_buffer_position = 0;
        self.in_data_block = true;
        self.data_block_position = 0;
        self.processed_blocks += 1;

        self.decode_block(memory)
    }

    /// Succeeds only if the image ended with an `Execute` range.
    pub fn finalize(&self) -> Result<(), Error> {
        if self.data_range_header.command() == Some(Command::Execute) {
            Ok(())
        } else {
            Err(Error::NotFinalized)
        }
    }
}
