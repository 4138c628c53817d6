// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Section and range decoding over decrypted blocks, and the commands they
//! carry.

use zerocopy::FromBytes;

use crate::loader::{LoaderContext, Step, UnknownCommandPolicy};
use crate::memory::LoadMemory;
use crate::sb3::{
    alignment_gap, Command, DataRangeHeader, RangeExpansion, SectionHeader, SectionType,
    DATA_RANGE_TAG, RANGE_EXPANSION_SIZE, RANGE_HEADER_SIZE, SECTION_HEADER_SIZE,
};
use crate::Error;

impl LoaderContext {
    /// Payload of the block currently in the buffer.
    fn data_block(&self) -> &[u8] {
        let start = self.data_block_offset;
        &self.block_buffer.0[start..start + self.block_data_size]
    }

    /// Payload not yet consumed.
    fn unread(&self) -> &[u8] {
        self.data_block().get(self.data_block_position..).unwrap_or(&[])
    }

    /// Walks the decrypted block, resuming whatever section and range were in
    /// progress when the previous block ran out.
    pub(crate) fn decode_block<M: LoadMemory>(&mut self, memory: &mut M) -> Result<Step, Error> {
        while self.in_data_block {
            if !self.in_data_section {
                let section =
                    SectionHeader::read_from_prefix(self.unread()).ok_or(Error::Misaligned)?;
                match section.kind() {
                    Some(SectionType::None) => {
                        trace!("end of sections");
                        return Ok(Step::Continue);
                    }
                    Some(SectionType::DataRange) => {
                        trace!("section {} of {} bytes", section.uid.get(), section.length.get());
                        self.data_section_header = section;
                        self.in_data_section = true;
                        self.data_section_handled = 0;
                        self.in_data_range = false;
                        self.data_block_position += SECTION_HEADER_SIZE;
                        if self.data_block_position == self.block_data_size {
                            // The header filled the block; its first range
                            // opens the next one.
                            self.in_data_block = false;
                            self.data_block_position = 0;
                            return Ok(Step::Continue);
                        }
                    }
                    _ => {
                        error!("unsupported section type {}", section.section_type.get());
                        return Err(Error::UnsupportedSection(section.section_type.get()));
                    }
                }
            }

            if !self.in_data_range {
                self.open_range()?;
            }

            match self.data_range_header.command() {
                Some(Command::Load) => {
                    if !self.has_data_range_expansion {
                        if self.data_block_position == self.block_data_size {
                            // Expansion is at the start of the next block.
                            return Ok(Step::Continue);
                        }
                        self.data_range_expansion =
                            RangeExpansion::read_from_prefix(self.unread())
                                .ok_or(Error::Misaligned)?;
                        self.has_data_range_expansion = true;
                        self.data_block_position += RANGE_EXPANSION_SIZE;
                        self.data_section_handled += RANGE_EXPANSION_SIZE as u32;
                    }
                    self.execute_load(memory)?;
                }
                Some(Command::Execute) => return Ok(self.execute_jump()),
                _ => {
                    let cmd = self.data_range_header.cmd.get();
                    match self.config.unknown_command {
                        UnknownCommandPolicy::Skip => {
                            warn!("skipping range with unknown command {}", cmd);
                            self.in_data_range = false;
                        }
                        UnknownCommandPolicy::Reject => {
                            error!("unknown command {}", cmd);
                            return Err(Error::UnknownCommand(cmd));
                        }
                    }
                }
            }

            let section_length = self.data_section_header.length.get();
            if self.data_section_handled == section_length {
                self.in_data_section = false;
            } else if self.data_section_handled > section_length {
                error!(
                    "section overrun: {} of {} bytes",
                    self.data_section_handled,
                    section_length
                );
                return Err(Error::SectionOverrun);
            }

            if self.data_block_position == self.block_data_size {
                self.block_buffer_position = 0;
                self.in_data_block = false;
                self.data_block_position = 0;
            } else if self.data_block_position > self.block_data_size {
                return Err(Error::BadBlockPosition);
            } else if self.data_block_position + RANGE_HEADER_SIZE > self.block_data_size {
                error!("data not aligned at {}", self.data_block_position);
                return Err(Error::Misaligned);
            }
        }
        Ok(Step::Continue)
    }

    /// Reads and checks the next range header. Nothing about the range is
    /// acted on until the whole header has passed.
    fn open_range(&mut self) -> Result<(), Error> {
        let range = DataRangeHeader::read_from_prefix(self.unread()).ok_or(Error::Misaligned)?;

        if range.tag.get() != DATA_RANGE_TAG {
            error!("bad range tag {:#x}", range.tag.get());
            return Err(Error::BadRangeTag(range.tag.get()));
        }
        if let Some(cmd) = range.command() {
            if cmd != Command::Invalid && !self.config.commands.contains(cmd) {
                error!("command {:?} not allowed", cmd);
                return Err(Error::UnexpectedCommand(cmd));
            }
        }

        self.data_range_gap = match range.command() {
            Some(Command::Load) => alignment_gap(range.length.get()),
            _ => 0,
        };
        self.data_range_header = range;
        self.in_data_range = true;
        self.has_data_range_expansion = false;
        self.data_block_position += RANGE_HEADER_SIZE;
        self.data_section_handled += RANGE_HEADER_SIZE as u32;
        Ok(())
    }

    /// Copies as much of the current `Load` range as this block holds. A
    /// range that continues into the next block is shortened in place so
    /// that the next call picks up where this one stopped.
    fn execute_load<M: LoadMemory>(&mut self, memory: &mut M) -> Result<(), Error> {
        let available = self.block_data_size - self.data_block_position;
        if available == 0 {
            return Ok(());
        }

        let start = self.data_range_header.start_address.get();
        let length = self.data_range_header.length.get();
        let whole = length as usize <= available;
        let count = if whole { length } else { available as u32 };

        self.config.memory_map.check(start, count)?;
        let from = self.data_block_offset + self.data_block_position;
        memory.write(start, &self.block_buffer.0[from..from + count as usize])?;

        if whole {
            trace!("loaded {} bytes at {:#x}", count, start);
            let consumed = count + self.data_range_gap;
            self.in_data_range = false;
            self.data_block_position += consumed as usize;
            self.data_section_handled += consumed;
        } else {
            trace!("loaded {} of {} bytes at {:#x}", count, length, start);
            self.data_range_header.start_address.set(start.wrapping_add(count));
            self.data_range_header.length.set(length - count);
            self.data_block_position += count as usize;
            self.data_section_handled += count;
        }
        Ok(())
    }

    fn execute_jump(&mut self) -> Step {
        self.in_data_range = false;
        info!(
            "execute at {:#x}, {} blocks processed",
            self.data_range_header.start_address.get(),
            self.processed_blocks
        );
        Step::PendingJump
    }
}
