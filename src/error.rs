// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use num_derive::FromPrimitive;

use crate::nboot::NbootStatus;
use crate::sb3::Command;

/// Status group shared by the ROM loader codes.
pub const LOADER_STATUS_GROUP: u32 = 101;

pub const fn make_status(group: u32, code: u32) -> u32 {
    group * 100 + code
}

/// Numeric status space reported by the loader.
///
/// The generic codes come first, then the ROM loader group. Callers that only
/// care about the coarse outcome can match on this instead of [`Error`].
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StatusCode {
    Success = 0,
    Fail = 1,
    InvalidArgument = 4,

    SectionOverrun = make_status(LOADER_STATUS_GROUP, 0),
    Signature = make_status(LOADER_STATUS_GROUP, 1),
    SectionLength = make_status(LOADER_STATUS_GROUP, 2),
    UnencryptedOnly = make_status(LOADER_STATUS_GROUP, 3),
    EofReached = make_status(LOADER_STATUS_GROUP, 4),
    Checksum = make_status(LOADER_STATUS_GROUP, 5),
    Crc32Error = make_status(LOADER_STATUS_GROUP, 6),
    UnknownCommand = make_status(LOADER_STATUS_GROUP, 7),
    IdNotFound = make_status(LOADER_STATUS_GROUP, 8),
    DataUnderrun = make_status(LOADER_STATUS_GROUP, 9),
    JumpReturned = make_status(LOADER_STATUS_GROUP, 10),
    CallFailed = make_status(LOADER_STATUS_GROUP, 11),
    KeyNotFound = make_status(LOADER_STATUS_GROUP, 12),
    SecureOnly = make_status(LOADER_STATUS_GROUP, 13),
    ResetReturned = make_status(LOADER_STATUS_GROUP, 14),
    RollbackBlocked = make_status(LOADER_STATUS_GROUP, 15),
    InvalidSectionMacCount = make_status(LOADER_STATUS_GROUP, 16),
    UnexpectedCommand = make_status(LOADER_STATUS_GROUP, 17),
    BadSbKek = make_status(LOADER_STATUS_GROUP, 18),
    PendingJumpCommand = make_status(LOADER_STATUS_GROUP, 19),
}

/// The two ways a pump call can return without failing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PumpStatus {
    /// Every byte handed in has been consumed; feed the next chunk.
    NeedMoreData,
    /// An `Execute` range was decoded. Loading is complete and control should
    /// pass to the image.
    PendingJump,
}

impl PumpStatus {
    pub fn status(self) -> StatusCode {
        match self {
            PumpStatus::NeedMoreData => StatusCode::DataUnderrun,
            PumpStatus::PendingJump => StatusCode::PendingJumpCommand,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A copy into the block buffer would have run past its capacity.
    BufferOverflow,
    BadMagic(u32),
    /// `image_total_length` is smaller than the fixed header or larger than
    /// the block buffer.
    BadManifestLength(u32),
    /// `image_total_length` read back differently once the manifest was
    /// complete.
    ManifestLengthChanged,
    /// The certificate block offset puts a block's payload outside the block
    /// buffer.
    BadCertificateOffset(u32),
    /// Trust parameters for manifest authentication could not be assembled.
    ManifestParams(NbootStatus),
    ManifestAuth(NbootStatus),
    BlockAuth(NbootStatus),
    ContextInit(NbootStatus),
    /// The stream asked for more blocks than the manifest declared.
    TooManyBlocks,
    UnsupportedSection(u32),
    BadRangeTag(u32),
    /// Ranges consumed more bytes than their section declared.
    SectionOverrun,
    BadBlockPosition,
    /// Fewer than a full descriptor remain before the end of the block.
    Misaligned,
    UnknownCommand(u32),
    UnexpectedCommand(Command),
    /// `finalize` was called before an `Execute` range was seen.
    NotFinalized,
    AddressNotAllowed { address: u32, length: u32 },
    Memory,
    Flash,
    Otp,
    RollbackBlocked { image: u32, minimum: u32 },
    BadRawImage,
    RawTotalMismatch { declared: u32, loaded: u32 },
    EofReached,
    /// No address to load from: a monolithic load without a source, or a
    /// VDLL load before a Wi-Fi image has placed the VDLL region.
    MissingSource,
    /// The source address leaves no room for the partitions behind it.
    BadSourceAddress(u32),
    ActivationTimeout,
}

impl Error {
    pub fn status(self) -> StatusCode {
        match self {
            Error::BadMagic(_) | Error::BadRangeTag(_) => StatusCode::Signature,
            Error::SectionOverrun => StatusCode::SectionLength,
            Error::TooManyBlocks => StatusCode::IdNotFound,
            Error::UnknownCommand(_) | Error::UnsupportedSection(_) => {
                StatusCode::UnknownCommand
            }
            Error::UnexpectedCommand(_) => StatusCode::UnexpectedCommand,
            Error::RollbackBlocked { .. } => StatusCode::RollbackBlocked,
            Error::EofReached => StatusCode::EofReached,
            Error::AddressNotAllowed { .. }
            | Error::MissingSource
            | Error::BadSourceAddress(_) => {
                StatusCode::InvalidArgument
            }
            Error::BufferOverflow
            | Error::BadManifestLength(_)
            | Error::ManifestLengthChanged
            | Error::BadCertificateOffset(_)
            | Error::ManifestParams(_)
            | Error::ManifestAuth(_)
            | Error::BlockAuth(_)
            | Error::ContextInit(_)
            | Error::BadBlockPosition
            | Error::Misaligned
            | Error::NotFinalized
            | Error::Memory
            | Error::Flash
            | Error::Otp
            | Error::BadRawImage
            | Error::RawTotalMismatch { .. }
            | Error::ActivationTimeout => StatusCode::Fail,
        }
    }

    /// The authentication collaborator's own verdict, if it caused this error.
    pub fn nboot_status(self) -> Option<NbootStatus> {
        match self {
            Error::ManifestParams(s)
            | Error::ManifestAuth(s)
            | Error::BlockAuth(s)
            | Error::ContextInit(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Error> for StatusCode {
    fn from(e: Error) -> Self {
        e.status()
    }
}

impl From<PumpStatus> for StatusCode {
    fn from(s: PumpStatus) -> Self {
        s.status()
    }
}
