// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the authentication/decryption service ("nboot").
//!
//! The loader never looks inside the manifest or the encrypted blocks itself:
//! it hands the assembled bytes to an [`Nboot`] implementation and trusts its
//! verdict. On silicon that is the boot ROM (see [`crate::romapi`]).

use core::mem::size_of;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use static_assertions::const_assert_eq;

/// Verdicts returned by the service. These are wide sentinels rather than
/// small integers so that a single glitched bit can't turn a failure into
/// `Success`.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NbootStatus {
    Success = 0x5a5a_5a5a,
    Fail = 0x5a5a_a5a5,
    InvalidArgument = 0x5a5a_a5f0,
    RequestTimeout = 0x5a5a_a5e1,
    KeyNotLoaded = 0x5a5a_a5e2,
    AuthFail = 0x5a5a_a5e4,
    OperationNotAvailable = 0x5a5a_a5e5,
    KeyNotAvailable = 0x5a5a_a5e6,
    IvCounterOverflow = 0x5a5a_a5e7,
    SelftestFail = 0x5a5a_a5e8,
    InvalidDataFormat = 0x5a5a_a5e9,
    IskCertUserDataTooBig = 0x5a5a_a5ea,
    IskCertSignatureOffsetTooSmall = 0x5a5a_a5eb,
    MemcpyFail = 0x5a5a_845a,
    /// Anything the service returned that isn't one of the above.
    Unknown = 0xffff_ffff,
}

impl NbootStatus {
    pub fn from_raw(raw: u32) -> Self {
        Self::from_u32(raw).unwrap_or(NbootStatus::Unknown)
    }

    /// Calls that are protected against fault injection return the verdict in
    /// the low word of a 64-bit value.
    pub fn from_protected(raw: u64) -> Self {
        Self::from_raw(raw as u32)
    }

    pub fn is_success(self) -> bool {
        self == NbootStatus::Success
    }

    /// Turns anything but `Success` into an error built by `f`.
    pub fn check<E>(self, f: impl FnOnce(Self) -> E) -> Result<(), E> {
        if self.is_success() {
            Ok(())
        } else {
            Err(f(self))
        }
    }
}

/// Key slot is in use.
pub const ROOT_KEY_ENABLED: u32 = 0xaa;
/// Key slot carries no key.
pub const ROOT_KEY_USAGE_UNUSED: u32 = 0x7;
pub const ROOT_KEY_USAGE_MASK: u32 = 0x7;
/// ECDSA P-256 root keys.
pub const ROOT_KEY_TYPE_P256: u32 = 0x0000_fe01;

/// Root-of-trust parameters, laid out the way the ROM expects them.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct RotAuthParams {
    pub root_key_revocation: [u32; 4],
    pub image_key_revocation: u32,
    /// SHA-384 over the root public keys.
    pub rkh: [u32; 12],
    pub number_of_root_keys: u32,
    pub root_key_usage: [u32; 4],
    pub root_key_type_and_length: u32,
    /// Lifecycle state and its bitwise complement in the upper half.
    pub lifecycle: u32,
}

const_assert_eq!(size_of::<RotAuthParams>(), 96);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(C)]
pub struct ManifestParams {
    pub rot: RotAuthParams,
    pub trusted_firmware_version: u32,
    /// Wrapped part-common key.
    pub pck_blob: [u8; 48],
}

const_assert_eq!(size_of::<ManifestParams>(), 148);

impl ManifestParams {
    pub const fn zeroed() -> Self {
        Self {
            rot: RotAuthParams {
                root_key_revocation: [0; 4],
                image_key_revocation: 0,
                rkh: [0; 12],
                number_of_root_keys: 0,
                root_key_usage: [0; 4],
                root_key_type_and_length: 0,
                lifecycle: 0,
            },
            trusted_firmware_version: 0,
            pck_blob: [0; 48],
        }
    }
}

impl Default for ManifestParams {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Source of the trust data the service needs to check a manifest.
pub trait TrustSource {
    fn manifest_params(&mut self) -> Result<ManifestParams, NbootStatus>;
}

/// Fixed parameters, for targets that provision them some other way.
impl TrustSource for ManifestParams {
    fn manifest_params(&mut self) -> Result<ManifestParams, NbootStatus> {
        Ok(*self)
    }
}

/// Authentication and decryption service for SB3.1 images.
pub trait Nboot {
    /// Prepares the service's own context. Must succeed before any other
    /// call.
    fn context_init(&mut self) -> NbootStatus;

    /// Wipes the service's context, including key material.
    fn context_deinit(&mut self) -> NbootStatus;

    /// Authenticates the header and manifest (`image_total_length` bytes).
    /// On success the service knows how many blocks follow.
    fn load_manifest(&mut self, manifest: &[u8], params: &ManifestParams) -> NbootStatus;

    /// Authenticates one block and decrypts it in place.
    fn load_block(&mut self, block: &mut [u8]) -> NbootStatus;

    /// Block count recorded by the last successful `load_manifest`.
    fn total_blocks(&self) -> u32;
}

impl<T: Nboot + ?Sized> Nboot for &mut T {
    fn context_init(&mut self) -> NbootStatus {
        (**self).context_init()
    }

    fn context_deinit(&mut self) -> NbootStatus {
        (**self).context_deinit()
    }

    fn load_manifest(&mut self, manifest: &[u8], params: &ManifestParams) -> NbootStatus {
        (**self).load_manifest(manifest, params)
    }

    fn load_block(&mut self, block: &mut [u8]) -> NbootStatus {
        (**self).load_block(block)
    }

    fn total_blocks(&self) -> u32 {
        (**self).total_blocks()
    }
}
