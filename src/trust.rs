// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trust data kept in OTP fuses: the parameters the ROM needs to check an
//! SB3 manifest, and the anti-rollback counters.

use crate::nboot::{
    ManifestParams, NbootStatus, RotAuthParams, TrustSource, ROOT_KEY_ENABLED,
    ROOT_KEY_TYPE_P256, ROOT_KEY_USAGE_MASK, ROOT_KEY_USAGE_UNUSED,
};
use crate::romapi::ChipRevision;
use crate::{Error, Firmware};

/// One-time-programmable fuse bank.
pub trait Otp {
    /// Brings the controller up if it isn't already. Returns `true` if this
    /// call did so, in which case the caller should `deinit` when done.
    fn init(&mut self) -> Result<bool, Error>;

    fn deinit(&mut self) -> Result<(), Error>;

    fn read_fuse(&mut self, index: u32) -> Result<u32, Error>;

    /// Current device lifecycle state (low 16 bits significant).
    fn lifecycle_state(&mut self) -> Result<u32, Error>;
}

impl<T: Otp + ?Sized> Otp for &mut T {
    fn init(&mut self) -> Result<bool, Error> {
        (**self).init()
    }

    fn deinit(&mut self) -> Result<(), Error> {
        (**self).deinit()
    }

    fn read_fuse(&mut self, index: u32) -> Result<u32, Error> {
        (**self).read_fuse(index)
    }

    fn lifecycle_state(&mut self) -> Result<u32, Error> {
        (**self).lifecycle_state()
    }
}

/// Fuse word indices used by the loader. These depend on the part's fuse
/// map and must come from the board configuration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FuseMap {
    /// First of four version words per firmware.
    pub wifi_version: u32,
    pub ble_version: u32,
    pub ieee802154_version: u32,
    /// First of twelve words holding the wrapped part-common key.
    pub pck_blob: u32,
}

impl FuseMap {
    fn version_start(&self, firmware: Firmware) -> u32 {
        match firmware {
            Firmware::Wifi => self.wifi_version,
            Firmware::Ble => self.ble_version,
            Firmware::Ieee802154 => self.ieee802154_version,
        }
    }
}

const VERSION_FUSE_WORDS: u32 = 4;

/// Minimum firmware version OTP allows for `firmware`: a thermometer code
/// over the low half of four fuse words.
pub fn secure_firmware_version<O: Otp>(
    otp: &mut O,
    fuses: &FuseMap,
    firmware: Firmware,
) -> Result<u32, Error> {
    let start = fuses.version_start(firmware);
    let mut version = 0;
    for i in 0..VERSION_FUSE_WORDS {
        let word = otp.read_fuse(start + i)?;
        version += (word & 0xffff).count_ones();
    }
    Ok(version)
}

// Hashes of the root public keys NXP signs firmware with, per silicon
// revision.
const ROTKH_REV0: [u32; 12] = [
    0x60df_bee6, 0x8799_305f, 0xba9e_4ae6, 0x1908_394f,
    0x7ac4_f934, 0xef76_bf41, 0x2e27_796e, 0x94db_19a0,
    0, 0, 0, 0,
];
const ROTKH_REV1: [u32; 12] = [
    0x9c75_8c58, 0x0a5c_ceaa, 0x850d_ad41, 0x1371_eeba,
    0xb787_4851, 0x53c5_ba44, 0xf236_f964, 0x3320_ecdf,
    0, 0, 0, 0,
];
const ROTKH_REV2: [u32; 12] = [
    0xe7c7_e9bb, 0x12c8_c535, 0x37e6_1148, 0x2be7_f18c,
    0x8f0e_3094, 0xb2ba_7f32, 0xec9b_4ecb, 0xad9f_c941,
    0, 0, 0, 0,
];
#[cfg(feature = "eng-certificate")]
const ROTKH_ENG: [u32; 12] = [
    0xd0cf_b419, 0x4037_ee3c, 0xde74_393e, 0x0156_d0a3,
    0x373b_8677, 0x6b6a_ee3d, 0x619b_459e, 0xfa33_f31d,
    0, 0, 0, 0,
];

cfg_if::cfg_if! {
    if #[cfg(feature = "eng-certificate")] {
        fn root_key_hash(_revision: ChipRevision) -> [u32; 12] {
            ROTKH_ENG
        }
    } else {
        fn root_key_hash(revision: ChipRevision) -> [u32; 12] {
            match revision.0 {
                0 => ROTKH_REV0,
                1 => ROTKH_REV1,
                2 => ROTKH_REV2,
                _ => [0; 12],
            }
        }
    }
}

/// Stores a 16-bit value alongside its complement so a corrupted word is
/// detectable.
fn antipole(value: u32) -> u32 {
    let low = value & 0xffff;
    low | (!low << 16)
}

fn rot_auth_params<O: Otp>(otp: &mut O, revision: ChipRevision) -> Result<RotAuthParams, Error> {
    let mut params = RotAuthParams {
        root_key_revocation: [ROOT_KEY_ENABLED; 4],
        rkh: root_key_hash(revision),
        root_key_type_and_length: ROOT_KEY_TYPE_P256,
        ..Default::default()
    };
    params.root_key_usage[1..].fill(ROOT_KEY_USAGE_UNUSED);
    params.number_of_root_keys = params
        .root_key_usage
        .iter()
        .filter(|&&u| u & ROOT_KEY_USAGE_MASK != ROOT_KEY_USAGE_UNUSED)
        .count() as u32;
    params.lifecycle = antipole(otp.lifecycle_state()?);
    Ok(params)
}

fn pck_blob<O: Otp>(otp: &mut O, start: u32) -> Result<[u8; 48], Error> {
    let mut blob = [0; 48];
    for (i, word) in blob.chunks_exact_mut(4).enumerate() {
        let fuse = otp.read_fuse(start + i as u32)?;
        word.copy_from_slice(&fuse.to_le_bytes());
    }
    Ok(blob)
}

/// Assembles the parameters the ROM checks an SB3 manifest against.
pub fn sb3_manifest_params<O: Otp>(
    otp: &mut O,
    revision: ChipRevision,
    fuses: &FuseMap,
) -> Result<ManifestParams, Error> {
    Ok(ManifestParams {
        rot: rot_auth_params(otp, revision)?,
        trusted_firmware_version: 0,
        pck_blob: pck_blob(otp, fuses.pck_blob)?,
    })
}

/// [`TrustSource`] backed by live OTP reads.
pub struct OtpTrust<'a, O> {
    otp: &'a mut O,
    revision: ChipRevision,
    fuses: &'a FuseMap,
}

impl<'a, O: Otp> OtpTrust<'a, O> {
    pub fn new(otp: &'a mut O, revision: ChipRevision, fuses: &'a FuseMap) -> Self {
        Self { otp, revision, fuses }
    }
}

impl<O: Otp> TrustSource for OtpTrust<'_, O> {
    fn manifest_params(&mut self) -> Result<ManifestParams, NbootStatus> {
        sb3_manifest_params(&mut *self.otp, self.revision, self.fuses).map_err(|e| {
            error!("reading trust parameters from OTP: {:?}", e);
            NbootStatus::Fail
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeOtp, FUSES};

    #[test]
    fn version_counts_low_half_bits_only() {
        let mut otp = FakeOtp::default();
        otp.set(FUSES.ble_version, 0b111);
        otp.set(FUSES.ble_version + 1, 0xffff_0001);
        otp.set(FUSES.ble_version + 3, 0x0000_8000);
        // Neighbouring counters must not leak in.
        otp.set(FUSES.ble_version + 4, 0xffff);
        assert_eq!(secure_firmware_version(&mut otp, &FUSES, Firmware::Ble), Ok(5));
        assert_eq!(secure_firmware_version(&mut otp, &FUSES, Firmware::Wifi), Ok(0));
    }

    #[test]
    fn version_read_failure() {
        let mut otp = FakeOtp { fail_reads: true, ..Default::default() };
        assert_eq!(
            secure_firmware_version(&mut otp, &FUSES, Firmware::Wifi),
            Err(Error::Otp)
        );
    }

    #[test]
    fn antipole_mirrors_low_half() {
        assert_eq!(antipole(0x0000_0003), 0xfffc_0003);
        assert_eq!(antipole(0x1234_00ff), 0xff00_00ff);
    }

    #[cfg(not(feature = "eng-certificate"))]
    #[test]
    fn manifest_params_follow_revision() {
        let mut otp = FakeOtp { lifecycle: 0x3, ..Default::default() };
        for i in 0..12 {
            otp.set(FUSES.pck_blob + i, 0x0403_0201 + i);
        }

        let params = sb3_manifest_params(&mut otp, ChipRevision(1), &FUSES).unwrap();
        assert_eq!(params.rot.rkh, ROTKH_REV1);
        assert_eq!(params.rot.root_key_revocation, [0xaa; 4]);
        assert_eq!(params.rot.root_key_usage, [0, 7, 7, 7]);
        assert_eq!(params.rot.number_of_root_keys, 1);
        assert_eq!(params.rot.root_key_type_and_length, 0xfe01);
        assert_eq!(params.rot.lifecycle, 0xfffc_0003);
        assert_eq!(&params.pck_blob[..8], &[1, 2, 3, 4, 2, 2, 3, 4]);

        let params = sb3_manifest_params(&mut otp, ChipRevision(7), &FUSES).unwrap();
        assert_eq!(params.rot.rkh, [0; 12]);
    }

    #[test]
    fn otp_failure_is_reported_as_nboot_failure() {
        let mut otp = FakeOtp { fail_reads: true, ..Default::default() };
        let mut trust = OtpTrust::new(&mut otp, ChipRevision(0), &FUSES);
        assert_eq!(trust.manifest_params(), Err(NbootStatus::Fail));
    }
}
