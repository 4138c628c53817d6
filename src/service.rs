// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware download service for the radio CPUs.
//!
//! Each radio firmware lives in flash in one of two partitions, A and B. A
//! partition holds either an SB3.1 image, which is authenticated and
//! version-checked against OTP, or an unsigned raw image. The service picks
//! a partition, streams it through the loader, and releases the radio CPU.

use core::cmp::min;
use embedded_storage::ReadStorage;
use zerocopy::FromBytes;

use crate::bsp::Bsp;
use crate::flash::XipFlash;
use crate::loader::{LoaderConfig, LoaderContext};
use crate::memory::LoadMemory;
use crate::nboot::Nboot;
use crate::raw::{load_raw_image, RawLoad};
#[cfg(feature = "vdll")]
use crate::sb3::SB3_MAGIC;
use crate::sb3::{Sb3Header, SB3_HEADER_SIZE};
use crate::trust::{secure_firmware_version, FuseMap, Otp, OtpTrust};
use crate::{Error, Firmware, PumpStatus, SlotId};

/// Bytes read from flash per pump call.
pub const SB_PACKET_SIZE: usize = 512;

pub const WIFI_IMAGE_SIZE_MAX: u32 = 0xa_0000;
pub const BLE_IMAGE_SIZE_MAX: u32 = 0x5_0000;
pub const IEEE802154_IMAGE_SIZE_MAX: u32 = 0x5_0000;

pub const WIFI_IMAGE_A_OFFSET: u32 = 0x0840_0000;
pub const WIFI_IMAGE_B_OFFSET: u32 = WIFI_IMAGE_A_OFFSET + WIFI_IMAGE_SIZE_MAX;
pub const BLE_IMAGE_A_OFFSET: u32 = WIFI_IMAGE_B_OFFSET + WIFI_IMAGE_SIZE_MAX;
pub const BLE_IMAGE_B_OFFSET: u32 = BLE_IMAGE_A_OFFSET + BLE_IMAGE_SIZE_MAX;
pub const IEEE802154_IMAGE_A_OFFSET: u32 = BLE_IMAGE_B_OFFSET + BLE_IMAGE_SIZE_MAX;
pub const IEEE802154_IMAGE_B_OFFSET: u32 = IEEE802154_IMAGE_A_OFFSET + IEEE802154_IMAGE_SIZE_MAX;

/// Activation is polled this many times, `ACTIVATION_POLL_US` apart.
const ACTIVATION_POLLS: u32 = 200;
const ACTIVATION_POLL_US: u32 = 5_000;

impl Firmware {
    pub fn image_size_max(self) -> u32 {
        match self {
            Firmware::Wifi => WIFI_IMAGE_SIZE_MAX,
            Firmware::Ble => BLE_IMAGE_SIZE_MAX,
            Firmware::Ieee802154 => IEEE802154_IMAGE_SIZE_MAX,
        }
    }

    /// Addresses of partitions A and B. A zero `source` means the default
    /// flash layout; otherwise A starts at `source` and B follows it.
    pub fn partitions(self, source: u32) -> Result<(u32, u32), Error> {
        if source != 0 {
            let b = source
                .checked_add(self.image_size_max())
                .ok_or(Error::BadSourceAddress(source))?;
            return Ok((source, b));
        }
        Ok(match self {
            Firmware::Wifi => (WIFI_IMAGE_A_OFFSET, WIFI_IMAGE_B_OFFSET),
            Firmware::Ble => (BLE_IMAGE_A_OFFSET, BLE_IMAGE_B_OFFSET),
            Firmware::Ieee802154 => (IEEE802154_IMAGE_A_OFFSET, IEEE802154_IMAGE_B_OFFSET),
        })
    }
}

/// What to load, and whether it sits in a single (monolithic) partition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LoadTarget {
    pub firmware: Firmware,
    pub monolithic: bool,
}

impl LoadTarget {
    pub fn new(firmware: Firmware) -> Self {
        Self { firmware, monolithic: false }
    }

    pub fn monolithic(firmware: Firmware) -> Self {
        Self { firmware, monolithic: true }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceConfig {
    pub loader: LoaderConfig,
    pub fuses: FuseMap,
}

/// A partition and the header found at its start.
#[derive(Copy, Clone, Debug)]
pub struct Candidate {
    pub slot: SlotId,
    pub address: u32,
    pub header: Sb3Header,
}

impl Candidate {
    pub fn is_sb3(&self) -> bool {
        self.header.has_magic()
    }

    pub fn version(&self) -> u32 {
        self.header.firmware_version.get()
    }

    fn check_version(&self, minimum: u32) -> Result<Selection, Error> {
        let version = self.version();
        if version < minimum {
            warn!(
                "slot {:?} version {} below OTP minimum {}",
                self.slot,
                version,
                minimum
            );
            return Err(Error::RollbackBlocked { image: version, minimum });
        }
        Ok(Selection::Sb3 { slot: self.slot, address: self.address, version })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Selection {
    /// Neither partition holds an SB3 image; treat A as a raw image.
    Raw { address: u32 },
    Sb3 { slot: SlotId, address: u32, version: u32 },
}

/// Picks between two partitions. If both hold SB3 images the higher version
/// wins, with A winning ties. The winner must not be older than `minimum`;
/// the other partition is not tried in its place.
pub fn select_partition(a: &Candidate, b: &Candidate, minimum: u32) -> Result<Selection, Error> {
    let chosen = match (a.is_sb3(), b.is_sb3()) {
        (false, false) => return Ok(Selection::Raw { address: a.address }),
        (true, false) => a,
        (false, true) => b,
        (true, true) => {
            if a.version() >= b.version() {
                a
            } else {
                b
            }
        }
    };
    chosen.check_version(minimum)
}

/// Same as [`select_partition`] for a single partition.
pub fn select_single(candidate: &Candidate, minimum: u32) -> Result<Selection, Error> {
    if candidate.is_sb3() {
        candidate.check_version(minimum)
    } else {
        Ok(Selection::Raw { address: candidate.address })
    }
}

#[cfg(feature = "mcuboot")]
mod mcuboot {
    use zerocopy::byteorder::{LittleEndian, U16, U32};
    use zerocopy::{AsBytes, FromBytes};

    pub const IMAGE_MAGIC: u32 = 0x96f3_b83d;

    #[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
    #[repr(C)]
    pub struct ImageHeader {
        pub magic: U32<LittleEndian>,
        pub load_addr: U32<LittleEndian>,
        pub hdr_size: U16<LittleEndian>,
        pub protect_tlv_size: U16<LittleEndian>,
    }
}

pub struct FirmwareLoader<B, F, N, O, M> {
    bsp: B,
    flash: F,
    nboot: N,
    otp: O,
    memory: M,
    config: ServiceConfig,
    context: LoaderContext,
    /// Where the Wi-Fi image's VDLL region starts, once a Wi-Fi load has
    /// found it.
    #[cfg(feature = "vdll")]
    vdll_base: Option<u32>,
}

impl<B, F, N, O, M> FirmwareLoader<B, F, N, O, M>
where
    B: Bsp,
    F: ReadStorage,
    N: Nboot,
    O: Otp,
    M: LoadMemory,
{
    pub fn new(bsp: B, flash: F, nboot: N, otp: O, memory: M, config: ServiceConfig) -> Self {
        Self {
            bsp,
            flash,
            nboot,
            otp,
            memory,
            config,
            context: LoaderContext::new(config.loader),
            #[cfg(feature = "vdll")]
            vdll_base: None,
        }
    }

    pub fn bsp(&self) -> &B {
        &self.bsp
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    #[cfg(feature = "vdll")]
    pub fn vdll_base(&self) -> Option<u32> {
        self.vdll_base
    }

    /// Loads `target` unless it is already running, then waits for it to
    /// come up.
    pub fn download_firmware(&mut self, target: LoadTarget, source: u32) -> Result<(), Error> {
        let firmware = target.firmware;
        if self.bsp.firmware_active(firmware) {
            info!("{:?} firmware already active", firmware);
            return Ok(());
        }

        if target.monolithic {
            self.load_service_monolithic(firmware, source)?;
        } else {
            self.load_service(firmware, source)?;
        }

        for _ in 0..ACTIVATION_POLLS {
            if self.bsp.firmware_active(firmware) {
                info!("{:?} firmware active", firmware);
                return Ok(());
            }
            self.bsp.delay_us(ACTIVATION_POLL_US);
        }
        error!("{:?} firmware did not come up", firmware);
        Err(Error::ActivationTimeout)
    }

    /// Powers the target CPU down and downloads it again.
    pub fn reset_firmware(&mut self, target: LoadTarget, source: u32) -> Result<(), Error> {
        self.bsp.power_off(target.firmware);
        self.download_firmware(target, source)
    }

    /// Loads `firmware` from the better of its two partitions.
    pub fn load_service(&mut self, firmware: Firmware, source: u32) -> Result<(), Error> {
        let (a, b) = firmware.partitions(source)?;
        self.run_load(firmware, |this, minimum| {
            #[cfg(feature = "mcuboot")]
            let (a, b) = (this.skip_mcuboot_header(a)?, this.skip_mcuboot_header(b)?);

            let a = this.candidate(SlotId::A, a)?;
            let b = this.candidate(SlotId::B, b)?;
            let selection = select_partition(&a, &b, minimum)?;
            this.load_selection(firmware, selection, firmware.image_size_max())
        })
    }

    /// Loads `firmware` from the single partition at `source`.
    pub fn load_service_monolithic(&mut self, firmware: Firmware, source: u32) -> Result<(), Error> {
        if source == 0 {
            return Err(Error::MissingSource);
        }
        self.run_load(firmware, |this, minimum| {
            let candidate = this.candidate(SlotId::A, source)?;
            let selection = select_single(&candidate, minimum)?;
            this.load_selection(firmware, selection, firmware.image_size_max())
        })
    }

    /// Loads the VDLL image `offset` bytes into the region a previous Wi-Fi
    /// load found. VDLL images have no B partition and no rollback counter,
    /// and the Wi-Fi CPU is already running, so it is neither powered nor
    /// reset.
    #[cfg(feature = "vdll")]
    pub fn load_vdll(&mut self, offset: u32) -> Result<(), Error> {
        let base = self.vdll_base.ok_or(Error::MissingSource)?;
        let address = base.checked_add(offset).ok_or(Error::BadSourceAddress(base))?;
        debug!("VDLL image at {:#x}", address);

        let flash_enabled = self.bsp.flash_enable();
        let result = self.with_otp(|this| {
            let candidate = this.candidate(SlotId::A, address)?;
            if candidate.is_sb3() {
                this.sb_file(address, WIFI_IMAGE_SIZE_MAX).map(|_| ())
            } else {
                this.process_raw_file(address, WIFI_IMAGE_SIZE_MAX).map(|_| ())
            }
        });
        if flash_enabled {
            self.bsp.flash_disable();
        }
        result
    }

    /// Common frame of a load: hardware up, OTP minimum version, target CPU
    /// powered, `body`, then reset on success and hardware down again.
    fn run_load(
        &mut self,
        firmware: Firmware,
        body: impl FnOnce(&mut Self, u32) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let flash_enabled = self.bsp.flash_enable();

        let result = self.with_otp(|this| {
            let minimum = secure_firmware_version(&mut this.otp, &this.config.fuses, firmware)?;
            debug!("{:?} minimum version {}", firmware, minimum);
            this.bsp.power_on(firmware);
            body(this, minimum)
        });

        if result.is_ok() {
            self.bsp.reset_device(firmware);
        }
        if flash_enabled {
            self.bsp.flash_disable();
        }
        result
    }

    /// Runs `body` with OTP up, and takes OTP down again afterwards if this
    /// call brought it up.
    fn with_otp<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let otp_initialized = self.otp.init()?;
        let result = body(self);
        if otp_initialized {
            if let Err(e) = self.otp.deinit() {
                warn!("OTP deinit failed: {:?}", e);
            }
        }
        result
    }

    fn xip(&mut self) -> XipFlash<'_, F> {
        let remap = self.bsp.flash_remap_offset();
        XipFlash::new(&mut self.flash, remap)
    }

    fn candidate(&mut self, slot: SlotId, address: u32) -> Result<Candidate, Error> {
        let mut buf = [0u8; SB3_HEADER_SIZE];
        self.xip().read(address, &mut buf)?;
        let header = Sb3Header::read_from(&buf[..]).ok_or(Error::Flash)?;
        Ok(Candidate { slot, address, header })
    }

    #[cfg(feature = "mcuboot")]
    fn skip_mcuboot_header(&mut self, address: u32) -> Result<u32, Error> {
        use zerocopy::AsBytes;

        let mut header = mcuboot::ImageHeader::default();
        self.xip().read(address, header.as_bytes_mut())?;
        if header.magic.get() == mcuboot::IMAGE_MAGIC {
            address
                .checked_add(u32::from(header.hdr_size.get()))
                .ok_or(Error::BadSourceAddress(address))
        } else {
            Ok(address)
        }
    }

    fn load_selection(
        &mut self,
        firmware: Firmware,
        selection: Selection,
        limit: u32,
    ) -> Result<(), Error> {
        info!("loading {:?}", selection);
        let tail = match selection {
            Selection::Raw { address } => self.process_raw_file(address, limit)?.end,
            Selection::Sb3 { address, .. } => self.sb_file(address, limit)?,
        };
        self.image_loaded(firmware, selection, tail);
        Ok(())
    }

    #[cfg(not(feature = "vdll"))]
    fn image_loaded(&mut self, _firmware: Firmware, _selection: Selection, _tail: u32) {}

    /// A Wi-Fi image is followed in flash by its VDLL region. After a raw
    /// image that is right behind the terminator; after an SB3 image it is
    /// the next SB3 header in or just past the last packet read.
    #[cfg(feature = "vdll")]
    fn image_loaded(&mut self, firmware: Firmware, selection: Selection, tail: u32) {
        if firmware != Firmware::Wifi {
            return;
        }
        self.vdll_base = match selection {
            Selection::Raw { .. } => Some(tail),
            Selection::Sb3 { address, .. } => self.find_sb3_header(tail, address),
        };
        debug!("VDLL region at {:?}", self.vdll_base);
    }

    /// Word-aligned scan of a packet and a little past it for an SB3 header
    /// other than the one at `image`.
    #[cfg(feature = "vdll")]
    fn find_sb3_header(&mut self, from: u32, image: u32) -> Option<u32> {
        const SCAN_WORDS: u32 = (SB_PACKET_SIZE as u32 + 7) / 4;

        let start = from.checked_add(3)? & !3;
        let mut xip = self.xip();
        for i in 0..SCAN_WORDS {
            let address = start.checked_add(i * 4)?;
            let mut word = [0u8; 4];
            if xip.read(address, &mut word).is_err() {
                break;
            }
            if address != image && u32::from_le_bytes(word) == SB3_MAGIC {
                return Some(address);
            }
        }
        warn!("no VDLL region after {:#x}", from);
        None
    }

    /// Streams the SB3 image at `address` through the loader. The image must
    /// reach its `Execute` range within `limit` bytes.
    pub fn process_sb_file(&mut self, address: u32, limit: u32) -> Result<(), Error> {
        self.sb_file(address, limit).map(|_| ())
    }

    /// `process_sb_file`, returning the address of the last packet read.
    fn sb_file(&mut self, address: u32, limit: u32) -> Result<u32, Error> {
        let crypto_enabled = self.bsp.crypto_enable();
        let result = self.stream_sb_file(address, limit);

        let status = self.nboot.context_deinit();
        if !status.is_success() {
            warn!("nboot context deinit: {:?}", status);
        }
        if crypto_enabled {
            self.bsp.crypto_disable();
        }
        result
    }

    fn stream_sb_file(&mut self, address: u32, limit: u32) -> Result<u32, Error> {
        self.nboot.context_init().check(|s| {
            error!("nboot context init: {:?}", s);
            Error::ContextInit(s)
        })?;
        self.context.init(self.config.loader);

        let revision = self.bsp.chip_revision();
        let remap = self.bsp.flash_remap_offset();
        let mut flash = XipFlash::new(&mut self.flash, remap);
        let mut trust = OtpTrust::new(&mut self.otp, revision, &self.config.fuses);
        let mut packet = [0u8; SB_PACKET_SIZE];
        let mut offset = 0;

        loop {
            if offset >= limit {
                error!("SB3 image runs past {} bytes", limit);
                return Err(Error::EofReached);
            }
            let n = min(SB_PACKET_SIZE as u32, limit - offset) as usize;
            let packet_address = address.checked_add(offset).ok_or(Error::EofReached)?;
            flash.read(packet_address, &mut packet[..n])?;

            let status =
                self.context
                    .pump(&mut self.nboot, &mut trust, &mut self.memory, &packet[..n])?;
            match status {
                PumpStatus::NeedMoreData => offset += n as u32,
                PumpStatus::PendingJump => {
                    self.context.finalize()?;
                    return Ok(packet_address);
                }
            }
        }
    }

    /// Copies the raw image at `address`, which must end within `limit`
    /// bytes.
    pub fn process_raw_file(&mut self, address: u32, limit: u32) -> Result<RawLoad, Error> {
        let memory_map = self.config.loader.memory_map;
        let remap = self.bsp.flash_remap_offset();
        let mut flash = XipFlash::new(&mut self.flash, remap);
        load_raw_image(&mut flash, &mut self.memory, &memory_map, address, limit)
    }
}
