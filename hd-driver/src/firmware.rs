//! Programming the module's configuration EEPROM.
//!
//! Every EEPROM access is a write to [`Reg::EepromData`] followed by polling
//! the busy bit of [`Reg::EepromCsr`]. The mode written to the CSR beforehand
//! selects what the data write does.

use std::{
    io::Read,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use hd_io::{Backend, units::Bytes};

use crate::{
    HelicityDecoder,
    config::Poll,
    device::Regs,
    error::{Diagnostic, Error, Result},
    registers::{Reg, eeprom},
};

/// Capacity of the configuration EEPROM.
pub const MAX_IMAGE_SIZE: usize = 0x80_0000;

const ERASE_MARK_POLLS: u32 = 100;
const BYTE_MARK: usize = 100_000;

/// Reverse the bit order of a byte.
pub const fn reverse_bits(b: u8) -> u8 {
    let b = (b & 0xF0) >> 4 | (b & 0x0F) << 4;
    let b = (b & 0xCC) >> 2 | (b & 0x33) << 2;
    (b & 0xAA) >> 1 | (b & 0x55) << 1
}

/// A firmware file, bit-reversed into the order the EEPROM shifts it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let image = Self::from_reader(std::fs::File::open(path)?)?;
        tracing::info!(
            path = %path.display(),
            bytes = image.len().0,
            "loaded firmware image"
        );
        Ok(image)
    }

    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let mut data = Vec::new();
        reader
            .take(MAX_IMAGE_SIZE as u64 + 1)
            .read_to_end(&mut data)?;
        Self::from_file_bytes(data)
    }

    /// Take bytes in file order.
    pub fn from_file_bytes(mut data: Vec<u8>) -> Result<Self> {
        if data.len() > MAX_IMAGE_SIZE {
            return Err(Error::ImageTooLarge {
                max: MAX_IMAGE_SIZE,
            });
        }
        for b in &mut data {
            *b = reverse_bits(*b);
        }
        Ok(Self { data })
    }

    pub fn len(&self) -> Bytes<usize> {
        Bytes(self.data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes as written to the EEPROM.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Reject an access outside the EEPROM before anything reaches the bus.
fn check_range(start: u32, len: usize) -> Result<()> {
    let in_range = (start as usize)
        .checked_add(len)
        .is_some_and(|end| end <= MAX_IMAGE_SIZE);
    if !in_range {
        return Err(Error::invalid(format!(
            "EEPROM access of {len} bytes at 0x{start:X} past 0x{MAX_IMAGE_SIZE:X}"
        )));
    }
    Ok(())
}

/// Wait out the busy bit, returning the final CSR value.
fn wait_idle<B: Backend + ?Sized>(
    regs: &mut Regs<'_, B>,
    poll: Poll,
    what: &'static str,
    mut on_poll: impl FnMut(u32),
) -> Result<u32> {
    let mut csr = 0;
    poll.wait(
        &mut *regs.bus,
        what,
        |bus| {
            csr = bus.read32(Reg::EepromCsr.offset())?;
            Ok(!eeprom::BUSY.is_set(csr))
        },
        &mut on_poll,
    )?;
    Ok(csr)
}

fn erase_all<B: Backend + ?Sized>(regs: &mut Regs<'_, B>) -> Result<()> {
    tracing::info!("erasing EEPROM");
    regs.write(Reg::EepromCsr, eeprom::BULK_ERASE)?;
    regs.write(Reg::EepromData, 0)?;
    let poll = regs.settings.erase_poll;
    wait_idle(regs, poll, "EEPROM bulk erase", |polls| {
        if polls % ERASE_MARK_POLLS == 0 {
            tracing::info!(polls, "erasing");
        }
    })?;
    regs.write(Reg::EepromCsr, eeprom::READ)?;
    tracing::info!("erase done");
    Ok(())
}

fn download<B: Backend + ?Sized>(
    regs: &mut Regs<'_, B>,
    image: &[u8],
    notify: Option<&AtomicUsize>,
) -> Result<()> {
    tracing::info!(bytes = image.len(), "writing EEPROM");
    regs.write(Reg::EepromCsr, eeprom::WRITE)?;
    let poll = regs.settings.byte_poll;
    for (address, &byte) in image.iter().enumerate() {
        regs.write(Reg::EepromData, eeprom::command(address as u32, byte))?;
        wait_idle(regs, poll, "EEPROM write", |_| {})?;
        if let Some(notify) = notify {
            notify.fetch_add(1, Ordering::Release);
        }
        if (address + 1) % BYTE_MARK == 0 {
            tracing::info!(bytes = address + 1, "written");
        }
    }
    regs.write(Reg::EepromCsr, eeprom::READ)?;
    tracing::info!("write done");
    Ok(())
}

fn read_byte<B: Backend + ?Sized>(regs: &mut Regs<'_, B>, address: u32) -> Result<u8> {
    regs.write(Reg::EepromData, eeprom::command(address, 0))?;
    let poll = regs.settings.byte_poll;
    let csr = wait_idle(regs, poll, "EEPROM read", |_| {})?;
    Ok(eeprom::DATA.get(csr) as u8)
}

fn verify<B: Backend + ?Sized>(
    regs: &mut Regs<'_, B>,
    image: &[u8],
    notify: Option<&AtomicUsize>,
) -> Result<()> {
    tracing::info!(bytes = image.len(), "verifying EEPROM");
    regs.write(Reg::EepromCsr, eeprom::READ)?;
    let mut mismatches = 0;
    for (address, &expected) in image.iter().enumerate() {
        let address = address as u32;
        let actual = read_byte(regs, address)?;
        if actual != expected {
            mismatches += 1;
            regs.report(Diagnostic::VerifyMismatch {
                address,
                expected,
                actual,
            });
        }
        if let Some(notify) = notify {
            notify.fetch_add(1, Ordering::Release);
        }
        if (address as usize + 1) % BYTE_MARK == 0 {
            tracing::info!(bytes = address + 1, "verified");
        }
    }
    if mismatches != 0 {
        return Err(Error::VerificationFailed { mismatches });
    }
    tracing::info!("verify done");
    Ok(())
}

/// One firmware update against a [`HelicityDecoder`].
pub struct FirmwareSession<'a, B> {
    hd: &'a HelicityDecoder<B>,
    image: Option<FirmwareImage>,
    notify: Option<&'a AtomicUsize>,
}

impl<'a, B: Backend> FirmwareSession<'a, B> {
    pub fn new(hd: &'a HelicityDecoder<B>) -> Self {
        Self {
            hd,
            image: None,
            notify: None,
        }
    }

    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<&FirmwareImage> {
        Ok(self.image.insert(FirmwareImage::load(path)?))
    }

    pub fn set_image(&mut self, image: FirmwareImage) {
        self.image = Some(image);
    }

    pub fn image(&self) -> Option<&FirmwareImage> {
        self.image.as_ref()
    }

    /// Count every byte written or verified into `notify` while `f` runs.
    pub fn with_notifications<T>(
        &mut self,
        notify: &'a AtomicUsize,
        f: impl FnOnce(&mut Self) -> T,
    ) -> T {
        let old_notify = self.notify.replace(notify);
        let r = f(self);
        self.notify = old_notify;
        r
    }

    fn image_bytes(&self) -> Result<&[u8]> {
        match &self.image {
            Some(image) if !image.is_empty() => Ok(image.as_bytes()),
            _ => Err(Error::NoImage),
        }
    }

    pub fn erase_all(&self) -> Result<()> {
        self.hd.with_regs(erase_all)
    }

    pub fn download(&self) -> Result<()> {
        let image = self.image_bytes()?;
        self.hd.with_regs(|regs| download(regs, image, self.notify))
    }

    /// Compare the whole EEPROM against the image. Every mismatch is
    /// reported as a diagnostic before failing.
    pub fn verify(&self) -> Result<()> {
        let image = self.image_bytes()?;
        self.hd.with_regs(|regs| verify(regs, image, self.notify))
    }

    /// Erase, write and verify while holding the bus the whole time.
    pub fn run(&self) -> Result<()> {
        let image = self.image_bytes()?;
        self.hd.with_regs(|regs| {
            erase_all(regs)?;
            download(regs, image, self.notify)?;
            verify(regs, image, self.notify)
        })
    }

    /// Erase the 64 KiB sector holding `address`.
    pub fn erase_sector(&self, address: u32) -> Result<()> {
        check_range(address, 1)?;
        self.hd.with_regs(|regs| {
            regs.write(Reg::EepromCsr, eeprom::SECTOR_ERASE)?;
            regs.write(Reg::EepromData, eeprom::command(address, 0))?;
            let poll = regs.settings.erase_poll;
            wait_idle(regs, poll, "EEPROM sector erase", |_| {})?;
            regs.write(Reg::EepromCsr, eeprom::READ)
        })
    }

    pub fn write_byte(&self, address: u32, byte: u8) -> Result<()> {
        check_range(address, 1)?;
        self.hd.with_regs(|regs| {
            regs.write(Reg::EepromCsr, eeprom::WRITE)?;
            regs.write(Reg::EepromData, eeprom::command(address, byte))?;
            let poll = regs.settings.byte_poll;
            wait_idle(regs, poll, "EEPROM write", |_| {})?;
            regs.write(Reg::EepromCsr, eeprom::READ)
        })
    }

    pub fn read_byte(&self, address: u32) -> Result<u8> {
        check_range(address, 1)?;
        self.hd.with_regs(|regs| {
            regs.write(Reg::EepromCsr, eeprom::READ)?;
            read_byte(regs, address)
        })
    }

    /// Read `len` bytes starting at `start`, in EEPROM order.
    pub fn dump(&self, start: u32, len: usize) -> Result<Vec<u8>> {
        check_range(start, len)?;
        self.hd.with_regs(|regs| {
            regs.write(Reg::EepromCsr, eeprom::READ)?;
            (start..)
                .take(len)
                .map(|address| read_byte(regs, address))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use hd_io::FakeBackend;
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;
    use crate::{InitOptions, Settings, testing};

    #[test]
    fn test_reverse_bits() {
        assert_eq!(reverse_bits(0x01), 0x80);
        assert_eq!(reverse_bits(0xF0), 0x0F);
        assert_eq!(reverse_bits(0b1100_1010), 0b0101_0011);
        for b in 0..=u8::MAX {
            assert_eq!(reverse_bits(reverse_bits(b)), b);
            assert_eq!(reverse_bits(b), b.reverse_bits());
        }
    }

    #[test]
    fn test_image_load() {
        let file = hex::decode("0180ff3c").unwrap();
        let image = FirmwareImage::from_reader(&file[..]).unwrap();
        assert_eq!(image.as_bytes(), [0x80, 0x01, 0xff, 0x3c]);
        assert_eq!(image.len(), Bytes(4));

        let too_big = vec![0; MAX_IMAGE_SIZE + 1];
        assert!(matches!(
            FirmwareImage::from_reader(&too_big[..]),
            Err(Error::ImageTooLarge { .. })
        ));
        let exact = vec![0; MAX_IMAGE_SIZE];
        assert!(FirmwareImage::from_reader(&exact[..]).is_ok());

        assert!(matches!(
            FirmwareImage::load("/nonexistent/firmware.bin"),
            Err(Error::Io(_))
        ));
    }

    fn image(len: usize) -> FirmwareImage {
        FirmwareImage::from_file_bytes((0..len).map(|i| (i * 7) as u8).collect()).unwrap()
    }

    #[test]
    fn test_session_programs_eeprom() {
        let (hd, fake) = testing::initialized();
        let notify = AtomicUsize::new(0);
        let mut session = FirmwareSession::new(&hd);
        assert!(matches!(session.run(), Err(Error::NoImage)));
        session.set_image(FirmwareImage::from_file_bytes(Vec::new()).unwrap());
        assert!(matches!(session.download(), Err(Error::NoImage)));

        let image = image(300);
        session.set_image(image.clone());
        session.with_notifications(&notify, |s| s.run()).unwrap();
        assert_eq!(notify.load(Ordering::Acquire), 600);

        let contents = fake.eeprom_contents();
        assert_eq!(&contents[..300], image.as_bytes());
        assert!(contents[300..].iter().all(|&b| b == 0xff));
        assert_eq!(
            session.dump(1, 2).unwrap(),
            image.as_bytes()[1..3].to_vec()
        );
        assert!(hd.take_diagnostics().is_empty());

        // erase, write, verify, dump
        let csr = fake.writes_to(Reg::EepromCsr.offset());
        assert_eq!(
            csr,
            [
                eeprom::BULK_ERASE,
                eeprom::READ,
                eeprom::WRITE,
                eeprom::READ,
                eeprom::READ,
                eeprom::READ,
            ]
        );
    }

    #[test]
    fn test_verify_scans_past_mismatch() {
        let (hd, fake) = testing::initialized();
        fake.eeprom_fault(10, 0x5A);
        let mut session = FirmwareSession::new(&hd);
        let image = image(64);
        session.set_image(image.clone());
        session.erase_all().unwrap();
        session.download().unwrap();

        fake.clear_ops();
        assert!(matches!(
            session.verify(),
            Err(Error::VerificationFailed { mismatches: 1 })
        ));
        // every address was still read back
        let reads = fake.writes_to(Reg::EepromData.offset());
        assert_eq!(reads.len(), 64);
        assert_eq!(reads.last(), Some(&(63 << 8)));
        assert_eq!(
            hd.take_diagnostics(),
            [Diagnostic::VerifyMismatch {
                address: 10,
                expected: image.as_bytes()[10],
                actual: 0x5A
            }]
        );
    }

    #[test]
    fn test_stuck_busy_times_out() {
        let settings = Settings {
            erase_poll: Poll {
                interval: std::time::Duration::from_millis(1),
                limit: 50,
            },
            ..Default::default()
        };
        let fake: FakeBackend = testing::fake();
        let hd = HelicityDecoder::with_settings(fake.clone(), settings);
        hd.initialize(crate::InitOptions {
            address: testing::A24,
            ..Default::default()
        })
        .unwrap();
        fake.stick_eeprom_busy();

        let mut session = FirmwareSession::new(&hd);
        session.set_image(image(4));
        assert!(matches!(
            session.run(),
            Err(Error::Timeout { polls: 50, .. })
        ));
        // the session released the handle
        assert!(hd.enable().is_ok());
    }

    #[test]
    fn test_verify_marks_progress() {
        let fake = FakeBackend::new(testing::A24).with_eeprom(
            Reg::EepromCsr.offset(),
            Reg::EepromData.offset(),
            0x4_0000,
            0,
        );
        fake.set(Reg::Version.offset(), testing::VERSION);
        let hd = HelicityDecoder::new(fake);
        hd.initialize(InitOptions {
            address: 5,
            ..Default::default()
        })
        .unwrap();

        // an erased EEPROM already matches an all-ones image
        let mut session = FirmwareSession::new(&hd);
        session.set_image(FirmwareImage::from_file_bytes(vec![0xff; 250_000]).unwrap());
        let messages = testing::Messages::default();
        let subscriber = tracing_subscriber::registry().with(messages.clone());
        tracing::subscriber::with_default(subscriber, || session.verify()).unwrap();

        assert_eq!(messages.count("verified"), 2);
        assert_eq!(messages.count("verify done"), 1);
        assert_eq!(messages.count("written"), 0);
    }

    #[test]
    fn test_out_of_range_access_rejected() {
        let (hd, fake) = testing::initialized();
        let session = FirmwareSession::new(&hd);
        fake.clear_ops();

        // 0x0100_0010 would alias address 0x10 once shifted into the command
        assert!(matches!(
            session.write_byte(0x0100_0010, 0x42),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            session.read_byte(MAX_IMAGE_SIZE as u32),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            session.erase_sector(0x0100_0000),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            session.dump(u32::MAX, 2),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            session.dump(MAX_IMAGE_SIZE as u32 - 1, 2),
            Err(Error::InvalidArgument(_))
        ));
        assert!(fake.writes().is_empty());
        assert_eq!(fake.eeprom_contents()[0x10], 0xff);

        assert_eq!(session.dump(0x3fe, 2).unwrap(), [0xff, 0xff]);
        session.write_byte(MAX_IMAGE_SIZE as u32 - 1, 0x42).unwrap();
    }

    #[test]
    fn test_single_byte_access() {
        let (hd, fake) = testing::initialized();
        let session = FirmwareSession::new(&hd);
        session.write_byte(0x10, 0xA5).unwrap();
        assert_eq!(session.read_byte(0x10).unwrap(), 0xA5);
        session.erase_sector(0x10).unwrap();
        assert_eq!(session.read_byte(0x10).unwrap(), 0xFF);
        assert_eq!(fake.eeprom_contents()[0x10], 0xFF);
    }
}
