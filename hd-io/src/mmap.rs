use std::{fs::File, path::Path};

use eyre::{Result, WrapErr, eyre};
use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, instrument};

use crate::Backend;

/// Size of the register window mapped for one module.
const REGISTER_WINDOW: usize = 0x1000;
/// The data FIFO answers at any address in its window; one page is enough.
const DATA_WINDOW: usize = 0x1000;

/// Register and data windows mapped out of a bridge's address-space device
/// files (one file per address modifier, offset = bus address).
pub struct MmapBackend {
    a24_file: File,
    a32_file: File,
    regs: Option<MmapMut>,
    data: Option<MmapMut>,
}

impl MmapBackend {
    pub fn open(a24: impl AsRef<Path>, a32: impl AsRef<Path>) -> Result<Self> {
        let open = |path: &Path| {
            File::options()
                .read(true)
                .write(true)
                .open(path)
                .wrap_err_with(|| format!("failed to open {}", path.display()))
        };
        Ok(Self {
            a24_file: open(a24.as_ref())?,
            a32_file: open(a32.as_ref())?,
            regs: None,
            data: None,
        })
    }
}

fn map(file: &File, base: u32, len: usize) -> Result<MmapMut> {
    // SAFETY: the device file is a window onto bus space, nothing else in this
    // process aliases it and it is only touched through volatile accesses.
    unsafe { MmapOptions::new().offset(base as u64).len(len).map_mut(file) }
        .wrap_err_with(|| format!("failed to map window at 0x{base:08X}"))
}

fn word_ptr(map: &mut MmapMut, offset: u32) -> Result<*mut u32> {
    let offset = offset as usize;
    if offset % 4 != 0 || offset + 4 > map.len() {
        return Err(eyre!("offset 0x{offset:X} outside mapped window"));
    }
    // SAFETY: bounds and alignment checked above, mappings are page aligned.
    Ok(unsafe { map.as_mut_ptr().add(offset).cast::<u32>() })
}

impl Backend for MmapBackend {
    #[instrument(skip_all)]
    fn map_a24(&mut self, a24: u32) -> Result<()> {
        debug!(a24 = format_args!("0x{a24:06X}"), "mapping register window");
        self.regs = Some(map(&self.a24_file, a24, REGISTER_WINDOW)?);
        Ok(())
    }

    fn probe32(&mut self, offset: u32) -> Result<Option<u32>> {
        // Bus errors surface as SIGBUS on a plain mapping, so a probe is a read.
        self.read32(offset).map(Some)
    }

    fn read32(&mut self, offset: u32) -> Result<u32> {
        let regs = self.regs.as_mut().ok_or_else(|| eyre!("register window not mapped"))?;
        let ptr = word_ptr(regs, offset)?;
        // SAFETY: pointer checked by `word_ptr`.
        Ok(u32::from_be(unsafe { ptr.read_volatile() }))
    }

    fn write32(&mut self, offset: u32, value: u32) -> Result<()> {
        let regs = self.regs.as_mut().ok_or_else(|| eyre!("register window not mapped"))?;
        let ptr = word_ptr(regs, offset)?;
        // SAFETY: pointer checked by `word_ptr`.
        unsafe { ptr.write_volatile(value.to_be()) };
        Ok(())
    }

    #[instrument(skip_all)]
    fn map_a32(&mut self, a32: u32) -> Result<()> {
        debug!(a32 = format_args!("0x{a32:08X}"), "mapping data window");
        self.data = Some(map(&self.a32_file, a32, DATA_WINDOW)?);
        Ok(())
    }

    fn read_fifo(&mut self) -> Result<Option<u32>> {
        let data = self.data.as_mut().ok_or_else(|| eyre!("data window not mapped"))?;
        let ptr = word_ptr(data, 0)?;
        // SAFETY: pointer checked by `word_ptr`.
        Ok(Some(u32::from_be(unsafe { ptr.read_volatile() })))
    }

    fn dma(&mut self, _dest: &mut [u32]) -> Result<i64> {
        Err(eyre!("the mmap backend has no DMA engine"))
    }
}
