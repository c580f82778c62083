use std::time::Duration;

use eyre::Result;

/// A bridge able to reach a single VME module.
///
/// Register offsets are byte offsets into the A24 window selected with
/// [`Backend::map_a24`]. FIFO reads and DMA go through the A32 data window
/// selected with [`Backend::map_a32`]. All words are returned in host order.
pub trait Backend {
    /// Point register accesses at the A24 window starting at `a24`.
    fn map_a24(&mut self, a24: u32) -> Result<()>;

    /// Read a register, returning `None` if the access ended in a bus error.
    fn probe32(&mut self, offset: u32) -> Result<Option<u32>>;

    fn read32(&mut self, offset: u32) -> Result<u32>;
    fn write32(&mut self, offset: u32, value: u32) -> Result<()>;

    /// Point FIFO accesses at the A32 window starting at `a32`.
    fn map_a32(&mut self, a32: u32) -> Result<()>;

    /// Read one word from the data window, `None` on bus error.
    fn read_fifo(&mut self) -> Result<Option<u32>>;

    /// Run a blocking DMA transfer out of the data window into `dest`.
    ///
    /// Returns the number of bytes transferred, or the engine's negative
    /// status code.
    fn dma(&mut self, dest: &mut [u32]) -> Result<i64>;

    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn map_a24(&mut self, a24: u32) -> Result<()> {
        B::map_a24(&mut *self, a24)
    }

    fn probe32(&mut self, offset: u32) -> Result<Option<u32>> {
        B::probe32(&mut *self, offset)
    }

    fn read32(&mut self, offset: u32) -> Result<u32> {
        B::read32(&mut *self, offset)
    }

    fn write32(&mut self, offset: u32, value: u32) -> Result<()> {
        B::write32(&mut *self, offset, value)
    }

    fn map_a32(&mut self, a32: u32) -> Result<()> {
        B::map_a32(&mut *self, a32)
    }

    fn read_fifo(&mut self) -> Result<Option<u32>> {
        B::read_fifo(&mut *self)
    }

    fn dma(&mut self, dest: &mut [u32]) -> Result<i64> {
        B::dma(&mut *self, dest)
    }

    fn delay(&mut self, duration: Duration) {
        B::delay(&mut *self, duration)
    }
}
