use hd_io::{
    Backend, Hex,
    units::{Bytes, Words32},
};

use crate::{
    HelicityDecoder,
    device::Regs,
    error::{Error, Result},
    format,
    registers::Reg,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ReadMode {
    /// Blocking transfer through the bridge's DMA engine, armed by the caller.
    Dma,
    #[default]
    Programmed,
}

/// Run `f` with bus error reporting turned off, restoring the previous
/// setting on every exit.
fn with_berr_disabled<B: Backend + ?Sized, T>(
    regs: &mut Regs<'_, B>,
    f: impl FnOnce(&mut Regs<'_, B>) -> Result<T>,
) -> Result<T> {
    let enabled = regs.berr()?;
    if enabled {
        regs.set_berr(false)?;
    }
    let out = f(regs);
    if enabled {
        let restored = regs.set_berr(true);
        if out.is_ok() {
            restored?;
        }
    }
    out
}

fn read_dma<B: Backend + ?Sized>(regs: &mut Regs<'_, B>, buf: &mut [u32]) -> Result<usize> {
    // the engine wants an 8-byte aligned destination
    let start = if buf.as_ptr() as usize % 8 != 0 {
        buf[0] = format::filler_word(regs.board.slot());
        1
    } else {
        0
    };
    let status = regs.bus.dma(&mut buf[start..])?;
    if status < 0 {
        tracing::error!(status, "DMA transfer failed");
        return Err(Error::Dma(status));
    }
    let (Words32(words), Bytes(extra)) = Bytes(status as usize).as_words();
    if extra != 0 {
        tracing::warn!(bytes = status, "DMA transfer ended mid-word");
    }
    Ok(start + words)
}

fn read_programmed<B: Backend + ?Sized>(
    regs: &mut Regs<'_, B>,
    buf: &mut [u32],
) -> Result<usize> {
    let header = regs.bus.read_fifo()?;
    let header = match header {
        Some(word) if format::is_block_header(word) => word,
        other => {
            let events = regs.read(Reg::EventsOnBoard)?;
            if events == 0 {
                return Ok(0);
            }
            let word = other.unwrap_or(0);
            tracing::error!(word = %Hex(word), events, "invalid block header");
            return Err(Error::InvalidHeader(word));
        }
    };
    buf[0] = header;

    let mut count = 1;
    while count < buf.len() {
        let Some(word) = regs.bus.read_fifo()? else {
            return Err(Error::Truncated { words: count });
        };
        buf[count] = word;
        count += 1;
        if format::is_block_trailer(word) {
            break;
        }
    }
    Ok(count)
}

impl<B: Backend> HelicityDecoder<B> {
    /// Drain one block from the FIFO into `buf`, returning the number of
    /// words written, header and trailer included. An empty FIFO with no
    /// events on board reads as 0 words.
    pub fn read_block(&self, buf: &mut [u32], mode: ReadMode) -> Result<usize> {
        if buf.is_empty() {
            return Err(Error::invalid("read buffer is empty"));
        }
        self.with_regs(|regs| match mode {
            ReadMode::Dma => read_dma(regs, buf),
            ReadMode::Programmed => with_berr_disabled(regs, |regs| read_programmed(regs, buf)),
        })
    }
}
