use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use eyre::{Result, eyre};

use crate::Backend;

/// A bus side effect recorded by [`FakeBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    MapA24(u32),
    MapA32(u32),
    Write(u32, u32),
    Delay(Duration),
}

const EEPROM_BUSY: u32 = 1 << 8;
const SECTOR_SIZE: usize = 0x1_0000;

#[derive(Debug)]
struct Eeprom {
    csr_offset: u32,
    data_offset: u32,
    mem: Vec<u8>,
    mode: u32,
    read_data: u8,
    busy_polls: u32,
    busy_remaining: u32,
    stuck: bool,
    faults: HashMap<usize, u8>,
}

impl Eeprom {
    fn command(&mut self, data: u32) {
        let addr = (data >> 8) as usize;
        let byte = data as u8;
        match self.mode >> 29 {
            // bulk erase
            0b110 => self.mem.fill(0xff),
            0b101 => {
                let start = addr - addr % SECTOR_SIZE;
                let end = (start + SECTOR_SIZE).min(self.mem.len());
                if start < end {
                    self.mem[start..end].fill(0xff);
                }
            }
            0b100 => {
                let byte = self.faults.get(&addr).copied().unwrap_or(byte);
                if let Some(slot) = self.mem.get_mut(addr) {
                    *slot = byte;
                }
            }
            _ => self.read_data = self.mem.get(addr).copied().unwrap_or(0xff),
        }
        self.busy_remaining = self.busy_polls;
    }

    fn csr(&mut self) -> u32 {
        let busy = if self.stuck || self.busy_remaining > 0 {
            self.busy_remaining = self.busy_remaining.saturating_sub(1);
            EEPROM_BUSY
        } else {
            0
        };
        self.mode | busy | self.read_data as u32
    }
}

#[derive(Debug, Default)]
struct State {
    base: u32,
    mapped: Option<u32>,
    a32: Option<u32>,
    regs: HashMap<u32, u32>,
    scripted: HashMap<u32, VecDeque<u32>>,
    ops: Vec<Op>,
    fifo: VecDeque<u32>,
    dma_status: Option<i64>,
    eeprom: Option<Eeprom>,
    read_latency: Duration,
}

impl State {
    fn present(&self) -> bool {
        self.mapped == Some(self.base)
    }

    fn read(&mut self, offset: u32) -> u32 {
        if let Some(value) = self.scripted.get_mut(&offset).and_then(VecDeque::pop_front) {
            return value;
        }
        if let Some(eeprom) = &mut self.eeprom {
            if offset == eeprom.csr_offset {
                return eeprom.csr();
            }
        }
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn write(&mut self, offset: u32, value: u32) {
        self.ops.push(Op::Write(offset, value));
        if let Some(eeprom) = &mut self.eeprom {
            if offset == eeprom.csr_offset {
                eeprom.mode = value & 0xE000_0000;
                return;
            }
            if offset == eeprom.data_offset {
                eeprom.command(value);
                return;
            }
        }
        self.regs.insert(offset, value);
    }
}

/// In-memory stand-in for one module sitting at a fixed A24 address.
///
/// Clones share state, so a test can keep one clone for inspection while the
/// driver owns the other.
#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<State>>,
}

impl FakeBackend {
    /// A board answering only at `a24`.
    pub fn new(a24: u32) -> Self {
        let state = State {
            base: a24,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, offset: u32, value: u32) {
        self.state().regs.insert(offset, value);
    }

    pub fn get(&self, offset: u32) -> u32 {
        self.state().regs.get(&offset).copied().unwrap_or(0)
    }

    /// Queue values returned by the next reads of `offset`, ahead of the
    /// stored register value.
    pub fn script(&self, offset: u32, values: impl IntoIterator<Item = u32>) {
        self.state()
            .scripted
            .entry(offset)
            .or_default()
            .extend(values);
    }

    pub fn push_fifo(&self, words: impl IntoIterator<Item = u32>) {
        self.state().fifo.extend(words);
    }

    pub fn fifo_len(&self) -> usize {
        self.state().fifo.len()
    }

    /// Stall every register read by `latency`, outside the state lock, so
    /// other threads can reach the bus between a read and the write after it.
    pub fn slow_reads(&self, latency: Duration) {
        self.state().read_latency = latency;
    }

    /// Make the next DMA transfer return `status` instead of moving data.
    pub fn fail_dma(&self, status: i64) {
        self.state().dma_status = Some(status);
    }

    pub fn a32(&self) -> Option<u32> {
        self.state().a32
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state().ops.clone()
    }

    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.state()
            .ops
            .iter()
            .filter_map(|op| match *op {
                Op::Write(offset, value) => Some((offset, value)),
                _ => None,
            })
            .collect()
    }

    pub fn writes_to(&self, offset: u32) -> Vec<u32> {
        self.writes()
            .into_iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| v)
            .collect()
    }

    pub fn clear_ops(&self) {
        self.state().ops.clear();
    }

    /// Emulate a serial configuration EEPROM of `size` bytes behind a
    /// control/status register and an address/data register. Every command
    /// keeps the busy bit (bit 8) raised for `busy_polls` status reads.
    pub fn with_eeprom(
        self,
        csr_offset: u32,
        data_offset: u32,
        size: usize,
        busy_polls: u32,
    ) -> Self {
        self.state().eeprom = Some(Eeprom {
            csr_offset,
            data_offset,
            mem: vec![0xff; size],
            mode: 0,
            read_data: 0,
            busy_polls,
            busy_remaining: 0,
            stuck: false,
            faults: HashMap::new(),
        });
        self
    }

    /// Keep the EEPROM busy bit raised forever.
    pub fn stick_eeprom_busy(&self) {
        if let Some(eeprom) = &mut self.state().eeprom {
            eeprom.stuck = true;
        }
    }

    /// Store `value` at `addr` whenever that location is programmed.
    pub fn eeprom_fault(&self, addr: usize, value: u8) {
        if let Some(eeprom) = &mut self.state().eeprom {
            eeprom.faults.insert(addr, value);
        }
    }

    pub fn eeprom_contents(&self) -> Vec<u8> {
        self.state()
            .eeprom
            .as_ref()
            .map(|e| e.mem.clone())
            .unwrap_or_default()
    }
}

impl Backend for FakeBackend {
    fn map_a24(&mut self, a24: u32) -> Result<()> {
        let mut state = self.state();
        state.ops.push(Op::MapA24(a24));
        state.mapped = Some(a24);
        Ok(())
    }

    fn probe32(&mut self, offset: u32) -> Result<Option<u32>> {
        let mut state = self.state();
        if !state.present() {
            return Ok(None);
        }
        Ok(Some(state.read(offset)))
    }

    fn read32(&mut self, offset: u32) -> Result<u32> {
        let (value, latency) = {
            let mut state = self.state();
            if !state.present() {
                return Err(eyre!("bus error reading offset 0x{offset:02X}"));
            }
            (state.read(offset), state.read_latency)
        };
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        Ok(value)
    }

    fn write32(&mut self, offset: u32, value: u32) -> Result<()> {
        let mut state = self.state();
        if !state.present() {
            return Err(eyre!("bus error writing offset 0x{offset:02X}"));
        }
        state.write(offset, value);
        Ok(())
    }

    fn map_a32(&mut self, a32: u32) -> Result<()> {
        let mut state = self.state();
        state.ops.push(Op::MapA32(a32));
        state.a32 = Some(a32);
        Ok(())
    }

    fn read_fifo(&mut self) -> Result<Option<u32>> {
        let mut state = self.state();
        if state.a32.is_none() {
            return Err(eyre!("data window not mapped"));
        }
        Ok(state.fifo.pop_front())
    }

    fn dma(&mut self, dest: &mut [u32]) -> Result<i64> {
        let mut state = self.state();
        if state.a32.is_none() {
            return Err(eyre!("data window not mapped"));
        }
        if let Some(status) = state.dma_status.take() {
            return Ok(status);
        }
        let mut moved = 0;
        for slot in dest.iter_mut() {
            let Some(word) = state.fifo.pop_front() else {
                break;
            };
            *slot = word;
            moved += 1;
        }
        Ok(moved * 4)
    }

    fn delay(&mut self, duration: Duration) {
        self.state().ops.push(Op::Delay(duration));
    }
}
