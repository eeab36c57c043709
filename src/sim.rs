//! Simulated controller and flash devices for the unit tests.
//!
//! Implements [`AhbBus`] over a register file, per-chip-select flash
//! images, a byte-stream decoder for user-mode sessions (honoring the
//! latched address width in the control register) and a checksum engine
//! whose result is clean only for a configurable set of divider/delay
//! pairs.

use std::collections::{HashSet, VecDeque};

use crate::bus::AhbBus;
use crate::regs::{self, CeCtrl, CeMode, Ctrl, DmaCtrl, IntrCtrl, SegmentAddr};
use crate::{Config, FlashParams};

pub const AHB_BASE: u32 = 0x2000_0000;
pub const AHB_SIZE: u32 = 0x1000_0000;

const REG_WORDS: usize = 0x100 / 4;

pub fn test_config(flash_count: u8) -> Config {
    Config {
        hclk_hz: 200_000_000,
        flash_count,
        ..Config::default()
    }
}

pub fn test_params(size: u32) -> FlashParams {
    FlashParams {
        size,
        page_size: 256,
        sector_size: 4096,
        erase_size: 4096,
        read_opcode: 0x03,
        write_opcode: 0x02,
        erase_opcode: 0x20,
        dummy_bytes: 0,
        max_hz: 50_000_000,
        dual_io: false,
    }
}

/// Deterministic flash content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(7) as u8)
        .collect()
}

struct Session {
    cs: u8,
    rx: Vec<u8>,
    reads_done: usize,
}

pub struct SimBus {
    pub regs: [u32; REG_WORDS],
    pub flash: Vec<Vec<u8>>,
    pub ahb_base: u32,
    pub ahb_size: u32,

    /// Total register writes, for asserting the absence of side effects.
    pub reg_writes: usize,
    /// Checksum runs started on the DMA engine.
    pub dma_runs: usize,
    /// When set the DMA status bit never rises.
    pub dma_hang: bool,
    /// Checksum reported for clean timing settings.
    pub checksum_value: u32,
    /// Divider/delay pairs that read cleanly; `None` means all of them.
    pub good_timings: Option<HashSet<(u8, u8)>>,

    /// Opcodes whose user-mode payload is committed to the flash image.
    pub write_opcodes: HashSet<u8>,
    /// Per-CS response bytes for register-style reads (no address phase).
    pub reg_responses: Vec<VecDeque<u8>>,
    /// Byte stream of the most recently closed user-mode session.
    pub last_session: Vec<u8>,
    pub user_sessions: usize,

    session: Option<Session>,
}

impl SimBus {
    pub fn new() -> Self {
        let mut sim = Self {
            regs: [0; REG_WORDS],
            flash: vec![Vec::new(); regs::MAX_CS],
            ahb_base: AHB_BASE,
            ahb_size: AHB_SIZE,
            reg_writes: 0,
            dma_runs: 0,
            dma_hang: false,
            checksum_value: 0xc0ff_ee00,
            good_timings: None,
            write_opcodes: HashSet::from([0x02]),
            reg_responses: vec![VecDeque::new(); regs::MAX_CS],
            last_session: Vec::new(),
            user_sessions: 0,
            session: None,
        };

        // Hardware reset segment layout: CE0 spans the whole window, CE1
        // and CE2 get small slices inside it.
        sim.store_reg(
            regs::segment_addr(0),
            SegmentAddr::from_range(AHB_BASE, AHB_BASE + AHB_SIZE).0,
        );
        sim.store_reg(
            regs::segment_addr(1),
            SegmentAddr::from_range(AHB_BASE + 0x0800_0000, AHB_BASE + 0x0a00_0000).0,
        );
        sim.store_reg(
            regs::segment_addr(2),
            SegmentAddr::from_range(AHB_BASE + 0x0a00_0000, AHB_BASE + 0x0c00_0000).0,
        );
        sim
    }

    pub fn load_flash(&mut self, cs: u8, image: Vec<u8>) {
        self.flash[cs as usize] = image;
    }

    /// Marks `cs` as latched into 4-byte address mode.
    pub fn set_four_byte(&mut self, cs: u8) {
        let mut ctrl = Ctrl(self.regs[regs::CTRL as usize / 4]);
        ctrl.set_four_byte_mode(cs, true);
        self.store_reg(regs::CTRL, ctrl.0);
    }

    fn store_reg(&mut self, offset: u32, value: u32) {
        self.regs[offset as usize / 4] = value;
    }

    fn ce_ctrl_written(&mut self, cs: u8, old: CeCtrl, new: CeCtrl) {
        let was_active = old.mode() == CeMode::User && !old.stop_active();
        let now_active = new.mode() == CeMode::User && !new.stop_active();

        if now_active && !was_active {
            self.finalize_session();
            self.session = Some(Session {
                cs,
                rx: Vec::new(),
                reads_done: 0,
            });
        } else if was_active && !now_active {
            self.finalize_session();
        }
    }

    fn finalize_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.user_sessions += 1;

        let ctrl = Ctrl(self.regs[regs::CTRL as usize / 4]);
        let addr_len: usize = if ctrl.four_byte_mode(session.cs) { 4 } else { 3 };

        if let Some(&opcode) = session.rx.first() {
            if self.write_opcodes.contains(&opcode) && session.rx.len() > 1 + addr_len {
                let mut addr = 0usize;
                for &byte in &session.rx[1..=addr_len] {
                    addr = (addr << 8) | byte as usize;
                }
                let data = &session.rx[1 + addr_len..];
                let image = &mut self.flash[session.cs as usize];
                if image.len() < addr + data.len() {
                    image.resize(addr + data.len(), 0xff);
                }
                image[addr..addr + data.len()].copy_from_slice(data);
            }
        }

        self.last_session = session.rx;
    }

    fn dma_written(&mut self, ctrl: DmaCtrl) {
        if !(ctrl.enable() && ctrl.checksum()) {
            return;
        }
        self.dma_runs += 1;
        if self.dma_hang {
            return;
        }

        let timing = (ctrl.clock_div(), ctrl.delay());
        let clean = self
            .good_timings
            .as_ref()
            .map_or(true, |set| set.contains(&timing));
        let checksum = if clean {
            self.checksum_value
        } else {
            self.checksum_value ^ (0x5a5a_0000 | ((timing.0 as u32) << 8) | timing.1 as u32)
        };

        self.store_reg(regs::DMA_CHECKSUM, checksum);
        let mut intr = IntrCtrl(self.regs[regs::INTR_CTRL as usize / 4]);
        intr.set_dma_status(true);
        self.store_reg(regs::INTR_CTRL, intr.0);
    }

    fn window_of(&self, addr: u32) -> Option<(u8, u32)> {
        for cs in 0..regs::MAX_CS as u8 {
            let seg = SegmentAddr(self.regs[regs::segment_addr(cs) as usize / 4]);
            let start = if cs == 0 { self.ahb_base } else { seg.start() };
            if addr >= start && addr < seg.end() {
                return Some((cs, start));
            }
        }
        None
    }

    fn direct_byte(&self, addr: u32) -> u8 {
        match self.window_of(addr) {
            Some((cs, start)) => {
                let offset = (addr - start) as usize;
                self.flash[cs as usize].get(offset).copied().unwrap_or(0xff)
            }
            None => 0xff,
        }
    }

    fn user_read_byte(&mut self) -> u8 {
        let ctrl = Ctrl(self.regs[regs::CTRL as usize / 4]);
        let Some(session) = self.session.as_mut() else {
            return 0xff;
        };
        let addr_len: usize = if ctrl.four_byte_mode(session.cs) { 4 } else { 3 };
        let cs = session.cs as usize;

        if session.rx.len() > addr_len {
            // Opcode and full address seen: serve flash content.
            let mut addr = 0usize;
            for &byte in &session.rx[1..=addr_len] {
                addr = (addr << 8) | byte as usize;
            }
            let offset = addr + session.reads_done;
            session.reads_done += 1;
            self.flash[cs].get(offset).copied().unwrap_or(0xff)
        } else {
            // Register-style command, no address phase.
            self.reg_responses[cs].pop_front().unwrap_or(0)
        }
    }

    fn user_write_byte(&mut self, byte: u8) {
        if let Some(session) = self.session.as_mut() {
            session.rx.push(byte);
        }
    }
}

impl AhbBus for SimBus {
    fn read_reg(&mut self, offset: u32) -> u32 {
        self.regs[offset as usize / 4]
    }

    fn write_reg(&mut self, offset: u32, value: u32) {
        self.reg_writes += 1;

        // CE0's segment start is wired to the controller base.
        let value = if offset == regs::segment_addr(0) {
            (value & !(0xff << 16)) | (((self.ahb_base >> 23) & 0xff) << 16)
        } else {
            value
        };

        let old = self.regs[offset as usize / 4];
        self.store_reg(offset, value);

        if (regs::ce_ctrl(0)..=regs::ce_ctrl(2)).contains(&offset) {
            let cs = ((offset - regs::ce_ctrl(0)) / 4) as u8;
            self.ce_ctrl_written(cs, CeCtrl(old), CeCtrl(value));
        } else if offset == regs::DMA_CTRL {
            self.dma_written(DmaCtrl(value));
        }
    }

    fn read8(&mut self, addr: u32) -> u8 {
        if self.session.is_some() {
            self.user_read_byte()
        } else {
            self.direct_byte(addr)
        }
    }

    fn write8(&mut self, _addr: u32, value: u8) {
        self.user_write_byte(value);
    }

    fn read32(&mut self, addr: u32) -> u32 {
        let mut word = [0u8; 4];
        if self.session.is_some() {
            for byte in &mut word {
                *byte = self.user_read_byte();
            }
        } else {
            for (i, byte) in word.iter_mut().enumerate() {
                *byte = self.direct_byte(addr + i as u32);
            }
        }
        u32::from_le_bytes(word)
    }

    fn write32(&mut self, _addr: u32, value: u32) {
        for byte in value.to_le_bytes() {
            self.user_write_byte(byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_reads_follow_the_segment_registers() {
        let mut sim = SimBus::new();
        sim.load_flash(0, pattern(16));
        assert_eq!(sim.read8(AHB_BASE), pattern(1)[0]);
        assert_eq!(sim.read8(AHB_BASE + 100), 0xff);
    }

    #[test]
    fn checksum_depends_on_timing_cleanliness() {
        let mut sim = SimBus::new();
        sim.good_timings = Some(HashSet::from([(0, 0)]));
        sim.checksum_value = 0xdead_beef;

        let mut ctrl = DmaCtrl(0);
        ctrl.set_enable(true);
        ctrl.set_checksum(true);
        ctrl.set_timing(0, 0);
        sim.write_reg(regs::DMA_CTRL, ctrl.0);
        assert_eq!(sim.regs[regs::DMA_CHECKSUM as usize / 4], 0xdead_beef);

        ctrl.set_timing(14, 2);
        sim.write_reg(regs::DMA_CTRL, ctrl.0);
        assert_ne!(sim.regs[regs::DMA_CHECKSUM as usize / 4], 0xdead_beef);
    }
}
