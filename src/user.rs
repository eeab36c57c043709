//! User-mode command sequencing.
//!
//! In user mode every byte on the bus is software-driven: loads and stores
//! anywhere in the device's AHB window move raw bytes instead of being
//! translated to fast-read cycles. Entering and leaving the mode is a
//! two-step deselect dance on the CE control register; nothing may
//! interleave with an open sequence on the same chip select.

use crate::bus::AhbBus;
use crate::controller::SpiController;
use crate::regs::{self, CeCtrl, Ctrl};

const DUMMY_BYTE: u8 = 0xff;

impl<B: AhbBus> SpiController<B> {
    /// Switches `cs` to user command mode and asserts the chip select.
    pub(crate) fn start_user(&mut self, cs: u8) {
        let mut ctrl = self.devices[cs as usize].ce_ctrl_user;
        ctrl.set_stop_active(true);

        // Deselect and set user command mode, then select.
        self.bus.write_reg(regs::ce_ctrl(cs), ctrl.0);
        let mut ctrl = CeCtrl(self.bus.read_reg(regs::ce_ctrl(cs)));
        ctrl.set_stop_active(false);
        self.bus.write_reg(regs::ce_ctrl(cs), ctrl.0);
    }

    /// Deselects `cs` and restores the default fast-read mode.
    pub(crate) fn stop_user(&mut self, cs: u8) {
        let mut ctrl = CeCtrl(self.bus.read_reg(regs::ce_ctrl(cs)));
        ctrl.set_stop_active(true);
        self.bus.write_reg(regs::ce_ctrl(cs), ctrl.0);

        self.bus
            .write_reg(regs::ce_ctrl(cs), self.devices[cs as usize].ce_ctrl_fread.0);
    }

    /// Emits the opcode and address bytes of `cmd`.
    ///
    /// The controller latches 4-byte addressing on its own when it finds a
    /// device already in that mode, and the transition is one-way. The flag
    /// is read back from the control register on every call; when the
    /// caller speaks 3-byte addresses to such a chip select, a zero pad
    /// byte keeps the wire width right.
    pub(crate) fn send_cmd_addr(&mut self, cs: u8, cmd: &[u8]) {
        let base = self.devices[cs as usize].window_base;

        self.bus.write8(base, cmd[0]);

        let addr_len = cmd.len() - 1;
        if addr_len == 3 && Ctrl(self.bus.read_reg(regs::CTRL)).four_byte_mode(cs) {
            self.bus.write8(base, 0x00);
        }

        for &byte in &cmd[1..] {
            self.bus.write8(base, byte);
        }
    }

    pub(crate) fn send_dummies(&mut self, cs: u8, count: usize) {
        let base = self.devices[cs as usize].window_base;
        for _ in 0..count {
            self.bus.write8(base, DUMMY_BYTE);
        }
    }

    /// Streams `data` onto the bus through the window, 4 bytes at a time
    /// for as long as whole words remain, then byte-wise.
    pub(crate) fn write_to_window(&mut self, base: u32, data: &[u8]) {
        let mut chunks = data.chunks_exact(4);
        for chunk in &mut chunks {
            self.bus.write32(base, pack_le_word(chunk));
        }
        for &byte in chunks.remainder() {
            self.bus.write8(base, byte);
        }
    }

    /// Streams bytes off the bus through the window into `out`.
    pub(crate) fn read_from_window(&mut self, base: u32, out: &mut [u8]) {
        let mut chunks = out.chunks_exact_mut(4);
        for chunk in &mut chunks {
            chunk.copy_from_slice(&self.bus.read32(base).to_le_bytes());
        }
        for byte in chunks.into_remainder() {
            *byte = self.bus.read8(base);
        }
    }

    /// Plain memory copy out of the window while the device sits in
    /// fast-read mode. Byte accesses until word-aligned, then words, then
    /// the byte tail.
    pub(crate) fn copy_from_window(&mut self, mut addr: u32, out: &mut [u8]) {
        let mut i = 0usize;

        while i < out.len() && addr % 4 != 0 {
            out[i] = self.bus.read8(addr);
            addr += 1;
            i += 1;
        }
        while i + 4 <= out.len() {
            out[i..i + 4].copy_from_slice(&self.bus.read32(addr).to_le_bytes());
            addr += 4;
            i += 4;
        }
        while i < out.len() {
            out[i] = self.bus.read8(addr);
            addr += 1;
            i += 1;
        }
    }

    /// Register-style read: opcode only, then data.
    pub(crate) fn read_reg_op(&mut self, cs: u8, opcode: u8, out: &mut [u8]) {
        let base = self.devices[cs as usize].window_base;

        self.start_user(cs);
        self.bus.write8(base, opcode);
        self.read_from_window(base, out);
        self.stop_user(cs);
    }

    /// Register-style write: opcode, then payload.
    pub(crate) fn write_reg_op(&mut self, cs: u8, opcode: u8, data: &[u8]) {
        let base = self.devices[cs as usize].window_base;

        self.start_user(cs);
        self.bus.write8(base, opcode);
        self.write_to_window(base, data);
        self.stop_user(cs);
    }

    /// Full sequenced read: opcode + address + dummies, then data.
    /// `cmd` is the protocol layer's header, command + address + dummy
    /// placeholders.
    pub(crate) fn read_user(&mut self, cs: u8, cmd: &[u8], out: &mut [u8]) {
        let dev = &self.devices[cs as usize];
        let base = dev.window_base;
        let io_mode = dev.io_mode;
        let dummies = dev.dummy_bytes();
        let header = cmd.len().saturating_sub(dummies);

        self.start_user(cs);
        self.send_cmd_addr(cs, &cmd[..header]);
        self.send_dummies(cs, dummies);

        if io_mode != 0 {
            let mut ctrl = CeCtrl(self.bus.read_reg(regs::ce_ctrl(cs)));
            ctrl.set_io_mode(io_mode);
            self.bus.write_reg(regs::ce_ctrl(cs), ctrl.0);
        }

        self.read_from_window(base, out);
        self.stop_user(cs);
    }

    /// Full sequenced write: opcode + address, then payload.
    pub(crate) fn write_user(&mut self, cs: u8, cmd: &[u8], data: &[u8]) {
        let base = self.devices[cs as usize].window_base;

        self.start_user(cs);
        self.send_cmd_addr(cs, cmd);
        self.write_to_window(base, data);
        self.stop_user(cs);
    }
}

fn pack_le_word(chunk: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word[..chunk.len()].copy_from_slice(chunk);
    u32::from_le_bytes(word)
}
