//! Transfer entry point for the flash protocol layer.
//!
//! A logical operation arrives in up to three phases: a begin call carrying
//! the command header (opcode, address, dummy placeholders), any number of
//! data calls, and an end flag that retires the command. Reads that fit
//! inside the device's AHB window are served by a plain memory copy; all
//! other traffic is sequenced through user mode.

use crate::bus::AhbBus;
use crate::controller::{SpiController, CMD_BUF_LEN};
use crate::Error;

/// Position of a call within a logical transfer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct XferFlags {
    pub begin: bool,
    pub end: bool,
}

impl XferFlags {
    pub const NONE: Self = Self { begin: false, end: false };
    pub const BEGIN: Self = Self { begin: true, end: false };
    pub const END: Self = Self { begin: false, end: true };
    pub const BOTH: Self = Self { begin: true, end: true };
}

/// Payload of one transfer call.
pub enum TransferData<'a> {
    None,
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl TransferData<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Read(out) => out.len(),
            Self::Write(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<B: AhbBus> SpiController<B> {
    /// Runs one phase of a logical transfer against `cs`.
    ///
    /// On begin the written bytes are stashed as the command in progress;
    /// begin and end together make a bare command with zero data bytes. A
    /// data phase without a command in progress is out of sequence and
    /// fails without touching the hardware.
    pub fn xfer(&mut self, cs: u8, flags: XferFlags, data: TransferData<'_>) -> Result<(), Error> {
        self.check_cs(cs)?;

        if flags.begin {
            let header: &[u8] = match &data {
                TransferData::Write(bytes) => bytes,
                _ => &[],
            };
            if header.len() > CMD_BUF_LEN {
                error!("command header of {} bytes", header.len());
                return Err(Error::CommandTooLong);
            }
            self.cmd_buf[..header.len()].copy_from_slice(header);
            self.cmd_len = header.len();
        }

        // With both flags set in one call the payload bytes are the header
        // itself; the command carries no data.
        let data_len = if flags.begin && flags.end { 0 } else { data.len() };

        if flags.end || !flags.begin {
            if self.cmd_len == 0 {
                error!("no command in progress");
                return Err(Error::NoActiveCommand);
            }

            debug!("CS{}: cmd {} bytes data {} bytes", cs, self.cmd_len, data_len);

            match data {
                TransferData::Read(out) if data_len > 0 => {
                    if self.cmd_len == 1 {
                        let opcode = self.cmd_buf[0];
                        self.read_reg_op(cs, opcode, out);
                    } else {
                        self.read(cs, out);
                    }
                }
                TransferData::Write(bytes) => {
                    let cmd = self.cmd_buf;
                    if self.cmd_len == 1 {
                        self.write_reg_op(cs, cmd[0], &bytes[..data_len]);
                    } else {
                        let cmd_len = self.cmd_len;
                        self.write_user(cs, &cmd[..cmd_len], &bytes[..data_len]);
                    }
                }
                _ => {}
            }

            if flags.end {
                self.cmd_buf = [0; CMD_BUF_LEN];
                self.cmd_len = 0;
            }
        }

        Ok(())
    }

    /// Serves a sequenced read, through the AHB window when the whole range
    /// fits inside it.
    fn read(&mut self, cs: u8, out: &mut [u8]) {
        let dev = &self.devices[cs as usize];
        let (window_base, window_size) = (dev.window_base, dev.window_size);
        let header = self.cmd_len.saturating_sub(dev.dummy_bytes());

        if window_size != 0 && header >= 4 {
            let offset = flash_offset(&self.cmd_buf[..header]);
            if (offset as u64 + out.len() as u64) < window_size as u64 {
                self.copy_from_window(window_base + offset, out);
                return;
            }
        }

        let (cmd, cmd_len) = (self.cmd_buf, self.cmd_len);
        self.read_user(cs, &cmd[..cmd_len], out);
    }
}

/// Flash offset encoded in a command header, big-endian address bytes
/// after the opcode.
fn flash_offset(cmd: &[u8]) -> u32 {
    let addr_len = cmd.len() - 1;
    let mut addr = ((cmd[1] as u32) << 16) | ((cmd[2] as u32) << 8) | cmd[3] as u32;
    if addr_len == 4 {
        addr = (addr << 8) | cmd[4] as u32;
    }
    addr
}
