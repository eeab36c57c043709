//! Read-timing calibration.
//!
//! The FMC variant carries a DMA engine that can checksum a flash region
//! without CPU involvement, with the clock divider and input-delay fields
//! overridden from the DMA control register. Calibration checksums a fixed
//! region under CE0 at the slowest clock for a reference, then searches
//! each faster divider for the smallest delay compensation that still reads
//! back clean. Misses only cost speed: a divider with no passing delay gets
//! no timing entry and fast reads settle on a safer divider.

use crate::bus::AhbBus;
use crate::controller::SpiController;
use crate::regs::{self, CeCtrl, CeMode, DmaCtrl, IntrCtrl, Timings};
use crate::{ControllerKind, Error};

/// Reported instead of a real checksum on controllers without the DMA
/// engine; kept for compatibility with existing tooling.
pub const UNCALIBRATED_CHECKSUM: u32 = 0x0bad_c0de;

/// Checksum source region, inside CE0's window.
const CALIB_SRC_OFFSET: u32 = 0x10000;
const CALIB_LEN: u32 = 0x200;

/// Extra 4 ns data-input delay, on top of the HCLK cycle count.
const TIMING_DELAY_FINE: u8 = 1 << 3;
const TIMING_CYCLE_MAX: u8 = 5;

const DMA_STATUS_TIMEOUT_POLLS: u32 = 1_000_000;

/// Divider masks for HCLK/5 .. HCLK/1.
const HCLK_FAST_MASKS: [u8; 5] = [13, 6, 14, 7, 15];

impl<B: AhbBus> SpiController<B> {
    /// Re-runs the read-timing calibration.
    ///
    /// Fails with [`Error::CalibrationUnsupported`] on the SPI controller
    /// variant, which has no checksum engine.
    pub fn recalibrate(&mut self) -> Result<(), Error> {
        if self.kind != ControllerKind::Fmc {
            return Err(Error::CalibrationUnsupported);
        }
        self.timing_calibration()
    }

    pub(crate) fn timing_calibration(&mut self) -> Result<(), Error> {
        if self.kind != ControllerKind::Fmc {
            warn!("no timing calibration support for SPI controllers");
            return Ok(());
        }

        debug!("read timing calibration:");

        // Reference checksum at the lowest frequency, HCLK/16.
        let gold = self.read_checksum(0, 0)?;

        // Put CE0 in fast-read command mode for the search; the HCLK
        // divider comes from the DMA control register meanwhile.
        let saved = self.bus.read_reg(regs::ce_ctrl(0));
        let mut probe = CeCtrl(0);
        probe.set_cmd(0x0b);
        probe.set_dummy_bytes(1);
        probe.set_mode(CeMode::FastRead);
        self.bus.write_reg(regs::ce_ctrl(0), probe.0);

        let mut timings = Timings(0);
        for (i, &mask) in HCLK_FAST_MASKS.iter().enumerate() {
            let div = 5 - i as u8;
            let freq = self.hclk_hz / div as u32;
            if freq > self.max_hz {
                debug!("skipping freq {}", freq);
                continue;
            }

            match self.search_delay(mask, div, gold) {
                Ok(Some(delay)) => timings.set_delay(div, delay),
                Ok(None) => {}
                Err(e) => {
                    self.bus.write_reg(regs::ce_ctrl(0), saved);
                    return Err(e);
                }
            }
        }

        debug!("read timing compensation set to {:x}", timings.0);
        self.bus.write_reg(regs::TIMINGS, timings.0);
        self.bus.write_reg(regs::ce_ctrl(0), saved);
        Ok(())
    }

    /// Walks the delay compensation values for one divider. The fine-delay
    /// variant is tried before the plain one at each cycle count; the first
    /// checksum matching the reference wins.
    fn search_delay(&mut self, mask: u8, div: u8, gold: u32) -> Result<Option<u8>, Error> {
        for cycle in 0..=TIMING_CYCLE_MAX {
            for delay in [TIMING_DELAY_FINE | cycle, cycle] {
                let checksum = self.read_checksum(mask, delay)?;
                let pass = checksum == gold;
                debug!("HCLK/{}, delay {:x}: pass={}", div, delay, pass);
                if pass {
                    return Ok(Some(delay));
                }
            }
        }
        Ok(None)
    }

    fn read_checksum(&mut self, div: u8, delay: u8) -> Result<u32, Error> {
        if self.kind != ControllerKind::Fmc {
            return Ok(UNCALIBRATED_CHECKSUM);
        }
        self.fmc_checksum(div, delay)
    }

    /// One DMA checksum pass over the fixed region under CE0.
    fn fmc_checksum(&mut self, div: u8, delay: u8) -> Result<u32, Error> {
        self.bus
            .write_reg(regs::DMA_FLASH_ADDR, self.ahb_base + CALIB_SRC_OFFSET);
        self.bus.write_reg(regs::DMA_LEN, CALIB_LEN);

        let mut ctrl = DmaCtrl(0);
        ctrl.set_enable(true);
        ctrl.set_checksum(true);
        ctrl.set_calibrate(true);
        ctrl.set_timing(div, delay);
        self.bus.write_reg(regs::DMA_CTRL, ctrl.0);

        let mut polls = 0u32;
        while !IntrCtrl(self.bus.read_reg(regs::INTR_CTRL)).dma_status() {
            polls += 1;
            if polls > DMA_STATUS_TIMEOUT_POLLS {
                error!("DMA checksum status bit stuck");
                self.bus.write_reg(regs::DMA_CTRL, 0);
                return Err(Error::CalibrationTimeout);
            }
            core::hint::spin_loop();
        }

        self.bus.write_reg(regs::INTR_CTRL, 0);
        let checksum = self.bus.read_reg(regs::DMA_CHECKSUM);
        self.bus.write_reg(regs::DMA_CTRL, 0);

        Ok(checksum)
    }
}
