//! Controller and per-chip-select device state.
//!
//! The controller is created once at probe from the platform's resource
//! description. Per-device register words are computed lazily on the first
//! bus claim that arrives with known flash parameters; until then the safe
//! defaults programmed at init keep JEDEC probing transfers working.

use crate::bus::AhbBus;
use crate::regs::{self, CeCtrl, CeMode, Conf, Ctrl, SegmentAddr};
use crate::{Config, ControllerKind, Error, FlashParams, IoMode};

pub(crate) const CMD_BUF_LEN: usize = 16;

/// Per-chip-select flash device state.
pub struct FlashDevice {
    pub(crate) cs: u8,
    pub(crate) initialized: bool,
    /// Start of this device's slice of the AHB window. CS0's start is the
    /// controller base and read-only in hardware.
    pub(crate) window_base: u32,
    /// Zero when no window could be assigned; reads then always take the
    /// user-mode path.
    pub(crate) window_size: u32,
    pub(crate) ce_ctrl_user: CeCtrl,
    pub(crate) ce_ctrl_fread: CeCtrl,
    pub(crate) io_mode: u8,
    pub(crate) params: Option<FlashParams>,
}

impl FlashDevice {
    const NEW: Self = Self {
        cs: 0,
        initialized: false,
        window_base: 0,
        window_size: 0,
        ce_ctrl_user: CeCtrl(0),
        ce_ctrl_fread: CeCtrl(0),
        io_mode: 0,
        params: None,
    };

    pub fn cs(&self) -> u8 {
        self.cs
    }

    /// The device's AHB window as `(base, size)`.
    pub fn window(&self) -> (u32, u32) {
        (self.window_base, self.window_size)
    }

    /// The precomputed fast-read control word.
    pub fn fast_read_word(&self) -> u32 {
        self.ce_ctrl_fread.0
    }

    pub(crate) fn dummy_bytes(&self) -> usize {
        self.params.map_or(0, |p| p.dummy_bytes as usize)
    }
}

pub struct SpiController<B> {
    pub(crate) bus: B,
    pub(crate) kind: ControllerKind,
    pub(crate) ahb_base: u32,
    pub(crate) ahb_size: u32,
    pub(crate) hclk_hz: u32,
    pub(crate) max_hz: u32,
    pub(crate) flash_count: u8,
    pub(crate) devices: [FlashDevice; regs::MAX_CS],
    pub(crate) cmd_buf: [u8; CMD_BUF_LEN],
    pub(crate) cmd_len: usize,
}

impl<B: AhbBus> SpiController<B> {
    /// Probes the controller: validates the platform description, enables
    /// writes, runs timing calibration and programs safe per-device
    /// defaults.
    pub fn new(bus: B, config: Config) -> Result<Self, Error> {
        if config.hclk_hz == 0 {
            error!("could not get AHB clock rate");
            return Err(Error::ClockUnavailable);
        }
        let num_cs = config.num_cs.min(regs::MAX_CS as u8);
        if config.flash_count > num_cs {
            error!("too many flash devices: {}", config.flash_count);
            return Err(Error::TooManyDevices);
        }
        if config.flash_count == 0 {
            error!("no flash devices?!");
            return Err(Error::NoDevicesFound);
        }

        let mut this = Self {
            bus,
            kind: config.kind,
            ahb_base: config.ahb_base,
            ahb_size: config.ahb_size,
            hclk_hz: config.hclk_hz,
            max_hz: config.max_hz,
            flash_count: config.flash_count,
            devices: [FlashDevice::NEW; regs::MAX_CS],
            cmd_buf: [0; CMD_BUF_LEN],
            cmd_len: 0,
        };
        this.controller_init()?;

        debug!(
            "probed ahb_base={:x} max-hz={} cs={}",
            this.ahb_base, this.max_hz, this.flash_count
        );
        Ok(this)
    }

    fn controller_init(&mut self) -> Result<(), Error> {
        // User command mode needs the write-enable bits up on all devices.
        let mut conf = Conf(self.bus.read_reg(regs::CONF));
        for cs in 0..regs::MAX_CS as u8 {
            conf.set_enable_write(cs, true);
        }
        self.bus.write_reg(regs::CONF, conf.0);

        // The timing compensation register applies to all devices.
        self.timing_calibration()?;

        // Safe defaults per device; tuned once the flash devices are
        // probed and the bus is claimed with their parameters.
        for cs in 0..self.flash_count {
            let seg = SegmentAddr(self.bus.read_reg(regs::segment_addr(cs)));
            let dev = &mut self.devices[cs as usize];
            dev.cs = cs;
            // CS0's window start is read-only and equals the base of the
            // controller's whole AHB window.
            dev.window_base = if cs == 0 { self.ahb_base } else { seg.start() };
            let mut user = CeCtrl(0);
            user.set_mode(CeMode::User);
            dev.ce_ctrl_user = user;
            dev.ce_ctrl_fread = CeCtrl(0);
        }
        Ok(())
    }

    /// Claims the bus for `cs`. Idempotent; the first claim carrying flash
    /// parameters computes and programs the device's register words.
    pub fn claim(&mut self, cs: u8, params: Option<&FlashParams>) -> Result<(), Error> {
        self.check_cs(cs)?;
        debug!("claim bus CS{}", cs);
        match params {
            Some(p) if !self.devices[cs as usize].initialized => self.flash_init(cs, p),
            _ => Ok(()),
        }
    }

    pub fn release(&mut self, cs: u8) -> Result<(), Error> {
        self.check_cs(cs)?;
        debug!("release bus CS{}", cs);
        Ok(())
    }

    /// Hardware mode is fixed at claim time; this only rejects what the
    /// controller cannot drive.
    pub fn set_mode(&mut self, mode: IoMode) -> Result<(), Error> {
        debug!("setting mode to {}", mode as u32);
        if mode == IoMode::Quad {
            error!("invalid QUAD IO mode");
            return Err(Error::UnsupportedMode);
        }
        Ok(())
    }

    /// Hardware speed is fixed at claim time.
    pub fn set_speed(&mut self, hz: u32) {
        debug!("setting speed to {}", hz);
    }

    pub fn device(&self, cs: u8) -> Result<&FlashDevice, Error> {
        self.check_cs(cs)?;
        Ok(&self.devices[cs as usize])
    }

    pub(crate) fn check_cs(&self, cs: u8) -> Result<(), Error> {
        if cs >= self.flash_count {
            error!("invalid CS {}", cs);
            return Err(Error::InvalidChipSelect);
        }
        Ok(())
    }

    /// Tunes the CE control words for the two modes the driver uses: USER
    /// command mode for specific commands, writes and erases, and FAST READ
    /// mode for direct accesses through the AHB window.
    fn flash_init(&mut self, cs: u8, params: &FlashParams) -> Result<(), Error> {
        debug!(
            "CS{}: init size:{} page:{} sector:{} erase:{} cmds [ erase:{:x} read:{:x} write:{:x} ] dummy:{}",
            cs,
            params.size,
            params.page_size,
            params.sector_size,
            params.erase_size,
            params.erase_opcode,
            params.read_opcode,
            params.write_opcode,
            params.dummy_bytes
        );

        let io_mode = if params.dual_io {
            debug!("CS{}: setting dual data mode", cs);
            regs::IO_MODE_DUAL_DATA
        } else {
            0
        };

        let mut user = CeCtrl(0);
        user.set_clock_div(0);
        user.set_mode(CeMode::User);

        let mut fread = CeCtrl(0);
        fread.set_clock_div(Self::hclk_divisor(self.hclk_hz, params.max_hz));
        fread.set_io_mode(io_mode);
        fread.set_cmd(params.read_opcode);
        fread.set_dummy_bytes(params.dummy_bytes);
        fread.set_mode(CeMode::FastRead);

        debug!("CS{}: USER mode {:x} FREAD mode {:x}", cs, user.0, fread.0);
        self.bus.write_reg(regs::ce_ctrl(cs), fread.0);

        // The controller auto-detects at boot whether a device was left in
        // 4-byte address mode and keeps using that width. Callers above
        // speak 3-byte addresses; the width gets fixed on the wire.
        if params.size >= 16 << 20 && Ctrl(self.bus.read_reg(regs::CTRL)).four_byte_mode(cs) {
            warn!("CS{}: 4-byte address mode is active", cs);
        }

        let window = match self.assign_window(cs, params.size) {
            Ok(base) => (base, params.size),
            Err(Error::WindowOverflow) => {
                warn!("CS{}: no AHB window, reads fall back to user mode", cs);
                (self.devices[cs as usize].window_base, 0)
            }
            Err(e) => return Err(e),
        };

        let dev = &mut self.devices[cs as usize];
        dev.io_mode = io_mode;
        dev.ce_ctrl_user = user;
        dev.ce_ctrl_fread = fread;
        dev.window_base = window.0;
        dev.window_size = window.1;
        dev.params = Some(*params);
        dev.initialized = true;
        Ok(())
    }

    /// Carves the device's slice out of the controller's AHB window, right
    /// after the windows of the lower chip selects, and programs the
    /// segment register. Segment granularity is 8 MiB.
    fn assign_window(&mut self, cs: u8, size: u32) -> Result<u32, Error> {
        let mut base = self.ahb_base;
        for dev in &self.devices[..cs as usize] {
            if dev.initialized && dev.window_size != 0 {
                base += align_granule(dev.window_size);
            }
        }

        let span = align_granule(size);
        let end = match base.checked_add(span) {
            Some(end) if end <= self.ahb_base + self.ahb_size => end,
            _ => return Err(Error::WindowOverflow),
        };

        let seg = SegmentAddr::from_range(base, end);
        self.bus.write_reg(regs::segment_addr(cs), seg.0);
        debug!("CS{}: segment [{:x} - {:x}]", cs, base, end);
        Ok(base)
    }

    /// Picks the HCLK divider mask for the highest frequency not above
    /// `max_hz`.
    pub(crate) fn hclk_divisor(hclk_rate: u32, max_hz: u32) -> u8 {
        // HCLK/1 .. HCLK/16
        const HCLK_MASKS: [u8; 16] = [15, 7, 14, 6, 13, 5, 12, 4, 11, 3, 10, 2, 9, 1, 8, 0];

        let mut i = 0;
        while i < HCLK_MASKS.len() - 1 {
            if max_hz >= hclk_rate / (i as u32 + 1) {
                break;
            }
            i += 1;
        }

        debug!(
            "hclk={} required={} divisor is {} (mask {:x}) speed={}",
            hclk_rate,
            max_hz,
            i + 1,
            HCLK_MASKS[i],
            hclk_rate / (i as u32 + 1)
        );
        HCLK_MASKS[i]
    }
}

fn align_granule(size: u32) -> u32 {
    size.saturating_add(regs::SEGMENT_GRANULE - 1) & !(regs::SEGMENT_GRANULE - 1)
}
