//! ASPEED AST2500 FMC/SPI controller driver.
//!
//! The controller maps each SPI NOR flash device into an AHB window for
//! fast reads and offers an explicit "user" command mode for everything
//! else. This crate owns the per-chip-select register tuning for both
//! modes, the hardware-assisted read-timing calibration, and the two-phase
//! command transfer protocol consumed by a flash protocol layer above.
//!
//! Device discovery, device-tree parsing and the clock subsystem are the
//! platform's business; their results arrive packed in [`Config`].
//!
//! # Example
//! ```ignore
//! let bus = unsafe { Mmio::new(0x1e62_0000) };
//! let config = Config {
//!     hclk_hz: 200_000_000,
//!     flash_count: 1,
//!     ..Config::default()
//! };
//! let mut spi = SpiController::new(bus, config)?;
//! spi.claim(0, Some(&params))?;
//!
//! let mut id = [0u8; 3];
//! spi.xfer(0, XferFlags::BEGIN, TransferData::Write(&[0x9f]))?;
//! spi.xfer(0, XferFlags::END, TransferData::Read(&mut id))?;
//! ```
#![cfg_attr(not(test), no_std)]

// This must go first so the other modules see its macros.
mod fmt;

pub mod bus;
pub mod regs;

mod calib;
mod controller;
mod user;
mod xfer;

#[cfg(test)]
mod sim;

pub use bus::{AhbBus, Mmio};
pub use calib::UNCALIBRATED_CHECKSUM;
pub use controller::{FlashDevice, SpiController};
pub use xfer::{TransferData, XferFlags};

use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Chip-select index outside the discovered flash range.
    InvalidChipSelect,
    /// Data phase issued with no command in progress.
    NoActiveCommand,
    /// Command header longer than the in-flight buffer.
    CommandTooLong,
    /// Segment assignment would exceed the controller's AHB span.
    WindowOverflow,
    /// More flash devices discovered than configured chip selects.
    TooManyDevices,
    /// No flash devices discovered at probe.
    NoDevicesFound,
    /// The AHB clock rate query came back empty.
    ClockUnavailable,
    /// This controller variant has no DMA checksum engine; timing
    /// calibration is unavailable and fast reads run untuned.
    CalibrationUnsupported,
    /// The DMA status bit never rose during a checksum run.
    CalibrationTimeout,
    /// Requested an I/O mode the controller cannot drive.
    UnsupportedMode,
}

impl NorFlashError for Error {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

/// The two AST2500 controller variants. Only the FMC carries the DMA
/// checksum engine used for read-timing calibration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControllerKind {
    Fmc,
    Spi,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IoMode {
    Single,
    Dual,
    Quad,
}

/// Probe-time controller description, assembled by the platform from its
/// resource table, clock tree and configuration source.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    pub kind: ControllerKind,
    /// Base of the controller's whole AHB window.
    pub ahb_base: u32,
    /// Size of the AHB window shared by all chip selects.
    pub ahb_size: u32,
    /// AHB clock rate.
    pub hclk_hz: u32,
    /// Ceiling for the SPI clock, from configuration.
    pub max_hz: u32,
    /// Configured chip-select count.
    pub num_cs: u8,
    /// Number of flash devices discovered on the bus.
    pub flash_count: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kind: ControllerKind::Fmc,
            ahb_base: 0x2000_0000,
            ahb_size: 0x1000_0000,
            hclk_hz: 0,
            max_hz: 100_000_000,
            num_cs: regs::MAX_CS as u8,
            flash_count: 0,
        }
    }
}

/// Flash device parameters negotiated by the protocol layer, handed in on
/// the first bus claim. Read-only inputs as far as this driver goes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashParams {
    pub size: u32,
    pub page_size: u32,
    pub sector_size: u32,
    pub erase_size: u32,
    pub read_opcode: u8,
    pub write_opcode: u8,
    pub erase_opcode: u8,
    /// Dummy bytes the read opcode requires between address and data.
    pub dummy_bytes: u8,
    /// Highest clock the device tolerates.
    pub max_hz: u32,
    /// Transfer data on two lines.
    pub dual_io: bool,
}
