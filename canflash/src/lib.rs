//! # canflash
//!
//! A library for flashing microcontrollers through a resident CAN bootloader.
//!
//! This crate provides the host side of the bootloader protocol:
//!
//! - 8-byte command frame encoding and reply matching
//! - CRC-32/MPEG-2 page and image digests
//! - Connection handshake, discovery and address assignment
//! - Page-by-page image upload with full-page retry
//!
//! ## Supported Adapters
//!
//! - **SLCAN** (default `native` feature): USB-serial CAN dongles speaking the
//!   Lawicel ASCII protocol, via the `serialport` crate
//! - Anything else implementing [`CanBus`]
//!
//! ## Features
//!
//! - `native` (default): SLCAN adapter over native serial ports
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use canflash::{BootloaderClient, Flasher, ProtocolConfig, SlcanPort};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let firmware = std::fs::read("firmware.bin")?;
//!
//!     let port = SlcanPort::open("/dev/ttyACM0", 500_000)?;
//!     let client = BootloaderClient::new(port, ProtocolConfig::default());
//!     let mut flasher = Flasher::new(client);
//!
//!     let report = flasher.flash_bytes(4, &firmware, |done, total| {
//!         println!("Page {done}/{total}");
//!     })?;
//!     println!("Image CRC 0x{:08X}", report.image_crc);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bootloader;
pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod target;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{SlcanPort, available_ports};
pub use {
    bootloader::{BootloaderClient, ClientState, FlashReport, Flasher},
    error::{Error, Result},
    image::FirmwareImage,
    port::{CanBus, CanFrame},
    protocol::{Command, CommandFrame, CrcEngine, Response},
    target::{DeviceFamily, ProtocolConfig, ReplyIds},
};
