//! Bootloader protocol engine.
//!
//! [`BootloaderClient`] owns the request/response discipline on the bus;
//! [`Flasher`] drives it page by page to upload a whole image.

pub mod client;
pub mod flasher;

pub use {
    client::{BootloaderClient, ClientState},
    flasher::{FlashReport, Flasher},
};
