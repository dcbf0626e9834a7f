//! CAN bus abstraction.
//!
//! The bootloader client only needs to send a frame and poll for the next
//! one, so the adapter boundary is a small trait:
//!
//! ```text
//! +------------------------+
//! |  BootloaderClient /    |
//! |  Flasher               |
//! +-----------+------------+
//!             |
//!             v
//! +-----------+------------+
//! |      CanBus trait      |
//! +-----------+------------+
//!             |
//!             v
//! +-----------+------------+     +-------------------+
//! |  SlcanPort (native)    | ... | other adapters    |
//! |  (serialport)          |     | (socketcan, sim)  |
//! +------------------------+     +-------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use canflash::port::{CanBus, CanFrame};
//! use std::time::Duration;
//!
//! fn example<B: CanBus>(bus: &mut B) -> canflash::Result<()> {
//!     bus.send(&CanFrame::new(0x700, &[0, 4, 0, 0, 0, 0, 0, 0])?, Duration::from_secs(1))?;
//!     if let Some(frame) = bus.try_receive(Duration::from_millis(100))? {
//!         println!("Received: {frame}");
//!     }
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod slcan;

#[cfg(test)]
pub(crate) mod sim;

use {
    crate::error::{Error, Result},
    std::{fmt, time::Duration},
};

/// Largest classic CAN payload.
pub const MAX_DATA_LEN: usize = 8;

/// Highest 11-bit identifier.
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Highest 29-bit identifier.
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// A classic CAN data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    extended: bool,
    len: u8,
    data: [u8; MAX_DATA_LEN],
}

impl CanFrame {
    /// Create a standard (11-bit id) frame.
    pub fn new(id: u16, data: &[u8]) -> Result<Self> {
        Self::build(u32::from(id), false, data)
    }

    /// Create an extended (29-bit id) frame.
    pub fn new_extended(id: u32, data: &[u8]) -> Result<Self> {
        Self::build(id, true, data)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn build(id: u32, extended: bool, data: &[u8]) -> Result<Self> {
        let max_id = if extended {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        if id > max_id {
            return Err(Error::InvalidParameter(format!(
                "CAN id 0x{id:X} out of range (max 0x{max_id:X})"
            )));
        }
        if data.len() > MAX_DATA_LEN {
            return Err(Error::InvalidParameter(format!(
                "CAN payload too long: {} bytes",
                data.len()
            )));
        }
        let mut buf = [0u8; MAX_DATA_LEN];
        buf[..data.len()].copy_from_slice(data);
        // Safe cast: length checked above
        Ok(Self {
            id,
            extended,
            len: data.len() as u8,
            data: buf,
        })
    }

    /// Frame identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether the identifier is 29-bit.
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Data length code.
    pub fn dlc(&self) -> usize {
        usize::from(self.len)
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc()]
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "{:08X}", self.id)?;
        } else {
            write!(f, "{:03X}", self.id)?;
        }
        write!(f, " [{}]", self.len)?;
        for byte in self.data() {
            write!(f, " {byte:02X}")?;
        }
        Ok(())
    }
}

/// Bus adapter used by the bootloader client.
///
/// Implementations move frames only and never interpret their contents.
/// The client holds exclusive use of the bus for the duration of one
/// operation; implementations do no locking of their own.
pub trait CanBus: Send {
    /// Transmit a frame, giving up after `timeout`.
    ///
    /// A failure here is a transport error, distinct from a missing reply.
    fn send(&mut self, frame: &CanFrame, timeout: Duration) -> Result<()>;

    /// Return the next received frame, or `None` once `timeout` elapses.
    ///
    /// Must never block longer than `timeout` (plus adapter latency).
    fn try_receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>>;

    /// Adapter name (e.g. serial port path).
    fn name(&self) -> &str;

    /// Close the adapter and release resources.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<B: CanBus + ?Sized> CanBus for Box<B> {
    fn send(&mut self, frame: &CanFrame, timeout: Duration) -> Result<()> {
        (**self).send(frame, timeout)
    }

    fn try_receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        (**self).try_receive(timeout)
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

// Re-export the native adapter
#[cfg(feature = "native")]
pub use slcan::{SlcanPort, available_ports};
