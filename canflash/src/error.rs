//! Error types for canflash.

use crate::protocol::Command;
use std::io;
use thiserror::Error;

/// Result type for canflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for canflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The bus adapter failed to send a frame.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Every attempt of a command went unanswered.
    #[error("No reply from board {board} to {command:?}")]
    NoReply {
        /// Address the reply was expected from.
        board: u8,
        /// Command that went unanswered.
        command: Command,
    },

    /// The device answered with a nonzero status.
    #[error("Board {board} rejected {command:?} with error #{code}")]
    DeviceRejected {
        /// Address of the rejecting board.
        board: u8,
        /// Command that was rejected.
        command: Command,
        /// Device-defined status code (never 0).
        code: u8,
    },

    /// The ping handshake never got a reply.
    #[error("Could not connect to board {board}")]
    ConnectionFailed {
        /// Address that was pinged.
        board: u8,
    },

    /// A page could not be written within the retry budget.
    #[error("Writing page {page} failed: {source}")]
    PageWriteFailed {
        /// Zero-based page index.
        page: u16,
        /// Failure of the last attempt.
        #[source]
        source: Box<Error>,
    },

    /// The device did not accept the whole-image CRC.
    #[error("Image verification failed: {source}")]
    VerificationFailed {
        /// Failure reported for the `WriteCrc` exchange.
        #[source]
        source: Box<Error>,
    },

    /// Board address outside `0..=254`.
    #[error("Invalid board address {0}, choose an address from 0-254")]
    InvalidAddress(u16),

    /// A frame parameter had the wrong shape.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Firmware image has no bytes.
    #[error("Firmware image is empty")]
    EmptyImage,

    /// Firmware image has more pages than `param1` can index.
    #[error("Firmware image too large: {pages} pages (max {max})")]
    ImageTooLarge {
        /// Pages the image would need.
        pages: usize,
        /// Highest page count the protocol can address.
        max: usize,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error means the bus or device stopped answering, as
    /// opposed to a bad argument or a local configuration problem.
    pub fn is_device_error(&self) -> bool {
        match self {
            Self::NoReply { .. }
            | Self::DeviceRejected { .. }
            | Self::ConnectionFailed { .. }
            | Self::PageWriteFailed { .. }
            | Self::VerificationFailed { .. }
            | Self::Transport(_)
            | Self::Io(_) => true,
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            Self::InvalidAddress(_)
            | Self::InvalidParameter(_)
            | Self::EmptyImage
            | Self::ImageTooLarge { .. }
            | Self::Config(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_write_failed_keeps_source() {
        let err = Error::PageWriteFailed {
            page: 3,
            source: Box::new(Error::DeviceRejected {
                board: 7,
                command: Command::WriteBuffer,
                code: 5,
            }),
        };
        let text = err.to_string();
        assert!(text.contains("page 3"));
        assert!(text.contains("error #5"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_device_error_classification() {
        assert!(Error::ConnectionFailed { board: 1 }.is_device_error());
        assert!(!Error::InvalidAddress(255).is_device_error());
        assert!(!Error::EmptyImage.is_device_error());
    }
}
