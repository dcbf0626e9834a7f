//! Bootloader wire protocol: frame codec and CRC engine.

pub mod crc;
pub mod frame;

// Re-export common types
pub use crc::{BOOTLOADER_CRC, CrcAccumulator, CrcEngine};
pub use frame::{
    BROADCAST_ADDRESS, Command, CommandFrame, FRAME_LEN, MAX_ASSIGNABLE_ADDRESS, Response,
    STATUS_OK, encode, matches_response,
};
