//! Bootloader command/response frame codec.
//!
//! Every command is one 8-byte CAN payload sent on the command id:
//!
//! ```text
//! +-------+-----+----------------+------------------------+
//! | Board | CMD |     param1     |         param2         |
//! +-------+-----+----------------+------------------------+
//! |   1   |  1  | 2 (LE u16)     | 4 (logical bytes       |
//! |       |     |                |    reversed)           |
//! +-------+-----+----------------+------------------------+
//! ```
//!
//! Replies arrive on a reply id and carry at least three bytes:
//! board address, acknowledged command code, status (0 = success).

use {
    crate::{
        error::{Error, Result},
        port::CanFrame,
        target::ReplyIds,
    },
    byteorder::{ByteOrder, LittleEndian},
};

/// Size of a command payload.
pub const FRAME_LEN: usize = 8;

/// Minimum length of a reply payload.
pub const MIN_REPLY_LEN: usize = 3;

/// Status byte meaning success.
pub const STATUS_OK: u8 = 0;

/// Reserved address answered by unconfigured or freshly flashed nodes.
pub const BROADCAST_ADDRESS: u8 = 0;

/// Highest address a node can be assigned.
pub const MAX_ASSIGNABLE_ADDRESS: u8 = 254;

/// Bootloader commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Command {
    /// Store one word in the device page buffer (`param1` = word index).
    WriteBuffer = 1,
    /// Commit the page buffer to flash (`param1` = page, `param2` = page CRC).
    WritePage = 2,
    /// Verify the whole image (`param1` = page count, `param2` = image CRC).
    WriteCrc = 3,
    /// Do nothing and respond.
    Ping = 4,
    /// Assign a new board address (`param1` = new address).
    SetId = 5,
}

impl Command {
    /// Numeric command code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look up a command by its code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::WriteBuffer),
            2 => Some(Self::WritePage),
            3 => Some(Self::WriteCrc),
            4 => Some(Self::Ping),
            5 => Some(Self::SetId),
            _ => None,
        }
    }
}

/// Encode a command payload.
///
/// `param2` holds the logical bytes of the 32-bit parameter and must be
/// exactly four bytes long; they are written to the frame in reverse order.
pub fn encode(board: u8, command: Command, param1: u16, param2: &[u8]) -> Result<[u8; FRAME_LEN]> {
    let param2: [u8; 4] = param2.try_into().map_err(|_| {
        Error::InvalidParameter(format!(
            "param2 must be exactly 4 bytes, got {}",
            param2.len()
        ))
    })?;
    Ok(CommandFrame::new(board, command, param1, param2).build())
}

/// Check whether `frame` is a reply from `board` to `command`.
///
/// The status byte is `frame.data()[2]` when this returns `true`.
pub fn matches_response(frame: &CanFrame, reply_ids: &ReplyIds, board: u8, command: Command) -> bool {
    Response::parse(frame, reply_ids).is_some_and(|r| r.board == board && r.command == command.code())
}

/// Command frame builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    /// Target board address.
    pub board: u8,
    /// Command to execute.
    pub command: Command,
    /// 16-bit parameter.
    pub param1: u16,
    /// 32-bit parameter in logical byte order.
    pub param2: [u8; 4],
}

impl CommandFrame {
    /// Create a new command frame.
    pub fn new(board: u8, command: Command, param1: u16, param2: [u8; 4]) -> Self {
        Self {
            board,
            command,
            param1,
            param2,
        }
    }

    /// Create a ping frame.
    pub fn ping(board: u8) -> Self {
        Self::new(board, Command::Ping, 0, [0; 4])
    }

    /// Build the 8-byte payload.
    pub fn build(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0] = self.board;
        buf[1] = self.command.code();
        LittleEndian::write_u16(&mut buf[2..4], self.param1);
        for (dst, src) in buf[4..].iter_mut().zip(self.param2.iter().rev()) {
            *dst = *src;
        }
        buf
    }

    /// Decode a command payload, as the device side would.
    ///
    /// Returns `None` for short payloads or unknown command codes.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < FRAME_LEN {
            return None;
        }
        let command = Command::from_code(data[1])?;
        let param1 = LittleEndian::read_u16(&data[2..4]);
        let param2 = [data[7], data[6], data[5], data[4]];
        Some(Self::new(data[0], command, param1, param2))
    }

    /// `param2` as the 32-bit value the device reads from the frame.
    pub fn param2_value(&self) -> u32 {
        u32::from_be_bytes(self.param2)
    }
}

/// Parsed reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Address of the replying board.
    pub board: u8,
    /// Code of the acknowledged command.
    pub command: u8,
    /// Status byte: 0 on success, device-defined error otherwise.
    pub status: u8,
}

impl Response {
    /// Parse a reply frame.
    ///
    /// Returns `None` if the frame is not on a reply id or is too short.
    pub fn parse(frame: &CanFrame, reply_ids: &ReplyIds) -> Option<Self> {
        if !reply_ids.contains(frame.id()) {
            return None;
        }
        let data = frame.data();
        if data.len() < MIN_REPLY_LEN {
            return None;
        }
        Some(Self {
            board: data[0],
            command: data[1],
            status: data[2],
        })
    }

    /// Whether the device reported success.
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Build the reply payload, as the device side would.
    pub fn build(&self) -> [u8; MIN_REPLY_LEN] {
        [self.board, self.command, self.status]
    }
}
