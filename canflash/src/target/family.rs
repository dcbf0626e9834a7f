//! Device family abstraction for bootloader deployments.
//!
//! Different generations of the CAN bootloader disagree on bus identifiers
//! (a per-board reply range on `0x701..` versus a single shared `0xB1`), so
//! the wire constants are carried in a [`ProtocolConfig`] value instead of
//! being compiled in. Page size and the CRC algorithm travel with it.

use {
    crate::{
        error::{Error, Result},
        protocol::BOOTLOADER_CRC,
    },
    crc::Algorithm,
    std::{fmt, time::Duration},
};

/// Supported bootloader deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DeviceFamily {
    /// Commands on `0x700`, replies on `0x701 + n` for per-board channels.
    #[default]
    Standard,
    /// Commands on `0xB0`, every board replies on `0xB1`.
    Legacy,
}

impl DeviceFamily {
    /// Bus identifier commands are sent on.
    #[must_use]
    pub fn command_id(&self) -> u16 {
        match self {
            Self::Standard => 0x700,
            Self::Legacy => 0xB0,
        }
    }

    /// Bus identifiers replies may arrive on.
    #[must_use]
    pub fn reply_ids(&self) -> ReplyIds {
        match self {
            Self::Standard => ReplyIds::Range {
                base: 0x701,
                len: 255,
            },
            Self::Legacy => ReplyIds::Single(0xB1),
        }
    }

    /// Get the device family from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "standard" | "default" => Some(Self::Standard),
            "legacy" => Some(Self::Legacy),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Legacy => write!(f, "legacy"),
        }
    }
}

/// Set of bus identifiers recognized as bootloader replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyIds {
    /// One shared identifier.
    Single(u16),
    /// Contiguous range `base..base + len`.
    Range {
        /// First identifier of the range.
        base: u16,
        /// Number of identifiers in the range.
        len: u16,
    },
}

impl ReplyIds {
    /// Whether `id` is a reply identifier.
    pub fn contains(&self, id: u32) -> bool {
        match *self {
            Self::Single(reply) => id == u32::from(reply),
            Self::Range { base, len } => id
                .checked_sub(u32::from(base))
                .is_some_and(|offset| offset < u32::from(len)),
        }
    }

    /// Identifier a given board replies on.
    ///
    /// Boards in a range deployment answer on `base + address`.
    pub fn for_board(&self, board: u8) -> u16 {
        match *self {
            Self::Single(reply) => reply,
            Self::Range { base, .. } => base + u16::from(board),
        }
    }
}

/// Page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 1024;

/// Protocol configuration shared by the client and the flasher.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Device family the identifiers were taken from.
    pub family: DeviceFamily,
    /// Command identifier.
    pub command_id: u16,
    /// Reply identifiers.
    pub reply_ids: ReplyIds,
    /// Flash page size in bytes.
    pub page_size: usize,
    /// CRC algorithm for page and image digests.
    pub crc: &'static Algorithm<u32>,
    /// How long a single frame transmission may take.
    pub send_timeout: Duration,
    /// Reply window for ordinary commands.
    pub command_timeout: Duration,
    /// Attempts per ordinary command.
    pub command_tries: u32,
    /// Reply window per handshake ping.
    pub connect_timeout: Duration,
    /// Handshake ping attempts.
    pub connect_tries: u32,
    /// Collection window per discovery ping.
    pub discover_timeout: Duration,
    /// Discovery pings.
    pub discover_tries: u32,
    /// Reply window for an address change.
    pub set_id_timeout: Duration,
    /// Full-page attempts before a flash is abandoned.
    pub page_retries: u32,
}

impl ProtocolConfig {
    /// Create the configuration for the given family.
    pub fn new(family: DeviceFamily) -> Self {
        Self {
            family,
            command_id: family.command_id(),
            reply_ids: family.reply_ids(),
            page_size: DEFAULT_PAGE_SIZE,
            crc: BOOTLOADER_CRC,
            send_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_millis(50),
            command_tries: 10,
            connect_timeout: Duration::from_millis(100),
            connect_tries: 10,
            discover_timeout: Duration::from_millis(100),
            discover_tries: 10,
            set_id_timeout: Duration::from_secs(1),
            page_retries: 3,
        }
    }

    /// Set the page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the CRC algorithm.
    #[must_use]
    pub fn with_crc(mut self, crc: &'static Algorithm<u32>) -> Self {
        self.crc = crc;
        self
    }

    /// Set the reply window and attempts for ordinary commands.
    #[must_use]
    pub fn with_command_timing(mut self, timeout: Duration, tries: u32) -> Self {
        self.command_timeout = timeout;
        self.command_tries = tries;
        self
    }

    /// Set the handshake window and attempts.
    #[must_use]
    pub fn with_connect_timing(mut self, timeout: Duration, tries: u32) -> Self {
        self.connect_timeout = timeout;
        self.connect_tries = tries;
        self
    }

    /// Set the discovery window and attempts.
    #[must_use]
    pub fn with_discover_timing(mut self, timeout: Duration, tries: u32) -> Self {
        self.discover_timeout = timeout;
        self.discover_tries = tries;
        self
    }

    /// Set the address change reply window.
    #[must_use]
    pub fn with_set_id_timeout(mut self, timeout: Duration) -> Self {
        self.set_id_timeout = timeout;
        self
    }

    /// Set the full-page attempt budget.
    #[must_use]
    pub fn with_page_retries(mut self, retries: u32) -> Self {
        self.page_retries = retries;
        self
    }

    /// Number of 32-bit words in a page.
    pub fn words_per_page(&self) -> usize {
        self.page_size / 4
    }

    /// Check that the page geometry fits the wire format.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size % 4 != 0 {
            return Err(Error::Config(format!(
                "page size must be a nonzero multiple of 4, got {}",
                self.page_size
            )));
        }
        if self.words_per_page() > usize::from(u16::MAX) + 1 {
            return Err(Error::Config(format!(
                "page size {} has more words than param1 can index",
                self.page_size
            )));
        }
        Ok(())
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self::new(DeviceFamily::default())
    }
}
