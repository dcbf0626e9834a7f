//! Device family and protocol configuration.

pub mod family;

pub use family::{DEFAULT_PAGE_SIZE, DeviceFamily, ProtocolConfig, ReplyIds};
