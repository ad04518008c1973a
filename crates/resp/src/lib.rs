//! Subscribe wire protocol
//!
//! A RESP-like, line oriented command format used by comet clients:
//!
//! ```text
//! *<argc>\r\n
//! $<len>\r\n<len bytes>\r\n      (argc times)
//! ```
//!
//! # Features
//! - Async command parser with strict size/terminator checks
//! - `sub` command decoding with heartbeat validation
//! - Fixed reply byte strings and outbound message framing

pub mod async_parser;
pub mod command;
pub mod encoder;

pub use async_parser::AsyncCommandParser;
pub use command::{Command, Subscribe};
pub use encoder::{encode_message_frame, Reply};

use std::time::Duration;

/// Minimum number of arguments in one command frame
pub const MIN_CMD_NUM: usize = 1;
/// Maximum number of arguments in one command frame
pub const MAX_CMD_NUM: usize = 5;

/// Heartbeat byte sent by clients
pub const HEARTBEAT: u8 = b'h';
/// Smallest heartbeat interval a client may ask for (seconds)
pub const MIN_HEARTBEAT_SECS: u64 = 30;
/// Grace added on top of the client heartbeat before the read deadline fires
pub const HEARTBEAT_DELAY_SECS: u64 = 5;
/// The first command frame must arrive within this window
pub const FIRST_PACKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cmd format error: {0}")]
    Protocol(String),
    #[error("unexpected EOF")]
    UnexpectedEof,
    #[error("frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),
    #[error("invalid parameter: {0}")]
    Parameter(String),
}

impl RespError {
    /// Whether a parameter-error reply should be sent before closing
    pub fn is_parameter(&self) -> bool {
        matches!(self, RespError::Parameter(_))
    }
}
