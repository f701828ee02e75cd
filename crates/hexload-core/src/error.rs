//! Session-level errors.

use thiserror::Error;

use crate::channel::ChannelError;
use crate::image::ImageError;
use crate::protocol::{CommandError, InventoryError};
use crate::transport::TransportError;

/// Every way a loader session can fail.
///
/// None of these are retried. After any error the session's secure channel
/// may be out of step with the device, so the caller must start over with a
/// fresh session.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Secure channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("{0}")]
    Inventory(#[from] InventoryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("Segment at 0x{address:08X} is {len} bytes, limit is 65536")]
    SegmentTooLarge { address: u32, len: usize },

    #[error("Region at 0x{start:08X} lies below the load origin 0x{origin:08X}")]
    BelowOrigin { start: u32, origin: u32 },

    #[error("Invalid frame size {max_frame}: {reason}")]
    InvalidFrameSize {
        max_frame: usize,
        reason: &'static str,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}
