//! APDU transport abstraction.
//!
//! Defines the `ApduTransport` trait used by the loader session,
//! allowing different implementations (nusb, mock, etc.).

use thiserror::Error;

use crate::protocol::Apdu;
use crate::protocol::constants::SW_OK;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X}")]
    DeviceNotFound { vid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Device returned status 0x{sw:04X}")]
    Status { sw: u16 },

    #[error("Framing error: {0}")]
    Framing(String),
}

/// Abstract command/response transport.
///
/// One call is one blocking round trip; implementations never pipeline.
pub trait ApduTransport: Send + Sync {
    /// Send a frame and return the response data with the status word removed.
    fn exchange(&self, apdu: &Apdu) -> Result<Vec<u8>, TransportError>;

    /// Check if device is still connected.
    fn is_connected(&self) -> bool {
        true
    }
}

/// Split the trailing status word off a raw response.
///
/// Anything other than 0x9000 is reported as `TransportError::Status`.
pub fn check_status(response: &[u8]) -> Result<Vec<u8>, TransportError> {
    let Some(split) = response.len().checked_sub(2) else {
        return Err(TransportError::ReadFailed(format!(
            "{}-byte response has no status word",
            response.len()
        )));
    };
    let sw = u16::from_be_bytes([response[split], response[split + 1]]);
    if sw != SW_OK {
        return Err(TransportError::Status { sw });
    }
    Ok(response[..split].to_vec())
}
