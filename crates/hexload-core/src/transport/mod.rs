//! Transport layer module.

pub mod hid;
pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::MockTransport;
pub use nusb::NusbTransport;
pub use traits::{ApduTransport, TransportError, check_status};
