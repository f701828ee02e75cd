//! Hexload-Core: secure bootloader loading protocol in Rust.
//!
//! This crate drives the bootloader of APDU-based hardware security devices:
//! it streams address-tagged memory images in CRC-checked segments, manages
//! installed applications and custom certificate authorities, and optionally
//! wraps every command in an AES-128-CBC secure channel.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, APDU framing, command serializer, inventory parser
//! - **Channel**: AES-128-CBC secure channel with a chained IV
//! - **Transport**: Device communication abstraction (nusb HID, mock)
//! - **Image**: Memory regions and the image provider contract
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: Command orchestrator, segment loader and configuration
//!
//! # Example
//!
//! ```no_run
//! use hexload_core::image::SegmentedImage;
//! use hexload_core::session::{LoaderSession, SessionConfig};
//! use hexload_core::transport::NusbTransport;
//!
//! let config = SessionConfig::default();
//! let transport = NusbTransport::open(config.timeout()).expect("no device");
//! let mut session = LoaderSession::new(&config, Some(Box::new(transport))).unwrap();
//!
//! let image = SegmentedImage::from_file("app.bin", 0xC0D0_0000).unwrap();
//! let digest = session.load(&image).expect("load failed");
//! println!("{digest}");
//! ```

pub mod channel;
pub mod crc;
pub mod error;
pub mod events;
pub mod image;
pub mod loader;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use channel::{ChannelError, SecureChannel};
pub use error::LoaderError;
pub use events::{LoaderEvent, LoaderObserver, RecordingObserver, TracingObserver};
pub use image::{ImageProvider, MemoryRegion, SegmentedImage};
pub use loader::chunk_capacity;
pub use protocol::{AppIcon, AppRecord, Command, CreateApp};
pub use session::{LoaderSession, SessionConfig};
pub use transport::{ApduTransport, MockTransport, NusbTransport, TransportError};
