//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other front end) to follow a load without
//! tight coupling to the session logic.

use std::fmt;

/// Frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for FrameDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameDirection::Tx => write!(f, "TX"),
            FrameDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by the loader session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderEvent {
    /// A segment was selected on the device.
    SegmentSelected {
        index: usize,
        address: u32,
        len: usize,
    },
    /// Bytes of the current segment transferred so far.
    Progress {
        index: usize,
        current: u64,
        total: u64,
    },
    /// Segment flushed and its CRC submitted.
    SegmentVerified { index: usize, address: u32, crc: u16 },
    /// Frame exchanged with the device.
    Frame {
        direction: FrameDirection,
        command: &'static str,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// No transport attached; the frame was only traced.
    DryRun { command: &'static str, frame: String },
    /// Image transfer finished.
    LoadComplete { digest: String, bytes: u64 },
}

/// Observer trait for receiving loader events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait LoaderObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &LoaderEvent);
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl LoaderObserver for TracingObserver {
    fn on_event(&self, event: &LoaderEvent) {
        match event {
            LoaderEvent::SegmentSelected {
                index,
                address,
                len,
            } => {
                tracing::info!(index, address = %format!("0x{:08X}", address), len, "Segment selected");
            }
            LoaderEvent::Progress {
                index,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    100
                };
                tracing::debug!(index, progress = %format!("{}%", pct), "Progress");
            }
            LoaderEvent::SegmentVerified {
                index,
                address,
                crc,
            } => {
                tracing::info!(
                    index,
                    address = %format!("0x{:08X}", address),
                    crc = %format!("0x{:04X}", crc),
                    "Segment CRC submitted"
                );
            }
            LoaderEvent::Frame {
                direction,
                command,
                length,
                ..
            } => {
                tracing::trace!(dir = %direction, command, len = length, "APDU");
            }
            LoaderEvent::DryRun { command, frame } => {
                tracing::info!(command, apdu = %frame, "Dry run");
            }
            LoaderEvent::LoadComplete { digest, bytes } => {
                tracing::info!(digest = %digest, bytes, "Load complete");
            }
        }
    }
}

/// Observer that records every event, for tests and scripted front ends.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<LoaderEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LoaderEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl LoaderObserver for RecordingObserver {
    fn on_event(&self, event: &LoaderEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
