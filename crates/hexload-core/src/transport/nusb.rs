//! nusb-based USB HID transport implementation.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use nusb::transfer::{In, Interrupt, Out};
use nusb::{Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::hid::{ResponseAssembler, wrap_command};
use super::traits::{ApduTransport, TransportError, check_status};
use crate::protocol::Apdu;
use crate::protocol::constants::{HID_REPORT_SIZE, LEDGER_VENDOR_ID};

const HID_INTERFACE: u8 = 0;

/// nusb-based HID transport.
pub struct NusbTransport {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    timeout: Duration,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open the first device with the default vendor id.
    #[instrument(level = "info")]
    pub fn open(timeout: Duration) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == LEDGER_VENDOR_ID)
            .ok_or(TransportError::DeviceNotFound {
                vid: LEDGER_VENDOR_ID,
            })?;

        Self::open_device_info(device_info, timeout)
    }

    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16, timeout: Duration) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid })?;

        Self::open_device_info(device_info, timeout)
    }

    fn open_device_info(
        device_info: nusb::DeviceInfo,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        // usbhid holds the interface on Linux.
        let interface = device
            .detach_and_claim_interface(HID_INTERFACE)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: HID_INTERFACE,
                message: e.to_string(),
            })?;

        // Find the HID interrupt endpoints
        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() == HID_INTERFACE {
                    for alt in iface.alt_settings() {
                        for ep in alt.endpoints() {
                            if ep.transfer_type() == nusb::descriptors::TransferType::Interrupt {
                                if ep.direction() == nusb::transfer::Direction::In {
                                    in_endpoint = ep.address();
                                } else {
                                    out_endpoint = ep.address();
                                }
                            }
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Interrupt".into(),
                direction: "In".into(),
            });
        }
        if out_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Interrupt".into(),
                direction: "Out".into(),
            });
        }

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            timeout_ms = timeout.as_millis() as u64,
            "Device opened successfully"
        );

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            timeout,
            vid,
            pid,
        })
    }

    pub fn vendor_id(&self) -> u16 {
        self.vid
    }

    pub fn product_id(&self) -> u16 {
        self.pid
    }

    fn timeout_error(&self) -> TransportError {
        TransportError::Timeout {
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    fn write_reports(&self, frame: &[u8]) -> Result<(), TransportError> {
        let ep = self
            .interface
            .endpoint::<Interrupt, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(HID_REPORT_SIZE);
        writer.set_write_timeout(self.timeout);
        for report in wrap_command(frame) {
            writer.write_all(&report).map_err(|e| match e.kind() {
                ErrorKind::TimedOut => self.timeout_error(),
                _ => TransportError::WriteFailed(e.to_string()),
            })?;
        }
        writer
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    fn read_response(&self) -> Result<Vec<u8>, TransportError> {
        let ep = self
            .interface
            .endpoint::<Interrupt, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut reader = ep.reader(HID_REPORT_SIZE);
        reader.set_read_timeout(self.timeout);

        let mut assembler = ResponseAssembler::new();
        let mut report = [0u8; HID_REPORT_SIZE];
        loop {
            reader.read_exact(&mut report).map_err(|e| match e.kind() {
                ErrorKind::TimedOut => self.timeout_error(),
                _ => TransportError::ReadFailed(e.to_string()),
            })?;
            if let Some(response) = assembler.push(&report)? {
                return Ok(response);
            }
        }
    }
}

impl ApduTransport for NusbTransport {
    #[instrument(skip(self, apdu), fields(ins = apdu.ins, len = apdu.data().len()))]
    fn exchange(&self, apdu: &Apdu) -> Result<Vec<u8>, TransportError> {
        let frame = apdu.to_bytes();
        self.write_reports(&frame)?;
        debug!(bytes_written = frame.len(), "Command sent");

        let raw = self.read_response()?;
        debug!(bytes_read = raw.len(), "Response received");
        check_status(&raw)
    }
}
