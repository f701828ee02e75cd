//! HID report framing for APDUs.
//!
//! The device exchanges APDUs over 64-byte HID reports:
//!
//! ```text
//! report 0:  [channel: u16 BE][tag 0x05][seq: u16 BE][total length: u16 BE][data...]
//! report n:  [channel: u16 BE][tag 0x05][seq: u16 BE][data...]
//! ```
//!
//! The last report is zero-filled. Responses use the same framing.

use byteorder::{BigEndian, ByteOrder};

use super::traits::TransportError;
use crate::protocol::constants::{HID_CHANNEL, HID_REPORT_SIZE, HID_TAG_APDU};

const REPORT_HEADER: usize = 5;
const LENGTH_FIELD: usize = 2;

pub type Report = [u8; HID_REPORT_SIZE];

/// Split a serialized APDU into HID reports.
pub fn wrap_command(apdu: &[u8]) -> Vec<Report> {
    let mut reports = Vec::new();
    let mut remaining = apdu;
    let mut seq: u16 = 0;

    loop {
        let mut report = [0u8; HID_REPORT_SIZE];
        BigEndian::write_u16(&mut report[0..2], HID_CHANNEL);
        report[2] = HID_TAG_APDU;
        BigEndian::write_u16(&mut report[3..5], seq);

        let mut pos = REPORT_HEADER;
        if seq == 0 {
            BigEndian::write_u16(&mut report[pos..pos + LENGTH_FIELD], apdu.len() as u16);
            pos += LENGTH_FIELD;
        }

        let n = remaining.len().min(HID_REPORT_SIZE - pos);
        report[pos..pos + n].copy_from_slice(&remaining[..n]);
        remaining = &remaining[n..];
        reports.push(report);

        if remaining.is_empty() {
            break;
        }
        seq = seq.wrapping_add(1);
    }

    reports
}

/// Reassembles one response from consecutive HID reports.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    expected_len: Option<usize>,
    next_seq: u16,
    data: Vec<u8>,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one report. Returns the complete response once every byte has
    /// arrived.
    pub fn push(&mut self, report: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        if report.len() < REPORT_HEADER + LENGTH_FIELD {
            return Err(TransportError::Framing(format!(
                "short report: {} bytes",
                report.len()
            )));
        }

        let channel = BigEndian::read_u16(&report[0..2]);
        if channel != HID_CHANNEL {
            return Err(TransportError::Framing(format!(
                "unexpected channel 0x{channel:04X}"
            )));
        }
        if report[2] != HID_TAG_APDU {
            return Err(TransportError::Framing(format!(
                "unexpected tag 0x{:02X}",
                report[2]
            )));
        }
        let seq = BigEndian::read_u16(&report[3..5]);
        if seq != self.next_seq {
            return Err(TransportError::Framing(format!(
                "sequence {seq}, expected {}",
                self.next_seq
            )));
        }

        let mut body = &report[REPORT_HEADER..];
        let expected = match self.expected_len {
            Some(len) => len,
            None => {
                let len = BigEndian::read_u16(&body[..LENGTH_FIELD]) as usize;
                body = &body[LENGTH_FIELD..];
                self.expected_len = Some(len);
                self.data.reserve(len);
                len
            }
        };

        let n = (expected - self.data.len()).min(body.len());
        self.data.extend_from_slice(&body[..n]);
        self.next_seq = self.next_seq.wrapping_add(1);

        if self.data.len() == expected {
            Ok(Some(std::mem::take(&mut self.data)))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(reports: &[Report]) -> Vec<u8> {
        let mut assembler = ResponseAssembler::new();
        for (i, report) in reports.iter().enumerate() {
            if let Some(data) = assembler.push(report).unwrap() {
                assert_eq!(i, reports.len() - 1, "completed before last report");
                return data;
            }
        }
        panic!("response never completed");
    }

    #[test]
    fn test_single_report() {
        let apdu = [0xF0, 0x04, 0x00, 0x00, 0x04, 0x31, 0x00, 0x00, 0x04];
        let reports = wrap_command(&apdu);
        assert_eq!(reports.len(), 1);
        assert_eq!(&reports[0][..7], &[0x01, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09]);
        assert_eq!(&reports[0][7..16], &apdu);
        assert!(reports[0][16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_multi_report_sequence() {
        let apdu: Vec<u8> = (0..200u16).map(|i| i as u8).collect();
        let reports = wrap_command(&apdu);

        // 57 bytes in the first report, 59 in each following one.
        assert_eq!(reports.len(), 4);
        for (i, report) in reports.iter().enumerate() {
            assert_eq!(BigEndian::read_u16(&report[3..5]), i as u16);
        }
        assert_eq!(reassemble(&reports), apdu);
    }

    #[test]
    fn test_exact_fit_and_empty() {
        let apdu = vec![0xAB; HID_REPORT_SIZE - REPORT_HEADER - LENGTH_FIELD];
        assert_eq!(wrap_command(&apdu).len(), 1);
        assert_eq!(reassemble(&wrap_command(&apdu)), apdu);

        let reports = wrap_command(&[]);
        assert_eq!(reports.len(), 1);
        assert!(reassemble(&reports).is_empty());
    }

    #[test]
    fn test_rejects_bad_reports() {
        let reports = wrap_command(&[0u8; 100]);

        let mut assembler = ResponseAssembler::new();
        assert!(matches!(
            assembler.push(&reports[1]),
            Err(TransportError::Framing(_))
        ));

        let mut wrong_channel = reports[0];
        wrong_channel[0] = 0x02;
        assert!(ResponseAssembler::new().push(&wrong_channel).is_err());

        let mut wrong_tag = reports[0];
        wrong_tag[2] = 0x02;
        assert!(ResponseAssembler::new().push(&wrong_tag).is_err());

        assert!(ResponseAssembler::new().push(&[0x01, 0x01]).is_err());
    }
}
