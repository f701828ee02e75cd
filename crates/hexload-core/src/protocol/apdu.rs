//! Short-form APDU frames.

use std::fmt;

use super::command::CommandError;
use super::constants::{APDU_HEADER_SIZE, MAX_APDU_DATA};

/// `[cla][ins][p1][p2][lc][data]` with `lc <= 255`.
#[derive(Clone, PartialEq, Eq)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    data: Vec<u8>,
}

impl Apdu {
    /// Build a frame with `p1 = p2 = 0`, as every bootloader command uses.
    pub fn new(cla: u8, ins: u8, data: Vec<u8>) -> Result<Self, CommandError> {
        Self::with_params(cla, ins, 0x00, 0x00, data)
    }

    pub fn with_params(
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        data: Vec<u8>,
    ) -> Result<Self, CommandError> {
        if data.len() > MAX_APDU_DATA {
            return Err(CommandError::FrameTooLong {
                len: data.len(),
                max: MAX_APDU_DATA,
            });
        }
        Ok(Self {
            cla,
            ins,
            p1,
            p2,
            data,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(APDU_HEADER_SIZE + self.data.len());
        buf.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2, self.data.len() as u8]);
        buf.extend_from_slice(&self.data);
        buf
    }
}

impl fmt::Debug for Apdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Apdu({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for Apdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let apdu = Apdu::new(0xF0, 0x04, vec![0x31, 0x00, 0x00, 0x04]).unwrap();
        assert_eq!(
            apdu.to_bytes(),
            vec![0xF0, 0x04, 0x00, 0x00, 0x04, 0x31, 0x00, 0x00, 0x04]
        );
        assert_eq!(apdu.to_string(), "f00400000431000004");
    }

    #[test]
    fn test_data_ceiling() {
        assert!(Apdu::new(0xF0, 0x00, vec![0; 255]).is_ok());
        assert!(matches!(
            Apdu::new(0xF0, 0x00, vec![0; 256]),
            Err(CommandError::FrameTooLong { len: 256, max: 255 })
        ));
    }

}
