//! Bootloader commands and their wire encoding.
//!
//! Every command except `ValidateTargetId` is an opcode byte followed by a
//! fixed list of fields, encrypted by the secure channel and sent with
//! instruction 0x00. `ValidateTargetId` has no opcode, is never encrypted and
//! uses its own instruction byte.
//!
//! Integers are big-endian. Variable-length fields carry a one-byte length
//! prefix, except the raw chunk of `LoadSegmentChunk`, which runs to the end
//! of the payload.

use byteorder::{BigEndian, WriteBytesExt};
use thiserror::Error;

use super::apdu::Apdu;
use super::constants::*;
use crate::channel::{SecureChannel, padded_len};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Field '{field}' is {len} bytes, a length prefix holds at most 255")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("APDU data is {len} bytes, limit is {max}")]
    FrameTooLong { len: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a created application's icon comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppIcon {
    /// Icon bytes sent with the command.
    Inline(Vec<u8>),
    /// Icon already present in the loaded image.
    InImage { offset: u32, size: u16 },
}

/// Parameters of `createApp`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateApp {
    pub length: u32,
    pub flags: u32,
    pub name: Vec<u8>,
    pub icon: Option<AppIcon>,
    pub path: Option<Vec<u8>>,
    pub version: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SelectSegment { address: u32 },
    LoadSegmentChunk { offset: u16, chunk: Vec<u8> },
    FlushSegment,
    CrcSegment { offset: u16, length: u32, crc: u16 },
    ValidateTargetId { target_id: u32 },
    /// `address` is sent with the Thumb bit forced on.
    Boot {
        address: u32,
        signature: Option<Vec<u8>>,
    },
    CreateApp(CreateApp),
    DeleteApp { name: Vec<u8> },
    /// `restart` rewinds the device-side listing cursor.
    ListApps { restart: bool },
    SetupCustomCa { name: Vec<u8>, public_key: Vec<u8> },
    ResetCustomCa,
}

/// One serialized field.
enum Field<'a> {
    U16(u16),
    U32(u32),
    /// Unprefixed bytes.
    Raw(&'a [u8]),
    /// Length-prefixed bytes.
    Prefixed(&'static str, &'a [u8]),
    /// Length-prefixed bytes, or a single zero byte when absent.
    PrefixedOrZero(&'static str, Option<&'a [u8]>),
}

impl Field<'_> {
    fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), CommandError> {
        match *self {
            Field::U16(v) => buf.write_u16::<BigEndian>(v)?,
            Field::U32(v) => buf.write_u32::<BigEndian>(v)?,
            Field::Raw(bytes) => buf.extend_from_slice(bytes),
            Field::Prefixed(field, bytes) => {
                if bytes.len() > MAX_FIELD_LEN {
                    return Err(CommandError::FieldTooLong {
                        field,
                        len: bytes.len(),
                    });
                }
                buf.write_u8(bytes.len() as u8)?;
                buf.extend_from_slice(bytes);
            }
            Field::PrefixedOrZero(field, Some(bytes)) => Field::Prefixed(field, bytes).write_to(buf)?,
            Field::PrefixedOrZero(_, None) => buf.write_u8(0x00)?,
        }
        Ok(())
    }
}

impl Command {
    /// Opcode byte, `None` for the unencrypted target-id check.
    pub fn opcode(&self) -> Option<u8> {
        match self {
            Command::SelectSegment { .. } => Some(OP_SELECT_SEGMENT),
            Command::LoadSegmentChunk { .. } => Some(OP_LOAD_SEGMENT_CHUNK),
            Command::FlushSegment => Some(OP_FLUSH_SEGMENT),
            Command::CrcSegment { .. } => Some(OP_CRC_SEGMENT),
            Command::ValidateTargetId { .. } => None,
            Command::Boot { .. } => Some(OP_BOOT),
            Command::CreateApp(_) => Some(OP_CREATE_APP),
            Command::DeleteApp { .. } => Some(OP_DELETE_APP),
            Command::ListApps { restart: true } => Some(OP_LIST_APP),
            Command::ListApps { restart: false } => Some(OP_LIST_APP_CONTINUE),
            Command::SetupCustomCa { .. } => Some(OP_SETUP_CUSTOM_CA),
            Command::ResetCustomCa => Some(OP_RESET_CUSTOM_CA),
        }
    }

    pub fn instruction(&self) -> u8 {
        match self {
            Command::ValidateTargetId { .. } => INS_VALIDATE_TARGET_ID,
            _ => INS_SECURE_COMMAND,
        }
    }

    /// Whether the payload goes through the secure channel.
    pub fn is_secure(&self) -> bool {
        self.opcode().is_some()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::SelectSegment { .. } => "selectSegment",
            Command::LoadSegmentChunk { .. } => "loadSegmentChunk",
            Command::FlushSegment => "flushSegment",
            Command::CrcSegment { .. } => "crcSegment",
            Command::ValidateTargetId { .. } => "validateTargetId",
            Command::Boot { .. } => "boot",
            Command::CreateApp(_) => "createApp",
            Command::DeleteApp { .. } => "deleteApp",
            Command::ListApps { .. } => "listApp",
            Command::SetupCustomCa { .. } => "setupCustomCA",
            Command::ResetCustomCa => "resetCustomCA",
        }
    }

    /// Field layout following the opcode.
    fn fields(&self) -> Vec<Field<'_>> {
        match self {
            Command::SelectSegment { address } => vec![Field::U32(*address)],
            Command::LoadSegmentChunk { offset, chunk } => {
                vec![Field::U16(*offset), Field::Raw(chunk)]
            }
            Command::FlushSegment | Command::ListApps { .. } | Command::ResetCustomCa => vec![],
            Command::CrcSegment {
                offset,
                length,
                crc,
            } => vec![Field::U16(*offset), Field::U32(*length), Field::U16(*crc)],
            Command::ValidateTargetId { target_id } => vec![Field::U32(*target_id)],
            Command::Boot { address, signature } => {
                let mut fields = vec![Field::U32(*address | THUMB_BIT)];
                if let Some(signature) = signature {
                    fields.push(Field::Prefixed("signature", signature));
                }
                fields
            }
            Command::CreateApp(app) => app.fields(),
            Command::DeleteApp { name } => vec![Field::Prefixed("name", name)],
            Command::SetupCustomCa { name, public_key } => vec![
                Field::Prefixed("name", name),
                Field::Prefixed("public_key", public_key),
            ],
        }
    }

    /// Plaintext payload: opcode (if any) followed by the fields.
    pub fn encode(&self) -> Result<Vec<u8>, CommandError> {
        let mut buf = Vec::new();
        if let Some(opcode) = self.opcode() {
            buf.push(opcode);
        }
        for field in self.fields() {
            field.write_to(&mut buf)?;
        }
        Ok(buf)
    }

    /// Encode, encrypt when the command is secure, and frame.
    ///
    /// The frame size is checked before encryption so an oversized command
    /// never advances the channel's IV.
    pub fn to_apdu(&self, cla: u8, channel: &mut SecureChannel) -> Result<Apdu, CommandError> {
        let payload = self.encode()?;
        let data = if self.is_secure() {
            let wire_len = if channel.is_enabled() {
                padded_len(payload.len())
            } else {
                payload.len()
            };
            if wire_len > MAX_APDU_DATA {
                return Err(CommandError::FrameTooLong {
                    len: wire_len,
                    max: MAX_APDU_DATA,
                });
            }
            channel.encrypt(&payload)
        } else {
            payload
        };
        Apdu::new(cla, self.instruction(), data)
    }
}

impl CreateApp {
    fn fields(&self) -> Vec<Field<'_>> {
        let mut fields = vec![
            Field::U32(self.length),
            Field::U32(self.flags),
            Field::Prefixed("name", &self.name),
        ];
        // An icon stored in the image is described after the path instead.
        match &self.icon {
            None => fields.push(Field::PrefixedOrZero("icon", None)),
            Some(AppIcon::Inline(icon)) => fields.push(Field::Prefixed("icon", icon)),
            Some(AppIcon::InImage { .. }) => {}
        }
        fields.push(Field::PrefixedOrZero("path", self.path.as_deref()));
        if let Some(AppIcon::InImage { offset, size }) = &self.icon {
            fields.push(Field::U32(*offset));
            fields.push(Field::U16(*size));
        }
        if let Some(version) = &self.version {
            fields.push(Field::Prefixed("version", version));
        }
        fields
    }
}
