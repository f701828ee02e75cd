//! Bootloader protocol constants.
//!
//! Opcodes, frame limits and HID framing values used by the secure
//! bootloader of Ledger-style devices (`hexLoader.py` in ledgerblue).

// Default class byte of the bootloader commands
pub const DEFAULT_CLA: u8 = 0xF0;

// Instructions
pub const INS_SECURE_COMMAND: u8 = 0x00;
pub const INS_VALIDATE_TARGET_ID: u8 = 0x04;

// Secure command opcodes (first plaintext byte)
pub const OP_SELECT_SEGMENT: u8 = 0x05;
pub const OP_LOAD_SEGMENT_CHUNK: u8 = 0x06;
pub const OP_FLUSH_SEGMENT: u8 = 0x07;
pub const OP_CRC_SEGMENT: u8 = 0x08;
pub const OP_BOOT: u8 = 0x09;
pub const OP_CREATE_APP: u8 = 0x0B;
pub const OP_DELETE_APP: u8 = 0x0C;
pub const OP_LIST_APP: u8 = 0x0E;
pub const OP_LIST_APP_CONTINUE: u8 = 0x0F;
pub const OP_SETUP_CUSTOM_CA: u8 = 0x12;
pub const OP_RESET_CUSTOM_CA: u8 = 0x13;

// Jump addresses with bit 0 set execute in Thumb mode
pub const THUMB_BIT: u32 = 0x0000_0001;

// Short APDU limits
pub const APDU_HEADER_SIZE: usize = 5;
pub const MAX_APDU_DATA: usize = 255;
pub const MAX_FIELD_LEN: usize = 255;

// Segment transfer
pub const MAX_SEGMENT_SIZE: usize = 0x10000;
pub const LOAD_SEGMENT_CHUNK_HEADER_LENGTH: usize = 3;
pub const MIN_PADDING_LENGTH: usize = 1;
pub const DEFAULT_MAX_FRAME: usize = 0xF0;

// Inventory
pub const APP_HASH_SIZE: usize = 32;

// Status words
pub const SW_OK: u16 = 0x9000;

// USB
pub const LEDGER_VENDOR_ID: u16 = 0x2C97;
pub const HID_REPORT_SIZE: usize = 64;
pub const HID_CHANNEL: u16 = 0x0101;
pub const HID_TAG_APDU: u8 = 0x05;
