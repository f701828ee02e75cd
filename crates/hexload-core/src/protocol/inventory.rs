//! Installed application inventory, as returned by `listApp`.
//!
//! Each record is laid out as:
//!
//! ```text
//! [entry length: u8 (ignored)] [name length: u8] [name] [flags: u32 BE] [hash: 32 bytes]
//! ```
//!
//! Records are packed back to back and the response must end exactly on a
//! record boundary.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

use super::constants::APP_HASH_SIZE;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InventoryError {
    #[error("Inventory decode failed: record at offset {offset} overruns {len}-byte response")]
    Truncated { offset: usize, len: usize },
}

/// One installed application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRecord {
    pub name: Vec<u8>,
    pub flags: u32,
    pub hash: [u8; APP_HASH_SIZE],
}

impl AppRecord {
    /// Name as text, with invalid UTF-8 replaced.
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Decode every record in a decrypted `listApp` response.
pub fn parse_inventory(buf: &[u8]) -> Result<Vec<AppRecord>, InventoryError> {
    let mut cursor = Cursor::new(buf);
    let mut records = Vec::new();

    while (cursor.position() as usize) < buf.len() {
        let offset = cursor.position() as usize;
        let record = read_record(&mut cursor).map_err(|_| InventoryError::Truncated {
            offset,
            len: buf.len(),
        })?;
        records.push(record);
    }

    Ok(records)
}

fn read_record(cursor: &mut Cursor<&[u8]>) -> std::io::Result<AppRecord> {
    let _entry_len = cursor.read_u8()?;
    let name_len = cursor.read_u8()? as usize;
    let mut name = vec![0u8; name_len];
    cursor.read_exact(&mut name)?;
    let flags = cursor.read_u32::<BigEndian>()?;
    let mut hash = [0u8; APP_HASH_SIZE];
    cursor.read_exact(&mut hash)?;
    Ok(AppRecord { name, flags, hash })
}
