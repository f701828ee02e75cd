//! Protocol module - bootloader command definitions.

pub mod apdu;
pub mod command;
pub mod constants;
pub mod inventory;

pub use apdu::Apdu;
pub use command::{AppIcon, Command, CommandError, CreateApp};
pub use constants::*;
pub use inventory::{AppRecord, InventoryError, parse_inventory};
