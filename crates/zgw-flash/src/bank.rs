//! Dual-bank firmware layout and boot marker.
//!
//! The gateway keeps two firmware banks. One is active and running; the
//! other is the install target. After a verified install the updater
//! persists a [`BootMarker`] and the bootloader switches banks on the next
//! reset. The running firmware never overwrites its own bank.
//!
//! # Boot marker wire format (16 bytes)
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  Magic "BSWP" (4 bytes, BE)  │  offset 0
//! ├──────────────────────────────┤
//! │  Target bank (1) + pad (3)   │  offset 4
//! ├──────────────────────────────┤
//! │  Firmware version (4, BE)    │  offset 8
//! ├──────────────────────────────┤
//! │  Firmware CRC-32 (4, BE)     │  offset 12
//! └──────────────────────────────┘
//! ```

use std::fmt;

use crate::storage::{Storage, StorageError};

/// Boot marker magic, "BSWP" as big-endian bytes.
pub const BOOT_MARKER_MAGIC: u32 = 0x4253_5750;
/// Size of the persisted boot marker.
pub const BOOT_MARKER_LEN: usize = 16;

/// Default flash partitioning used when the configuration does not
/// override it: staging regions in the first 16 MiB, then bank A, bank B
/// and the marker sector.
pub const DEFAULT_BANK_A_BASE: u32 = 0x0100_0000;
pub const DEFAULT_BANK_B_BASE: u32 = 0x0140_0000;
pub const DEFAULT_BANK_SIZE: u32 = 0x0040_0000;
pub const DEFAULT_MARKER_ADDRESS: u32 = 0x0180_0000;

/// One of the two firmware banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankId {
    A,
    B,
}

impl BankId {
    /// The opposite bank, i.e. the install target when `self` is active.
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::A),
            1 => Some(Self::B),
            _ => None,
        }
    }
}

impl fmt::Display for BankId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::B => f.write_str("B"),
        }
    }
}

/// Where the two banks and the boot marker live in the device address
/// space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankLayout {
    pub a_base: u32,
    pub b_base: u32,
    pub bank_size: u32,
    pub marker_address: u32,
}

impl BankLayout {
    pub fn base(&self, bank: BankId) -> u32 {
        match bank {
            BankId::A => self.a_base,
            BankId::B => self.b_base,
        }
    }
}

impl Default for BankLayout {
    fn default() -> Self {
        Self {
            a_base: DEFAULT_BANK_A_BASE,
            b_base: DEFAULT_BANK_B_BASE,
            bank_size: DEFAULT_BANK_SIZE,
            marker_address: DEFAULT_MARKER_ADDRESS,
        }
    }
}

/// Health bookkeeping for both banks, reported through diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankStatus {
    pub active: BankId,
    pub a_healthy: bool,
    pub b_healthy: bool,
    /// A verified install finished and the boot marker points at the other
    /// bank; the switch happens on the next reset.
    pub pending_switch: bool,
}

impl BankStatus {
    /// Fresh status: bank A active and healthy, nothing staged.
    pub fn initial() -> Self {
        Self {
            active: BankId::A,
            a_healthy: true,
            b_healthy: false,
            pending_switch: false,
        }
    }

    /// Canonical 4-byte diagnostic encoding: active bank, bank A health,
    /// bank B health, pending switch flag.
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            self.active.to_wire(),
            self.a_healthy as u8,
            self.b_healthy as u8,
            self.pending_switch as u8,
        ]
    }
}

/// Persisted instruction for the bootloader: which bank to boot next and
/// what it should contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootMarker {
    pub target_bank: BankId,
    pub firmware_version: u32,
    pub firmware_crc: u32,
}

impl BootMarker {
    pub fn to_bytes(&self) -> [u8; BOOT_MARKER_LEN] {
        let mut out = [0u8; BOOT_MARKER_LEN];
        out[0..4].copy_from_slice(&BOOT_MARKER_MAGIC.to_be_bytes());
        out[4] = self.target_bank.to_wire();
        out[8..12].copy_from_slice(&self.firmware_version.to_be_bytes());
        out[12..16].copy_from_slice(&self.firmware_crc.to_be_bytes());
        out
    }

    /// Decodes a marker from raw flash bytes. Erased or corrupt sectors
    /// yield `None`; there is nothing staged for the bootloader then.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < BOOT_MARKER_LEN {
            return None;
        }
        let magic = u32::from_be_bytes(bytes[0..4].try_into().ok()?);
        if magic != BOOT_MARKER_MAGIC {
            return None;
        }
        let target_bank = BankId::from_wire(bytes[4])?;
        let firmware_version = u32::from_be_bytes(bytes[8..12].try_into().ok()?);
        let firmware_crc = u32::from_be_bytes(bytes[12..16].try_into().ok()?);
        Some(Self {
            target_bank,
            firmware_version,
            firmware_crc,
        })
    }

    /// Reads the marker sector from `storage`.
    pub fn load(storage: &dyn Storage, layout: &BankLayout) -> Result<Option<Self>, StorageError> {
        let mut buf = [0u8; BOOT_MARKER_LEN];
        storage.read(layout.marker_address, &mut buf)?;
        Ok(Self::parse(&buf))
    }

    /// Erases the marker sector and writes this marker.
    pub fn persist(&self, storage: &dyn Storage, layout: &BankLayout) -> Result<(), StorageError> {
        storage.erase(layout.marker_address, BOOT_MARKER_LEN as u32)?;
        storage.write(layout.marker_address, &self.to_bytes())
    }
}
