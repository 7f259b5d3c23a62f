//! Gateway configuration
//!
//! Fully data-driven configuration for the zonal gateway daemon: identity
//! strings served over ReadDataByIdentifier, listen endpoint and logical
//! address, flash layout, and the zone table that drives staging-region
//! lookup, forwarding endpoints and the installed-version inventory.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zgw_flash::{
    BankLayout, StagingMap, StagingRegion, DEFAULT_BANK_A_BASE, DEFAULT_BANK_B_BASE,
    DEFAULT_BANK_SIZE, DEFAULT_MARKER_ADDRESS, STAGING_REGION_SIZE,
};

/// Configuration errors surfaced while loading or validating a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("zone `{name}` reuses logical address {address:#06X}")]
    DuplicateZoneAddress { name: String, address: u16 },

    #[error("zone `{name}` uses the gateway's own logical address {address:#06X}")]
    ZoneShadowsGateway { name: String, address: u16 },

    #[error("client pool size must be at least 1")]
    EmptyClientPool,
}

/// Complete gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    /// Identity strings served as DIDs
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Listen endpoint and logical addressing
    #[serde(default)]
    pub network: NetworkConfig,

    /// Backing flash device
    #[serde(default)]
    pub storage: StorageConfig,

    /// Dual-bank program flash layout
    #[serde(default)]
    pub banks: BankConfig,

    /// Download and distribution tuning
    #[serde(default)]
    pub update: UpdateConfig,

    /// Downstream zone ECUs reachable from this gateway
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.update.client_pool_size == 0 {
            return Err(ConfigError::EmptyClientPool);
        }
        for (index, zone) in self.zones.iter().enumerate() {
            if zone.address == self.network.logical_address {
                return Err(ConfigError::ZoneShadowsGateway {
                    name: zone.name.clone(),
                    address: zone.address,
                });
            }
            if self.zones[..index].iter().any(|z| z.address == zone.address) {
                return Err(ConfigError::DuplicateZoneAddress {
                    name: zone.name.clone(),
                    address: zone.address,
                });
            }
        }
        Ok(())
    }

    /// Staging-region map: the gateway's own region plus one per zone.
    pub fn staging_map(&self) -> StagingMap {
        let mut map = StagingMap::new(vec![StagingRegion {
            target_id: self.network.logical_address,
            base: self.update.staging_base,
            capacity: self.update.staging_size,
        }]);
        for zone in &self.zones {
            map.insert(StagingRegion {
                target_id: zone.address,
                base: zone.staging_base,
                capacity: zone.staging_size,
            });
        }
        map
    }

    /// Program-flash bank layout.
    pub fn bank_layout(&self) -> BankLayout {
        BankLayout {
            a_base: self.banks.a_base,
            b_base: self.banks.b_base,
            bank_size: self.banks.bank_size,
            marker_address: self.banks.marker_address,
        }
    }

    /// Forwarding endpoint for a zone address, if configured.
    pub fn zone_endpoint(&self, address: u16) -> Option<&str> {
        self.zones
            .iter()
            .find(|z| z.address == address)
            .map(|z| z.endpoint.as_str())
    }
}

// =============================================================================
// Identity Configuration
// =============================================================================

/// Identity strings the gateway reports over ReadDataByIdentifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Vehicle Identification Number (DID 0xF190)
    #[serde(default = "default_vin")]
    pub vin: String,

    /// Hardware number (DID 0xF191)
    #[serde(default = "default_hardware_number")]
    pub hardware_number: String,

    /// Serial number (DID 0xF18C)
    #[serde(default = "default_serial_number")]
    pub serial_number: String,

    /// Running software version (DID 0xF195)
    #[serde(default = "default_software_version")]
    pub software_version: String,

    /// System name (DID 0xF197)
    #[serde(default = "default_system_name")]
    pub system_name: String,
}

fn default_vin() -> String {
    "UNSET".to_string()
}

fn default_hardware_number() -> String {
    "ZGW-HW-REV-A".to_string()
}

fn default_serial_number() -> String {
    "SN-ZGW-00000001".to_string()
}

fn default_software_version() -> String {
    "1.0.0".to_string()
}

fn default_system_name() -> String {
    "Zonal Gateway".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            vin: default_vin(),
            hardware_number: default_hardware_number(),
            serial_number: default_serial_number(),
            software_version: default_software_version(),
            system_name: default_system_name(),
        }
    }
}

// =============================================================================
// Network Configuration
// =============================================================================

/// Listen endpoint and logical addressing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TCP listen endpoint for inbound diagnostic links
    #[serde(default = "default_listen")]
    pub listen: String,

    /// The gateway's own logical address (also its update target id)
    #[serde(
        default = "default_logical_address",
        deserialize_with = "deserialize_hex_u16"
    )]
    pub logical_address: u16,
}

fn default_listen() -> String {
    "0.0.0.0:13400".to_string()
}

fn default_logical_address() -> u16 {
    0x0201
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            logical_address: default_logical_address(),
        }
    }
}

// =============================================================================
// Storage Configuration
// =============================================================================

/// Backing flash device for staging regions, program banks and boot marker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// File the flash image is persisted to
    #[serde(default = "default_storage_path")]
    pub path: String,

    /// Device capacity in bytes
    #[serde(
        default = "default_storage_capacity",
        deserialize_with = "deserialize_hex_u32"
    )]
    pub capacity: u32,
}

fn default_storage_path() -> String {
    "zgw-flash.bin".to_string()
}

fn default_storage_capacity() -> u32 {
    // Four staging regions, two program banks and the marker page
    0x0200_0000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            capacity: default_storage_capacity(),
        }
    }
}

// =============================================================================
// Bank Configuration
// =============================================================================

/// Dual-bank program flash layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankConfig {
    /// Base address of bank A
    #[serde(default = "default_bank_a", deserialize_with = "deserialize_hex_u32")]
    pub a_base: u32,

    /// Base address of bank B
    #[serde(default = "default_bank_b", deserialize_with = "deserialize_hex_u32")]
    pub b_base: u32,

    /// Size of each bank
    #[serde(
        default = "default_bank_size",
        deserialize_with = "deserialize_hex_u32"
    )]
    pub bank_size: u32,

    /// Address the boot-switch marker is persisted at
    #[serde(
        default = "default_marker_address",
        deserialize_with = "deserialize_hex_u32"
    )]
    pub marker_address: u32,
}

fn default_bank_a() -> u32 {
    DEFAULT_BANK_A_BASE
}

fn default_bank_b() -> u32 {
    DEFAULT_BANK_B_BASE
}

fn default_bank_size() -> u32 {
    DEFAULT_BANK_SIZE
}

fn default_marker_address() -> u32 {
    DEFAULT_MARKER_ADDRESS
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            a_base: default_bank_a(),
            b_base: default_bank_b(),
            bank_size: default_bank_size(),
            marker_address: default_marker_address(),
        }
    }
}

// =============================================================================
// Update Configuration
// =============================================================================

/// Download and distribution tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Outbound client contexts available for forwarding and distribution
    #[serde(default = "default_client_pool_size")]
    pub client_pool_size: usize,

    /// Staging base for containers targeting the gateway itself
    #[serde(
        default = "default_self_staging_base",
        deserialize_with = "deserialize_hex_u32"
    )]
    pub staging_base: u32,

    /// Capacity of the gateway's own staging region
    #[serde(
        default = "default_staging_size",
        deserialize_with = "deserialize_hex_u32"
    )]
    pub staging_size: u32,
}

fn default_client_pool_size() -> usize {
    8
}

fn default_self_staging_base() -> u32 {
    0x0000_0000
}

fn default_staging_size() -> u32 {
    STAGING_REGION_SIZE
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            client_pool_size: default_client_pool_size(),
            staging_base: default_self_staging_base(),
            staging_size: default_staging_size(),
        }
    }
}

// =============================================================================
// Zone Definitions
// =============================================================================

/// One downstream zone ECU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Human-readable zone name (e.g., "front-left")
    pub name: String,

    /// Logical address, also the zone's update target id - can be hex
    /// string "0x0202" or integer
    #[serde(deserialize_with = "deserialize_hex_u16")]
    pub address: u16,

    /// TCP endpoint the zone's diagnostic server listens on
    pub endpoint: String,

    /// Base of the staging region reserved for this zone's containers
    #[serde(deserialize_with = "deserialize_hex_u32")]
    pub staging_base: u32,

    /// Capacity of the staging region
    #[serde(
        default = "default_staging_size",
        deserialize_with = "deserialize_hex_u32"
    )]
    pub staging_size: u32,

    /// Firmware version currently installed on the zone ECU
    #[serde(default = "default_installed_version")]
    pub installed_version: String,
}

fn default_installed_version() -> String {
    "0.0.0".to_string()
}

// =============================================================================
// Hex Parsing Helpers
// =============================================================================

/// Deserialize a hex u16 (supports "0x0202" or 514)
fn deserialize_hex_u16<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HexOrInt {
        Hex(String),
        Int(u16),
    }

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(n),
        HexOrInt::Hex(s) => {
            let s = s.trim().strip_prefix("0x").unwrap_or(&s);
            let s = s.strip_prefix("0X").unwrap_or(s);
            u16::from_str_radix(s, 16).map_err(|e| D::Error::custom(e.to_string()))
        }
    }
}

/// Deserialize a hex u32 (supports "0x00400000" or 4194304)
fn deserialize_hex_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HexOrInt {
        Hex(String),
        Int(u32),
    }

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(n),
        HexOrInt::Hex(s) => {
            let s = s.trim().strip_prefix("0x").unwrap_or(&s);
            let s = s.strip_prefix("0X").unwrap_or(s);
            u32::from_str_radix(s, 16).map_err(|e| D::Error::custom(e.to_string()))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
