/// Peripheral and GATT data model
///
/// Everything in here is plain data handed between the radio driver, the
/// scanner and the connection manager. Identities and descriptors are
/// immutable once built; re-discovery replaces the whole service set.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// PERIPHERAL IDENTITY
// ============================================================================

/// Opaque platform address of a peripheral (MAC on Linux/Windows, a UUID on macOS)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralAddress(String);

impl PeripheralAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peripheral seen in an advertisement
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralIdentity {
    address: PeripheralAddress,
    name: Option<String>,
}

impl PeripheralIdentity {
    pub fn new(address: PeripheralAddress, name: Option<String>) -> Self {
        Self { address, name }
    }

    pub fn address(&self) -> &PeripheralAddress {
        &self.address
    }

    /// Advertised local name, if the peripheral sent one
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// One item of the radio's scan result stream
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub peripheral: PeripheralIdentity,
    /// Service UUIDs listed in the advertisement or scan response
    pub services: Vec<Uuid>,
    /// Received signal strength in dBm
    pub rssi: Option<i16>,
}

/// Scan filter: exactly one criterion is active per scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ScanFilter {
    /// Advertised local name equals this value (exact match)
    Name(String),
    /// Advertisement lists this service UUID
    Service(Uuid),
}

impl ScanFilter {
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        match self {
            ScanFilter::Name(name) => advertisement.peripheral.name() == Some(name.as_str()),
            ScanFilter::Service(uuid) => advertisement.services.contains(uuid),
        }
    }
}

impl fmt::Display for ScanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanFilter::Name(name) => write!(f, "name == {:?}", name),
            ScanFilter::Service(uuid) => write!(f, "service {}", uuid),
        }
    }
}

// ============================================================================
// GATT DESCRIPTORS
// ============================================================================

/// Operations a characteristic supports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn supports_subscribe(&self) -> bool {
        self.notify || self.indicate
    }

    pub fn supports_write(&self) -> bool {
        self.write || self.write_without_response
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    /// Client configuration descriptor used to enable notifications
    pub config_descriptor: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| &c.uuid == uuid)
    }
}

/// Search a discovered service set for a characteristic by UUID
pub fn find_characteristic<'a>(
    services: &'a [ServiceDescriptor],
    uuid: &Uuid,
) -> Option<&'a CharacteristicDescriptor> {
    services.iter().find_map(|s| s.characteristic(uuid))
}

/// How a write is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// An unsolicited value pushed by the peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicValue {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}
