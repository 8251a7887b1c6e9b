// Platform collaborators
//
// The manager never talks to a BLE stack or an OS permission system
// directly. Platform code (btleplug on desktop, Kotlin/Swift bindings on
// mobile) implements these two traits:
// - PermissionGate: capability checks and authorization requests
// - RadioDriver: scan, connect, discover, read/write/notify, close
//
// All driver results arrive asynchronously and may be produced on any
// thread, so both traits are Send + Sync and the streams they hand out are
// 'static.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use uuid::Uuid;

use crate::error::LinkError;
use crate::types::{
    Advertisement, CharacteristicDescriptor, PeripheralIdentity, ScanFilter, ServiceDescriptor,
    WriteKind,
};

// ============================================================================
// PERMISSIONS
// ============================================================================

/// Radio capabilities gated by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Scan,
    Connect,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Scan => write!(f, "scan"),
            Capability::Connect => write!(f, "connect"),
        }
    }
}

#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Whether `capability` is currently authorized
    fn is_authorized(&self, capability: Capability) -> bool;

    /// Ask the platform (and possibly the user) for `capability`.
    /// Resolves to true when granted.
    async fn request_authorization(&self, capability: Capability) -> bool;
}

// ============================================================================
// RADIO DRIVER
// ============================================================================

/// Driver-assigned handle for an open link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub u64);

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Unsolicited events on an open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Characteristic value changed (notification or indication)
    Notification { characteristic: Uuid, value: Vec<u8> },
    /// The link dropped without being asked to
    Disconnected,
}

pub type AdvertisementStream = BoxStream<'static, Advertisement>;
pub type LinkEventStream = BoxStream<'static, LinkEvent>;

/// Platform BLE stack, central role
///
/// The driver may pre-filter scan results with the given filter but is not
/// required to; the scanner re-checks every advertisement. Link events
/// end (the stream returns `None`) once the link is closed.
#[async_trait]
pub trait RadioDriver: Send + Sync {
    async fn start_scan(&self, filter: &ScanFilter) -> Result<AdvertisementStream, LinkError>;

    async fn stop_scan(&self) -> Result<(), LinkError>;

    /// Open a link. Fails with `ConnectFailed` when the stack or the peer refuses.
    async fn connect(
        &self,
        peripheral: &PeripheralIdentity,
    ) -> Result<(LinkHandle, LinkEventStream), LinkError>;

    async fn discover_services(&self, link: LinkHandle) -> Result<Vec<ServiceDescriptor>, LinkError>;

    async fn read(
        &self,
        link: LinkHandle,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<Vec<u8>, LinkError>;

    async fn write(
        &self,
        link: LinkHandle,
        characteristic: &CharacteristicDescriptor,
        payload: &[u8],
        kind: WriteKind,
    ) -> Result<(), LinkError>;

    async fn set_notify(
        &self,
        link: LinkHandle,
        characteristic: &CharacteristicDescriptor,
        enabled: bool,
    ) -> Result<(), LinkError>;

    /// Release the link and any native handle behind it
    async fn close(&self, link: LinkHandle) -> Result<(), LinkError>;
}

// ============================================================================
// MOCK RADIO (for testing)
// ============================================================================
