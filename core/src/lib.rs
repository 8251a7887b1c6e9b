// Gattlink Core: BLE central connection manager
//
// Drives one peripheral from discovery to a usable GATT link:
// scan -> connect -> discover -> subscribe -> Ready.
//
// The BLE stack and the OS permission system stay behind two traits in
// `platform`; everything above them (state machine, operation queue,
// notification fan-out) is platform independent and runs on tokio.

pub mod config;
pub mod error;
pub mod gatt_queue;
pub mod manager;
pub mod platform;
pub mod profile;
pub mod router;
pub mod scanner;
pub mod state;
pub mod types;

pub use config::LinkConfig;
pub use error::LinkError;
pub use gatt_queue::{Completion, GattOperation, GattOperationQueue, GattOutput, LinkFault};
pub use manager::{ConnectionManager, Readiness, StartOutcome};
pub use platform::{
    AdvertisementStream, Capability, LinkEvent, LinkEventStream, LinkHandle, PermissionGate,
    RadioDriver,
};
pub use profile::{BatteryLevel, BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID, CCCD_UUID};
pub use router::{NotificationRouter, NotificationStream, SubscriptionId};
pub use scanner::Scanner;
pub use state::{ConnectionState, StateTransition};
pub use types::{
    find_characteristic, Advertisement, CharacteristicDescriptor, CharacteristicProperties,
    CharacteristicValue, PeripheralAddress, PeripheralIdentity, ScanFilter, ServiceDescriptor,
    WriteKind,
};

/// Crate version, reported by the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
