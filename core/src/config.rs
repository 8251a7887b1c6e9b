//! Link configuration
//!
//! Which peripheral to look for, which service/characteristic must be
//! present after discovery, and the per-scan and per-operation bounds.
//! Defaults target the Battery Service on a peripheral named "ESP32".

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::LinkError;
use crate::profile::{BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID};
use crate::types::ScanFilter;

/// Default scan window in milliseconds
pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 10_000;

/// Default bound for a single GATT operation in milliseconds
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Peripheral to scan for
    pub target: ScanFilter,
    /// Service that must be present after discovery
    pub service_uuid: Uuid,
    /// Characteristic that must be present; notifications are enabled on it
    /// when it supports them
    pub characteristic_uuid: Uuid,
    /// Scan window in milliseconds
    pub scan_timeout_ms: u64,
    /// Per-operation completion bound in milliseconds
    pub operation_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            target: ScanFilter::Name("ESP32".to_string()),
            service_uuid: BATTERY_SERVICE_UUID,
            characteristic_uuid: BATTERY_LEVEL_UUID,
            scan_timeout_ms: DEFAULT_SCAN_TIMEOUT_MS,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
        }
    }
}

impl LinkConfig {
    pub fn new(target: ScanFilter, service_uuid: Uuid, characteristic_uuid: Uuid) -> Self {
        Self {
            target,
            service_uuid,
            characteristic_uuid,
            ..Self::default()
        }
    }

    pub fn with_target(mut self, target: ScanFilter) -> Self {
        self.target = target;
        self
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.scan_timeout_ms == 0 {
            return Err(LinkError::InvalidConfig(
                "Scan timeout must be > 0".to_string(),
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(LinkError::InvalidConfig(
                "Operation timeout must be > 0".to_string(),
            ));
        }
        if self.service_uuid.is_nil() || self.characteristic_uuid.is_nil() {
            return Err(LinkError::InvalidConfig(
                "Service and characteristic UUIDs must be set".to_string(),
            ));
        }
        if let ScanFilter::Name(name) = &self.target {
            if name.is_empty() {
                return Err(LinkError::InvalidConfig(
                    "Target name cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}
