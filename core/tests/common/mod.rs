//! Shared fixtures for the integration tests: a scripted radio and a
//! mockall permission gate.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use gattlink_core::{
    Advertisement, AdvertisementStream, Capability, CharacteristicDescriptor,
    CharacteristicProperties, ConnectionManager, LinkConfig, LinkError, LinkEvent,
    LinkEventStream, LinkHandle, PeripheralAddress, PeripheralIdentity, PermissionGate,
    RadioDriver, ScanFilter, ServiceDescriptor, StateTransition, WriteKind, BATTERY_LEVEL_UUID,
    BATTERY_SERVICE_UUID, CCCD_UUID,
};
use mockall::mock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

mock! {
    pub Gate {}

    #[async_trait]
    impl PermissionGate for Gate {
        fn is_authorized(&self, capability: Capability) -> bool;
        async fn request_authorization(&self, capability: Capability) -> bool;
    }
}

/// Gate with every capability already granted
pub fn allow_all() -> Arc<MockGate> {
    let mut gate = MockGate::new();
    gate.expect_is_authorized().returning(|_| true);
    gate.expect_request_authorization().never();
    Arc::new(gate)
}

/// Scripted central radio. Everything is configured up front through the
/// public fields; the link event sender is exposed once connected.
#[derive(Default)]
pub struct ScriptedRadio {
    pub advertisements: Mutex<Vec<Advertisement>>,
    pub connect_error: Mutex<Option<LinkError>>,
    pub connect_delay: Mutex<Option<Duration>>,
    pub services: Mutex<Vec<ServiceDescriptor>>,
    pub notify_error: Mutex<Option<LinkError>>,
    /// Returned by every read once set, after the read's latency
    pub read_error: Mutex<Option<LinkError>>,
    pub values: Mutex<HashMap<Uuid, Vec<u8>>>,
    /// Per-characteristic latency of read/write/notify
    pub delays: Mutex<HashMap<Uuid, Duration>>,
    pub calls: Mutex<Vec<String>>,
    /// Operations in the order the radio finished them
    pub completed: Mutex<Vec<String>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    next_link: AtomicU64,
    events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
}

impl ScriptedRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// An ESP32 advertising the Battery Service with a readable, notifying
    /// Battery Level of 77%
    pub fn esp32() -> Arc<Self> {
        let radio = Self::new();
        *radio.advertisements.lock() = vec![
            advertisement("11:22:33:44:55:66", Some("Thermostat"), vec![]),
            advertisement("24:0A:C4:00:00:01", Some("ESP32"), vec![BATTERY_SERVICE_UUID]),
        ];
        *radio.services.lock() = vec![battery_service(CharacteristicProperties {
            read: true,
            notify: true,
            ..Default::default()
        })];
        radio.values.lock().insert(BATTERY_LEVEL_UUID, vec![77]);
        radio
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Simulate the peer dropping the link
    pub fn drop_link(&self) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(LinkEvent::Disconnected);
        }
    }

    /// Simulate a notification arriving on the open link
    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(LinkEvent::Notification {
                characteristic,
                value,
            });
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    async fn operation(&self, label: String, uuid: &Uuid) {
        self.record(label.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.lock().get(uuid).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.lock().push(label);
    }
}

#[async_trait]
impl RadioDriver for ScriptedRadio {
    async fn start_scan(&self, _filter: &ScanFilter) -> Result<AdvertisementStream, LinkError> {
        self.record("start_scan".to_string());
        let advertisements = self.advertisements.lock().clone();
        Ok(futures::stream::iter(advertisements)
            .chain(futures::stream::pending())
            .boxed())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.record("stop_scan".to_string());
        Ok(())
    }

    async fn connect(
        &self,
        peripheral: &PeripheralIdentity,
    ) -> Result<(LinkHandle, LinkEventStream), LinkError> {
        self.record(format!("connect {}", peripheral.address()));

        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.connect_error.lock().clone() {
            return Err(error);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        let link = LinkHandle(self.next_link.fetch_add(1, Ordering::SeqCst) + 1);
        let events = futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed();
        Ok((link, events))
    }

    async fn discover_services(&self, _link: LinkHandle) -> Result<Vec<ServiceDescriptor>, LinkError> {
        self.record("discover_services".to_string());
        Ok(self.services.lock().clone())
    }

    async fn read(
        &self,
        _link: LinkHandle,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<Vec<u8>, LinkError> {
        self.operation(format!("read {}", characteristic.uuid), &characteristic.uuid)
            .await;
        if let Some(error) = self.read_error.lock().clone() {
            return Err(error);
        }
        self.values
            .lock()
            .get(&characteristic.uuid)
            .cloned()
            .ok_or_else(|| LinkError::Rejected("read not permitted".to_string()))
    }

    async fn write(
        &self,
        _link: LinkHandle,
        characteristic: &CharacteristicDescriptor,
        payload: &[u8],
        _kind: WriteKind,
    ) -> Result<(), LinkError> {
        self.operation(
            format!("write {} {}", characteristic.uuid, to_hex(payload)),
            &characteristic.uuid,
        )
        .await;
        self.values
            .lock()
            .insert(characteristic.uuid, payload.to_vec());
        Ok(())
    }

    async fn set_notify(
        &self,
        _link: LinkHandle,
        characteristic: &CharacteristicDescriptor,
        enabled: bool,
    ) -> Result<(), LinkError> {
        self.operation(
            format!("set_notify {} {}", characteristic.uuid, enabled),
            &characteristic.uuid,
        )
        .await;
        match self.notify_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn close(&self, link: LinkHandle) -> Result<(), LinkError> {
        self.record(format!("close {}", link));
        self.events.lock().take();
        Ok(())
    }
}

fn to_hex(payload: &[u8]) -> String {
    payload.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn advertisement(address: &str, name: Option<&str>, services: Vec<Uuid>) -> Advertisement {
    Advertisement {
        peripheral: PeripheralIdentity::new(PeripheralAddress::new(address), name.map(str::to_string)),
        services,
        rssi: Some(-60),
    }
}

pub fn battery_service(properties: CharacteristicProperties) -> ServiceDescriptor {
    ServiceDescriptor {
        uuid: BATTERY_SERVICE_UUID,
        characteristics: vec![CharacteristicDescriptor {
            uuid: BATTERY_LEVEL_UUID,
            properties,
            config_descriptor: properties.supports_subscribe().then_some(CCCD_UUID),
        }],
    }
}

/// Default ESP32 battery config with short bounds
pub fn test_config() -> LinkConfig {
    LinkConfig::default()
        .with_scan_timeout(Duration::from_millis(200))
        .with_operation_timeout(Duration::from_millis(300))
}

pub fn manager(radio: Arc<ScriptedRadio>, gate: Arc<MockGate>) -> ConnectionManager {
    ConnectionManager::new(test_config(), radio, gate).expect("valid config")
}

/// Everything currently buffered on a state subscription
pub fn drain(transitions: &mut mpsc::UnboundedReceiver<StateTransition>) -> Vec<StateTransition> {
    std::iter::from_fn(|| transitions.try_recv().ok()).collect()
}

/// Wait for the next transition, failing the test after a second
pub async fn next_transition(
    transitions: &mut mpsc::UnboundedReceiver<StateTransition>,
) -> StateTransition {
    tokio::time::timeout(Duration::from_secs(1), transitions.recv())
        .await
        .expect("transition within a second")
        .expect("state stream open")
}
