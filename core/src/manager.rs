//! Connection manager: owns one peripheral link from scan to Ready.
//!
//! All mutable lifecycle data (current state, open link, discovered
//! services, operation queue) lives in one `LinkState` behind one mutex.
//! Every state change goes through [`next_state`] while that lock is held,
//! and is broadcast to watchers before the lock is released, so watchers
//! see transitions in the order they happened.
//!
//! A `start()` attempt is identified by an attempt counter. `stop()`, a link
//! drop or a failure bumps the counter and fires the attempt's cancel
//! channel, so a `start()` suspended at any await point returns promptly
//! and never resurrects a torn-down link.

use futures::StreamExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::gatt_queue::{GattOperation, GattOperationQueue, GattOutput, LinkFault};
use crate::platform::{Capability, LinkEvent, LinkEventStream, LinkHandle, PermissionGate, RadioDriver};
use crate::router::{NotificationRouter, NotificationStream, SubscriptionId};
use crate::scanner::Scanner;
use crate::state::{next_state, ConnectionState, StateTransition, Trigger};
use crate::types::{
    CharacteristicDescriptor, CharacteristicProperties, CharacteristicValue, PeripheralIdentity,
    ServiceDescriptor, WriteKind,
};

/// Whether notifications came up along with the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Full,
    /// Reads and writes work; notifications do not (`NotifyUnavailable`)
    Degraded(LinkError),
}

/// Result of a successful `start()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub peripheral: PeripheralIdentity,
    pub readiness: Readiness,
}

// ============================================================================
// SHARED LINK STATE
// ============================================================================

struct LinkState {
    state: ConnectionState,
    degraded: bool,
    attempt: u64,
    cancel: Option<oneshot::Sender<LinkError>>,
    peripheral: Option<PeripheralIdentity>,
    link: Option<LinkHandle>,
    services: Option<Arc<Vec<ServiceDescriptor>>>,
    queue: Option<Arc<GattOperationQueue>>,
    pump: Option<JoinHandle<()>>,
    watchers: Vec<mpsc::UnboundedSender<StateTransition>>,
}

impl LinkState {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            degraded: false,
            attempt: 0,
            cancel: None,
            peripheral: None,
            link: None,
            services: None,
            queue: None,
            pump: None,
            watchers: Vec::new(),
        }
    }

    fn apply(&mut self, trigger: Trigger) -> bool {
        let Some(to) = next_state(self.state, trigger) else {
            warn!("Refusing {:?} in state {}", trigger, self.state);
            return false;
        };

        if to != self.state {
            let change = StateTransition {
                from: self.state,
                to,
            };
            info!("Connection state {}", change);
            self.state = to;
            self.watchers.retain(|watcher| watcher.send(change).is_ok());
        }
        true
    }

    /// Detach everything owned by the current attempt and invalidate it
    fn take_resources(&mut self) -> Teardown {
        self.attempt += 1;
        self.degraded = false;
        self.peripheral = None;
        self.services = None;
        Teardown {
            stop_scan: self.state == ConnectionState::Scanning,
            cancel: self.cancel.take(),
            queue: self.queue.take(),
            link: self.link.take(),
            pump: self.pump.take(),
        }
    }
}

/// Resources released on the way into Disconnected
struct Teardown {
    stop_scan: bool,
    cancel: Option<oneshot::Sender<LinkError>>,
    queue: Option<Arc<GattOperationQueue>>,
    link: Option<LinkHandle>,
    pump: Option<JoinHandle<()>>,
}

impl Teardown {
    async fn run(self, radio: &dyn RadioDriver, cause: LinkError, queue_reason: LinkError) {
        if let Some(cancel) = self.cancel {
            let _ = cancel.send(cause);
        }
        if let Some(pump) = self.pump {
            pump.abort();
        }
        if let Some(queue) = self.queue {
            queue.close(queue_reason);
        }
        if self.stop_scan {
            if let Err(e) = radio.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        }
        if let Some(link) = self.link {
            if let Err(e) = radio.close(link).await {
                warn!("Failed to close {}: {}", link, e);
            }
        }
    }
}

// ============================================================================
// MANAGER
// ============================================================================

struct Inner {
    config: LinkConfig,
    radio: Arc<dyn RadioDriver>,
    permissions: Arc<dyn PermissionGate>,
    scanner: Scanner,
    router: NotificationRouter,
    link: Mutex<LinkState>,
}

/// Handle to one managed peripheral connection. Clones share the same link.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        config: LinkConfig,
        radio: Arc<dyn RadioDriver>,
        permissions: Arc<dyn PermissionGate>,
    ) -> Result<Self, LinkError> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                scanner: Scanner::new(Arc::clone(&radio)),
                config,
                radio,
                permissions,
                router: NotificationRouter::new(),
                link: Mutex::new(LinkState::new()),
            }),
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.lock().state
    }

    /// Ready without notifications
    pub fn is_degraded(&self) -> bool {
        self.inner.link.lock().degraded
    }

    pub fn peripheral(&self) -> Option<PeripheralIdentity> {
        self.inner.link.lock().peripheral.clone()
    }

    /// Service set from the last discovery on the current link
    pub fn services(&self) -> Option<Arc<Vec<ServiceDescriptor>>> {
        self.inner.link.lock().services.clone()
    }

    /// Queued operations waiting behind the in-flight one
    pub fn pending_operations(&self) -> usize {
        self.inner
            .link
            .lock()
            .queue
            .as_ref()
            .map_or(0, |queue| queue.len())
    }

    /// Receive every state change from now on, in order
    pub fn subscribe_state(&self) -> mpsc::UnboundedReceiver<StateTransition> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.link.lock().watchers.push(tx);
        rx
    }

    /// Receive value updates for `characteristic`
    pub fn subscribe_notifications(&self, characteristic: Uuid) -> NotificationStream {
        self.inner.router.subscribe(characteristic)
    }

    pub fn unsubscribe_notifications(&self, id: SubscriptionId) {
        self.inner.router.unsubscribe(id);
    }

    pub fn router(&self) -> &NotificationRouter {
        &self.inner.router
    }

    /// Scan, connect, discover and subscribe.
    ///
    /// Resolves once the link is Ready (possibly degraded), or with the error
    /// that sent the manager back to Disconnected.
    pub async fn start(&self) -> Result<StartOutcome, LinkError> {
        let epoch = {
            let state = self.inner.link.lock();
            if state.state != ConnectionState::Disconnected {
                return Err(LinkError::AlreadyActive(state.state));
            }
            state.attempt
        };

        for capability in [Capability::Scan, Capability::Connect] {
            if !self.inner.authorize(capability).await {
                let mut state = self.inner.link.lock();
                if state.state == ConnectionState::Disconnected {
                    state.apply(Trigger::StartDenied);
                }
                warn!("{} permission denied", capability);
                return Err(LinkError::PermissionDenied(capability));
            }
        }

        let (attempt, mut cancelled) = {
            let mut state = self.inner.link.lock();
            if state.state != ConnectionState::Disconnected {
                return Err(LinkError::AlreadyActive(state.state));
            }
            if state.attempt != epoch {
                return Err(LinkError::Cancelled);
            }
            let (tx, rx) = oneshot::channel();
            state.cancel = Some(tx);
            state.apply(Trigger::StartAuthorized);
            (state.attempt, rx)
        };

        self.inner.run_attempt(attempt, &mut cancelled).await
    }

    /// Cancel whatever is in progress and release the link. Safe from any
    /// state and idempotent.
    pub async fn stop(&self) {
        let teardown = {
            let mut state = self.inner.link.lock();
            let teardown = state.take_resources();
            state.apply(Trigger::Stopped);
            teardown
        };

        teardown
            .run(self.inner.radio.as_ref(), LinkError::Cancelled, LinkError::Cancelled)
            .await;
    }

    /// Stop and drop every state watcher and notification listener.
    pub async fn dispose(self) {
        self.stop().await;
        self.inner.link.lock().watchers.clear();
        self.inner.router.clear();
    }

    pub async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, LinkError> {
        let completion = self.inner.issue(characteristic, "read", |properties| {
            properties.read.then(|| |descriptor: CharacteristicDescriptor| GattOperation::Read {
                characteristic: descriptor,
            })
        })?;

        match completion.await? {
            GattOutput::Value(value) => Ok(value),
            GattOutput::Done => Ok(Vec::new()),
        }
    }

    /// Write `payload`, acknowledged when the characteristic supports it
    pub async fn write(&self, characteristic: Uuid, payload: Vec<u8>) -> Result<(), LinkError> {
        let completion = self.inner.issue(characteristic, "write", |properties| {
            let kind = if properties.write {
                WriteKind::WithResponse
            } else if properties.write_without_response {
                WriteKind::WithoutResponse
            } else {
                return None;
            };
            Some(move |descriptor: CharacteristicDescriptor| GattOperation::Write {
                characteristic: descriptor,
                payload,
                kind,
            })
        })?;

        completion.await.map(|_| ())
    }

    /// Toggle notifications on another characteristic of the Ready link
    pub async fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<(), LinkError> {
        let completion = self.inner.issue(characteristic, "notify", |properties| {
            properties
                .supports_subscribe()
                .then(|| move |descriptor: CharacteristicDescriptor| GattOperation::SetNotify {
                    characteristic: descriptor,
                    enabled,
                })
        })?;

        completion.await.map(|_| ())
    }
}

impl Inner {
    async fn authorize(&self, capability: Capability) -> bool {
        if self.permissions.is_authorized(capability) {
            return true;
        }
        info!("Requesting {} permission", capability);
        self.permissions.request_authorization(capability).await
    }

    /// Move to the next state if `attempt` is still the live one
    fn advance(&self, attempt: u64, trigger: Trigger, update: impl FnOnce(&mut LinkState)) -> bool {
        let mut state = self.link.lock();
        if state.attempt != attempt {
            return false;
        }
        update(&mut state);
        state.apply(trigger)
    }

    /// End a live attempt with `error`, releasing what it acquired
    async fn fail(&self, attempt: u64, trigger: Trigger, error: LinkError) -> LinkError {
        let teardown = {
            let mut state = self.link.lock();
            if state.attempt != attempt {
                return error;
            }
            let mut teardown = state.take_resources();
            // The scanner stops the radio scan itself on every exit
            teardown.stop_scan = false;
            teardown.cancel = None;
            state.apply(trigger);
            teardown
        };

        warn!("Connection attempt failed: {}", error);
        teardown
            .run(self.radio.as_ref(), error.clone(), LinkError::LinkLost)
            .await;
        error
    }

    async fn run_attempt(
        self: &Arc<Self>,
        attempt: u64,
        cancelled: &mut oneshot::Receiver<LinkError>,
    ) -> Result<StartOutcome, LinkError> {
        let config = &self.config;

        // Scanning
        let peripheral = match step(
            cancelled,
            self.scanner.find(config.target.clone(), config.scan_timeout()),
        )
        .await?
        {
            Ok(peripheral) => peripheral,
            Err(e) => return Err(self.fail(attempt, Trigger::ScanEnded, e).await),
        };

        let matched = peripheral.clone();
        if !self.advance(attempt, Trigger::ScanMatched, |state| {
            state.peripheral = Some(matched)
        }) {
            return Err(superseded(cancelled));
        }

        // Connecting
        let (link, events) = match step(cancelled, self.radio.connect(&peripheral)).await? {
            Ok(opened) => opened,
            Err(e) => {
                let error = match e {
                    LinkError::ConnectFailed(_) | LinkError::PermissionDenied(_) => e,
                    other => LinkError::ConnectFailed(other.to_string()),
                };
                return Err(self.fail(attempt, Trigger::LinkFailed, error).await);
            }
        };
        info!("Connected to {} on {}", peripheral, link);

        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(GattOperationQueue::new(
            Arc::clone(&self.radio),
            link,
            config.operation_timeout(),
            fault_tx,
        ));

        let weak = Arc::downgrade(self);
        let registered = self.advance(attempt, Trigger::LinkOpened, |state| {
            state.link = Some(link);
            state.queue = Some(Arc::clone(&queue));
            state.pump = Some(spawn_pump(weak, link, events, fault_rx));
        });
        if !registered {
            if let Err(e) = self.radio.close(link).await {
                warn!("Failed to close abandoned {}: {}", link, e);
            }
            return Err(superseded(cancelled));
        }

        // DiscoveringServices
        let services = match step(cancelled, self.radio.discover_services(link)).await? {
            Ok(services) => services,
            Err(e) => return Err(self.fail(attempt, Trigger::DiscoveryFailed, e).await),
        };
        debug!("Discovered {} services on {}", services.len(), link);

        let Some(service) = services.iter().find(|s| s.uuid == config.service_uuid) else {
            let error = LinkError::ServiceNotFound(config.service_uuid);
            return Err(self.fail(attempt, Trigger::ServicesMissing, error).await);
        };
        let Some(characteristic) = service.characteristic(&config.characteristic_uuid).cloned() else {
            let error = LinkError::CharacteristicNotFound(config.characteristic_uuid);
            return Err(self.fail(attempt, Trigger::ServicesMissing, error).await);
        };

        let services = Arc::new(services);
        if !self.advance(attempt, Trigger::ServicesResolved, |state| {
            state.services = Some(services)
        }) {
            return Err(superseded(cancelled));
        }

        // Subscribing
        let readiness = if characteristic.properties.supports_subscribe() {
            let uuid = characteristic.uuid;
            let enable = queue.enqueue(GattOperation::SetNotify {
                characteristic,
                enabled: true,
            });
            match step(cancelled, enable).await? {
                Ok(_) => Readiness::Full,
                Err(e) if e.is_link_fatal() => {
                    return Err(self.fail(attempt, Trigger::LinkDropped, e).await)
                }
                Err(e) => Readiness::Degraded(LinkError::NotifyUnavailable(format!(
                    "enabling notifications on {}: {}",
                    uuid, e
                ))),
            }
        } else {
            Readiness::Degraded(LinkError::NotifyUnavailable(format!(
                "{} does not support notifications",
                characteristic.uuid
            )))
        };

        let (trigger, degraded) = match &readiness {
            Readiness::Full => (Trigger::NotifyEnabled, false),
            Readiness::Degraded(warning) => {
                warn!("Continuing without notifications: {}", warning);
                (Trigger::NotifyFailed, true)
            }
        };
        if !self.advance(attempt, trigger, |state| {
            state.degraded = degraded;
            state.cancel = None;
        }) {
            return Err(superseded(cancelled));
        }

        info!("Link to {} ready", peripheral);
        Ok(StartOutcome {
            peripheral,
            readiness,
        })
    }

    /// Validate and enqueue a caller operation atomically with the Ready check
    fn issue<B, F>(
        &self,
        characteristic: Uuid,
        operation: &'static str,
        build: B,
    ) -> Result<crate::gatt_queue::Completion, LinkError>
    where
        B: FnOnce(&CharacteristicProperties) -> Option<F>,
        F: FnOnce(CharacteristicDescriptor) -> GattOperation,
    {
        let mut state = self.link.lock();
        if state.state != ConnectionState::Ready {
            return Err(LinkError::NotReady(state.state));
        }

        let descriptor = state
            .services
            .as_ref()
            .and_then(|services| crate::types::find_characteristic(services, &characteristic))
            .cloned()
            .ok_or(LinkError::CharacteristicNotFound(characteristic))?;

        let make = build(&descriptor.properties).ok_or(LinkError::Unsupported {
            characteristic,
            operation,
        })?;

        let queue = state.queue.clone().ok_or(LinkError::LinkLost)?;
        state.apply(Trigger::OperationIssued);
        Ok(queue.enqueue(make(descriptor)))
    }

    /// Tear down after an unsolicited drop or a queue fault
    async fn handle_link_lost(&self, link: LinkHandle, cause: LinkError) {
        let teardown = {
            let mut state = self.link.lock();
            if state.link != Some(link) {
                debug!("Ignoring stale loss of {}", link);
                return;
            }
            let mut teardown = state.take_resources();
            // Running on the pump task; let it finish on its own
            teardown.pump = None;
            state.apply(Trigger::LinkDropped);
            teardown
        };

        warn!("Link {} lost: {}", link, cause);
        teardown
            .run(self.radio.as_ref(), cause, LinkError::LinkLost)
            .await;
    }
}

/// Await `work` unless the attempt is cancelled first
async fn step<T>(
    cancelled: &mut oneshot::Receiver<LinkError>,
    work: impl Future<Output = T>,
) -> Result<T, LinkError> {
    tokio::select! {
        biased;
        reason = cancelled => Err(reason.unwrap_or(LinkError::Cancelled)),
        value = work => Ok(value),
    }
}

fn superseded(cancelled: &mut oneshot::Receiver<LinkError>) -> LinkError {
    cancelled.try_recv().unwrap_or(LinkError::Cancelled)
}

/// Forward link events: notifications to the router, drops and faults to teardown
fn spawn_pump(
    inner: Weak<Inner>,
    link: LinkHandle,
    mut events: LinkEventStream,
    mut faults: mpsc::UnboundedReceiver<LinkFault>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cause = loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(LinkEvent::Notification { characteristic, value }) => {
                        let Some(inner) = inner.upgrade() else {
                            return;
                        };
                        inner.router.dispatch(CharacteristicValue {
                            characteristic,
                            value,
                        });
                    }
                    Some(LinkEvent::Disconnected) | None => break LinkError::LinkLost,
                },
                Some(fault) = faults.recv() => match fault {
                    LinkFault::OperationTimeout { .. } => break LinkError::OperationTimeout,
                    LinkFault::LinkLost { .. } => break LinkError::LinkLost,
                },
            }
        };

        if let Some(inner) = inner.upgrade() {
            inner.handle_link_lost(link, cause).await;
        }
    })
}
