//! Serialized GATT operation queue
//!
//! A BLE link tolerates one outstanding ATT request. Every read, write and
//! notification toggle on the active link goes through this queue, which
//! executes them strictly one at a time in submission order on a worker
//! task. Each submission gets a [`Completion`] future.
//!
//! An operation that does not complete within the configured bound fails
//! with `OperationTimeout`. Either that or a `LinkLost` reported by the radio
//! closes the queue (remaining operations fail with `LinkLost`) and reports a
//! [`LinkFault`] so the owner can recycle the link.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::LinkError;
use crate::platform::{LinkHandle, RadioDriver};
use crate::types::{CharacteristicDescriptor, WriteKind};

// ============================================================================
// OPERATIONS
// ============================================================================

#[derive(Debug, Clone)]
pub enum GattOperation {
    Read {
        characteristic: CharacteristicDescriptor,
    },
    Write {
        characteristic: CharacteristicDescriptor,
        payload: Vec<u8>,
        kind: WriteKind,
    },
    SetNotify {
        characteristic: CharacteristicDescriptor,
        enabled: bool,
    },
}

impl GattOperation {
    pub fn characteristic(&self) -> &CharacteristicDescriptor {
        match self {
            GattOperation::Read { characteristic }
            | GattOperation::Write { characteristic, .. }
            | GattOperation::SetNotify { characteristic, .. } => characteristic,
        }
    }
}

impl fmt::Display for GattOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GattOperation::Read { characteristic } => write!(f, "Read({})", characteristic.uuid),
            GattOperation::Write {
                characteristic,
                payload,
                ..
            } => write!(f, "Write({}, {} bytes)", characteristic.uuid, payload.len()),
            GattOperation::SetNotify {
                characteristic,
                enabled,
            } => write!(f, "SetNotify({}, {})", characteristic.uuid, enabled),
        }
    }
}

/// Successful result of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOutput {
    /// Value returned by a read
    Value(Vec<u8>),
    /// Write or notification toggle acknowledged
    Done,
}

/// Raised by the queue when the link should be recycled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFault {
    OperationTimeout { link: LinkHandle },
    /// The radio reported the link gone while executing an operation
    LinkLost { link: LinkHandle },
}

// ============================================================================
// COMPLETION FUTURE
// ============================================================================

/// Resolves when the queued operation finishes or the queue is torn down
pub struct Completion {
    rx: oneshot::Receiver<Result<GattOutput, LinkError>>,
}

impl Future for Completion {
    type Output = Result<GattOutput, LinkError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the worker went away with the link
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(LinkError::LinkLost)))
    }
}

// ============================================================================
// QUEUE
// ============================================================================

struct QueuedOperation {
    id: u64,
    operation: GattOperation,
    reply: oneshot::Sender<Result<GattOutput, LinkError>>,
}

impl QueuedOperation {
    fn complete(self, result: Result<GattOutput, LinkError>) {
        // Caller may have stopped waiting; nothing to do then
        let _ = self.reply.send(result);
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedOperation>,
    executing: Option<u64>,
    next_id: u64,
    /// Set once the queue is closed; later submissions fail with this
    closed: Option<LinkError>,
}

struct Shared {
    state: Mutex<QueueState>,
    /// Wakes the worker when work arrives or the queue closes
    wake: Notify,
    /// Interrupts the in-flight operation on close
    abort: Notify,
}

pub struct GattOperationQueue {
    shared: Arc<Shared>,
    link: LinkHandle,
    worker: JoinHandle<()>,
}

impl GattOperationQueue {
    /// Create a queue bound to `link` and spawn its worker on the current runtime.
    pub fn new(
        radio: Arc<dyn RadioDriver>,
        link: LinkHandle,
        operation_timeout: Duration,
        faults: mpsc::UnboundedSender<LinkFault>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            abort: Notify::new(),
        });

        let worker = tokio::spawn(run_worker(
            Arc::clone(&shared),
            radio,
            link,
            operation_timeout,
            faults,
        ));

        Self {
            shared,
            link,
            worker,
        }
    }

    pub fn link(&self) -> LinkHandle {
        self.link
    }

    /// Submit an operation. It runs after everything submitted before it.
    pub fn enqueue(&self, operation: GattOperation) -> Completion {
        let (reply, rx) = oneshot::channel();
        let mut state = self.shared.state.lock();

        if let Some(reason) = state.closed.clone() {
            drop(state);
            let _ = reply.send(Err(reason));
            return Completion { rx };
        }

        let id = state.next_id;
        state.next_id += 1;
        debug!("Queued #{} {} on {}", id, operation, self.link);
        state.pending.push_back(QueuedOperation {
            id,
            operation,
            reply,
        });
        drop(state);

        self.shared.wake.notify_one();
        Completion { rx }
    }

    /// Operations waiting behind the in-flight one
    pub fn len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an operation is currently executing on the link
    pub fn is_busy(&self) -> bool {
        self.shared.state.lock().executing.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed.is_some()
    }

    /// Fail every queued and in-flight operation with `reason` and refuse new
    /// ones. Idempotent: the first reason wins.
    pub fn close(&self, reason: LinkError) {
        let drained: Vec<QueuedOperation> = {
            let mut state = self.shared.state.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.clone());
            }
            state.pending.drain(..).collect()
        };

        if !drained.is_empty() {
            debug!("Draining {} queued operations on {}: {}", drained.len(), self.link, reason);
        }
        for queued in drained {
            queued.complete(Err(reason.clone()));
        }

        self.shared.abort.notify_waiters();
        self.shared.wake.notify_one();
    }
}

impl Drop for GattOperationQueue {
    fn drop(&mut self) {
        self.close(LinkError::LinkLost);
        self.worker.abort();
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    radio: Arc<dyn RadioDriver>,
    link: LinkHandle,
    operation_timeout: Duration,
    faults: mpsc::UnboundedSender<LinkFault>,
) {
    loop {
        let next = {
            let mut state = shared.state.lock();
            if state.closed.is_some() {
                break;
            }
            let next = state.pending.pop_front();
            state.executing = next.as_ref().map(|queued| queued.id);
            next
        };

        let Some(queued) = next else {
            shared.wake.notified().await;
            continue;
        };

        // Register for abort before re-checking, so a close in between is not missed
        let aborted = shared.abort.notified();
        tokio::pin!(aborted);
        aborted.as_mut().enable();

        let closed = shared.state.lock().closed.clone();
        if let Some(reason) = closed {
            queued.complete(Err(reason));
            break;
        }

        debug!("Executing #{} {} on {}", queued.id, queued.operation, link);
        let (outcome, closed_under_us) = tokio::select! {
            biased;
            _ = &mut aborted => {
                let reason = shared.state.lock().closed.clone();
                (Err(reason.unwrap_or(LinkError::LinkLost)), true)
            }
            result = tokio::time::timeout(
                operation_timeout,
                execute(radio.as_ref(), link, &queued.operation),
            ) => (result.unwrap_or(Err(LinkError::OperationTimeout)), false),
        };
        shared.state.lock().executing = None;

        let fault = match &outcome {
            _ if closed_under_us => None,
            Err(LinkError::OperationTimeout) => Some(LinkFault::OperationTimeout { link }),
            Err(LinkError::LinkLost) => Some(LinkFault::LinkLost { link }),
            _ => None,
        };

        if let Some(fault) = fault {
            warn!("#{} {} failed on {} ({:?}), recycling link", queued.id, queued.operation, link, fault);
            let drained: Vec<QueuedOperation> = {
                let mut state = shared.state.lock();
                state.closed = Some(LinkError::LinkLost);
                state.pending.drain(..).collect()
            };
            queued.complete(outcome);
            for other in drained {
                other.complete(Err(LinkError::LinkLost));
            }
            let _ = faults.send(fault);
            break;
        }

        queued.complete(outcome);
    }

    debug!("Operation worker for {} stopped", link);
}

async fn execute(
    radio: &dyn RadioDriver,
    link: LinkHandle,
    operation: &GattOperation,
) -> Result<GattOutput, LinkError> {
    match operation {
        GattOperation::Read { characteristic } => radio
            .read(link, characteristic)
            .await
            .map(GattOutput::Value),
        GattOperation::Write {
            characteristic,
            payload,
            kind,
        } => radio
            .write(link, characteristic, payload, *kind)
            .await
            .map(|_| GattOutput::Done),
        GattOperation::SetNotify {
            characteristic,
            enabled,
        } => radio
            .set_notify(link, characteristic, *enabled)
            .await
            .map(|_| GattOutput::Done),
    }
}
