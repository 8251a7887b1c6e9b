//! GATT operation ordering
//!
//! The radio finishes operations on different characteristics with
//! different latencies; completions must still come back in submission
//! order with never more than one operation on the air.
//!
//! Run with: cargo test --test gatt_queue_ordering

mod common;

use common::*;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use gattlink_core::{
    CharacteristicDescriptor, CharacteristicProperties, GattOperation, GattOperationQueue,
    GattOutput, LinkError, LinkHandle, ServiceDescriptor, WriteKind, BATTERY_LEVEL_UUID,
};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const CONTROL_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
const CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

fn control_service() -> ServiceDescriptor {
    ServiceDescriptor {
        uuid: CONTROL_SERVICE_UUID,
        characteristics: vec![CharacteristicDescriptor {
            uuid: CONTROL_POINT_UUID,
            properties: CharacteristicProperties {
                write_without_response: true,
                ..Default::default()
            },
            config_descriptor: None,
        }],
    }
}

#[tokio::test]
async fn test_interleaved_operations_complete_in_submission_order() {
    let radio = ScriptedRadio::esp32();
    *radio.services.lock() = vec![
        battery_service(CharacteristicProperties {
            read: true,
            write: true,
            notify: true,
            ..Default::default()
        }),
        control_service(),
    ];
    let manager = manager(radio.clone(), allow_all());
    manager.start().await.unwrap();

    // Battery operations are slow, control point writes are fast
    radio
        .delays
        .lock()
        .insert(BATTERY_LEVEL_UUID, Duration::from_millis(60));
    radio
        .delays
        .lock()
        .insert(CONTROL_POINT_UUID, Duration::from_millis(5));
    radio.max_in_flight.store(0, Ordering::SeqCst);
    radio.completed.lock().clear();

    let finished = Arc::new(Mutex::new(Vec::new()));
    let track = |label: &'static str, op: BoxFuture<'static, Result<(), LinkError>>| {
        let finished = Arc::clone(&finished);
        async move {
            let result = op.await;
            finished.lock().push(label);
            result
        }
        .boxed()
    };

    let ops = vec![
        track("read-1", {
            let m = manager.clone();
            async move { m.read(BATTERY_LEVEL_UUID).await.map(|_| ()) }.boxed()
        }),
        track("write-2", {
            let m = manager.clone();
            async move { m.write(CONTROL_POINT_UUID, vec![2]).await }.boxed()
        }),
        track("write-3", {
            let m = manager.clone();
            async move { m.write(BATTERY_LEVEL_UUID, vec![3]).await }.boxed()
        }),
        track("write-4", {
            let m = manager.clone();
            async move { m.write(CONTROL_POINT_UUID, vec![4]).await }.boxed()
        }),
        track("read-5", {
            let m = manager.clone();
            async move { m.read(BATTERY_LEVEL_UUID).await.map(|_| ()) }.boxed()
        }),
    ];

    let results = join_all(ops).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(
        *finished.lock(),
        vec!["read-1", "write-2", "write-3", "write-4", "read-5"]
    );
    assert_eq!(
        *radio.completed.lock(),
        vec![
            format!("read {}", BATTERY_LEVEL_UUID),
            format!("write {} 02", CONTROL_POINT_UUID),
            format!("write {} 03", BATTERY_LEVEL_UUID),
            format!("write {} 04", CONTROL_POINT_UUID),
            format!("read {}", BATTERY_LEVEL_UUID),
        ]
    );
    assert_eq!(radio.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(manager.read(BATTERY_LEVEL_UUID).await.unwrap(), vec![3]);
}

#[tokio::test]
async fn test_rejected_operation_does_not_disturb_the_rest() {
    let radio = ScriptedRadio::esp32();
    let (faults, mut fault_rx) = mpsc::unbounded_channel();
    let queue = GattOperationQueue::new(
        radio.clone(),
        LinkHandle(1),
        Duration::from_millis(500),
        faults,
    );

    let battery = battery_service(CharacteristicProperties {
        read: true,
        write: true,
        ..Default::default()
    })
    .characteristics
    .remove(0);
    let unreadable = CharacteristicDescriptor {
        uuid: Uuid::from_u128(0xDEAD),
        properties: CharacteristicProperties {
            read: true,
            ..Default::default()
        },
        config_descriptor: None,
    };

    let first = queue.enqueue(GattOperation::Write {
        characteristic: battery.clone(),
        payload: vec![42],
        kind: WriteKind::WithResponse,
    });
    let rejected = queue.enqueue(GattOperation::Read {
        characteristic: unreadable,
    });
    let last = queue.enqueue(GattOperation::Read {
        characteristic: battery,
    });

    assert_eq!(first.await, Ok(GattOutput::Done));
    assert!(matches!(rejected.await, Err(LinkError::Rejected(_))));
    assert_eq!(last.await, Ok(GattOutput::Value(vec![42])));
    assert!(!queue.is_closed());
    assert!(fault_rx.try_recv().is_err());
}
