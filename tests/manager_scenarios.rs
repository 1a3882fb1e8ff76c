//! End-to-end scenarios against the simulated radio.

use blue_manager::protocol::encode_frame;
use blue_manager::transport::{MemoryTransport, OpenBehavior};
use blue_manager::{
    Address, BluetoothManager, ConnectionConfig, ConnectionEventKind, ConnectionState,
    DeviceClass, ErrorKind, ManagerConfig, TransferConfig,
};
use futures::future::join_all;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};

const BAND: &str = "AA:BB:CC:DD:EE:01";
const HEADSET: &str = "AA:BB:CC:DD:EE:02";
const SPEAKER: &str = "AA:BB:CC:DD:EE:03";

fn radio() -> MemoryTransport {
    let radio = MemoryTransport::new();
    radio.add_device(BAND, "Band", -45, DeviceClass::Ble).unwrap();
    radio
        .add_device(HEADSET, "Headset", -70, DeviceClass::Classic)
        .unwrap();
    radio
        .add_device(SPEAKER, "Speaker", -82, DeviceClass::Classic)
        .unwrap();
    radio
}

fn manager_with(radio: &MemoryTransport, config: ManagerConfig) -> BluetoothManager {
    BluetoothManager::new(Arc::new(radio.clone()), config).unwrap()
}

fn address(value: &str) -> Address {
    Address::parse(value).unwrap()
}

/// Lifecycle events other than state changes, until `until` is seen.
async fn events_until(
    rx: &mut broadcast::Receiver<blue_manager::ConnectionEvent>,
    until: ConnectionEventKind,
    count: usize,
) -> Vec<ConnectionEventKind> {
    let mut seen = Vec::new();
    let mut matches = 0;
    while matches < count {
        let event = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event stream closed");
        if matches!(event.kind, ConnectionEventKind::StateChanged { .. }) {
            continue;
        }
        if event.kind == until {
            matches += 1;
        }
        seen.push(event.kind);
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn scan_fills_registry() {
    let radio = radio();
    let manager = manager_with(&radio, ManagerConfig::default());

    let devices = assert_ok!(manager.scan_devices(Duration::from_secs(2)).await);

    assert_eq!(devices.len(), 3);
    assert_eq!(manager.devices().len(), 3);
    assert!(devices.iter().all(|d| !d.connected));

    let band = manager.device(BAND).unwrap().unwrap();
    assert_eq!(band.name, "Band");
    assert_eq!(band.rssi, -45);
    assert_eq!(band.device_class, DeviceClass::Ble);
    assert!(!manager.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn connect_and_disconnect_flip_connected_flag() {
    let radio = radio();
    let manager = manager_with(&radio, ManagerConfig::default());
    assert_ok!(manager.scan_devices(Duration::from_secs(1)).await);

    assert_ok!(manager.connect_device(BAND).await);
    assert!(manager.device(BAND).unwrap().unwrap().connected);
    assert!(manager.is_connected(BAND));
    assert_eq!(manager.connected_devices().len(), 1);

    assert_ok!(manager.disconnect_device(BAND).await);
    assert!(!manager.device(BAND).unwrap().unwrap().connected);
    assert_eq!(manager.connection_state(BAND).unwrap(), ConnectionState::Idle);
    assert!(!radio.is_linked(&address(BAND)));
}

#[tokio::test(start_paused = true)]
async fn hanging_device_exhausts_retries_with_growing_backoff() {
    let radio = radio();
    radio.set_open_behavior(&address(BAND), OpenBehavior::Hang);
    let manager = manager_with(&radio, ManagerConfig::default());
    let mut events = manager.subscribe_connection_events();

    let err = assert_err!(manager.connect_device(BAND).await);

    assert_eq!(err.kind(), ErrorKind::ConnectFailed);
    assert!(matches!(
        err,
        blue_manager::Error::ConnectFailed { attempts: 3, .. }
    ));

    let attempts = radio.open_attempts(&address(BAND));
    assert_eq!(attempts.len(), 3);
    let first_gap = attempts[1] - attempts[0];
    let second_gap = attempts[2] - attempts[1];
    assert!(first_gap > Duration::from_secs(10));
    assert!(second_gap > first_gap);

    assert_eq!(manager.connection_state(BAND).unwrap(), ConnectionState::Idle);
    assert_eq!(manager.pool().active_count(), 0);

    let seen = events_until(
        &mut events,
        ConnectionEventKind::ConnectFailed { attempts: 3 },
        1,
    )
    .await;
    assert_eq!(seen, vec![ConnectionEventKind::ConnectFailed { attempts: 3 }]);
}

#[tokio::test(start_paused = true)]
async fn receive_blocks_until_data_then_times_out() {
    let radio = radio();
    let manager = Arc::new(manager_with(&radio, ManagerConfig::default()));
    assert_ok!(manager.connect_device(BAND).await);

    let receiver = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.receive_data(BAND, 64).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!receiver.is_finished());

    assert!(radio.inject_data(&address(BAND), &b"pong"[..]));
    let data = assert_ok!(receiver.await.unwrap());
    assert_eq!(data, b"pong".to_vec());

    let err = assert_err!(
        manager
            .receive_data_timeout(BAND, 64, Duration::from_millis(200))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Backpressure);

    assert!(manager.receive_data(BAND, 0).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connection_cap_is_enforced() {
    let radio = radio();
    let config = ManagerConfig {
        connection: ConnectionConfig {
            max_connections: 2,
            ..ConnectionConfig::default()
        },
        ..ManagerConfig::default()
    };
    let manager = manager_with(&radio, config);

    assert_ok!(manager.connect_device(BAND).await);
    assert_ok!(manager.connect_device(HEADSET).await);
    let err = assert_err!(manager.connect_device(SPEAKER).await);

    assert_eq!(err.kind(), ErrorKind::TooManyConnections);
    assert!(radio.open_attempts(&address(SPEAKER)).is_empty());
    assert_eq!(manager.pool().active_count(), 2);

    assert_ok!(manager.disconnect_device(BAND).await);
    assert_ok!(manager.connect_device(SPEAKER).await);
}

#[tokio::test(start_paused = true)]
async fn data_arrives_in_order_under_partial_writes() {
    let radio = radio();
    radio.set_max_payload(7);
    radio.set_write_limit(&address(BAND), Some(3));
    let manager = manager_with(&radio, ManagerConfig::default());
    assert_ok!(manager.connect_device(BAND).await);

    let mut expected = Vec::new();
    for i in 0..20u8 {
        let message: Vec<u8> = (0..50).map(|j| i.wrapping_mul(31).wrapping_add(j)).collect();
        assert_ok!(manager.send_data(BAND, &message).await);
        expected.extend_from_slice(&message);
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(radio.written(&address(BAND)), expected);
    assert!(radio.write_calls(&address(BAND)).iter().all(|n| *n <= 3));

    let info = manager.connection_info(BAND).unwrap().unwrap();
    assert_eq!(info.bytes_sent, expected.len() as u64);
}

#[tokio::test(start_paused = true)]
async fn full_outbound_queue_reports_backpressure() {
    let radio = radio();
    radio.set_write_delay(Duration::from_secs(3600));
    let config = ManagerConfig {
        transfer: TransferConfig {
            outbound_capacity: 4,
            send_timeout: Duration::from_millis(200),
            ..TransferConfig::default()
        },
        ..ManagerConfig::default()
    };
    let manager = manager_with(&radio, config);
    assert_ok!(manager.connect_device(BAND).await);

    let mut accepted = 0;
    let err = loop {
        match manager.send_data(BAND, b"payload").await {
            Ok(()) => accepted += 1,
            Err(e) => break e,
        }
        assert!(accepted <= 5, "queue never filled");
    };

    assert_eq!(err.kind(), ErrorKind::Backpressure);
    assert!(accepted >= 4);
    assert!(manager.is_connected(BAND));
}

#[tokio::test(start_paused = true)]
async fn inbound_flow_control_pauses_and_resumes_reads() {
    let radio = radio();
    let config = ManagerConfig {
        transfer: TransferConfig {
            inbound_capacity: 64,
            inbound_high_watermark: 48,
            inbound_low_watermark: 16,
            ..TransferConfig::default()
        },
        ..ManagerConfig::default()
    };
    let manager = manager_with(&radio, config);
    assert_ok!(manager.connect_device(BAND).await);
    let band = address(BAND);

    let expected: Vec<u8> = (0..150u8).collect();
    for chunk in expected[..100].chunks(10) {
        radio.inject_data(&band, chunk.to_vec());
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(radio.is_read_paused(&band));

    // Held by the radio while reads are paused.
    for chunk in expected[100..].chunks(10) {
        radio.inject_data(&band, chunk.to_vec());
    }

    let mut received = Vec::new();
    while received.len() < expected.len() {
        let chunk = assert_ok!(
            manager
                .receive_data_timeout(BAND, 1024, Duration::from_secs(1))
                .await
        );
        received.extend_from_slice(&chunk);
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(received, expected);
    assert!(!radio.is_read_paused(&band));
}

#[tokio::test(start_paused = true)]
async fn lost_link_is_reconnected() {
    let radio = radio();
    let manager = manager_with(&radio, ManagerConfig::default());
    let mut events = manager.subscribe_connection_events();
    assert_ok!(manager.connect_device(BAND).await);

    assert!(radio.drop_link(&address(BAND)));
    let seen = events_until(&mut events, ConnectionEventKind::Connected, 2).await;

    assert_eq!(
        seen,
        vec![
            ConnectionEventKind::Connected,
            ConnectionEventKind::LinkLost,
            ConnectionEventKind::Connected,
        ]
    );
    let info = manager.connection_info(BAND).unwrap().unwrap();
    assert_eq!(info.state, ConnectionState::Connected);
    assert_eq!(info.retry_count, 0);
    assert_eq!(info.last_error, Some(ErrorKind::Disconnected));
    assert_eq!(radio.open_attempts(&address(BAND)).len(), 2);
    assert_ok!(manager.send_data(BAND, b"again").await);
}

#[tokio::test(start_paused = true)]
async fn partial_frame_does_not_survive_reconnect() {
    let radio = radio();
    let manager = manager_with(&radio, ManagerConfig::default());
    let mut events = manager.subscribe_connection_events();
    assert_ok!(manager.connect_device(BAND).await);

    let stale = encode_frame(b"one").unwrap();
    radio.inject_data(&address(BAND), stale.slice(..3));
    let err = assert_err!(manager.receive_frame(BAND, Duration::from_millis(100)).await);
    assert_eq!(err.kind(), ErrorKind::Backpressure);

    assert!(radio.drop_link(&address(BAND)));
    events_until(&mut events, ConnectionEventKind::Connected, 2).await;

    radio.inject_data(&address(BAND), encode_frame(b"two").unwrap());
    let frame = assert_ok!(manager.receive_frame(BAND, Duration::from_secs(1)).await);
    assert_eq!(frame, b"two".to_vec());
}

#[tokio::test(start_paused = true)]
async fn lost_link_exhausts_retries_when_device_refuses() {
    let radio = radio();
    let manager = manager_with(&radio, ManagerConfig::default());
    let mut events = manager.subscribe_connection_events();
    assert_ok!(manager.connect_device(BAND).await);

    radio.set_open_behavior(&address(BAND), OpenBehavior::Refuse);
    assert!(radio.drop_link(&address(BAND)));
    let seen = events_until(
        &mut events,
        ConnectionEventKind::ConnectFailed { attempts: 3 },
        1,
    )
    .await;

    assert_eq!(
        seen,
        vec![
            ConnectionEventKind::Connected,
            ConnectionEventKind::LinkLost,
            ConnectionEventKind::ConnectFailed { attempts: 3 },
        ]
    );
    // The lost link counts as the first failure.
    assert_eq!(radio.open_attempts(&address(BAND)).len(), 3);
    assert_eq!(manager.connection_state(BAND).unwrap(), ConnectionState::Idle);
    assert_eq!(manager.pool().active_count(), 0);
    assert!(!manager.is_connected(BAND));
}

#[tokio::test(start_paused = true)]
async fn empty_send_is_a_no_op() {
    let radio = radio();
    let manager = manager_with(&radio, ManagerConfig::default());
    assert_ok!(manager.connect_device(BAND).await);

    assert_ok!(manager.send_data(BAND, b"").await);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(radio.write_calls(&address(BAND)).is_empty());
    assert!(radio.written(&address(BAND)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn lost_link_settles_when_reconnect_is_disabled() {
    let radio = radio();
    let config = ManagerConfig {
        connection: ConnectionConfig {
            reconnect_on_link_loss: false,
            ..ConnectionConfig::default()
        },
        ..ManagerConfig::default()
    };
    let manager = manager_with(&radio, config);
    let mut events = manager.subscribe_connection_events();
    assert_ok!(manager.connect_device(BAND).await);

    assert!(radio.drop_link(&address(BAND)));
    let seen = events_until(&mut events, ConnectionEventKind::Disconnected, 1).await;

    assert_eq!(
        seen,
        vec![
            ConnectionEventKind::Connected,
            ConnectionEventKind::LinkLost,
            ConnectionEventKind::Disconnected,
        ]
    );
    assert_eq!(manager.connection_state(BAND).unwrap(), ConnectionState::Idle);
    let err = assert_err!(manager.send_data(BAND, b"late").await);
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[tokio::test(start_paused = true)]
async fn unscanned_device_can_be_used() {
    let radio = radio();
    let manager = manager_with(&radio, ManagerConfig::default());

    assert!(manager.device(HEADSET).unwrap().is_none());
    assert_ok!(manager.connect_device("aa-bb-cc-dd-ee-02").await);
    assert!(manager.is_connected(HEADSET));
    assert!(manager.device(HEADSET).unwrap().is_none());

    assert_ok!(manager.send_data(HEADSET, b"hi").await);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(radio.written(&address(HEADSET)), b"hi".to_vec());
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_one_machine() {
    let radio = radio();
    radio.set_open_delay(Duration::from_millis(500));
    let manager = manager_with(&radio, ManagerConfig::default());

    let results = join_all((0..5).map(|_| manager.connect_device(BAND))).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(radio.open_attempts(&address(BAND)).len(), 1);
    assert_eq!(radio.link_count(), 1);
    assert_eq!(manager.connections().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_recover_after_transient_failures() {
    let radio = radio();
    radio.fail_next_opens(&address(BAND), 2);
    let manager = manager_with(&radio, ManagerConfig::default());

    assert_ok!(manager.connect_device(BAND).await);

    assert_eq!(radio.open_attempts(&address(BAND)).len(), 3);
    let info = manager.connection_info(BAND).unwrap().unwrap();
    assert_eq!(info.retry_count, 0);
    assert_eq!(info.last_error, Some(ErrorKind::TransportError));
}

#[tokio::test(start_paused = true)]
async fn persistent_write_failures_drop_the_link() {
    let radio = radio();
    let config = ManagerConfig {
        connection: ConnectionConfig {
            reconnect_on_link_loss: false,
            ..ConnectionConfig::default()
        },
        ..ManagerConfig::default()
    };
    let manager = manager_with(&radio, config);
    let mut events = manager.subscribe_connection_events();
    assert_ok!(manager.connect_device(BAND).await);

    radio.fail_next_writes(&address(BAND), 100);
    assert_ok!(manager.send_data(BAND, b"doomed").await);
    let seen = events_until(&mut events, ConnectionEventKind::Disconnected, 1).await;

    assert!(seen.contains(&ConnectionEventKind::LinkLost));
    assert!(!radio.is_linked(&address(BAND)));
}
