//! Simulated link example
//!
//! Runs the whole manager against an in-memory radio: scans, connects to
//! two devices, exchanges framed messages and survives a dropped link.
//!
//! Run with: cargo run --example simulated_link

use blue_manager::protocol::encode_hex;
use blue_manager::transport::MemoryTransport;
use blue_manager::{
    Address, BluetoothManager, ConnectionEventKind, DataDirection, DeviceClass, ManagerConfig,
    Result,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,blue_manager=debug")
        .init();

    println!("Simulated Bluetooth Link");
    println!("========================\n");

    let radio = MemoryTransport::new();
    let thermometer =
        radio.add_device("C0:FF:EE:00:00:01", "Thermometer", -52, DeviceClass::Ble)?;
    let speaker = radio.add_device("C0:FF:EE:00:00:02", "Speaker", -67, DeviceClass::Classic)?;
    radio.set_max_payload(20);

    let manager = BluetoothManager::new(Arc::new(radio.clone()), ManagerConfig::default())?;
    println!("Adapter: {}\n", manager.adapter_info().await?);

    let _events = manager.on_connection_event(|event| match event.kind {
        ConnectionEventKind::StateChanged { .. } => {}
        _ => println!("  [event] {}", event),
    });

    let mut activity = manager.subscribe_data_events();
    let _received = manager.on_data_received(|address, data| {
        println!("  [data] {} <- {}", address, encode_hex(data));
    });

    println!("Scanning...");
    for device in manager.scan_devices(Duration::from_secs(1)).await? {
        println!("  {}", device);
    }

    println!("\nConnecting...");
    manager.connect_device(thermometer.as_str()).await?;
    manager.connect_device(speaker.as_str()).await?;
    for device in manager.connected_devices() {
        println!("  connected: {}", device.display_name());
    }

    println!("\nSending a framed message to the thermometer...");
    manager
        .send_frame(thermometer.as_str(), b"READ TEMPERATURE")
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!(
        "  device received {} bytes in writes of {:?}",
        radio.written(&thermometer).len(),
        radio.write_calls(&thermometer)
    );
    while let Ok(event) = activity.try_recv() {
        if event.direction == DataDirection::Sent {
            println!("  [data] {} -> {}", event.address, encode_hex(&event.data));
        }
    }

    reply(&radio, &thermometer, b"21.5C");
    let answer = manager
        .receive_frame(thermometer.as_str(), Duration::from_secs(1))
        .await?;
    println!("  reply: {}", String::from_utf8_lossy(&answer));

    println!("\nDropping the speaker link...");
    radio.drop_link(&speaker);
    tokio::time::sleep(Duration::from_secs(1)).await;
    println!(
        "  speaker is {}",
        manager.connection_state(speaker.as_str())?
    );

    println!("\nShutting down...");
    manager.shutdown().await?;
    println!("  open links: {}", radio.link_count());

    Ok(())
}

fn reply(radio: &MemoryTransport, address: &Address, payload: &[u8]) {
    if let Ok(frame) = blue_manager::protocol::encode_frame(payload) {
        radio.inject_data(address, frame);
    }
}
