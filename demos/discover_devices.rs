//! Device discovery example
//!
//! Scans with the first Bluetooth adapter and prints every device found.
//!
//! Run with: cargo run --example discover_devices
//!
//! To scan for longer, or only for one kind of device:
//!   cargo run --example discover_devices -- --seconds 20 --ble

use blue_manager::{BluetoothManager, DeviceFilter, ManagerConfig, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,blue_manager=info")
        .init();

    println!("Bluetooth Device Discovery");
    println!("==========================\n");

    let args: Vec<String> = std::env::args().collect();
    let seconds = args
        .iter()
        .position(|arg| arg == "--seconds")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);

    let mut config = ManagerConfig::default();
    if args.iter().any(|arg| arg == "--ble") {
        config.scanner.device_filter = DeviceFilter::Ble;
    } else if args.iter().any(|arg| arg == "--classic") {
        config.scanner.device_filter = DeviceFilter::Classic;
    }

    let manager = BluetoothManager::with_default_adapter(config).await?;

    println!("Scanning for {} seconds...\n", seconds);
    let devices = manager.scan_devices(Duration::from_secs(seconds)).await?;

    if devices.is_empty() {
        println!("No devices found.");
        println!("\nMake sure that:");
        println!("  - Bluetooth is enabled");
        println!("  - Devices are powered on and advertising");
        return Ok(());
    }

    println!(
        "{:<20} {:<24} {:>6}  {:<8} {}",
        "Address", "Name", "RSSI", "Type", "Signal"
    );
    println!("{}", "-".repeat(72));

    for device in &devices {
        println!(
            "{:<20} {:<24} {:>6}  {:<8} {:?}",
            device.address,
            device.display_name(),
            device.rssi,
            device.device_class,
            device.signal_strength()
        );
    }

    println!("\nFound {} device(s)", devices.len());

    manager.shutdown().await?;
    Ok(())
}
