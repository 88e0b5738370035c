//! Fixtures shared by unit tests across modules.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::device::{DeviceId, DeviceInfo};
use crate::error::DeviceError;
use crate::queue::QueueEvent;
use crate::transport::InMemoryTransport;

pub(crate) fn device_info(name: &str) -> DeviceInfo {
    DeviceInfo {
        name: name.to_string(),
        free_storage: 80_000_000,
        total_storage: 100_000_000,
        free_ram: 40_000_000,
        total_ram: 64_000_000,
        battery: 87,
        is_charging: false,
        os_version: "6.2.0.333".to_string(),
        boot1_version: "4.0.1.52".to_string(),
        boot2_version: "6.2.0.333".to_string(),
        hw_type: 2,
        clock_speed: 132,
        lcd_width: 320,
        lcd_height: 240,
        lcd_bpp: 16,
        lcd_sample_mode: 1,
    }
}

/// A transport with one device holding `/docs/a.tns` and `/b.tns`.
pub(crate) fn seeded_transport(device: DeviceId, transport: InMemoryTransport) -> Arc<InMemoryTransport> {
    transport.add_device(device, device_info("Test calculator"));
    transport.seed_dir(device, "/docs");
    transport.seed_file(device, "/docs/a.tns", b"hello");
    transport.seed_file(device, "/b.tns", b"world!");
    Arc::new(transport)
}

/// One `OperationFinished` event, flattened.
pub(crate) type Finished = (DeviceId, u64, Option<DeviceError>);

/// Waits for `count` finished events, skipping progress and lag.
pub(crate) async fn wait_for_finished(events: &mut broadcast::Receiver<QueueEvent>, count: usize) -> Vec<Finished> {
    let mut finished = Vec::new();
    let collect = async {
        while finished.len() < count {
            match events.recv().await {
                Ok(QueueEvent::OperationFinished { device, item_id, error }) => finished.push((device, item_id, error)),
                Ok(QueueEvent::Progress { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("Timed out waiting for queue events");
    finished
}
