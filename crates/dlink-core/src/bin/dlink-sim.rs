//! Runs the device link against a simulated calculator and logs what happens.
//!
//! Usage: `dlink-sim [config.json]`. Set `RUST_LOG=debug` to see cache hits and
//! every transport call.

use dlink_core::{
    DeviceError, DeviceId, DeviceInfo, DeviceLink, DeviceRecord, InMemoryTransport, LinkConfig, QueueEvent,
    QueueOperation, load_config_or_default,
};
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

const SIM_DEVICE: DeviceId = DeviceId::new(1, 5);

fn simulated_info() -> DeviceInfo {
    DeviceInfo {
        name: "Simulated CX II".to_string(),
        free_storage: 92_000_000,
        total_storage: 100_000_000,
        free_ram: 50_000_000,
        total_ram: 64_000_000,
        battery: 76,
        is_charging: true,
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

fn simulated_transport() -> Arc<InMemoryTransport> {
    let transport = InMemoryTransport::new()
        .with_latency(Duration::from_millis(10))
        .with_chunk_size(4096);
    transport.add_device(SIM_DEVICE, simulated_info());
    transport.seed_dir(SIM_DEVICE, "/Examples");
    transport.seed_file(SIM_DEVICE, "/Examples/geometry.tns", &[0x2a; 48 * 1024]);
    transport.seed_file(SIM_DEVICE, "/notes.tns", b"sim notes");
    Arc::new(transport)
}

async fn log_listing(link: &DeviceLink<InMemoryTransport>, path: &str) -> Result<(), DeviceError> {
    let entries = link.read_directory(SIM_DEVICE, path).await?;
    info!("{} ({} entries)", path, entries.len());
    for entry in entries {
        let kind = if entry.is_dir { "dir " } else { "file" };
        info!("  {} {:>8} {}", kind, entry.size, entry.path);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), DeviceError> {
    // Respects RUST_LOG env var (default: info)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => load_config_or_default(Path::new(&path)),
        None => LinkConfig::default(),
    };
    if config.download_dir.is_none() {
        let dir = std::env::temp_dir().join("dlink-sim");
        tokio::fs::create_dir_all(&dir).await?;
        config.download_dir = Some(dir);
    }

    let transport = simulated_transport();
    let link = DeviceLink::new(Arc::clone(&transport), config);

    let changes = link.reconcile(vec![DeviceRecord::new(SIM_DEVICE, true)]);
    info!("Attached: {:?}", changes.added.iter().map(|r| r.id.to_string()).collect::<Vec<_>>());

    let info = link.open_device(SIM_DEVICE).await?;
    info!(
        "{}: {}% battery, {} of {} bytes free",
        info.name, info.battery, info.free_storage, info.total_storage
    );

    log_listing(&link, "/").await?;
    log_listing(&link, "/").await?;
    info!("Directory listings fetched from the device: {}", transport.list_calls());

    let mut events = link.subscribe();
    let operations = vec![
        QueueOperation::Delete {
            path: "/Examples/missing.tns".to_string(),
            is_dir: false,
        },
        QueueOperation::CreateDir {
            path: "/Examples/new".to_string(),
        },
        QueueOperation::Download {
            path: "/Examples/geometry.tns".to_string(),
            size: 48 * 1024,
        },
    ];
    let mut outstanding = operations.len();
    for operation in operations {
        let id = link.enqueue(SIM_DEVICE, operation)?;
        info!("Queued #{}", id);
    }

    while outstanding > 0 {
        match events.recv().await {
            Ok(QueueEvent::Progress {
                item_id,
                current,
                total,
                ..
            }) => info!("#{} {}/{} bytes", item_id, current, total),
            Ok(QueueEvent::OperationFinished { item_id, error, .. }) => {
                outstanding -= 1;
                match error {
                    Some(err) => error!("#{} failed: {}", item_id, err.user_message()),
                    None => info!("#{} done", item_id),
                }
            }
            Err(RecvError::Lagged(missed)) => {
                // Missed finish events can't be counted, so wait for the queue to drain instead
                warn!("Missed {} queue events, waiting for the queue to drain", missed);
                link.wait_until_idle(SIM_DEVICE, Duration::from_millis(10)).await;
                break;
            }
            Err(RecvError::Closed) => break,
        }
    }

    log_listing(&link, "/Examples").await?;
    if let Some(err) = link.last_error(SIM_DEVICE) {
        info!("Last error on {}: {}", SIM_DEVICE, err);
    }
    if let Some(dir) = &link.config().download_dir {
        info!("Downloads are in {}", dir.display());
    }

    let removed = link.on_device_removed(SIM_DEVICE);
    info!("Detached: {:?}", removed.map(|record| record.name));
    Ok(())
}
