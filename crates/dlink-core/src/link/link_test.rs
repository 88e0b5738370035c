//! Tests for the device link: cached reads, invalidation after mutations, and
//! device lifecycle handling.

use super::*;
use crate::clock::ManualClock;
use crate::test_support::{device_info, seeded_transport, wait_for_finished};
use crate::transport::InMemoryTransport;
use std::time::Duration;

const DEVICE: DeviceId = DeviceId::new(1, 5);

fn test_config() -> LinkConfig {
    LinkConfig {
        download_dir: Some(std::env::temp_dir()),
        ..LinkConfig::default()
    }
}

fn link_with_clock(
    transport: &Arc<InMemoryTransport>,
    config: LinkConfig,
) -> (DeviceLink<InMemoryTransport>, Arc<ManualClock>) {
    let clock = ManualClock::shared();
    let link = DeviceLink::with_clock(Arc::clone(transport), config, clock.clone());
    link.on_device_added(DeviceRecord::new(DEVICE, true));
    (link, clock)
}

fn names(entries: &[FileInfo]) -> Vec<&str> {
    let mut names: Vec<&str> = entries.iter().map(|entry| entry.path.as_str()).collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_second_read_is_served_from_cache() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let (link, _clock) = link_with_clock(&transport, test_config());

    let first = link.read_directory(DEVICE, "/").await.unwrap();
    let second = link.read_directory(DEVICE, "").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(names(&first), vec!["b.tns", "docs"]);
    assert_eq!(transport.list_calls(), 1);
}

#[tokio::test]
async fn test_expired_listing_is_fetched_again() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let (link, clock) = link_with_clock(&transport, test_config());

    link.read_directory(DEVICE, "/docs").await.unwrap();
    clock.advance(Duration::from_millis(29_999));
    link.read_directory(DEVICE, "/docs").await.unwrap();
    assert_eq!(transport.list_calls(), 1);

    clock.advance(Duration::from_millis(2));
    link.read_directory(DEVICE, "/docs").await.unwrap();
    assert_eq!(transport.list_calls(), 2);
}

#[tokio::test]
async fn test_refresh_bypasses_cache() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let (link, _clock) = link_with_clock(&transport, test_config());

    link.read_directory(DEVICE, "/").await.unwrap();
    transport.seed_file(DEVICE, "/c.tns", b"c");

    // Still the old listing
    let cached = link.read_directory(DEVICE, "/").await.unwrap();
    assert_eq!(names(&cached), vec!["b.tns", "docs"]);

    let fresh = link.refresh_directory(DEVICE, "/").await.unwrap();
    assert_eq!(names(&fresh), vec!["b.tns", "c.tns", "docs"]);

    // And the refresh replaced the cached entry
    let cached = link.read_directory(DEVICE, "/").await.unwrap();
    assert_eq!(names(&cached), vec!["b.tns", "c.tns", "docs"]);
    assert_eq!(transport.list_calls(), 2);
}

#[tokio::test]
async fn test_failed_read_is_not_cached() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let (link, _clock) = link_with_clock(&transport, test_config());

    for _ in 0..2 {
        let err = link.read_directory(DEVICE, "/nope").await.unwrap_err();
        assert_eq!(err, DeviceError::not_found(DEVICE, "/nope"));
    }
    assert_eq!(transport.list_calls(), 2);
    assert!(link.cache.is_empty());
}

#[tokio::test]
async fn test_unknown_device_is_rejected() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let (link, _clock) = link_with_clock(&transport, test_config());
    let unknown = DeviceId::new(7, 7);

    let err = link.read_directory(unknown, "/").await.unwrap_err();
    assert_eq!(err, DeviceError::DeviceNotFound { device: unknown });

    let err = link
        .enqueue(unknown, QueueOperation::CreateDir { path: "/x".to_string() })
        .unwrap_err();
    assert_eq!(err, DeviceError::DeviceNotFound { device: unknown });
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_mutation_invalidates_affected_listings_only() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let (link, _clock) = link_with_clock(&transport, test_config());
    let mut events = link.subscribe();

    link.read_directory(DEVICE, "/").await.unwrap();
    let before = link.read_directory(DEVICE, "/docs").await.unwrap();
    assert_eq!(names(&before), vec!["a.tns"]);

    link.enqueue(
        DEVICE,
        QueueOperation::Delete {
            path: "/docs/a.tns".to_string(),
            is_dir: false,
        },
    )
    .unwrap();
    let finished = wait_for_finished(&mut events, 1).await;
    assert_eq!(finished[0].2, None);

    let after = link.read_directory(DEVICE, "/docs").await.unwrap();
    assert!(after.is_empty());
    link.read_directory(DEVICE, "/").await.unwrap();

    // "/" was untouched and is still cached; "/docs" was fetched again
    assert_eq!(transport.list_calls(), 3);
}

#[tokio::test]
async fn test_failed_mutation_still_invalidates() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    transport.fail_on(DEVICE, "/docs/new");
    let (link, _clock) = link_with_clock(&transport, test_config());
    let mut events = link.subscribe();

    link.read_directory(DEVICE, "/docs").await.unwrap();
    link.enqueue(DEVICE, QueueOperation::CreateDir {
        path: "/docs/new".to_string(),
    })
    .unwrap();
    wait_for_finished(&mut events, 1).await;

    assert!(link.last_error(DEVICE).is_some());
    assert!(link.cache.get(DEVICE, "/docs").is_none());
}

#[tokio::test]
async fn test_directory_delete_invalidates_nested_listings() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    transport.seed_file(DEVICE, "/docs/old/sub/x.tns", b"x");
    let (link, _clock) = link_with_clock(&transport, test_config());
    let mut events = link.subscribe();

    let cached = link.read_directory(DEVICE, "/docs/old/sub").await.unwrap();
    assert_eq!(names(&cached), vec!["x.tns"]);

    link.enqueue(
        DEVICE,
        QueueOperation::Delete {
            path: "/docs/old".to_string(),
            is_dir: true,
        },
    )
    .unwrap();
    let finished = wait_for_finished(&mut events, 1).await;
    assert_eq!(finished[0].2, None);
    assert!(!transport.exists(DEVICE, "/docs/old/sub"));

    let err = link.read_directory(DEVICE, "/docs/old/sub").await.unwrap_err();
    assert_eq!(err, DeviceError::not_found(DEVICE, "/docs/old/sub"));
}

#[tokio::test]
async fn test_move_invalidates_source_and_destination_subtrees() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    transport.seed_file(DEVICE, "/docs/old/sub/x.tns", b"x");
    let (link, _clock) = link_with_clock(&transport, test_config());
    let mut events = link.subscribe();

    link.read_directory(DEVICE, "/docs/old/sub").await.unwrap();
    // Left over from an earlier directory that lived at the destination
    link.cache.put(DEVICE, "/moved/sub", Vec::new());

    link.enqueue(
        DEVICE,
        QueueOperation::Move {
            src: "/docs/old".to_string(),
            dest: "/moved".to_string(),
        },
    )
    .unwrap();
    let finished = wait_for_finished(&mut events, 1).await;
    assert_eq!(finished[0].2, None);

    assert!(link.read_directory(DEVICE, "/docs/old/sub").await.is_err());
    let moved = link.read_directory(DEVICE, "/moved/sub").await.unwrap();
    assert_eq!(names(&moved), vec!["x.tns"]);
}

#[tokio::test(start_paused = true)]
async fn test_listing_finished_after_removal_is_not_cached() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new().with_latency(Duration::from_millis(100)));
    let (link, _clock) = link_with_clock(&transport, test_config());

    let (listing, _) = tokio::join!(link.read_directory(DEVICE, "/"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        link.on_device_removed(DEVICE);
    });

    assert_eq!(names(&listing.unwrap()), vec!["b.tns", "docs"]);
    assert!(link.cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_wait_until_idle_without_watching_events() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new().with_latency(Duration::from_millis(100)));
    let (link, _clock) = link_with_clock(&transport, test_config());

    for path in ["/a", "/b", "/c"] {
        link.enqueue(DEVICE, QueueOperation::CreateDir { path: path.to_string() })
            .unwrap();
    }
    assert!(link.is_busy(DEVICE));

    link.wait_until_idle(DEVICE, Duration::from_millis(10)).await;

    assert!(!link.is_busy(DEVICE));
    assert!(link.pending(DEVICE).is_empty());
    assert!(["/a", "/b", "/c"].iter().all(|path| transport.is_dir(DEVICE, path)));
}

#[tokio::test]
async fn test_download_lands_in_configured_directory() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let download_dir = tempfile::tempdir().unwrap();
    let config = LinkConfig {
        download_dir: Some(download_dir.path().to_path_buf()),
        ..LinkConfig::default()
    };
    let (link, _clock) = link_with_clock(&transport, config);
    let mut events = link.subscribe();

    link.enqueue(
        DEVICE,
        QueueOperation::Download {
            path: "/docs/a.tns".to_string(),
            size: 5,
        },
    )
    .unwrap();
    let finished = wait_for_finished(&mut events, 1).await;

    assert_eq!(finished[0].2, None);
    assert_eq!(std::fs::read(download_dir.path().join("a.tns")).unwrap(), b"hello");
}

#[tokio::test]
async fn test_open_device_stores_info() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let (link, _clock) = link_with_clock(&transport, test_config());

    let info = link.open_device(DEVICE).await.unwrap();

    assert_eq!(info, device_info("Test calculator"));
    assert_eq!(link.device(DEVICE).and_then(|record| record.info), Some(info));
}

fn open_calls(transport: &InMemoryTransport) -> usize {
    transport
        .calls()
        .iter()
        .filter(|call| call.starts_with("open_device"))
        .count()
}

#[tokio::test]
async fn test_open_device_reuses_stored_info() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let (link, _clock) = link_with_clock(&transport, test_config());

    let first = link.open_device(DEVICE).await.unwrap();
    let second = link.open_device(DEVICE).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(open_calls(&transport), 1);
}

#[tokio::test]
async fn test_close_device_clears_info() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let (link, _clock) = link_with_clock(&transport, test_config());

    link.open_device(DEVICE).await.unwrap();
    assert!(transport.is_open(DEVICE));

    link.close_device(DEVICE).await.unwrap();
    assert!(!transport.is_open(DEVICE));
    assert_eq!(link.device(DEVICE).and_then(|record| record.info), None);

    // Closed devices are opened through the transport again
    link.open_device(DEVICE).await.unwrap();
    assert_eq!(open_calls(&transport), 2);
}

#[tokio::test]
async fn test_close_device_that_is_not_open_is_a_no_op() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let (link, _clock) = link_with_clock(&transport, test_config());

    link.close_device(DEVICE).await.unwrap();

    assert!(!transport.calls().iter().any(|call| call.starts_with("close_device")));
    assert_eq!(
        link.close_device(DeviceId::new(7, 7)).await,
        Err(DeviceError::DeviceNotFound {
            device: DeviceId::new(7, 7)
        })
    );
}

#[tokio::test]
async fn test_refresh_device_info_rereads_open_device() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let (link, _clock) = link_with_clock(&transport, test_config());

    assert!(link.refresh_device_info(DEVICE).await.is_err());

    link.open_device(DEVICE).await.unwrap();
    let mut drained = device_info("Test calculator");
    drained.battery = 20;
    transport.set_device_info(DEVICE, drained.clone());

    assert_eq!(link.refresh_device_info(DEVICE).await.unwrap(), drained);
    assert_eq!(link.device(DEVICE).and_then(|record| record.info), Some(drained.clone()));
    // The stored info is what a later open returns
    assert_eq!(link.open_device(DEVICE).await.unwrap(), drained);
}

#[tokio::test(start_paused = true)]
async fn test_device_removal_disposes_state() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new().with_latency(Duration::from_millis(100)));
    let (link, _clock) = link_with_clock(&transport, test_config());

    link.read_directory(DEVICE, "/").await.unwrap();
    for path in ["/a", "/b", "/c"] {
        link.enqueue(DEVICE, QueueOperation::CreateDir { path: path.to_string() })
            .unwrap();
    }
    assert_eq!(link.pending(DEVICE).len(), 3);

    let removed = link.on_device_removed(DEVICE);

    assert_eq!(removed.map(|record| record.id), Some(DEVICE));
    assert!(link.pending(DEVICE).is_empty());
    assert!(!link.is_busy(DEVICE));
    assert!(link.cache.is_empty());
    assert!(link.devices().is_empty());
    assert!(link.selected_device().is_none());
    assert!(link.read_directory(DEVICE, "/").await.is_err());
}

#[tokio::test]
async fn test_reconcile_disposes_departed_devices() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let (link, _clock) = link_with_clock(&transport, test_config());
    let newcomer = DeviceId::new(3, 1);

    link.read_directory(DEVICE, "/").await.unwrap();
    let changes = link.reconcile(vec![DeviceRecord::new(newcomer, false)]);

    assert_eq!(changes.removed, vec![DEVICE]);
    assert_eq!(changes.added.len(), 1);
    assert!(link.cache.is_empty());
    assert_eq!(link.selected_device().map(|record| record.id), Some(newcomer));
    assert_eq!(
        link.device(newcomer).map(|record| record.name),
        Some("TI-Nspire".to_string())
    );
}

#[tokio::test]
async fn test_select_device() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let (link, _clock) = link_with_clock(&transport, test_config());
    let second = DeviceId::new(1, 6);

    assert!(link.on_device_added(DeviceRecord::new(second, false)));
    assert!(!link.on_device_added(DeviceRecord::new(second, false)));
    assert_eq!(link.selected_device().map(|record| record.id), Some(DEVICE));

    assert!(link.select_device(Some(second)));
    assert_eq!(link.selected_device().map(|record| record.id), Some(second));
    assert!(!link.select_device(Some(DeviceId::new(9, 9))));
}

#[tokio::test]
async fn test_reset_clears_all_listings() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let (link, _clock) = link_with_clock(&transport, test_config());

    link.read_directory(DEVICE, "/").await.unwrap();
    link.read_directory(DEVICE, "/docs").await.unwrap();
    link.reset();

    assert!(link.cache.is_empty());
    link.read_directory(DEVICE, "/").await.unwrap();
    assert_eq!(transport.list_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_purges_listings_nobody_reads() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let (link, clock) = link_with_clock(&transport, test_config());
    assert!(link.sweeper.is_some());

    link.read_directory(DEVICE, "/").await.unwrap();
    assert_eq!(link.cache.len(), 1);

    let interval = link.config().sweep_interval();
    clock.advance(interval);
    tokio::time::advance(interval).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert!(link.cache.is_empty());
}

#[test]
fn test_link_without_runtime_has_no_sweeper() {
    let transport = seeded_transport(DEVICE, InMemoryTransport::new());
    let (link, _clock) = link_with_clock(&transport, test_config());
    assert!(link.sweeper.is_none());
    assert!(link.devices().iter().any(|record| record.id == DEVICE));
}
