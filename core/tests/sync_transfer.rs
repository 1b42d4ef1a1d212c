//! Two-device end-to-end: pair over localhost, sync index metadata, fetch
//! file bytes, and verify that Private files never cross the wire.

use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fv_core::net::transfer::{RequestOutcome, REASON_NOT_FOUND};
use fv_core::{AppConfig, Core, NetworkEvent, Visibility};

struct Device {
    core: Core,
    _data_dir: tempfile::TempDir,
    docs: tempfile::TempDir,
}

async fn open_device(discovery_port: u16) -> Device {
    let data_dir = tempfile::tempdir().unwrap();
    let docs = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default_with_dir(data_dir.path().to_path_buf());
    // Ephemeral ports so parallel test runs never collide.
    config.ports.discovery_port = discovery_port;
    let vault = Arc::new(fv_core::vault::SecretVault::in_memory());
    let core = Core::open_with_vault(config, vault).await.unwrap();
    Device {
        core,
        _data_dir: data_dir,
        docs,
    }
}

/// Pair two fresh devices through the real PIN exchange, then bring both
/// network stacks up and connect B to A. Returns the established pair.
async fn paired_devices() -> (Device, Device) {
    let a = open_device(0).await;
    let b = open_device(0).await;

    let invite = a.core.pairing.create_family("127.0.0.1", 0).await.unwrap();
    let outcome = b
        .core
        .pairing
        .join_family("127.0.0.1", invite.port, &invite.pin)
        .await;
    assert_eq!(outcome, fv_core::net::pairing::JoinOutcome::Success);

    a.core.network.start(Some(0)).await.unwrap();
    b.core.network.start(Some(0)).await.unwrap();

    let a_port = a.core.network.service_port().unwrap();
    let addr: SocketAddr = format!("127.0.0.1:{a_port}").parse().unwrap();
    let handle = b.core.network.connect_to_address(addr).await.unwrap();
    assert_eq!(handle.device_id, a.core.identity.device_id);

    (a, b)
}

async fn wait_for<F, Fut>(mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn delta_sync_creates_shadow_rows() {
    let (a, b) = paired_devices().await;

    fs::write(a.docs.path().join("shared.txt"), "family knowledge").unwrap();
    let folder_id = a
        .core
        .index
        .add_folder(a.docs.path(), "docs", Visibility::Family)
        .await
        .unwrap();
    a.core.index.scan_folder(folder_id, None).await.unwrap();
    a.core.duplicates.compute_checksums(None).await.unwrap();

    let a_file = a
        .core
        .index
        .get_by_folder(folder_id, 1, 0)
        .await
        .unwrap()
        .remove(0);
    assert!(a_file.checksum.is_some());
    assert!(a_file.sync_version > 0);

    let a_id = a.core.identity.device_id.clone();
    b.core.network.sync_with_device(&a_id).await.unwrap();

    let sync = b.core.network.sync_manager().unwrap();
    wait_for(|| {
        let sync = sync.clone();
        let a_id = a_id.clone();
        async move { sync.shadow_files(&a_id).await.unwrap().len() == 1 }
    })
    .await;

    let shadows = sync.shadow_files(&a_id).await.unwrap();
    assert_eq!(shadows[0].name, "shared.txt");
    assert_eq!(shadows[0].checksum, a_file.checksum);
    assert_eq!(shadows[0].remote_id, a_file.id);

    // A later high-water mark yields nothing new.
    let a_sync = a.core.network.sync_manager().unwrap();
    let later = a_sync
        .local_changes_since(a_file.modified_at + 100)
        .await
        .unwrap();
    assert!(later.is_empty());

    b.core.shutdown().await.unwrap();
    a.core.shutdown().await.unwrap();
}

#[tokio::test]
async fn private_files_are_confined() {
    let (a, b) = paired_devices().await;

    fs::write(a.docs.path().join("a.txt"), "shareable").unwrap();
    fs::write(a.docs.path().join("secret.txt"), "nobody sees this").unwrap();
    let folder_id = a
        .core
        .index
        .add_folder(a.docs.path(), "docs", Visibility::Family)
        .await
        .unwrap();
    a.core.index.scan_folder(folder_id, None).await.unwrap();
    a.core.duplicates.compute_checksums(None).await.unwrap();

    let files = a.core.index.get_by_folder(folder_id, 10, 0).await.unwrap();
    let secret = files.iter().find(|f| f.name == "secret.txt").unwrap();
    a.core
        .index
        .set_file_visibility(secret.id, Some(Visibility::Private))
        .await
        .unwrap();

    // Full sync must carry a.txt only.
    let a_id = a.core.identity.device_id.clone();
    b.core.network.sync_with_device(&a_id).await.unwrap();
    let sync = b.core.network.sync_manager().unwrap();
    wait_for(|| {
        let sync = sync.clone();
        let a_id = a_id.clone();
        async move { !sync.shadow_files(&a_id).await.unwrap().is_empty() }
    })
    .await;
    let shadows = sync.shadow_files(&a_id).await.unwrap();
    assert_eq!(shadows.len(), 1);
    assert_eq!(shadows[0].name, "a.txt");

    // A direct FileRequest for the private file answers FileNotFound.
    let mut events = b.core.events.subscribe();
    let outcome = b
        .core
        .network
        .request_file(&a_id, secret.id, Some(secret.size), None)
        .await
        .unwrap();
    assert!(matches!(outcome, RequestOutcome::Pending(_)));

    let error = loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("no transfer error arrived")
            .unwrap();
        if let NetworkEvent::FileTransferError(progress) = event {
            break progress;
        }
    };
    assert_eq!(error.file_id, secret.id);
    assert_eq!(error.error.as_deref(), Some(REASON_NOT_FOUND));

    b.core.shutdown().await.unwrap();
    a.core.shutdown().await.unwrap();
}

#[tokio::test]
async fn file_transfer_lands_in_cache_with_verified_checksum() {
    let (a, b) = paired_devices().await;

    // Big enough for many chunks and several ack rounds.
    let payload: Vec<u8> = (0..800_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(a.docs.path().join("album.bin"), &payload).unwrap();
    let folder_id = a
        .core
        .index
        .add_folder(a.docs.path(), "docs", Visibility::Family)
        .await
        .unwrap();
    a.core.index.scan_folder(folder_id, None).await.unwrap();
    a.core.duplicates.compute_checksums(None).await.unwrap();

    let a_file = a
        .core
        .index
        .get_by_folder(folder_id, 1, 0)
        .await
        .unwrap()
        .remove(0);
    let checksum = a_file.checksum.clone().unwrap();

    let a_id = a.core.identity.device_id.clone();
    let mut events = b.core.events.subscribe();
    let outcome = b
        .core
        .network
        .request_file(&a_id, a_file.id, Some(a_file.size), Some(checksum.clone()))
        .await
        .unwrap();
    assert!(matches!(outcome, RequestOutcome::Pending(_)));

    let complete = loop {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("transfer never completed")
            .unwrap();
        match event {
            NetworkEvent::FileTransferComplete(progress) => break progress,
            NetworkEvent::FileTransferError(progress) => {
                panic!("transfer failed: {:?}", progress.error)
            }
            _ => {}
        }
    };

    let local_path = complete.local_path.expect("completed transfer has a path");
    let received = fs::read(&local_path).unwrap();
    assert_eq!(received, payload);
    assert!(local_path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .contains(&checksum));

    // A second request is served straight from the cache.
    let outcome = b
        .core
        .network
        .request_file(&a_id, a_file.id, Some(a_file.size), Some(checksum))
        .await
        .unwrap();
    assert!(matches!(outcome, RequestOutcome::Cached(_)));

    b.core.shutdown().await.unwrap();
    a.core.shutdown().await.unwrap();
}
