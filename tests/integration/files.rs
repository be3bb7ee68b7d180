use crate::*;

use std::fs;
use std::path::Path;

use spool_core::config::ResourceConfig;
use spool_core::wire::Status;
use spool_transfer::{ChannelSink, DirectoryProvider, FileSink, FileSource, Resource};
use tempfile::TempDir;

fn served(dir: &Path) -> Arc<dyn ResourceProvider> {
    let resources = vec![
        ResourceConfig { id: 1, path: dir.join("firmware.bin"), writable: false },
        ResourceConfig { id: 2, path: dir.join("upload.bin"), writable: true },
        ResourceConfig { id: 3, path: dir.join("missing.bin"), writable: false },
    ];
    Arc::new(DirectoryProvider::from_config(&resources))
}

#[tokio::test]
async fn get_file_into_local_file() -> Result<()> {
    let remote = TempDir::new()?;
    let local = TempDir::new()?;
    let data = payload(300 * 1024, 41);
    fs::write(remote.path().join("firmware.bin"), &data)?;
    let conn = Connection::fast(served(remote.path()));

    let target = local.path().join("copy.bin");
    let transfer = conn.client.open_read(1, FileSink::create(&target)?, 0).await?;
    assert_eq!(done_bytes(finish(transfer).await)?, data.len() as u64);
    assert_eq!(digest(&fs::read(&target)?), digest(&data));
    Ok(())
}

#[tokio::test]
async fn put_file_to_writable_resource() -> Result<()> {
    let remote = TempDir::new()?;
    let local = TempDir::new()?;
    let data = payload(120 * 1024, 42);
    let source = local.path().join("image.bin");
    fs::write(&source, &data)?;
    let conn = Connection::fast(served(remote.path()));

    let transfer = conn.client.open_write(2, FileSource::open(&source)?).await?;
    assert_eq!(done_bytes(finish(transfer).await)?, data.len() as u64);
    // Acknowledged only after the receiver synced the file.
    assert_eq!(digest(&fs::read(remote.path().join("upload.bin"))?), digest(&data));
    Ok(())
}

#[tokio::test]
async fn read_only_resource_refuses_put() -> Result<()> {
    let remote = TempDir::new()?;
    let original = payload(4096, 43);
    fs::write(remote.path().join("firmware.bin"), &original)?;
    let conn = Connection::fast(served(remote.path()));

    let transfer = conn
        .client
        .open_write(1, MemorySource::new(payload(8192, 44)))
        .await?;
    match finish(transfer).await {
        Err(TransferError::RemoteAborted(status)) => assert_eq!(status, Status::PERMISSION_DENIED),
        other => panic!("expected permission denied, got {other:?}"),
    }
    assert_eq!(fs::read(remote.path().join("firmware.bin"))?, original.to_vec());
    Ok(())
}

#[tokio::test]
async fn configured_but_absent_file_is_not_found() -> Result<()> {
    let remote = TempDir::new()?;
    let conn = Connection::fast(served(remote.path()));

    let transfer = conn.client.open_read(3, MemorySink::new(), 0).await?;
    match finish(transfer).await {
        Err(TransferError::RemoteAborted(status)) => assert_eq!(status, Status::NOT_FOUND),
        other => panic!("expected not found, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn resume_partial_download_into_file() -> Result<()> {
    let remote = TempDir::new()?;
    let local = TempDir::new()?;
    let data = payload(200 * 1024, 45);
    fs::write(remote.path().join("firmware.bin"), &data)?;

    // An earlier run left a partial file with a torn tail.
    let committed = 70_000usize;
    let target = local.path().join("copy.bin");
    let mut partial = data[..committed].to_vec();
    partial.extend_from_slice(&[0xAA; 512]);
    fs::write(&target, &partial)?;

    let conn = Connection::fast(served(remote.path()));
    let sink = FileSink::open_at(&target, committed as u64)?;
    let transfer = conn
        .client
        .resume(31, 1, Resource::sink(sink), committed as u64)
        .await?;
    assert_eq!(done_bytes(finish(transfer).await)?, data.len() as u64);
    assert_eq!(digest(&fs::read(&target)?), digest(&data));
    Ok(())
}

#[tokio::test]
async fn resume_refuses_offset_past_end_of_file() -> Result<()> {
    let local = TempDir::new()?;
    let target = local.path().join("short.bin");
    fs::write(&target, [0u8; 100])?;

    let err = FileSink::open_at(&target, 101).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    // The file is left as it was.
    assert_eq!(fs::metadata(&target)?.len(), 100);
    Ok(())
}

#[tokio::test]
async fn stream_download_through_channel() -> Result<()> {
    let remote = TempDir::new()?;
    let data = payload(96 * 1024, 46);
    fs::write(remote.path().join("firmware.bin"), &data)?;
    let conn = Connection::fast(served(remote.path()));

    let (sink, mut chunks) = ChannelSink::new(4, 0);
    let transfer = conn.client.open_read(1, sink, 0).await?;
    let collect = tokio::spawn(async move {
        let mut received = Vec::new();
        while let Some(chunk) = chunks.recv().await {
            received.extend_from_slice(&chunk);
        }
        received
    });

    assert_eq!(done_bytes(finish(transfer).await)?, data.len() as u64);
    let received = tokio::time::timeout(TRANSFER_DEADLINE, collect).await??;
    assert_eq!(digest(&received), digest(&data));
    Ok(())
}
