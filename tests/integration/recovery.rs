use crate::*;

use std::sync::atomic::AtomicBool;

use spool_core::wire::{ChunkType, Status};
use spool_transfer::Resource;

#[tokio::test]
async fn dropped_chunk_is_requested_again() -> Result<()> {
    let store = MemoryStore::new();
    let data = payload(64 * 1024, 21);
    store.add_source(1, data.clone());

    let mut config = fast_config();
    config.session.window.max_chunk_size = 4096;
    config.session.window.window_bytes = 32 * 1024;

    let dropped = Arc::new(AtomicBool::new(false));
    let retransmit_at_gap = Arc::new(AtomicBool::new(false));
    let (d, r) = (dropped.clone(), retransmit_at_gap.clone());
    let faults = LinkFaults::filtered(move |frame, chunk| {
        if frame.from_server && chunk.offset == 4096 && !chunk.data.is_empty() {
            return !d.swap(true, Ordering::SeqCst);
        }
        if !frame.from_server
            && chunk.kind() == ChunkType::ParametersRetransmit
            && chunk.offset == 4096
        {
            r.store(true, Ordering::SeqCst);
        }
        false
    });
    let conn = Connection::open(config, config, Some(store.provider()), faults);

    let sink = MemorySink::new();
    let transfer = conn.client.open_read(1, sink.clone(), 0).await?;
    done_bytes(finish(transfer).await)?;

    assert!(dropped.load(Ordering::SeqCst));
    assert!(retransmit_at_gap.load(Ordering::SeqCst));
    assert_eq!(sink.contents(), data.to_vec());
    Ok(())
}

#[tokio::test]
async fn lost_acknowledgement_is_answered_by_lingering_receiver() -> Result<()> {
    let store = MemoryStore::new();
    let uploaded = store.add_sink(3);
    // Swallow the server receiver's first completion status.
    let acks = Arc::new(AtomicUsize::new(0));
    let seen = acks.clone();
    let faults = LinkFaults::filtered(move |frame, chunk| {
        if frame.from_server && chunk.status == Some(Status::OK) {
            return seen.fetch_add(1, Ordering::SeqCst) == 0;
        }
        false
    });
    let conn = Connection::open(fast_config(), fast_config(), Some(store.provider()), faults);

    let data = payload(20_000, 22);
    let transfer = conn.client.open_write(3, MemorySource::new(data.clone())).await?;
    assert_eq!(done_bytes(finish(transfer).await)?, data.len() as u64);

    assert!(acks.load(Ordering::SeqCst) >= 2, "status should have been re-sent");
    assert_eq!(uploaded.contents(), data.to_vec());
    Ok(())
}

#[tokio::test]
async fn resume_read_continues_from_committed_offset() -> Result<()> {
    let store = MemoryStore::new();
    let data = payload(96 * 1024, 23);
    store.add_source(4, data.clone());

    // A previous connection delivered the first 40000 bytes.
    let committed = 40_000usize;
    let sink = MemorySink::new();
    let mut partial = sink.clone();
    partial.write(0, &data[..committed])?;

    let resent_before_offset = Arc::new(AtomicBool::new(false));
    let flag = resent_before_offset.clone();
    let faults = LinkFaults::filtered(move |frame, chunk| {
        if frame.from_server && !chunk.data.is_empty() && chunk.offset < committed as u64 {
            flag.store(true, Ordering::SeqCst);
        }
        false
    });
    let conn = Connection::open(fast_config(), fast_config(), Some(store.provider()), faults);

    let transfer = conn
        .client
        .resume(77, 4, Resource::sink(sink.clone()), committed as u64)
        .await?;
    assert_eq!(transfer.transfer_id(), 77);
    assert_eq!(done_bytes(finish(transfer).await)?, data.len() as u64);

    assert!(!resent_before_offset.load(Ordering::SeqCst));
    assert_eq!(digest(&sink.contents()), digest(&data));
    Ok(())
}

#[tokio::test]
async fn resume_write_continues_from_committed_offset() -> Result<()> {
    let store = MemoryStore::new();
    let uploaded = store.add_sink(6);
    let data = payload(80 * 1024, 24);

    let committed = 30_000usize;
    let mut partial = uploaded.clone();
    partial.write(0, &data[..committed])?;

    let conn = Connection::fast(store.provider());
    let transfer = conn
        .client
        .resume(
            500,
            6,
            Resource::source(MemorySource::new(data.clone())),
            committed as u64,
        )
        .await?;
    assert_eq!(done_bytes(finish(transfer).await)?, data.len() as u64);
    assert_eq!(digest(&uploaded.contents()), digest(&data));
    Ok(())
}

#[tokio::test]
async fn resume_after_connection_loss() -> Result<()> {
    let store = MemoryStore::new().with_read_delay(Duration::from_millis(2));
    let data = payload(128 * 1024, 25);
    store.add_source(8, data.clone());
    let sink = MemorySink::new();

    // First connection: cut once some bytes have landed.
    let first = Connection::fast(store.provider());
    let transfer = first.client.open_read(8, sink.clone(), 0).await?;
    let transfer_id = transfer.transfer_id();
    let progress = transfer.watch_progress();
    assert!(eventually(|| progress.borrow().bytes_transferred >= 16 * 1024).await);
    first.cut();
    let err = finish(transfer).await.unwrap_err();
    assert!(matches!(err, TransferError::ConnectionLost), "got {err:?}");
    let committed = progress.borrow().bytes_transferred;
    assert!(committed < data.len() as u64);

    // Second connection: pick up where the receiver stopped.
    let second = Connection::fast(store.provider());
    let transfer = second
        .client
        .resume(transfer_id, 8, Resource::sink(sink.clone()), committed)
        .await?;
    assert_eq!(done_bytes(finish(transfer).await)?, data.len() as u64);
    assert_eq!(digest(&sink.contents()), digest(&data));
    Ok(())
}
