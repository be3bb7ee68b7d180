use crate::*;

use spool_transfer::SessionState;

// ── Clean link ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn read_round_trip() -> Result<()> {
    let store = MemoryStore::new();
    let data = payload(256 * 1024, 1);
    store.add_source(10, data.clone());
    let conn = Connection::fast(store.provider());

    let sink = MemorySink::new();
    let transfer = conn.client.open_read(10, sink.clone(), 0).await?;
    let progress = transfer.watch_progress();
    let bytes = done_bytes(finish(transfer).await)?;

    assert_eq!(bytes, data.len() as u64);
    assert_eq!(digest(&sink.contents()), digest(&data));

    let last = progress.borrow().clone();
    assert_eq!(last.state, SessionState::Done);
    assert_eq!(last.bytes_transferred, data.len() as u64);
    assert_eq!(last.total_bytes, Some(data.len() as u64));
    Ok(())
}

#[tokio::test]
async fn write_round_trip() -> Result<()> {
    let store = MemoryStore::new();
    let uploaded = store.add_sink(20);
    let conn = Connection::fast(store.provider());

    let data = payload(100_000, 2);
    let transfer = conn.client.open_write(20, MemorySource::new(data.clone())).await?;
    let bytes = done_bytes(finish(transfer).await)?;

    assert_eq!(bytes, data.len() as u64);
    // The receiver flushes before it acknowledges, so the sink is complete.
    assert_eq!(uploaded.contents(), data.to_vec());
    Ok(())
}

#[tokio::test]
async fn empty_resource_completes() -> Result<()> {
    let store = MemoryStore::new();
    store.add_source(1, Bytes::new());
    let conn = Connection::fast(store.provider());

    let sink = MemorySink::new();
    let transfer = conn.client.open_read(1, sink.clone(), 0).await?;
    assert_eq!(done_bytes(finish(transfer).await)?, 0);
    assert!(sink.contents().is_empty());
    Ok(())
}

#[tokio::test]
async fn unknown_length_read_finishes_on_status() -> Result<()> {
    let store = MemoryStore::new();
    let data = payload(10_000, 3);
    store.add_unsized_source(5, data.clone());

    let saw_remaining = Arc::new(AtomicUsize::new(0));
    let seen = saw_remaining.clone();
    let faults = LinkFaults::filtered(move |frame, chunk| {
        if frame.from_server && chunk.remaining_bytes.is_some() {
            seen.fetch_add(1, Ordering::SeqCst);
        }
        false
    });
    let conn = Connection::open(fast_config(), fast_config(), Some(store.provider()), faults);

    let sink = MemorySink::new();
    let transfer = conn.client.open_read(5, sink.clone(), 0).await?;
    assert_eq!(done_bytes(finish(transfer).await)?, 10_000);
    assert_eq!(sink.contents(), data.to_vec());
    assert_eq!(saw_remaining.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn transfers_share_a_connection() -> Result<()> {
    let store = MemoryStore::new();
    let conn = Connection::fast(store.provider());

    let mut running = Vec::new();
    for id in 0..4u32 {
        let data = payload(64 * 1024 + id as usize * 1000, 100 + u64::from(id));
        store.add_source(id, data.clone());
        let sink = MemorySink::new();
        let transfer = conn.client.open_read(id, sink.clone(), 0).await?;
        running.push((transfer, sink, data));
    }

    let ids: Vec<u32> = running.iter().map(|(t, _, _)| t.transfer_id()).collect();
    let mut unique = ids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), ids.len(), "transfer ids must be distinct");

    for (transfer, sink, data) in running {
        done_bytes(finish(transfer).await)?;
        assert_eq!(digest(&sink.contents()), digest(&data));
    }
    Ok(())
}

#[tokio::test]
async fn reads_and_writes_in_both_directions() -> Result<()> {
    // Each side serves the other: the server engine also opens transfers.
    let client_store = MemoryStore::new();
    let server_store = MemoryStore::new();
    let down = payload(40_000, 7);
    let up = payload(30_000, 8);
    server_store.add_source(1, down.clone());
    let received_by_client = client_store.add_sink(2);

    let (client_end, server_end) = Transport::pair(64);
    let client = TransferEngine::new(fast_config(), client_end).with_provider(client_store.provider());
    let server = TransferEngine::new(fast_config(), server_end).with_provider(server_store.provider());
    let client_handle = client.handle();
    let server_handle = server.handle();
    tokio::spawn(client.run());
    tokio::spawn(server.run());

    let sink = MemorySink::new();
    let read = client_handle.open_read(1, sink.clone(), 0).await?;
    let push = server_handle.open_write(2, MemorySource::new(up.clone())).await?;

    done_bytes(finish(read).await)?;
    done_bytes(finish(push).await)?;
    assert_eq!(sink.contents(), down.to_vec());
    assert_eq!(received_by_client.contents(), up.to_vec());

    client_handle.shutdown();
    server_handle.shutdown();
    Ok(())
}

// ── Faulty link ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn read_survives_drops_duplicates_and_reordering() -> Result<()> {
    for seed in 1..=3u64 {
        let store = MemoryStore::new();
        let data = payload(200 * 1024, seed);
        store.add_source(1, data.clone());
        let conn = Connection::open(
            fast_config(),
            fast_config(),
            Some(store.provider()),
            LinkFaults::lossy(seed),
        );

        let sink = MemorySink::new();
        let transfer = conn.client.open_read(1, sink.clone(), 0).await?;
        let bytes = done_bytes(finish(transfer).await)
            .with_context(|| format!("seed {seed}"))?;
        assert_eq!(bytes, data.len() as u64, "seed {seed}");
        assert_eq!(digest(&sink.contents()), digest(&data), "seed {seed}");
    }
    Ok(())
}

#[tokio::test]
async fn write_survives_drops_duplicates_and_reordering() -> Result<()> {
    for seed in 11..=13u64 {
        let store = MemoryStore::new();
        let uploaded = store.add_sink(9);
        let conn = Connection::open(
            fast_config(),
            fast_config(),
            Some(store.provider()),
            LinkFaults::lossy(seed),
        );

        let data = payload(150 * 1024, seed);
        let transfer = conn.client.open_write(9, MemorySource::new(data.clone())).await?;
        done_bytes(finish(transfer).await).with_context(|| format!("seed {seed}"))?;
        assert_eq!(digest(&uploaded.contents()), digest(&data), "seed {seed}");
    }
    Ok(())
}

#[tokio::test]
async fn transmitter_never_exceeds_granted_window() -> Result<()> {
    let store = MemoryStore::new();
    let data = payload(64 * 1024, 4);
    store.add_source(1, data.clone());

    // Track the furthest window each grant allows and check every data chunk
    // against the furthest grant seen so far.
    let granted = Arc::new(Mutex::new(0u64));
    let overrun = Arc::new(AtomicUsize::new(0));
    let (g, o) = (granted.clone(), overrun.clone());
    let faults = LinkFaults::filtered(move |frame, chunk| {
        let mut granted = g.lock().unwrap();
        if !frame.from_server && chunk.status.is_none() {
            *granted = (*granted).max(chunk.effective_window_end());
        } else if frame.from_server && !chunk.data.is_empty() && chunk.end_offset() > *granted {
            o.fetch_add(1, Ordering::SeqCst);
        }
        false
    });
    let conn = Connection::open(fast_config(), fast_config(), Some(store.provider()), faults);

    let sink = MemorySink::new();
    let transfer = conn.client.open_read(1, sink.clone(), 0).await?;
    done_bytes(finish(transfer).await)?;
    assert_eq!(overrun.load(Ordering::SeqCst), 0);
    assert_eq!(sink.contents(), data.to_vec());
    Ok(())
}
