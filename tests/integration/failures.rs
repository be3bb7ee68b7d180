use crate::*;

use bytes::BytesMut;
use spool_core::wire::{ChunkType, Method, Status};

fn aborted_with(outcome: Result<Completion, TransferError>, status: Status) {
    match outcome {
        Err(TransferError::RemoteAborted(s)) => assert_eq!(s, status),
        other => panic!("expected remote abort with {status}, got {other:?}"),
    }
}

// ── Refusals ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_resource_is_not_found() -> Result<()> {
    let conn = Connection::fast(MemoryStore::new().provider());
    let transfer = conn.client.open_read(99, MemorySink::new(), 0).await?;
    aborted_with(finish(transfer).await, Status::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn peer_without_resources_is_unimplemented() -> Result<()> {
    let conn = Connection::open(fast_config(), fast_config(), None, LinkFaults::clean());
    let transfer = conn.client.open_read(1, MemorySink::new(), 0).await?;
    aborted_with(finish(transfer).await, Status::UNIMPLEMENTED);
    Ok(())
}

#[tokio::test]
async fn busy_peer_is_resource_exhausted() -> Result<()> {
    let store = MemoryStore::new().with_read_delay(Duration::from_millis(5));
    store.add_source(1, payload(256 * 1024, 31));
    store.add_source(2, payload(1024, 32));
    let mut server = fast_config();
    server.max_concurrent_transfers = 1;
    let conn = Connection::open(fast_config(), server, Some(store.provider()), LinkFaults::clean());

    let first = conn.client.open_read(1, MemorySink::new(), 0).await?;
    let progress = first.watch_progress();
    assert!(eventually(|| progress.borrow().bytes_transferred > 0).await);

    let second = conn.client.open_read(2, MemorySink::new(), 0).await?;
    aborted_with(finish(second).await, Status::RESOURCE_EXHAUSTED);

    first.cancel();
    assert_eq!(finish(first).await?, Completion::Cancelled);
    Ok(())
}

#[tokio::test]
async fn local_limit_refuses_new_transfers() -> Result<()> {
    let store = MemoryStore::new().with_read_delay(Duration::from_millis(5));
    store.add_source(1, payload(256 * 1024, 33));
    let mut client = fast_config();
    client.max_concurrent_transfers = 2;
    let conn = Connection::open(client, fast_config(), Some(store.provider()), LinkFaults::clean());

    let a = conn.client.open_read(1, MemorySink::new(), 0).await?;
    let b = conn.client.open_read(1, MemorySink::new(), 0).await?;
    let err = conn.client.open_read(1, MemorySink::new(), 0).await.unwrap_err();
    assert!(matches!(err, TransferError::TooManyConcurrentTransfers(2)));

    a.cancel();
    b.cancel();
    assert_eq!(finish(a).await?, Completion::Cancelled);
    assert_eq!(finish(b).await?, Completion::Cancelled);
    Ok(())
}

// ── Cancellation ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_mid_transfer_tells_the_peer() -> Result<()> {
    let store = MemoryStore::new().with_read_delay(Duration::from_millis(5));
    store.add_source(1, payload(512 * 1024, 34));

    let cancelled_seen = Arc::new(AtomicUsize::new(0));
    let seen = cancelled_seen.clone();
    let faults = LinkFaults::filtered(move |frame, chunk| {
        if !frame.from_server && chunk.status == Some(Status::CANCELLED) {
            seen.fetch_add(1, Ordering::SeqCst);
        }
        false
    });
    let conn = Connection::open(fast_config(), fast_config(), Some(store.provider()), faults);

    let sink = MemorySink::new();
    let transfer = conn.client.open_read(1, sink.clone(), 0).await?;
    let progress = transfer.watch_progress();
    assert!(eventually(|| progress.borrow().bytes_transferred >= 4096).await);

    transfer.cancel();
    transfer.cancel();
    assert_eq!(finish(transfer).await?, Completion::Cancelled);
    assert!(eventually(|| cancelled_seen.load(Ordering::SeqCst) >= 1).await);

    // Committed bytes stay committed.
    let committed = progress.borrow().bytes_transferred;
    assert!(committed >= 4096);
    Ok(())
}

#[tokio::test]
async fn cancel_before_the_peer_answers() -> Result<()> {
    let conn = Connection::open(
        fast_config(),
        fast_config(),
        Some(MemoryStore::new().provider()),
        LinkFaults::filtered(|_, _| true),
    );
    let transfer = conn.client.open_read(1, MemorySink::new(), 0).await?;
    conn.client.cancel(transfer.transfer_id());
    assert_eq!(finish(transfer).await?, Completion::Cancelled);
    Ok(())
}

// ── Timeouts and lost links ───────────────────────────────────────────────────

#[tokio::test]
async fn silent_peer_times_out() -> Result<()> {
    let mut client = fast_config();
    client.session.retry.timeout = Duration::from_millis(50);
    client.session.retry.max_retries = 2;
    let requests = Arc::new(AtomicUsize::new(0));
    let seen = requests.clone();
    let faults = LinkFaults::filtered(move |frame, chunk| {
        if !frame.from_server && chunk.kind() == ChunkType::Start {
            seen.fetch_add(1, Ordering::SeqCst);
        }
        true
    });
    let conn = Connection::open(client, fast_config(), None, faults);

    let transfer = conn.client.open_read(1, MemorySink::new(), 0).await?;
    let err = finish(transfer).await.unwrap_err();
    assert!(matches!(err, TransferError::Timeout { attempts: 2 }), "got {err:?}");
    assert_eq!(err.status(), Status::DEADLINE_EXCEEDED);
    // The initial START plus one per retry.
    assert_eq!(requests.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn lost_link_fails_write_with_connection_lost() -> Result<()> {
    let store = MemoryStore::new();
    store.add_sink(1);
    let conn = Connection::fast(store.provider());

    // A slow source keeps the transfer open long enough to cut the link.
    let transfer = conn
        .client
        .open_write(1, SlowSource::new(payload(256 * 1024, 35)))
        .await?;
    let progress = transfer.watch_progress();
    assert!(eventually(|| progress.borrow().bytes_transferred > 0).await);
    conn.cut();
    let err = finish(transfer).await.unwrap_err();
    assert!(matches!(err, TransferError::ConnectionLost), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn failing_sink_aborts_the_transmitter() -> Result<()> {
    let conn = Connection::open(
        fast_config(),
        fast_config(),
        Some(Arc::new(BrokenDisk)),
        LinkFaults::clean(),
    );
    let transfer = conn
        .client
        .open_write(1, MemorySource::new(payload(32 * 1024, 36)))
        .await?;
    aborted_with(finish(transfer).await, Status::DATA_LOSS);
    Ok(())
}

struct SlowSource(MemorySource);

impl SlowSource {
    fn new(data: Bytes) -> Self {
        Self(MemorySource::new(data))
    }
}

impl ResourceSource for SlowSource {
    fn read(&mut self, offset: u64, max_len: usize) -> io::Result<Bytes> {
        std::thread::sleep(Duration::from_millis(5));
        self.0.read(offset, max_len)
    }

    fn len(&self) -> Option<u64> {
        self.0.len()
    }
}

struct BrokenDisk;

struct BrokenSink;

impl ResourceSink for BrokenSink {
    fn write(&mut self, _offset: u64, _data: &[u8]) -> io::Result<()> {
        Err(io::Error::other("disk on fire"))
    }
}

impl ResourceProvider for BrokenDisk {
    fn open_source(
        &self,
        resource_id: u32,
        _offset: u64,
    ) -> Result<Box<dyn ResourceSource>, TransferError> {
        Err(TransferError::ResourceNotFound(resource_id))
    }

    fn open_sink(
        &self,
        _resource_id: u32,
        _offset: u64,
    ) -> Result<Box<dyn ResourceSink>, TransferError> {
        Ok(Box::new(BrokenSink))
    }
}

// ── Raw wire peer ─────────────────────────────────────────────────────────────

/// A server engine with a test-controlled peer speaking raw frames.
fn raw_server(store: &MemoryStore) -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>, EngineHandle) {
    let (peer, server_end) = Transport::pair(64);
    let engine = TransferEngine::new(fast_config(), server_end).with_provider(store.provider());
    let handle = engine.handle();
    tokio::spawn(engine.run());
    let (tx, rx) = peer.into_channels();
    (tx, rx, handle)
}

fn client_frame(method: Method, payload: Bytes) -> Frame {
    Frame {
        method,
        from_server: false,
        payload,
    }
}

async fn next_chunk(rx: &mut mpsc::Receiver<Frame>) -> Chunk {
    let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("server should answer")
        .expect("server still running");
    assert!(frame.from_server);
    Chunk::decode(frame.payload).expect("server sends valid chunks")
}

#[tokio::test]
async fn server_survives_garbage_and_serves_start() -> Result<()> {
    let store = MemoryStore::new();
    let data = payload(3000, 37);
    store.add_source(1, data.clone());
    let (tx, mut rx, server) = raw_server(&store);

    tx.send(client_frame(Method::Read, Bytes::from_static(&[0xFF, 0xFF, 0xFF]))).await?;

    let start = Chunk {
        transfer_id: 5,
        chunk_type: Some(ChunkType::Start),
        resource_id: Some(1),
        pending_bytes: Some(8192),
        max_chunk_size_bytes: Some(1024),
        window_end_offset: 8192,
        ..Chunk::default()
    };
    tx.send(client_frame(Method::Read, start.encode())).await?;

    let mut received = BytesMut::new();
    loop {
        let chunk = next_chunk(&mut rx).await;
        assert_eq!(chunk.transfer_id, 5);
        assert_eq!(chunk.offset, received.len() as u64);
        assert!(chunk.data.len() <= 1024);
        received.extend_from_slice(&chunk.data);
        if chunk.is_final() {
            break;
        }
    }
    assert_eq!(&received[..], &data[..]);

    let ack = Chunk {
        transfer_id: 5,
        offset: data.len() as u64,
        status: Some(Status::OK),
        ..Chunk::default()
    };
    tx.send(client_frame(Method::Read, ack.encode())).await?;
    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn unknown_chunk_type_is_read_as_data() -> Result<()> {
    let store = MemoryStore::new();
    let (tx, mut rx, server) = raw_server(&store);

    // Field 10 (type) set to 9, which no peer defines yet.
    let mut payload = BytesMut::from(&Chunk { transfer_id: 9, ..Chunk::default() }.encode()[..]);
    payload.extend_from_slice(&[0x50, 0x09]);
    tx.send(client_frame(Method::Write, payload.freeze())).await?;

    // As a data chunk for a transfer nobody opened, it is refused.
    let reply = next_chunk(&mut rx).await;
    assert_eq!(reply.transfer_id, 9);
    assert_eq!(reply.status, Some(Status::NOT_FOUND));
    assert_eq!(store.opened(), 0);
    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn status_chunks_for_unknown_transfers_are_ignored() -> Result<()> {
    let store = MemoryStore::new();
    let (tx, mut rx, server) = raw_server(&store);

    let stray = Chunk {
        transfer_id: 12,
        status: Some(Status::CANCELLED),
        ..Chunk::default()
    };
    tx.send(client_frame(Method::Read, stray.encode())).await?;
    let quiet = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(quiet.is_err(), "no reply expected");
    assert_eq!(store.opened(), 0);
    server.shutdown();
    Ok(())
}

#[tokio::test]
async fn opening_chunk_with_overflowing_window_is_invalid() -> Result<()> {
    let store = MemoryStore::new();
    store.add_source(1, payload(1024, 38));
    let (tx, mut rx, server) = raw_server(&store);

    let start = Chunk {
        transfer_id: 6,
        chunk_type: Some(ChunkType::Start),
        resource_id: Some(1),
        offset: u64::MAX,
        pending_bytes: Some(10),
        ..Chunk::default()
    };
    tx.send(client_frame(Method::Read, start.encode())).await?;

    let reply = next_chunk(&mut rx).await;
    assert_eq!(reply.transfer_id, 6);
    assert_eq!(reply.status, Some(Status::INVALID_ARGUMENT));
    assert_eq!(store.opened(), 0);
    server.shutdown();
    Ok(())
}
