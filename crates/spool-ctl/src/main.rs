//! spool-ctl: command-line client for spoold.

use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use spool_core::SpoolConfig;
use spool_transfer::{
    Completion, EngineConfig, EngineHandle, FileSink, FileSource, SessionState, TransferEngine,
    TransferHandle, TransferProgress, Transport,
};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

// ── Connection ────────────────────────────────────────────────────────────────

async fn connect(addr: &str, shutdown: CancellationToken) -> Result<EngineHandle> {
    let config = SpoolConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SpoolConfig::default()
    });
    config.validate().context("invalid configuration")?;
    let engine_config = EngineConfig::from(&config);

    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to spoold at {addr} — is it running?"))?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let transport =
        Transport::spawn_stream(reader, writer, engine_config.outbound_queue, shutdown.clone());
    let engine = TransferEngine::new(engine_config, transport).with_shutdown(shutdown);
    let handle = engine.handle();
    tokio::spawn(engine.run());
    Ok(handle)
}

/// Print progress until the transfer ends, cancelling it on Ctrl-C.
async fn follow(engine: &EngineHandle, transfer: TransferHandle, json: bool) -> Result<Completion> {
    let transfer_id = transfer.transfer_id();
    let mut progress = transfer.watch_progress();
    let printer = tokio::spawn(async move {
        let mut last_print: Option<Instant> = None;
        while progress.changed().await.is_ok() {
            let p = progress.borrow_and_update().clone();
            let due = last_print.map_or(true, |t| t.elapsed() >= PROGRESS_INTERVAL);
            if json {
                if let Ok(line) = serde_json::to_string(&p) {
                    println!("{line}");
                }
            } else if due || p.state.is_terminal() {
                print_progress(&p);
                last_print = Some(Instant::now());
            }
        }
        if !json {
            eprintln!();
        }
    });

    let interrupt = {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupted, cancelling transfer {transfer_id}");
                engine.cancel(transfer_id);
            }
        })
    };

    let outcome = transfer.result().await;
    interrupt.abort();
    let _ = printer.await;
    outcome.with_context(|| format!("transfer {transfer_id} failed"))
}

fn print_progress(p: &TransferProgress) {
    let state = match p.state {
        SessionState::Init => "opening",
        SessionState::Handshake => "handshake",
        SessionState::Active => "active",
        SessionState::Retransmitting => "retransmitting",
        SessionState::Completing => "completing",
        SessionState::Done => "done",
        SessionState::Failed => "failed",
    };
    match p.total_bytes {
        Some(total) if total > 0 => {
            let pct = p.bytes_transferred as f64 * 100.0 / total as f64;
            eprint!("\r  {:>12} / {} bytes ({pct:5.1}%)  {state:<14}", p.bytes_transferred, total);
        }
        _ => eprint!("\r  {:>12} bytes  {state:<14}", p.bytes_transferred),
    }
}

fn file_digest(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

fn report(outcome: Completion, path: &Path) -> Result<()> {
    match outcome {
        Completion::Done { bytes } => {
            println!("  transferred : {bytes} bytes");
            println!("  blake3      : {}", file_digest(path)?);
            Ok(())
        }
        Completion::Cancelled => bail!("transfer cancelled"),
    }
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn cmd_get(addr: &str, resource_id: u32, path: &Path, offset: u64, json: bool) -> Result<()> {
    let sink = if offset == 0 {
        FileSink::create(path)
    } else {
        FileSink::open_at(path, offset)
    }
    .with_context(|| format!("failed to open {} for writing", path.display()))?;

    let shutdown = CancellationToken::new();
    let engine = connect(addr, shutdown.clone()).await?;
    let transfer = engine.open_read(resource_id, sink, offset).await?;
    let outcome = follow(&engine, transfer, json).await;
    shutdown.cancel();
    report(outcome?, path)
}

async fn cmd_put(addr: &str, resource_id: u32, path: &Path, json: bool) -> Result<()> {
    let source = FileSource::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    let shutdown = CancellationToken::new();
    let engine = connect(addr, shutdown.clone()).await?;
    let transfer = engine.open_write(resource_id, source).await?;
    let outcome = follow(&engine, transfer, json).await;
    shutdown.cancel();
    report(outcome?, path)
}

fn cmd_digest(path: &Path) -> Result<()> {
    println!("{}  {}", file_digest(path)?, path.display());
    Ok(())
}

fn print_usage() {
    println!("spool-ctl — Spool transfer client");
    println!();
    println!("Usage: spool-ctl <command> [options]");
    println!();
    println!("Commands:");
    println!("  get <addr> <resource-id> <path>   Download a resource into <path>");
    println!("  put <addr> <resource-id> <path>   Upload <path> to a writable resource");
    println!("  digest <path>                     Print the BLAKE3 digest of <path>");
    println!();
    println!("Options:");
    println!("  --offset <n>   Resume a download at byte <n> (get only)");
    println!("  --json         Print progress as JSON lines");
}

fn parse_id(s: &str) -> Result<u32> {
    s.parse()
        .with_context(|| format!("resource id must be a number, got {s:?}"))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut offset = 0u64;
    let mut json = false;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--offset" => {
                i += 1;
                offset = args
                    .get(i)
                    .context("--offset requires a value")?
                    .parse()
                    .context("--offset must be a number")?;
            }
            "--json" => json = true,
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["get", addr, id, path] => cmd_get(addr, parse_id(id)?, Path::new(path), offset, json).await,
        ["put", addr, id, path] => {
            if offset != 0 {
                bail!("--offset only applies to get");
            }
            cmd_put(addr, parse_id(id)?, Path::new(path), json).await
        }
        ["digest", path] => cmd_digest(Path::new(path)),
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
