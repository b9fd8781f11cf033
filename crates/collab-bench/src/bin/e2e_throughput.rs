//! End-to-end throughput benchmark for collabd.
//!
//! Joins N clients to one project over real TCP connections and has each of
//! them publish as fast as the server acknowledges. Every client must be able
//! to log in: register uids `1..=N` with publish and subscribe masks in
//! `collab.toml` before running.
//!
//! ```bash
//! e2e_throughput [clients] [addr]
//! ```

use bytes::BytesMut;
use collab_bench::sample_payload;
use collab_protocol::{codec, Frame, FrameDecoder, MessageKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Barrier;

const DEFAULT_ADDR: &str = "127.0.0.1:7420";
const PROJECT: u32 = 1;
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;
/// Updates a client may have in flight before waiting for acks.
const WINDOW: u64 = 32;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Default)]
struct Counters {
    acks: AtomicU64,
    forwarded: AtomicU64,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(8);
    let addr = args.get(2).cloned().unwrap_or_else(|| DEFAULT_ADDR.to_string());

    println!("collab end-to-end throughput");
    println!("  server:  {addr}");
    println!("  clients: {num_clients} (uids 1..={num_clients}, project {PROJECT})");
    println!("  warmup {WARMUP_SECS}s, measure {BENCH_SECS}s");
    println!();

    let counters = Arc::new(Counters::default());
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();
    for uid in 1..=num_clients as u32 {
        let counters = Arc::clone(&counters);
        let barrier = Arc::clone(&barrier);
        let addr = addr.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(&addr, uid, counters, barrier).await {
                eprintln!("client {uid}: {e}");
            }
        }));
    }

    barrier.wait().await;
    println!("all {num_clients} clients joined");

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;
    counters.acks.store(0, Ordering::SeqCst);
    counters.forwarded.store(0, Ordering::SeqCst);
    let start = Instant::now();

    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed().as_secs_f64();
    let acks = counters.acks.load(Ordering::SeqCst);
    let forwarded = counters.forwarded.load(Ordering::SeqCst);

    println!();
    println!("results");
    println!("  duration:        {elapsed:>12.2}s");
    println!("  updates acked:   {acks:>12} ({:.0}/s)", acks as f64 / elapsed);
    println!(
        "  updates received:{forwarded:>12} ({:.0}/s)",
        forwarded as f64 / elapsed
    );

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    addr: &str,
    uid: u32,
    counters: Arc<Counters>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let mut decoder = FrameDecoder::default();

    stream.write_all(&codec::encode(&Frame::join(uid, PROJECT))?).await?;
    match next_frame(&mut stream, &mut decoder).await? {
        Frame::Joined { .. } => {}
        other => return Err(format!("join refused: {other:?}").into()),
    }

    barrier.wait().await;

    let update = codec::encode(&Frame::update("rename", sample_payload(4).into_map()))?;
    let mut batch = BytesMut::with_capacity(update.len() * WINDOW as usize);
    let mut in_flight = 0u64;

    loop {
        while in_flight < WINDOW {
            batch.extend_from_slice(&update);
            in_flight += 1;
        }
        if !batch.is_empty() {
            stream.write_all(&batch).await?;
            batch.clear();
        }

        match next_frame(&mut stream, &mut decoder).await? {
            Frame::Message {
                kind: MessageKind::AckUpdateId,
                ..
            } => {
                in_flight -= 1;
                counters.acks.fetch_add(1, Ordering::Relaxed);
            }
            Frame::Message {
                kind: MessageKind::Shutdown,
                ..
            } => return Ok(()),
            Frame::Update { .. } => {
                counters.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Frame::Error { code, message } => {
                return Err(format!("server error {code}: {message}").into());
            }
            _ => {}
        }
    }
}

async fn next_frame(stream: &mut TcpStream, decoder: &mut FrameDecoder) -> Result<Frame, BoxError> {
    loop {
        if let Some(frame) = decoder.next_frame()? {
            return Ok(frame);
        }
        if stream.read_buf(decoder.buffer_mut()).await? == 0 {
            return Err("server closed the connection".into());
        }
    }
}
