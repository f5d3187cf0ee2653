//! End-to-end signaling benchmark for Tether.
//!
//! Pairs of clients seat themselves in a call and one side streams offers to
//! the other through a running server, with real network I/O.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_protocol::{codec, kinds, Envelope};
use tokio::net::TcpStream;
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";
const ACCOUNT: &str = "bench";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
type BenchResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_pairs = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(8);
    let url = std::env::var("TETHER_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Tether End-to-End Signaling Benchmark                ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Run the server with an account bench/bench registered:      ║");
    println!("║    [[accounts]] username = \"bench\" password = \"bench\"        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_signaling_benchmark(&url, num_pairs).await;
}

async fn run_signaling_benchmark(url: &str, num_pairs: usize) {
    println!("📊 Offer relay: {} caller/callee pairs against {}", num_pairs, url);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let delivered = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_pairs + 1));

    let mut handles = Vec::new();
    for pair in 0..num_pairs {
        let delivered = Arc::clone(&delivered);
        let barrier = Arc::clone(&barrier);
        let url = url.to_string();

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_pair(&url, pair, delivered, Arc::clone(&barrier)).await {
                eprintln!("Pair {} error: {}", pair, e);
                // Release the coordinator even when set-up failed.
                barrier.wait().await;
            }
        }));
    }

    barrier.wait().await;
    println!("✓ All {} pairs seated", num_pairs);

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    delivered.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = delivered.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Pairs:                {:>10}                           ║", num_pairs);
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!("║  Offers Delivered:     {:>10}                           ║", total);
    println!("║  Throughput:           {:>10.0} offers/s                 ║", per_sec);
    println!(
        "║  Per-Pair:             {:>10.0} offers/s                 ║",
        per_sec / num_pairs.max(1) as f64
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

/// A connected, logged-in client that issues requests one at a time.
struct Client {
    ws: Ws,
    next_id: u64,
}

impl Client {
    async fn login(url: &str) -> BenchResult<Self> {
        let (ws, _) = connect_async(url).await?;
        let mut client = Self { ws, next_id: 0 };
        client
            .request(
                kinds::AUTH_LOGIN,
                json!({"username": ACCOUNT, "password": ACCOUNT}),
            )
            .await?;
        Ok(client)
    }

    /// Send a request and wait for its reply, skipping pushes.
    async fn request(&mut self, kind: &str, body: Value) -> BenchResult<Value> {
        self.next_id += 1;
        let id = format!("r{}", self.next_id);
        let text = codec::encode(&Envelope::request(kind, id.as_str(), body))?;
        self.ws.send(Message::Text(text)).await?;

        while let Some(msg) = self.ws.next().await {
            let Message::Text(text) = msg? else {
                continue;
            };
            let envelope: Envelope = serde_json::from_str(&text)?;
            if envelope.reply_to.as_deref() != Some(id.as_str()) {
                continue;
            }
            if envelope.ok == Some(false) {
                return Err(format!("{} failed: {}", kind, envelope.body).into());
            }
            return Ok(envelope.body);
        }
        Err("connection closed".into())
    }

    fn split(self) -> (SplitSink<Ws, Message>, SplitStream<Ws>) {
        self.ws.split()
    }
}

fn field(body: &Value, pointer: &str) -> BenchResult<String> {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("reply is missing {}", pointer).into())
}

async fn run_pair(
    url: &str,
    pair: usize,
    delivered: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> BenchResult<()> {
    let mut caller = Client::login(url).await?;
    let hub = caller
        .request(kinds::HUB_CREATE, json!({"name": format!("bench-{}", pair)}))
        .await?;
    let hub_id = field(&hub, "/hub/hub_id")?;
    let channel = caller
        .request(
            kinds::CHANNEL_CREATE,
            json!({"hub_id": hub_id, "name": "calls", "private": false}),
        )
        .await?;
    let channel_id = field(&channel, "/channel/channel_id")?;
    let call = caller
        .request(kinds::RTC_CALL_CREATE, json!({"channel_id": channel_id}))
        .await?;
    let call_id = field(&call, "/call/call_id")?;
    caller
        .request(kinds::RTC_JOIN, json!({"call_id": call_id}))
        .await?;

    let mut callee = Client::login(url).await?;
    let seated = callee
        .request(kinds::RTC_JOIN, json!({"call_id": call_id}))
        .await?;
    let callee_peer = field(&seated, "/peer_id")?;

    barrier.wait().await;

    // Caller replies are read and dropped so the server never stalls on them.
    let (mut caller_tx, mut caller_rx) = caller.split();
    let reply_drain = tokio::spawn(async move { while caller_rx.next().await.is_some() {} });

    let (_callee_tx, mut callee_rx) = callee.split();
    let counter = Arc::clone(&delivered);
    let receiver = tokio::spawn(async move {
        while let Some(Ok(Message::Text(text))) = callee_rx.next().await {
            if text.contains(r#""t":"rtc.offer""#) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    let mut seq = 0u64;
    loop {
        seq += 1;
        let offer = Envelope::request(
            kinds::RTC_OFFER,
            format!("o{}", seq),
            json!({"call_id": call_id, "to_peer": callee_peer, "payload": {"sdp": "v=0\r\n"}}),
        );
        if caller_tx.send(Message::Text(codec::encode(&offer)?)).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    reply_drain.abort();
    receiver.abort();
    Ok(())
}
