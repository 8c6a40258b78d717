//! Traffic tools for exercising the fan-out path.
//!
//! `publish` sends hop-0 topic messages at a fixed rate. `subscribe` listens
//! where a subscriber pod would and reports delivery rate and latency once a
//! second. Latency is measured from the send time the publisher stamps into
//! every message, so both ends need reasonably synced clocks.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use hier_pubsub_common::message::{self, MIN_MESSAGE_LEN};
use hier_pubsub_common::{TopicHeader, MAX_TOPICS};

#[derive(Parser)]
#[command(name = "hier-pubsub-bench", about = "Publisher and subscriber for hier-pubsub")]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Send hop-0 messages for one topic.
    Publish {
        #[arg(long, default_value_t = 1)]
        topic: u32,
        /// Messages per second.
        #[arg(long, default_value_t = 1000)]
        rate: u32,
        /// Bytes after the Topic Header, send timestamp included.
        #[arg(long, default_value_t = 100)]
        payload: usize,
        /// Destination; the local node address at the node port.
        #[arg(long, default_value = "255.255.255.255:32000")]
        dst: SocketAddr,
        /// Stop after this many messages.
        #[arg(long)]
        count: Option<u64>,
    },
    /// Receive messages and report rate and latency.
    Subscribe {
        #[arg(long, env = "PS_UDP_PORT", default_value_t = 31001)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    match cli.command {
        Command::Publish {
            topic,
            rate,
            payload,
            dst,
            count,
        } => publish(topic, rate, payload, dst, count).await,
        Command::Subscribe { port } => {
            let socket = UdpSocket::bind(("0.0.0.0", port))
                .await
                .with_context(|| format!("binding UDP port {}", port))?;
            info!(port, "subscriber listening");
            subscribe(socket).await
        }
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

async fn publish(
    topic: u32,
    rate: u32,
    payload: usize,
    dst: SocketAddr,
    count: Option<u64>,
) -> Result<()> {
    if topic >= MAX_TOPICS {
        bail!("topic {} out of range (max {})", topic, MAX_TOPICS - 1);
    }
    if rate == 0 {
        bail!("rate must be > 0");
    }

    let mut msg = vec![0u8; TopicHeader::LEN + payload.max(MIN_MESSAGE_LEN - TopicHeader::LEN)];
    message::encode(&mut msg, topic, now_ns()).context("message buffer too short")?;

    let socket = UdpSocket::bind("0.0.0.0:0").await.context("binding UDP socket")?;
    socket.set_broadcast(true)?;
    socket
        .connect(dst)
        .await
        .with_context(|| format!("connecting to {}", dst))?;

    info!(topic, rate, bytes = msg.len(), dst = %dst, "publishing");

    let mut ticker = time::interval(Duration::from_secs(1) / rate);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    let mut sent = 0u64;
    let mut failed = 0u64;
    let report_every = u64::from(rate).max(1) * 10;
    while count.map_or(true, |c| sent + failed < c) {
        ticker.tick().await;
        message::stamp(&mut msg, now_ns()).context("message buffer too short")?;
        match socket.send(&msg).await {
            Ok(_) => sent += 1,
            Err(e) => {
                failed += 1;
                if failed == 1 {
                    warn!(error = %e, "send failed");
                }
            }
        }
        if sent > 0 && sent % report_every == 0 {
            info!(sent, failed, "publisher progress");
        }
    }

    info!(sent, failed, "publisher done");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// One second of observations.
#[derive(Default)]
struct Window {
    received: u64,
    malformed: u64,
    latencies_us: Vec<f64>,
    last_hop: Option<u16>,
}

impl Window {
    fn record(&mut self, datagram: &[u8], now_ns: u64) {
        match message::decode(datagram) {
            Some((hdr, sent_ns)) => {
                self.received += 1;
                self.last_hop = Some(hdr.hop);
                self.latencies_us
                    .push(now_ns.saturating_sub(sent_ns) as f64 / 1000.0);
            }
            None => self.malformed += 1,
        }
    }

    fn report(&mut self) {
        let p50 = quantile(&mut self.latencies_us, 0.50);
        let p99 = quantile(&mut self.latencies_us, 0.99);
        info!(
            received = self.received,
            malformed = self.malformed,
            p50_us = p50,
            p99_us = p99,
            hop = self.last_hop.map_or(-1, i32::from),
            "subscriber window"
        );
        *self = Window::default();
    }
}

async fn subscribe(socket: UdpSocket) -> Result<()> {
    let mut buf = vec![0u8; 65535];
    let mut window = Window::default();
    let mut ticker = time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            res = socket.recv_from(&mut buf) => {
                let (n, _) = res.context("receiving datagram")?;
                window.record(&buf[..n], now_ns());
            }
            _ = ticker.tick() => window.report(),
            _ = tokio::signal::ctrl_c() => {
                window.report();
                return Ok(());
            }
        }
    }
}

/// Nearest-rank quantile; 0 for an empty sample. Reorders `samples`.
fn quantile(samples: &mut [f64], q: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let rank = (q * samples.len() as f64).ceil() as usize;
    let idx = rank.clamp(1, samples.len()) - 1;
    let (_, v, _) = samples.select_nth_unstable_by(idx, f64::total_cmp);
    *v
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantile_nearest_rank() {
        let mut xs: Vec<f64> = (1..=100u32).rev().map(f64::from).collect();
        assert_eq!(quantile(&mut xs, 0.50), 50.0);
        assert_eq!(quantile(&mut xs, 0.99), 99.0);
        assert_eq!(quantile(&mut [7.0], 0.99), 7.0);
        assert_eq!(quantile(&mut Vec::new(), 0.5), 0.0);
    }

    #[test]
    fn test_window_counts_malformed() {
        let mut msg = [0u8; 32];
        message::encode(&mut msg, 3, 1_000_000).unwrap();

        let mut w = Window::default();
        w.record(&msg, 3_000_000);
        w.record(&msg[..10], 3_000_000);

        assert_eq!(w.received, 1);
        assert_eq!(w.malformed, 1);
        assert_eq!(w.latencies_us, vec![2000.0]);
        assert_eq!(w.last_hop, Some(0));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_socket() {
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dst = sink.local_addr().unwrap();

        publish(12, 1000, 24, dst, Some(3)).await.unwrap();

        let mut buf = [0u8; 128];
        for _ in 0..3 {
            let n = sink.recv(&mut buf).await.unwrap();
            assert_eq!(n, TopicHeader::LEN + 24);
            let (hdr, sent) = message::decode(&buf[..n]).unwrap();
            assert_eq!(hdr.topic_id, 12);
            assert_eq!(hdr.hop, 0);
            assert!(sent > 0);
        }
    }

    #[tokio::test]
    async fn test_publish_rejects_bad_topic() {
        let dst: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(publish(MAX_TOPICS, 10, 16, dst, Some(1)).await.is_err());
    }
}
