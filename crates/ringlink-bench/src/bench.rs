//! Benchmark drivers, generic over the transport backend.
//!
//! Bandwidth: the server streams a pseudo-random buffer in fixed-size chunks once
//! per chunk size and the client reads it back in the same chunks and verifies it.
//! Ping-pong: the client sends the 64-byte message, the server echoes it and the
//! client checks every echo. The sending side times the run.

use anyhow::{Context, Result};
use ringlink_transport::integrity::{pattern, ping_message, verify};
use ringlink_transport::{Transport, TransportClient, TransportConfig, TransportServer};
use serde::Serialize;
use std::time::Instant;

use crate::cpu::{self, CpuUsage};
use crate::size::format_size;

/// What to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Bandwidth,
    PingPong,
}

/// Parameters both ends must agree on.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchPlan {
    pub mode: Mode,
    /// Bytes streamed per chunk size.
    pub data_size: usize,
    /// Chunk sizes of the bandwidth sweep, in order.
    pub chunk_sizes: Vec<usize>,
    /// Round trips of the ping-pong run.
    pub messages: usize,
    /// Seed of the streamed data.
    pub seed: u64,
}

/// One timed run.
#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    pub backend: String,
    pub mode: Mode,
    /// Chunk size for bandwidth runs, message size for ping-pong.
    pub chunk_size: usize,
    pub bytes: usize,
    pub messages: usize,
    pub seconds: f64,
    pub cpu: Option<CpuUsage>,
}

impl Measurement {
    pub fn megabytes_per_second(&self) -> f64 {
        if self.seconds > 0.0 {
            self.bytes as f64 / 1e6 / self.seconds
        } else {
            0.0
        }
    }

    pub fn messages_per_second(&self) -> f64 {
        if self.seconds > 0.0 {
            self.messages as f64 / self.seconds
        } else {
            0.0
        }
    }

    /// Column names of [`Measurement::csv_row`].
    pub fn csv_header() -> &'static str {
        "backend, mode, chunk size, MB transmitted, time, MB/s, msg/s, user, system, total"
    }

    pub fn csv_row(&self) -> String {
        let cpu = self.cpu.unwrap_or_default();
        format!(
            "{}, {}, {}, {:.3}, {:.6}, {:.3}, {:.1}, {:.2}, {:.2}, {:.2}",
            self.backend,
            match self.mode {
                Mode::Bandwidth => "bandwidth",
                Mode::PingPong => "ping-pong",
            },
            format_size(self.chunk_size),
            self.bytes as f64 / 1e6,
            self.seconds,
            self.megabytes_per_second(),
            self.messages_per_second(),
            cpu.user_pct,
            cpu.system_pct,
            cpu.total_pct,
        )
    }
}

/// Times `work`, sampling CPU usage around it when `/proc` is readable.
async fn timed<Fut>(work: Fut) -> Result<(f64, Option<CpuUsage>)>
where
    Fut: std::future::Future<Output = Result<()>>,
{
    let before = cpu::sample().ok();
    let start = Instant::now();
    work.await?;
    let seconds = start.elapsed().as_secs_f64();
    let usage = match (before, cpu::sample().ok()) {
        (Some(before), Some(after)) => Some(CpuUsage::between(&before, &after)),
        _ => None,
    };
    Ok((seconds, usage))
}

/// Writes `data` in `chunk`-byte pieces.
pub async fn send_chunked<T: Transport>(
    transport: &mut T,
    data: &[u8],
    chunk: usize,
) -> Result<()> {
    for piece in data.chunks(chunk) {
        transport.write(piece).await?;
    }
    Ok(())
}

/// Reads `expected.len()` bytes in `chunk`-byte pieces and checks them.
pub async fn receive_chunked<T: Transport>(
    transport: &mut T,
    expected: &[u8],
    chunk: usize,
) -> Result<()> {
    let mut buf = vec![0u8; chunk.min(expected.len()).max(1)];
    for (i, want) in expected.chunks(chunk).enumerate() {
        let got = &mut buf[..want.len()];
        transport.read(got).await?;
        verify(want, got).with_context(|| format!("chunk {i} of {} bytes", want.len()))?;
    }
    Ok(())
}

/// Echoes `messages` 64-byte messages.
pub async fn echo<T: Transport>(transport: &mut T, messages: usize) -> Result<()> {
    let mut buf = [0u8; 64];
    for _ in 0..messages {
        transport.read(&mut buf).await?;
        transport.write(&buf).await?;
    }
    Ok(())
}

/// Sends `messages` ping messages and verifies every echo.
pub async fn ping<T: Transport>(transport: &mut T, messages: usize) -> Result<()> {
    let message = ping_message();
    let mut buf = [0u8; 64];
    for i in 0..messages {
        transport.write(&message).await?;
        transport.read(&mut buf).await?;
        verify(&message, &buf).with_context(|| format!("echo {i}"))?;
    }
    Ok(())
}

/// The server's half of a plan on an accepted connection.
pub async fn serve<T: Transport>(
    transport: &mut T,
    backend: &str,
    plan: &BenchPlan,
) -> Result<Vec<Measurement>> {
    match plan.mode {
        Mode::Bandwidth => {
            let data = pattern(plan.data_size, plan.seed);
            let mut results = Vec::with_capacity(plan.chunk_sizes.len());
            for &chunk in &plan.chunk_sizes {
                let (seconds, cpu) = timed(send_chunked(transport, &data, chunk)).await?;
                let m = Measurement {
                    backend: backend.to_string(),
                    mode: plan.mode,
                    chunk_size: chunk,
                    bytes: data.len(),
                    messages: data.len().div_ceil(chunk),
                    seconds,
                    cpu,
                };
                tracing::info!(
                    backend,
                    chunk,
                    mb_per_s = m.megabytes_per_second(),
                    "bandwidth run done"
                );
                results.push(m);
            }
            Ok(results)
        }
        Mode::PingPong => {
            echo(transport, plan.messages).await?;
            Ok(Vec::new())
        }
    }
}

/// The client's half of a plan on a connected transport.
pub async fn drive<T: Transport>(
    transport: &mut T,
    backend: &str,
    plan: &BenchPlan,
) -> Result<Vec<Measurement>> {
    match plan.mode {
        Mode::Bandwidth => {
            let expected = pattern(plan.data_size, plan.seed);
            for &chunk in &plan.chunk_sizes {
                receive_chunked(transport, &expected, chunk).await?;
                tracing::debug!(backend, chunk, "bandwidth run verified");
            }
            Ok(Vec::new())
        }
        Mode::PingPong => {
            let (seconds, cpu) = timed(ping(transport, plan.messages)).await?;
            let m = Measurement {
                backend: backend.to_string(),
                mode: plan.mode,
                chunk_size: 64,
                bytes: 64 * plan.messages,
                messages: plan.messages,
                seconds,
                cpu,
            };
            tracing::info!(backend, msg_per_s = m.messages_per_second(), "ping-pong run done");
            Ok(vec![m])
        }
    }
}

/// Binds, accepts one client and runs the server's half.
pub async fn run_server<S: TransportServer>(
    backend: &str,
    addr: &str,
    config: TransportConfig,
    plan: &BenchPlan,
) -> Result<Vec<Measurement>> {
    let mut server = S::bind(addr, config)
        .await
        .with_context(|| format!("binding {backend} server to {addr}"))?;
    tracing::info!(backend, addr = %server.local_addr()?, "waiting for client");
    server.accept().await.context("accepting client")?;
    serve(&mut server, backend, plan).await
}

/// Connects to a server and runs the client's half.
pub async fn run_client<C: TransportClient>(
    backend: &str,
    addr: &str,
    config: TransportConfig,
    plan: &BenchPlan,
) -> Result<Vec<Measurement>> {
    let mut client = C::new(config);
    client
        .connect(addr)
        .await
        .with_context(|| format!("connecting {backend} client to {addr}"))?;
    drive(&mut client, backend, plan).await
}

/// Runs both halves in this process, the client on its own task.
pub async fn run_loopback<S, C>(
    backend: &str,
    addr: &str,
    config: TransportConfig,
    plan: &BenchPlan,
) -> Result<Vec<Measurement>>
where
    S: TransportServer + 'static,
    C: TransportClient + 'static,
{
    let mut server = S::bind(addr, config.clone())
        .await
        .with_context(|| format!("binding {backend} server to {addr}"))?;
    let addr = server.local_addr()?;

    let client_backend = backend.to_string();
    let client_plan = plan.clone();
    let client = tokio::spawn(async move {
        run_client::<C>(&client_backend, &addr, config, &client_plan).await
    });

    server.accept().await.context("accepting client")?;
    let mut results = serve(&mut server, backend, plan).await?;
    results.extend(client.await.context("client task panicked")??);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringlink_transport::channel::ChannelConfig;
    use ringlink_transport::config::ShmConfig;
    use ringlink_transport::{
        RdmaClient, RdmaServer, ShmClient, ShmServer, TcpClient, TcpServer, TransportError,
    };

    fn plan(mode: Mode) -> BenchPlan {
        BenchPlan {
            mode,
            data_size: 256 * 1024,
            chunk_sizes: vec![1024, 64 * 1024],
            messages: 50,
            seed: 11,
        }
    }

    fn config() -> TransportConfig {
        TransportConfig {
            channel: ChannelConfig {
                spin_timeout_ms: Some(10_000),
                ..ChannelConfig::with_capacity(64 * 1024)
            },
            shm: ShmConfig {
                capacity: 64 * 1024,
                spin_timeout_ms: Some(10_000),
            },
            ..TransportConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bandwidth_loopback_tcp() {
        let plan = plan(Mode::Bandwidth);
        let results = run_loopback::<TcpServer, TcpClient>("tcp", "127.0.0.1:0", config(), &plan)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_size, 1024);
        assert_eq!(results[0].messages, 256);
        assert_eq!(results[1].bytes, 256 * 1024);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bandwidth_loopback_rdma() {
        let plan = plan(Mode::Bandwidth);
        let results = run_loopback::<RdmaServer, RdmaClient>("rdma", "127.0.0.1:0", config(), &plan)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|m| m.seconds > 0.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ping_pong_loopback_shm() {
        let addr = format!("bench-test/{}/ping", std::process::id());
        let plan = plan(Mode::PingPong);
        let results = run_loopback::<ShmServer, ShmClient>("shm", &addr, config(), &plan)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].messages, 50);
        assert_eq!(results[0].chunk_size, 64);
    }

    #[tokio::test]
    async fn test_wrong_data_is_an_integrity_mismatch() {
        let mut server = TcpServer::bind("127.0.0.1:0", config()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let mut client = TcpClient::new(config());
        let (accepted, connected) = tokio::join!(server.accept(), client.connect(&addr));
        accepted.unwrap();
        connected.unwrap();

        let sent = pattern(4096, 1);
        let expected = pattern(4096, 2);
        let (sent_ok, received) = tokio::join!(
            send_chunked(&mut server, &sent, 512),
            receive_chunked(&mut client, &expected, 512)
        );
        sent_ok.unwrap();
        let err = received.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransportError>(),
            Some(TransportError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn test_csv_row() {
        let m = Measurement {
            backend: "tcp".to_string(),
            mode: Mode::Bandwidth,
            chunk_size: 4096,
            bytes: 2_000_000,
            messages: 489,
            seconds: 0.5,
            cpu: None,
        };
        assert_eq!(m.megabytes_per_second(), 4.0);
        let row = m.csv_row();
        assert!(row.starts_with("tcp, bandwidth, 4K, 2.000, 0.500000, 4.000"));
        assert_eq!(
            row.split(", ").count(),
            Measurement::csv_header().split(", ").count()
        );
    }
}
