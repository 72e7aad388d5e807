use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ringlink_transport::fabric::SOFT_DEVICE;
use ringlink_transport::{
    RdmaClient, RdmaServer, ShmClient, ShmServer, TcpClient, TcpServer, TransportClient,
    TransportConfig, TransportServer, UnixClient, UnixServer,
};
use std::path::PathBuf;

use crate::bench::{self, BenchPlan, Measurement, Mode};
use crate::size::parse_size;

#[derive(Parser, Debug)]
#[command(name = "ringlink-bench")]
#[command(about = "Bandwidth and ping-pong benchmarks over RingLink transports", long_about = None)]
pub struct Cli {
    /// Transport configuration (.toml or .json); defaults apply when omitted.
    #[arg(short, long, global = true, env = "RINGLINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print one JSON object per measurement instead of CSV.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept one client and run the server's half.
    Server(BenchArgs),
    /// Connect to a server and run the client's half.
    Client(BenchArgs),
    /// Run server and client in this process.
    Loopback(BenchArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Rdma,
    Tcp,
    Unix,
    Shm,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Rdma => "rdma",
            Backend::Tcp => "tcp",
            Backend::Unix => "unix",
            Backend::Shm => "shm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
    Loopback,
}

#[derive(Args, Debug, Clone)]
pub struct BenchArgs {
    #[arg(short, long, value_enum, default_value_t = Backend::Tcp)]
    pub backend: Backend,

    /// Address to bind or connect to; a socket path for `unix`, a segment name for `shm`.
    #[arg(short, long)]
    pub addr: Option<String>,

    #[arg(short, long, value_enum, default_value_t = Mode::Bandwidth)]
    pub mode: Mode,

    /// Bytes streamed per chunk size.
    #[arg(long, value_parser = parse_size, default_value = "256M")]
    pub data_size: usize,

    #[arg(
        long,
        value_parser = parse_size,
        value_delimiter = ',',
        default_value = "1K,4K,16K,64K,256K,1M,4M"
    )]
    pub chunk_sizes: Vec<usize>,

    /// Round trips in ping-pong mode.
    #[arg(long, default_value_t = 128 * 1024)]
    pub messages: usize,

    #[arg(long, default_value_t = 0x5EED)]
    pub seed: u64,
}

impl BenchArgs {
    pub fn plan(&self) -> Result<BenchPlan> {
        if self.chunk_sizes.is_empty() || self.chunk_sizes.contains(&0) {
            bail!("chunk sizes must be non-empty and non-zero");
        }
        Ok(BenchPlan {
            mode: self.mode,
            data_size: self.data_size,
            chunk_sizes: self.chunk_sizes.clone(),
            messages: self.messages,
            seed: self.seed,
        })
    }

    pub fn addr(&self, role: Role) -> String {
        if let Some(addr) = &self.addr {
            return addr.clone();
        }
        match (self.backend, role) {
            (Backend::Unix, _) => "/tmp/ringlink-bench.sock".to_string(),
            (Backend::Shm, _) => "ringlink-bench".to_string(),
            (_, Role::Server) => "0.0.0.0:7471".to_string(),
            (_, Role::Client) => "127.0.0.1:7471".to_string(),
            (_, Role::Loopback) => "127.0.0.1:0".to_string(),
        }
    }
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = match &self.config {
            Some(path) => TransportConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => TransportConfig::default(),
        };
        let (role, args) = match &self.command {
            Command::Server(args) => (Role::Server, args),
            Command::Client(args) => (Role::Client, args),
            Command::Loopback(args) => (Role::Loopback, args),
        };
        if args.backend == Backend::Rdma
            && role != Role::Loopback
            && config.fabric.device == SOFT_DEVICE
        {
            bail!("the software fabric is process-local; run the rdma backend with `loopback`");
        }

        let plan = args.plan()?;
        let addr = args.addr(role);
        let name = args.backend.name();
        let results = match args.backend {
            Backend::Rdma => {
                run_role::<RdmaServer, RdmaClient>(role, name, &addr, config, &plan).await?
            }
            Backend::Tcp => {
                run_role::<TcpServer, TcpClient>(role, name, &addr, config, &plan).await?
            }
            Backend::Unix => {
                run_role::<UnixServer, UnixClient>(role, name, &addr, config, &plan).await?
            }
            Backend::Shm => {
                run_role::<ShmServer, ShmClient>(role, name, &addr, config, &plan).await?
            }
        };
        self.print(&results)
    }

    fn print(&self, results: &[Measurement]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        if self.json {
            for m in results {
                println!("{}", serde_json::to_string(m)?);
            }
        } else {
            println!("{}", Measurement::csv_header());
            for m in results {
                println!("{}", m.csv_row());
            }
        }
        Ok(())
    }
}

async fn run_role<S, C>(
    role: Role,
    backend: &str,
    addr: &str,
    config: TransportConfig,
    plan: &BenchPlan,
) -> Result<Vec<Measurement>>
where
    S: TransportServer + 'static,
    C: TransportClient + 'static,
{
    match role {
        Role::Server => bench::run_server::<S>(backend, addr, config, plan).await,
        Role::Client => bench::run_client::<C>(backend, addr, config, plan).await,
        Role::Loopback => bench::run_loopback::<S, C>(backend, addr, config, plan).await,
    }
}
