#![warn(missing_docs)]

//! RingLink transport: socket-like byte streams over one-sided RDMA ring buffers,
//! TCP, Unix domain sockets and shared memory

pub mod channel;
pub mod config;
pub mod error;
pub mod fabric;
pub mod handshake;
pub mod integrity;
pub mod rdma;
pub mod retry;
pub mod ring;
pub mod shm;
pub mod spin;
pub mod stream;
pub mod tcp;
pub mod transport;
pub mod unix;

pub use channel::{Channel, ChannelConfig, ChannelStats};
pub use config::TransportConfig;
pub use error::{Result, TransportError};
pub use fabric::{Fabric, FabricConfig};
pub use rdma::{RdmaClient, RdmaServer};
pub use shm::{ShmClient, ShmServer};
pub use tcp::{TcpClient, TcpServer};
pub use transport::{Transport, TransportClient, TransportServer};
pub use unix::{UnixClient, UnixServer};
