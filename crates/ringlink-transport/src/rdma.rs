//! RDMA backend: a ring-buffer [`Channel`] bootstrapped over TCP.
//!
//! The server listens on a TCP address and runs the handshake over each accepted
//! connection; the socket is closed once the channel is up and data never touches
//! it. Byte-stream reads are served from whole messages: a message larger than the
//! caller's buffer is split and its remainder kept for the following reads.

use bytes::{Buf, BytesMut};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::channel::Channel;
use crate::config::TransportConfig;
use crate::error::Result;
use crate::fabric::{Fabric, FabricConfig, SOFT_DEVICE};
use crate::handshake;
use crate::ring::{RingSlice, RingSliceMut};
use crate::spin::SpinPolicy;
use crate::tcp::connect_with_retry;
use crate::transport::{delegate_transport, Transport, TransportClient, TransportServer};

/// The fabric used when none is given explicitly.
fn default_fabric(config: &FabricConfig) -> Result<Arc<Fabric>> {
    if config.device == SOFT_DEVICE {
        Ok(Fabric::global())
    } else {
        Fabric::open(config.clone())
    }
}

/// A connected channel seen as a byte stream.
#[derive(Debug)]
pub struct RdmaConn {
    channel: Channel,
    pending: BytesMut,
    spin: SpinPolicy,
}

impl RdmaConn {
    pub fn new(channel: Channel) -> Self {
        let spin = channel.config().spin_policy();
        Self {
            channel,
            pending: BytesMut::new(),
            spin,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Polls until the next non-empty message has fully arrived and returns its length.
    async fn next_message(&mut self) -> Result<usize> {
        let mut spinner = self.spin.spinner("incoming message");
        loop {
            match self.channel.peek_len()? {
                Some(0) => {
                    self.channel.receive_into(&mut [])?;
                }
                Some(len) => return Ok(len),
                None => {
                    spinner.tick()?;
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    async fn wait_for_space(&mut self, len: usize) -> Result<()> {
        let mut spinner = self.spin.spinner("ring space");
        while !self.channel.can_send(len)? {
            spinner.tick()?;
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for RdmaConn {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let max = self.channel.max_payload();
        for chunk in data.chunks(max) {
            self.wait_for_space(chunk.len()).await?;
            self.channel.send(chunk)?;
        }
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.advance(n);
            return Ok(n);
        }
        let len = self.next_message().await?;
        if len <= buf.len() {
            return self.channel.receive_into(buf);
        }
        let pending = &mut self.pending;
        self.channel.receive_zc(|view| {
            let n = view.copy_to(buf);
            let (head, tail) = view.skip(n).parts();
            pending.extend_from_slice(head);
            pending.extend_from_slice(tail);
            n
        })
    }

    async fn read_zc<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(RingSlice<'_>) -> R + Send,
        R: Send,
    {
        if !self.pending.is_empty() {
            let out = f(RingSlice::contiguous(&self.pending));
            self.pending.clear();
            return Ok(out);
        }
        self.next_message().await?;
        self.channel.receive_zc(f)
    }

    async fn write_zc<F>(&mut self, max_len: usize, f: F) -> Result<usize>
    where
        F: FnOnce(RingSliceMut<'_>) -> usize + Send,
    {
        let max_len = max_len.min(self.channel.max_payload());
        self.wait_for_space(max_len).await?;
        self.channel.send_zc(max_len, f)
    }
}

#[derive(Debug)]
pub struct RdmaServer {
    listener: TcpListener,
    fabric: Arc<Fabric>,
    config: TransportConfig,
    conn: Option<RdmaConn>,
}

impl RdmaServer {
    /// Binds the bootstrap listener, registering channels on `fabric`.
    pub async fn bind_with_fabric(
        addr: &str,
        config: TransportConfig,
        fabric: Arc<Fabric>,
    ) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await?;
        tracing::debug!(addr = %listener.local_addr()?, "RDMA bootstrap listening");
        Ok(Self {
            listener,
            fabric,
            config,
            conn: None,
        })
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.conn.as_ref().map(RdmaConn::channel)
    }
}

#[async_trait::async_trait]
impl TransportServer for RdmaServer {
    async fn bind(addr: &str, config: TransportConfig) -> Result<Self> {
        let fabric = default_fabric(&config.fabric)?;
        Self::bind_with_fabric(addr, config, fabric).await
    }

    async fn accept(&mut self) -> Result<()> {
        let (mut stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let channel = handshake::establish(&mut stream, &self.fabric, &self.config.channel).await?;
        tracing::info!(
            peer = %peer,
            qp_num = channel.qp_num(),
            capacity = channel.capacity(),
            "RDMA channel accepted"
        );
        self.conn = Some(RdmaConn::new(channel));
        Ok(())
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.listener.local_addr()?.to_string())
    }
}

delegate_transport!(RdmaServer);

#[derive(Debug)]
pub struct RdmaClient {
    fabric: Option<Arc<Fabric>>,
    config: TransportConfig,
    conn: Option<RdmaConn>,
}

impl RdmaClient {
    /// A client that registers its channels on `fabric`.
    pub fn with_fabric(config: TransportConfig, fabric: Arc<Fabric>) -> Self {
        Self {
            fabric: Some(fabric),
            config,
            conn: None,
        }
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.conn.as_ref().map(RdmaConn::channel)
    }
}

#[async_trait::async_trait]
impl TransportClient for RdmaClient {
    fn new(config: TransportConfig) -> Self {
        Self {
            fabric: None,
            config,
            conn: None,
        }
    }

    async fn connect(&mut self, addr: &str) -> Result<()> {
        self.config.validate()?;
        let fabric = match &self.fabric {
            Some(fabric) => Arc::clone(fabric),
            None => default_fabric(&self.config.fabric)?,
        };
        let mut stream = connect_with_retry(addr, &self.config).await?;
        let channel = handshake::establish(&mut stream, &fabric, &self.config.channel).await?;
        tracing::debug!(addr, qp_num = channel.qp_num(), "RDMA channel connected");
        self.conn = Some(RdmaConn::new(channel));
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        if self.conn.take().is_some() {
            tracing::debug!("RDMA channel torn down");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }
}

delegate_transport!(RdmaClient);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::error::TransportError;

    fn small_config(capacity: usize) -> TransportConfig {
        TransportConfig {
            channel: ChannelConfig::with_capacity(capacity),
            ..TransportConfig::default()
        }
    }

    #[tokio::test]
    async fn test_rdma_round_trip() {
        let fabric = Fabric::new(FabricConfig::default());
        let mut server =
            RdmaServer::bind_with_fabric("127.0.0.1:0", small_config(4096), Arc::clone(&fabric))
                .await
                .unwrap();
        let addr = server.local_addr().unwrap();
        let mut client = RdmaClient::with_fabric(small_config(4096), fabric);

        let (accepted, connected) = tokio::join!(server.accept(), client.connect(&addr));
        accepted.unwrap();
        connected.unwrap();

        client.write(b"one-sided").await.unwrap();
        let mut buf = [0u8; 9];
        server.read(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one-sided");
        assert_eq!(server.channel().unwrap().stats().messages_received, 1);
    }

    #[tokio::test]
    async fn test_partial_reads_keep_remainder() {
        let fabric = Fabric::new(FabricConfig::default());
        let (a, b) = Channel::loopback_pair(&fabric, ChannelConfig::with_capacity(256)).unwrap();
        let (mut a, mut b) = (RdmaConn::new(a), RdmaConn::new(b));

        a.write(b"abcdefghij").await.unwrap();
        let mut three = [0u8; 3];
        assert_eq!(b.read_some(&mut three).await.unwrap(), 3);
        assert_eq!(&three, b"abc");
        let mut rest = [0u8; 7];
        b.read(&mut rest).await.unwrap();
        assert_eq!(&rest, b"defghij");
    }

    #[tokio::test]
    async fn test_large_write_is_chunked() {
        let fabric = Fabric::new(FabricConfig::default());
        let (a, b) = Channel::loopback_pair(&fabric, ChannelConfig::with_capacity(64)).unwrap();
        let (mut a, mut b) = (RdmaConn::new(a), RdmaConn::new(b));
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let writer = async {
            a.write(&data).await.unwrap();
            a
        };
        let reader = async {
            let mut out = vec![0u8; data.len()];
            b.read(&mut out).await.unwrap();
            out
        };
        let (a, out) = tokio::join!(writer, reader);
        assert_eq!(out, data);
        assert_eq!(a.channel().stats().messages_sent, (1000 + 47) / 48);
    }

    #[tokio::test]
    async fn test_zero_copy_transport_calls() {
        let fabric = Fabric::new(FabricConfig::default());
        let (a, b) = Channel::loopback_pair(&fabric, ChannelConfig::with_capacity(128)).unwrap();
        let (mut a, mut b) = (RdmaConn::new(a), RdmaConn::new(b));

        let sent = a
            .write_zc(1000, |mut view| {
                assert_eq!(view.len(), 112);
                view.copy_from(b"in place")
            })
            .await
            .unwrap();
        assert_eq!(sent, 8);
        let got = b.read_zc(|view| view.to_vec()).await.unwrap();
        assert_eq!(got, b"in place");
    }

    #[tokio::test]
    async fn test_not_connected() {
        let mut client = RdmaClient::new(small_config(4096));
        assert!(matches!(
            client.read_some(&mut [0u8; 4]).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_hardware_device_not_available() {
        let mut config = small_config(4096);
        config.fabric.device = "mlx5_0".to_string();
        assert!(matches!(
            RdmaServer::bind("127.0.0.1:0", config).await,
            Err(TransportError::RdmaNotAvailable { .. })
        ));
    }
}
