//! TCP backend.

use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::retry::RetryExecutor;
use crate::stream::StreamConn;
use crate::transport::{delegate_transport, TransportClient, TransportServer};

/// Opens one TCP connection with a timeout, mapping failures to transport errors.
pub(crate) async fn connect_stream(
    addr: &str,
    timeout: Duration,
    nodelay: bool,
) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::ConnectionTimeout {
            addr: addr.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
                addr: addr.to_string(),
            },
            _ => TransportError::IoError(e),
        })?;
    if nodelay {
        stream.set_nodelay(true)?;
    }
    Ok(stream)
}

/// Connects with the bootstrap retry policy from `config`.
pub(crate) async fn connect_with_retry(addr: &str, config: &TransportConfig) -> Result<TcpStream> {
    let timeout = config.bootstrap.connect_timeout();
    let nodelay = config.stream.nodelay;
    RetryExecutor::new(config.bootstrap.clone())
        .bootstrap(addr, || connect_stream(addr, timeout, nodelay))
        .await
}

#[derive(Debug)]
pub struct TcpServer {
    listener: TcpListener,
    config: TransportConfig,
    conn: Option<StreamConn<TcpStream>>,
}

#[async_trait::async_trait]
impl TransportServer for TcpServer {
    async fn bind(addr: &str, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await?;
        tracing::debug!(addr = %listener.local_addr()?, "TCP listening");
        Ok(Self {
            listener,
            config,
            conn: None,
        })
    }

    async fn accept(&mut self) -> Result<()> {
        let (stream, peer) = self.listener.accept().await?;
        if self.config.stream.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::info!(peer = %peer, "TCP connection accepted");
        self.conn = Some(StreamConn::new(stream, self.config.stream.scratch_size));
        Ok(())
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.listener.local_addr()?.to_string())
    }
}

delegate_transport!(TcpServer);

#[derive(Debug)]
pub struct TcpClient {
    config: TransportConfig,
    conn: Option<StreamConn<TcpStream>>,
}

#[async_trait::async_trait]
impl TransportClient for TcpClient {
    fn new(config: TransportConfig) -> Self {
        Self { config, conn: None }
    }

    async fn connect(&mut self, addr: &str) -> Result<()> {
        let stream = connect_with_retry(addr, &self.config).await?;
        tracing::debug!(addr, "TCP connected");
        self.conn = Some(StreamConn::new(stream, self.config.stream.scratch_size));
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.conn = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }
}

delegate_transport!(TcpClient);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::transport::Transport;

    fn quick_config() -> TransportConfig {
        TransportConfig {
            bootstrap: RetryConfig {
                max_attempts: 3,
                backoff_ms: 10,
                connect_timeout_ms: 500,
                ..RetryConfig::default()
            },
            ..TransportConfig::default()
        }
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let mut server = TcpServer::bind("127.0.0.1:0", quick_config()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let mut client = TcpClient::new(quick_config());

        let (accepted, connected) = tokio::join!(server.accept(), client.connect(&addr));
        accepted.unwrap();
        connected.unwrap();

        client.write(b"over tcp").await.unwrap();
        let mut buf = [0u8; 8];
        server.read(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over tcp");
    }

    #[tokio::test]
    async fn test_not_connected_before_connect() {
        let mut client = TcpClient::new(quick_config());
        assert!(!client.is_connected());
        assert!(matches!(
            client.write(b"x").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_exhausts_retries() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut client = TcpClient::new(quick_config());
        match client.connect(&addr).await {
            Err(TransportError::BootstrapFailure { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
