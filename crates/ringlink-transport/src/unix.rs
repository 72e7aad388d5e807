//! Unix domain socket backend. Addresses are filesystem paths.

use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::retry::RetryExecutor;
use crate::stream::StreamConn;
use crate::transport::{delegate_transport, TransportClient, TransportServer};

#[derive(Debug)]
pub struct UnixServer {
    listener: UnixListener,
    path: PathBuf,
    config: TransportConfig,
    conn: Option<StreamConn<UnixStream>>,
}

impl Drop for UnixServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait::async_trait]
impl TransportServer for UnixServer {
    /// Binds to `addr`, replacing a stale socket file left by an earlier run.
    async fn bind(addr: &str, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let path = PathBuf::from(addr);
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&path)?;
        tracing::debug!(path = %path.display(), "Unix socket listening");
        Ok(Self {
            listener,
            path,
            config,
            conn: None,
        })
    }

    async fn accept(&mut self) -> Result<()> {
        let (stream, _) = self.listener.accept().await?;
        tracing::info!(path = %self.path.display(), "Unix connection accepted");
        self.conn = Some(StreamConn::new(stream, self.config.stream.scratch_size));
        Ok(())
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.path.display().to_string())
    }
}

delegate_transport!(UnixServer);

#[derive(Debug)]
pub struct UnixClient {
    config: TransportConfig,
    conn: Option<StreamConn<UnixStream>>,
}

async fn connect_once(path: &Path, timeout: std::time::Duration) -> Result<UnixStream> {
    tokio::time::timeout(timeout, UnixStream::connect(path))
        .await
        .map_err(|_| TransportError::ConnectionTimeout {
            addr: path.display().to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })?
        .map_err(TransportError::IoError)
}

#[async_trait::async_trait]
impl TransportClient for UnixClient {
    fn new(config: TransportConfig) -> Self {
        Self { config, conn: None }
    }

    async fn connect(&mut self, addr: &str) -> Result<()> {
        let path = Path::new(addr);
        let timeout = self.config.bootstrap.connect_timeout();
        let stream = RetryExecutor::new(self.config.bootstrap.clone())
            .bootstrap(addr, || connect_once(path, timeout))
            .await?;
        tracing::debug!(path = addr, "Unix socket connected");
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

delegate_transport!(UnixClient);

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
                ..RetryConfig::default()
            },
            ..TransportConfig::default()
        }
    }

    #[tokio::test]
    async fn test_unix_round_trip_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ringlink.sock");
        let addr = path.to_str().unwrap().to_string();

        std::fs::write(&path, b"stale").unwrap();
        let mut server = UnixServer::bind(&addr, quick_config()).await.unwrap();
        let mut client = UnixClient::new(quick_config());
        let (accepted, connected) = tokio::join!(server.accept(), client.connect(&addr));
        accepted.unwrap();
        connected.unwrap();

        server.write(b"over unix").await.unwrap();
        let mut buf = [0u8; 9];
        client.read(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over unix");

        drop(client);
        drop(server);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_missing_socket_is_bootstrap_failure() {
        let dir = tempfile::tempdir().unwrap();
        let addr = dir.path().join("absent.sock").to_str().unwrap().to_string();
        let mut client = UnixClient::new(quick_config());
        assert!(matches!(
            client.connect(&addr).await,
            Err(TransportError::BootstrapFailure { attempts: 3, .. })
        ));
    }
}
