//! Backend-independent byte-stream interface.
//!
//! Application code is written once against [`TransportServer`] and
//! [`TransportClient`] and instantiated with the RDMA, TCP, Unix-socket or
//! shared-memory backend. The methods are monomorphised; no trait objects are
//! involved on the data path.

use async_trait::async_trait;

use crate::config::TransportConfig;
use crate::error::Result;
use crate::ring::{RingSlice, RingSliceMut};

/// A connected, reliable, ordered byte stream.
#[async_trait]
pub trait Transport: Send {
    /// Writes all of `data`.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Fills `buf` completely.
    async fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read_some(&mut buf[filled..]).await?;
        }
        Ok(())
    }

    /// Reads at least one byte (unless `buf` is empty) and returns how many were read.
    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Hands the next available bytes to `f` without an intermediate copy where the
    /// backend allows it. Every byte shown to `f` counts as consumed.
    async fn read_zc<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(RingSlice<'_>) -> R + Send,
        R: Send;

    /// Lets `f` fill up to `max_len` bytes in place and sends as many as it reports.
    ///
    /// Backends may offer less room than `max_len` (never zero for a non-zero request);
    /// `f` sees the actual extent through the view's length.
    async fn write_zc<F>(&mut self, max_len: usize, f: F) -> Result<usize>
    where
        F: FnOnce(RingSliceMut<'_>) -> usize + Send;
}

/// The accepting end of a backend.
#[async_trait]
pub trait TransportServer: Transport + Sized {
    /// Binds to `addr`; the address format depends on the backend.
    async fn bind(addr: &str, config: TransportConfig) -> Result<Self>;

    /// Waits for a peer and makes it the current connection.
    async fn accept(&mut self) -> Result<()>;

    /// The address peers connect to.
    fn local_addr(&self) -> Result<String>;
}

/// The connecting end of a backend.
#[async_trait]
pub trait TransportClient: Transport + Sized {
    fn new(config: TransportConfig) -> Self;

    /// Connects to a server, retrying while the server is not reachable yet.
    async fn connect(&mut self, addr: &str) -> Result<()>;

    /// Drops the current connection; a later `connect` starts over.
    async fn reset(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Implements [`Transport`] for a server or client type by forwarding to its
/// `conn: Option<_>` field, failing with `NotConnected` while it is `None`.
macro_rules! delegate_transport {
    ($ty:ty) => {
        #[async_trait::async_trait]
        impl $crate::transport::Transport for $ty {
            async fn write(&mut self, data: &[u8]) -> $crate::error::Result<()> {
                let conn = self
                    .conn
                    .as_mut()
                    .ok_or($crate::error::TransportError::NotConnected)?;
                $crate::transport::Transport::write(conn, data).await
            }

            async fn read(&mut self, buf: &mut [u8]) -> $crate::error::Result<()> {
                let conn = self
                    .conn
                    .as_mut()
                    .ok_or($crate::error::TransportError::NotConnected)?;
                $crate::transport::Transport::read(conn, buf).await
            }

            async fn read_some(&mut self, buf: &mut [u8]) -> $crate::error::Result<usize> {
                let conn = self
                    .conn
                    .as_mut()
                    .ok_or($crate::error::TransportError::NotConnected)?;
                $crate::transport::Transport::read_some(conn, buf).await
            }

            async fn read_zc<F, R>(&mut self, f: F) -> $crate::error::Result<R>
            where
                F: FnOnce($crate::ring::RingSlice<'_>) -> R + Send,
                R: Send,
            {
                let conn = self
                    .conn
                    .as_mut()
                    .ok_or($crate::error::TransportError::NotConnected)?;
                $crate::transport::Transport::read_zc(conn, f).await
            }

            async fn write_zc<F>(&mut self, max_len: usize, f: F) -> $crate::error::Result<usize>
            where
                F: FnOnce($crate::ring::RingSliceMut<'_>) -> usize + Send,
            {
                let conn = self
                    .conn
                    .as_mut()
                    .ok_or($crate::error::TransportError::NotConnected)?;
                $crate::transport::Transport::write_zc(conn, max_len, f).await
            }
        }
    };
}

pub(crate) use delegate_transport;
