//! [`Transport`] over any tokio byte stream; shared by the TCP and Unix backends.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{map_stream_err, Result, TransportError};
use crate::ring::{RingSlice, RingSliceMut};
use crate::transport::Transport;

/// A connected socket plus the buffer the zero-copy calls work in.
///
/// Sockets have no memory the caller could borrow, so `read_zc` and `write_zc`
/// go through `scratch`.
#[derive(Debug)]
pub struct StreamConn<S> {
    stream: S,
    scratch: Vec<u8>,
}

impl<S> StreamConn<S> {
    pub fn new(stream: S, scratch_size: usize) -> Self {
        Self {
            stream,
            scratch: vec![0u8; scratch_size.max(1)],
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

#[async_trait]
impl<S> Transport for StreamConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await.map_err(map_stream_err)
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream
            .read_exact(buf)
            .await
            .map_err(map_stream_err)?;
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.stream.read(buf).await.map_err(map_stream_err)? {
            0 => Err(TransportError::ConnectionReset),
            n => Ok(n),
        }
    }

    async fn read_zc<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(RingSlice<'_>) -> R + Send,
        R: Send,
    {
        let n = match self
            .stream
            .read(&mut self.scratch)
            .await
            .map_err(map_stream_err)?
        {
            0 => return Err(TransportError::ConnectionReset),
            n => n,
        };
        Ok(f(RingSlice::contiguous(&self.scratch[..n])))
    }

    async fn write_zc<F>(&mut self, max_len: usize, f: F) -> Result<usize>
    where
        F: FnOnce(RingSliceMut<'_>) -> usize + Send,
    {
        if self.scratch.len() < max_len {
            self.scratch.resize(max_len, 0);
        }
        let n = f(RingSliceMut::contiguous(&mut self.scratch[..max_len]));
        if n > max_len {
            return Err(TransportError::PayloadTooLarge {
                size: n,
                max_size: max_len,
            });
        }
        self.stream
            .write_all(&self.scratch[..n])
            .await
            .map_err(map_stream_err)?;
        Ok(n)
    }
}
