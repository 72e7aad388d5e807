//! Shared-memory backend: two single-producer/single-consumer byte rings in one
//! POSIX shared-memory segment.
//!
//! The server creates the segment, the client attaches to it by name. Segment
//! layout (all positions are virtual `u64` byte counters on their own cache line):
//!
//! ```text
//! 0    magic | capacity | attach state
//! 64   client→server write position
//! 128  client→server read position
//! 192  server→client write position
//! 256  server→client read position
//! 320  client→server data (capacity bytes)
//!      server→client data (capacity bytes)
//! ```
//!
//! A client claims the attach state (free → claimed). The server zeroes all four
//! positions and acknowledges (claimed → ready), and only then does the client
//! start using the rings. A reconnecting client never sees an earlier session's bytes.

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::ffi::CString;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::retry::RetryExecutor;
use crate::ring::{split_range, RingSlice, RingSliceMut};
use crate::spin::SpinPolicy;
use crate::transport::{delegate_transport, Transport, TransportClient, TransportServer};

/// "RLNKSHM1"
const SHM_MAGIC: u64 = 0x524C_4E4B_5348_4D31;
const MAGIC_OFFSET: usize = 0;
const CAPACITY_OFFSET: usize = 8;
const ATTACHED_OFFSET: usize = 16;
const HEADER_SIZE: usize = 320;

const ATTACH_FREE: u64 = 0;
const ATTACH_CLAIMED: u64 = 1;
const ATTACH_READY: u64 = 2;

const CLIENT_TO_SERVER: RingLayout = RingLayout {
    write_pos: 64,
    read_pos: 128,
    data_area: 0,
};
const SERVER_TO_CLIENT: RingLayout = RingLayout {
    write_pos: 192,
    read_pos: 256,
    data_area: 1,
};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Segment name for a transport address: `/ringlink-` plus the address with
/// slashes replaced.
pub fn segment_name(addr: &str) -> String {
    format!("/ringlink-{}", addr.trim_start_matches('/').replace('/', "_"))
}

fn segment_size(capacity: usize) -> usize {
    HEADER_SIZE + 2 * capacity
}

/// A mapping of a POSIX shared-memory object.
struct SharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    name: CString,
    is_owner: bool,
}

// SAFETY: the mapping is plain memory; all shared state in it is accessed through
// atomics or through ring ranges owned by exactly one side.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Creates and maps a new object, replacing a stale one of the same name.
    fn create(name: &str, size: usize) -> io::Result<Self> {
        let name = to_cstring(name)?;
        let len = NonZeroUsize::new(size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "size must be non-zero"))?;
        if shm_unlink(name.as_c_str()).is_ok() {
            tracing::debug!(name = ?name, "removed stale shared-memory segment");
        }

        let fd = shm_open(
            name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        let mapped = ftruncate(&fd, size as i64).and_then(|()| {
            // SAFETY: a fresh shared mapping of an fd we own, with no address hint.
            unsafe {
                mmap(
                    None,
                    len,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED,
                    &fd,
                    0,
                )
            }
        });
        match mapped {
            Ok(ptr) => Ok(Self {
                ptr: ptr.cast(),
                size,
                name,
                is_owner: true,
            }),
            Err(e) => {
                let _ = shm_unlink(name.as_c_str());
                Err(e.into())
            }
        }
    }

    /// Opens and maps an existing object in full.
    fn open(name: &str) -> io::Result<Self> {
        let name = to_cstring(name)?;
        let fd = shm_open(name.as_c_str(), OFlag::O_RDWR, Mode::empty())?;
        let file = std::fs::File::from(fd);
        let size = file.metadata()?.len() as usize;
        let len = NonZeroUsize::new(size).ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "segment not initialised yet")
        })?;
        // SAFETY: as in `create`; the object is at least `size` bytes long.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }?;
        Ok(Self {
            ptr: ptr.cast(),
            size,
            name,
            is_owner: false,
        })
    }

    fn atomic(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0 && offset + 8 <= self.size);
        // SAFETY: in bounds and aligned (the mapping is page aligned); the memory
        // lives as long as `self`.
        unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU64) }
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `size` describe a mapping created by `mmap` above.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
        if self.is_owner {
            let _ = shm_unlink(self.name.as_c_str());
        }
    }
}

/// Zeroes the positions of both rings.
fn reset_rings(shm: &SharedMemory) {
    for layout in [CLIENT_TO_SERVER, SERVER_TO_CLIENT] {
        shm.atomic(layout.write_pos).store(0, Ordering::Relaxed);
        shm.atomic(layout.read_pos).store(0, Ordering::Relaxed);
    }
}

fn to_cstring(name: &str) -> io::Result<CString> {
    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains a NUL byte"))
}

/// Offsets of one ring's control words and data area.
#[derive(Debug, Clone, Copy)]
struct RingLayout {
    write_pos: usize,
    read_pos: usize,
    /// Which of the two data areas after the header this ring uses.
    data_area: usize,
}

/// One direction of a shared-memory connection.
struct ShmRing {
    shm: Arc<SharedMemory>,
    layout: RingLayout,
    data_offset: usize,
    capacity: usize,
}

impl ShmRing {
    fn new(shm: Arc<SharedMemory>, layout: RingLayout, capacity: usize) -> Self {
        let data_offset = HEADER_SIZE + layout.data_area * capacity;
        Self {
            shm,
            layout,
            data_offset,
            capacity,
        }
    }

    fn write_pos(&self) -> &AtomicU64 {
        self.shm.atomic(self.layout.write_pos)
    }

    fn read_pos(&self) -> &AtomicU64 {
        self.shm.atomic(self.layout.read_pos)
    }

    /// Bytes the producer may write.
    fn free(&self) -> usize {
        let w = self.write_pos().load(Ordering::Relaxed);
        let r = self.read_pos().load(Ordering::Acquire);
        self.capacity - (w - r) as usize
    }

    /// Bytes the consumer may read.
    fn available(&self) -> usize {
        let w = self.write_pos().load(Ordering::Acquire);
        let r = self.read_pos().load(Ordering::Relaxed);
        (w - r) as usize
    }

    /// # Safety
    /// The range must belong to the caller's side of the ring for the borrow's lifetime.
    #[allow(clippy::mut_from_ref)]
    unsafe fn data(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.capacity);
        std::slice::from_raw_parts_mut(
            self.shm.ptr.as_ptr().add(self.data_offset + offset),
            len,
        )
    }

    fn view(&self, pos: u64, len: usize) -> RingSlice<'_> {
        // SAFETY: callers pass ranges between the read and write positions, which
        // the producer does not touch until the read position moves past them.
        unsafe {
            match split_range(pos, len, self.capacity).segments_pair() {
                (head, None) => RingSlice::contiguous(self.data(head.offset, head.len)),
                (head, Some(tail)) => RingSlice::new(
                    self.data(head.offset, head.len),
                    self.data(tail.offset, tail.len),
                ),
            }
        }
    }

    fn view_mut(&self, pos: u64, len: usize) -> RingSliceMut<'_> {
        // SAFETY: callers pass free ranges, which the consumer does not read until
        // the write position moves past them.
        unsafe {
            match split_range(pos, len, self.capacity).segments_pair() {
                (head, None) => RingSliceMut::contiguous(self.data(head.offset, head.len)),
                (head, Some(tail)) => RingSliceMut::new(
                    self.data(head.offset, head.len),
                    self.data(tail.offset, tail.len),
                ),
            }
        }
    }

    /// Copies as much of `src` as fits and publishes it.
    fn push(&self, src: &[u8]) -> usize {
        let n = src.len().min(self.free());
        let w = self.write_pos().load(Ordering::Relaxed);
        self.view_mut(w, n).copy_from(&src[..n]);
        self.write_pos().store(w + n as u64, Ordering::Release);
        n
    }

    /// Copies out as much as is available and fits in `dst`.
    fn pop(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.available());
        let r = self.read_pos().load(Ordering::Relaxed);
        self.view(r, n).copy_to(dst);
        self.read_pos().store(r + n as u64, Ordering::Release);
        n
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

/// A connection over a shared-memory segment.
pub struct ShmConn {
    shm: Arc<SharedMemory>,
    role: Role,
    tx: ShmRing,
    rx: ShmRing,
    spin: SpinPolicy,
}

impl std::fmt::Debug for ShmConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmConn")
            .field("name", &self.shm.name)
            .field("role", &self.role)
            .field("capacity", &self.tx.capacity)
            .finish()
    }
}

impl ShmConn {
    fn new(shm: Arc<SharedMemory>, role: Role, capacity: usize, spin: SpinPolicy) -> Self {
        let (tx, rx) = match role {
            Role::Server => (SERVER_TO_CLIENT, CLIENT_TO_SERVER),
            Role::Client => (CLIENT_TO_SERVER, SERVER_TO_CLIENT),
        };
        Self {
            tx: ShmRing::new(Arc::clone(&shm), tx, capacity),
            rx: ShmRing::new(Arc::clone(&shm), rx, capacity),
            shm,
            role,
            spin,
        }
    }

    fn peer_gone(&self) -> bool {
        match self.role {
            Role::Server => {
                self.shm.atomic(ATTACHED_OFFSET).load(Ordering::Acquire) != ATTACH_READY
            }
            Role::Client => self.shm.atomic(MAGIC_OFFSET).load(Ordering::Acquire) != SHM_MAGIC,
        }
    }

    async fn wait_readable(&self) -> Result<usize> {
        let mut spinner = self.spin.spinner("shared-memory data");
        loop {
            let available = self.rx.available();
            if available > 0 {
                return Ok(available);
            }
            if self.peer_gone() {
                return Err(TransportError::ConnectionReset);
            }
            spinner.tick()?;
            tokio::task::yield_now().await;
        }
    }

    async fn wait_writable(&self) -> Result<usize> {
        let mut spinner = self.spin.spinner("shared-memory space");
        loop {
            if self.peer_gone() {
                return Err(TransportError::ConnectionReset);
            }
            let free = self.tx.free();
            if free > 0 {
                return Ok(free);
            }
            spinner.tick()?;
            tokio::task::yield_now().await;
        }
    }
}

impl Drop for ShmConn {
    fn drop(&mut self) {
        if self.role == Role::Client {
            self.shm
                .atomic(ATTACHED_OFFSET)
                .store(ATTACH_FREE, Ordering::Release);
        }
    }
}

#[async_trait::async_trait]
impl Transport for ShmConn {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            self.wait_writable().await?;
            done += self.tx.push(&data[done..]);
        }
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.wait_readable().await?;
        Ok(self.rx.pop(buf))
    }

    async fn read_zc<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(RingSlice<'_>) -> R + Send,
        R: Send,
    {
        let available = self.wait_readable().await?;
        let r = self.rx.read_pos().load(Ordering::Relaxed);
        let out = f(self.rx.view(r, available));
        self.rx
            .read_pos()
            .store(r + available as u64, Ordering::Release);
        Ok(out)
    }

    async fn write_zc<F>(&mut self, max_len: usize, f: F) -> Result<usize>
    where
        F: FnOnce(RingSliceMut<'_>) -> usize + Send,
    {
        let room = if max_len == 0 {
            0
        } else {
            self.wait_writable().await?.min(max_len)
        };
        let w = self.tx.write_pos().load(Ordering::Relaxed);
        let n = f(self.tx.view_mut(w, room));
        if n > room {
            return Err(TransportError::PayloadTooLarge {
                size: n,
                max_size: room,
            });
        }
        self.tx.write_pos().store(w + n as u64, Ordering::Release);
        Ok(n)
    }
}

#[derive(Debug)]
pub struct ShmServer {
    addr: String,
    shm: Arc<SharedMemory>,
    config: TransportConfig,
    conn: Option<ShmConn>,
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("is_owner", &self.is_owner)
            .finish()
    }
}

impl Drop for ShmServer {
    fn drop(&mut self) {
        self.shm.atomic(MAGIC_OFFSET).store(0, Ordering::Release);
    }
}

#[async_trait::async_trait]
impl TransportServer for ShmServer {
    async fn bind(addr: &str, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let name = segment_name(addr);
        let capacity = config.shm.capacity;
        let shm = SharedMemory::create(&name, segment_size(capacity)).map_err(|e| {
            TransportError::ResourceExhaustion {
                reason: format!("cannot create shared-memory segment {name}: {e}"),
            }
        })?;
        shm.atomic(CAPACITY_OFFSET)
            .store(capacity as u64, Ordering::Relaxed);
        shm.atomic(MAGIC_OFFSET).store(SHM_MAGIC, Ordering::Release);
        tracing::debug!(name = %name, capacity, "shared-memory segment created");
        Ok(Self {
            addr: addr.to_string(),
            shm: Arc::new(shm),
            config,
            conn: None,
        })
    }

    /// Waits until a client has claimed the segment, then resets both rings and
    /// acknowledges the claim.
    async fn accept(&mut self) -> Result<()> {
        loop {
            let state = self.shm.atomic(ATTACHED_OFFSET);
            if state.load(Ordering::Acquire) == ATTACH_CLAIMED {
                self.conn = None;
                reset_rings(&self.shm);
                // Fails only if the client gave up waiting in the meantime.
                if state
                    .compare_exchange(
                        ATTACH_CLAIMED,
                        ATTACH_READY,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    break;
                }
            }
            tokio::time::sleep(ACCEPT_POLL_INTERVAL).await;
        }
        tracing::info!(addr = %self.addr, "shared-memory client attached");
        self.conn = Some(ShmConn::new(
            Arc::clone(&self.shm),
            Role::Server,
            self.config.shm.capacity,
            SpinPolicy::from_millis(self.config.shm.spin_timeout_ms),
        ));
        Ok(())
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.addr.clone())
    }
}

delegate_transport!(ShmServer);

#[derive(Debug)]
pub struct ShmClient {
    config: TransportConfig,
    conn: Option<ShmConn>,
}

/// Maps the segment and claims the client slot.
fn attach(name: &str, addr: &str, capacity: usize) -> Result<SharedMemory> {
    let shm = SharedMemory::open(name)?;
    let refused = || TransportError::ConnectionRefused {
        addr: addr.to_string(),
    };
    if shm.size < HEADER_SIZE || shm.atomic(MAGIC_OFFSET).load(Ordering::Acquire) != SHM_MAGIC {
        return Err(refused());
    }
    let theirs = shm.atomic(CAPACITY_OFFSET).load(Ordering::Relaxed) as usize;
    if theirs != capacity || shm.size < segment_size(capacity) {
        return Err(TransportError::config(format!(
            "shared-memory capacity mismatch: local {capacity}, segment {theirs}"
        )));
    }
    shm.atomic(ATTACHED_OFFSET)
        .compare_exchange(
            ATTACH_FREE,
            ATTACH_CLAIMED,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map_err(|_| refused())?;
    Ok(shm)
}

/// Waits for the server to acknowledge a claim made by [`attach`]. On timeout the
/// claim is released again.
async fn await_ready(shm: &SharedMemory, addr: &str, timeout: Duration) -> Result<()> {
    let state = shm.atomic(ATTACHED_OFFSET);
    let acknowledged = async {
        while state.load(Ordering::Acquire) != ATTACH_READY {
            if shm.atomic(MAGIC_OFFSET).load(Ordering::Acquire) != SHM_MAGIC {
                return Err(TransportError::ConnectionReset);
            }
            tokio::time::sleep(ACCEPT_POLL_INTERVAL).await;
        }
        Ok(())
    };
    match tokio::time::timeout(timeout, acknowledged).await {
        Ok(result) => result,
        Err(_) => match state.compare_exchange(
            ATTACH_CLAIMED,
            ATTACH_FREE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Err(ATTACH_READY) => Ok(()),
            _ => Err(TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        },
    }
}

#[async_trait::async_trait]
impl TransportClient for ShmClient {
    fn new(config: TransportConfig) -> Self {
        Self { config, conn: None }
    }

    async fn connect(&mut self, addr: &str) -> Result<()> {
        self.config.validate()?;
        let name = segment_name(addr);
        let capacity = self.config.shm.capacity;
        let shm = RetryExecutor::new(self.config.bootstrap.clone())
            .bootstrap(addr, || {
                let result = attach(&name, addr, capacity);
                async move { result }
            })
            .await?;
        await_ready(&shm, addr, self.config.bootstrap.connect_timeout()).await?;
        tracing::debug!(name = %name, "attached to shared-memory segment");
        self.conn = Some(ShmConn::new(
            Arc::new(shm),
            Role::Client,
            capacity,
            SpinPolicy::from_millis(self.config.shm.spin_timeout_ms),
        ));
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

delegate_transport!(ShmClient);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShmConfig;
    use crate::retry::RetryConfig;

    fn config(capacity: usize) -> TransportConfig {
        TransportConfig {
            shm: ShmConfig {
                capacity,
                spin_timeout_ms: Some(5_000),
            },
            bootstrap: RetryConfig {
                max_attempts: 3,
                backoff_ms: 5,
                ..RetryConfig::default()
            },
            ..TransportConfig::default()
        }
    }

    fn unique_addr(tag: &str) -> String {
        format!("test/{}/{tag}", std::process::id())
    }

    async fn connected(tag: &str, capacity: usize) -> (ShmServer, ShmClient) {
        let addr = unique_addr(tag);
        let mut server = ShmServer::bind(&addr, config(capacity)).await.unwrap();
        let mut client = ShmClient::new(config(capacity));
        let (accepted, attached) = tokio::join!(server.accept(), client.connect(&addr));
        accepted.unwrap();
        attached.unwrap();
        (server, client)
    }

    #[test]
    fn test_segment_name() {
        assert_eq!(segment_name("/tmp/bench"), "/ringlink-tmp_bench");
        assert_eq!(segment_name("bench"), "/ringlink-bench");
    }

    #[tokio::test]
    async fn test_shm_round_trip() {
        let (mut server, mut client) = connected("round-trip", 64).await;
        client.write(b"shared memory").await.unwrap();
        let mut buf = [0u8; 13];
        server.read(&mut buf).await.unwrap();
        assert_eq!(&buf, b"shared memory");
        server.write(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        client.read(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }

    #[tokio::test]
    async fn test_stream_larger_than_ring() {
        let (mut server, mut client) = connected("large", 64).await;
        let data: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
        let writer = async {
            client.write(&data).await.unwrap();
        };
        let reader = async {
            let mut out = vec![0u8; data.len()];
            server.read(&mut out).await.unwrap();
            out
        };
        let ((), out) = tokio::join!(writer, reader);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_zero_copy_wraps() {
        let (mut server, mut client) = connected("zero-copy", 16).await;
        client.write(&[1u8; 12]).await.unwrap();
        let mut sink = [0u8; 12];
        server.read(&mut sink).await.unwrap();

        let sent = client
            .write_zc(10, |mut view| {
                assert_eq!(view.len(), 10);
                view.copy_from(b"wrapping!!")
            })
            .await
            .unwrap();
        assert_eq!(sent, 10);
        let (got, wrapped) = server
            .read_zc(|view| (view.to_vec(), !view.parts().1.is_empty()))
            .await
            .unwrap();
        assert_eq!(got, b"wrapping!!");
        assert!(wrapped);
    }

    #[tokio::test]
    async fn test_second_client_refused() {
        let addr = unique_addr("second");
        let (mut server, _client) = connected("second", 64).await;
        let mut other = ShmClient::new(config(64));
        assert!(matches!(
            other.connect(&addr).await,
            Err(TransportError::BootstrapFailure { .. })
        ));
        assert!(server.write(b"still fine").await.is_ok());
    }

    #[tokio::test]
    async fn test_capacity_mismatch() {
        let addr = unique_addr("mismatch");
        let _server = ShmServer::bind(&addr, config(64)).await.unwrap();
        let mut client = ShmClient::new(config(128));
        assert!(matches!(
            client.connect(&addr).await,
            Err(TransportError::ConfigurationError { .. })
        ));
    }

    #[tokio::test]
    async fn test_client_reset_is_seen_by_server() {
        let (mut server, mut client) = connected("reset", 64).await;
        client.reset().await.unwrap();
        assert!(!client.is_connected());
        let mut buf = [0u8; 1];
        assert!(matches!(
            server.read_some(&mut buf).await,
            Err(TransportError::ConnectionReset)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_starts_with_empty_rings() {
        let (mut server, mut client) = connected("reconnect", 64).await;
        server.write(b"OLD-SESSION").await.unwrap();
        client.write(b"old-request").await.unwrap();
        client.reset().await.unwrap();

        let addr = unique_addr("reconnect");
        let (accepted, attached) = tokio::join!(server.accept(), client.connect(&addr));
        accepted.unwrap();
        attached.unwrap();

        server.write(b"new").await.unwrap();
        let mut buf = [0u8; 3];
        client.read(&mut buf).await.unwrap();
        assert_eq!(&buf, b"new");

        client.write(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        server.read(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_unacknowledged_claim_times_out_and_is_released() {
        let addr = unique_addr("unacknowledged");
        let mut server = ShmServer::bind(&addr, config(64)).await.unwrap();
        let mut impatient = config(64);
        impatient.bootstrap.connect_timeout_ms = 20;
        let mut client = ShmClient::new(impatient);
        assert!(matches!(
            client.connect(&addr).await,
            Err(TransportError::ConnectionTimeout { .. })
        ));
        assert!(!client.is_connected());

        let mut next = ShmClient::new(config(64));
        let (accepted, attached) = tokio::join!(server.accept(), next.connect(&addr));
        accepted.unwrap();
        attached.unwrap();
    }

    #[tokio::test]
    async fn test_server_drop_is_seen_by_client() {
        let (server, mut client) = connected("drop", 64).await;
        drop(server);
        let mut buf = [0u8; 1];
        assert!(matches!(
            client.read_some(&mut buf).await,
            Err(TransportError::ConnectionReset)
        ));
    }
}
