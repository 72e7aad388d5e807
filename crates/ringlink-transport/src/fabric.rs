//! Software RDMA fabric.
//!
//! An in-process implementation of the verbs contract the ring-buffer channel is
//! written against: memory registration with access flags and keys, queue pairs
//! with the Reset → Init → RTR → RTS state machine, one-sided WRITE (optionally
//! inline) and READ, and signaled completions on a completion queue that several
//! queue pairs may share.
//!
//! Registered memory is an array of `AtomicU8`. One-sided operations store every
//! destination byte with release ordering in increasing address order, so a reader
//! that observes a byte with acquire ordering also observes every byte the same
//! operation wrote before it. Local probes of remotely written memory must go
//! through the `*_acquire` accessors.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::error::{Result, TransportError};
use crate::spin::SpinPolicy;

/// Device name served by the software fabric.
pub const SOFT_DEVICE: &str = "soft";

static MR_COUNTER: AtomicU64 = AtomicU64::new(1);
static QP_COUNTER: AtomicU64 = AtomicU64::new(1);
static CQ_COUNTER: AtomicU64 = AtomicU64::new(1);
static FABRIC_COUNTER: AtomicU64 = AtomicU64::new(1);
static WR_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const LOCAL_READ: Self = Self(1);
    pub const LOCAL_WRITE: Self = Self(2);
    pub const REMOTE_READ: Self = Self(4);
    pub const REMOTE_WRITE: Self = Self(8);
    pub const ALL: Self = Self(0xF);

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn empty() -> Self {
        Self(0)
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QpState {
    #[default]
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrOpcode {
    RdmaWrite,
    RdmaRead,
}

/// Address of a queue pair, exchanged out of band before connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpAddress {
    pub qp_num: u32,
    pub lid: u16,
}

/// Descriptor that authorizes one-sided access to a peer's memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRegion {
    pub address: u64,
    pub key: u32,
}

impl RemoteRegion {
    /// The descriptor shifted `offset` bytes into the region.
    pub fn at(self, offset: usize) -> Self {
        Self {
            address: self.address + offset as u64,
            key: self.key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEntry {
    pub wr_id: u64,
    pub qp_num: u32,
    pub opcode: WrOpcode,
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Device to open; only [`SOFT_DEVICE`] is served in-process.
    pub device: String,
    /// Largest payload accepted by an inline WRITE.
    pub max_inline: usize,
    /// Upper bound on the total bytes registered at once.
    pub max_registered_bytes: usize,
    /// Entries per completion queue.
    pub cq_capacity: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            device: SOFT_DEVICE.to_string(),
            max_inline: 256,
            max_registered_bytes: 4 * 1024 * 1024 * 1024,
            cq_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct FabricStats {
    pub operations_completed: u64,
    pub operations_failed: u64,
    pub inline_writes: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Backing memory of a registered region.
struct RegionBuf {
    bytes: Box<[AtomicU8]>,
}

impl RegionBuf {
    fn zeroed(len: usize) -> Self {
        Self {
            bytes: (0..len).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    fn address(&self) -> u64 {
        self.bytes.as_ptr() as usize as u64
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(TransportError::RemoteAccess {
                reason: format!(
                    "range {offset}+{len} outside region of {} bytes",
                    self.len()
                ),
            }),
        }
    }

    fn copy_from(&self, offset: usize, src: &RegionBuf, src_offset: usize, len: usize) {
        let dst = &self.bytes[offset..offset + len];
        let src = &src.bytes[src_offset..src_offset + len];
        for (d, s) in dst.iter().zip(src) {
            d.store(s.load(Ordering::Relaxed), Ordering::Release);
        }
    }

    fn store(&self, offset: usize, src: &[u8], order: Ordering) {
        for (d, s) in self.bytes[offset..offset + src.len()].iter().zip(src) {
            d.store(*s, order);
        }
    }

    fn load(&self, offset: usize, dst: &mut [u8]) {
        for (d, s) in dst.iter_mut().zip(&self.bytes[offset..]) {
            *d = s.load(Ordering::Relaxed);
        }
    }
}

struct RegionEntry {
    buf: Arc<RegionBuf>,
    access: AccessFlags,
}

/// A software RDMA device: memory-region registry, queue-pair registry and counters.
pub struct Fabric {
    id: u64,
    lid: u16,
    config: FabricConfig,
    regions: Mutex<HashMap<u32, RegionEntry>>,
    queue_pairs: Mutex<HashSet<u32>>,
    registered_bytes: AtomicUsize,
    stats: Mutex<FabricStats>,
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("id", &self.id)
            .field("lid", &self.lid)
            .field("device", &self.config.device)
            .field("registered_bytes", &self.registered_bytes())
            .finish()
    }
}

impl Fabric {
    /// Creates an isolated software fabric.
    pub fn new(config: FabricConfig) -> Arc<Self> {
        let id = FABRIC_COUNTER.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            id,
            lid: id as u16,
            config,
            regions: Mutex::new(HashMap::new()),
            queue_pairs: Mutex::new(HashSet::new()),
            registered_bytes: AtomicUsize::new(0),
            stats: Mutex::new(FabricStats::default()),
        })
    }

    /// Opens the device named in `config`.
    pub fn open(config: FabricConfig) -> Result<Arc<Self>> {
        if config.device != SOFT_DEVICE {
            return Err(TransportError::RdmaNotAvailable {
                reason: format!(
                    "device {:?} requires verbs hardware; only {SOFT_DEVICE:?} is built in",
                    config.device
                ),
            });
        }
        Ok(Self::new(config))
    }

    /// The process-wide fabric shared by transports that are not given one explicitly.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<Fabric>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Fabric::new(FabricConfig::default()))
            .clone()
    }

    pub fn lid(&self) -> u16 {
        self.lid
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn registered_bytes(&self) -> usize {
        self.registered_bytes.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> FabricStats {
        lock(&self.stats).clone()
    }

    /// Registers `len` zeroed bytes with the given access rights.
    pub fn register(self: &Arc<Self>, len: usize, access: AccessFlags) -> Result<MemoryRegion> {
        if len == 0 {
            return Err(TransportError::ResourceExhaustion {
                reason: "cannot register an empty memory region".to_string(),
            });
        }
        let limit = self.config.max_registered_bytes;
        self.registered_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(len).filter(|total| *total <= limit)
            })
            .map_err(|used| TransportError::ResourceExhaustion {
                reason: format!(
                    "registering {len} bytes exceeds the {limit} byte limit ({used} in use)"
                ),
            })?;

        let buf = Arc::new(RegionBuf::zeroed(len));
        let id = MR_COUNTER.fetch_add(1, Ordering::Relaxed) as u32;
        let rkey = id | 0x8000_0000;
        let lkey = id | 0x4000_0000;
        lock(&self.regions).insert(
            rkey,
            RegionEntry {
                buf: Arc::clone(&buf),
                access,
            },
        );
        tracing::trace!(fabric = self.id, rkey, len, "memory region registered");
        Ok(MemoryRegion {
            fabric: Arc::clone(self),
            buf,
            access,
            lkey,
            rkey,
        })
    }

    pub fn create_completion_queue(&self) -> Arc<CompletionQueue> {
        Arc::new(CompletionQueue::new(self.config.cq_capacity))
    }

    /// Creates a queue pair in the `Reset` state that reports to `cq`.
    pub fn create_queue_pair(self: &Arc<Self>, cq: Arc<CompletionQueue>) -> Result<QueuePair> {
        let qp_num = QP_COUNTER.fetch_add(1, Ordering::Relaxed) as u32 & 0x00FF_FFFF;
        if qp_num == 0 {
            return Err(TransportError::ResourceExhaustion {
                reason: "queue pair numbers exhausted".to_string(),
            });
        }
        lock(&self.queue_pairs).insert(qp_num);
        Ok(QueuePair {
            fabric: Arc::clone(self),
            qp_num,
            state: QpState::Reset,
            cq,
            remote: None,
        })
    }

    fn deregister(&self, rkey: u32, len: usize) {
        if lock(&self.regions).remove(&rkey).is_some() {
            self.registered_bytes.fetch_sub(len, Ordering::AcqRel);
        }
    }

    fn has_queue_pair(&self, qp_num: u32) -> bool {
        lock(&self.queue_pairs).contains(&qp_num)
    }

    fn destroy_queue_pair(&self, qp_num: u32) {
        lock(&self.queue_pairs).remove(&qp_num);
    }

    /// Finds the region behind a remote descriptor and checks access rights and bounds.
    fn resolve(
        &self,
        remote: RemoteRegion,
        len: usize,
        needed: AccessFlags,
    ) -> Result<(Arc<RegionBuf>, usize)> {
        let regions = lock(&self.regions);
        let entry = regions
            .get(&remote.key)
            .ok_or_else(|| TransportError::RemoteAccess {
                reason: format!("unknown remote key 0x{:08X}", remote.key),
            })?;
        if !entry.access.contains(needed) {
            return Err(TransportError::RemoteAccess {
                reason: format!(
                    "remote key 0x{:08X} lacks {needed:?} access",
                    remote.key
                ),
            });
        }
        let offset = remote
            .address
            .checked_sub(entry.buf.address())
            .ok_or_else(|| TransportError::RemoteAccess {
                reason: format!("address 0x{:X} below region start", remote.address),
            })? as usize;
        entry.buf.check(offset, len)?;
        Ok((Arc::clone(&entry.buf), offset))
    }

    fn record(&self, update: impl FnOnce(&mut FabricStats)) {
        update(&mut lock(&self.stats));
    }
}

/// Memory registered with a [`Fabric`]; deregistered on drop.
pub struct MemoryRegion {
    fabric: Arc<Fabric>,
    buf: Arc<RegionBuf>,
    access: AccessFlags,
    lkey: u32,
    rkey: u32,
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("address", &format_args!("0x{:X}", self.address()))
            .field("len", &self.len())
            .field("access", &self.access)
            .field("rkey", &format_args!("0x{:08X}", self.rkey))
            .finish()
    }
}

impl MemoryRegion {
    pub fn address(&self) -> u64 {
        self.buf.address()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == 0
    }

    pub fn access(&self) -> AccessFlags {
        self.access
    }

    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    /// Descriptor a peer needs to target this region with one-sided operations.
    pub fn remote(&self) -> RemoteRegion {
        RemoteRegion {
            address: self.address(),
            key: self.rkey,
        }
    }

    /// Copies bytes out of the region.
    ///
    /// # Panics
    /// Panics if the range is out of bounds.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len(), "read out of bounds");
        self.buf.load(offset, dst);
    }

    /// Copies bytes into the region from the local CPU.
    ///
    /// # Panics
    /// Panics if the range is out of bounds.
    pub fn write(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len(), "write out of bounds");
        self.buf.store(offset, src, Ordering::Relaxed);
    }

    /// Overwrites a range with zeroes.
    pub fn zero(&self, offset: usize, len: usize) {
        for byte in &self.buf.bytes[offset..offset + len] {
            byte.store(0, Ordering::Relaxed);
        }
    }

    /// Loads one byte that a peer may be writing concurrently.
    pub fn load_acquire(&self, offset: usize) -> u8 {
        self.buf.bytes[offset].load(Ordering::Acquire)
    }

    /// Loads a little-endian `u64` cell that a peer updates with monotonically growing values.
    ///
    /// Bytes are read from the most significant down, so a racing update can only
    /// be under-reported, never over-reported.
    pub fn load_u64_acquire(&self, offset: usize) -> u64 {
        let mut value = 0u64;
        for i in (0..8).rev() {
            value |= (self.load_acquire(offset + i) as u64) << (8 * i);
        }
        value
    }

    pub fn store_u64(&self, offset: usize, value: u64) {
        self.buf.store(offset, &value.to_le_bytes(), Ordering::Relaxed);
    }

    /// Borrows a range as plain bytes.
    ///
    /// # Safety
    /// No one-sided operation may write the range while the borrow lives, and the
    /// bytes must already be synchronized with an acquire load.
    pub(crate) unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        let bytes = &self.buf.bytes[offset..offset + len];
        std::slice::from_raw_parts(bytes.as_ptr() as *const u8, len)
    }

    /// Borrows a range as mutable plain bytes.
    ///
    /// # Safety
    /// The range must not be accessed by anything else while the borrow lives.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        let bytes = &self.buf.bytes[offset..offset + len];
        std::slice::from_raw_parts_mut(bytes.as_ptr() as *mut u8, len)
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        self.fabric.deregister(self.rkey, self.buf.len());
    }
}

pub struct CompletionQueue {
    pub id: u64,
    entries: Mutex<VecDeque<CompletionEntry>>,
    pub capacity: usize,
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("id", &self.id)
            .field("pending", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl CompletionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            id: CQ_COUNTER.fetch_add(1, Ordering::Relaxed),
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn push(&self, entry: CompletionEntry) -> bool {
        let mut entries = lock(&self.entries);
        if entries.len() >= self.capacity {
            return false;
        }
        entries.push_back(entry);
        true
    }

    /// Pops the oldest completion regardless of which queue pair produced it.
    pub fn poll(&self) -> Option<CompletionEntry> {
        lock(&self.entries).pop_front()
    }

    /// Removes the completion of one specific work request, leaving the others queued.
    pub fn take(&self, qp_num: u32, wr_id: u64) -> Option<CompletionEntry> {
        let mut entries = lock(&self.entries);
        let pos = entries
            .iter()
            .position(|e| e.qp_num == qp_num && e.wr_id == wr_id)?;
        entries.remove(pos)
    }

    /// Busy-polls until the completion of `(qp_num, wr_id)` arrives.
    pub fn wait_for(
        &self,
        qp_num: u32,
        wr_id: u64,
        spin: &SpinPolicy,
    ) -> Result<CompletionEntry> {
        let mut found = None;
        spin.spin_until("work completion", || {
            found = self.take(qp_num, wr_id);
            Ok(found.is_some())
        })?;
        found.ok_or(TransportError::NotConnected)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Local side of a one-sided WRITE.
#[derive(Debug)]
pub enum WriteSource<'a> {
    /// Bytes the device reads from a registered region.
    Region {
        region: &'a MemoryRegion,
        offset: usize,
        len: usize,
    },
    /// Bytes carried in the work request itself.
    Inline(&'a [u8]),
}

impl WriteSource<'_> {
    pub fn len(&self) -> usize {
        match self {
            WriteSource::Region { len, .. } => *len,
            WriteSource::Inline(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct WriteRequest<'a> {
    pub source: WriteSource<'a>,
    pub remote: RemoteRegion,
    pub signaled: bool,
}

pub struct QueuePair {
    fabric: Arc<Fabric>,
    qp_num: u32,
    state: QpState,
    cq: Arc<CompletionQueue>,
    remote: Option<QpAddress>,
}

impl std::fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair")
            .field("qp_num", &self.qp_num)
            .field("state", &self.state)
            .field("remote", &self.remote)
            .finish()
    }
}

impl QueuePair {
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    pub fn state(&self) -> QpState {
        self.state
    }

    pub fn remote(&self) -> Option<QpAddress> {
        self.remote
    }

    pub fn completion_queue(&self) -> &Arc<CompletionQueue> {
        &self.cq
    }

    /// Address the peer needs to connect its own queue pair to this one.
    pub fn address(&self) -> QpAddress {
        QpAddress {
            qp_num: self.qp_num,
            lid: self.fabric.lid,
        }
    }

    /// Moves the queue pair through Init and RTR to RTS, targeting `remote`.
    pub fn connect(&mut self, remote: QpAddress) -> Result<()> {
        self.modify_to_init()?;
        if remote.lid != self.fabric.lid || !self.fabric.has_queue_pair(remote.qp_num) {
            self.state = QpState::Error;
            return Err(TransportError::RemoteAccess {
                reason: format!(
                    "queue pair {} on lid {} is not reachable from lid {}",
                    remote.qp_num, remote.lid, self.fabric.lid
                ),
            });
        }
        self.modify_to_rtr(remote)?;
        self.modify_to_rts()?;
        tracing::debug!(
            qp_num = self.qp_num,
            remote_qp_num = remote.qp_num,
            "queue pair connected"
        );
        Ok(())
    }

    fn modify_to_init(&mut self) -> Result<()> {
        self.transition(QpState::Reset, QpState::Init)
    }

    fn modify_to_rtr(&mut self, remote: QpAddress) -> Result<()> {
        self.transition(QpState::Init, QpState::ReadyToReceive)?;
        self.remote = Some(remote);
        Ok(())
    }

    fn modify_to_rts(&mut self) -> Result<()> {
        self.transition(QpState::ReadyToReceive, QpState::ReadyToSend)
    }

    fn transition(&mut self, from: QpState, to: QpState) -> Result<()> {
        if self.state != from {
            return Err(self.state_error());
        }
        self.state = to;
        Ok(())
    }

    fn state_error(&self) -> TransportError {
        TransportError::QueuePairState {
            qp_num: self.qp_num,
            state: self.state,
        }
    }

    /// Posts a one-sided WRITE and returns its work-request id.
    ///
    /// A failed operation moves the queue pair into the `Error` state, after which
    /// every further post fails.
    pub fn post_write(&mut self, request: WriteRequest<'_>) -> Result<u64> {
        if self.state != QpState::ReadyToSend {
            return Err(self.state_error());
        }
        let len = request.source.len();
        let result = self.execute_write(&request);
        self.complete(WrOpcode::RdmaWrite, len, request.signaled, result)
    }

    fn execute_write(&self, request: &WriteRequest<'_>) -> Result<()> {
        let len = request.source.len();
        let (dst, dst_offset) =
            self.fabric
                .resolve(request.remote, len, AccessFlags::REMOTE_WRITE)?;
        match request.source {
            WriteSource::Region {
                region,
                offset,
                len,
            } => {
                if !region.access.contains(AccessFlags::LOCAL_READ) {
                    return Err(TransportError::RemoteAccess {
                        reason: "source region lacks LOCAL_READ".to_string(),
                    });
                }
                region.buf.check(offset, len)?;
                dst.copy_from(dst_offset, &region.buf, offset, len);
            }
            WriteSource::Inline(bytes) => {
                if bytes.len() > self.fabric.config.max_inline {
                    return Err(TransportError::PayloadTooLarge {
                        size: bytes.len(),
                        max_size: self.fabric.config.max_inline,
                    });
                }
                dst.store(dst_offset, bytes, Ordering::Release);
                self.fabric.record(|s| s.inline_writes += 1);
            }
        }
        self.fabric.record(|s| s.bytes_written += len as u64);
        Ok(())
    }

    /// Posts a one-sided READ of `len` bytes from `remote` into `local` at `local_offset`.
    pub fn post_read(
        &mut self,
        local: &MemoryRegion,
        local_offset: usize,
        len: usize,
        remote: RemoteRegion,
        signaled: bool,
    ) -> Result<u64> {
        if self.state != QpState::ReadyToSend {
            return Err(self.state_error());
        }
        let result = (|| {
            if !local.access.contains(AccessFlags::LOCAL_WRITE) {
                return Err(TransportError::RemoteAccess {
                    reason: "destination region lacks LOCAL_WRITE".to_string(),
                });
            }
            local.buf.check(local_offset, len)?;
            let (src, src_offset) = self.fabric.resolve(remote, len, AccessFlags::REMOTE_READ)?;
            local.buf.copy_from(local_offset, &src, src_offset, len);
            self.fabric.record(|s| s.bytes_read += len as u64);
            Ok(())
        })();
        self.complete(WrOpcode::RdmaRead, len, signaled, result)
    }

    fn complete(
        &mut self,
        opcode: WrOpcode,
        len: usize,
        signaled: bool,
        result: Result<()>,
    ) -> Result<u64> {
        if let Err(e) = result {
            self.state = QpState::Error;
            self.fabric.record(|s| s.operations_failed += 1);
            tracing::debug!(qp_num = self.qp_num, error = %e, "work request failed");
            return Err(e);
        }
        let wr_id = WR_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.fabric.record(|s| s.operations_completed += 1);
        if signaled {
            let entry = CompletionEntry {
                wr_id,
                qp_num: self.qp_num,
                opcode,
                bytes_transferred: len as u64,
            };
            if !self.cq.push(entry) {
                self.state = QpState::Error;
                return Err(TransportError::ResourceExhaustion {
                    reason: format!("completion queue {} overrun", self.cq.id),
                });
            }
        }
        Ok(wr_id)
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        self.fabric.destroy_queue_pair(self.qp_num);
    }
}
