//! Ring-buffer byte channel over one-sided RDMA WRITEs.
//!
//! Each side owns a receive ring that only its peer writes into and a send ring of
//! the same size used to stage outgoing frames at the offset they will occupy in
//! the peer's receive ring. The consumer republishes how far it has read by writing
//! a `u64` into a cell the producer registered for that purpose, so neither side
//! ever queries the other synchronously.
//!
//! A message travels as one frame:
//!
//! ```text
//! +-----------+-----------+----------------+-----------+-----------+
//! | len u32LE | tag u32LE | payload (len)  | len u32LE | tag u32LE |
//! +-----------+-----------+----------------+-----------+-----------+
//! ```
//!
//! The tag is `0xA5C3_0000 | (message_index & 0xFFFF)` and is therefore never zero,
//! so neither an all-zero payload nor a zero length looks like an empty slot. The
//! footer is the last thing written; a frame is trusted once both tags match.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Result, TransportError};
use crate::fabric::{
    AccessFlags, CompletionQueue, Fabric, MemoryRegion, QpAddress, QueuePair, RemoteRegion,
    WriteRequest, WriteSource,
};
use crate::ring::{split_range, validate_capacity, RingSlice, RingSliceMut};
use crate::spin::SpinPolicy;

/// Bytes in a frame header (and in a footer).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Framing bytes added to every message.
pub const FRAME_OVERHEAD: usize = 2 * FRAME_HEADER_SIZE;

/// Smallest ring that still holds one non-empty frame.
pub const MIN_CAPACITY: usize = 2 * FRAME_OVERHEAD;

/// Largest ring whose payload lengths still fit the 32-bit length field.
pub const MAX_CAPACITY: u64 = 1 << 32;

const TAG_BASE: u32 = 0xA5C3_0000;

/// Tag carried by the header and footer of message number `index`.
pub fn frame_tag(index: u64) -> u32 {
    TAG_BASE | (index & 0xFFFF) as u32
}

/// Channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Size of each ring in bytes; a power of two, equal on both ends.
    pub capacity: usize,
    /// Frames up to this size are written inline instead of from the send ring.
    pub max_inline: usize,
    /// Wait for the completion of each message's last WRITE before returning.
    pub wait_for_completion: bool,
    /// Consumed bytes that may accumulate before the read position is published.
    /// Zero publishes after every message.
    pub publish_threshold: usize,
    /// Upper bound on a single busy-wait; `None` waits forever.
    pub spin_timeout_ms: Option<u64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: 16 * 1024 * 1024,
            max_inline: 256,
            wait_for_completion: true,
            publish_threshold: 0,
            spin_timeout_ms: None,
        }
    }
}

impl ChannelConfig {
    /// A default configuration with the given ring size.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_capacity(self.capacity, MIN_CAPACITY)?;
        if self.capacity as u64 > MAX_CAPACITY {
            return Err(TransportError::config(format!(
                "ring capacity {} exceeds the maximum of {MAX_CAPACITY} bytes",
                self.capacity
            )));
        }
        if self.publish_threshold > self.capacity {
            return Err(TransportError::config(format!(
                "publish threshold {} exceeds ring capacity {}",
                self.publish_threshold, self.capacity
            )));
        }
        Ok(())
    }

    /// Largest payload a single message can carry.
    pub fn max_payload(&self) -> usize {
        self.capacity.saturating_sub(FRAME_OVERHEAD)
    }

    pub fn spin_policy(&self) -> SpinPolicy {
        SpinPolicy::from_millis(self.spin_timeout_ms)
    }
}

/// Per-channel counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub writes_posted: u64,
    pub inline_writes: u64,
    pub wrap_splits: u64,
    pub publishes: u64,
    pub send_spins: u64,
    pub receive_spins: u64,
}

/// Memory and queue pair one side of a channel registers before the handshake.
#[derive(Debug)]
pub struct LocalResources {
    qp: QueuePair,
    recv_buf: MemoryRegion,
    send_buf: MemoryRegion,
    read_pos_staging: MemoryRegion,
    consumed_cell: MemoryRegion,
}

impl LocalResources {
    /// Registers both rings and both position cells and creates a queue pair.
    ///
    /// If `cq` is `None` the queue pair gets a completion queue of its own.
    pub fn allocate(
        fabric: &Arc<Fabric>,
        config: &ChannelConfig,
        cq: Option<Arc<CompletionQueue>>,
    ) -> Result<Self> {
        config.validate()?;
        let cq = cq.unwrap_or_else(|| fabric.create_completion_queue());
        let qp = fabric.create_queue_pair(cq)?;
        let recv_buf = fabric.register(
            config.capacity,
            AccessFlags::LOCAL_READ | AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
        )?;
        let send_buf = fabric.register(
            config.capacity,
            AccessFlags::LOCAL_READ | AccessFlags::LOCAL_WRITE,
        )?;
        let read_pos_staging = fabric.register(8, AccessFlags::LOCAL_READ)?;
        let consumed_cell = fabric.register(8, AccessFlags::REMOTE_WRITE)?;
        Ok(Self {
            qp,
            recv_buf,
            send_buf,
            read_pos_staging,
            consumed_cell,
        })
    }

    /// What the peer needs to know about this side.
    pub fn descriptor(&self) -> PeerResources {
        PeerResources {
            qp: self.qp.address(),
            recv_buf: self.recv_buf.remote(),
            consumed_cell: self.consumed_cell.remote(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.recv_buf.len()
    }
}

/// Descriptors of the peer's side, as learned during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerResources {
    pub qp: QpAddress,
    pub recv_buf: RemoteRegion,
    pub consumed_cell: RemoteRegion,
}

/// One end of a connected ring-buffer channel.
#[derive(Debug)]
pub struct Channel {
    config: ChannelConfig,
    capacity: usize,
    max_inline: usize,
    spin: SpinPolicy,
    local: LocalResources,
    peer: PeerResources,
    inline_scratch: Vec<u8>,

    send_pos: u64,
    remote_consumed: u64,
    sent_messages: u64,

    read_pos: u64,
    published_pos: u64,
    received_messages: u64,

    stats: ChannelStats,
}

impl Channel {
    /// Connects the local queue pair to the peer and builds the channel.
    pub fn connect(
        fabric: &Arc<Fabric>,
        mut local: LocalResources,
        peer: PeerResources,
        config: ChannelConfig,
    ) -> Result<Self> {
        config.validate()?;
        if local.capacity() != config.capacity {
            return Err(TransportError::config(format!(
                "local rings hold {} bytes but the channel is configured for {}",
                local.capacity(),
                config.capacity
            )));
        }
        local.qp.connect(peer.qp)?;
        let max_inline = config.max_inline.min(fabric.config().max_inline);
        Ok(Self {
            capacity: config.capacity,
            max_inline,
            spin: config.spin_policy(),
            inline_scratch: Vec::with_capacity(max_inline),
            config,
            local,
            peer,
            send_pos: 0,
            remote_consumed: 0,
            sent_messages: 0,
            read_pos: 0,
            published_pos: 0,
            received_messages: 0,
            stats: ChannelStats::default(),
        })
    }

    /// Two channels wired to each other on one fabric, without a wire handshake.
    pub fn loopback_pair(fabric: &Arc<Fabric>, config: ChannelConfig) -> Result<(Self, Self)> {
        let cq = fabric.create_completion_queue();
        let a = LocalResources::allocate(fabric, &config, Some(Arc::clone(&cq)))?;
        let b = LocalResources::allocate(fabric, &config, Some(cq))?;
        let (peer_of_a, peer_of_b) = (b.descriptor(), a.descriptor());
        let a = Channel::connect(fabric, a, peer_of_a, config.clone())?;
        let b = Channel::connect(fabric, b, peer_of_b, config)?;
        Ok((a, b))
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_payload(&self) -> usize {
        self.capacity - FRAME_OVERHEAD
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn qp_num(&self) -> u32 {
        self.local.qp.qp_num()
    }

    /// Bytes sent that the peer has not yet reported as consumed, per the cached position.
    pub fn outstanding(&self) -> u64 {
        self.send_pos - self.remote_consumed
    }

    pub fn send_position(&self) -> u64 {
        self.send_pos
    }

    pub fn read_position(&self) -> u64 {
        self.read_pos
    }

    fn mask(&self, pos: u64) -> usize {
        (pos as usize) & (self.capacity - 1)
    }

    // ---- writer side ------------------------------------------------------------

    fn check_payload(&self, len: usize) -> Result<()> {
        if len > self.max_payload() {
            return Err(TransportError::PayloadTooLarge {
                size: len,
                max_size: self.max_payload(),
            });
        }
        Ok(())
    }

    /// Re-reads the peer's published read position and returns the free ring space.
    fn refresh_free_space(&mut self) -> Result<usize> {
        let published = self.local.consumed_cell.load_u64_acquire(0);
        if published > self.send_pos {
            return Err(TransportError::protocol(format!(
                "peer reports {published} bytes consumed but only {} were sent",
                self.send_pos
            )));
        }
        self.remote_consumed = self.remote_consumed.max(published);
        Ok(self.capacity - (self.send_pos - self.remote_consumed) as usize)
    }

    /// Whether a `len`-byte message can be sent without waiting.
    pub fn can_send(&mut self, len: usize) -> Result<bool> {
        self.check_payload(len)?;
        Ok(self.refresh_free_space()? >= len + FRAME_OVERHEAD)
    }

    fn wait_for_space(&mut self, frame_len: usize) -> Result<()> {
        let mut spinner = self.spin.spinner("ring space");
        while self.refresh_free_space()? < frame_len {
            spinner.tick()?;
            std::hint::spin_loop();
        }
        self.stats.send_spins += spinner.spins();
        Ok(())
    }

    /// Sends one message, busy-waiting until the peer's ring has room for it.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.check_payload(data.len())?;
        let frame_len = data.len() + FRAME_OVERHEAD;
        self.wait_for_space(frame_len)?;

        let tag = frame_tag(self.sent_messages);
        let header = frame_word(data.len(), tag);
        if frame_len <= self.max_inline {
            self.inline_scratch.clear();
            self.inline_scratch.extend_from_slice(&header);
            self.inline_scratch.extend_from_slice(data);
            self.inline_scratch.extend_from_slice(&header);
            self.post_frame(frame_len, true)?;
        } else {
            let start = self.send_pos;
            self.stage(start, &header);
            self.stage(start + FRAME_HEADER_SIZE as u64, data);
            self.stage(start + (FRAME_HEADER_SIZE + data.len()) as u64, &header);
            self.post_frame(frame_len, false)?;
        }
        self.finish_send(data.len());
        Ok(())
    }

    /// Sends without waiting; returns `Ok(false)` if the ring is currently full.
    pub fn try_send(&mut self, data: &[u8]) -> Result<bool> {
        if !self.can_send(data.len())? {
            return Ok(false);
        }
        self.send(data)?;
        Ok(true)
    }

    /// Lets `fill` write up to `max_len` payload bytes straight into the send ring and
    /// sends as many as it reports. Returns that count.
    pub fn send_zc<F>(&mut self, max_len: usize, fill: F) -> Result<usize>
    where
        F: FnOnce(RingSliceMut<'_>) -> usize,
    {
        self.check_payload(max_len)?;
        self.wait_for_space(max_len + FRAME_OVERHEAD)?;

        let start = self.send_pos;
        let payload_start = start + FRAME_HEADER_SIZE as u64;
        let view = match split_range(payload_start, max_len, self.capacity).segments_pair() {
            (head, None) => {
                // SAFETY: the send ring is only read by the fabric inside `post_write`,
                // which cannot run while `fill` holds the view.
                RingSliceMut::contiguous(unsafe {
                    self.local.send_buf.slice_mut(head.offset, head.len)
                })
            }
            (head, Some(tail)) => {
                // SAFETY: as above; the two segments are disjoint.
                let (h, t) = unsafe {
                    (
                        self.local.send_buf.slice_mut(head.offset, head.len),
                        self.local.send_buf.slice_mut(tail.offset, tail.len),
                    )
                };
                RingSliceMut::new(h, t)
            }
        };
        let written = fill(view);
        if written > max_len {
            return Err(TransportError::PayloadTooLarge {
                size: written,
                max_size: max_len,
            });
        }

        let header = frame_word(written, frame_tag(self.sent_messages));
        self.stage(start, &header);
        self.stage(payload_start + written as u64, &header);
        self.post_frame(written + FRAME_OVERHEAD, false)?;
        self.finish_send(written);
        Ok(written)
    }

    /// Copies bytes into the send ring at the offset `pos` maps to.
    fn stage(&self, pos: u64, bytes: &[u8]) {
        let mut done = 0;
        for seg in split_range(pos, bytes.len(), self.capacity).segments() {
            self.local
                .send_buf
                .write(seg.offset, &bytes[done..done + seg.len]);
            done += seg.len;
        }
    }

    /// Posts the frame starting at `send_pos` as one WRITE, or two when it wraps.
    fn post_frame(&mut self, frame_len: usize, inline: bool) -> Result<()> {
        let split = split_range(self.send_pos, frame_len, self.capacity);
        if split.is_wrapped() {
            self.stats.wrap_splits += 1;
        }
        let segments: Vec<_> = split.segments().collect();
        let last = segments.len() - 1;
        let mut done = 0;
        let mut last_wr = 0;
        for (i, seg) in segments.into_iter().enumerate() {
            let source = if inline {
                WriteSource::Inline(&self.inline_scratch[done..done + seg.len])
            } else {
                WriteSource::Region {
                    region: &self.local.send_buf,
                    offset: seg.offset,
                    len: seg.len,
                }
            };
            last_wr = self.local.qp.post_write(WriteRequest {
                source,
                remote: self.peer.recv_buf.at(seg.offset),
                signaled: i == last && self.config.wait_for_completion,
            })?;
            done += seg.len;
            self.stats.writes_posted += 1;
            if inline {
                self.stats.inline_writes += 1;
            }
        }
        if self.config.wait_for_completion {
            let qp_num = self.local.qp.qp_num();
            self.local
                .qp
                .completion_queue()
                .wait_for(qp_num, last_wr, &self.spin)?;
        }
        Ok(())
    }

    fn finish_send(&mut self, payload_len: usize) {
        self.send_pos += (payload_len + FRAME_OVERHEAD) as u64;
        self.sent_messages += 1;
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += payload_len as u64;
    }

    // ---- reader side ------------------------------------------------------------

    /// Loads a little-endian `u32` at virtual position `pos`, most significant byte first.
    fn load_u32(&self, pos: u64) -> u32 {
        let mut value = 0u32;
        for i in (0..4u64).rev() {
            let byte = self.local.recv_buf.load_acquire(self.mask(pos + i));
            value |= (byte as u32) << (8 * i);
        }
        value
    }

    /// Whether the header of the next message has arrived.
    pub fn has_data(&self) -> bool {
        self.load_u32(self.read_pos + 4) == frame_tag(self.received_messages)
    }

    /// Length of the next message once it has fully arrived.
    pub fn peek_len(&self) -> Result<Option<usize>> {
        if !self.has_data() {
            return Ok(None);
        }
        let len = self.load_u32(self.read_pos) as usize;
        if len > self.max_payload() {
            return Err(TransportError::protocol(format!(
                "frame header announces {len} bytes in a ring of {}",
                self.capacity
            )));
        }
        let footer = self.read_pos + (FRAME_HEADER_SIZE + len) as u64;
        if self.load_u32(footer + 4) != frame_tag(self.received_messages) {
            return Ok(None);
        }
        let footer_len = self.load_u32(footer) as usize;
        if footer_len != len {
            return Err(TransportError::protocol(format!(
                "frame footer length {footer_len} disagrees with header length {len}"
            )));
        }
        Ok(Some(len))
    }

    fn wait_for_message(&mut self) -> Result<usize> {
        let mut spinner = self.spin.spinner("incoming message");
        let len = loop {
            if let Some(len) = self.peek_len()? {
                break len;
            }
            spinner.tick()?;
            std::hint::spin_loop();
        };
        self.stats.receive_spins += spinner.spins();
        Ok(len)
    }

    fn payload_view(&self, len: usize) -> RingSlice<'_> {
        let start = self.read_pos + FRAME_HEADER_SIZE as u64;
        // SAFETY: the footer tag was observed with acquire ordering, so the whole
        // frame is visible, and the peer does not write into it again until the
        // read position is published past it.
        unsafe {
            match split_range(start, len, self.capacity).segments_pair() {
                (head, None) => {
                    RingSlice::contiguous(self.local.recv_buf.slice(head.offset, head.len))
                }
                (head, Some(tail)) => RingSlice::new(
                    self.local.recv_buf.slice(head.offset, head.len),
                    self.local.recv_buf.slice(tail.offset, tail.len),
                ),
            }
        }
    }

    /// Zeroes the frame, advances the read position and publishes it when due.
    fn consume(&mut self, len: usize) -> Result<()> {
        let frame_len = len + FRAME_OVERHEAD;
        for seg in split_range(self.read_pos, frame_len, self.capacity).segments() {
            self.local.recv_buf.zero(seg.offset, seg.len);
        }
        self.read_pos += frame_len as u64;
        self.received_messages += 1;
        self.stats.messages_received += 1;
        self.stats.bytes_received += len as u64;

        let unpublished = (self.read_pos - self.published_pos) as usize;
        if self.config.publish_threshold == 0
            || unpublished >= self.config.publish_threshold
            || !self.has_data()
        {
            self.publish()?;
        }
        Ok(())
    }

    fn publish(&mut self) -> Result<()> {
        self.local.read_pos_staging.store_u64(0, self.read_pos);
        self.local.qp.post_write(WriteRequest {
            source: WriteSource::Region {
                region: &self.local.read_pos_staging,
                offset: 0,
                len: 8,
            },
            remote: self.peer.consumed_cell,
            signaled: false,
        })?;
        self.published_pos = self.read_pos;
        self.stats.publishes += 1;
        tracing::trace!(
            qp_num = self.qp_num(),
            read_pos = self.read_pos,
            "read position published"
        );
        Ok(())
    }

    /// Receives the next message, busy-waiting until it arrives.
    pub fn receive(&mut self) -> Result<Vec<u8>> {
        self.receive_zc(|view| view.to_vec())
    }

    /// Receives the next message into `buf` and returns its length.
    ///
    /// Fails with [`TransportError::BufferTooSmall`] if the message does not fit, in
    /// which case it stays in the ring.
    pub fn receive_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = self.wait_for_message()?;
        if len > buf.len() {
            return Err(TransportError::BufferTooSmall {
                needed: len,
                available: buf.len(),
            });
        }
        self.payload_view(len).copy_to(&mut buf[..len]);
        self.consume(len)?;
        Ok(len)
    }

    /// Hands the next message to `read` in place and returns what it returns.
    pub fn receive_zc<F, R>(&mut self, read: F) -> Result<R>
    where
        F: FnOnce(RingSlice<'_>) -> R,
    {
        let len = self.wait_for_message()?;
        let out = read(self.payload_view(len));
        self.consume(len)?;
        Ok(out)
    }
}

fn frame_word(len: usize, tag: u32) -> [u8; FRAME_HEADER_SIZE] {
    debug_assert!(len as u64 <= u32::MAX as u64);
    let mut word = [0u8; FRAME_HEADER_SIZE];
    word[..4].copy_from_slice(&(len as u32).to_le_bytes());
    word[4..].copy_from_slice(&tag.to_le_bytes());
    word
}
