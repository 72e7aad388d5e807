//! Out-of-band bootstrap of a ring-buffer channel.
//!
//! Both ends run the same sequence over any reliable ordered stream: register local
//! resources, then exchange four fixed-size records, always writing their own before
//! reading the peer's. All integers are big-endian.
//!
//! | record        | bytes | layout                                               |
//! |---------------|-------|------------------------------------------------------|
//! | hello         | 16    | magic u32, version u16, reserved u16, capacity u64   |
//! | queue pair    | 8     | qp number u32, lid u16, reserved u16                 |
//! | receive ring  | 12    | key u32, address u64                                 |
//! | position cell | 12    | key u32, address u64                                 |

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::channel::{Channel, ChannelConfig, LocalResources, PeerResources};
use crate::error::{map_stream_err, Result, TransportError};
use crate::fabric::{Fabric, QpAddress, RemoteRegion};

/// "RLNK"
pub const HANDSHAKE_MAGIC: u32 = 0x524C_4E4B;
pub const HANDSHAKE_VERSION: u16 = 1;

/// First record of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub magic: u32,
    pub version: u16,
    pub capacity: u64,
}

impl Hello {
    pub const SIZE: usize = 16;

    pub fn new(capacity: usize) -> Self {
        Self {
            magic: HANDSHAKE_MAGIC,
            version: HANDSHAKE_VERSION,
            capacity: capacity as u64,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[8..16].copy_from_slice(&self.capacity.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            magic: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            version: u16::from_be_bytes([bytes[4], bytes[5]]),
            capacity: u64::from_be_bytes(read_array(&bytes[8..16])),
        }
    }

    /// Checks a peer's hello against the local ring size.
    pub fn check(&self, local_capacity: usize) -> Result<()> {
        if self.magic != HANDSHAKE_MAGIC {
            return Err(TransportError::protocol(format!(
                "bad handshake magic 0x{:08X}",
                self.magic
            )));
        }
        if self.version != HANDSHAKE_VERSION {
            return Err(TransportError::protocol(format!(
                "unsupported handshake version {} (expected {HANDSHAKE_VERSION})",
                self.version
            )));
        }
        if self.capacity != local_capacity as u64 {
            return Err(TransportError::config(format!(
                "ring capacity mismatch: local {local_capacity}, peer {}",
                self.capacity
            )));
        }
        Ok(())
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

pub fn encode_qp_address(addr: QpAddress) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&addr.qp_num.to_be_bytes());
    out[4..6].copy_from_slice(&addr.lid.to_be_bytes());
    out
}

pub fn decode_qp_address(bytes: &[u8; 8]) -> QpAddress {
    QpAddress {
        qp_num: u32::from_be_bytes(read_array(&bytes[0..4])),
        lid: u16::from_be_bytes(read_array(&bytes[4..6])),
    }
}

pub fn encode_remote_region(region: RemoteRegion) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0..4].copy_from_slice(&region.key.to_be_bytes());
    out[4..12].copy_from_slice(&region.address.to_be_bytes());
    out
}

pub fn decode_remote_region(bytes: &[u8; 12]) -> RemoteRegion {
    RemoteRegion {
        key: u32::from_be_bytes(read_array(&bytes[0..4])),
        address: u64::from_be_bytes(read_array(&bytes[4..12])),
    }
}

/// Writes our record, then reads the peer's record of the same size.
async fn exchange<S, const N: usize>(stream: &mut S, ours: [u8; N]) -> Result<[u8; N]>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&ours).await.map_err(map_stream_err)?;
    stream.flush().await.map_err(map_stream_err)?;
    let mut theirs = [0u8; N];
    stream
        .read_exact(&mut theirs)
        .await
        .map_err(map_stream_err)?;
    Ok(theirs)
}

/// Runs the handshake over `stream` and returns the connected channel.
///
/// Local resources are allocated before anything is sent; if that fails nothing
/// reaches the wire. On any later failure the resources are released on return.
pub async fn establish<S>(
    stream: &mut S,
    fabric: &Arc<Fabric>,
    config: &ChannelConfig,
) -> Result<Channel>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local = LocalResources::allocate(fabric, config, None)?;
    let ours = local.descriptor();

    let hello = Hello::decode(&exchange(stream, Hello::new(config.capacity).encode()).await?);
    hello.check(config.capacity)?;

    let qp = decode_qp_address(&exchange(stream, encode_qp_address(ours.qp)).await?);
    let recv_buf =
        decode_remote_region(&exchange(stream, encode_remote_region(ours.recv_buf)).await?);
    let consumed_cell =
        decode_remote_region(&exchange(stream, encode_remote_region(ours.consumed_cell)).await?);
    tracing::debug!(
        local_qp = ours.qp.qp_num,
        remote_qp = qp.qp_num,
        remote_rkey = recv_buf.key,
        capacity = config.capacity,
        "handshake records exchanged"
    );

    let peer = PeerResources {
        qp,
        recv_buf,
        consumed_cell,
    };
    Channel::connect(fabric, local, peer, config.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::FabricConfig;

    #[test]
    fn test_hello_layout() {
        let bytes = Hello::new(4096).encode();
        assert_eq!(&bytes[0..4], b"RLNK");
        assert_eq!(&bytes[4..8], &[0, 1, 0, 0]);
        assert_eq!(&bytes[8..16], &4096u64.to_be_bytes());
        assert_eq!(Hello::decode(&bytes), Hello::new(4096));
    }

    #[test]
    fn test_hello_check() {
        assert!(Hello::new(4096).check(4096).is_ok());
        assert!(matches!(
            Hello::new(4096).check(8192),
            Err(TransportError::ConfigurationError { .. })
        ));
        let bad_magic = Hello {
            magic: 0xDEAD_BEEF,
            ..Hello::new(4096)
        };
        assert!(matches!(
            bad_magic.check(4096),
            Err(TransportError::ProtocolViolation { .. })
        ));
        let bad_version = Hello {
            version: 9,
            ..Hello::new(4096)
        };
        assert!(bad_version.check(4096).is_err());
    }

    #[test]
    fn test_record_layouts_are_big_endian() {
        let qp = QpAddress {
            qp_num: 0x0102_0304,
            lid: 0x0506,
        };
        let bytes = encode_qp_address(qp);
        assert_eq!(bytes, [1, 2, 3, 4, 5, 6, 0, 0]);
        assert_eq!(decode_qp_address(&bytes), qp);

        let region = RemoteRegion {
            address: 0x1122_3344_5566_7788,
            key: 0xAABB_CCDD,
        };
        let bytes = encode_remote_region(region);
        assert_eq!(&bytes[0..4], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&bytes[4..12], &0x1122_3344_5566_7788u64.to_be_bytes());
        assert_eq!(decode_remote_region(&bytes), region);
    }

    #[tokio::test]
    async fn test_establish_over_duplex() {
        let fabric = Fabric::new(FabricConfig::default());
        let config = ChannelConfig::with_capacity(4096);
        let (mut left, mut right) = tokio::io::duplex(256);
        let (a, b) = tokio::join!(
            establish(&mut left, &fabric, &config),
            establish(&mut right, &fabric, &config)
        );
        let (mut a, mut b) = (a.unwrap(), b.unwrap());
        a.send(b"over the fabric").unwrap();
        assert_eq!(b.receive().unwrap(), b"over the fabric");
        b.send(b"and back").unwrap();
        assert_eq!(a.receive().unwrap(), b"and back");
    }

    #[tokio::test]
    async fn test_capacity_mismatch_refused_by_both() {
        let fabric = Fabric::new(FabricConfig::default());
        let (mut left, mut right) = tokio::io::duplex(256);
        let small = ChannelConfig::with_capacity(4096);
        let large = ChannelConfig::with_capacity(8192);
        let (a, b) = tokio::join!(
            establish(&mut left, &fabric, &small),
            establish(&mut right, &fabric, &large)
        );
        assert!(matches!(a, Err(TransportError::ConfigurationError { .. })));
        assert!(matches!(b, Err(TransportError::ConfigurationError { .. })));
        assert_eq!(fabric.registered_bytes(), 0);
    }

    #[tokio::test]
    async fn test_garbage_peer_is_protocol_violation() {
        let fabric = Fabric::new(FabricConfig::default());
        let config = ChannelConfig::with_capacity(4096);
        let (mut left, mut right) = tokio::io::duplex(256);
        let peer = async {
            right.write_all(&[0x42; 16]).await.unwrap();
            let mut sink = [0u8; 16];
            right.read_exact(&mut sink).await.unwrap();
        };
        let (result, ()) = tokio::join!(establish(&mut left, &fabric, &config), peer);
        assert!(matches!(
            result,
            Err(TransportError::ProtocolViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_peer_hangup_is_connection_reset() {
        let fabric = Fabric::new(FabricConfig::default());
        let config = ChannelConfig::with_capacity(4096);
        let (mut left, right) = tokio::io::duplex(256);
        drop(right);
        let result = establish(&mut left, &fabric, &config).await;
        assert!(matches!(result, Err(TransportError::ConnectionReset)));
    }

    #[tokio::test]
    async fn test_invalid_capacity_sends_nothing() {
        let fabric = Fabric::new(FabricConfig::default());
        let config = ChannelConfig::with_capacity(1000);
        let (mut left, mut right) = tokio::io::duplex(256);
        let result = establish(&mut left, &fabric, &config).await;
        assert!(matches!(
            result,
            Err(TransportError::ConfigurationError { .. })
        ));
        drop(left);
        let mut buf = Vec::new();
        right.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_peers_on_different_fabrics_cannot_connect() {
        let fabric_a = Fabric::new(FabricConfig::default());
        let fabric_b = Fabric::new(FabricConfig::default());
        let config = ChannelConfig::with_capacity(4096);
        let (mut left, mut right) = tokio::io::duplex(256);
        let (a, b) = tokio::join!(
            establish(&mut left, &fabric_a, &config),
            establish(&mut right, &fabric_b, &config)
        );
        assert!(matches!(a, Err(TransportError::RemoteAccess { .. })));
        assert!(matches!(b, Err(TransportError::RemoteAccess { .. })));
    }
}
