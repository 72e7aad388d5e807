//! Shared fixtures for the integration tests.

use ringlink_transport::channel::ChannelConfig;
use ringlink_transport::config::ShmConfig;
use ringlink_transport::retry::RetryConfig;
use ringlink_transport::{TransportClient, TransportConfig, TransportServer};

/// Ring size used by the RDMA and shared-memory backends in tests.
pub const TEST_CAPACITY: usize = 64 * 1024;

/// Small rings, short bootstrap retries and bounded spins so a hang becomes an error.
pub fn test_config() -> TransportConfig {
    TransportConfig {
        channel: ChannelConfig {
            spin_timeout_ms: Some(10_000),
            ..ChannelConfig::with_capacity(TEST_CAPACITY)
        },
        shm: ShmConfig {
            capacity: TEST_CAPACITY,
            spin_timeout_ms: Some(10_000),
        },
        bootstrap: RetryConfig {
            max_attempts: 3,
            backoff_ms: 10,
            ..RetryConfig::default()
        },
        ..TransportConfig::default()
    }
}

/// A shared-memory address no other test process uses.
#[allow(dead_code)]
pub fn shm_addr(tag: &str) -> String {
    format!("itest/{}/{tag}", std::process::id())
}

/// Binds a server, connects a client to it and accepts.
#[allow(dead_code)]
pub async fn connect_pair<S, C>(bind_addr: &str, config: TransportConfig) -> (S, C)
where
    S: TransportServer,
    C: TransportClient,
{
    let mut server = S::bind(bind_addr, config.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let mut client = C::new(config);
    let (accepted, connected) = tokio::join!(server.accept(), client.connect(&addr));
    accepted.unwrap();
    connected.unwrap();
    assert!(client.is_connected());
    (server, client)
}
