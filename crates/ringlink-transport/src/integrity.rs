//! Payload verification used by the benchmarks and tests.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::error::{Result, TransportError};

/// Compares two buffers byte by byte and reports the first difference.
///
/// A length mismatch is reported at the first offset past the shorter buffer, with
/// a missing byte shown as `0x00`.
pub fn verify(expected: &[u8], got: &[u8]) -> Result<()> {
    if let Some(offset) = expected.iter().zip(got).position(|(e, g)| e != g) {
        return Err(TransportError::IntegrityMismatch {
            offset,
            expected: expected[offset],
            got: got[offset],
        });
    }
    if expected.len() != got.len() {
        let offset = expected.len().min(got.len());
        return Err(TransportError::IntegrityMismatch {
            offset,
            expected: expected.get(offset).copied().unwrap_or(0),
            got: got.get(offset).copied().unwrap_or(0),
        });
    }
    Ok(())
}

/// Deterministic pseudo-random bytes for a given seed.
pub fn pattern(len: usize, seed: u64) -> Vec<u8> {
    let mut out = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut out);
    out
}

/// The 64-byte ping-pong message: ASCII digits `1..9,0` repeated, NUL-terminated.
pub fn ping_message() -> [u8; 64] {
    let mut msg = [0u8; 64];
    for (i, byte) in msg.iter_mut().take(63).enumerate() {
        *byte = b'0' + ((i + 1) % 10) as u8;
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_equal() {
        assert!(verify(b"abc", b"abc").is_ok());
        assert!(verify(b"", b"").is_ok());
    }

    #[test]
    fn test_verify_reports_first_difference() {
        let err = verify(b"abcdef", b"abXdeY").unwrap_err();
        match err {
            TransportError::IntegrityMismatch {
                offset,
                expected,
                got,
            } => {
                assert_eq!(offset, 2);
                assert_eq!(expected, b'c');
                assert_eq!(got, b'X');
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_verify_length_mismatch() {
        assert!(matches!(
            verify(b"abc", b"ab"),
            Err(TransportError::IntegrityMismatch { offset: 2, expected: b'c', got: 0 })
        ));
    }

    #[test]
    fn test_pattern_is_deterministic() {
        assert_eq!(pattern(1024, 7), pattern(1024, 7));
        assert_ne!(pattern(1024, 7), pattern(1024, 8));
    }

    #[test]
    fn test_ping_message() {
        let msg = ping_message();
        assert_eq!(&msg[..10], b"1234567890");
        assert_eq!(msg[62], b'3');
        assert_eq!(msg[63], 0);
    }
}
