//! Erasure and comparison primitives for credential bytes.

use core::fmt::Write;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Overwrite a buffer with zeros.
///
/// Uses a compiler-fence-backed zeroize so the write is not optimized away.
pub fn wipe(buf: &mut [u8]) {
    buf.zeroize();
}

/// Compare two byte strings without early exit on the first mismatch.
///
/// Length differences still return false; only content comparison is
/// constant-time.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    bool::from(a.ct_eq(b))
}

/// SHA-256 of `bytes` as lowercase hex.
///
/// Used to log or compare certificate material by digest instead of value.
pub fn fingerprint_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wipe_zeroes_every_byte() {
        let mut buf = vec![0xAB; 32];
        wipe(&mut buf);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn constant_time_eq_matches_plain_equality() {
        assert!(constant_time_eq(b"sello-2024", b"sello-2024"));
        assert!(!constant_time_eq(b"sello-2024", b"sello-2025"));
        assert!(!constant_time_eq(b"short", b"longer-value"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn fingerprint_matches_known_vector() {
        // SHA-256("abc") from FIPS 180-2.
        assert_eq!(
            fingerprint_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
