//! Integrity: per-chunk word-sum checksum (wire level) and SHA-256 content hash (catalog level).

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// 32-bit word-sum over `payload` with end-around carry.
///
/// Words are taken big-endian, 4 bytes at a time. A trailing partial word is
/// folded in as the value of its bytes alone (as if left-padded with zeros).
pub fn checksum(payload: &[u8]) -> u32 {
    let mut words = payload.chunks_exact(4);
    let mut total = 0u32;
    for word in words.by_ref() {
        total = add_with_carry(total, u32::from_be_bytes([word[0], word[1], word[2], word[3]]));
    }
    let tail = words.remainder();
    if !tail.is_empty() {
        let value = tail.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
        total = add_with_carry(total, value);
    }
    total
}

/// Adds 1 only on a real unsigned overflow, so a word added to a zero total never gains a carry.
/// Peers that add the extra 1 whenever the previous total was zero compute different checksums
/// and are not wire-compatible with this node.
fn add_with_carry(total: u32, word: u32) -> u32 {
    let (sum, overflowed) = total.overflowing_add(word);
    if overflowed {
        sum.wrapping_add(1)
    } else {
        sum
    }
}

/// Checksum rendered as lowercase hex, no fixed width (`"0"`, `"1f"`, ...).
pub fn checksum_hex(payload: &[u8]) -> String {
    format!("{:x}", checksum(payload))
}

/// Compare a payload against a hex checksum field. Surrounding whitespace in `expected` is ignored.
pub fn verify_checksum(payload: &[u8], expected: &str) -> bool {
    checksum_hex(payload) == expected.trim()
}

/// SHA-256 of a byte slice, as lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 of a file's contents, streamed, as lowercase hex.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
