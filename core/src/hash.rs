use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const READ_BLOCK: usize = 8 * 1024;

/// SHA-256 over a full byte stream, read in 8 KiB blocks. Lowercase hex.
pub fn file_hash<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; READ_BLOCK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn file_hash_path(path: impl AsRef<Path>) -> std::io::Result<String> {
    let file = std::fs::File::open(path)?;
    file_hash(std::io::BufReader::new(file))
}

/// SHA-256 over the UTF-8 encoding of cleaned chunk text. Lowercase hex.
pub fn semantic_hash(cleaned_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cleaned_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Length-prefixed digest over several parts, used for link fingerprints.
/// The prefix keeps ("ab","c") and ("a","bc") distinct.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
