use sha2::{Digest, Sha256};

/// Derives the 8-hex-char context id used for source/backup/client
/// identifiers: the last 8 hex digits of SHA-256 of the address string.
pub fn context_id(address: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(address.as_bytes());
    let digest = hasher.finalize();
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    hex[hex.len() - 8..].to_string()
}
