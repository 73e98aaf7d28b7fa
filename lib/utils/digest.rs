//! Digest helpers shared by the asset layer and the image codecs.
//!
//! Two digests appear throughout the store: the *diff-ID* of a layer (the
//! SHA-256 of its uncompressed tar stream) and the *chain-ID* used as the
//! per-layer directory name in Docker-v1 archives.

use sha2::{Digest, Sha256};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The algorithm prefix of every digest produced by the store
pub const SHA256_PREFIX: &str = "sha256:";

/// The digest of empty input; the value of an asset digest before any pack
/// or unpack has run
pub const EMPTY_DIGEST: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Computes the hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(bytes.as_ref()))
}

/// Formats a hex digest with the `sha256:` algorithm prefix.
pub fn to_digest(hex: &str) -> String {
    format!("{}{}", SHA256_PREFIX, hex)
}

/// Returns the hex portion of a prefixed digest. Digests without a known
/// prefix are returned unchanged.
pub fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix(SHA256_PREFIX).unwrap_or(digest)
}

/// Derives the chain-ID of a layer from its parent's chain-ID hex and its own
/// diff-ID hex. The root layer passes an empty `parent_hex`.
pub fn chain_id(parent_hex: &str, diff_hex: &str) -> String {
    sha256_hex(format!("{} {}", parent_hex, diff_hex))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_empty_input() {
        assert_eq!(to_digest(&sha256_hex([])), EMPTY_DIGEST);
    }

    #[test]
    fn test_digest_hex_strips_prefix() {
        assert_eq!(digest_hex("sha256:abcdef"), "abcdef");
        assert_eq!(digest_hex("abcdef"), "abcdef");
    }

    #[test]
    fn test_digest_chain_id_accumulates() {
        let root = chain_id("", "1111");
        assert_eq!(root, sha256_hex(" 1111"));

        let child = chain_id(&root, "2222");
        assert_eq!(child, sha256_hex(format!("{} 2222", root)));
        assert_ne!(root, child);
    }
}
