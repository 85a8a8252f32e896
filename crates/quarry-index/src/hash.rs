/// Hex-encoded BLAKE3 digest of the exact bytes of `content`.
///
/// No normalisation is applied; whitespace differences produce different digests.
#[must_use]
pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}
