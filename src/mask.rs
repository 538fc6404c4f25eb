//! XOR masking as defined in RFC 6455 Section 5.3.
//!
//! Masking is its own inverse, so the same routine masks outgoing payloads and
//! unmasks incoming ones.

/// Generates a fresh masking key.
#[inline]
pub fn random_key() -> [u8; 4] {
    rand::random()
}

/// Applies `key` to `buf`, byte `i` being XORed with `key[i % 4]`.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    let word = u32::from_ne_bytes(key);
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let masked = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }
    // the tail starts on a multiple of 4, so the key index restarts at 0
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= key[i];
    }
}

/// Bytewise reference implementation.
#[cfg(test)]
fn apply_mask_bytewise(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}
