//! WebSocket payload masking
//!
//! Masking and unmasking are the same XOR with a repeating 4-byte key.
//! The key index runs across the whole payload, so a payload split over
//! several buffers is masked as if it were contiguous.
//!
//! Supports multiple RNG backends via feature flags:
//! - `fastrand`: fast PRNG (default)
//! - `getrandom`: cryptographically secure RNG
//! - `rand_rng`: alternative PRNG (prefer if `rand` is already in dependency tree)

use bytes::BytesMut;

/// XOR `data` in place with a repeating 4-byte mask
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    if data.is_empty() {
        return;
    }

    let mask_u64 = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ mask_u64;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Apply the mask to a slice that starts `offset` bytes into the payload
#[inline]
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) {
    let offset = offset & 3;
    if offset == 0 {
        apply_mask(data, mask);
        return;
    }

    let rotated_mask = [
        mask[offset],
        mask[(offset + 1) & 3],
        mask[(offset + 2) & 3],
        mask[(offset + 3) & 3],
    ];
    apply_mask(data, rotated_mask);
}

/// Unmask (or mask) a payload held in an ordered list of buffers
///
/// Byte `i` of the concatenated payload is XORed with `mask[i % 4]`; the
/// key position is carried from one buffer to the next.
pub fn unmask(mask: [u8; 4], buffers: &mut [BytesMut]) {
    let mut offset = 0usize;
    for buf in buffers.iter_mut() {
        apply_mask_offset(buf, mask, offset);
        offset += buf.len();
    }
}

/// Generate a random mask for an outbound frame
///
/// The RNG implementation is selected via feature flags:
/// - `fastrand` (default): fast, non-cryptographic PRNG
/// - `getrandom`: cryptographically secure RNG, `fastrand` if the OS has no entropy
/// - `rand_rng`: uses the `rand` crate
///
/// If multiple features are enabled, priority is: getrandom > rand_rng > fastrand.
/// If no RNG feature is enabled, this function will fail to compile.
#[inline]
pub fn generate_mask() -> [u8; 4] {
    generate_mask_inner()
}

#[cfg(feature = "getrandom")]
#[inline]
fn generate_mask_inner() -> [u8; 4] {
    let mut buf = [0u8; 4];
    os_key_or_fallback(getrandom::getrandom(&mut buf).ok().map(|()| buf))
}

/// Use the OS key, or a `fastrand` key when OS entropy is unavailable
#[cfg(feature = "getrandom")]
#[inline]
fn os_key_or_fallback(os_key: Option<[u8; 4]>) -> [u8; 4] {
    os_key.unwrap_or_else(|| fastrand::u32(..).to_ne_bytes())
}

#[cfg(all(feature = "rand_rng", not(feature = "getrandom")))]
#[inline]
fn generate_mask_inner() -> [u8; 4] {
    use rand::Rng;
    rand::rng().random()
}

#[cfg(all(
    feature = "fastrand",
    not(feature = "getrandom"),
    not(feature = "rand_rng")
))]
#[inline]
fn generate_mask_inner() -> [u8; 4] {
    fastrand::u32(..).to_ne_bytes()
}

#[cfg(not(any(feature = "fastrand", feature = "getrandom", feature = "rand_rng")))]
fn generate_mask_inner() -> [u8; 4] {
    compile_error!("At least one RNG feature must be enabled: fastrand, getrandom, or rand_rng");
}
