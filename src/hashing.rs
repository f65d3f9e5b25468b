//! Domain-separated bucket hashing.
//!
//! Every bucket assignment goes through [`stdhash`], keyed by a
//! per-manager secret so that bucket placement is unpredictable to
//! outside observers but reproducible across calls (and, given the same
//! `SecretKey`, across nodes — this is what makes the round-trip law in
//! spec §8 hold).

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::endpoint::Endpoint;
use crate::tables::{
    BUCKET_SIZE, NEW_BUCKETS_PER_SOURCE_GROUP, NEW_BUCKET_COUNT, TRIED_BUCKETS_PER_GROUP,
    TRIED_BUCKET_COUNT,
};

/// A 256-bit per-instance secret that seeds all bucket hashing.
///
/// Generated once, at manager creation, from a CSPRNG. Never persisted
/// independent of the manager (it is written as part of `serialize`, see
/// [`crate::serializer`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretKey(pub [u8; 32]);

impl SecretKey {
    /// Draw a fresh secret key from the given RNG.
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        SecretKey(bytes)
    }
}

/// SHA-256 of the concatenated inputs.
fn stdhash(chunks: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize().into()
}

/// Interpret the first 8 bytes of a domain-separated hash as a
/// big-endian `u64`.
fn stdhash_u64(chunks: &[&[u8]]) -> u64 {
    let digest = stdhash(chunks);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}

/// The TRIED bucket a peer's entry belongs to. Depends only on the
/// peer's own address and group, never on who told us about it — an
/// endpoint occupies exactly one TRIED bucket no matter how it was
/// learned.
pub fn tried_bucket(key: &SecretKey, peer: &Endpoint) -> u16 {
    let inner = stdhash_u64(&[&key.0, &peer.key()]) % u64::from(TRIED_BUCKETS_PER_GROUP);
    let outer = stdhash_u64(&[&key.0, &peer.group(), &[inner as u8]]) % u64::from(TRIED_BUCKET_COUNT);
    outer as u16
}

/// The NEW bucket a peer's entry belongs to, given the source that
/// announced it. A peer can occupy up to [`crate::tables::NEW_BUCKETS_PER_ADDRESS`]
/// different NEW slots, one per distinct source group that ever
/// announced it.
pub fn new_bucket(key: &SecretKey, peer: &Endpoint, src: &Endpoint) -> u16 {
    let inner = stdhash_u64(&[&key.0, &peer.group(), &src.group()])
        % u64::from(NEW_BUCKETS_PER_SOURCE_GROUP);
    let outer = stdhash_u64(&[&key.0, &src.group(), &[inner as u8]]) % u64::from(NEW_BUCKET_COUNT);
    outer as u16
}

/// The slot position within a bucket (shared math for NEW and TRIED;
/// `is_new` only selects the domain-separation tag).
pub fn bucket_pos(key: &SecretKey, peer: &Endpoint, is_new: bool, bucket: u16) -> u8 {
    let tag: &[u8] = if is_new { b"N" } else { b"K" };
    let bucket = u32::from(bucket);
    let bucket_be = [
        ((bucket >> 16) & 0xff) as u8,
        ((bucket >> 8) & 0xff) as u8,
        (bucket & 0xff) as u8,
    ];
    let pos = stdhash_u64(&[&key.0, tag, &bucket_be, &peer.key()]) % u64::from(BUCKET_SIZE);
    pos as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ep(a: u8, b: u8, c: u8, d: u8, port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port, 0)
    }

    #[test]
    fn deterministic_given_same_key() {
        let key = SecretKey([7u8; 32]);
        let peer = ep(1, 2, 3, 4, 9000);
        let src = ep(5, 6, 7, 8, 9000);
        assert_eq!(tried_bucket(&key, &peer), tried_bucket(&key, &peer));
        assert_eq!(
            new_bucket(&key, &peer, &src),
            new_bucket(&key, &peer, &src)
        );
        let b = tried_bucket(&key, &peer);
        assert_eq!(
            bucket_pos(&key, &peer, false, b),
            bucket_pos(&key, &peer, false, b)
        );
    }

    #[test]
    fn different_keys_usually_disagree() {
        let peer = ep(1, 2, 3, 4, 9000);
        let a = tried_bucket(&SecretKey([1u8; 32]), &peer);
        let b = tried_bucket(&SecretKey([2u8; 32]), &peer);
        assert_ne!(a, b);
    }

    #[test]
    fn within_bounds() {
        let key = SecretKey([3u8; 32]);
        let peer = ep(9, 9, 9, 9, 1);
        let src = ep(8, 8, 8, 8, 1);
        assert!(tried_bucket(&key, &peer) < TRIED_BUCKET_COUNT);
        assert!(new_bucket(&key, &peer, &src) < NEW_BUCKET_COUNT);
        assert!(u32::from(bucket_pos(&key, &peer, true, 0)) < u32::from(BUCKET_SIZE));
    }
}
