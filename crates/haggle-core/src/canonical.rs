//! Canonical byte encodings used for content addressing.
//!
//! Two hash families are in play, deliberately: SHA-1 for the data-object id
//! (spec §3 pins this "for backward compatibility" with the original wire
//! format) and BLAKE3 for everything else that needs a stable digest but
//! never has to match another Haggle implementation byte-for-byte (Bloom
//! filter hash material, certificate store keys).

use sha1::{Digest, Sha1};

use crate::attribute::AttributeSet;

/// A 20-byte SHA-1 digest, used as `DataObject::id`.
pub type Sha1Id = [u8; 20];

/// Hash an attribute set's canonical byte form with SHA-1. Two attribute
/// sets with the same `(name, value)` pairs, regardless of insertion order
/// or weight, hash identically.
pub fn hash_attributes_sha1(attrs: &AttributeSet) -> Sha1Id {
    hash_bytes_sha1(&attrs.canonical_bytes())
}

/// Hash arbitrary bytes with SHA-1. Used wherever a stable `Sha1Id` needs to
/// be derived from something other than an attribute set, such as a node's
/// public key material.
pub fn hash_bytes_sha1(data: &[u8]) -> Sha1Id {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// A BLAKE3 digest used for internal, non-wire-critical hashing.
pub type Blake3Id = [u8; 32];

/// Domain-separated BLAKE3 hash, keyed by a short constant so digests from
/// different purposes never collide even over identical input bytes.
pub fn blake3_domain(domain: &str, data: &[u8]) -> Blake3Id {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain.as_bytes());
    hasher.update(b"\0");
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Domain tag for interface identity hashing (`Interface::id`).
pub const DOMAIN_INTERFACE: &str = "haggle.interface.v1";
/// Domain tag for certificate store lookup keys.
pub const DOMAIN_CERTIFICATE: &str = "haggle.certificate.v1";
/// Domain tag for Bloom filter salt derivation.
pub const DOMAIN_BLOOM_SALT: &str = "haggle.bloomfilter.salt.v1";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;

    #[test]
    fn sha1_hash_is_order_independent() {
        let mut a = AttributeSet::new();
        a.insert(Attribute::new("b", "2"));
        a.insert(Attribute::new("a", "1"));
        let mut b = AttributeSet::new();
        b.insert(Attribute::new("a", "1"));
        b.insert(Attribute::new("b", "2"));
        assert_eq!(hash_attributes_sha1(&a), hash_attributes_sha1(&b));
    }

    #[test]
    fn domain_separation_avoids_collision() {
        let a = blake3_domain(DOMAIN_INTERFACE, b"x");
        let b = blake3_domain(DOMAIN_CERTIFICATE, b"x");
        assert_ne!(a, b);
    }
}
