//! Error types for haggle-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// haggle-core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Base64 decode error
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Attribute set or metadata parameter key collision
    #[error("duplicate parameter key: {0}")]
    DuplicateParameter(String),

    /// A Bloom filter was asked to merge with one of a different shape
    #[error("cannot merge bloom filters of different shape (m={m_self}/{k_self} vs m={m_other}/{k_other})")]
    BloomShapeMismatch {
        m_self: u32,
        k_self: u32,
        m_other: u32,
        k_other: u32,
    },

    /// Raw bloom filter bytes did not match any known wire shape
    #[error("raw bloom filter bytes ({len} bytes) do not match a valid header")]
    BloomMalformed { len: usize },

    /// Attempted to remove from a non-counting Bloom filter
    #[error("cannot remove from a non-counting bloom filter")]
    BloomNotCounting,

    /// Metadata has no content and no children where one was required
    #[error("metadata node {0:?} missing required content or child")]
    MetadataIncomplete(String),

    /// Metadata wire bytes could not be decoded
    #[error("metadata decode error: {0}")]
    MetadataDecode(String),

    /// A data object payload declared a length that overflows usize/u64
    #[error("invalid data length")]
    InvalidLength,

    /// RSA key parsing, signing, or verification failed
    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    /// A certificate failed validation against its issuer
    #[error("certificate invalid: {0}")]
    CertificateInvalid(String),
}
