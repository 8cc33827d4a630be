//! Error types for garlic-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Codec and crypto errors
#[derive(Debug, Error)]
pub enum Error {
    /// Buffer ended before a field could be read
    #[error("truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    /// I2NP header checksum does not match the payload
    #[error("i2np checksum mismatch: header {header:#04x} != computed {computed:#04x}")]
    ChecksumMismatch { header: u8, computed: u8 },

    /// AES block payload digest does not match the embedded SHA-256
    #[error("payload digest mismatch: computed {computed} != transmitted {transmitted}")]
    DigestMismatch { computed: String, transmitted: String },

    /// Value too large for its length field
    #[error("{what} too large: {len} bytes")]
    TooLarge { what: &'static str, len: usize },

    /// AES block not aligned to the cipher block size
    #[error("ciphertext length {0} is not a multiple of 16")]
    Unaligned(usize),

    /// ElGamal block failed to decrypt or verify
    #[error("elgamal decryption failed: {0}")]
    ElGamal(&'static str),

    /// Key or IV with the wrong length handed to the cipher
    #[error("invalid key length")]
    InvalidKeyLength,
}

impl Error {
    pub(crate) fn truncated(what: &'static str, needed: usize, available: usize) -> Self {
        Self::Truncated {
            what,
            needed,
            available,
        }
    }
}
