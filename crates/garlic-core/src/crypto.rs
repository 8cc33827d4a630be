//! Cryptographic primitives for garlic encryption
//!
//! The wire format fixes the suite: ElGamal-2048 for the bootstrap block,
//! AES-256-CBC for the symmetric block, SHA-256 for digests and IV derivation.

use crate::error::{Error, Result};
use crate::types::{Bytes32, SessionKey};
use aes::Aes256;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use num_bigint::BigUint;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::OnceLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block size
pub const AES_BLOCK_LEN: usize = 16;
/// Size of an ElGamal ciphertext block on the wire
pub const ELGAMAL_BLOCK_LEN: usize = 514;
/// Plaintext capacity of one ElGamal block
pub const ELGAMAL_DATA_LEN: usize = 222;
/// ElGamal key size (both private exponent and public value)
pub const ELGAMAL_KEY_LEN: usize = 256;

// =============================================================================
// DIGESTS
// =============================================================================

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> Bytes32 {
    Sha256::digest(data).into()
}

/// CBC IV for a garlic AES block.
///
/// `IV = SHA-256(seed)[0..16]`, where the seed is the session tag on the
/// reuse path or the pre-IV carried in the ElGamal block on the bootstrap path.
pub fn derive_iv(seed: &Bytes32) -> [u8; AES_BLOCK_LEN] {
    let digest = sha256(seed);
    let mut iv = [0u8; AES_BLOCK_LEN];
    iv.copy_from_slice(&digest[..AES_BLOCK_LEN]);
    iv
}

// =============================================================================
// AES-256-CBC
// =============================================================================

/// Encrypt a block-aligned buffer in place.
pub fn aes256_cbc_encrypt(key: &SessionKey, iv: &[u8; AES_BLOCK_LEN], buf: &mut [u8]) -> Result<()> {
    if buf.len() % AES_BLOCK_LEN != 0 {
        return Err(Error::Unaligned(buf.len()));
    }
    let len = buf.len();
    Aes256CbcEnc::new_from_slices(key.as_bytes(), iv)
        .map_err(|_| Error::InvalidKeyLength)?
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| Error::Unaligned(len))?;
    Ok(())
}

/// Decrypt a block-aligned buffer in place.
pub fn aes256_cbc_decrypt(key: &SessionKey, iv: &[u8; AES_BLOCK_LEN], buf: &mut [u8]) -> Result<()> {
    if buf.len() % AES_BLOCK_LEN != 0 {
        return Err(Error::Unaligned(buf.len()));
    }
    let len = buf.len();
    Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
        .map_err(|_| Error::InvalidKeyLength)?
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| Error::Unaligned(len))?;
    Ok(())
}

// =============================================================================
// ELGAMAL-2048
// =============================================================================

/// RFC 3526 group 14 prime, big-endian.
const ELGAMAL_PRIME_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

fn prime() -> &'static BigUint {
    static PRIME: OnceLock<BigUint> = OnceLock::new();
    PRIME.get_or_init(|| {
        BigUint::parse_bytes(ELGAMAL_PRIME_HEX.as_bytes(), 16).unwrap_or_default()
    })
}

fn generator() -> BigUint {
    BigUint::from(2u32)
}

/// Random exponent in `[1, p - 2]`.
fn random_exponent() -> BigUint {
    let mut bytes = [0u8; ELGAMAL_KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let p_minus_2 = prime() - 2u32;
    let k = BigUint::from_bytes_be(&bytes) % &p_minus_2 + 1u32;
    bytes.zeroize();
    k
}

/// Left-pad a big integer into a fixed-width big-endian field.
fn write_fixed(value: &BigUint, out: &mut [u8]) {
    let bytes = value.to_bytes_be();
    let width = out.len();
    let offset = width.saturating_sub(bytes.len());
    out.fill(0);
    out[offset..].copy_from_slice(&bytes[bytes.len().saturating_sub(width)..]);
}

/// ElGamal public key (256 bytes, `y = g^x mod p`)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElGamalPublicKey(#[serde(with = "serde_key")] pub [u8; ELGAMAL_KEY_LEN]);

/// ElGamal private key (256-byte exponent `x`)
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct ElGamalPrivateKey(#[serde(with = "serde_key")] pub [u8; ELGAMAL_KEY_LEN]);

/// ElGamal keypair
#[derive(Clone, Serialize, Deserialize)]
pub struct ElGamalKeyPair {
    pub public: ElGamalPublicKey,
    pub private: ElGamalPrivateKey,
}

impl ElGamalKeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let x = random_exponent();
        let y = generator().modpow(&x, prime());

        let mut private = [0u8; ELGAMAL_KEY_LEN];
        write_fixed(&x, &mut private);
        let mut public = [0u8; ELGAMAL_KEY_LEN];
        write_fixed(&y, &mut public);

        Self {
            public: ElGamalPublicKey(public),
            private: ElGamalPrivateKey(private),
        }
    }
}

impl fmt::Debug for ElGamalPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ElGamalPublicKey({}..)", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for ElGamalPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ElGamalPrivateKey(..)")
    }
}

impl fmt::Debug for ElGamalKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElGamalKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl ElGamalPublicKey {
    /// Encrypt exactly [`ELGAMAL_DATA_LEN`] bytes into a 514-byte block.
    ///
    /// Plaintext is `0xFF || SHA-256(data) || data`; output is
    /// `0x00 || a(256) || 0x00 || b(256)`.
    pub fn encrypt(&self, data: &[u8; ELGAMAL_DATA_LEN]) -> [u8; ELGAMAL_BLOCK_LEN] {
        let mut plain = [0u8; 1 + 32 + ELGAMAL_DATA_LEN];
        plain[0] = 0xFF;
        plain[1..33].copy_from_slice(&sha256(data));
        plain[33..].copy_from_slice(data);

        let m = BigUint::from_bytes_be(&plain);
        plain.zeroize();

        let p = prime();
        let y = BigUint::from_bytes_be(&self.0);
        let k = random_exponent();
        let a = generator().modpow(&k, p);
        let b = (y.modpow(&k, p) * m) % p;

        let mut out = [0u8; ELGAMAL_BLOCK_LEN];
        write_fixed(&a, &mut out[1..257]);
        write_fixed(&b, &mut out[258..514]);
        out
    }
}

impl ElGamalPrivateKey {
    /// Decrypt and verify a 514-byte block.
    pub fn decrypt(&self, block: &[u8]) -> Result<[u8; ELGAMAL_DATA_LEN]> {
        if block.len() < ELGAMAL_BLOCK_LEN {
            return Err(Error::truncated("elgamal block", ELGAMAL_BLOCK_LEN, block.len()));
        }

        let p = prime();
        let a = BigUint::from_bytes_be(&block[1..257]);
        let b = BigUint::from_bytes_be(&block[258..514]);
        if a >= *p || b >= *p {
            return Err(Error::ElGamal("component out of range"));
        }

        let x = BigUint::from_bytes_be(&self.0);
        if x >= p - 1u32 {
            return Err(Error::ElGamal("private key out of range"));
        }
        // a^(p-1-x) == a^-x mod p
        let exponent = p - 1u32 - x;
        let m = (b * a.modpow(&exponent, p)) % p;

        let mut plain = [0u8; 1 + 32 + ELGAMAL_DATA_LEN];
        if m.bits() > (plain.len() * 8) as u64 {
            return Err(Error::ElGamal("plaintext out of range"));
        }
        write_fixed(&m, &mut plain);

        if plain[0] != 0xFF {
            return Err(Error::ElGamal("bad marker byte"));
        }
        if sha256(&plain[33..])[..] != plain[1..33] {
            return Err(Error::ElGamal("hash mismatch"));
        }

        let mut data = [0u8; ELGAMAL_DATA_LEN];
        data.copy_from_slice(&plain[33..]);
        plain.zeroize();
        Ok(data)
    }
}

/// serde support for 256-byte keys (serde only derives arrays up to 32)
mod serde_key {
    use super::ELGAMAL_KEY_LEN;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; ELGAMAL_KEY_LEN], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(key)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; ELGAMAL_KEY_LEN], D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(d)?;
        bytes
            .try_into()
            .map_err(|v: Vec<u8>| D::Error::invalid_length(v.len(), &"256 bytes"))
    }
}
