//! AES-encrypted inner block of a garlic message
//!
//! Cleartext layout, encrypted as a whole with AES-256-CBC:
//!
//! ```text
//! tag count(2) | tags(32 each) | payload size(4) | SHA-256(payload)(32)
//! | flag(1) | new session key(32, if flag == 1) | payload | random pad to 16
//! ```
//!
//! There is no MAC over the block; integrity rests on the embedded digest,
//! which [`AesBlock::decode`] always checks.

use crate::crypto::{aes256_cbc_decrypt, aes256_cbc_encrypt, derive_iv, sha256, AES_BLOCK_LEN};
use crate::error::{Error, Result};
use crate::types::{Bytes32, SessionKey, SessionTag, SESSION_TAG_LEN};
use crate::wire::{ensure, read_array, read_u16, read_u32, read_u8};
use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;

const FLAG_NEW_KEY: u8 = 0x01;

/// Fixed part of the block: tag count + size + digest + flag
pub const AES_BLOCK_FIXED_LEN: usize = 2 + 4 + 32 + 1;

/// Decrypted (or to-be-encrypted) AES block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AesBlock {
    /// New session tags delivered to the receiver
    pub tags: Vec<SessionTag>,
    /// Replacement session key, if the sender rotates keys
    pub new_session_key: Option<SessionKey>,
    /// Cleartext garlic
    pub payload: Bytes,
}

impl AesBlock {
    pub fn new(tags: Vec<SessionTag>, new_session_key: Option<SessionKey>, payload: Bytes) -> Self {
        Self {
            tags,
            new_session_key,
            payload,
        }
    }

    fn unpadded_len(&self) -> usize {
        AES_BLOCK_FIXED_LEN
            + self.tags.len() * SESSION_TAG_LEN
            + self.new_session_key.as_ref().map_or(0, |_| 32)
            + self.payload.len()
    }

    /// Serialize and pad to the cipher block size.
    pub fn encode(&self) -> Result<BytesMut> {
        if self.tags.len() > u16::MAX as usize {
            return Err(Error::TooLarge {
                what: "tag count",
                len: self.tags.len(),
            });
        }
        if self.payload.len() > u32::MAX as usize {
            return Err(Error::TooLarge {
                what: "aes block payload",
                len: self.payload.len(),
            });
        }

        let unpadded = self.unpadded_len();
        let pad = (AES_BLOCK_LEN - unpadded % AES_BLOCK_LEN) % AES_BLOCK_LEN;
        let mut buf = BytesMut::with_capacity(unpadded + pad);

        buf.put_u16(self.tags.len() as u16);
        for tag in &self.tags {
            buf.put_slice(tag.as_bytes());
        }
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&sha256(&self.payload));
        match &self.new_session_key {
            Some(key) => {
                buf.put_u8(FLAG_NEW_KEY);
                buf.put_slice(key.as_bytes());
            }
            None => buf.put_u8(0),
        }
        buf.put_slice(&self.payload);

        let mut padding = [0u8; AES_BLOCK_LEN];
        rand::thread_rng().fill_bytes(&mut padding[..pad]);
        buf.put_slice(&padding[..pad]);

        Ok(buf)
    }

    /// Parse a decrypted block and verify the payload digest.
    pub fn decode(plain: &Bytes) -> Result<Self> {
        let mut cur = &plain[..];

        let tag_count = read_u16(&mut cur, "tag count")? as usize;
        ensure(cur, tag_count * SESSION_TAG_LEN, "session tags")?;
        let mut tags = Vec::with_capacity(tag_count);
        for _ in 0..tag_count {
            tags.push(SessionTag(read_array(&mut cur, "session tag")?));
        }

        let payload_len = read_u32(&mut cur, "payload size")? as usize;
        let digest: Bytes32 = read_array(&mut cur, "payload digest")?;
        let flag = read_u8(&mut cur, "aes block flag")?;
        let new_session_key = if flag & FLAG_NEW_KEY != 0 {
            Some(SessionKey(read_array(&mut cur, "new session key")?))
        } else {
            None
        };

        ensure(cur, payload_len, "aes block payload")?;
        let start = plain.len() - cur.len();
        let payload = plain.slice(start..start + payload_len);

        let computed = sha256(&payload);
        if computed != digest {
            return Err(Error::DigestMismatch {
                computed: hex::encode(computed),
                transmitted: hex::encode(digest),
            });
        }

        Ok(Self {
            tags,
            new_session_key,
            payload,
        })
    }

    /// Encode and encrypt under `key` with `IV = SHA-256(seed)[0..16]`.
    pub fn encrypt(&self, key: &SessionKey, seed: &Bytes32) -> Result<BytesMut> {
        let mut buf = self.encode()?;
        aes256_cbc_encrypt(key, &derive_iv(seed), &mut buf)?;
        Ok(buf)
    }

    /// Decrypt `ciphertext` and decode it, verifying the digest.
    pub fn decrypt(key: &SessionKey, seed: &Bytes32, ciphertext: &[u8]) -> Result<Self> {
        let mut buf = BytesMut::from(ciphertext);
        aes256_cbc_decrypt(key, &derive_iv(seed), &mut buf)?;
        Self::decode(&buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_is_padded_to_16() {
        for len in 0..40 {
            let block = AesBlock::new(vec![], None, Bytes::from(vec![7u8; len]));
            let encoded = block.encode().unwrap();
            assert_eq!(encoded.len() % AES_BLOCK_LEN, 0, "payload len {len}");
            assert!(encoded.len() >= block.unpadded_len());
        }
    }

    #[test]
    fn test_encrypt_decrypt_with_tags_and_key() {
        let key = SessionKey([0x33; 32]);
        let seed = [0x44; 32];
        let block = AesBlock::new(
            SessionTag::batch(3),
            Some(SessionKey([0x55; 32])),
            Bytes::from_static(b"cleartext garlic"),
        );

        let ciphertext = block.encrypt(&key, &seed).unwrap();
        let decrypted = AesBlock::decrypt(&key, &seed, &ciphertext).unwrap();
        assert_eq!(decrypted, block);
    }

    #[test]
    fn test_flipped_payload_byte_rejected() {
        let block = AesBlock::new(vec![], None, Bytes::from_static(b"integrity matters"));
        let mut plain = block.encode().unwrap();
        plain[AES_BLOCK_FIXED_LEN + 3] ^= 0x01;

        assert!(matches!(
            AesBlock::decode(&plain.freeze()),
            Err(Error::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_key_never_yields_payload() {
        let block = AesBlock::new(SessionTag::batch(1), None, Bytes::from(vec![1u8; 64]));
        let ciphertext = block.encrypt(&SessionKey([1u8; 32]), &[2u8; 32]).unwrap();

        assert!(AesBlock::decrypt(&SessionKey([9u8; 32]), &[2u8; 32], &ciphertext).is_err());
    }

    #[test]
    fn test_unaligned_ciphertext_rejected() {
        assert!(matches!(
            AesBlock::decrypt(&SessionKey([1u8; 32]), &[2u8; 32], &[0u8; 20]),
            Err(Error::Unaligned(20))
        ));
    }
}
