//! I2NP inner messages carried inside garlic cloves
//!
//! Every message starts with the standard 16-byte header:
//!
//! ```text
//! type(1) | message id(4) | expiration ms(8) | payload size(2) | checksum(1)
//! ```
//!
//! The checksum is the first byte of SHA-256 over the payload.

use crate::crypto::sha256;
use crate::error::{Error, Result};
use crate::types::{expiration_in, now_millis};
use crate::wire::{ensure, read_u16, read_u32, read_u64, read_u8};
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use std::time::Duration;

/// Size of the I2NP header
pub const I2NP_HEADER_LEN: usize = 16;

/// Default lifetime of a freshly built message
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(60);

/// I2NP message type ids used by this layer
pub mod message_type {
    pub const DELIVERY_STATUS: u8 = 10;
    pub const GARLIC: u8 = 11;
    pub const DATA: u8 = 20;
}

/// Decoded payload of an I2NP message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum I2npPayload {
    /// Acknowledgment: id of the acknowledged message plus a timestamp
    DeliveryStatus { status_id: u32, timestamp: u64 },
    /// Encrypted garlic data (without the length prefix)
    Garlic(Bytes),
    /// Opaque application data (without the length prefix)
    Data(Bytes),
    /// Any other type, preserved verbatim
    Other { type_id: u8, payload: Bytes },
}

impl I2npPayload {
    pub fn type_id(&self) -> u8 {
        match self {
            Self::DeliveryStatus { .. } => message_type::DELIVERY_STATUS,
            Self::Garlic(_) => message_type::GARLIC,
            Self::Data(_) => message_type::DATA,
            Self::Other { type_id, .. } => *type_id,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::DeliveryStatus { .. } => 12,
            Self::Garlic(data) | Self::Data(data) => 4 + data.len(),
            Self::Other { payload, .. } => payload.len(),
        }
    }

    fn write(&self, dst: &mut BytesMut) {
        match self {
            Self::DeliveryStatus {
                status_id,
                timestamp,
            } => {
                dst.put_u32(*status_id);
                dst.put_u64(*timestamp);
            }
            Self::Garlic(data) | Self::Data(data) => {
                dst.put_u32(data.len() as u32);
                dst.put_slice(data);
            }
            Self::Other { payload, .. } => dst.put_slice(payload),
        }
    }

    fn parse(type_id: u8, payload: Bytes) -> Result<Self> {
        match type_id {
            message_type::DELIVERY_STATUS => {
                let mut cur = &payload[..];
                let status_id = read_u32(&mut cur, "delivery status id")?;
                let timestamp = read_u64(&mut cur, "delivery status timestamp")?;
                Ok(Self::DeliveryStatus {
                    status_id,
                    timestamp,
                })
            }
            message_type::GARLIC | message_type::DATA => {
                let mut cur = &payload[..];
                let len = read_u32(&mut cur, "length prefix")? as usize;
                ensure(cur, len, "length-prefixed body")?;
                let body = payload.slice(4..4 + len);
                Ok(if type_id == message_type::GARLIC {
                    Self::Garlic(body)
                } else {
                    Self::Data(body)
                })
            }
            type_id => Ok(Self::Other { type_id, payload }),
        }
    }
}

/// An I2NP message with its header fields
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct I2npMessage {
    /// Message id (random unless the sender needs a specific one)
    pub message_id: u32,
    /// Expiration, ms since the epoch
    pub expiration: u64,
    /// Typed payload
    pub payload: I2npPayload,
}

impl I2npMessage {
    /// Build a message with a random id and the default expiration
    pub fn new(payload: I2npPayload) -> Self {
        Self {
            message_id: rand::thread_rng().gen(),
            expiration: expiration_in(DEFAULT_MESSAGE_TTL),
            payload,
        }
    }

    /// Delivery status acknowledging `status_id`
    pub fn delivery_status(status_id: u32) -> Self {
        Self::new(I2npPayload::DeliveryStatus {
            status_id,
            timestamp: now_millis(),
        })
    }

    /// Application data message
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self::new(I2npPayload::Data(payload.into()))
    }

    /// Garlic message wrapping already encrypted data
    pub fn garlic(encrypted: impl Into<Bytes>) -> Self {
        Self::new(I2npPayload::Garlic(encrypted.into()))
    }

    /// Total encoded size, header included
    pub fn encoded_len(&self) -> usize {
        I2NP_HEADER_LEN + self.payload.encoded_len()
    }

    /// Append the encoded message to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let payload_len = self.payload.encoded_len();
        if payload_len > u16::MAX as usize {
            return Err(Error::TooLarge {
                what: "i2np payload",
                len: payload_len,
            });
        }

        let mut payload = BytesMut::with_capacity(payload_len);
        self.payload.write(&mut payload);

        dst.reserve(I2NP_HEADER_LEN + payload_len);
        dst.put_u8(self.payload.type_id());
        dst.put_u32(self.message_id);
        dst.put_u64(self.expiration);
        dst.put_u16(payload_len as u16);
        dst.put_u8(sha256(&payload)[0]);
        dst.put_slice(&payload);
        Ok(())
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one message from the front of `buf`.
    ///
    /// Returns the message and the number of bytes consumed; anything after
    /// that belongs to the caller.
    pub fn decode(buf: &Bytes) -> Result<(Self, usize)> {
        let mut cur = &buf[..];
        let type_id = read_u8(&mut cur, "i2np type")?;
        let message_id = read_u32(&mut cur, "i2np message id")?;
        let expiration = read_u64(&mut cur, "i2np expiration")?;
        let size = read_u16(&mut cur, "i2np size")? as usize;
        let checksum = read_u8(&mut cur, "i2np checksum")?;
        ensure(cur, size, "i2np payload")?;

        let payload = buf.slice(I2NP_HEADER_LEN..I2NP_HEADER_LEN + size);
        let computed = sha256(&payload)[0];
        if computed != checksum {
            return Err(Error::ChecksumMismatch {
                header: checksum,
                computed,
            });
        }

        let message = Self {
            message_id,
            expiration,
            payload: I2npPayload::parse(type_id, payload)?,
        };
        Ok((message, I2NP_HEADER_LEN + size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_message_roundtrip() {
        let msg = I2npMessage::data(&b"hello garlic"[..]);
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(bytes.len(), msg.encoded_len());

        let (decoded, used) = I2npMessage::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_delivery_status_layout() {
        let msg = I2npMessage::delivery_status(0xdead_beef);
        let bytes = msg.to_bytes().unwrap();

        assert_eq!(bytes[0], message_type::DELIVERY_STATUS);
        assert_eq!(&bytes[13..15], &12u16.to_be_bytes());
        assert_eq!(&bytes[16..20], &0xdead_beefu32.to_be_bytes());
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let msg = I2npMessage::data(vec![1u8, 2, 3]);
        let mut buf = BytesMut::new();
        msg.encode(&mut buf).unwrap();
        buf.put_slice(&[0xAA; 9]);

        let (decoded, used) = I2npMessage::decode(&buf.freeze()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(used, msg.encoded_len());
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let msg = I2npMessage::data(vec![9u8; 40]);
        let mut bytes = msg.to_bytes().unwrap().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        assert!(matches!(
            I2npMessage::decode(&Bytes::from(bytes)),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_type_preserved() {
        let msg = I2npMessage::new(I2npPayload::Other {
            type_id: 1,
            payload: Bytes::from_static(b"database store"),
        });
        let bytes = msg.to_bytes().unwrap();
        let (decoded, _) = I2npMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }
}
