//! Cleartext garlic structure: an ordered list of cloves plus a trailer
//!
//! Wire format:
//!
//! ```text
//! count(1)
//! count x { delivery instructions | I2NP message | clove id(4) | expiration(8) | certificate(3) }
//! certificate(3) | message id(4) | expiration(8)
//! ```
//!
//! The per-clove null certificate follows the I2P garlic clove format.

use crate::error::{Error, Result};
use crate::i2np::I2npMessage;
use crate::types::{expiration_in, IdentHash, SessionKey, TunnelId};
use crate::wire::{ensure, read_array, read_u16, read_u32, read_u64, read_u8};
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use std::time::Duration;

/// Size of the null certificate
pub const NULL_CERTIFICATE_LEN: usize = 3;

/// Default lifetime of a clove and of the garlic trailer
pub const DEFAULT_CLOVE_TTL: Duration = Duration::from_secs(60);

/// Size of the garlic trailer (certificate + message id + expiration)
pub const GARLIC_TRAILER_LEN: usize = NULL_CERTIFICATE_LEN + 4 + 8;

const FLAG_ENCRYPTED: u8 = 0x80;
const FLAG_DELAY: u8 = 0x10;
const DELIVERY_TYPE_SHIFT: u8 = 5;
const DELIVERY_TYPE_MASK: u8 = 0x03;

// =============================================================================
// DELIVERY INSTRUCTIONS
// =============================================================================

/// Where a clove is to be delivered
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryTarget {
    /// Handled by the router that decrypts the garlic
    Local,
    /// A destination known to the decrypting router
    Destination(IdentHash),
    /// Another router
    Router(IdentHash),
    /// A tunnel gateway
    Tunnel { gateway: IdentHash, tunnel_id: TunnelId },
}

impl DeliveryTarget {
    fn type_bits(&self) -> u8 {
        match self {
            Self::Local => 0,
            Self::Destination(_) => 1,
            Self::Router(_) => 2,
            Self::Tunnel { .. } => 3,
        }
    }
}

/// Clove delivery instructions.
///
/// The inline session key and delay are not produced by this layer but are
/// carried through unchanged when present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryInstruction {
    pub target: DeliveryTarget,
    pub session_key: Option<SessionKey>,
    pub delay: Option<u32>,
}

impl DeliveryInstruction {
    pub fn new(target: DeliveryTarget) -> Self {
        Self {
            target,
            session_key: None,
            delay: None,
        }
    }

    pub fn local() -> Self {
        Self::new(DeliveryTarget::Local)
    }

    pub fn destination(hash: IdentHash) -> Self {
        Self::new(DeliveryTarget::Destination(hash))
    }

    pub fn router(hash: IdentHash) -> Self {
        Self::new(DeliveryTarget::Router(hash))
    }

    pub fn tunnel(gateway: IdentHash, tunnel_id: TunnelId) -> Self {
        Self::new(DeliveryTarget::Tunnel { gateway, tunnel_id })
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = 1;
        if self.session_key.is_some() {
            len += 32;
        }
        len += match self.target {
            DeliveryTarget::Local => 0,
            DeliveryTarget::Destination(_) | DeliveryTarget::Router(_) => 32,
            DeliveryTarget::Tunnel { .. } => 36,
        };
        if self.delay.is_some() {
            len += 4;
        }
        len
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let mut flag = self.target.type_bits() << DELIVERY_TYPE_SHIFT;
        if self.session_key.is_some() {
            flag |= FLAG_ENCRYPTED;
        }
        if self.delay.is_some() {
            flag |= FLAG_DELAY;
        }
        dst.put_u8(flag);

        if let Some(key) = &self.session_key {
            dst.put_slice(key.as_bytes());
        }
        match &self.target {
            DeliveryTarget::Local => {}
            DeliveryTarget::Destination(hash) | DeliveryTarget::Router(hash) => {
                dst.put_slice(hash.as_bytes());
            }
            DeliveryTarget::Tunnel { gateway, tunnel_id } => {
                dst.put_slice(gateway.as_bytes());
                dst.put_u32(tunnel_id.0);
            }
        }
        if let Some(delay) = self.delay {
            dst.put_u32(delay);
        }
    }

    /// Parse instructions from the front of `cur`, advancing it.
    pub fn decode(cur: &mut &[u8]) -> Result<Self> {
        let flag = read_u8(cur, "delivery flag")?;

        let session_key = if flag & FLAG_ENCRYPTED != 0 {
            Some(SessionKey(read_array(cur, "delivery session key")?))
        } else {
            None
        };

        let target = match (flag >> DELIVERY_TYPE_SHIFT) & DELIVERY_TYPE_MASK {
            0 => DeliveryTarget::Local,
            1 => DeliveryTarget::Destination(IdentHash(read_array(cur, "delivery hash")?)),
            2 => DeliveryTarget::Router(IdentHash(read_array(cur, "delivery hash")?)),
            _ => {
                let gateway = IdentHash(read_array(cur, "delivery hash")?);
                let tunnel_id = TunnelId(read_u32(cur, "delivery tunnel id")?);
                DeliveryTarget::Tunnel { gateway, tunnel_id }
            }
        };

        let delay = if flag & FLAG_DELAY != 0 {
            Some(read_u32(cur, "delivery delay")?)
        } else {
            None
        };

        Ok(Self {
            target,
            session_key,
            delay,
        })
    }
}

// =============================================================================
// CLOVES
// =============================================================================

/// One independently addressed sub-message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Clove {
    pub instruction: DeliveryInstruction,
    pub message: I2npMessage,
    pub clove_id: u32,
    /// Expiration, ms since the epoch
    pub expiration: u64,
}

impl Clove {
    /// Clove with a random id and the default expiration
    pub fn new(instruction: DeliveryInstruction, message: I2npMessage) -> Self {
        Self {
            instruction,
            message,
            clove_id: rand::thread_rng().gen(),
            expiration: expiration_in(DEFAULT_CLOVE_TTL),
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.instruction.encoded_len() + self.message.encoded_len() + 4 + 8 + NULL_CERTIFICATE_LEN
    }

    fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        self.instruction.encode(dst);
        self.message.encode(dst)?;
        dst.put_u32(self.clove_id);
        dst.put_u64(self.expiration);
        put_null_certificate(dst);
        Ok(())
    }

    fn decode(buf: &Bytes, offset: &mut usize) -> Result<Self> {
        let mut cur = &buf[*offset..];
        let instruction = DeliveryInstruction::decode(&mut cur)?;
        *offset = buf.len() - cur.len();

        let (message, used) = I2npMessage::decode(&buf.slice(*offset..))?;
        *offset += used;

        let mut cur = &buf[*offset..];
        let clove_id = read_u32(&mut cur, "clove id")?;
        let expiration = read_u64(&mut cur, "clove expiration")?;
        skip_certificate(&mut cur)?;
        *offset = buf.len() - cur.len();

        Ok(Self {
            instruction,
            message,
            clove_id,
            expiration,
        })
    }
}

fn put_null_certificate(dst: &mut BytesMut) {
    dst.put_slice(&[0u8; NULL_CERTIFICATE_LEN]);
}

/// Certificates other than null are skipped over, not interpreted.
fn skip_certificate(cur: &mut &[u8]) -> Result<()> {
    let _cert_type = read_u8(cur, "certificate type")?;
    let len = read_u16(cur, "certificate length")? as usize;
    ensure(*cur, len, "certificate body")?;
    *cur = &cur[len..];
    Ok(())
}

// =============================================================================
// GARLIC
// =============================================================================

/// Cleartext garlic: ordered cloves plus the trailer fields
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Garlic {
    pub cloves: Vec<Clove>,
    pub message_id: u32,
    /// Expiration, ms since the epoch
    pub expiration: u64,
}

impl Garlic {
    /// Garlic with a random message id
    pub fn new(cloves: Vec<Clove>, expiration: u64) -> Self {
        Self {
            cloves,
            message_id: rand::thread_rng().gen(),
            expiration,
        }
    }

    pub fn encoded_len(&self) -> usize {
        1 + self.cloves.iter().map(Clove::encoded_len).sum::<usize>() + GARLIC_TRAILER_LEN
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        if self.cloves.len() > u8::MAX as usize {
            return Err(Error::TooLarge {
                what: "clove count",
                len: self.cloves.len(),
            });
        }

        dst.reserve(self.encoded_len());
        dst.put_u8(self.cloves.len() as u8);
        for clove in &self.cloves {
            clove.encode(dst)?;
        }
        put_null_certificate(dst);
        dst.put_u32(self.message_id);
        dst.put_u64(self.expiration);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Parse a garlic from the front of `buf`.
    ///
    /// `buf` may extend past the logical end of the garlic; the extra bytes
    /// belong to the enclosing block and are left alone. Returns the number of
    /// bytes consumed.
    pub fn decode(buf: &Bytes) -> Result<(Self, usize)> {
        let mut cur = &buf[..];
        let count = read_u8(&mut cur, "clove count")? as usize;
        let mut offset = 1;

        let mut cloves = Vec::with_capacity(count);
        for _ in 0..count {
            cloves.push(Clove::decode(buf, &mut offset)?);
        }

        let mut cur = &buf[offset..];
        skip_certificate(&mut cur)?;
        let message_id = read_u32(&mut cur, "garlic message id")?;
        let expiration = read_u64(&mut cur, "garlic expiration")?;

        let garlic = Self {
            cloves,
            message_id,
            expiration,
        };
        Ok((garlic, buf.len() - cur.len()))
    }
}
