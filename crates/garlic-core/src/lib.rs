//! Garlic Core Library
//!
//! Wire types, codecs, and cryptographic primitives for layered ("garlic")
//! messages exchanged between routers of an anonymity network.
//!
//! # Modules
//!
//! - [`types`]: Identifiers, session keys/tags, leases
//! - [`i2np`]: Inner messages carried by cloves
//! - [`garlic`]: Cleartext garlic codec (cloves + trailer)
//! - [`aes_block`]: AES-encrypted inner block codec
//! - [`crypto`]: ElGamal-2048, AES-256-CBC, SHA-256
//! - [`error`]: Error types

pub mod aes_block;
pub mod crypto;
pub mod error;
pub mod garlic;
pub mod i2np;
pub mod types;
mod wire;

#[cfg(test)]
mod test_vectors;

pub use aes_block::AesBlock;
pub use crypto::{ElGamalKeyPair, ElGamalPrivateKey, ElGamalPublicKey};
pub use error::{Error, Result};
pub use garlic::{Clove, DeliveryInstruction, DeliveryTarget, Garlic};
pub use i2np::{I2npMessage, I2npPayload};
pub use types::*;
