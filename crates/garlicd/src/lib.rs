//! garlicd - Garlic session daemon
//!
//! This daemon provides:
//! - Local identities with persisted ElGamal keys
//! - Session registries driving encryption, delivery tracking and resends
//! - Delivery-status fan-in from tunnel and provider sources
//! - Inbound clove dispatch (local delivery, nested garlic, forwarding)
//! - An in-process loopback tunnel network

pub mod config;
pub mod identity;
pub mod keys;
pub mod loopback;

pub use config::Config;
pub use identity::{AppMessage, CloveForwarder, Collaborators, IdentityStats, LocalIdentity};
pub use keys::NodeKeys;
pub use loopback::{Delivery, LoopbackNetwork, LoopbackPort};
