//! Garlic session layer
//!
//! This crate provides:
//! - Time-windowed session tag pools
//! - Outbound sessions choosing between ElGamal bootstrap and tag reuse
//! - Delivery tracking with bounded resends
//! - A per-identity registry of peer sessions
//! - Inbound decryption and tag harvesting
//!
//! Everything here is synchronous and lock-based; callers drive the periodic
//! maintenance tick and feed delivery-status ids in.

pub mod config;
pub mod error;
pub mod inbound;
pub mod outbound;
pub mod registry;
pub mod tag_pool;
pub mod tunnel;
pub mod window;

pub use config::{ConfigError, SessionConfig};
pub use error::{SessionError, TunnelError};
pub use inbound::{InboundSessionStore, InboundStats};
pub use outbound::{GarlicCreationResult, OutboundSessionStore, TagAck};
pub use registry::{PeerSession, SessionEvent, SessionRegistry, SessionStats};
pub use tag_pool::TagPool;
pub use tunnel::{KeyDirectory, ReplyEndpoint, ReplyTunnelSelector, TunnelSend};
pub use window::{DeliveryStatusOutcome, DeliveryTrackingWindow, OutstandingSend, RunReport};
