//! LanBeam peer runtime: transports, negotiation, paced sending, presence.

pub mod config;
pub mod crypto_worker;
pub mod direct;
pub mod inbox;
pub mod negotiator;
pub mod node;
pub mod presence;
pub mod relay;
pub mod sender;
pub mod transport;

pub use node::{NodeError, Payload, PeerNode, Runtime};
pub use transport::{Inbound, Transport, TransportKind};
