//! LanBeam transfer engine.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod candidate;
pub mod chunk;
pub mod cipher;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod progress;
pub mod protocol;
pub mod reassembly;
pub mod relay;
pub mod session;

pub use candidate::CandidateKind;
pub use chunk::ChunkPlan;
pub use cipher::{derive_iv, BaseIv, ChunkCipher, CryptoError, SessionKey};
pub use directory::{
    generate_peer_id, DeviceClass, DirectoryError, PeerRecord, PresenceDirectory, Registration,
};
pub use engine::{Action, Delivery, Event, OutboundPlan, TransferEngine};
pub use error::{ErrorKind, TransferError};
pub use progress::{format_speed, Progress, ThroughputMeter};
pub use protocol::{Control, Message, ProtocolError, Signal};
pub use relay::{ChunkFrame, DeliveredEnvelope, ForwardEnvelope, FrameError};
pub use session::{Direction, Phase, SessionError, TransferKey};
