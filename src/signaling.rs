//! WebSocket signaling relay: rooms, membership notifications and
//! point-to-point offer/answer/ICE candidate forwarding

mod actor;
mod directory;
mod messages;
mod registry;
mod router;
mod server;
mod types;

pub use actor::RouterHandle;
pub use directory::RoomDirectory;
pub use messages::{
    CastKind, ClientEvent, FrameError, INBOUND_EVENTS, RawFields, ServerEvent, SignalKind,
};
pub use registry::ConnectionRegistry;
pub use router::SignalingRouter;
pub use server::SignalingServer;
pub use types::{ConnectionId, OutboundMessage, RoomId, SignalingError};
